//! Cloud shadow synchronization over MQTT.
//!
//! Startup is a blocking, auditable sequence: connect, subscribe to each
//! response topic in turn (waiting for its acknowledgement), then request the
//! current shadow. After that a dedicated thread owns the connection and feeds
//! inbound messages to the [`ShadowSession`].

use anyhow::{Context, Result};
use log::{error, info, warn};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, Packet, Publish, QoS,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use serde_json::json;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crate::assets::AssetFetcher;
use crate::config::Config;
use crate::state::SharedState;
use crate::telemetry::TelemetrySink;

mod session;

use session::{update_request, SessionAction, SessionPhase, ShadowSession};

const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShadowError {
    #[error("{operation} request was rejected, code {code}: '{message}'")]
    Rejected {
        operation: &'static str,
        code: i64,
        message: String,
    },
    #[error("connection to shadow service lost: {0}")]
    Disconnected(String),
    #[error("subscription to {0} was refused")]
    Subscribe(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Fire-and-forget publisher for reported state and sensor readings
#[derive(Clone)]
pub struct ShadowPublisher {
    client: Client,
    update_topic: String,
    telemetry_topic: String,
    client_token: String,
    state: SharedState,
}

impl ShadowPublisher {
    /// Publish a snapshot of the device state as reported. The lock is only
    /// held while copying; failures are logged, never retried.
    pub fn publish_reported(&self) {
        let snapshot = self.state.snapshot();
        let payload = match update_request(&snapshot, &self.client_token) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Could not encode reported state: {}", e);
                return;
            }
        };

        match self
            .client
            .try_publish(self.update_topic.as_str(), QoS::AtLeastOnce, false, payload)
        {
            Ok(()) => info!("Update request published"),
            Err(e) => warn!("Failed to publish update request: {}", e),
        }
    }
}

impl TelemetrySink for ShadowPublisher {
    fn publish_reading(&self, mode: &str, reading: f64) {
        let payload = json!({ "mode": mode, "reading": reading }).to_string();
        if let Err(e) = self
            .client
            .try_publish(self.telemetry_topic.as_str(), QoS::AtLeastOnce, false, payload)
        {
            warn!("Failed to publish {} reading: {}", mode, e);
        }
    }
}

/// Live shadow session; dropping it without `disconnect` leaks the event thread
pub struct ShadowClient {
    publisher: ShadowPublisher,
    fatal: Arc<Mutex<Option<ShadowError>>>,
    closing: Arc<AtomicBool>,
    event_thread: Option<thread::JoinHandle<()>>,
}

impl ShadowClient {
    /// Connect, subscribe and request the current shadow. Blocks until each
    /// step is acknowledged; any failure here is a startup failure.
    pub fn connect(config: &Config, state: SharedState, fetcher: AssetFetcher) -> Result<Self> {
        let client_id = config.client_id();
        let mut session = ShadowSession::new(&config.thing_name, &client_id, state.clone());
        let (client, mut connection) = Client::new(mqtt_options(config)?, REQUEST_CAPACITY);

        info!(
            "Connecting to {}:{} with client ID '{}'...",
            config.mqtt.endpoint, config.mqtt.port, client_id
        );
        session.transition(SessionPhase::Connecting);

        let mut pending = Vec::new();
        await_packet(&mut connection, &mut pending, |packet| match packet {
            Packet::ConnAck(ack) if ack.code == ConnectReturnCode::Success => Some(Ok(())),
            Packet::ConnAck(ack) => Some(Err(ShadowError::Transport(format!(
                "connection refused: {:?}",
                ack.code
            )))),
            _ => None,
        })??;
        info!("Connected!");
        session.transition(SessionPhase::Connected);

        for topic in session.topics().subscriptions() {
            info!("Subscribing to {}...", topic);
            client
                .subscribe(topic.as_str(), QoS::AtLeastOnce)
                .with_context(|| format!("Failed to request subscription to {}", topic))?;

            await_packet(&mut connection, &mut pending, |packet| match packet {
                Packet::SubAck(ack) => Some(
                    if ack.return_codes.iter().any(|c| matches!(c, SubscribeReasonCode::Failure)) {
                        Err(ShadowError::Subscribe(topic.clone()))
                    } else {
                        Ok(())
                    },
                ),
                _ => None,
            })??;
        }
        session.transition(SessionPhase::Subscribed);

        info!("Requesting current shadow state...");
        client
            .publish(session.topics().get(), QoS::AtLeastOnce, false, session.get_request())
            .context("Failed to request shadow state")?;
        await_packet(&mut connection, &mut pending, |packet| {
            matches!(packet, Packet::PubAck(_)).then_some(())
        })?;

        let publisher = ShadowPublisher {
            client,
            update_topic: session.topics().update(),
            telemetry_topic: config.telemetry_topic(),
            client_token: client_id,
            state,
        };

        let fatal = Arc::new(Mutex::new(None));
        let closing = Arc::new(AtomicBool::new(false));
        let worker = EventWorker {
            session,
            publisher: publisher.clone(),
            fetcher,
            fatal: Arc::clone(&fatal),
            closing: Arc::clone(&closing),
        };

        let event_thread = thread::Builder::new()
            .name("shadow-events".to_string())
            .spawn(move || worker.run(connection, pending))
            .context("Failed to spawn shadow event thread")?;

        Ok(ShadowClient {
            publisher,
            fatal,
            closing,
            event_thread: Some(event_thread),
        })
    }

    pub fn publisher(&self) -> ShadowPublisher {
        self.publisher.clone()
    }

    /// The error that ended the session, if any
    pub fn fatal(&self) -> Option<ShadowError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Orderly disconnect; waits for the event thread to finish
    pub fn disconnect(&mut self) {
        info!("Disconnecting...");
        self.closing.store(true, Ordering::Relaxed);

        if let Err(e) = self.publisher.client.disconnect() {
            warn!("Disconnect request failed: {}", e);
        }

        if let Some(handle) = self.event_thread.take() {
            if handle.join().is_err() {
                error!("Shadow event thread panicked");
            }
        }
        info!("Disconnected.");
    }
}

/// Owns the session once startup is done and dispatches inbound messages
struct EventWorker {
    session: ShadowSession,
    publisher: ShadowPublisher,
    fetcher: AssetFetcher,
    fatal: Arc<Mutex<Option<ShadowError>>>,
    closing: Arc<AtomicBool>,
}

impl EventWorker {
    fn run(mut self, mut connection: Connection, pending: Vec<Publish>) {
        // Messages that arrived while startup was waiting on acknowledgements
        for publish in pending {
            if !self.dispatch(&publish) {
                return;
            }
        }

        for notification in connection.iter() {
            match notification {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if !self.dispatch(&publish) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    if !self.closing.load(Ordering::Relaxed) {
                        self.fail(ShadowError::Disconnected(e.to_string()));
                    }
                    break;
                }
            }
        }

        self.session.transition(SessionPhase::Disconnected);
    }

    /// Returns false once the session can no longer continue
    fn dispatch(&mut self, publish: &Publish) -> bool {
        for action in self.session.handle(&publish.topic, &publish.payload) {
            match action {
                SessionAction::PublishReported => self.publisher.publish_reported(),
                SessionAction::Fetch(kind) => self.fetcher.spawn_fetch(kind),
                SessionAction::Fatal(e) => {
                    self.fail(e);
                    return false;
                }
            }
        }
        true
    }

    fn fail(&self, e: ShadowError) {
        error!("Exiting: {}", e);
        *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(e);
    }
}

/// Drive the connection until `matcher` recognizes a packet. Publishes seen
/// on the way are kept for the event thread.
fn await_packet<T>(
    connection: &mut Connection,
    pending: &mut Vec<Publish>,
    mut matcher: impl FnMut(&Packet) -> Option<T>,
) -> Result<T, ShadowError> {
    for notification in connection.iter() {
        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => pending.push(publish),
            Ok(Event::Incoming(packet)) => {
                if let Some(value) = matcher(&packet) {
                    return Ok(value);
                }
            }
            Ok(Event::Outgoing(_)) => {}
            Err(e) => return Err(ShadowError::Transport(e.to_string())),
        }
    }

    Err(ShadowError::Disconnected("connection closed during startup".to_string()))
}

fn mqtt_options(config: &Config) -> Result<MqttOptions> {
    let mqtt = &config.mqtt;
    let mut options = MqttOptions::new(config.client_id(), mqtt.endpoint.as_str(), mqtt.port);
    options.set_keep_alive(Duration::from_secs(mqtt.keep_alive_secs.max(1)));
    options.set_clean_session(false);

    match (&mqtt.ca_file, &mqtt.cert_file, &mqtt.key_file) {
        (Some(ca), Some(cert), Some(key)) => {
            let read = |path: &String| fs::read(path).with_context(|| format!("Failed to read {}", path));
            options.set_transport(Transport::Tls(TlsConfiguration::Simple {
                ca: read(ca)?,
                alpn: None,
                client_auth: Some((read(cert)?, read(key)?)),
            }));
        }
        (None, None, None) => warn!("No certificates configured, connecting without TLS"),
        _ => anyhow::bail!("ca_file, cert_file and key_file must be given together"),
    }

    Ok(options)
}
