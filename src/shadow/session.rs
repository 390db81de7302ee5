use log::{debug, info, warn};
use serde_json::{json, Map, Value};

use super::ShadowError;
use crate::assets::AssetKind;
use crate::state::{AssetTriggers, DeviceState, SharedState};

const CODE_NOT_FOUND: i64 = 404;

/// Shadow topics for one thing
#[derive(Debug, Clone)]
pub struct ShadowTopics {
    prefix: String,
}

impl ShadowTopics {
    pub fn new(thing_name: &str) -> Self {
        ShadowTopics {
            prefix: format!("$aws/things/{}/shadow", thing_name),
        }
    }

    pub fn get(&self) -> String {
        format!("{}/get", self.prefix)
    }

    pub fn update(&self) -> String {
        format!("{}/update", self.prefix)
    }

    pub fn delta(&self) -> String {
        format!("{}/update/delta", self.prefix)
    }

    pub fn update_accepted(&self) -> String {
        format!("{}/update/accepted", self.prefix)
    }

    pub fn update_rejected(&self) -> String {
        format!("{}/update/rejected", self.prefix)
    }

    pub fn get_accepted(&self) -> String {
        format!("{}/get/accepted", self.prefix)
    }

    pub fn get_rejected(&self) -> String {
        format!("{}/get/rejected", self.prefix)
    }

    /// Response topics in the order they are subscribed at startup
    pub fn subscriptions(&self) -> [String; 5] {
        [
            self.delta(),
            self.update_accepted(),
            self.update_rejected(),
            self.get_accepted(),
            self.get_rejected(),
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Synced,
}

/// What the transport should do after a message was handled
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    PublishReported,
    Fetch(AssetKind),
    Fatal(ShadowError),
}

/// Shadow protocol logic, independent of the MQTT transport
pub struct ShadowSession {
    topics: ShadowTopics,
    phase: SessionPhase,
    state: SharedState,
    client_token: String,
}

impl ShadowSession {
    pub fn new(thing_name: &str, client_token: &str, state: SharedState) -> Self {
        ShadowSession {
            topics: ShadowTopics::new(thing_name),
            phase: SessionPhase::Disconnected,
            state,
            client_token: client_token.to_string(),
        }
    }

    pub fn topics(&self) -> &ShadowTopics {
        &self.topics
    }

    #[allow(dead_code)]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn transition(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!("Shadow session {:?} -> {:?}", self.phase, phase);
            self.phase = phase;
        }
    }

    pub fn get_request(&self) -> Vec<u8> {
        json!({ "clientToken": self.client_token }).to_string().into_bytes()
    }

    /// Dispatch one inbound message by topic
    pub fn handle(&mut self, topic: &str, payload: &[u8]) -> Vec<SessionAction> {
        let document: Value = match serde_json::from_slice(payload) {
            Ok(document) => document,
            Err(e) => {
                warn!("Dropping malformed message on {}: {}", topic, e);
                return Vec::new();
            }
        };

        if topic != self.topics.delta() && !self.is_ours(&document) {
            debug!("Ignoring response for another client on {}", topic);
            return Vec::new();
        }

        if topic == self.topics.get_accepted() {
            self.on_get_accepted(&document)
        } else if topic == self.topics.get_rejected() {
            self.on_get_rejected(&document)
        } else if topic == self.topics.delta() {
            self.on_delta(&document)
        } else if topic == self.topics.update_accepted() {
            info!(
                "Reported shadow state updated to {}",
                document.pointer("/state/reported").unwrap_or(&Value::Null)
            );
            Vec::new()
        } else if topic == self.topics.update_rejected() {
            vec![SessionAction::Fatal(rejection("update", &document))]
        } else {
            debug!("Ignoring message on {}", topic);
            Vec::new()
        }
    }

    fn is_ours(&self, document: &Value) -> bool {
        match document.get("clientToken").and_then(Value::as_str) {
            Some(token) => token == self.client_token,
            None => true,
        }
    }

    fn on_get_accepted(&mut self, document: &Value) -> Vec<SessionAction> {
        info!("Finished getting initial shadow state");
        let section = |name: &str| document.pointer(&format!("/state/{}", name)).and_then(Value::as_object);

        let mut republish = false;
        let mut triggers = AssetTriggers::default();

        match section("reported") {
            Some(reported) => {
                info!("Shadow reported state: {}", Value::Object(reported.clone()));
                let (state, reported_triggers) = DeviceState::from_reported(reported);
                self.state.replace(state);
                triggers = reported_triggers;
            }
            None => republish = true,
        }

        if let Some(delta) = section("delta") {
            info!("Shadow delta: {}", Value::Object(delta.clone()));
            let delta_triggers = self.state.merge(delta);
            triggers.image |= delta_triggers.image;
            triggers.audio |= delta_triggers.audio;
            republish = true;
        }

        self.transition(SessionPhase::Synced);

        let mut actions = fetches(triggers);
        if republish {
            info!("Shadow state has changed or does not exist yet");
            actions.push(SessionAction::PublishReported);
        }
        actions
    }

    fn on_get_rejected(&mut self, document: &Value) -> Vec<SessionAction> {
        let error = rejection("get", document);
        match error {
            ShadowError::Rejected { code: CODE_NOT_FOUND, .. } => {
                info!("Thing has no shadow document, publishing defaults");
                self.transition(SessionPhase::Synced);
                vec![SessionAction::PublishReported]
            }
            error => vec![SessionAction::Fatal(error)],
        }
    }

    fn on_delta(&mut self, document: &Value) -> Vec<SessionAction> {
        let delta = match document.get("state").and_then(Value::as_object) {
            Some(delta) if !delta.is_empty() => delta,
            _ => {
                info!("Delta did not report a change");
                return Vec::new();
            }
        };

        info!("Delta reports desired values {}", Value::Object(delta.clone()));
        let triggers = self.state.merge(delta);
        if triggers.any() {
            info!("Delta announces a new upload");
        }
        let mut actions = fetches(triggers);
        actions.push(SessionAction::PublishReported);
        actions
    }
}

fn fetches(triggers: AssetTriggers) -> Vec<SessionAction> {
    let mut actions = Vec::new();
    if triggers.image {
        actions.push(SessionAction::Fetch(AssetKind::Image));
    }
    if triggers.audio {
        actions.push(SessionAction::Fetch(AssetKind::Audio));
    }
    actions
}

fn rejection(operation: &'static str, document: &Value) -> ShadowError {
    ShadowError::Rejected {
        operation,
        code: document.get("code").and_then(Value::as_i64).unwrap_or(0),
        message: document
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
    }
}

/// Update request carrying the full state as reported
pub fn update_request(state: &DeviceState, client_token: &str) -> serde_json::Result<Vec<u8>> {
    let mut body = Map::new();
    body.insert("state".to_string(), json!({ "reported": state }));
    body.insert("clientToken".to_string(), json!(client_token));
    serde_json::to_vec(&Value::Object(body))
}
