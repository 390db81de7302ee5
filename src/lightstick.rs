use anyhow::{Context, Result};
use log::{debug, error, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::assets::{self, AssetFetcher, AssetSlots};
use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::frame::Frame;
use crate::mode::{ModeContext, ModeEngine};
use crate::output::Output;
use crate::shadow::ShadowClient;
use crate::state::{DeviceState, SharedState};

const STATS_INTERVAL: Duration = Duration::from_secs(5);

/// Edge runtime: renders the active mode at a fixed tick and fans each frame
/// out to the strip and to TCP clients
pub struct Lightstick {
    config: Config,
    engine: ModeEngine,
    broadcaster: Broadcaster,
    output: Option<Output>,
    shadow: ShadowClient,
    frames_rendered: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    debug: bool,
}

impl Lightstick {
    /// Bring up outputs, connect to the shadow service and build the engine
    pub fn new(config: Config, debug: bool) -> Result<Self> {
        let state = SharedState::new(DeviceState::default());
        let slots = AssetSlots::default();
        let store = assets::store_from_config(&config.assets)?;
        let fetcher = AssetFetcher::new(store, slots.clone(), &config.thing_name);

        // A missing strip is not fatal; viewers still get frames
        let output = match &config.serial {
            Some(serial) => match Output::open(serial, config.num_pixels) {
                Ok(output) => Some(output),
                Err(e) => {
                    error!("{:#}", e);
                    None
                }
            },
            None => None,
        };

        let broadcaster = Broadcaster::bind(&format!("{}:{}", config.broadcast.host, config.broadcast.port))?;

        let shadow = ShadowClient::connect(&config, state.clone(), fetcher)
            .context("Shadow session could not be established")?;

        let engine = ModeEngine::new(ModeContext {
            num_pixels: config.num_pixels,
            settings: config.modes.clone(),
            assets: slots,
            sink: Arc::new(shadow.publisher()),
            state,
        });

        Ok(Lightstick {
            config,
            engine,
            broadcaster,
            output,
            shadow,
            frames_rendered: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(true)),
            debug,
        })
    }

    /// Get a clone of the running flag for signal handlers
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Run ticks until stopped or the shadow session fails
    pub fn run(&mut self) -> Result<()> {
        if self.debug {
            self.spawn_stats_thread();
        }

        let tick = self.config.tick();
        let mut telemetry: Option<String> = None;

        info!("Rendering {} pixels every {:?}", self.config.num_pixels, tick);

        while self.running.load(Ordering::Relaxed) {
            let started = Instant::now();

            if let Some(e) = self.shadow.fatal() {
                return Err(e).context("Shadow session ended");
            }

            let frame = self.engine.tick(telemetry.take().as_deref())?;
            self.frames_rendered.fetch_add(1, Ordering::Relaxed);

            telemetry = self.broadcaster.service(&frame, self.engine.wants_telemetry());

            if let Some(output) = &self.output {
                output.send_frame(frame);
            }

            // Best effort: an overrun tick simply starts the next one late
            if let Some(remaining) = tick.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }

        Ok(())
    }

    /// Tear down the mode, blank every output and leave the shadow session
    pub fn shutdown(&mut self) {
        info!("Turning off LEDs...");

        if let Err(e) = self.engine.shutdown() {
            error!("Mode teardown failed: {:#}", e);
        }

        let blank = Frame::blank(self.config.num_pixels);
        self.broadcaster.service(&blank, false);
        if let Some(mut output) = self.output.take() {
            output.send_frame(blank);
            output.stop();
        }

        self.shadow.disconnect();
        info!("Lightstick stopped");
    }

    /// Spawn statistics thread
    fn spawn_stats_thread(&self) {
        let frames_rendered = Arc::clone(&self.frames_rendered);
        let frames_written = self.broadcaster.frames_written_counter();
        let clients = self.broadcaster.client_count_gauge();
        let strip = self
            .output
            .as_ref()
            .map(|o| (o.port_name().to_string(), o.frames_sent_counter()));
        let running = Arc::clone(&self.running);

        thread::spawn(move || {
            let mut last_rendered = 0u64;
            let mut last_written = 0u64;
            let mut last_strip = 0u64;
            let seconds = STATS_INTERVAL.as_secs_f64();

            while running.load(Ordering::Relaxed) {
                thread::sleep(STATS_INTERVAL);

                let rendered = frames_rendered.load(Ordering::Relaxed);
                let written = frames_written.load(Ordering::Relaxed);
                let mut line = format!(
                    "[Stats] Rendered: {:.1} fps, clients: {}, to clients: {:.1} frames/s",
                    (rendered - last_rendered) as f64 / seconds,
                    clients.load(Ordering::Relaxed),
                    (written - last_written) as f64 / seconds,
                );

                if let Some((port, counter)) = &strip {
                    let sent = counter.load(Ordering::Relaxed);
                    line.push_str(&format!(", {}: {:.1} fps", port, (sent - last_strip) as f64 / seconds));
                    last_strip = sent;
                }

                debug!("{}", line);
                last_rendered = rendered;
                last_written = written;
            }
        });
    }
}
