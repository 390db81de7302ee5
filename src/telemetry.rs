use anyhow::{anyhow, Context, Result};
use log::{debug, info};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Where sensor-driven modes send their raw readings
pub trait TelemetrySink: Send + Sync {
    fn publish_reading(&self, mode: &str, reading: f64);
}

/// Background publisher owned by one sensor-driven mode.
///
/// Publishes the latest reading every `interval` until stopped. Stopping
/// closes the signal channel and joins the thread.
pub struct TelemetryTask {
    label: &'static str,
    reading: Arc<AtomicU64>,
    stop: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TelemetryTask {
    pub fn spawn(label: &'static str, interval: Duration, sink: Arc<dyn TelemetrySink>) -> Result<Self> {
        let reading = Arc::new(AtomicU64::new(0f64.to_bits()));
        let (stop, signal) = mpsc::channel::<()>();

        let worker_reading = Arc::clone(&reading);
        let handle = thread::Builder::new()
            .name(format!("telemetry-{}", label))
            .spawn(move || loop {
                match signal.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let value = f64::from_bits(worker_reading.load(Ordering::Relaxed));
                        sink.publish_reading(label, value);
                    }
                    // Explicit stop or owner dropped
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("Failed to spawn telemetry thread")?;

        debug!("Started {} telemetry every {:?}", label, interval);

        Ok(TelemetryTask {
            label,
            reading,
            stop: Some(stop),
            handle: Some(handle),
        })
    }

    pub fn set_reading(&self, value: f64) {
        self.reading.store(value.to_bits(), Ordering::Relaxed);
    }

    /// Signal the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        drop(self.stop.take());

        if let Some(handle) = self.handle.take() {
            handle
                .join()
                .map_err(|_| anyhow!("{} telemetry thread panicked", self.label))?;
            info!("Stopped {} telemetry", self.label);
        }

        Ok(())
    }

    #[allow(dead_code)]
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for TelemetryTask {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
