use anyhow::{Context, Result};
use log::{error, info, trace, warn};
use serialport::SerialPort;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::SerialConfig;
use crate::frame::Frame;

/// Anything that accepts the three color planes in order
pub trait PlaneWriter: Send {
    fn write_planes(&mut self, frame: &Frame) -> std::io::Result<()>;
}

impl<W: Write + Send + ?Sized> PlaneWriter for Box<W> {
    fn write_planes(&mut self, frame: &Frame) -> std::io::Result<()> {
        self.write_all(&frame.r)?;
        self.write_all(&frame.g)?;
        self.write_all(&frame.b)?;
        self.flush()
    }
}

/// Hardware strip output with a dedicated worker thread
pub struct Output {
    port_name: String,
    sender: Option<SyncSender<Frame>>,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker_handle: Option<thread::JoinHandle<()>>,
}

impl Output {
    /// Open the serial port and start the worker
    pub fn open(config: &SerialConfig, num_pixels: usize) -> Result<Self> {
        let port = Self::open_port(config)?;
        info!(
            "Opened {} @ {} baud for {} pixels",
            config.port, config.baud_rate, num_pixels
        );
        Self::with_writer(Box::new(port), &config.port, num_pixels)
    }

    /// Start the worker over any plane writer
    pub fn with_writer<P: PlaneWriter + 'static>(writer: P, name: &str, num_pixels: usize) -> Result<Self> {
        // Capacity 1: when the strip falls behind, newer frames are skipped rather than queued
        let (sender, receiver) = mpsc::sync_channel::<Frame>(1);

        let frames_sent = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let worker_name = name.to_string();
        let worker_frames_sent = Arc::clone(&frames_sent);
        let worker_running = Arc::clone(&running);

        let worker_handle = thread::Builder::new()
            .name("serial-output".to_string())
            .spawn(move || {
                worker_thread(
                    writer,
                    receiver,
                    worker_name,
                    num_pixels,
                    worker_frames_sent,
                    worker_running,
                );
            })
            .context("Failed to spawn serial output thread")?;

        Ok(Output {
            port_name: name.to_string(),
            sender: Some(sender),
            frames_sent,
            running,
            worker_handle: Some(worker_handle),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Hand a frame to the worker (non-blocking, skip-ahead)
    pub fn send_frame(&self, frame: Frame) {
        let Some(sender) = self.sender.as_ref() else {
            return;
        };

        match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => trace!("{} busy, frame skipped", self.port_name),
            // Worker already gave up on the port
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Counter of frames written to the strip (for statistics)
    pub fn frames_sent_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.frames_sent)
    }

    /// Stop the worker and wait for it; it blanks the strip on its way out
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        drop(self.sender.take());

        if let Some(handle) = self.worker_handle.take() {
            if handle.join().is_err() {
                error!("Serial output thread for {} panicked", self.port_name);
            }
        }
    }

    fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>> {
        let mut port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()
            .context(format!("Failed to open serial port {}", config.port))?;

        // Bounded writes so a wedged strip cannot hang the worker forever
        port.set_timeout(Duration::from_millis(1000))
            .context("Failed to set serial port timeout")?;

        if let Err(e) = port.write_data_terminal_ready(true) {
            warn!("Failed to set DTR on {}: {}", config.port, e);
        }

        // Allow device to initialize
        thread::sleep(Duration::from_millis(100));

        Ok(port)
    }
}

impl Drop for Output {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker thread function - waits for frames and writes them R, G, B
fn worker_thread<P: PlaneWriter>(
    mut writer: P,
    receiver: Receiver<Frame>,
    name: String,
    num_pixels: usize,
    frames_sent: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::Relaxed) {
        match receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => {
                if let Err(e) = writer.write_planes(&frame) {
                    error!("Serial error on {}: {}", name, e);
                    error!("Output {} is now disconnected", name);
                    return;
                }
                frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    // Try to turn off LEDs on exit (best effort)
    let _ = writer.write_planes(&Frame::blank(num_pixels));
}
