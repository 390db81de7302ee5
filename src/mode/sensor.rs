//! Modes driven by an analog signal: a microphone level or serial sensor
//! reading sent in by clients, or the amplitude of the uploaded track.
//!
//! Each owns a [`TelemetryTask`] that publishes its raw reading on a fixed
//! interval, independent of the render rate.

use anyhow::Result;
use log::{debug, warn};
use std::sync::Arc;
use std::time::Instant;

use super::ModeContext;
use crate::assets::AudioTrack;
use crate::config::ModeSettings;
use crate::frame::{Color, Frame};
use crate::state::DeviceState;
use crate::telemetry::TelemetryTask;

fn spawn_task(label: &'static str, ctx: &ModeContext) -> Result<TelemetryTask> {
    TelemetryTask::spawn(label, ctx.settings.telemetry_interval(), Arc::clone(&ctx.sink))
}

/// Parse a telemetry token, keeping `current` when it is not a number
fn parse_reading(token: Option<&str>, current: f64) -> f64 {
    match token.map(str::trim) {
        Some(token) => match token.parse::<f64>() {
            Ok(value) if value.is_finite() => value,
            _ => {
                warn!("Ignoring malformed sensor reading {:?}", token);
                current
            }
        },
        None => current,
    }
}

/// Proportional scale of `value` against `max`, clamped to [0, 1]
fn proportion(value: f64, max: f64) -> f64 {
    if max <= 0.0 {
        return 0.0;
    }
    (value / max).clamp(0.0, 1.0)
}

/// Level bar that moves at most one pixel per tick toward its target.
///
/// Every `heartbeat_period_ticks` ticks the displayed height is raised to
/// `heartbeat_min_pixels` so a quiet input still shows signs of life.
#[derive(Debug, Default)]
struct Bar {
    height: usize,
    ticks: u32,
}

impl Bar {
    fn step(&mut self, target: usize, num_pixels: usize, settings: &ModeSettings) -> usize {
        let target = target.min(num_pixels);
        if self.height < target {
            self.height += 1;
        } else if self.height > target {
            self.height -= 1;
        }

        self.ticks = self.ticks.wrapping_add(1);
        let period = settings.heartbeat_period_ticks;
        if period > 0 && self.ticks % period == 0 {
            return self.height.max(settings.heartbeat_min_pixels.min(num_pixels));
        }

        self.height
    }
}

/// Lit pixel count for a level in [0, 1]; partial pixels are not lit
fn bar_target(level: f64, num_pixels: usize) -> usize {
    (level * num_pixels as f64).floor() as usize
}

fn bar_frame(height: usize, color: Color, num_pixels: usize) -> Frame {
    let mut frame = Frame::blank(num_pixels);
    for i in 0..height.min(num_pixels) {
        frame.set(i, color);
    }
    frame
}

/// Microphone level from clients, scaled against `microphone_max`
pub struct AudioMode {
    task: TelemetryTask,
    reading: f64,
    bar: Bar,
}

impl AudioMode {
    pub(super) fn new(ctx: &ModeContext) -> Result<Self> {
        Ok(AudioMode {
            task: spawn_task("audio", ctx)?,
            reading: 0.0,
            bar: Bar::default(),
        })
    }

    pub(super) fn run(&mut self, snapshot: &DeviceState, telemetry: Option<&str>, ctx: &ModeContext) -> Frame {
        self.reading = parse_reading(telemetry, self.reading);
        self.task.set_reading(self.reading);

        let mut max = snapshot.microphone_max as f64;
        if self.reading > max {
            // Louder than calibrated: raise the ceiling for everyone
            let raised = self.reading.ceil() as i64;
            ctx.state.update(|s| s.microphone_max = s.microphone_max.max(raised));
            debug!("microphone_max raised to {}", raised);
            max = raised as f64;
        }

        let target = bar_target(proportion(self.reading, max), ctx.num_pixels);
        let height = self.bar.step(target, ctx.num_pixels, &ctx.settings);
        bar_frame(height, Color::first_of(&snapshot.colors), ctx.num_pixels)
    }

    pub(super) fn exit(&mut self) -> Result<()> {
        self.task.stop()
    }
}

/// Blade brightness follows a sensor reading from clients
pub struct LightsaberMode {
    task: TelemetryTask,
    reading: f64,
}

impl LightsaberMode {
    pub(super) fn new(ctx: &ModeContext) -> Result<Self> {
        Ok(LightsaberMode {
            task: spawn_task("lightsaber", ctx)?,
            reading: 0.0,
        })
    }

    pub(super) fn run(&mut self, snapshot: &DeviceState, telemetry: Option<&str>, ctx: &ModeContext) -> Frame {
        self.reading = parse_reading(telemetry, self.reading);
        self.task.set_reading(self.reading);

        let intensity = proportion(self.reading, ctx.settings.lightsaber_max);
        Frame::filled(
            ctx.num_pixels,
            Color::first_of(&snapshot.colors).scale(intensity as f32),
        )
    }

    pub(super) fn exit(&mut self) -> Result<()> {
        self.task.stop()
    }
}

/// Level bar following the uploaded track's amplitude over wall-clock time
pub struct MusicMode {
    task: TelemetryTask,
    track: Option<Arc<AudioTrack>>,
    generation: u64,
    started: Instant,
    bar: Bar,
}

impl MusicMode {
    pub(super) fn new(ctx: &ModeContext) -> Result<Self> {
        Ok(MusicMode {
            task: spawn_task("music", ctx)?,
            track: None,
            generation: 0,
            started: Instant::now(),
            bar: Bar::default(),
        })
    }

    pub(super) fn run(&mut self, snapshot: &DeviceState, ctx: &ModeContext) -> Frame {
        if let Some((generation, track)) = ctx.assets.audio_since(self.generation) {
            debug!("Swapping in audio generation {}", generation);
            self.generation = generation;
            self.track = track;
            self.started = Instant::now();
            self.bar = Bar::default();
        }

        let Some(track) = self.track.as_ref() else {
            return Frame::blank(ctx.num_pixels);
        };

        let amplitude = track.amplitude_at(self.started.elapsed().as_secs_f64());
        self.task.set_reading(f64::from(amplitude));

        let level = proportion(f64::from(amplitude), f64::from(track.max_amplitude));
        let target = bar_target(level, ctx.num_pixels);
        let height = self.bar.step(target, ctx.num_pixels, &ctx.settings);
        bar_frame(height, Color::first_of(&snapshot.colors), ctx.num_pixels)
    }

    pub(super) fn exit(&mut self) -> Result<()> {
        self.track = None;
        self.task.stop()
    }
}
