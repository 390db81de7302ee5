use anyhow::Result;
use log::{info, trace};
use std::sync::Arc;

use crate::assets::AssetSlots;
use crate::config::ModeSettings;
use crate::frame::Frame;
use crate::pattern::Pattern;
use crate::state::{DeviceState, SharedState};
use crate::telemetry::TelemetrySink;

mod image;
mod sensor;

use image::ImageMode;
use sensor::{AudioMode, LightsaberMode, MusicMode};

pub const MODE_BASIC: i64 = 1;
pub const MODE_IMAGE: i64 = 2;
pub const MODE_MUSIC: i64 = 3;
pub const MODE_AUDIO: i64 = 4;
pub const MODE_LIGHTSABER: i64 = 5;

/// Everything a mode may read or touch besides the per-tick snapshot
#[derive(Clone)]
pub struct ModeContext {
    pub num_pixels: usize,
    pub settings: ModeSettings,
    pub assets: AssetSlots,
    pub sink: Arc<dyn TelemetrySink>,
    pub state: SharedState,
}

/// Top-level rendering behavior; exactly one is active at a time
pub enum Mode {
    Null,
    Basic(BasicMode),
    Image(ImageMode),
    Music(MusicMode),
    Audio(AudioMode),
    Lightsaber(LightsaberMode),
}

impl Mode {
    /// Build the mode for `id`. Unknown ids give Null.
    pub fn create(id: i64, ctx: &ModeContext) -> Result<Self> {
        Ok(match id {
            MODE_BASIC => Mode::Basic(BasicMode::default()),
            MODE_IMAGE => Mode::Image(ImageMode::default()),
            MODE_MUSIC => Mode::Music(MusicMode::new(ctx)?),
            MODE_AUDIO => Mode::Audio(AudioMode::new(ctx)?),
            MODE_LIGHTSABER => Mode::Lightsaber(LightsaberMode::new(ctx)?),
            _ => Mode::Null,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Null => "null",
            Mode::Basic(_) => "basic",
            Mode::Image(_) => "image",
            Mode::Music(_) => "music",
            Mode::Audio(_) => "audio",
            Mode::Lightsaber(_) => "lightsaber",
        }
    }

    /// Whether inbound client telemetry feeds this mode
    pub fn uses_telemetry(&self) -> bool {
        matches!(self, Mode::Audio(_) | Mode::Lightsaber(_))
    }

    pub fn run(&mut self, snapshot: &DeviceState, telemetry: Option<&str>, ctx: &ModeContext) -> Frame {
        match self {
            Mode::Null => Frame::blank(ctx.num_pixels),
            Mode::Basic(mode) => mode.run(snapshot, ctx),
            Mode::Image(mode) => mode.run(ctx),
            Mode::Music(mode) => mode.run(snapshot, ctx),
            Mode::Audio(mode) => mode.run(snapshot, telemetry, ctx),
            Mode::Lightsaber(mode) => mode.run(snapshot, telemetry, ctx),
        }
    }

    /// Release everything the mode owns. Background tasks are joined before
    /// this returns; a task that cannot be joined is an error.
    pub fn exit(&mut self) -> Result<()> {
        match self {
            Mode::Null | Mode::Basic(_) => Ok(()),
            Mode::Image(mode) => {
                mode.release();
                Ok(())
            }
            Mode::Music(mode) => mode.exit(),
            Mode::Audio(mode) => mode.exit(),
            Mode::Lightsaber(mode) => mode.exit(),
        }
    }
}

/// Runs the active pattern, rebuilding it when the pattern id changes
#[derive(Default)]
pub struct BasicMode {
    pattern_id: Option<i64>,
    pattern: Option<Pattern>,
}

impl BasicMode {
    fn run(&mut self, snapshot: &DeviceState, ctx: &ModeContext) -> Frame {
        if self.pattern_id != Some(snapshot.pattern) {
            self.pattern = Some(Pattern::from_id(
                snapshot.pattern,
                ctx.num_pixels,
                ctx.settings.blink_threshold,
            ));
            self.pattern_id = Some(snapshot.pattern);
        }

        match self.pattern.as_mut() {
            Some(pattern) => pattern.render(&snapshot.colors, ctx.num_pixels),
            None => Frame::blank(ctx.num_pixels),
        }
    }
}

/// Owns the active mode and switches it when the device state asks for another
pub struct ModeEngine {
    ctx: ModeContext,
    active_id: Option<i64>,
    mode: Mode,
    exits: u64,
}

impl ModeEngine {
    pub fn new(ctx: ModeContext) -> Self {
        ModeEngine {
            ctx,
            active_id: None,
            mode: Mode::Null,
            exits: 0,
        }
    }

    /// Produce this tick's frame
    pub fn tick(&mut self, telemetry: Option<&str>) -> Result<Frame> {
        let snapshot = self.ctx.state.snapshot();
        let id = snapshot.effective_mode();

        if self.active_id != Some(id) {
            if self.active_id.is_some() {
                self.mode.exit()?;
                self.exits += 1;
            }

            self.mode = Mode::create(id, &self.ctx)?;
            self.active_id = Some(id);
            info!("Mode {} active ({})", id, self.mode.name());
        }

        let frame = self.mode.run(&snapshot, telemetry, &self.ctx);
        debug_assert_eq!(frame.g.len(), self.ctx.num_pixels);
        debug_assert_eq!(frame.b.len(), self.ctx.num_pixels);
        trace!("Rendered {} frame", self.mode.name());

        Ok(frame)
    }

    pub fn wants_telemetry(&self) -> bool {
        self.mode.uses_telemetry()
    }

    #[allow(dead_code)]
    pub fn active_id(&self) -> Option<i64> {
        self.active_id
    }

    /// Number of mode teardowns so far
    pub fn exit_count(&self) -> u64 {
        self.exits
    }

    /// Tear down the active mode on shutdown
    pub fn shutdown(&mut self) -> Result<()> {
        self.mode.exit()?;
        self.mode = Mode::Null;
        self.active_id = None;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::telemetry::tests::RecordingSink;

    pub(crate) const NUM_PIXELS: usize = 8;

    pub(crate) fn context(state: DeviceState) -> (ModeContext, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let ctx = ModeContext {
            num_pixels: NUM_PIXELS,
            settings: ModeSettings::default(),
            assets: AssetSlots::default(),
            sink: sink.clone(),
            state: SharedState::new(state),
        };
        (ctx, sink)
    }

    fn set_mode(ctx: &ModeContext, mode: i64) {
        ctx.state.update(|s| s.mode = mode);
    }

    #[test]
    fn test_exit_only_on_transitions() {
        let (ctx, _) = context(DeviceState {
            is_on: true,
            ..DeviceState::default()
        });
        let mut engine = ModeEngine::new(ctx.clone());

        let mut exits = Vec::new();
        for mode in [1, 1, 0, 1] {
            set_mode(&ctx, mode);
            engine.tick(None).unwrap();
            exits.push(engine.exit_count());
        }

        assert_eq!(exits, vec![0, 0, 1, 2]);
        assert_eq!(engine.active_id(), Some(1));
    }

    #[test]
    fn test_off_renders_blank_until_on() {
        let (ctx, _) = context(DeviceState {
            is_on: false,
            mode: MODE_BASIC,
            pattern: 1,
            colors: vec!["FF0000".to_string()],
            ..DeviceState::default()
        });
        let mut engine = ModeEngine::new(ctx.clone());

        for pattern in [1, 2, 5] {
            ctx.state.update(|s| s.pattern = pattern);
            assert_eq!(engine.tick(None).unwrap(), Frame::blank(NUM_PIXELS));
        }

        ctx.state.update(|s| {
            s.is_on = true;
            s.pattern = 1;
        });
        let frame = engine.tick(None).unwrap();
        assert!(frame.r.iter().all(|&v| v == 255));
    }

    #[test]
    fn test_unknown_mode_is_null() {
        let (ctx, _) = context(DeviceState {
            is_on: true,
            mode: 99,
            ..DeviceState::default()
        });
        let mut engine = ModeEngine::new(ctx);
        assert_eq!(engine.tick(None).unwrap(), Frame::blank(NUM_PIXELS));
    }

    #[test]
    fn test_pattern_switch_restarts_phase() {
        let (ctx, _) = context(DeviceState {
            is_on: true,
            mode: MODE_BASIC,
            pattern: 2,
            colors: vec!["FF0000".to_string()],
            ..DeviceState::default()
        });
        let mut engine = ModeEngine::new(ctx.clone());

        for _ in 0..3 {
            engine.tick(None).unwrap();
        }

        // Away and back: the dot starts again at pixel 0
        ctx.state.update(|s| s.pattern = 1);
        engine.tick(None).unwrap();
        ctx.state.update(|s| s.pattern = 2);
        let frame = engine.tick(None).unwrap();
        assert_eq!(frame.r[0], 255);
        assert_eq!(engine.exit_count(), 0);
    }

    #[test]
    fn test_sensor_mode_switch_stops_telemetry() {
        let (ctx, _) = context(DeviceState {
            is_on: true,
            mode: MODE_AUDIO,
            ..DeviceState::default()
        });
        let mut engine = ModeEngine::new(ctx.clone());
        engine.tick(None).unwrap();
        assert!(engine.wants_telemetry());

        set_mode(&ctx, MODE_BASIC);
        engine.tick(None).unwrap();
        assert!(!engine.wants_telemetry());
        assert_eq!(engine.exit_count(), 1);
    }
}
