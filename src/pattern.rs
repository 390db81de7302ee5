use crate::frame::{Color, Frame};

/// Animation used by the Basic mode
#[derive(Debug, Clone)]
pub enum Pattern {
    Null,
    Solid,
    Dot(Dot),
    Blink(Blink),
    Breathe(Breathe),
    Rainbow(Rainbow),
    Wave(Wave),
}

impl Pattern {
    /// Build the pattern for `id` in its initial phase; unknown ids are Null
    pub fn from_id(id: i64, num_pixels: usize, blink_threshold: u32) -> Self {
        match id {
            1 => Pattern::Solid,
            2 => Pattern::Dot(Dot::default()),
            3 => Pattern::Blink(Blink::new(blink_threshold)),
            4 => Pattern::Breathe(Breathe::default()),
            5 => Pattern::Rainbow(Rainbow::new(num_pixels)),
            6 => Pattern::Wave(Wave::default()),
            _ => Pattern::Null,
        }
    }

    pub fn render(&mut self, colors: &[String], num_pixels: usize) -> Frame {
        match self {
            Pattern::Null => Frame::blank(num_pixels),
            Pattern::Solid => Frame::filled(num_pixels, Color::first_of(colors)),
            Pattern::Dot(dot) => dot.render(Color::first_of(colors), num_pixels),
            Pattern::Blink(blink) => blink.render(Color::first_of(colors), num_pixels),
            Pattern::Breathe(breathe) => breathe.render(Color::first_of(colors), num_pixels),
            Pattern::Rainbow(rainbow) => rainbow.render(),
            Pattern::Wave(wave) => {
                wave.render(Color::first_of(colors), Color::last_of(colors), num_pixels)
            }
        }
    }
}

/// Single lit pixel bouncing end to end
#[derive(Debug, Clone)]
pub struct Dot {
    position: usize,
    forward: bool,
}

impl Default for Dot {
    fn default() -> Self {
        Dot {
            position: 0,
            forward: true,
        }
    }
}

impl Dot {
    fn render(&mut self, color: Color, num_pixels: usize) -> Frame {
        let mut frame = Frame::blank(num_pixels);
        if num_pixels == 0 {
            return frame;
        }

        let last = num_pixels - 1;
        self.position = self.position.min(last);
        frame.set(self.position, color);

        if self.position >= last {
            self.forward = false;
        }
        if self.position == 0 {
            self.forward = true;
        }

        if last > 0 {
            if self.forward {
                self.position += 1;
            } else {
                self.position -= 1;
            }
        }

        frame
    }
}

/// `threshold` ticks on, `threshold` ticks off
#[derive(Debug, Clone)]
pub struct Blink {
    tick: u32,
    threshold: u32,
}

impl Blink {
    fn new(threshold: u32) -> Self {
        Blink {
            tick: 0,
            threshold: threshold.max(1),
        }
    }

    fn render(&mut self, color: Color, num_pixels: usize) -> Frame {
        let lit = self.tick < self.threshold;
        self.tick = (self.tick + 1) % (self.threshold * 2);

        if lit {
            Frame::filled(num_pixels, color)
        } else {
            Frame::blank(num_pixels)
        }
    }
}

const BREATHE_STEPS: u8 = 10;

/// Whole strip fading in and out in tenths
#[derive(Debug, Clone)]
pub struct Breathe {
    level: u8,
    fade_in: bool,
}

impl Default for Breathe {
    fn default() -> Self {
        Breathe {
            level: 0,
            fade_in: true,
        }
    }
}

impl Breathe {
    fn multiplier(&self) -> f32 {
        f32::from(self.level) / f32::from(BREATHE_STEPS)
    }

    fn render(&mut self, color: Color, num_pixels: usize) -> Frame {
        let frame = Frame::filled(num_pixels, color.scale(self.multiplier()));

        if self.fade_in {
            self.level += 1;
            if self.level >= BREATHE_STEPS {
                self.level = BREATHE_STEPS;
                self.fade_in = false;
            }
        } else {
            self.level = self.level.saturating_sub(1);
            if self.level == 0 {
                self.fade_in = true;
            }
        }

        frame
    }
}

const RAINBOW_SATURATION: f32 = 1.0;
const RAINBOW_LIGHTNESS: f32 = 0.5;

/// Hue wheel spread over the strip, rotating one pixel per tick
#[derive(Debug, Clone)]
pub struct Rainbow {
    palette: Frame,
}

impl Rainbow {
    fn new(num_pixels: usize) -> Self {
        let mut palette = Frame::blank(num_pixels);
        for i in 0..num_pixels {
            let hue = 360.0 * i as f32 / num_pixels as f32;
            palette.set(i, Color::from_hsl(hue, RAINBOW_SATURATION, RAINBOW_LIGHTNESS));
        }
        Rainbow { palette }
    }

    fn render(&mut self) -> Frame {
        let frame = self.palette.clone();
        self.palette.rotate_left();
        frame
    }
}

/// Last color sweeping over the first, back and forth
#[derive(Debug, Clone)]
pub struct Wave {
    boundary: usize,
    ascending: bool,
}

impl Default for Wave {
    fn default() -> Self {
        Wave {
            boundary: 0,
            ascending: true,
        }
    }
}

impl Wave {
    fn render(&mut self, base: Color, sweep: Color, num_pixels: usize) -> Frame {
        let mut frame = Frame::filled(num_pixels, base);
        let boundary = self.boundary.min(num_pixels);
        for i in 0..boundary {
            frame.set(i, sweep);
        }

        if self.ascending {
            self.boundary += 1;
            if self.boundary >= num_pixels {
                self.boundary = num_pixels;
                self.ascending = false;
            }
        } else {
            self.boundary = self.boundary.saturating_sub(1);
            if self.boundary == 0 {
                self.ascending = true;
            }
        }

        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NUM_PIXELS: usize = 8;

    fn red() -> Vec<String> {
        vec!["FF0000".to_string()]
    }

    #[test]
    fn test_every_pattern_fills_all_channels() {
        let colors = vec!["FF0000".to_string(), "00FF00".to_string()];
        for id in 0..=7 {
            let mut pattern = Pattern::from_id(id, NUM_PIXELS, 3);
            for _ in 0..40 {
                let frame = pattern.render(&colors, NUM_PIXELS);
                assert_eq!(frame.r.len(), NUM_PIXELS);
                assert_eq!(frame.g.len(), NUM_PIXELS);
                assert_eq!(frame.b.len(), NUM_PIXELS);
            }
        }
    }

    #[test]
    fn test_solid() {
        let mut pattern = Pattern::from_id(1, NUM_PIXELS, 3);
        for _ in 0..5 {
            let frame = pattern.render(&red(), NUM_PIXELS);
            assert!(frame.r.iter().all(|&v| v == 255));
            assert!(frame.g.iter().all(|&v| v == 0));
            assert!(frame.b.iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn test_solid_without_colors_is_black() {
        let mut pattern = Pattern::from_id(1, NUM_PIXELS, 3);
        assert_eq!(pattern.render(&[], NUM_PIXELS), Frame::blank(NUM_PIXELS));
    }

    #[test]
    fn test_dot_bounces() {
        let mut pattern = Pattern::from_id(2, NUM_PIXELS, 3);
        let mut positions = Vec::new();

        for _ in 0..12 {
            let frame = pattern.render(&red(), NUM_PIXELS);
            let lit: Vec<usize> = (0..NUM_PIXELS).filter(|&i| frame.r[i] != 0).collect();
            assert_eq!(lit.len(), 1);
            positions.push(lit[0]);
        }

        assert_eq!(positions, vec![0, 1, 2, 3, 4, 5, 6, 7, 6, 5, 4, 3]);
    }

    #[test]
    fn test_dot_single_pixel_strip() {
        let mut pattern = Pattern::from_id(2, 1, 3);
        for _ in 0..3 {
            assert_eq!(pattern.render(&red(), 1).r, vec![255]);
        }
    }

    #[test]
    fn test_blink() {
        let mut pattern = Pattern::from_id(3, NUM_PIXELS, 3);
        let lit: Vec<bool> = (0..12)
            .map(|_| pattern.render(&red(), NUM_PIXELS).r[0] == 255)
            .collect();

        assert_eq!(
            lit,
            vec![true, true, true, false, false, false, true, true, true, false, false, false]
        );
    }

    #[test]
    fn test_breathe_ramps() {
        let mut pattern = Pattern::from_id(4, NUM_PIXELS, 3);
        let values: Vec<u8> = (0..21).map(|_| pattern.render(&red(), NUM_PIXELS).r[0]).collect();

        // Up from 0 to full, then back down
        let peak = values.iter().position(|&v| v == 255).unwrap();
        assert_eq!(peak, 10);
        assert!(values[..=peak].windows(2).all(|w| w[0] <= w[1]));
        assert!(values[peak..].windows(2).all(|w| w[0] >= w[1]));
        assert_eq!(values[0], 0);
        assert_eq!(values[20], 0);
    }

    #[test]
    fn test_rainbow_rotates_each_channel() {
        let mut pattern = Pattern::from_id(5, NUM_PIXELS, 3);
        let mut previous = pattern.render(&[], NUM_PIXELS);

        for _ in 0..NUM_PIXELS * 2 {
            let next = pattern.render(&[], NUM_PIXELS);
            let mut expected = previous.clone();
            expected.rotate_left();
            assert_eq!(next, expected);
            previous = next;
        }
    }

    #[test]
    fn test_wave_sweeps_last_color() {
        let colors = vec!["FF0000".to_string(), "00FF00".to_string()];
        let mut pattern = Pattern::from_id(6, NUM_PIXELS, 3);

        for i in 0..NUM_PIXELS {
            let frame = pattern.render(&colors, NUM_PIXELS);
            assert!(frame.g[..i].iter().all(|&v| v == 255));
            assert!(frame.r[i..].iter().all(|&v| v == 255));
        }

        // Fully covered, then recedes
        let full = pattern.render(&colors, NUM_PIXELS);
        assert!(full.g.iter().all(|&v| v == 255));
        let receding = pattern.render(&colors, NUM_PIXELS);
        assert_eq!(receding.r[NUM_PIXELS - 1], 255);
    }

    #[test]
    fn test_unknown_pattern_is_null() {
        let mut pattern = Pattern::from_id(42, NUM_PIXELS, 3);
        assert_eq!(pattern.render(&red(), NUM_PIXELS), Frame::blank(NUM_PIXELS));
    }
}
