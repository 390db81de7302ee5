/// One tick of pixel output, stored as three color planes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub r: Vec<u8>,
    pub g: Vec<u8>,
    pub b: Vec<u8>,
}

impl Frame {
    /// All pixels off
    pub fn blank(num_pixels: usize) -> Self {
        Self::filled(num_pixels, Color::BLACK)
    }

    /// Every pixel set to the same color
    pub fn filled(num_pixels: usize, color: Color) -> Self {
        Frame {
            r: vec![color.r; num_pixels],
            g: vec![color.g; num_pixels],
            b: vec![color.b; num_pixels],
        }
    }

    pub fn len(&self) -> usize {
        self.r.len()
    }

    pub fn set(&mut self, index: usize, color: Color) {
        self.r[index] = color.r;
        self.g[index] = color.g;
        self.b[index] = color.b;
    }

    #[allow(dead_code)]
    pub fn get(&self, index: usize) -> Color {
        Color {
            r: self.r[index],
            g: self.g[index],
            b: self.b[index],
        }
    }

    /// Rotate every plane left by one position (pixel 1 becomes pixel 0)
    pub fn rotate_left(&mut self) {
        if self.len() > 1 {
            self.r.rotate_left(1);
            self.g.rotate_left(1);
            self.b.rotate_left(1);
        }
    }

    /// Wire layout shared by TCP viewers: R plane, G plane, B plane, no header
    pub fn to_planes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.len() * 3);
        data.extend_from_slice(&self.r);
        data.extend_from_slice(&self.g);
        data.extend_from_slice(&self.b);
        data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub const BLACK: Color = Color { r: 0, g: 0, b: 0 };

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Color { r, g, b }
    }

    /// Parse a `RRGGBB` hex string. Anything else is black.
    pub fn parse(hex: &str) -> Self {
        if hex.len() != 6 || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Color::BLACK;
        }

        let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).unwrap_or(0);

        Color {
            r: channel(0..2),
            g: channel(2..4),
            b: channel(4..6),
        }
    }

    /// First entry of a color list, black when the list is empty
    pub fn first_of(colors: &[String]) -> Self {
        colors.first().map(|c| Color::parse(c)).unwrap_or(Color::BLACK)
    }

    /// Last entry of a color list, black when the list is empty
    pub fn last_of(colors: &[String]) -> Self {
        colors.last().map(|c| Color::parse(c)).unwrap_or(Color::BLACK)
    }

    /// Multiply every channel by `factor`, clamped to [0, 1]
    pub fn scale(self, factor: f32) -> Self {
        let factor = factor.clamp(0.0, 1.0);
        let apply = |c: u8| (c as f32 * factor).round() as u8;

        Color {
            r: apply(self.r),
            g: apply(self.g),
            b: apply(self.b),
        }
    }

    /// HSL to RGB. `hue` in degrees, `saturation` and `lightness` in [0, 1].
    pub fn from_hsl(hue: f32, saturation: f32, lightness: f32) -> Self {
        let chroma = (1.0 - (2.0 * lightness - 1.0).abs()) * saturation;
        let sector = (hue.rem_euclid(360.0)) / 60.0;
        let x = chroma * (1.0 - (sector % 2.0 - 1.0).abs());

        let (r, g, b) = match sector as u32 {
            0 => (chroma, x, 0.0),
            1 => (x, chroma, 0.0),
            2 => (0.0, chroma, x),
            3 => (0.0, x, chroma),
            4 => (x, 0.0, chroma),
            _ => (chroma, 0.0, x),
        };

        let m = lightness - chroma / 2.0;
        let to_byte = |v: f32| ((v + m) * 255.0).round().clamp(0.0, 255.0) as u8;

        Color {
            r: to_byte(r),
            g: to_byte(g),
            b: to_byte(b),
        }
    }
}
