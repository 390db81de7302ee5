use anyhow::{bail, Context, Result};
use log::{info, warn};
use std::fs;
use std::io::{Cursor, ErrorKind};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use crate::config::AssetsConfig;
use crate::frame::Color;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Image,
    Audio,
}

impl AssetKind {
    /// Object key in the store: `<thing>/image` or `<thing>/audio`
    pub fn key(&self, thing_name: &str) -> String {
        match self {
            AssetKind::Image => format!("{}/image", thing_name),
            AssetKind::Audio => format!("{}/audio", thing_name),
        }
    }
}

/// Raw byte access to uploaded assets
pub trait AssetStore: Send + Sync {
    fn fetch(&self, key: &str) -> Result<Vec<u8>>;
}

/// Assets mirrored into a local directory
pub struct DirAssetStore {
    root: PathBuf,
}

impl DirAssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirAssetStore { root: root.into() }
    }
}

impl AssetStore for DirAssetStore {
    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.root.join(key);
        fs::read(&path).with_context(|| format!("Failed to read asset {}", path.display()))
    }
}

/// Assets served over HTTP at `<base>/<key>`
pub struct HttpAssetStore {
    base_url: String,
    client: reqwest::blocking::Client,
}

impl HttpAssetStore {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(HttpAssetStore {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl AssetStore for HttpAssetStore {
    fn fetch(&self, key: &str) -> Result<Vec<u8>> {
        let url = format!("{}/{}", self.base_url, key);
        let response = self
            .client
            .get(&url)
            .send()
            .with_context(|| format!("Failed to request {}", url))?
            .error_for_status()
            .with_context(|| format!("Asset request for {} failed", url))?;

        Ok(response.bytes()?.to_vec())
    }
}

pub fn store_from_config(config: &AssetsConfig) -> Result<Arc<dyn AssetStore>> {
    Ok(match config {
        AssetsConfig::Directory { dir } => Arc::new(DirAssetStore::new(dir)),
        AssetsConfig::Http { url } => Arc::new(HttpAssetStore::new(url)?),
    })
}

const PPM_MAGIC: &[u8] = b"P6";
const RIFF_MAGIC: &[u8] = b"RIFF";

/// Decoded image, row-major. `pixels.len() == width * height`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageAsset {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<Color>,
}

impl ImageAsset {
    /// Pixel at `column`, `row`; black outside the image
    pub fn pixel(&self, column: usize, row: usize) -> Color {
        if column >= self.width || row >= self.height {
            return Color::BLACK;
        }
        self.pixels
            .get(row * self.width + column)
            .copied()
            .unwrap_or(Color::BLACK)
    }

    /// Decode an uploaded image, picking the decoder from its leading bytes.
    /// PNG and JPEG go through `image`; binary PPM is handled here.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.starts_with(PPM_MAGIC) {
            return Self::decode_ppm(data);
        }

        let rgb = image::load_from_memory(data)
            .context("Unreadable image data")?
            .to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        if width == 0 || height == 0 {
            bail!("Empty image");
        }

        let pixels = rgb.pixels().map(|p| Color::new(p[0], p[1], p[2])).collect();
        Ok(ImageAsset {
            width,
            height,
            pixels,
        })
    }

    /// Decode a binary PPM (P6) with 8-bit samples
    pub fn decode_ppm(data: &[u8]) -> Result<Self> {
        let mut cursor = 0;
        let mut header = Vec::with_capacity(4);

        while header.len() < 4 {
            // Skip whitespace and comments between header fields
            while cursor < data.len() {
                match data[cursor] {
                    b'#' => {
                        while cursor < data.len() && data[cursor] != b'\n' {
                            cursor += 1;
                        }
                    }
                    c if c.is_ascii_whitespace() => cursor += 1,
                    _ => break,
                }
            }

            let start = cursor;
            while cursor < data.len() && !data[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            if start == cursor {
                bail!("Truncated PPM header");
            }
            header.push(String::from_utf8_lossy(&data[start..cursor]).to_string());
        }

        if header[0] != "P6" {
            bail!("Unsupported image format {}", header[0]);
        }

        let width: usize = header[1].parse().context("Bad PPM width")?;
        let height: usize = header[2].parse().context("Bad PPM height")?;
        let max_value: usize = header[3].parse().context("Bad PPM max value")?;
        if max_value == 0 || max_value > 255 {
            bail!("Unsupported PPM max value {}", max_value);
        }
        if width == 0 || height == 0 {
            bail!("Empty image");
        }

        // Exactly one whitespace byte separates the header from the raster
        let raster = data.get(cursor + 1..).unwrap_or_default();
        let needed = width
            .checked_mul(height)
            .and_then(|n| n.checked_mul(3))
            .with_context(|| format!("PPM dimensions {}x{} are too large", width, height))?;
        if raster.len() < needed {
            bail!("PPM raster has {} bytes, expected {}", raster.len(), needed);
        }

        let normalize = |v: u8| ((usize::from(v) * 255) / max_value).min(255) as u8;
        let pixels = raster[..needed]
            .chunks_exact(3)
            .map(|p| Color::new(normalize(p[0]), normalize(p[1]), normalize(p[2])))
            .collect();

        Ok(ImageAsset {
            width,
            height,
            pixels,
        })
    }
}

/// Decoded audio, down-mixed to mono, samples in [-1, 1]
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTrack {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
    pub max_amplitude: f32,
}

impl AudioTrack {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        let max_amplitude = samples.iter().fold(0.0f32, |max, s| max.max(s.abs()));
        AudioTrack {
            sample_rate,
            samples,
            max_amplitude,
        }
    }

    /// Absolute amplitude at `seconds` into the track, looping at the end
    pub fn amplitude_at(&self, seconds: f64) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let index = (seconds * f64::from(self.sample_rate)) as usize % self.samples.len();
        self.samples[index].abs()
    }

    /// Decode an uploaded track: WAV through `hound`, anything else is
    /// handed to `symphonia` as MP3
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.starts_with(RIFF_MAGIC) {
            Self::decode_wav(data)
        } else {
            Self::decode_mp3(data)
        }
    }

    pub fn decode_wav(data: &[u8]) -> Result<Self> {
        let mut reader = hound::WavReader::new(Cursor::new(data)).context("Unreadable WAV data")?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<std::result::Result<_, _>>()
                .context("Corrupt WAV samples")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<std::result::Result<_, _>>()
                    .context("Corrupt WAV samples")?
            }
        };

        if channels > 1 {
            info!("Down-mixing {} channel audio to mono", channels);
        }
        Ok(AudioTrack::new(spec.sample_rate, downmix(&interleaved, channels)))
    }

    pub fn decode_mp3(data: &[u8]) -> Result<Self> {
        let source = MediaSourceStream::new(Box::new(Cursor::new(data.to_vec())), Default::default());
        let mut hint = Hint::new();
        hint.with_extension("mp3");

        let detected = symphonia::default::get_probe()
            .format(&hint, source, &FormatOptions::default(), &MetadataOptions::default())
            .context("Unrecognized audio data")?;
        let mut format = detected.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .context("No decodable audio track")?;
        let track_id = track.id;
        let mut decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .context("Unsupported audio codec")?;

        let mut sample_rate = track.codec_params.sample_rate.unwrap_or(0);
        let mut mono = Vec::new();
        let mut channels_logged = false;

        loop {
            let packet = match format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e).context("Corrupt audio stream"),
            };
            if packet.track_id() != track_id {
                continue;
            }

            match decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let channels = spec.channels.count().max(1);
                    if channels > 1 && !channels_logged {
                        info!("Down-mixing {} channel audio to mono", channels);
                        channels_logged = true;
                    }
                    sample_rate = spec.rate;

                    let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buffer.copy_interleaved_ref(decoded);
                    mono.extend(downmix(buffer.samples(), channels));
                }
                // A damaged frame is skipped, the rest of the track still plays
                Err(SymphoniaError::DecodeError(e)) => warn!("Skipping undecodable audio frame: {}", e),
                Err(e) => return Err(e).context("Audio decoding failed"),
            }
        }

        if sample_rate == 0 || mono.is_empty() {
            bail!("Audio stream contained no samples");
        }
        Ok(AudioTrack::new(sample_rate, mono))
    }
}

/// Average interleaved frames down to one channel
fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    interleaved
        .chunks(channels.max(1))
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

#[derive(Debug, Default)]
struct Slots {
    image: Option<Arc<ImageAsset>>,
    image_generation: u64,
    audio: Option<Arc<AudioTrack>>,
    audio_generation: u64,
}

/// Latest decoded assets, each with a generation counter so renderers can
/// notice a replacement and swap it in on their next tick
#[derive(Debug, Clone, Default)]
pub struct AssetSlots {
    inner: Arc<Mutex<Slots>>,
}

impl AssetSlots {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_image(&self, image: ImageAsset) {
        let mut slots = self.lock();
        slots.image = Some(Arc::new(image));
        slots.image_generation += 1;
    }

    pub fn set_audio(&self, track: AudioTrack) {
        let mut slots = self.lock();
        slots.audio = Some(Arc::new(track));
        slots.audio_generation += 1;
    }

    /// Current image if it differs from the generation the caller holds
    pub fn image_since(&self, generation: u64) -> Option<(u64, Option<Arc<ImageAsset>>)> {
        let slots = self.lock();
        (slots.image_generation != generation).then(|| (slots.image_generation, slots.image.clone()))
    }

    /// Current track if it differs from the generation the caller holds
    pub fn audio_since(&self, generation: u64) -> Option<(u64, Option<Arc<AudioTrack>>)> {
        let slots = self.lock();
        (slots.audio_generation != generation).then(|| (slots.audio_generation, slots.audio.clone()))
    }
}

/// Downloads and decodes assets off the caller's thread
#[derive(Clone)]
pub struct AssetFetcher {
    store: Arc<dyn AssetStore>,
    slots: AssetSlots,
    thing_name: String,
}

impl AssetFetcher {
    pub fn new(store: Arc<dyn AssetStore>, slots: AssetSlots, thing_name: &str) -> Self {
        AssetFetcher {
            store,
            slots,
            thing_name: thing_name.to_string(),
        }
    }

    /// Fetch in the background; failures are logged and the slot is left as is
    pub fn spawn_fetch(&self, kind: AssetKind) {
        let fetcher = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("fetch-{:?}", kind).to_lowercase())
            .spawn(move || {
                if let Err(e) = fetcher.fetch_now(kind) {
                    warn!("Asset {:?} unavailable: {:#}", kind, e);
                }
            });

        if let Err(e) = spawned {
            warn!("Could not start asset fetch for {:?}: {}", kind, e);
        }
    }

    /// Fetch, decode and install one asset on the current thread
    pub fn fetch_now(&self, kind: AssetKind) -> Result<()> {
        let key = kind.key(&self.thing_name);
        info!("Fetching asset {}", key);
        let data = self.store.fetch(&key)?;

        match kind {
            AssetKind::Image => {
                let image = ImageAsset::decode(&data)?;
                info!("Loaded image {}x{}", image.width, image.height);
                self.slots.set_image(image);
            }
            AssetKind::Audio => {
                let track = AudioTrack::decode(&data)?;
                info!(
                    "Loaded audio, {} samples @ {} Hz, max amplitude {:.3}",
                    track.samples.len(),
                    track.sample_rate,
                    track.max_amplitude
                );
                self.slots.set_audio(track);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MemoryStore(HashMap<String, Vec<u8>>);

    impl AssetStore for MemoryStore {
        fn fetch(&self, key: &str) -> Result<Vec<u8>> {
            self.0.get(key).cloned().context("missing")
        }
    }

    fn ppm(width: usize, height: usize, pixels: &[[u8; 3]]) -> Vec<u8> {
        let mut data = format!("P6\n# test image\n{} {}\n255\n", width, height).into_bytes();
        for p in pixels {
            data.extend_from_slice(p);
        }
        data
    }

    fn wav(channels: u16, samples: &[i16]) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for &s in samples {
                writer.write_sample(s).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_ppm() {
        let data = ppm(2, 1, &[[255, 0, 0], [0, 0, 255]]);
        let image = ImageAsset::decode_ppm(&data).unwrap();
        assert_eq!(image.width, 2);
        assert_eq!(image.height, 1);
        assert_eq!(image.pixel(0, 0), Color::new(255, 0, 0));
        assert_eq!(image.pixel(1, 0), Color::new(0, 0, 255));
    }

    #[test]
    fn test_decode_ppm_rejects_short_raster() {
        let data = ppm(2, 2, &[[255, 0, 0]]);
        assert!(ImageAsset::decode_ppm(&data).is_err());
        assert!(ImageAsset::decode_ppm(b"P3\n1 1\n255\n0 0 0").is_err());
    }

    #[test]
    fn test_decode_ppm_rejects_overflowing_dimensions() {
        let err = ImageAsset::decode_ppm(b"P6\n9223372036854775808 2\n255\n").unwrap_err();
        assert!(format!("{:#}", err).contains("too large"));

        // Fits in usize but the raster cannot hold it
        assert!(ImageAsset::decode_ppm(b"P6\n100000 100000\n255\n\0\0\0").is_err());
    }

    #[test]
    fn test_pixel_outside_image_is_black() {
        let image = ImageAsset::decode_ppm(&ppm(1, 1, &[[9, 9, 9]])).unwrap();
        assert_eq!(image.pixel(1, 0), Color::BLACK);
        assert_eq!(image.pixel(0, 5), Color::BLACK);
    }

    #[test]
    fn test_decode_png() {
        let raster = image::RgbImage::from_raw(2, 1, vec![255, 0, 0, 0, 255, 0]).unwrap();
        let mut cursor = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(raster)
            .write_to(&mut cursor, image::ImageOutputFormat::Png)
            .unwrap();

        let image = ImageAsset::decode(&cursor.into_inner()).unwrap();
        assert_eq!((image.width, image.height), (2, 1));
        assert_eq!(image.pixel(0, 0), Color::new(255, 0, 0));
        assert_eq!(image.pixel(1, 0), Color::new(0, 255, 0));
    }

    #[test]
    fn test_decode_sniffs_format() {
        let image = ImageAsset::decode(&ppm(1, 1, &[[1, 2, 3]])).unwrap();
        assert_eq!(image.pixel(0, 0), Color::new(1, 2, 3));
        assert!(ImageAsset::decode(b"not an image").is_err());

        let track = AudioTrack::decode(&wav(1, &[16384])).unwrap();
        assert_eq!(track.samples.len(), 1);
        assert!(AudioTrack::decode(b"not audio at all").is_err());
    }

    #[test]
    fn test_decode_wav_downmixes() {
        let data = wav(2, &[16384, 0, -32768, -32768]);
        let track = AudioTrack::decode_wav(&data).unwrap();
        assert_eq!(track.sample_rate, 8000);
        assert_eq!(track.samples.len(), 2);
        assert!((track.samples[0] - 0.25).abs() < 1e-6);
        assert!((track.samples[1] + 1.0).abs() < 1e-6);
        assert!((track.max_amplitude - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_amplitude_loops() {
        let track = AudioTrack::new(2, vec![0.5, -1.0]);
        assert_eq!(track.amplitude_at(0.0), 0.5);
        assert_eq!(track.amplitude_at(0.5), 1.0);
        assert_eq!(track.amplitude_at(1.0), 0.5);
    }

    #[test]
    fn test_slots_generation() {
        let slots = AssetSlots::default();
        assert!(slots.image_since(0).is_none());

        slots.set_image(ImageAsset {
            width: 1,
            height: 1,
            pixels: vec![Color::BLACK],
        });
        let (generation, image) = slots.image_since(0).unwrap();
        assert_eq!(generation, 1);
        assert!(image.is_some());
        assert!(slots.image_since(generation).is_none());
    }

    #[test]
    fn test_fetch_installs_into_slot() {
        let mut objects = HashMap::new();
        objects.insert("stick/image".to_string(), ppm(1, 1, &[[1, 2, 3]]));
        let slots = AssetSlots::default();
        let fetcher = AssetFetcher::new(Arc::new(MemoryStore(objects)), slots.clone(), "stick");

        fetcher.fetch_now(AssetKind::Image).unwrap();
        let (_, image) = slots.image_since(0).unwrap();
        assert_eq!(image.unwrap().pixel(0, 0), Color::new(1, 2, 3));

        assert!(fetcher.fetch_now(AssetKind::Audio).is_err());
        assert!(slots.audio_since(0).is_none());
    }
}
