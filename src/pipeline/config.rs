//! Recording parameters read from the controller
//!
//! The controller writes one field per line on stdin, in a fixed order.
//! Numeric fields follow C `atoi` rules: leading whitespace and sign are
//! accepted, parsing stops at the first non-digit, and garbage reads as 0.
//! Only the output path, rotation and audio source are mandatory; every
//! other field falls back to a default.

use std::io::BufRead;
use std::path::PathBuf;
use tracing::{info, warn};

use super::exit;
use crate::encoder::VideoCodec;

pub const DEFAULT_FRAME_RATE: u32 = 30;
pub const MAX_FRAME_RATE: u32 = 100;
pub const DEFAULT_VIDEO_BITRATE: u32 = 10_000_000;
pub const DEFAULT_AUDIO_SAMPLE_RATE: u32 = 16_000;

/// Frame rate value meaning "render as fast as the backend allows"
const UNCAPPED_FRAME_RATE: i32 = -1;

/// Errors that abort configuration intake
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration cancelled before an output path was given")]
    Cancelled,

    #[error("no rotation specified")]
    MissingRotation,

    #[error("no audio setting specified")]
    MissingAudioSource,

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ConfigError::Cancelled | ConfigError::Io(_) => exit::CANCELLED,
            ConfigError::MissingRotation => exit::MISSING_ROTATION,
            ConfigError::MissingAudioSource => exit::MISSING_AUDIO_SOURCE,
        }
    }
}

/// Clockwise rotation applied to the captured display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    /// Map degrees onto a quarter turn. Anything that is not a multiple of 90 is rejected.
    pub fn from_degrees(degrees: i32) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Deg0),
            90 => Some(Rotation::Deg90),
            180 => Some(Rotation::Deg180),
            270 => Some(Rotation::Deg270),
            _ => None,
        }
    }

    pub fn degrees(self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }

    /// True when the rotation swaps width and height
    pub fn is_quarter_turn(self) -> bool {
        matches!(self, Rotation::Deg90 | Rotation::Deg270)
    }

    /// Compose two rotations
    pub fn then(self, other: Rotation) -> Rotation {
        // Both operands are multiples of 90, so the sum always maps back
        Rotation::from_degrees((self.degrees() + other.degrees()) as i32).unwrap_or_default()
    }
}

/// Where the audio track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AudioSource {
    #[default]
    Mute,
    Microphone,
}

impl AudioSource {
    fn from_selector(selector: &str) -> Self {
        if selector.starts_with('m') {
            AudioSource::Microphone
        } else {
            AudioSource::Mute
        }
    }

    /// The single-character selector used on the wire
    pub fn selector(self) -> char {
        match self {
            AudioSource::Mute => 'x',
            AudioSource::Microphone => 'm',
        }
    }
}

/// How frames travel from the capture source into the encoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RenderStrategy {
    /// GPU composition into an RGBA encoder surface
    #[default]
    GpuRgba,
    /// GPU composition sampling the capture as an external texture
    GpuExternalTexture,
    /// CPU pixel copy, RGBA into the encoder queue
    Cpu,
    /// CPU pixel copy converted to YUV 4:2:0 semi-planar (NV12)
    YuvSemiPlanar,
    /// CPU pixel copy converted to YUV 4:2:0 planar (I420)
    YuvPlanar,
}

impl RenderStrategy {
    fn from_selector(selector: &str) -> Self {
        match selector.chars().next() {
            Some('C') => RenderStrategy::Cpu,
            Some('O') => RenderStrategy::GpuExternalTexture,
            Some('S') => RenderStrategy::YuvSemiPlanar,
            Some('P') => RenderStrategy::YuvPlanar,
            _ => RenderStrategy::GpuRgba,
        }
    }

    pub fn uses_gpu(self) -> bool {
        matches!(
            self,
            RenderStrategy::GpuRgba | RenderStrategy::GpuExternalTexture
        )
    }
}

/// Channel order of RGB output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ColorFormat {
    #[default]
    Rgba,
    /// Red and blue swapped, for encoders that expect BGRA
    Bgra,
}

impl ColorFormat {
    fn from_selector(selector: &str) -> Self {
        if selector.starts_with('B') {
            ColorFormat::Bgra
        } else {
            ColorFormat::Rgba
        }
    }
}

/// Which encoder consumes the frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderKind {
    /// An encoder session driven by this process
    Session(VideoCodec),
    /// Raw frames handed to an external encoder process
    External,
}

/// Immutable snapshot of one recording's parameters
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub output_path: PathBuf,
    pub rotation: Rotation,
    pub audio_source: AudioSource,
    /// Requested frame width, 0 = display width
    pub width: u32,
    /// Requested frame height, 0 = display height
    pub height: u32,
    pub padding_width: u32,
    pub padding_height: u32,
    /// Effective frame rate (the default when uncapped)
    pub frame_rate: u32,
    /// False when the controller asked for uncapped rendering
    pub restrict_frame_rate: bool,
    pub strategy: RenderStrategy,
    pub color_format: ColorFormat,
    pub video_bitrate: u32,
    pub audio_sample_rate: u32,
    /// Raw encoder selector, negative = external encoder
    pub video_encoder: i32,
    pub allow_vertical_frames: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_path: PathBuf::new(),
            rotation: Rotation::Deg0,
            audio_source: AudioSource::Mute,
            width: 0,
            height: 0,
            padding_width: 0,
            padding_height: 0,
            frame_rate: DEFAULT_FRAME_RATE,
            restrict_frame_rate: true,
            strategy: RenderStrategy::GpuRgba,
            color_format: ColorFormat::Rgba,
            video_bitrate: DEFAULT_VIDEO_BITRATE,
            audio_sample_rate: DEFAULT_AUDIO_SAMPLE_RATE,
            video_encoder: 0,
            allow_vertical_frames: true,
        }
    }
}

impl PipelineConfig {
    /// Read the configuration fields from the controller, in protocol order
    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self, ConfigError> {
        let mut lines = FieldReader { reader };

        let output_path = match lines.next_raw()? {
            Some(path) if !path.is_empty() => path_from_bytes(path),
            _ => return Err(ConfigError::Cancelled),
        };

        let rotation_field = lines.next_field()?.ok_or(ConfigError::MissingRotation)?;
        let rotation = parse_rotation(&rotation_field);

        let audio_field = lines.next_field()?.ok_or(ConfigError::MissingAudioSource)?;
        let audio_source = AudioSource::from_selector(&audio_field);

        let width = non_negative(atoi(&lines.next_field()?.unwrap_or_default()));
        let height = non_negative(atoi(&lines.next_field()?.unwrap_or_default()));
        let padding_width = non_negative(atoi(&lines.next_field()?.unwrap_or_default()));
        let padding_height = non_negative(atoi(&lines.next_field()?.unwrap_or_default()));

        let (frame_rate, restrict_frame_rate) =
            parse_frame_rate(atoi(&lines.next_field()?.unwrap_or_default()));

        let strategy = RenderStrategy::from_selector(&lines.next_field()?.unwrap_or_default());
        let color_format = ColorFormat::from_selector(&lines.next_field()?.unwrap_or_default());

        let video_bitrate = match atoi(&lines.next_field()?.unwrap_or_default()) {
            0 => DEFAULT_VIDEO_BITRATE,
            bitrate => non_negative(bitrate),
        };
        let audio_sample_rate = match atoi(&lines.next_field()?.unwrap_or_default()) {
            0 => DEFAULT_AUDIO_SAMPLE_RATE,
            rate => non_negative(rate),
        };

        let video_encoder = atoi(&lines.next_field()?.unwrap_or_default());
        let allow_vertical_frames = parse_flag(lines.next_field()?.as_deref(), true);

        let config = Self {
            output_path,
            rotation,
            audio_source,
            width,
            height,
            padding_width,
            padding_height,
            frame_rate,
            restrict_frame_rate,
            strategy,
            color_format,
            video_bitrate,
            audio_sample_rate,
            video_encoder,
            allow_vertical_frames,
        };

        info!(
            "SETTINGS rotation: {}, audio: {:?}, resolution: {} x {}, padding: {} x {}, frameRate: {}{}, mode: {:?}, color: {:?}, bitrate: {}, sampling: {}, encoder: {}",
            config.rotation.degrees(),
            config.audio_source,
            config.width,
            config.height,
            config.padding_width,
            config.padding_height,
            config.frame_rate,
            if config.restrict_frame_rate { "" } else { " (uncapped)" },
            config.strategy,
            config.color_format,
            config.video_bitrate,
            config.audio_sample_rate,
            config.video_encoder,
        );

        Ok(config)
    }

    /// Resolve the encoder selector
    pub fn encoder_kind(&self) -> EncoderKind {
        if self.video_encoder < 0 {
            EncoderKind::External
        } else {
            EncoderKind::Session(VideoCodec::from_index(self.video_encoder))
        }
    }
}

/// Reads one newline-terminated field at a time. `None` means end of input.
///
/// Fields are raw bytes; anything that is not UTF-8 is decoded lossily, so a
/// garbled numeric field reads as 0 and falls back like any other garbage.
struct FieldReader<'a, R> {
    reader: &'a mut R,
}

impl<R: BufRead> FieldReader<'_, R> {
    fn next_raw(&mut self) -> Result<Option<Vec<u8>>, ConfigError> {
        let mut line = Vec::new();
        if self.reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(None);
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(Some(line))
    }

    fn next_field(&mut self) -> Result<Option<String>, ConfigError> {
        Ok(self
            .next_raw()?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }
}

/// Paths are bytes on unix and need not be UTF-8
#[cfg(unix)]
fn path_from_bytes(raw: Vec<u8>) -> PathBuf {
    use std::ffi::OsString;
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(OsString::from_vec(raw))
}

#[cfg(not(unix))]
fn path_from_bytes(raw: Vec<u8>) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(&raw).into_owned())
}

fn parse_rotation(field: &str) -> Rotation {
    let degrees = atoi(field);
    Rotation::from_degrees(degrees).unwrap_or_else(|| {
        warn!("Unsupported rotation {}, recording unrotated", degrees);
        Rotation::Deg0
    })
}

fn parse_frame_rate(requested: i32) -> (u32, bool) {
    if requested == UNCAPPED_FRAME_RATE {
        (DEFAULT_FRAME_RATE, false)
    } else if requested <= 0 || requested > MAX_FRAME_RATE as i32 {
        (DEFAULT_FRAME_RATE, true)
    } else {
        (requested as u32, true)
    }
}

fn parse_flag(field: Option<&str>, default: bool) -> bool {
    let Some(field) = field.map(str::trim).filter(|f| !f.is_empty()) else {
        return default;
    };
    match field.chars().next() {
        Some('t' | 'T' | 'y' | 'Y') => true,
        Some('f' | 'F' | 'n' | 'N') => false,
        _ => atoi(field) != 0,
    }
}

fn non_negative(value: i32) -> u32 {
    value.max(0) as u32
}

/// C `atoi`: optional leading whitespace and sign, then digits up to the first non-digit
pub(crate) fn atoi(field: &str) -> i32 {
    let s = field.trim_start();
    let (negative, digits) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };

    let mut value: i64 = 0;
    for b in digits.bytes().take_while(u8::is_ascii_digit) {
        value = (value * 10 + i64::from(b - b'0')).min(i64::from(i32::MAX) + 1);
    }
    if negative {
        value = -value;
    }
    value.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32
}
