//! Encoder sinks
//!
//! An encoder sink accepts finished frames and produces the output file.
//! The bundled implementation drives an ffmpeg process over a pipe; the
//! render backends only see the [`EncoderSink`] trait.

mod ffmpeg;

pub use ffmpeg::{is_available, FfmpegCommandBuilder, FfmpegSession};

use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::capture::PixelFormat;
use crate::pipeline::exit;

/// Errors raised by an encoder session
#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to start encoder {program:?}: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("encoder input pipe closed")]
    BrokenPipe,

    #[error("encoder session not started")]
    NotStarted,

    #[error("frame of {actual} bytes does not match the negotiated {expected} bytes")]
    FrameSize { expected: usize, actual: usize },

    #[error("encoder exited with {0}")]
    Failed(String),

    #[error("encoder I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncoderError {
    /// Exit code when this error ends the recording
    pub fn exit_code(&self) -> i32 {
        match self {
            EncoderError::BrokenPipe => exit::BROKEN_PIPE,
            EncoderError::Spawn { .. } => exit::ENCODER_SESSION_FAILED,
            _ => exit::RENDER_FAILED,
        }
    }
}

/// Video codec selected by the controller's encoder index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoCodec {
    #[default]
    Default,
    H263,
    H264,
    Mpeg4Sp,
    Vp8,
    Hevc,
}

impl VideoCodec {
    /// Map the controller's encoder index. Unknown indices fall back to the default codec.
    pub fn from_index(index: i32) -> Self {
        match index {
            0 => VideoCodec::Default,
            1 => VideoCodec::H263,
            2 => VideoCodec::H264,
            3 => VideoCodec::Mpeg4Sp,
            4 => VideoCodec::Vp8,
            5 => VideoCodec::Hevc,
            other => {
                warn!("Unknown video encoder {}, using default", other);
                VideoCodec::Default
            }
        }
    }

    /// ffmpeg encoder name, `default` is used for [`VideoCodec::Default`]
    pub fn ffmpeg_codec<'a>(&self, default: &'a str) -> &'a str {
        match self {
            VideoCodec::Default => default,
            VideoCodec::H263 => "h263",
            VideoCodec::H264 => "libx264",
            VideoCodec::Mpeg4Sp => "mpeg4",
            VideoCodec::Vp8 => "libvpx",
            VideoCodec::Hevc => "libx265",
        }
    }
}

/// Microphone track parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioInput {
    /// ffmpeg input format (alsa, pulse, ...)
    pub input_format: String,
    pub device: String,
    pub sample_rate: u32,
}

/// Everything an encoder needs to open a session
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderParams {
    pub output_path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Constant output rate, `None` when frames arrive uncapped
    pub frame_rate: Option<u32>,
    pub video_bitrate: u32,
    pub codec: String,
    pub audio: Option<AudioInput>,
    /// Filters the encoder applies before encoding (empty when frames arrive finished)
    pub filters: Vec<String>,
}

impl EncoderParams {
    /// Size in bytes of one input frame
    pub fn frame_size(&self) -> usize {
        self.pixel_format.frame_size(self.width, self.height)
    }
}

/// Trait for encoder sessions
pub trait EncoderSink: Send {
    /// Open the session. Must be called before the first frame.
    fn start(&mut self) -> Result<(), EncoderError>;

    /// Queue one frame in the negotiated pixel format
    fn queue_frame(&mut self, data: &[u8], pts: Duration) -> Result<(), EncoderError>;

    /// Flush and close the session, finalizing the output file
    fn finish(&mut self) -> Result<(), EncoderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_index_mapping() {
        assert_eq!(VideoCodec::from_index(2), VideoCodec::H264);
        assert_eq!(VideoCodec::from_index(5), VideoCodec::Hevc);
        assert_eq!(VideoCodec::from_index(42), VideoCodec::Default);
        assert_eq!(VideoCodec::Default.ffmpeg_codec("libopenh264"), "libopenh264");
        assert_eq!(VideoCodec::Vp8.ffmpeg_codec("libx264"), "libvpx");
    }

    #[test]
    fn test_error_exit_codes() {
        assert_eq!(EncoderError::BrokenPipe.exit_code(), exit::BROKEN_PIPE);
        assert_eq!(EncoderError::NotStarted.exit_code(), exit::RENDER_FAILED);
    }
}
