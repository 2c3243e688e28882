//! Output backends
//!
//! An output backend owns the capture-to-encoder path for one rendering
//! strategy. Exactly one backend is built per recording, chosen from the
//! configuration before the first frame, and it is never switched.

mod cpu;
mod external;
mod geometry;
mod gpu;
mod raster;
mod transform;
mod wgpu_context;

pub use cpu::CpuBackend;
pub use external::ExternalBackend;
pub use geometry::FrameGeometry;
pub use gpu::GpuBackend;
pub use raster::{RasterError, RenderContext, ShaderProgram};
pub use transform::{output_format, Transform};
pub use wgpu_context::WgpuContext;

use std::time::{Duration, Instant};
use tracing::info;

use crate::capture::{CaptureError, CaptureSource, PixelFormat};
use crate::config::Settings;
use crate::encoder::{self, AudioInput, EncoderError, EncoderParams, FfmpegCommandBuilder, FfmpegSession};
use crate::pipeline::{exit, AudioSource, EncoderKind, PipelineConfig};

/// Errors raised by an output backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Raster(#[from] RasterError),

    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoder session failed: {0}")]
    EncoderSession(#[source] EncoderError),

    #[error(transparent)]
    Encoder(#[from] EncoderError),

    #[error("unsupported encoder: {0}")]
    UnsupportedEncoder(String),

    #[error("output already closed")]
    Closed,
}

impl BackendError {
    /// Exit code when this error ends the recording
    pub fn exit_code(&self) -> i32 {
        match self {
            BackendError::Raster(e) => e.exit_code(),
            BackendError::Capture(_) => exit::CAPTURE_SURFACE_FAILED,
            BackendError::EncoderSession(EncoderError::BrokenPipe) => exit::BROKEN_PIPE,
            BackendError::EncoderSession(_) => exit::ENCODER_SESSION_FAILED,
            BackendError::Encoder(e) => e.exit_code(),
            BackendError::UnsupportedEncoder(_) => exit::UNSUPPORTED_ENCODER,
            BackendError::Closed => exit::RENDER_FAILED,
        }
    }
}

/// Trait for output backends
pub trait OutputBackend: Send {
    fn name(&self) -> &'static str;

    /// Acquire the display connection, encoder session and surfaces.
    /// Any failure is fatal; nothing is left half-acquired that
    /// [`close_output`](Self::close_output) cannot release.
    fn setup_output(&mut self) -> Result<(), BackendError>;

    /// Capture, transform and queue one frame
    fn render_frame(&mut self, input: &mut dyn CaptureSource) -> Result<(), BackendError>;

    /// Release everything in reverse acquisition order. Only the first call
    /// has an effect. Context-bound resources are released only when
    /// `from_main_task` is set.
    fn close_output(&mut self, from_main_task: bool);

    /// Frames rendered so far
    fn frame_count(&self) -> u64;
}

/// Presentation timestamps relative to the first rendered frame
#[derive(Debug, Default)]
pub(crate) struct PresentationClock {
    started: Option<Instant>,
}

impl PresentationClock {
    pub(crate) fn next(&mut self) -> Duration {
        let started = *self.started.get_or_insert_with(Instant::now);
        started.elapsed()
    }
}

/// Create the output backend for a configuration
pub fn create_output_backend(
    config: &PipelineConfig,
    geometry: FrameGeometry,
    settings: &Settings,
) -> Result<Box<dyn OutputBackend>, BackendError> {
    let program = &settings.encoder.ffmpeg_path;
    let default_codec = settings.encoder.default_codec.as_str();

    match config.encoder_kind() {
        EncoderKind::External => {
            if !encoder::is_available(program) {
                return Err(BackendError::UnsupportedEncoder(format!(
                    "no in-process encoder requested and {:?} is not runnable",
                    program
                )));
            }
            let params = encoder_params(
                config,
                settings,
                default_codec,
                (geometry.source_width, geometry.source_height),
                PixelFormat::Rgba,
                external::filters(&geometry),
            );
            info!("Using external encoder backend ({})", params.codec);
            let builder = FfmpegCommandBuilder::new(params).with_preset(preset_for(settings, default_codec));
            Ok(Box::new(ExternalBackend::new(Box::new(FfmpegSession::new(program, &builder)))))
        }
        EncoderKind::Session(codec) => {
            let codec = codec.ffmpeg_codec(default_codec);
            let size = (geometry.video_width, geometry.video_height);

            if config.strategy.uses_gpu() {
                let shader = ShaderProgram::for_config(config);
                let params = encoder_params(config, settings, codec, size, shader.output_format, Vec::new());
                info!("Using GPU backend, program {} ({})", shader.name, codec);
                let builder = FfmpegCommandBuilder::new(params).with_preset(preset_for(settings, codec));
                Ok(Box::new(GpuBackend::new(
                    geometry,
                    shader,
                    Box::new(WgpuContext::new()),
                    Box::new(FfmpegSession::new(program, &builder)),
                )))
            } else {
                let format = output_format(config);
                let params = encoder_params(config, settings, codec, size, format, Vec::new());
                info!("Using CPU backend, {:?} ({})", format, codec);
                let builder = FfmpegCommandBuilder::new(params).with_preset(preset_for(settings, codec));
                Ok(Box::new(CpuBackend::new(
                    Transform::new(geometry, format),
                    Box::new(FfmpegSession::new(program, &builder)),
                )))
            }
        }
    }
}

fn encoder_params(
    config: &PipelineConfig,
    settings: &Settings,
    codec: &str,
    (width, height): (u32, u32),
    pixel_format: PixelFormat,
    filters: Vec<String>,
) -> EncoderParams {
    let audio = match config.audio_source {
        AudioSource::Microphone => Some(AudioInput {
            input_format: settings.audio.input_format.clone(),
            device: settings.audio.device.clone(),
            sample_rate: config.audio_sample_rate,
        }),
        AudioSource::Mute => None,
    };

    EncoderParams {
        output_path: config.output_path.clone(),
        width,
        height,
        pixel_format,
        frame_rate: config.restrict_frame_rate.then_some(config.frame_rate),
        video_bitrate: config.video_bitrate,
        codec: codec.to_string(),
        audio,
        filters,
    }
}

/// Speed presets only exist for the x264/x265 encoders
fn preset_for(settings: &Settings, codec: &str) -> Option<String> {
    matches!(codec, "libx264" | "libx265").then(|| settings.encoder.preset.clone())
}
