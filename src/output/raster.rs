//! Render contexts for the GPU-composited backend
//!
//! A [`RenderContext`] owns the display connection and the encoder-backed
//! window surface. It draws each captured frame through a [`ShaderProgram`]
//! and hands the finished surface to the encoder on `swap_buffers`.

use std::time::Duration;

use crate::capture::{Frame, PixelFormat};
use crate::encoder::{EncoderError, EncoderSink};
use crate::pipeline::{exit, ColorFormat, PipelineConfig, RenderStrategy};

use super::FrameGeometry;

/// Errors raised by a render context
#[derive(Debug, thiserror::Error)]
pub enum RasterError {
    #[error("display connection failed: {0}")]
    Connection(String),

    #[error("window surface unavailable: {0}")]
    Surface(String),

    #[error("shader program {name} rejected: {reason}")]
    Program { name: &'static str, reason: String },

    #[error("render context not ready: {0}")]
    NotReady(&'static str),

    #[error("render failed: {0}")]
    Render(String),

    #[error(transparent)]
    Encoder(#[from] EncoderError),
}

impl RasterError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RasterError::Connection(_) => exit::DISPLAY_CONNECTION_FAILED,
            RasterError::Surface(_) => exit::CAPTURE_SURFACE_FAILED,
            RasterError::Program { .. } | RasterError::NotReady(_) | RasterError::Render(_) => {
                exit::RENDER_FAILED
            }
            RasterError::Encoder(e) => e.exit_code(),
        }
    }
}

/// Vertex stage and every fragment stage, one entry point per transform
const COMPOSE_SHADER: &str = include_str!("compose.wgsl");

/// A vertex/fragment program pair and the surface format it renders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShaderProgram {
    pub name: &'static str,
    /// WGSL module holding both entry points
    pub source: &'static str,
    pub vertex_entry: &'static str,
    pub fragment_entry: &'static str,
    pub output_format: PixelFormat,
}

impl ShaderProgram {
    /// Pick the program for a configuration. Fixed for the whole recording.
    pub fn for_config(config: &PipelineConfig) -> Self {
        let (name, fragment_entry, output_format) = match (config.strategy, config.color_format) {
            (_, ColorFormat::Bgra) => ("swapped", "fs_swapped", PixelFormat::Bgra),
            (RenderStrategy::GpuExternalTexture, _) => ("external", "fs_external", PixelFormat::Rgba),
            _ => ("identity", "fs_identity", PixelFormat::Rgba),
        };
        Self {
            name,
            source: COMPOSE_SHADER,
            vertex_entry: "vs_main",
            fragment_entry,
            output_format,
        }
    }
}

/// Trait for GPU render contexts
pub trait RenderContext: Send {
    /// Open the display connection
    fn connect(&mut self) -> Result<(), RasterError>;

    /// Create the window surface the encoder consumes
    fn create_window_surface(&mut self, width: u32, height: u32) -> Result<(), RasterError>;

    /// Compile and bind the program used for every following draw
    fn use_program(&mut self, program: &ShaderProgram, geometry: FrameGeometry) -> Result<(), RasterError>;

    /// Draw one captured RGBA frame into the surface
    fn draw(&mut self, input: &Frame) -> Result<(), RasterError>;

    /// Present the surface to the encoder with the given timestamp
    fn swap_buffers(&mut self, sink: &mut dyn EncoderSink, pts: Duration) -> Result<(), RasterError>;

    fn destroy_surface(&mut self);

    fn disconnect(&mut self);
}
