//! Display capture sources
//!
//! A capture source hands out the current display content as RGBA frames.
//! The device framebuffer is the production source; a synthetic test
//! pattern stands in for it in test mode.

mod frame;
mod framebuffer;
mod pattern;

pub use frame::{Frame, PixelFormat};
pub use framebuffer::FramebufferSource;
pub use pattern::TestPatternSource;

use std::path::PathBuf;
use tracing::info;

use crate::config::CaptureSettings;

/// Errors raised while acquiring or reading the display
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture device unavailable: {path}: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported framebuffer depth: {bits_per_pixel} bits per pixel")]
    UnsupportedDepth { bits_per_pixel: u32 },

    #[error("invalid framebuffer geometry: {0}")]
    InvalidGeometry(String),

    #[error("failed to read frame: {0}")]
    Read(#[from] std::io::Error),

    #[error("capture source already closed")]
    Closed,
}

/// Trait for display capture sources
pub trait CaptureSource: Send {
    /// Short name for diagnostics
    fn name(&self) -> &'static str;

    /// Native display size in pixels
    fn dimensions(&self) -> (u32, u32);

    /// Copy the current display content into `frame` as RGBA.
    /// The frame is resized to [`dimensions`](Self::dimensions) if needed.
    fn capture(&mut self, frame: &mut Frame) -> Result<(), CaptureError>;

    /// Release the underlying device. Further captures fail with [`CaptureError::Closed`].
    fn close(&mut self);
}

/// Open the capture source for this run
pub fn open_capture_source(
    settings: &CaptureSettings,
    test_mode: bool,
) -> Result<Box<dyn CaptureSource>, CaptureError> {
    if test_mode {
        info!("Test mode: using synthetic test pattern");
        return Ok(Box::new(TestPatternSource::default()));
    }

    let source = FramebufferSource::open(&settings.framebuffer_device, &settings.framebuffer_sysfs)?;
    info!(
        "Using framebuffer capture {:?} ({}x{})",
        settings.framebuffer_device,
        source.dimensions().0,
        source.dimensions().1
    );
    Ok(Box::new(source))
}

/// Make sure `frame` is an RGBA buffer of the given size
pub(crate) fn ensure_rgba(frame: &mut Frame, width: u32, height: u32) {
    if frame.width != width || frame.height != height || frame.format != PixelFormat::Rgba {
        *frame = Frame::new(width, height, PixelFormat::Rgba);
    }
}
