//! External-process handoff backend
//!
//! Streams the untouched RGBA capture to an external encoder process.
//! Rotation, scaling and padding are done by the encoder's filter chain.

use tracing::{error, info};

use super::{BackendError, FrameGeometry, OutputBackend, PresentationClock};
use crate::capture::{CaptureSource, Frame, PixelFormat};
use crate::encoder::EncoderSink;
use crate::pipeline::Rotation;

/// ffmpeg filter chain reproducing the geometry
pub fn filters(geometry: &FrameGeometry) -> Vec<String> {
    let mut chain = Vec::new();
    match geometry.rotation {
        Rotation::Deg0 => {}
        Rotation::Deg90 => chain.push("transpose=clock".to_string()),
        Rotation::Deg180 => chain.push("hflip,vflip".to_string()),
        Rotation::Deg270 => chain.push("transpose=cclock".to_string()),
    }

    if geometry.rotated_source() != (geometry.content_width, geometry.content_height) {
        chain.push(format!(
            "scale={}:{}",
            geometry.content_width, geometry.content_height
        ));
    }

    if (geometry.video_width, geometry.video_height)
        != (geometry.content_width, geometry.content_height)
    {
        let (x, y) = geometry.content_offset();
        chain.push(format!(
            "pad={}:{}:{}:{}:black",
            geometry.video_width, geometry.video_height, x, y
        ));
    }
    chain
}

pub struct ExternalBackend {
    encoder: Box<dyn EncoderSink>,
    capture: Frame,
    clock: PresentationClock,
    frames: u64,
    encoding: bool,
    closed: bool,
}

impl ExternalBackend {
    pub fn new(encoder: Box<dyn EncoderSink>) -> Self {
        Self {
            encoder,
            capture: Frame::new(0, 0, PixelFormat::Rgba),
            clock: PresentationClock::default(),
            frames: 0,
            encoding: false,
            closed: false,
        }
    }
}

impl OutputBackend for ExternalBackend {
    fn name(&self) -> &'static str {
        "external"
    }

    fn setup_output(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.encoder.start().map_err(BackendError::EncoderSession)?;
        self.encoding = true;
        info!("External encoder running");
        Ok(())
    }

    fn render_frame(&mut self, input: &mut dyn CaptureSource) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        input.capture(&mut self.capture)?;
        self.encoder.queue_frame(&self.capture.data, self.clock.next())?;
        self.frames += 1;
        Ok(())
    }

    fn close_output(&mut self, _from_main_task: bool) {
        if self.closed {
            return;
        }
        self.closed = true;

        if self.encoding {
            if let Err(e) = self.encoder.finish() {
                error!("External encoder did not finish cleanly: {}", e);
            }
            self.encoding = false;
        }
        info!("External output closed after {} frames", self.frames);
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }
}
