//! GPU-composited backend
//!
//! Setup order: display connection, encoder session, window surface,
//! shader program. Teardown runs in reverse.

use tracing::{debug, error, info, warn};

use super::{BackendError, FrameGeometry, OutputBackend, PresentationClock, RenderContext, ShaderProgram};
use crate::capture::{CaptureSource, Frame, PixelFormat};
use crate::encoder::EncoderSink;

pub struct GpuBackend {
    geometry: FrameGeometry,
    program: ShaderProgram,
    context: Box<dyn RenderContext>,
    encoder: Box<dyn EncoderSink>,
    capture: Frame,
    clock: PresentationClock,
    frames: u64,
    connected: bool,
    encoding: bool,
    has_surface: bool,
    closed: bool,
}

impl GpuBackend {
    pub fn new(
        geometry: FrameGeometry,
        program: ShaderProgram,
        context: Box<dyn RenderContext>,
        encoder: Box<dyn EncoderSink>,
    ) -> Self {
        Self {
            geometry,
            program,
            context,
            encoder,
            capture: Frame::new(0, 0, PixelFormat::Rgba),
            clock: PresentationClock::default(),
            frames: 0,
            connected: false,
            encoding: false,
            has_surface: false,
            closed: false,
        }
    }
}

impl OutputBackend for GpuBackend {
    fn name(&self) -> &'static str {
        "gpu"
    }

    fn setup_output(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }

        self.context.connect()?;
        self.connected = true;

        self.encoder.start().map_err(BackendError::EncoderSession)?;
        self.encoding = true;

        self.context
            .create_window_surface(self.geometry.video_width, self.geometry.video_height)?;
        self.has_surface = true;

        self.context.use_program(&self.program, self.geometry)?;

        info!(
            "GPU output ready: {}x{} with program {}",
            self.geometry.video_width, self.geometry.video_height, self.program.name
        );
        Ok(())
    }

    fn render_frame(&mut self, input: &mut dyn CaptureSource) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }

        input.capture(&mut self.capture)?;
        self.context.draw(&self.capture)?;
        let pts = self.clock.next();
        self.context.swap_buffers(self.encoder.as_mut(), pts)?;
        self.frames += 1;
        Ok(())
    }

    fn close_output(&mut self, from_main_task: bool) {
        if self.closed {
            debug!("GPU output already closed");
            return;
        }
        self.closed = true;

        // The context is bound to the main task's thread
        let release_context = from_main_task;
        if !release_context {
            warn!("Closing GPU output off the main task, leaving the context to process exit");
        }

        if self.has_surface && release_context {
            self.context.destroy_surface();
            self.has_surface = false;
        }
        if self.encoding {
            if let Err(e) = self.encoder.finish() {
                error!("Encoder did not finish cleanly: {}", e);
            }
            self.encoding = false;
        }
        if self.connected && release_context {
            self.context.disconnect();
            self.connected = false;
        }
        info!("GPU output closed after {} frames", self.frames);
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }
}
