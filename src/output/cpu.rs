//! CPU pixel-copy backend
//!
//! Captures into a local buffer, runs the software [`Transform`] and queues
//! the converted frame on the encoder.

use tracing::{error, info};

use super::{BackendError, OutputBackend, PresentationClock, Transform};
use crate::capture::{CaptureSource, Frame, PixelFormat};
use crate::encoder::EncoderSink;

pub struct CpuBackend {
    transform: Transform,
    encoder: Box<dyn EncoderSink>,
    capture: Frame,
    output: Frame,
    clock: PresentationClock,
    frames: u64,
    encoding: bool,
    closed: bool,
}

impl CpuBackend {
    pub fn new(transform: Transform, encoder: Box<dyn EncoderSink>) -> Self {
        let output = transform.output_frame();
        Self {
            transform,
            encoder,
            capture: Frame::new(0, 0, PixelFormat::Rgba),
            output,
            clock: PresentationClock::default(),
            frames: 0,
            encoding: false,
            closed: false,
        }
    }
}

impl OutputBackend for CpuBackend {
    fn name(&self) -> &'static str {
        "cpu"
    }

    fn setup_output(&mut self) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        self.encoder.start().map_err(BackendError::EncoderSession)?;
        self.encoding = true;

        let geometry = self.transform.geometry();
        info!(
            "CPU output ready: {}x{} {:?}",
            geometry.video_width,
            geometry.video_height,
            self.transform.format()
        );
        Ok(())
    }

    fn render_frame(&mut self, input: &mut dyn CaptureSource) -> Result<(), BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        input.capture(&mut self.capture)?;
        self.transform.apply(&self.capture, &mut self.output);
        self.encoder.queue_frame(&self.output.data, self.clock.next())?;
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
                error!("Encoder did not finish cleanly: {}", e);
            }
            self.encoding = false;
        }
        info!("CPU output closed after {} frames", self.frames);
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::FrameGeometry;
    use crate::pipeline::{exit, PipelineConfig, Rotation};
    use crate::test_support::{EventLog, MockEncoder, MockSource};

    fn backend(encoder: MockEncoder, format: PixelFormat) -> CpuBackend {
        let config = PipelineConfig {
            rotation: Rotation::Deg90,
            ..PipelineConfig::default()
        };
        let geometry = FrameGeometry::resolve(4, 2, &config);
        CpuBackend::new(Transform::new(geometry, format), Box::new(encoder))
    }

    #[test]
    fn test_frames_are_converted_before_queueing() {
        let log = EventLog::default();
        let encoder = MockEncoder::new(&log);
        let mut cpu = backend(encoder.clone(), PixelFormat::Nv12);
        let mut source = MockSource::new(&log, 4, 2);

        cpu.setup_output().unwrap();
        cpu.render_frame(&mut source).unwrap();
        cpu.render_frame(&mut source).unwrap();
        cpu.close_output(true);

        let frames = encoder.frames();
        assert_eq!(frames.len(), 2);
        // Rotated to 2x4, NV12
        assert_eq!(frames[0].len(), PixelFormat::Nv12.frame_size(2, 4));
        let pts = encoder.timestamps();
        assert!(pts[1] >= pts[0]);
        assert_eq!(cpu.frame_count(), 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let log = EventLog::default();
        let mut cpu = backend(MockEncoder::new(&log), PixelFormat::Rgba);
        cpu.setup_output().unwrap();
        cpu.close_output(true);
        cpu.close_output(false);
        assert_eq!(log.count("encoder.finish"), 1);
    }

    #[test]
    fn test_failed_start_skips_finish() {
        let log = EventLog::default();
        let mut cpu = backend(MockEncoder::new(&log).failing_start(), PixelFormat::Rgba);
        let err = cpu.setup_output().unwrap_err();
        assert_eq!(err.exit_code(), exit::ENCODER_SESSION_FAILED);
        cpu.close_output(true);
        assert_eq!(log.count("encoder.finish"), 0);
    }

    #[test]
    fn test_closed_capture_is_capture_error() {
        let log = EventLog::default();
        let mut cpu = backend(MockEncoder::new(&log), PixelFormat::Rgba);
        let mut source = MockSource::new(&log, 4, 2);
        cpu.setup_output().unwrap();
        source.close();
        let err = cpu.render_frame(&mut source).unwrap_err();
        assert_eq!(err.exit_code(), exit::CAPTURE_SURFACE_FAILED);
    }
}
