//! Test doubles shared by the unit tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::capture::{CaptureError, CaptureSource, Frame, PixelFormat};
use crate::encoder::{EncoderError, EncoderSink};
use crate::output::{BackendError, FrameGeometry, OutputBackend, RasterError, RenderContext, ShaderProgram, Transform};

/// Ordered record of calls made on the doubles
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: impl Into<String>) {
        self.0.lock().unwrap().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|e| *e == event).count()
    }

    /// Events other than per-frame calls
    pub fn lifecycle(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| !e.ends_with(".capture") && !e.ends_with(".render"))
            .collect()
    }
}

/// Encoder sink that keeps every queued frame
#[derive(Clone)]
pub struct MockEncoder {
    log: EventLog,
    frames: Arc<Mutex<Vec<(Vec<u8>, Duration)>>>,
    fail_start: bool,
    broken_pipe_after: Option<usize>,
}

impl MockEncoder {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            frames: Arc::default(),
            fail_start: false,
            broken_pipe_after: None,
        }
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    /// Report a broken pipe once `frames` frames were accepted
    pub fn broken_pipe_after(mut self, frames: usize) -> Self {
        self.broken_pipe_after = Some(frames);
        self
    }

    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().unwrap().iter().map(|(f, _)| f.clone()).collect()
    }

    pub fn timestamps(&self) -> Vec<Duration> {
        self.frames.lock().unwrap().iter().map(|(_, pts)| *pts).collect()
    }
}

impl EncoderSink for MockEncoder {
    fn start(&mut self) -> Result<(), EncoderError> {
        self.log.push("encoder.start");
        if self.fail_start {
            return Err(EncoderError::Spawn {
                program: "mock-encoder".into(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        Ok(())
    }

    fn queue_frame(&mut self, data: &[u8], pts: Duration) -> Result<(), EncoderError> {
        let mut frames = self.frames.lock().unwrap();
        if self.broken_pipe_after.is_some_and(|n| frames.len() >= n) {
            return Err(EncoderError::BrokenPipe);
        }
        frames.push((data.to_vec(), pts));
        Ok(())
    }

    fn finish(&mut self) -> Result<(), EncoderError> {
        self.log.push("encoder.finish");
        Ok(())
    }
}

/// Capture source producing a solid colour
pub struct MockSource {
    log: EventLog,
    width: u32,
    height: u32,
    color: [u8; 4],
    closed: bool,
}

impl MockSource {
    pub fn new(log: &EventLog, width: u32, height: u32) -> Self {
        Self {
            log: log.clone(),
            width,
            height,
            color: [200, 100, 50, 255],
            closed: false,
        }
    }
}

impl CaptureSource for MockSource {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn capture(&mut self, frame: &mut Frame) -> Result<(), CaptureError> {
        if self.closed {
            return Err(CaptureError::Closed);
        }
        self.log.push("source.capture");
        *frame = Frame::new(self.width, self.height, PixelFormat::Rgba);
        for px in frame.data.chunks_exact_mut(4) {
            px.copy_from_slice(&self.color);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.closed = true;
        self.log.push("source.close");
    }
}

/// Render context that runs the program's transform on the CPU
#[derive(Default)]
pub struct SoftRaster {
    connected: bool,
    surface: Option<Frame>,
    transform: Option<Transform>,
}

impl RenderContext for SoftRaster {
    fn connect(&mut self) -> Result<(), RasterError> {
        self.connected = true;
        Ok(())
    }

    fn create_window_surface(&mut self, width: u32, height: u32) -> Result<(), RasterError> {
        if !self.connected {
            return Err(RasterError::Connection("not connected".to_string()));
        }
        self.surface = Some(Frame::new(width, height, PixelFormat::Rgba));
        Ok(())
    }

    fn use_program(&mut self, program: &ShaderProgram, geometry: FrameGeometry) -> Result<(), RasterError> {
        let surface = self.surface.as_mut().ok_or(RasterError::NotReady("no surface"))?;
        let transform = Transform::new(geometry, program.output_format);
        *surface = transform.output_frame();
        self.transform = Some(transform);
        Ok(())
    }

    fn draw(&mut self, input: &Frame) -> Result<(), RasterError> {
        let (Some(surface), Some(transform)) = (self.surface.as_mut(), self.transform.as_mut()) else {
            return Err(RasterError::NotReady("no program bound"));
        };
        transform.apply(input, surface);
        Ok(())
    }

    fn swap_buffers(&mut self, sink: &mut dyn EncoderSink, pts: Duration) -> Result<(), RasterError> {
        let surface = self.surface.as_ref().ok_or(RasterError::NotReady("no surface"))?;
        sink.queue_frame(&surface.data, pts)?;
        Ok(())
    }

    fn destroy_surface(&mut self) {
        self.transform = None;
        self.surface = None;
    }

    fn disconnect(&mut self) {
        self.connected = false;
    }
}

/// Software render context that records its lifecycle calls
pub struct MockContext {
    log: EventLog,
    inner: SoftRaster,
    fail_connect: bool,
}

impl MockContext {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            inner: SoftRaster::default(),
            fail_connect: false,
        }
    }

    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }
}

impl RenderContext for MockContext {
    fn connect(&mut self) -> Result<(), RasterError> {
        self.log.push("context.connect");
        if self.fail_connect {
            return Err(RasterError::Connection("no display".to_string()));
        }
        self.inner.connect()
    }

    fn create_window_surface(&mut self, width: u32, height: u32) -> Result<(), RasterError> {
        self.log.push("context.create_surface");
        self.inner.create_window_surface(width, height)
    }

    fn use_program(&mut self, program: &ShaderProgram, geometry: FrameGeometry) -> Result<(), RasterError> {
        self.inner.use_program(program, geometry)
    }

    fn draw(&mut self, input: &Frame) -> Result<(), RasterError> {
        self.inner.draw(input)
    }

    fn swap_buffers(&mut self, sink: &mut dyn EncoderSink, pts: Duration) -> Result<(), RasterError> {
        self.inner.swap_buffers(sink, pts)
    }

    fn destroy_surface(&mut self) {
        self.log.push("context.destroy_surface");
        self.inner.destroy_surface();
    }

    fn disconnect(&mut self) {
        self.log.push("context.disconnect");
        self.inner.disconnect();
    }
}

type RenderHook = Box<dyn FnMut(u64) -> Result<(), BackendError> + Send>;

/// Output backend that only records calls. `on_render` runs inside every
/// `render_frame` with the number of frames rendered so far.
pub struct MockBackend {
    log: EventLog,
    fail_setup: bool,
    on_render: Option<RenderHook>,
    frames: u64,
}

impl MockBackend {
    pub fn new(log: &EventLog) -> Self {
        Self {
            log: log.clone(),
            fail_setup: false,
            on_render: None,
            frames: 0,
        }
    }

    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    pub fn on_render(mut self, hook: impl FnMut(u64) -> Result<(), BackendError> + Send + 'static) -> Self {
        self.on_render = Some(Box::new(hook));
        self
    }
}

impl OutputBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn setup_output(&mut self) -> Result<(), BackendError> {
        self.log.push("backend.setup");
        if self.fail_setup {
            return Err(BackendError::EncoderSession(EncoderError::NotStarted));
        }
        Ok(())
    }

    fn render_frame(&mut self, input: &mut dyn CaptureSource) -> Result<(), BackendError> {
        self.log.push("backend.render");
        let mut frame = Frame::new(0, 0, PixelFormat::Rgba);
        input.capture(&mut frame)?;
        if let Some(hook) = self.on_render.as_mut() {
            hook(self.frames)?;
        }
        self.frames += 1;
        Ok(())
    }

    fn close_output(&mut self, from_main_task: bool) {
        self.log.push(format!("backend.close(main={})", from_main_task));
    }

    fn frame_count(&self) -> u64 {
        self.frames
    }
}
