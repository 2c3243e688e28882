//! Recording driver
//!
//! The [`Recorder`] is the main task's context object. It owns the capture
//! source, the output backend and the command listener; other tasks only
//! reach it through the shared [`LifecycleController`].
//!
//! Order of a run: open capture, resolve geometry, build and set up the
//! backend, start the listener, print `recording`, then pace and render
//! until stopped. Teardown closes the output before the input, releases
//! the listener and reports the average frame rate.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};

use super::{
    exit, CommandChannel, CommandError, FramePacer, LifecycleController, PipelineConfig, StatusError,
    StatusWriter, StopOrigin,
};
use crate::capture::{self, CaptureError, CaptureSource};
use crate::config::Settings;
use crate::output::{self, BackendError, FrameGeometry, OutputBackend};

/// Errors that end a recording
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("capture unavailable: {0}")]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Status(#[from] StatusError),
}

impl RecorderError {
    pub fn exit_code(&self) -> i32 {
        match self {
            RecorderError::Capture(_) => exit::CAPTURE_SURFACE_FAILED,
            RecorderError::Backend(e) => e.exit_code(),
            RecorderError::Command(e) => e.exit_code(),
            RecorderError::Status(e) => e.exit_code(),
        }
    }
}

/// Builds the capture source and output backend for a recording
pub trait PipelineFactory {
    fn open_capture(&self) -> Result<Box<dyn CaptureSource>, CaptureError>;

    fn create_backend(
        &self,
        config: &PipelineConfig,
        geometry: FrameGeometry,
    ) -> Result<Box<dyn OutputBackend>, BackendError>;
}

/// Factory for the real devices
pub struct DeviceFactory<'a> {
    pub settings: &'a Settings,
    pub test_mode: bool,
}

impl PipelineFactory for DeviceFactory<'_> {
    fn open_capture(&self) -> Result<Box<dyn CaptureSource>, CaptureError> {
        capture::open_capture_source(&self.settings.capture, self.test_mode)
    }

    fn create_backend(
        &self,
        config: &PipelineConfig,
        geometry: FrameGeometry,
    ) -> Result<Box<dyn OutputBackend>, BackendError> {
        output::create_output_backend(config, geometry, self.settings)
    }
}

pub struct Recorder<W: Write> {
    config: PipelineConfig,
    controller: Arc<LifecycleController>,
    status: StatusWriter<W>,
    pacer: FramePacer,
    input: Option<Box<dyn CaptureSource>>,
    backend: Option<Box<dyn OutputBackend>>,
    listener: Option<CommandChannel>,
    started_at: Option<Instant>,
    frames: u64,
}

impl<W: Write> Recorder<W> {
    pub fn new(config: PipelineConfig, controller: Arc<LifecycleController>, status: StatusWriter<W>) -> Self {
        let pacer = FramePacer::for_config(&config);
        Self {
            config,
            controller,
            status,
            pacer,
            input: None,
            backend: None,
            listener: None,
            started_at: None,
            frames: 0,
        }
    }

    /// Record until stopped. Returns the process exit code.
    pub fn run<F, R>(mut self, factory: &F, control_input: R) -> i32
    where
        F: PipelineFactory,
        R: AsyncRead + Unpin + Send + 'static,
    {
        match self.prepare(factory, control_input) {
            Ok(()) => {
                debug!("Setup finished, starting render loop");
                self.render_loop();
                if !self.controller.is_stopping() {
                    self.request_stop(exit::SUCCESS, "finished");
                }
            }
            Err(e) => self.request_stop(e.exit_code(), &e.to_string()),
        }
        self.finish()
    }

    fn prepare<F, R>(&mut self, factory: &F, control_input: R) -> Result<(), RecorderError>
    where
        F: PipelineFactory,
        R: AsyncRead + Unpin + Send + 'static,
    {
        if self.controller.is_stopping() {
            info!("Stop requested before setup");
            return Ok(());
        }

        let input = self.input.insert(factory.open_capture()?);
        let (width, height) = input.dimensions();
        let geometry = FrameGeometry::resolve(width, height, &self.config);
        info!(
            "Capturing {} at {}x{}, encoding {}x{} (content {}x{}, rotation {})",
            input.name(),
            width,
            height,
            geometry.video_width,
            geometry.video_height,
            geometry.content_width,
            geometry.content_height,
            geometry.rotation.degrees()
        );

        // A signal may have arrived while the capture was opening
        if self.controller.is_stopping() {
            info!("Stop requested during setup, skipping output");
            return Ok(());
        }

        // Stored before setup so a partial setup is still closed
        let backend = self
            .backend
            .insert(factory.create_backend(&self.config, geometry)?);
        backend.setup_output()?;

        self.listener = Some(CommandChannel::start(control_input, Arc::clone(&self.controller))?);

        if !self.controller.mark_running() {
            info!("Stop requested during setup");
            return Ok(());
        }

        self.status.recording()?;
        self.started_at = Some(Instant::now());
        Ok(())
    }

    fn render_loop(&mut self) {
        loop {
            if !self.controller.should_render() {
                break;
            }
            self.pacer.wait_for_next_frame();
            // A stop may have arrived while sleeping
            if !self.controller.should_render() {
                break;
            }

            let (Some(backend), Some(input)) = (self.backend.as_mut(), self.input.as_mut()) else {
                break;
            };
            if let Err(e) = backend.render_frame(&mut **input) {
                self.request_stop(e.exit_code(), &e.to_string());
                break;
            }
        }
    }

    fn request_stop(&mut self, code: i32, message: &str) {
        self.controller.request_stop(code, StopOrigin::Main, message);
        self.teardown();
    }

    /// Close the output, then the input. Safe to call any number of times.
    fn teardown(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            self.frames = backend.frame_count();
            backend.close_output(true);
        }
        if let Some(mut input) = self.input.take() {
            input.close();
        }
    }

    fn finish(mut self) -> i32 {
        self.teardown();
        if let Some(mut listener) = self.listener.take() {
            listener.interrupt();
        }
        self.controller.mark_stopped();

        if self.frames > 0 {
            normalize_permissions(&self.config.output_path);
        }

        if let Some(started_at) = self.started_at {
            let seconds = started_at.elapsed().as_secs_f64();
            let fps = if seconds > 0.0 { self.frames as f64 / seconds } else { 0.0 };
            info!("Recorded {} frames in {:.1}s", self.frames, seconds);
            if let Err(e) = self.status.fps(fps) {
                self.controller
                    .request_stop(e.exit_code(), StopOrigin::Main, &e.to_string());
            }
        }

        self.controller.exit_code()
    }
}

/// Make the recording readable by other users
#[cfg(unix)]
fn normalize_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644)) {
        warn!("Failed to set permissions on {:?}: {}", path, e);
    }
}

#[cfg(not(unix))]
fn normalize_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{EventLog, MockBackend, MockSource};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    type BackendBuilder = Box<dyn Fn(&EventLog) -> MockBackend>;

    struct MockFactory {
        log: EventLog,
        capture_fails: bool,
        stop_on_capture: Option<Arc<LifecycleController>>,
        backend: Mutex<Option<BackendBuilder>>,
        geometry: Mutex<Option<FrameGeometry>>,
    }

    impl MockFactory {
        fn new(log: &EventLog) -> Self {
            Self {
                log: log.clone(),
                capture_fails: false,
                stop_on_capture: None,
                backend: Mutex::new(None),
                geometry: Mutex::new(None),
            }
        }

        fn with_backend(self, build: impl Fn(&EventLog) -> MockBackend + 'static) -> Self {
            *self.backend.lock().unwrap() = Some(Box::new(build));
            self
        }
    }

    impl PipelineFactory for MockFactory {
        fn open_capture(&self) -> Result<Box<dyn CaptureSource>, CaptureError> {
            if self.capture_fails {
                return Err(CaptureError::InvalidGeometry("0,0".to_string()));
            }
            if let Some(controller) = &self.stop_on_capture {
                controller.request_stop(exit::TERMINATED, StopOrigin::Signal, "signal");
            }
            Ok(Box::new(MockSource::new(&self.log, 8, 4)))
        }

        fn create_backend(
            &self,
            _config: &PipelineConfig,
            geometry: FrameGeometry,
        ) -> Result<Box<dyn OutputBackend>, BackendError> {
            *self.geometry.lock().unwrap() = Some(geometry);
            let backend = match self.backend.lock().unwrap().as_ref() {
                Some(build) => build(&self.log),
                None => MockBackend::new(&self.log),
            };
            Ok(Box::new(backend))
        }
    }

    fn uncapped() -> PipelineConfig {
        PipelineConfig {
            restrict_frame_rate: false,
            ..PipelineConfig::default()
        }
    }

    /// Control input that never delivers an instruction while the first
    /// half is kept alive
    fn silent_input() -> (tokio::io::DuplexStream, tokio::io::DuplexStream) {
        tokio::io::duplex(16)
    }

    fn recorder(controller: &Arc<LifecycleController>) -> Recorder<Vec<u8>> {
        Recorder::new(uncapped(), Arc::clone(controller), StatusWriter::new(Vec::new()))
    }

    #[test]
    fn test_backend_stop_ends_loop_with_success() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let remote = Arc::clone(&controller);
        let factory = MockFactory::new(&log).with_backend(move |log| {
            let remote = Arc::clone(&remote);
            MockBackend::new(log).on_render(move |frames| {
                if frames == 4 {
                    remote.request_stop(exit::SUCCESS, StopOrigin::Command, "enough");
                }
                Ok(())
            })
        });

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);

        assert_eq!(code, exit::SUCCESS);
        assert_eq!(log.count("backend.render"), 5);
        assert_eq!(
            log.lifecycle(),
            ["backend.setup", "backend.close(main=true)", "source.close"]
        );
        assert_eq!(controller.state(), crate::pipeline::lifecycle::LifecycleState::Stopped);
    }

    #[test]
    fn test_no_render_after_finished() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let remote = Arc::clone(&controller);
        let factory = MockFactory::new(&log).with_backend(move |log| {
            let remote = Arc::clone(&remote);
            MockBackend::new(log).on_render(move |frames| {
                if frames == 2 {
                    remote.mark_finished();
                }
                Ok(())
            })
        });

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);

        assert_eq!(code, exit::SUCCESS);
        assert_eq!(log.count("backend.render"), 3);
        assert_eq!(
            controller.exit_status().map(|s| s.reporter),
            Some(StopOrigin::Main)
        );
    }

    #[test]
    fn test_control_input_stops_recording() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let factory = MockFactory::new(&log);

        let code = recorder(&controller).run(&factory, &b"stop\n"[..]);

        assert_eq!(code, exit::SUCCESS);
        assert!(controller.is_finished());
        assert_eq!(log.count("backend.close(main=true)"), 1);
    }

    #[test]
    fn test_render_failure_sets_exit_code() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let factory = MockFactory::new(&log).with_backend(|log| {
            MockBackend::new(log).on_render(|frames| {
                if frames == 1 {
                    return Err(BackendError::Encoder(crate::encoder::EncoderError::BrokenPipe));
                }
                Ok(())
            })
        });

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);

        assert_eq!(code, exit::BROKEN_PIPE);
        assert_eq!(log.count("backend.render"), 2);
        assert_eq!(log.count("backend.close(main=true)"), 1);
        assert_eq!(log.count("source.close"), 1);
    }

    #[test]
    fn test_setup_failure_closes_once() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let factory = MockFactory::new(&log).with_backend(|log| MockBackend::new(log).failing_setup());

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);

        assert_eq!(code, exit::ENCODER_SESSION_FAILED);
        assert_eq!(log.count("backend.render"), 0);
        assert_eq!(
            log.lifecycle(),
            ["backend.setup", "backend.close(main=true)", "source.close"]
        );
    }

    #[test]
    fn test_capture_failure() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let mut factory = MockFactory::new(&log);
        factory.capture_fails = true;

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);

        assert_eq!(code, exit::CAPTURE_SURFACE_FAILED);
        assert!(log.events().is_empty());
        assert!(factory.geometry.lock().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_stops_close_exactly_once() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let remote = Arc::clone(&controller);
        let started = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&started);

        let factory = MockFactory::new(&log).with_backend(move |log| {
            let flag = Arc::clone(&flag);
            MockBackend::new(log).on_render(move |_| {
                flag.store(true, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(1));
                Ok(())
            })
        });

        let stoppers = std::thread::spawn(move || {
            while !started.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(1));
            }
            let handles: Vec<_> = [(0, StopOrigin::Command), (5, StopOrigin::Signal), (7, StopOrigin::Other)]
                .into_iter()
                .map(|(code, origin)| {
                    let remote = Arc::clone(&remote);
                    std::thread::spawn(move || remote.request_stop(code, origin, "race"))
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&factory, input);
        stoppers.join().unwrap();

        assert_ne!(code, exit::SUCCESS);
        assert_eq!(log.count("backend.close(main=true)"), 1);
        assert_eq!(log.count("source.close"), 1);
    }

    #[test]
    fn test_stop_before_running_skips_loop() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        controller.request_stop(exit::TERMINATED, StopOrigin::Signal, "signal");

        let (_control, input) = silent_input();
        let code = recorder(&controller).run(&MockFactory::new(&log), input);

        assert_eq!(code, exit::TERMINATED);
        assert!(log.events().is_empty());
    }

    #[test]
    fn test_stop_during_capture_open_skips_output() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let mut factory = MockFactory::new(&log);
        factory.stop_on_capture = Some(Arc::clone(&controller));

        let (_control, input) = silent_input();
        let mut recorder = recorder(&controller);
        recorder.prepare(&factory, input).unwrap();
        assert!(recorder.backend.is_none());
        assert!(recorder.listener.is_none());

        let code = recorder.finish();
        assert_eq!(code, exit::TERMINATED);
        assert!(factory.geometry.lock().unwrap().is_none());
        assert_eq!(log.lifecycle(), ["source.close"]);
    }

    #[test]
    fn test_status_and_geometry() {
        let log = EventLog::default();
        let controller = Arc::new(LifecycleController::new());
        let remote = Arc::clone(&controller);
        let factory = MockFactory::new(&log).with_backend(move |log| {
            let remote = Arc::clone(&remote);
            MockBackend::new(log).on_render(move |_| {
                remote.mark_finished();
                Ok(())
            })
        });

        let mut recorder = recorder(&controller);
        recorder.config.rotation = crate::pipeline::Rotation::Deg90;
        let (_control, input) = silent_input();
        recorder.prepare(&factory, input).unwrap();
        recorder.render_loop();
        recorder.request_stop(exit::SUCCESS, "finished");

        let status = String::from_utf8_lossy(recorder.status.get_ref()).to_string();
        assert_eq!(status, "recording\n");
        let geometry = factory.geometry.lock().unwrap().unwrap();
        assert_eq!((geometry.video_width, geometry.video_height), (4, 8));

        recorder.finish();
    }
}
