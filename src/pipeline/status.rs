//! Status lines for the controller
//!
//! stdout carries nothing but these lines. Each one is flushed immediately
//! since the controller waits on them.

use std::io::{ErrorKind, Stdout, Write};

use super::exit;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("status output closed")]
    BrokenPipe,

    #[error("failed to write status: {0}")]
    Io(std::io::Error),
}

impl StatusError {
    /// stdout is the connection to the controller, so any failure means it is gone
    pub fn exit_code(&self) -> i32 {
        exit::BROKEN_PIPE
    }
}

impl From<std::io::Error> for StatusError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            ErrorKind::BrokenPipe => StatusError::BrokenPipe,
            _ => StatusError::Io(e),
        }
    }
}

pub struct StatusWriter<W: Write = Stdout> {
    out: W,
}

impl StatusWriter {
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> StatusWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn ready(&mut self) -> Result<(), StatusError> {
        self.line("ready")
    }

    pub fn configured(&mut self) -> Result<(), StatusError> {
        self.line("configured")
    }

    pub fn recording(&mut self) -> Result<(), StatusError> {
        self.line("recording")
    }

    /// Average frame rate over the recording
    pub fn fps(&mut self, fps: f64) -> Result<(), StatusError> {
        self.line(&format!("fps {:.2}", fps))
    }

    fn line(&mut self, line: &str) -> Result<(), StatusError> {
        writeln!(self.out, "{}", line)?;
        self.out.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.out
    }
}
