//! Stop/shutdown state machine
//!
//! The controller is shared between the main task, the command listener
//! and the signal handler. It decides which stop request is the first one,
//! keeps the exit status and releases the listener. Releasing the capture
//! and output resources is left to the main task, which owns them.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::exit;

/// Lifecycle states, in the only order they can be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LifecycleState {
    Configuring = 0,
    Running = 1,
    StoppingRequested = 2,
    Stopped = 3,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Configuring,
            1 => LifecycleState::Running,
            2 => LifecycleState::StoppingRequested,
            _ => LifecycleState::Stopped,
        }
    }
}

/// Where a stop request came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOrigin {
    Main,
    Command,
    Signal,
    Other,
}

impl fmt::Display for StopOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopOrigin::Main => "main",
            StopOrigin::Command => "command",
            StopOrigin::Signal => "signal",
            StopOrigin::Other => "other",
        };
        f.write_str(name)
    }
}

/// Final exit code and whoever reported first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitStatus {
    pub code: i32,
    pub reporter: StopOrigin,
}

pub struct LifecycleController {
    state: AtomicU8,
    finished: AtomicBool,
    status: Mutex<Option<ExitStatus>>,
    listener_cancel: CancellationToken,
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleController {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Configuring as u8),
            finished: AtomicBool::new(false),
            status: Mutex::new(None),
            listener_cancel: CancellationToken::new(),
        }
    }

    /// Request a stop. Returns true for the first request only.
    ///
    /// Later requests only update the exit code: a success code is
    /// replaced by a later failure, a failure code is never replaced.
    pub fn request_stop(&self, code: i32, origin: StopOrigin, message: &str) -> bool {
        if code == exit::SUCCESS {
            info!("{} - stop requested from {}", message, origin);
        } else {
            error!("{} - stop requested from {}: {}", code, origin, message);
        }

        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = status.as_mut() {
            if existing.code == exit::SUCCESS && code != exit::SUCCESS {
                existing.code = code;
            }
            debug!("Already stopping, exit code {}", existing.code);
            return false;
        }

        *status = Some(ExitStatus {
            code,
            reporter: origin,
        });
        self.advance(LifecycleState::StoppingRequested);
        drop(status);

        self.listener_cancel.cancel();
        true
    }

    fn advance(&self, state: LifecycleState) {
        self.state.fetch_max(state as u8, Ordering::SeqCst);
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Configuring -> Running. False if a stop came first.
    pub fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                LifecycleState::Configuring as u8,
                LifecycleState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn mark_stopped(&self) {
        self.advance(LifecycleState::Stopped);
    }

    pub fn is_stopping(&self) -> bool {
        self.state() >= LifecycleState::StoppingRequested
    }

    /// Set by the command listener when it wakes
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Whether the render loop may start another frame
    pub fn should_render(&self) -> bool {
        self.state() == LifecycleState::Running && !self.is_finished()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_status().map_or(exit::SUCCESS, |status| status.code)
    }

    /// Token cancelled on the first stop request
    pub fn listener_token(&self) -> CancellationToken {
        self.listener_cancel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    #[test]
    fn test_first_failure_wins() {
        let controller = LifecycleController::new();
        assert!(controller.request_stop(5, StopOrigin::Main, "first"));
        assert!(!controller.request_stop(0, StopOrigin::Command, "second"));
        assert!(!controller.request_stop(7, StopOrigin::Signal, "third"));
        assert_eq!(controller.exit_code(), 5);
    }

    #[test]
    fn test_success_overwritten_by_failure() {
        let controller = LifecycleController::new();
        controller.request_stop(0, StopOrigin::Command, "finished");
        controller.request_stop(7, StopOrigin::Main, "late failure");
        assert_eq!(
            controller.exit_status(),
            Some(ExitStatus {
                code: 7,
                reporter: StopOrigin::Command
            })
        );
    }

    #[test]
    fn test_state_is_monotonic() {
        let controller = LifecycleController::new();
        assert_eq!(controller.state(), LifecycleState::Configuring);
        assert!(!controller.should_render());

        assert!(controller.mark_running());
        assert!(controller.should_render());

        controller.request_stop(0, StopOrigin::Main, "done");
        assert_eq!(controller.state(), LifecycleState::StoppingRequested);
        assert!(!controller.mark_running());
        assert!(!controller.should_render());

        controller.mark_stopped();
        controller.request_stop(3, StopOrigin::Other, "after stop");
        assert_eq!(controller.state(), LifecycleState::Stopped);
        assert_eq!(controller.exit_code(), 3);
    }

    #[test]
    fn test_stop_before_running() {
        let controller = LifecycleController::new();
        controller.request_stop(exit::MISSING_ROTATION, StopOrigin::Main, "no rotation");
        assert!(!controller.mark_running());
        assert!(controller.is_stopping());
    }

    #[test]
    fn test_finished_blocks_rendering() {
        let controller = LifecycleController::new();
        controller.mark_running();
        controller.mark_finished();
        assert!(!controller.should_render());
        assert!(!controller.is_stopping());
    }

    #[test]
    fn test_concurrent_requests_have_one_winner() {
        let controller = Arc::new(LifecycleController::new());
        controller.mark_running();
        let token = controller.listener_token();
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let controller = Arc::clone(&controller);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    controller.request_stop(i % 3, StopOrigin::Other, "race")
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();

        assert_eq!(winners, 1);
        assert!(token.is_cancelled());
        // Every thread reported; at least one failure code was recorded
        assert_ne!(controller.exit_code(), 0);
    }
}
