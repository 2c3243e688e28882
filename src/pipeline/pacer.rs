//! Best-effort frame pacing
//!
//! Timestamps are the sub-second part of a monotonic clock, in
//! microseconds. A negative difference is taken as one wrap of the second
//! boundary. Gaps longer than a second therefore read short, and the pacer
//! may sleep when it should not; the behaviour is kept as is.

use std::time::{Duration, Instant};
use tracing::trace;

use super::PipelineConfig;

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Time source for the pacer
pub trait Clock: Send {
    /// Microseconds within the current second of a monotonic clock
    fn now_micros(&self) -> i64;

    fn sleep_micros(&self, micros: u64);
}

/// [`Clock`] backed by [`Instant`]
pub struct MonotonicClock {
    origin: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Clock for MonotonicClock {
    fn now_micros(&self) -> i64 {
        i64::from(self.origin.elapsed().subsec_micros())
    }

    fn sleep_micros(&self, micros: u64) {
        std::thread::sleep(Duration::from_micros(micros));
    }
}

/// Target interval between frames for a frame rate
pub fn target_interval_micros(frame_rate: u32) -> u64 {
    1_000_000 / u64::from(frame_rate.max(1))
}

/// Sleeps between frames to approximate the target frame rate.
/// Never skips frames and never catches up after an overrun.
pub struct FramePacer<C: Clock = MonotonicClock> {
    clock: C,
    target_interval: Option<u64>,
    last_frame: Option<i64>,
}

impl FramePacer {
    /// Pacer for a configuration; pacing is disabled when uncapped
    pub fn for_config(config: &PipelineConfig) -> Self {
        let target = config
            .restrict_frame_rate
            .then(|| target_interval_micros(config.frame_rate));
        Self::with_clock(target, MonotonicClock::default())
    }
}

impl<C: Clock> FramePacer<C> {
    pub fn with_clock(target_interval: Option<u64>, clock: C) -> Self {
        Self {
            clock,
            target_interval,
            last_frame: None,
        }
    }

    /// Target interval in microseconds, `None` when uncapped
    pub fn target_interval(&self) -> Option<u64> {
        self.target_interval
    }

    /// Wait until the next frame is due. Returns the microseconds slept.
    pub fn wait_for_next_frame(&mut self) -> Option<u64> {
        let target = self.target_interval?;
        let now = self.clock.now_micros();

        let last = self.last_frame.replace(now)?;
        let mut elapsed = now - last;
        if elapsed < 0 {
            elapsed += MICROS_PER_SECOND;
        }

        let elapsed = elapsed as u64;
        if elapsed < target {
            let remaining = target - elapsed;
            trace!("Frame early by {}us", remaining);
            self.clock.sleep_micros(remaining);
            Some(remaining)
        } else {
            None
        }
    }
}
