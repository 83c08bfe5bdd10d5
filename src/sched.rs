//! Frame pacing.
//!
//! The render loop targets a fixed frame rate. After each iteration the
//! scheduler sleeps for whatever remains of the frame period; an iteration
//! that overruns its period gets a zero sleep and the loop continues at
//! whatever rate processing allows.

use std::time::{Duration, Instant};

const DEFAULT_FPS: u32 = 30;

/// Fixed-rate pacing for the frame loop.
#[derive(Clone, Copy, Debug)]
pub struct PacingScheduler {
    period: Duration,
}

impl PacingScheduler {
    pub fn new(target_fps: u32) -> Self {
        let fps = if target_fps == 0 { DEFAULT_FPS } else { target_fps };
        PacingScheduler {
            period: Duration::from_secs_f64(1.0 / fps as f64),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Remaining sleep for an iteration that began at `started`. Zero when
    /// the iteration overran the period.
    pub fn delay_after(&self, started: Instant) -> Duration {
        self.period.saturating_sub(started.elapsed())
    }
}

impl Default for PacingScheduler {
    fn default() -> Self {
        PacingScheduler::new(DEFAULT_FPS)
    }
}
