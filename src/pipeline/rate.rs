//! Live frame-rate estimation and presentation timestamp pacing

use std::time::Instant;

use super::types::Timestamp;
use crate::config::PtsMode;

/// Length of one counting window.
pub const WINDOW_MILLIS: u64 = 1000;

/// Sliding one-second frame counter.
///
/// Frames are counted into the current window; the count is published as the
/// rate once a full window has elapsed, and counting restarts at that instant.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    counter: u32,
    window_start: u64,
    published: u32,
    default_rate: u32,
}

impl RateEstimator {
    /// Create an estimator whose first window starts at `now_millis`.
    pub fn new(now_millis: u64, default_rate: u32) -> Self {
        Self {
            counter: 0,
            window_start: now_millis,
            published: 0,
            default_rate: default_rate.max(1),
        }
    }

    /// Count one completed frame.
    pub fn record_frame(&mut self, _now_millis: u64) {
        self.counter = self.counter.saturating_add(1);
    }

    /// Last published frames-per-second value, rolling the window if it elapsed.
    pub fn current_rate(&mut self, now_millis: u64) -> u32 {
        if now_millis.saturating_sub(self.window_start) >= WINDOW_MILLIS {
            self.published = self.counter;
            self.counter = 0;
            self.window_start = now_millis;
        }
        self.published
    }

    /// Published rate, with 0 replaced by the default so it can be used as a divisor.
    pub fn effective_rate(&mut self, now_millis: u64) -> u32 {
        match self.current_rate(now_millis) {
            0 => self.default_rate,
            rate => rate,
        }
    }

    /// Frames counted in the window that is still open.
    pub fn pending(&self) -> u32 {
        self.counter
    }
}

/// Assigns presentation timestamps to submitted frames.
#[derive(Debug)]
pub struct Pacer {
    mode: PtsMode,
    next_index: u64,
    base: Instant,
}

impl Pacer {
    pub fn new(mode: PtsMode, first_index: u64) -> Self {
        Self {
            mode,
            next_index: first_index,
            base: Instant::now(),
        }
    }

    /// Timestamp of the next frame, given the current effective rate.
    pub fn next_timestamp(&mut self, effective_rate: u32) -> Timestamp {
        let k = self.next_index;
        self.next_index += 1;
        match self.mode {
            PtsMode::Paced { multiplier } => {
                let rate = effective_rate.max(1) as u64;
                Timestamp::from_micros((multiplier.saturating_mul(k) / rate) as i64)
            }
            PtsMode::Monotonic => Timestamp::from_instant(Instant::now(), self.base),
        }
    }
}

/// Milliseconds elapsed since `base`, the time scale used by `RateEstimator`.
pub fn millis_since(base: Instant) -> u64 {
    base.elapsed().as_millis() as u64
}
