//! Health metrics for a decode-feed session

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared between the feed loop and the decoder event pump.
///
/// All fields use atomic operations for thread-safe access.
pub struct SessionHealth {
    /// Frames reassembled and submitted to the decoder
    pub frames_submitted: AtomicU64,

    /// Payload bytes submitted to the decoder
    pub bytes_submitted: AtomicU64,

    /// Keyframes among the submitted frames
    pub keyframes: AtomicU64,

    /// Zero-length frames skipped
    pub keepalives: AtomicU64,

    /// Decoded frames presented on the render target
    pub frames_rendered: AtomicU64,

    /// Errors reported by the decoder
    pub decoder_errors: AtomicU64,

    /// Total time the feed loop waited for a free input slot (microseconds)
    pub slot_wait_us: AtomicU64,
}

impl SessionHealth {
    pub fn new() -> Self {
        Self {
            frames_submitted: AtomicU64::new(0),
            bytes_submitted: AtomicU64::new(0),
            keyframes: AtomicU64::new(0),
            keepalives: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            decoder_errors: AtomicU64::new(0),
            slot_wait_us: AtomicU64::new(0),
        }
    }

    /// Record a frame handed to the decoder
    pub fn record_frame(&self, size: usize, is_keyframe: bool) {
        self.frames_submitted.fetch_add(1, Ordering::Relaxed);
        self.bytes_submitted
            .fetch_add(size as u64, Ordering::Relaxed);
        if is_keyframe {
            self.keyframes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn set_keepalives(&self, count: u64) {
        self.keepalives.store(count, Ordering::Relaxed);
    }

    pub fn record_render(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoder_error(&self) {
        self.decoder_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_slot_wait(&self, waited: Duration) {
        self.slot_wait_us
            .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Relaxed)
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    /// Get a summary of health metrics
    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            frames_submitted: self.frames_submitted(),
            bytes_submitted: self.bytes_submitted.load(Ordering::Relaxed),
            keyframes: self.keyframes.load(Ordering::Relaxed),
            keepalives: self.keepalives.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered(),
            decoder_errors: self.decoder_errors.load(Ordering::Relaxed),
            slot_wait: Duration::from_micros(self.slot_wait_us.load(Ordering::Relaxed)),
        }
    }
}

impl Default for SessionHealth {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of health metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSummary {
    pub frames_submitted: u64,
    pub bytes_submitted: u64,
    pub keyframes: u64,
    pub keepalives: u64,
    pub frames_rendered: u64,
    pub decoder_errors: u64,
    pub slot_wait: Duration,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Health: {} frames submitted ({} bytes, {} keyframes, {} keep-alives), {} rendered, {} decoder errors, {:.1}ms slot wait",
            self.frames_submitted,
            self.bytes_submitted,
            self.keyframes,
            self.keepalives,
            self.frames_rendered,
            self.decoder_errors,
            self.slot_wait.as_secs_f64() * 1000.0
        )
    }
}
