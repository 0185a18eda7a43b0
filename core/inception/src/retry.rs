//! Exponential backoff for reconnect loops
//!
//! The timer only computes delays. It never sleeps: callers wait on their
//! own (see [`crate::shutdown::Shutdown::sleep`]) so that a shutdown request
//! interrupts a long backoff.
//!
//! Delay sequence after a reset:
//!
//! ```text
//! call:   1    2    3    4    5   ...   8    9
//! delay:  0s   0.5s 1s   2s   4s  ...   60s  60s
//! ```
//!
//! The first retry is immediate; only a second consecutive failure waits.

use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Delay armed by the first failure (seconds)
pub const RETRY_BASE_SECS: f64 = 0.5;

/// Upper bound for any delay (seconds)
pub const RETRY_MAX_SECS: f64 = 60.0;

// ============================================================================
// Retry Timer
// ============================================================================

/// Exponential backoff calculator owned by a single reconnect loop.
#[derive(Debug, Clone, Default)]
pub struct ExponentialRetryTimer {
    /// Delay returned by the next call once armed (seconds). 0 = not armed.
    timer: f64,
}

impl ExponentialRetryTimer {
    /// Create a timer in the reset state
    pub fn new() -> Self {
        Self { timer: 0.0 }
    }

    /// Forget all previous failures (called after a successful connect)
    pub fn reset(&mut self) {
        self.timer = 0.0;
    }

    /// Delay to wait before the next attempt.
    ///
    /// Returns zero on the first call after a reset and arms the timer to
    /// [`RETRY_BASE_SECS`]. Later calls return the armed delay and double it,
    /// clamped to [`RETRY_MAX_SECS`].
    pub fn next_delay(&mut self) -> Duration {
        if self.timer <= 0.0 {
            self.timer = RETRY_BASE_SECS;
            return Duration::ZERO;
        }

        let delay = self.timer;
        self.timer = (self.timer * 2.0).min(RETRY_MAX_SECS);
        Duration::from_secs_f64(delay)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
