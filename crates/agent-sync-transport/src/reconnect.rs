//! Reconnection controller.
//!
//! Pure state: the client's event loop owns the timer and asks the controller
//! what to do on each close, open and timer expiry. At most one retry is ever
//! pending.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::BackoffPolicy;

/// What a close event led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A retry is now pending.
    Scheduled { attempt: u32, delay: Duration },
    /// A retry was already pending; nothing changed.
    AlreadyPending,
    /// The attempt budget just ran out.
    Exhausted { attempts: u32 },
    /// Retries were already exhausted.
    GaveUp,
}

#[derive(Debug)]
pub struct ReconnectController {
    policy: BackoffPolicy,
    attempt: u32,
    pending: Option<Instant>,
    exhausted: bool,
}

impl ReconnectController {
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            pending: None,
            exhausted: false,
        }
    }

    /// The connection closed or an open attempt failed.
    pub fn on_close(&mut self, now: Instant) -> CloseOutcome {
        if self.pending.is_some() {
            return CloseOutcome::AlreadyPending;
        }
        if self.exhausted {
            return CloseOutcome::GaveUp;
        }
        if self.policy.is_exhausted(self.attempt) {
            self.exhausted = true;
            return CloseOutcome::Exhausted {
                attempts: self.attempt,
            };
        }
        let delay = self.policy.delay_for(self.attempt);
        self.pending = Some(now + delay);
        CloseOutcome::Scheduled {
            attempt: self.attempt,
            delay,
        }
    }

    /// A connection opened: backoff and any pending retry are cleared.
    pub fn on_open(&mut self) {
        self.reset();
    }

    /// The pending retry is due. Returns the new attempt number.
    pub fn fire(&mut self) -> u32 {
        self.pending = None;
        self.attempt = self.attempt.saturating_add(1);
        self.attempt
    }

    /// Drop the pending retry, keeping the attempt count.
    pub fn cancel(&mut self) {
        self.pending = None;
    }

    /// Back to the initial state.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.pending = None;
        self.exhausted = false;
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.pending
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}
