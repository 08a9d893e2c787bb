//! [`IdleWatchdog`] – shuts the node down after the input goes quiet.
//!
//! The service records every accepted segment observation with
//! [`IdleWatchdog::record`].  A periodic supervisor tick calls
//! [`IdleWatchdog::check`]; once the configured timeout has elapsed since the
//! last record, and at least one observation was ever received, the check
//! reports [`IdleStatus::Expired`] exactly once.  Every later check reports
//! [`IdleStatus::AlreadyFired`] so the shutdown path cannot run twice.

use std::time::{Duration, Instant};

use tracing::info;

// ────────────────────────────────────────────────────────────────────────────
// Public types
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of one [`IdleWatchdog::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleStatus {
    /// No observation has been received yet; the timer is not armed.
    WaitingForFirstObservation,
    /// Observations are still arriving within the timeout.
    Active,
    /// The timeout elapsed; the caller must shut down now.
    Expired,
    /// The watchdog already fired on an earlier check.
    AlreadyFired,
}

// ────────────────────────────────────────────────────────────────────────────
// IdleWatchdog
// ────────────────────────────────────────────────────────────────────────────

/// Tracks the time of the most recent observation and fires once on silence.
///
/// # Example
///
/// ```
/// use std::time::{Duration, Instant};
/// use gsm_kernel::watchdog::{IdleStatus, IdleWatchdog};
///
/// let mut wd = IdleWatchdog::new(Duration::from_secs(5));
/// let t0 = Instant::now();
/// wd.record_at(t0);
///
/// assert_eq!(wd.check_at(t0 + Duration::from_secs(1)), IdleStatus::Active);
/// assert_eq!(wd.check_at(t0 + Duration::from_secs(6)), IdleStatus::Expired);
/// assert_eq!(wd.check_at(t0 + Duration::from_secs(7)), IdleStatus::AlreadyFired);
/// ```
#[derive(Debug)]
pub struct IdleWatchdog {
    timeout: Duration,
    last_observation: Option<Instant>,
    fired: bool,
}

impl IdleWatchdog {
    /// Create an unarmed watchdog.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_observation: None,
            fired: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Record an accepted observation now.
    pub fn record(&mut self) {
        self.record_at(Instant::now());
    }

    /// Record an accepted observation at `now`.
    pub fn record_at(&mut self, now: Instant) {
        self.last_observation = Some(now);
    }

    pub fn has_received(&self) -> bool {
        self.last_observation.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    /// Check against the current time.
    pub fn check(&mut self) -> IdleStatus {
        self.check_at(Instant::now())
    }

    /// Check against `now`.
    pub fn check_at(&mut self, now: Instant) -> IdleStatus {
        if self.fired {
            return IdleStatus::AlreadyFired;
        }
        let Some(last) = self.last_observation else {
            return IdleStatus::WaitingForFirstObservation;
        };
        let idle_for = now.saturating_duration_since(last);
        if idle_for > self.timeout {
            self.fired = true;
            info!(
                idle_secs = idle_for.as_secs_f64(),
                timeout_secs = self.timeout.as_secs_f64(),
                "no new observations received; requesting shutdown"
            );
            IdleStatus::Expired
        } else {
            IdleStatus::Active
        }
    }
}
