//! Rate-limited logging of repeated failures
//!
//! Capture retries the same OS calls every frame. A `FailureLog` turns a
//! run of identical failures into one warning per interval plus a recovery
//! line with the number of failures that were not logged.

use std::fmt::Display;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Default interval between repeated warnings
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Warns on a success-to-failure transition, then at most once per
/// interval while failures continue
#[derive(Debug)]
pub struct FailureLog {
    subject: &'static str,
    interval: Duration,
    failing: bool,
    last_warning: Option<Instant>,
    suppressed: u64,
}

impl FailureLog {
    /// Creates a limiter for `subject` that repeats warnings every `interval`
    pub fn new(subject: &'static str, interval: Duration) -> Self {
        Self {
            subject,
            interval,
            failing: false,
            last_warning: None,
            suppressed: 0,
        }
    }

    /// Creates a limiter with the default interval
    pub fn with_default_interval(subject: &'static str) -> Self {
        Self::new(subject, DEFAULT_WARN_INTERVAL)
    }

    /// Whether the last recorded outcome was a failure
    pub fn is_failing(&self) -> bool {
        self.failing
    }

    /// Records an outcome; returns true if a warning was logged
    pub fn record<T, E: Display>(&mut self, outcome: &Result<T, E>) -> bool {
        self.record_at(outcome, Instant::now())
    }

    /// Records an outcome as of `now`
    pub fn record_at<T, E: Display>(&mut self, outcome: &Result<T, E>, now: Instant) -> bool {
        match outcome {
            Ok(_) => {
                self.success();
                false
            }
            Err(e) => self.failure_at(e, now),
        }
    }

    /// Records a success, logging the recovery after a failing run
    pub fn success(&mut self) {
        if self.failing {
            info!(
                "{} succeeded again ({} failure(s) suppressed)",
                self.subject, self.suppressed
            );
        }
        self.failing = false;
        self.suppressed = 0;
    }

    /// Records a failure as of `now`; returns true if it was logged
    pub fn failure_at(&mut self, reason: &dyn Display, now: Instant) -> bool {
        let due = !self.failing
            || self
                .last_warning
                .map_or(true, |at| now.duration_since(at) >= self.interval);
        self.failing = true;
        if due {
            warn!("{} failed: {}", self.subject, reason);
            self.last_warning = Some(now);
            self.suppressed = 0;
        } else {
            self.suppressed += 1;
        }
        due
    }

    /// Records a failure now
    pub fn failure(&mut self, reason: &dyn Display) -> bool {
        self.failure_at(reason, Instant::now())
    }
}
