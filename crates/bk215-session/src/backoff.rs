//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reconnect scheduling policy."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Smallest delay a policy hands out.
pub const MIN_DELAY: Duration = Duration::from_millis(10);

/// Parameters of the exponential reconnect backoff.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Delay before the first reconnect after a successful connection.
    pub base: Duration,
    /// Growth factor applied after every consecutive failure.
    pub factor: f64,
    /// Upper bound for any delay.
    pub cap: Duration,
}

impl BackoffPolicy {
    /// Build a policy; the factor is clamped to at least `1.0` so delays never
    /// shrink, and base and cap are raised to [`MIN_DELAY`].
    pub fn new(base: Duration, factor: f64, cap: Duration) -> Self {
        let factor = if factor.is_finite() {
            factor.max(1.0)
        } else {
            1.0
        };
        let cap = cap.max(MIN_DELAY);
        Self {
            base: base.max(MIN_DELAY).min(cap),
            factor,
            cap,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 1.5, Duration::from_secs(60))
    }
}

/// Running backoff state for one device link.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    current: Duration,
    failures: u32,
}

impl ReconnectBackoff {
    /// Start at the policy's base delay.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            current: policy.base,
            failures: 0,
        }
    }

    /// Delay to use for the next reconnect; grows the delay for the attempt after it.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.policy.cap);
        let grown_ms = (delay.as_millis() as f64 * self.policy.factor).floor() as u64;
        self.current = Duration::from_millis(grown_ms).min(self.policy.cap);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Return to the base delay after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.policy.base;
        self.failures = 0;
    }

    /// Delay the next call to [`ReconnectBackoff::next_delay`] will return.
    pub fn peek(&self) -> Duration {
        self.current.min(self.policy.cap)
    }

    /// Consecutive delays handed out since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Policy this backoff was built from.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
