//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Liveness checks for established device connections."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Idle-detection parameters.
///
/// The device pushes reports continuously once the handshake is done, so a
/// silent socket means a stalled or half-open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchdogSettings {
    /// Period of the liveness check.
    pub check_interval: Duration,
    /// Minimum tolerated silence.
    pub floor: Duration,
    /// Added on top of `max(floor, timeout)`.
    pub margin: Duration,
}

impl WatchdogSettings {
    /// Silence after which the connection is torn down, for a given timeout budget.
    pub fn idle_bound(&self, timeout: Duration) -> Duration {
        self.floor.max(timeout) + self.margin
    }

    /// Idle time if `last_data_at` is further back than the bound.
    pub fn stalled_for(
        &self,
        last_data_at: Instant,
        now: Instant,
        timeout: Duration,
    ) -> Option<Duration> {
        let idle = now.saturating_duration_since(last_data_at);
        (idle > self.idle_bound(timeout)).then_some(idle)
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            floor: Duration::from_secs(60),
            margin: Duration::from_secs(10),
        }
    }
}
