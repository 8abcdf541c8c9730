use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What happens to a session's relay records once the session is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Records stay until an explicit directory cleanup.
    #[default]
    Retain,
    /// Records are deleted as part of closing the session.
    PurgeOnClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Relay log poll period on both sides.
    pub poll_interval_ms: u64,
    /// Session directory reconciliation period.
    pub directory_refresh_secs: u64,
    /// `last_active` refresh period while sharing.
    pub heartbeat_secs: u64,
    /// Upper bound on flushing queued relay appends when sharing stops.
    pub drain_timeout_ms: u64,
    pub retention: RetentionPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            poll_interval_ms: 1000,
            directory_refresh_secs: 10,
            heartbeat_secs: 30,
            drain_timeout_ms: 5000,
            retention: RetentionPolicy::Retain,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn directory_refresh(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_secs.max(1))
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
