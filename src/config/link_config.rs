use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    CONNECT_RETRY_DELAY_MS, DEFAULT_MAX_WRITE_LEN, DEFAULT_NAME_PREFIX,
    DEFAULT_SCAN_DURATION_SECS, LIVENESS_INTERVAL_SECS, NOTIFICATION_IDLE_FLUSH_MS,
    BLUETOOTH_OPERATION_TIMEOUT_SECS, UUID_GENERIC_ACCESS_SERVICE, UUID_SERIAL_CHAR,
    UUID_SERIAL_SERVICE,
};

/// A service/characteristic pair to try while negotiating the serial path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl ServiceProfile {
    pub const fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// Keywords the line framer uses to re-segment notification text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FramerConfig {
    /// A line break is forced before each of these when it appears mid-line.
    pub command_prefixes: Vec<String>,
    /// Status tokens split off the end of a line when glued to a digit or punctuation.
    pub status_tokens: Vec<String>,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            command_prefixes: vec!["AT+".to_string()],
            status_tokens: vec!["OK".to_string(), "ERROR".to_string(), "FAIL".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Only devices whose name starts with one of these are offered for selection.
    /// An empty list accepts every named device.
    pub name_prefixes: Vec<String>,

    /// Service/characteristic pairs in preference order.
    pub profiles: Vec<ServiceProfile>,

    /// How long the one-shot picker waits for a matching device.
    pub scan_timeout_secs: u64,

    /// Connection attempts before `connect` gives up.
    pub connect_attempts: u32,

    pub connect_retry_delay_ms: u64,

    /// Liveness check period while connected.
    pub liveness_interval_secs: u64,

    /// Upper bound on best-effort teardown steps.
    pub operation_timeout_secs: u64,

    /// Largest single characteristic write; longer commands are split.
    pub max_write_len: usize,

    /// A partial line is flushed to listeners after this much notification silence.
    pub notification_idle_flush_ms: u64,

    pub framer: FramerConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            name_prefixes: vec![DEFAULT_NAME_PREFIX.to_string()],
            profiles: vec![
                ServiceProfile::new(UUID_SERIAL_SERVICE, UUID_SERIAL_CHAR),
                ServiceProfile::new(UUID_GENERIC_ACCESS_SERVICE, UUID_SERIAL_CHAR),
            ],
            scan_timeout_secs: DEFAULT_SCAN_DURATION_SECS,
            connect_attempts: 1,
            connect_retry_delay_ms: CONNECT_RETRY_DELAY_MS,
            liveness_interval_secs: LIVENESS_INTERVAL_SECS,
            operation_timeout_secs: BLUETOOTH_OPERATION_TIMEOUT_SECS,
            max_write_len: DEFAULT_MAX_WRITE_LEN,
            notification_idle_flush_ms: NOTIFICATION_IDLE_FLUSH_MS,
            framer: FramerConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    pub fn notification_idle_flush(&self) -> Duration {
        Duration::from_millis(self.notification_idle_flush_ms.max(1))
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }
}
