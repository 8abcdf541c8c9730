//! Constants used throughout the device link
//! UUIDs, timeouts, and other default configuration values.

use uuid::Uuid;

/// Name prefix of the serial modules offered for selection by default.
pub const DEFAULT_NAME_PREFIX: &str = "86";

/// Vendor serial service exposed by HC-08/HM-10 style UART modules
pub const UUID_SERIAL_SERVICE: Uuid = Uuid::from_u128(0x0000ffe0_0000_1000_8000_00805f9b34fb);

/// Combined write/notify characteristic of the vendor serial service
pub const UUID_SERIAL_CHAR: Uuid = Uuid::from_u128(0x0000ffe1_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);

/// Command terminator appended to every outgoing line
pub const LINE_TERMINATOR: &str = "\r\n";

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Timeout for best-effort Bluetooth operations in seconds
pub const BLUETOOTH_OPERATION_TIMEOUT_SECS: u64 = 10;

/// Scan duration in seconds
pub const DEFAULT_SCAN_DURATION_SECS: u64 = 10;

/// Liveness check interval while connected
pub const LIVENESS_INTERVAL_SECS: u64 = 5;

/// Default ATT payload for a single characteristic write
pub const DEFAULT_MAX_WRITE_LEN: usize = 20;

/// Notification silence after which a partial line is shown anyway
pub const NOTIFICATION_IDLE_FLUSH_MS: u64 = 150;
