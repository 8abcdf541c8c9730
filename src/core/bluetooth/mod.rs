//! Bluetooth functionality for BLE serial modules
//! This module handles all bluetooth operations including scanning,
//! connecting, negotiating the serial path and exchanging lines with the device.

mod bluest_transport;
mod commands;
mod connection;
pub mod constants;
pub mod error;
mod link;
mod notification;
mod scanner;
pub mod simulated;
pub mod transport;
pub mod types;

// Re-export types that should be publicly accessible
pub use bluest_transport::BluestTransport;
pub use commands::SerialCommand;
pub use connection::{ConnectionManager, Established};
pub use error::{ErrorKind, FailureCategory, LinkError, Operation, PlatformFailure, classify};
pub use link::DeviceLink;
pub use notification::{NotificationHandler, StreamEnd};
pub use scanner::{BluetoothScanner, DeviceFilter};
pub use simulated::{SimulatedPeripheral, SimulatedTransport};
pub use transport::{BleTransport, GattCharacteristic, GattConnection, GattService};
pub use types::{BluetoothDevice, LinkEvent, LinkState};
