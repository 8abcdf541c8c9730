//! Defines shared data structures for the Bluetooth module.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::config::link_config::ServiceProfile;
use crate::core::bluetooth::transport::{GattCharacteristic, GattConnection};
use crate::utils::ScopedTask;

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BluetoothDevice {
    /// Platform-specific unique identifier for the device (especially important on macOS)
    pub id: String,
    /// The advertised name of the device, if available
    pub name: Option<String>,
    /// The signal strength (RSSI) of the device
    pub rssi: Option<i16>,
}

impl BluetoothDevice {
    pub fn new(id: impl Into<String>, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            id: id.into(),
            name,
            rssi,
        }
    }

    /// Name for display, falling back to the id.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for BluetoothDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Device link lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Scanning,
    AwaitingSelection,
    Connecting,
    Negotiating,
    Connected,
    Disconnected,
}

/// Events published by the device link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One display-ready line of device output.
    Line(String),
    StateChanged(LinkState),
}

/// The peripheral currently owned by the link, together with its live GATT connection.
pub struct DeviceHandle {
    pub device: BluetoothDevice,
    pub(crate) connection: Box<dyn GattConnection>,
}

/// The negotiated path over a [`DeviceHandle`]: the resolved characteristic and the
/// task pumping its notifications. Only ever exists next to a connected handle.
pub struct SerialLink {
    pub profile: ServiceProfile,
    pub(crate) characteristic: Arc<dyn GattCharacteristic>,
    pub(crate) notifications: ScopedTask,
}

impl SerialLink {
    /// Whether notifications are still being pumped from the characteristic.
    pub fn is_pumping(&self) -> bool {
        !self.notifications.is_finished()
    }
}
