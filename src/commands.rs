//! Application commands
//! The entry points a presentation layer calls. Each returns a serializable
//! error carrying the classified kind, its remediation hint and whether the
//! reconnect affordance applies.

use serde::Serialize;

use crate::core::bluetooth::{BluetoothDevice, ErrorKind, LinkError, LinkState};
use crate::relay::{RelayError, ShareSession};
use crate::state::AppState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandError {
    /// Classified kind for device link failures; `None` for store and session errors.
    pub kind: Option<ErrorKind>,
    pub message: String,
    pub hint: Option<String>,
    pub can_reconnect: bool,
}

impl From<LinkError> for CommandError {
    fn from(e: LinkError) -> Self {
        Self {
            kind: Some(e.kind),
            message: e.to_string(),
            hint: Some(e.hint().to_string()),
            can_reconnect: e.offers_reconnect(),
        }
    }
}

impl From<RelayError> for CommandError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Link(e) => e.into(),
            other => Self {
                kind: None,
                message: other.to_string(),
                hint: None,
                can_reconnect: false,
            },
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.hint {
            Some(hint) => write!(f, "{} ({})", self.message, hint),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for CommandError {}

/// Runs the device picker.
pub async fn scan_devices(app_state: &AppState) -> Result<Vec<BluetoothDevice>, CommandError> {
    Ok(app_state.link.scan().await?)
}

pub fn cancel_scan(app_state: &AppState) {
    app_state.link.cancel_scan();
}

/// Connects to a Bluetooth device
pub async fn connect_to_device(app_state: &AppState, device_id: &str) -> Result<(), CommandError> {
    Ok(app_state.link.connect(device_id).await?)
}

/// The one-click reconnect offered for `device-disconnected`.
pub async fn reconnect(app_state: &AppState) -> Result<(), CommandError> {
    Ok(app_state.link.reconnect().await?)
}

/// Disconnects from the currently connected device. Never fails.
pub async fn disconnect(app_state: &AppState) {
    if let Err(e) = app_state.relay.stop_sharing().await {
        log::warn!("Failed to close share session: {}", e);
    }
    app_state.link.disconnect().await;
}

pub fn link_state(app_state: &AppState) -> LinkState {
    app_state.link.state()
}

/// Sends a line to the device, relaying it when a session is shared.
pub async fn send_line(app_state: &AppState, line: &str) -> Result<(), CommandError> {
    Ok(app_state.relay.send_line(line).await?)
}

pub async fn start_sharing(
    app_state: &AppState,
    name: &str,
    user_label: &str,
) -> Result<ShareSession, CommandError> {
    Ok(app_state.relay.start_sharing(name, user_label).await?)
}

pub async fn stop_sharing(app_state: &AppState) -> Result<bool, CommandError> {
    Ok(app_state.relay.stop_sharing().await?)
}

pub async fn list_sessions(app_state: &AppState) -> Result<Vec<ShareSession>, CommandError> {
    Ok(app_state
        .directory
        .list_active_sessions()
        .await
        .map_err(RelayError::from)?)
}
