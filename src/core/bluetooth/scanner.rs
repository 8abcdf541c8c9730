use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use log::{debug, info};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::error::{ErrorKind, LinkError, Operation};
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::BluetoothDevice;

/// Application-level predicate deciding which peripherals are selectable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFilter {
    name_prefixes: Vec<String>,
}

impl DeviceFilter {
    pub fn new(name_prefixes: Vec<String>) -> Self {
        Self { name_prefixes }
    }

    /// Unnamed devices never match. An empty prefix list accepts any named device.
    pub fn accepts(&self, device: &BluetoothDevice) -> bool {
        let Some(name) = device.name.as_deref() else {
            return false;
        };
        self.name_prefixes.is_empty()
            || self.name_prefixes.iter().any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// One-shot device picker over a transport's discovery stream.
pub struct BluetoothScanner {
    transport: Arc<dyn BleTransport>,
    filter: DeviceFilter,
    scan_timeout: Duration,
    cancel_token: Mutex<CancellationToken>,
}

impl BluetoothScanner {
    pub fn new(transport: Arc<dyn BleTransport>, filter: DeviceFilter, scan_timeout: Duration) -> Self {
        Self {
            transport,
            filter,
            scan_timeout,
            cancel_token: Mutex::new(CancellationToken::new()),
        }
    }

    /// Returns the first device accepted by the filter, or nothing once discovery
    /// ends or times out. Rejected devices are dropped from the result entirely.
    pub async fn scan(&self) -> Result<Vec<BluetoothDevice>, LinkError> {
        // Installed first: a cancel during the adapter wait must reach this scan.
        let cancel_token = CancellationToken::new();
        *self.cancel_token.lock().unwrap_or_else(PoisonError::into_inner) = cancel_token.clone();
        let cancelled = || {
            info!("Device scan cancelled.");
            LinkError::new(ErrorKind::UserCancelled, "scan cancelled")
        };

        tokio::select! {
            _ = cancel_token.cancelled() => return Err(cancelled()),
            available = self.transport.availability() => {
                available.map_err(|f| LinkError::from_failure(Operation::Availability, f))?;
            }
        }

        let mut scan_stream = tokio::select! {
            _ = cancel_token.cancelled() => return Err(cancelled()),
            stream = self.transport.discover() => {
                stream.map_err(|f| LinkError::from_failure(Operation::Scan, f))?
            }
        };

        let deadline = tokio::time::sleep(self.scan_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => return Err(cancelled()),
                _ = &mut deadline => {
                    info!("Device scan timed out after {:?}.", self.scan_timeout);
                    break;
                }
                result = scan_stream.next() => match result {
                    Some(Ok(device)) => {
                        if self.filter.accepts(&device) {
                            info!("Found matching device: {}, RSSI: {:?}", device, device.rssi);
                            return Ok(vec![device]);
                        }
                        debug!("Excluding non-matching device: {}", device);
                    }
                    Some(Err(failure)) => {
                        return Err(LinkError::from_failure(Operation::Scan, failure));
                    }
                    None => {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    }
                }
            }
        }

        Ok(Vec::new())
    }

    /// Aborts an in-flight scan; it resolves with `user-cancelled`.
    pub fn cancel(&self) {
        self.cancel_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_filter() {
        let filter = DeviceFilter::new(vec!["86".to_string()]);
        assert!(filter.accepts(&BluetoothDevice::new("a", Some("86-Sensor".into()), None)));
        assert!(!filter.accepts(&BluetoothDevice::new("b", Some("HC-05".into()), None)));
        assert!(!filter.accepts(&BluetoothDevice::new("c", None, None)));

        let open = DeviceFilter::new(Vec::new());
        assert!(open.accepts(&BluetoothDevice::new("b", Some("HC-05".into()), None)));
        assert!(!open.accepts(&BluetoothDevice::new("c", None, None)));
    }
}
