//! In-process stand-in for a BLE platform
//! Drives the device link without hardware: used by the test suite and by the
//! binary's `--simulate` mode. Faults (chooser cancel, silent drops, write
//! errors, ...) are injected through the `SimulatedTransport` handle.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use log::debug;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::constants::{UUID_SERIAL_CHAR, UUID_SERIAL_SERVICE};
use crate::core::bluetooth::error::{FailureCategory, PlatformFailure};
use crate::core::bluetooth::transport::{
    BleTransport, DiscoveryStream, GattCharacteristic, GattConnection, GattService,
    NotificationStream,
};
use crate::core::bluetooth::types::BluetoothDevice;

/// Produces the device's reply to one received line, if any.
pub type Responder = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// A peripheral known to the simulated platform.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    pub id: String,
    pub name: Option<String>,
    pub services: Vec<(Uuid, Vec<Uuid>)>,
    responder: Option<Responder>,
}

impl SimulatedPeripheral {
    /// A peripheral with no services at all.
    pub fn new(id: impl Into<String>, name: Option<&str>) -> Self {
        Self {
            id: id.into(),
            name: name.map(str::to_string),
            services: Vec::new(),
            responder: None,
        }
    }

    /// A UART module exposing the vendor serial service.
    pub fn serial_module(id: impl Into<String>, name: &str) -> Self {
        Self::new(id, Some(name)).with_service(UUID_SERIAL_SERVICE, &[UUID_SERIAL_CHAR])
    }

    pub fn with_service(mut self, service: Uuid, characteristics: &[Uuid]) -> Self {
        self.services.push((service, characteristics.to_vec()));
        self
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.responder = Some(Arc::new(responder));
        self
    }

    /// Answers a few common AT commands the way HC-style modules do.
    pub fn with_at_responder(self) -> Self {
        let name = self.name.clone().unwrap_or_else(|| "SIM".to_string());
        self.with_responder(move |line| match line.trim() {
            "AT" => Some("OK".to_string()),
            "AT+STATUS" => Some("STATUS: READY".to_string()),
            "AT+NAME" | "AT+NAME?" => Some(format!("+NAME:{}\r\nOK", name)),
            "AT+VERSION" => Some("+VERSION:SIM-1.0\r\nOK".to_string()),
            other if other.starts_with("AT") => Some("ERROR".to_string()),
            _ => None,
        })
    }

    fn info(&self) -> BluetoothDevice {
        BluetoothDevice::new(self.id.clone(), self.name.clone(), Some(-55))
    }
}

#[derive(Default)]
struct SimState {
    unsupported: bool,
    insecure: bool,
    chooser_cancels: bool,
    peripherals: Vec<SimulatedPeripheral>,
    connected: Option<String>,
    link_alive: bool,
    next_connect_failure: Option<PlatformFailure>,
    fail_writes: bool,
    fail_notifications: bool,
    fail_teardown: bool,
    notify_tx: Option<mpsc::UnboundedSender<Result<Vec<u8>, PlatformFailure>>>,
    written: Vec<Vec<u8>>,
    rx_line: Vec<u8>,
    connect_calls: usize,
    disconnect_calls: usize,
    stop_notification_calls: usize,
}

impl SimState {
    fn is_connected_to(&self, device_id: &str) -> bool {
        self.link_alive && self.connected.as_deref() == Some(device_id)
    }

    fn peripheral(&self, device_id: &str) -> Option<&SimulatedPeripheral> {
        self.peripherals.iter().find(|p| p.id == device_id)
    }

    fn notify(&self, payload: &[u8]) {
        if let Some(tx) = &self.notify_tx {
            let _ = tx.send(Ok(payload.to_vec()));
        }
    }
}

/// Handle to the simulated platform. Clones share the same state.
#[derive(Clone, Default)]
pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedTransport {
    pub fn new(peripherals: Vec<SimulatedPeripheral>) -> Self {
        let transport = Self::default();
        transport.lock().peripherals = peripherals;
        transport
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peripheral(&self, peripheral: SimulatedPeripheral) {
        self.lock().peripherals.push(peripheral);
    }

    /// Platform has no Bluetooth capability.
    pub fn set_unsupported(&self, unsupported: bool) {
        self.lock().unsupported = unsupported;
    }

    /// Not running in a secure context.
    pub fn set_insecure(&self, insecure: bool) {
        self.lock().insecure = insecure;
    }

    /// The user dismisses the device chooser.
    pub fn set_chooser_cancels(&self, cancels: bool) {
        self.lock().chooser_cancels = cancels;
    }

    pub fn fail_next_connect(&self, failure: PlatformFailure) {
        self.lock().next_connect_failure = Some(failure);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn set_fail_notifications(&self, fail: bool) {
        self.lock().fail_notifications = fail;
    }

    /// Makes stop-notifications and GATT disconnect report errors.
    pub fn set_fail_teardown(&self, fail: bool) {
        self.lock().fail_teardown = fail;
    }

    /// The platform stops reporting the device as connected without telling anyone.
    pub fn drop_silently(&self) {
        self.lock().link_alive = false;
    }

    /// The device goes away and the notification stream ends.
    pub fn drop_link(&self) {
        let mut state = self.lock();
        state.link_alive = false;
        state.connected = None;
        state.notify_tx = None;
    }

    /// Delivers one notification payload, as if the device sent it.
    pub fn push_notification(&self, payload: &[u8]) {
        self.lock().notify(payload);
    }

    /// Every byte written to the characteristic, in order.
    pub fn written_bytes(&self) -> Vec<u8> {
        self.lock().written.concat()
    }

    pub fn write_count(&self) -> usize {
        self.lock().written.len()
    }

    /// Complete CRLF-terminated lines written so far.
    pub fn sent_lines(&self) -> Vec<String> {
        let bytes = self.written_bytes();
        let text = String::from_utf8_lossy(&bytes);
        text.split_inclusive("\r\n")
            .filter_map(|line| line.strip_suffix("\r\n"))
            .map(str::to_string)
            .collect()
    }

    pub fn connect_calls(&self) -> usize {
        self.lock().connect_calls
    }

    pub fn disconnect_calls(&self) -> usize {
        self.lock().disconnect_calls
    }

    pub fn stop_notification_calls(&self) -> usize {
        self.lock().stop_notification_calls
    }

    pub fn has_notification_subscriber(&self) -> bool {
        self.lock().notify_tx.is_some()
    }
}

#[async_trait::async_trait]
impl BleTransport for SimulatedTransport {
    async fn availability(&self) -> Result<(), PlatformFailure> {
        let state = self.lock();
        if state.unsupported {
            return Err(PlatformFailure::new(
                FailureCategory::Unsupported,
                "Web Bluetooth API is not available in this environment",
            ));
        }
        if state.insecure {
            return Err(PlatformFailure::new(
                FailureCategory::Security,
                "requestDevice() requires a secure context",
            ));
        }
        Ok(())
    }

    async fn discover(&self) -> Result<DiscoveryStream, PlatformFailure> {
        let state = self.lock();
        if state.chooser_cancels {
            return Err(PlatformFailure::new(
                FailureCategory::Cancelled,
                "User cancelled the requestDevice() chooser.",
            ));
        }
        let found: Vec<Result<BluetoothDevice, PlatformFailure>> =
            state.peripherals.iter().map(|p| Ok(p.info())).collect();
        Ok(futures_util::stream::iter(found).boxed())
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn GattConnection>, PlatformFailure> {
        let mut state = self.lock();
        state.connect_calls += 1;
        if let Some(failure) = state.next_connect_failure.take() {
            return Err(failure);
        }
        if state.peripheral(device_id).is_none() {
            return Err(PlatformFailure::new(
                FailureCategory::NotFound,
                format!("Device {} is out of range", device_id),
            ));
        }
        state.connected = Some(device_id.to_string());
        state.link_alive = true;
        debug!("Simulated GATT connect to {}", device_id);
        Ok(Box::new(SimConnection {
            state: self.state.clone(),
            device_id: device_id.to_string(),
        }))
    }
}

struct SimConnection {
    state: Arc<Mutex<SimState>>,
    device_id: String,
}

impl SimConnection {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl GattConnection for SimConnection {
    async fn is_connected(&self) -> bool {
        self.lock().is_connected_to(&self.device_id)
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn GattService>, PlatformFailure> {
        let state = self.lock();
        if !state.is_connected_to(&self.device_id) {
            return Err(PlatformFailure::new(
                FailureCategory::NotConnected,
                "GATT Server is disconnected. Cannot retrieve services.",
            ));
        }
        let characteristics = state
            .peripheral(&self.device_id)
            .and_then(|p| p.services.iter().find(|(service, _)| *service == uuid))
            .map(|(_, characteristics)| characteristics.clone())
            .ok_or_else(|| {
                PlatformFailure::new(
                    FailureCategory::NotFound,
                    format!("No Services matching UUID {} found in Device.", uuid),
                )
            })?;
        Ok(Box::new(SimService {
            state: self.state.clone(),
            device_id: self.device_id.clone(),
            uuid,
            characteristics,
        }))
    }

    async fn disconnect(&self) -> Result<(), PlatformFailure> {
        let mut state = self.lock();
        state.disconnect_calls += 1;
        if state.connected.as_deref() == Some(self.device_id.as_str()) {
            state.connected = None;
            state.link_alive = false;
            state.notify_tx = None;
        }
        if state.fail_teardown {
            return Err(PlatformFailure::other("GATT disconnect failed"));
        }
        Ok(())
    }
}

struct SimService {
    state: Arc<Mutex<SimState>>,
    device_id: String,
    uuid: Uuid,
    characteristics: Vec<Uuid>,
}

#[async_trait::async_trait]
impl GattService for SimService {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<Arc<dyn GattCharacteristic>, PlatformFailure> {
        if !self.characteristics.contains(&uuid) {
            return Err(PlatformFailure::new(
                FailureCategory::NotFound,
                format!("No Characteristics matching UUID {} found in Service.", uuid),
            ));
        }
        Ok(Arc::new(SimCharacteristic {
            state: self.state.clone(),
            device_id: self.device_id.clone(),
            uuid,
        }))
    }
}

struct SimCharacteristic {
    state: Arc<Mutex<SimState>>,
    device_id: String,
    uuid: Uuid,
}

impl SimCharacteristic {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait::async_trait]
impl GattCharacteristic for SimCharacteristic {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn start_notifications(&self) -> Result<NotificationStream, PlatformFailure> {
        let mut state = self.lock();
        if state.fail_notifications {
            return Err(PlatformFailure::new(
                FailureCategory::Protocol,
                "GATT operation failed for unknown reason.",
            ));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.notify_tx = Some(tx);
        Ok(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }

    async fn stop_notifications(&self) -> Result<(), PlatformFailure> {
        let mut state = self.lock();
        state.stop_notification_calls += 1;
        state.notify_tx = None;
        if state.fail_teardown {
            return Err(PlatformFailure::other("stopNotifications failed"));
        }
        Ok(())
    }

    async fn write_value(&self, bytes: &[u8]) -> Result<(), PlatformFailure> {
        let mut state = self.lock();
        if !state.is_connected_to(&self.device_id) {
            return Err(PlatformFailure::new(
                FailureCategory::NotConnected,
                "GATT Server is disconnected. Cannot perform GATT operations.",
            ));
        }
        if state.fail_writes {
            return Err(PlatformFailure::new(
                FailureCategory::Protocol,
                "GATT operation failed for unknown reason.",
            ));
        }
        state.written.push(bytes.to_vec());

        // Feed the responder one complete line at a time.
        state.rx_line.extend_from_slice(bytes);
        let responder = state.peripheral(&self.device_id).and_then(|p| p.responder.clone());
        while let Some(end) = state.rx_line.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = state.rx_line.drain(..end + 2).collect();
            let line = String::from_utf8_lossy(&line[..end]).into_owned();
            if let Some(reply) = responder.as_ref().and_then(|respond| respond(&line)) {
                state.notify(format!("{}\r\n", reply).as_bytes());
            }
        }
        Ok(())
    }
}
