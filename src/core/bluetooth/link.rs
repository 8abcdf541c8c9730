//! Device link
//! Owns the single BLE serial connection: the scan/connect/negotiate state machine,
//! the notification pump, the liveness check and the write path. Every fallible
//! operation returns a classified [`LinkError`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, error, info, warn};
use tokio::sync::Mutex as AsyncMutex;

use crate::config::link_config::LinkConfig;
use crate::config::serial_config::SerialConfig;
use crate::core::bluetooth::commands::SerialCommand;
use crate::core::bluetooth::connection::{ConnectionManager, Established};
use crate::core::bluetooth::error::{ErrorKind, LinkError, Operation, classify};
use crate::core::bluetooth::notification::{NotificationHandler, StreamEnd};
use crate::core::bluetooth::scanner::{BluetoothScanner, DeviceFilter};
use crate::core::bluetooth::transport::BleTransport;
use crate::core::bluetooth::types::{
    BluetoothDevice, DeviceHandle, LinkEvent, LinkState, SerialLink,
};
use crate::core::events::{EventBus, Subscription};
use crate::utils::ScopedTask;

/// A connected device and everything scoped to that connection.
/// Dropping it releases the notification pump and the liveness timer.
struct ActiveLink {
    handle: DeviceHandle,
    serial: SerialLink,
    _liveness: ScopedTask,
    epoch: u64,
}

#[derive(Default)]
struct Inner {
    candidates: Vec<BluetoothDevice>,
    active: Option<ActiveLink>,
}

struct Shared {
    config: LinkConfig,
    scanner: BluetoothScanner,
    connections: ConnectionManager,
    notifications: NotificationHandler,
    events: EventBus<LinkEvent>,
    state: Mutex<LinkState>,
    last_device: Mutex<Option<BluetoothDevice>>,
    serial_config: Mutex<SerialConfig>,
    /// Sends, connects and teardowns all go through this lock, so they never interleave.
    inner: AsyncMutex<Inner>,
    epoch: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the device link. Clones share one connection.
#[derive(Clone)]
pub struct DeviceLink {
    shared: Arc<Shared>,
}

impl DeviceLink {
    pub fn new(transport: Arc<dyn BleTransport>, config: LinkConfig) -> Self {
        let events = EventBus::new();
        let scanner = BluetoothScanner::new(
            transport.clone(),
            DeviceFilter::new(config.name_prefixes.clone()),
            config.scan_timeout(),
        );
        let connections = ConnectionManager::new(transport, &config);
        let notifications = NotificationHandler::new(
            config.framer.clone(),
            config.notification_idle_flush(),
            events.clone(),
        );
        Self {
            shared: Arc::new(Shared {
                config,
                scanner,
                connections,
                notifications,
                events,
                state: Mutex::new(LinkState::Idle),
                last_device: Mutex::new(None),
                serial_config: Mutex::new(SerialConfig::default()),
                inner: AsyncMutex::new(Inner::default()),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    fn from_weak(weak: &Weak<Shared>) -> Option<Self> {
        weak.upgrade().map(|shared| Self { shared })
    }

    pub fn state(&self) -> LinkState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    /// The device currently connected, if any.
    pub async fn connected_device(&self) -> Option<BluetoothDevice> {
        let inner = self.shared.inner.lock().await;
        inner.active.as_ref().map(|active| active.handle.device.clone())
    }

    /// Id of the device last passed to `connect`, used by `reconnect`.
    pub fn last_device_id(&self) -> Option<String> {
        lock(&self.shared.last_device).as_ref().map(|device| device.id.clone())
    }

    pub fn serial_config(&self) -> SerialConfig {
        *lock(&self.shared.serial_config)
    }

    pub fn set_serial_config(&self, serial_config: SerialConfig) {
        info!("Serial parameters set to {}", serial_config);
        *lock(&self.shared.serial_config) = serial_config;
    }

    /// Registers for device output lines and state changes.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&LinkEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    fn set_state(&self, next: LinkState) {
        let previous = std::mem::replace(&mut *lock(&self.shared.state), next);
        if previous != next {
            info!("Link state: {:?} -> {:?}", previous, next);
            self.shared.events.publish(&LinkEvent::StateChanged(next));
        }
    }

    /// Runs the one-shot picker. Yields zero or one device.
    ///
    /// The link lock is held for the whole scan, so a scan never overlaps a
    /// connect; one that queued behind a connect sees the new link and is rejected.
    pub async fn scan(&self) -> Result<Vec<BluetoothDevice>, LinkError> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = &inner.active {
            return Err(LinkError::new(
                ErrorKind::Unknown,
                format!("{} is connected; disconnect before scanning", active.handle.device),
            ));
        }

        self.set_state(LinkState::Scanning);
        match self.shared.scanner.scan().await {
            Ok(devices) => {
                inner.candidates = devices.clone();
                self.set_state(if devices.is_empty() {
                    LinkState::Idle
                } else {
                    LinkState::AwaitingSelection
                });
                Ok(devices)
            }
            Err(e) => {
                info!("Scan failed: {}", e);
                self.set_state(LinkState::Idle);
                Err(e)
            }
        }
    }

    pub fn cancel_scan(&self) {
        self.shared.scanner.cancel();
    }

    /// Connects and negotiates the serial path to `device_id`.
    ///
    /// Connecting to the device that is already connected is a no-op; any other
    /// connection is torn down first. On failure nothing is left half-open.
    pub async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let mut inner = self.shared.inner.lock().await;

        if let Some(active) = &inner.active {
            if active.handle.device.id == device_id {
                info!("Already connected to {}", active.handle.device);
                return Ok(());
            }
        }
        if let Some(previous) = inner.active.take() {
            info!("Switching away from {}", previous.handle.device);
            self.teardown(previous, LinkState::Disconnected).await;
        }

        let device = inner
            .candidates
            .iter()
            .find(|candidate| candidate.id == device_id)
            .cloned()
            .or_else(|| {
                lock(&self.shared.last_device)
                    .clone()
                    .filter(|last| last.id == device_id)
            })
            .unwrap_or_else(|| BluetoothDevice::new(device_id, None, None));
        *lock(&self.shared.last_device) = Some(device.clone());

        let on_phase = |state: LinkState| self.set_state(state);
        match self
            .shared
            .connections
            .connect_with_retry(&device, &on_phase)
            .await
        {
            Ok(established) => {
                inner.active = Some(self.activate(device, established));
                self.set_state(LinkState::Connected);
                Ok(())
            }
            Err(e) => {
                error!("Failed to connect to {}: {}", device, e);
                self.set_state(LinkState::Disconnected);
                Err(e)
            }
        }
    }

    /// Reconnects to the last-known device.
    pub async fn reconnect(&self) -> Result<(), LinkError> {
        let device_id = self.last_device_id().ok_or_else(|| {
            LinkError::new(ErrorKind::DeviceDisconnected, "no device has been selected yet")
        })?;
        info!("Reconnecting to {}", device_id);
        self.connect(&device_id).await
    }

    fn activate(&self, device: BluetoothDevice, established: Established) -> ActiveLink {
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let Established {
            connection,
            profile,
            characteristic,
            notifications: stream,
        } = established;

        let weak = Arc::downgrade(&self.shared);
        let handler = self.shared.notifications.clone();
        let notifications = ScopedTask::spawn("serial-notifications", move |cancel_token| async move {
            let reason = match handler.pump(stream, cancel_token).await {
                StreamEnd::Cancelled => return,
                StreamEnd::Closed => "notification stream closed".to_string(),
                StreamEnd::Failed(failure) => failure.message,
            };
            if let Some(link) = DeviceLink::from_weak(&weak) {
                link.handle_link_loss(epoch, &reason).await;
            }
        });

        let weak = Arc::downgrade(&self.shared);
        let liveness = ScopedTask::every(
            "liveness-check",
            self.shared.config.liveness_interval(),
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(link) = DeviceLink::from_weak(&weak) {
                        link.verify_connection().await;
                    }
                }
            },
        );

        info!("Serial path ready on {} via {:?}", device, profile);
        ActiveLink {
            handle: DeviceHandle { device, connection },
            serial: SerialLink {
                profile,
                characteristic,
                notifications,
            },
            _liveness: liveness,
            epoch,
        }
    }

    /// Active liveness check. A failed check tears the link down and moves to
    /// `Disconnected`.
    pub async fn verify_connection(&self) -> bool {
        let mut inner = self.shared.inner.lock().await;
        let Some(active) = inner.active.as_ref() else {
            return false;
        };
        if active.serial.is_pumping() && active.handle.connection.is_connected().await {
            debug!("Liveness check passed for {}", active.handle.device);
            return true;
        }
        if let Some(active) = inner.active.take() {
            warn!("Liveness check failed for {}", active.handle.device);
            self.teardown(active, LinkState::Disconnected).await;
        }
        false
    }

    async fn handle_link_loss(&self, epoch: u64, reason: &str) {
        let mut inner = self.shared.inner.lock().await;
        if inner.active.as_ref().map(|active| active.epoch) != Some(epoch) {
            return;
        }
        if let Some(active) = inner.active.take() {
            warn!("Lost connection to {}: {}", active.handle.device, reason);
            self.teardown(active, LinkState::Disconnected).await;
        }
    }

    /// Sends one line; CR+LF is appended. Writes longer than the configured
    /// limit are split into consecutive characteristic writes.
    pub async fn send(&self, line: &str) -> Result<(), LinkError> {
        let command = SerialCommand::new(line);
        let mut inner = self.shared.inner.lock().await;

        let Some(active) = inner.active.as_ref() else {
            return Err(LinkError::new(ErrorKind::DeviceDisconnected, "no device is connected"));
        };
        let alive = active.handle.connection.is_connected().await;
        let characteristic = active.serial.characteristic.clone();
        if !alive {
            if let Some(active) = inner.active.take() {
                warn!("{} dropped before send", active.handle.device);
                self.teardown(active, LinkState::Disconnected).await;
            }
            return Err(LinkError::new(
                ErrorKind::DeviceDisconnected,
                "the device is no longer connected",
            ));
        }

        info!("Sending command to device: {:?} ({})", command.line(), self.serial_config());
        for frame in command.frames(self.shared.config.max_write_len) {
            if let Err(failure) = characteristic.write_value(&frame).await {
                let e = LinkError::from_failure(Operation::Write, failure);
                error!("Write failed: {}", e);
                if e.kind == ErrorKind::DeviceDisconnected {
                    if let Some(active) = inner.active.take() {
                        self.teardown(active, LinkState::Disconnected).await;
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Best-effort teardown. Never fails: sub-step errors are logged and the
    /// link always ends up not connected.
    pub async fn disconnect(&self) {
        // A running scan holds the link lock until it resolves.
        if self.state() == LinkState::Scanning {
            self.cancel_scan();
        }
        let mut inner = self.shared.inner.lock().await;
        inner.candidates.clear();
        match inner.active.take() {
            Some(active) => self.teardown(active, LinkState::Disconnected).await,
            None => {
                if self.state() == LinkState::AwaitingSelection {
                    self.set_state(LinkState::Idle);
                }
            }
        }
    }

    /// Releases everything. Called by the owner when shutting down.
    pub async fn dispose(&self) {
        self.cancel_scan();
        self.disconnect().await;
        info!("Device link disposed");
    }

    async fn teardown(&self, active: ActiveLink, next: LinkState) {
        let timeout = self.shared.config.operation_timeout();
        let device = &active.handle.device;
        info!("Disconnecting from {}", device);

        match tokio::time::timeout(timeout, active.serial.characteristic.stop_notifications()).await {
            Ok(Ok(())) => debug!("Notifications stopped"),
            Ok(Err(failure)) => warn!(
                "Failed to stop notifications on {} ({}): {}",
                device,
                classify(Operation::StopNotifications, &failure),
                failure
            ),
            Err(_) => warn!("Timed out stopping notifications on {}", device),
        }

        match tokio::time::timeout(timeout, active.handle.connection.disconnect()).await {
            Ok(Ok(())) => info!("Successfully disconnected"),
            Ok(Err(failure)) => warn!(
                "GATT disconnect of {} failed ({}): {}",
                device,
                classify(Operation::Disconnect, &failure),
                failure
            ),
            Err(_) => warn!("Timed out disconnecting {}", device),
        }

        self.set_state(next);
        // Last: this may be running on one of the tasks owned by `active`.
        drop(active);
    }
}
