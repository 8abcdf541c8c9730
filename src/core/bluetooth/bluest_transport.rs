//! bluest-backed implementation of the transport traits

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::error::{FailureCategory, PlatformFailure};
use crate::core::bluetooth::transport::{
    BleTransport, DiscoveryStream, GattCharacteristic, GattConnection, GattService,
    NotificationStream,
};
use crate::core::bluetooth::types::BluetoothDevice;

const ADAPTER_WAIT: Duration = Duration::from_secs(5);

fn failure_from(err: bluest::Error) -> PlatformFailure {
    use bluest::error::ErrorKind;

    let category = match err.kind() {
        ErrorKind::AdapterUnavailable | ErrorKind::NotSupported => FailureCategory::Unsupported,
        ErrorKind::NotAuthorized => FailureCategory::Permission,
        ErrorKind::NotConnected => FailureCategory::NotConnected,
        ErrorKind::NotFound => FailureCategory::NotFound,
        ErrorKind::Timeout => FailureCategory::Timeout,
        ErrorKind::Protocol(_) => FailureCategory::Protocol,
        _ => FailureCategory::Other,
    };
    PlatformFailure::new(category, err.to_string())
}

/// Turns a channel receiver into the boxed streams the traits hand out.
fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> futures_util::stream::BoxStream<'static, T> {
    futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) })
        .boxed()
}

/// Transport over the system's default Bluetooth adapter.
pub struct BluestTransport {
    adapter: Adapter,
    /// Devices seen by discovery, by platform id
    devices: Arc<Mutex<HashMap<String, Device>>>,
}

impl BluestTransport {
    pub async fn new() -> Result<Self, PlatformFailure> {
        let adapter = Adapter::default().await.ok_or_else(|| {
            PlatformFailure::new(FailureCategory::Unsupported, "No Bluetooth adapter found")
        })?;
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn remember(devices: &Mutex<HashMap<String, Device>>, device: Device, name: Option<String>, rssi: Option<i16>) -> BluetoothDevice {
        let id = device.id().to_string();
        let name = name.or_else(|| device.name().ok());
        devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), device);
        BluetoothDevice::new(id, name, rssi)
    }
}

#[async_trait::async_trait]
impl BleTransport for BluestTransport {
    async fn availability(&self) -> Result<(), PlatformFailure> {
        match tokio::time::timeout(ADAPTER_WAIT, self.adapter.wait_available()).await {
            Ok(result) => result.map_err(failure_from),
            Err(_) => Err(PlatformFailure::new(
                FailureCategory::Unsupported,
                "Bluetooth adapter is not available",
            )),
        }
    }

    async fn discover(&self) -> Result<DiscoveryStream, PlatformFailure> {
        let (tx, rx) = mpsc::channel(16);
        let adapter = self.adapter.clone();
        let devices = self.devices.clone();

        tokio::spawn(async move {
            // Devices already connected at the OS level never advertise.
            match adapter.connected_devices().await {
                Ok(connected) => {
                    for device in connected {
                        let found = Self::remember(&devices, device, None, None);
                        if tx.send(Ok(found)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => debug!("Could not list connected devices: {}", e),
            }

            info!("Starting bluetooth scan");
            let mut scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(failure_from(e))).await;
                    return;
                }
            };

            while let Some(discovered) = scan_stream.next().await {
                debug!("Found device - Device: {:?}, RSSI: {:?}", discovered.device, discovered.rssi);
                let found = Self::remember(
                    &devices,
                    discovered.device,
                    discovered.adv_data.local_name.clone(),
                    discovered.rssi,
                );
                if tx.send(Ok(found)).await.is_err() {
                    break;
                }
            }
            info!("Bluetooth scan stream has ended.");
        });

        Ok(receiver_stream(rx))
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn GattConnection>, PlatformFailure> {
        let device = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(device_id)
            .cloned()
            .ok_or_else(|| {
                PlatformFailure::new(
                    FailureCategory::NotFound,
                    format!("Device not found with ID: {}", device_id),
                )
            })?;

        if !device.is_connected().await {
            info!("Initiating connection to {}...", device_id);
            self.adapter.connect_device(&device).await.map_err(failure_from)?;
        }

        Ok(Box::new(BluestConnection {
            adapter: self.adapter.clone(),
            device,
        }))
    }
}

struct BluestConnection {
    adapter: Adapter,
    device: Device,
}

#[async_trait::async_trait]
impl GattConnection for BluestConnection {
    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn GattService>, PlatformFailure> {
        let services = self
            .device
            .discover_services_with_uuid(uuid)
            .await
            .map_err(failure_from)?;
        let service = services.into_iter().next().ok_or_else(|| {
            PlatformFailure::new(
                FailureCategory::NotFound,
                format!("No Services matching UUID {} found in Device.", uuid),
            )
        })?;
        Ok(Box::new(BluestService { service }))
    }

    async fn disconnect(&self) -> Result<(), PlatformFailure> {
        if self.device.is_connected().await {
            info!("Disconnecting from device {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(failure_from)?;
        } else {
            info!("Device {} not connected", self.device.id());
        }
        Ok(())
    }
}

struct BluestService {
    service: Service,
}

#[async_trait::async_trait]
impl GattService for BluestService {
    fn uuid(&self) -> Uuid {
        self.service.uuid()
    }

    async fn characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<Arc<dyn GattCharacteristic>, PlatformFailure> {
        let characteristics = self
            .service
            .discover_characteristics_with_uuid(uuid)
            .await
            .map_err(failure_from)?;
        let characteristic = characteristics.into_iter().next().ok_or_else(|| {
            PlatformFailure::new(
                FailureCategory::NotFound,
                format!("No Characteristics matching UUID {} found in Service.", uuid),
            )
        })?;
        Ok(Arc::new(BluestCharacteristic {
            characteristic,
            notify_token: Mutex::new(None),
        }))
    }
}

struct BluestCharacteristic {
    characteristic: Characteristic,
    notify_token: Mutex<Option<CancellationToken>>,
}

#[async_trait::async_trait]
impl GattCharacteristic for BluestCharacteristic {
    fn uuid(&self) -> Uuid {
        self.characteristic.uuid()
    }

    async fn start_notifications(&self) -> Result<NotificationStream, PlatformFailure> {
        let cancel_token = CancellationToken::new();
        if let Some(previous) = self
            .notify_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(cancel_token.clone())
        {
            previous.cancel();
        }

        let (tx, rx) = mpsc::channel(64);
        let (ready_tx, ready_rx) = oneshot::channel();
        let characteristic = self.characteristic.clone();

        // bluest ties the notification stream to the characteristic it came from,
        // so a task owns both and forwards payloads.
        tokio::spawn(async move {
            let mut stream = match characteristic.notify().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(failure_from(e)));
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(value)) => {
                            if tx.send(Ok(value)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(failure_from(e))).await;
                            break;
                        }
                        None => break,
                    }
                }
            }
            debug!("Notification forwarder for {} finished", characteristic.uuid());
        });

        match ready_rx.await {
            Ok(Ok(())) => Ok(receiver_stream(rx)),
            Ok(Err(failure)) => Err(failure),
            Err(_) => Err(PlatformFailure::other("Notification task ended before subscribing")),
        }
    }

    async fn stop_notifications(&self) -> Result<(), PlatformFailure> {
        match self
            .notify_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(token) => token.cancel(),
            None => warn!("stop_notifications called without an active subscription"),
        }
        Ok(())
    }

    async fn write_value(&self, bytes: &[u8]) -> Result<(), PlatformFailure> {
        self.characteristic.write(bytes).await.map_err(failure_from)
    }
}
