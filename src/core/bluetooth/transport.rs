//! Platform seam for the device link
//! The link only talks to the BLE platform through these traits, so the bluest
//! backend and the simulated backend are interchangeable.

use std::sync::Arc;

use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::core::bluetooth::error::PlatformFailure;
use crate::core::bluetooth::types::BluetoothDevice;

/// Discovery results in the order the platform reports them.
pub type DiscoveryStream = BoxStream<'static, Result<BluetoothDevice, PlatformFailure>>;

/// Raw notification payloads. The stream ends when the platform stops notifying,
/// which the link treats as a GATT-level drop.
pub type NotificationStream = BoxStream<'static, Result<Vec<u8>, PlatformFailure>>;

#[async_trait::async_trait]
pub trait BleTransport: Send + Sync {
    /// Fails when the platform has no usable Bluetooth capability.
    async fn availability(&self) -> Result<(), PlatformFailure>;

    /// Starts discovery. Filtering is left to the caller.
    async fn discover(&self) -> Result<DiscoveryStream, PlatformFailure>;

    /// GATT-level connect to a previously discovered device.
    async fn connect(&self, device_id: &str) -> Result<Box<dyn GattConnection>, PlatformFailure>;
}

#[async_trait::async_trait]
pub trait GattConnection: Send + Sync {
    /// Platform-reported connected flag.
    async fn is_connected(&self) -> bool;

    async fn primary_service(&self, uuid: Uuid) -> Result<Box<dyn GattService>, PlatformFailure>;

    async fn disconnect(&self) -> Result<(), PlatformFailure>;
}

#[async_trait::async_trait]
pub trait GattService: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn characteristic(
        &self,
        uuid: Uuid,
    ) -> Result<Arc<dyn GattCharacteristic>, PlatformFailure>;
}

#[async_trait::async_trait]
pub trait GattCharacteristic: Send + Sync {
    fn uuid(&self) -> Uuid;

    async fn start_notifications(&self) -> Result<NotificationStream, PlatformFailure>;

    async fn stop_notifications(&self) -> Result<(), PlatformFailure>;

    async fn write_value(&self, bytes: &[u8]) -> Result<(), PlatformFailure>;
}
