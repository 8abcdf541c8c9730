//! Bluetooth connection handling for serial modules
//! GATT connect followed by negotiation of the serial path: resolve a service,
//! resolve its characteristic, start notifications. Service profiles are tried in
//! preference order.

use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use crate::config::link_config::{LinkConfig, ServiceProfile};
use crate::core::bluetooth::error::{ErrorKind, LinkError, Operation, PlatformFailure};
use crate::core::bluetooth::transport::{
    BleTransport, GattCharacteristic, GattConnection, NotificationStream,
};
use crate::core::bluetooth::types::{BluetoothDevice, LinkState};

/// Everything a successful negotiation hands over to the link.
pub struct Established {
    pub connection: Box<dyn GattConnection>,
    pub profile: ServiceProfile,
    pub characteristic: Arc<dyn GattCharacteristic>,
    pub notifications: NotificationStream,
}

/// Connection manager for serial peripherals
pub struct ConnectionManager {
    transport: Arc<dyn BleTransport>,
    profiles: Vec<ServiceProfile>,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn BleTransport>, config: &LinkConfig) -> Self {
        Self {
            transport,
            profiles: config.profiles.clone(),
            max_attempts: config.connect_attempts.max(1),
            retry_delay: config.connect_retry_delay(),
        }
    }

    /// Connect with retry. Only `connection-failed` is retried; negotiation
    /// failures are properties of the device and fail immediately.
    /// `on_phase` is told about each Connecting/Negotiating transition.
    pub async fn connect_with_retry(
        &self,
        device: &BluetoothDevice,
        on_phase: &(dyn Fn(LinkState) + Send + Sync),
    ) -> Result<Established, LinkError> {
        let mut attempt = 1;
        loop {
            match self.try_connect(device, on_phase).await {
                Ok(established) => {
                    info!("Successfully connected to {}", device);
                    return Ok(established);
                }
                Err(e) if e.kind == ErrorKind::ConnectionFailed && attempt < self.max_attempts => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    info!("Retrying connection in {:?}...", self.retry_delay);
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    async fn try_connect(
        &self,
        device: &BluetoothDevice,
        on_phase: &(dyn Fn(LinkState) + Send + Sync),
    ) -> Result<Established, LinkError> {
        info!("Device details - ID: {}, Name: {:?}", device.id, device.name);
        on_phase(LinkState::Connecting);
        let connection = self
            .transport
            .connect(&device.id)
            .await
            .map_err(|f| LinkError::from_failure(Operation::Connect, f))?;

        info!("Connection successful, negotiating serial path...");
        on_phase(LinkState::Negotiating);
        match self.negotiate(connection.as_ref()).await {
            Ok((profile, characteristic, notifications)) => Ok(Established {
                connection,
                profile,
                characteristic,
                notifications,
            }),
            Err(e) => {
                // Leave nothing half-open behind a failed negotiation.
                if let Err(teardown) = connection.disconnect().await {
                    warn!("Cleanup after failed negotiation: {}", teardown);
                }
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        connection: &dyn GattConnection,
    ) -> Result<(ServiceProfile, Arc<dyn GattCharacteristic>, NotificationStream), LinkError> {
        let mut last_failure =
            PlatformFailure::other("No service profiles are configured for negotiation");

        for profile in &self.profiles {
            let service = match connection.primary_service(profile.service).await {
                Ok(service) => service,
                Err(failure) => {
                    info!("Service {} unavailable: {}", profile.service, failure);
                    last_failure = failure;
                    continue;
                }
            };
            info!("Found serial service: {}", service.uuid());

            let characteristic = service
                .characteristic(profile.characteristic)
                .await
                .map_err(|f| LinkError::from_failure(Operation::ResolveCharacteristic, f))?;
            info!("Found serial characteristic: {}", characteristic.uuid());

            info!("Setting up notifications...");
            let notifications = characteristic
                .start_notifications()
                .await
                .map_err(|f| LinkError::from_failure(Operation::StartNotifications, f))?;

            return Ok((*profile, characteristic, notifications));
        }

        Err(LinkError::from_failure(Operation::ResolveService, last_failure))
    }
}
