//! Application state management
//! The composition root: builds every service from the config, starts them and
//! disposes of them in reverse order.

use std::sync::Arc;

use anyhow::Result;
use log::info;

use crate::config::AppConfig;
use crate::core::bluetooth::{BleTransport, DeviceLink};
use crate::relay::{RecordStore, RelayChannel, RelayError, RemoteViewer, SessionDirectory, SessionId};

/// Application state
pub struct AppState {
    pub config: AppConfig,
    pub link: DeviceLink,
    pub directory: SessionDirectory,
    pub relay: RelayChannel,
}

impl AppState {
    /// Builds and starts all services.
    pub fn init(
        config: AppConfig,
        transport: Arc<dyn BleTransport>,
        store: Arc<dyn RecordStore>,
    ) -> Result<Self> {
        info!("Initializing device link...");
        let link = DeviceLink::new(transport, config.link.clone());
        link.set_serial_config(config.serial);

        info!("Initializing session directory...");
        let directory = SessionDirectory::new(store, config.relay.clone());
        directory.init()?;

        let relay = RelayChannel::new(link.clone(), directory.clone(), config.relay.clone());
        Ok(Self {
            config,
            link,
            directory,
            relay,
        })
    }

    /// Opens a remote view onto a session through this state's store.
    pub async fn join_remote(&self, session_id: SessionId) -> Result<RemoteViewer, RelayError> {
        RemoteViewer::join(&self.directory, session_id, &self.config.relay).await
    }

    /// Stops sharing, disconnects and stops the directory.
    pub async fn dispose(&self) {
        self.relay.dispose().await;
        self.link.dispose().await;
        self.directory.dispose();
        info!("Application state disposed");
    }
}
