//! Session directory
//! Share sessions live in the backing store. The directory creates and closes
//! them and keeps listeners informed of the active set, reconciling on a timer in
//! addition to store push events.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::relay_config::{RelayConfig, RetentionPolicy};
use crate::core::events::{EventBus, Subscription};
use crate::relay::record::RELAY_TABLE;
use crate::relay::store::{ChangeEvent, Filter, Order, RecordStore, Row, StoreError, from_row};
use crate::utils::ScopedTask;

pub const SESSION_TABLE: &str = "share_sessions";

/// Store-assigned session id; the join key handed to the remote party.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SessionId> for Value {
    fn from(id: SessionId) -> Self {
        Value::String(id.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSession {
    pub id: SessionId,
    pub name: String,
    pub user_label: String,
    pub device_label: String,
    #[serde(rename = "created_at")]
    pub start_time: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub is_active: bool,
}

struct DirectoryTasks {
    _refresher: ScopedTask,
    _push: Subscription,
}

struct DirectoryShared {
    store: Arc<dyn RecordStore>,
    config: RelayConfig,
    listeners: EventBus<Vec<ShareSession>>,
    refresh_signal: Arc<Notify>,
    tasks: Mutex<Option<DirectoryTasks>>,
}

fn row_of(value: Value) -> Row {
    match value {
        Value::Object(row) => row,
        _ => Row::new(),
    }
}

/// Handle to the session directory. Clones share state.
#[derive(Clone)]
pub struct SessionDirectory {
    shared: Arc<DirectoryShared>,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn RecordStore>, config: RelayConfig) -> Self {
        Self {
            shared: Arc::new(DirectoryShared {
                store,
                config,
                listeners: EventBus::new(),
                refresh_signal: Arc::new(Notify::new()),
                tasks: Mutex::new(None),
            }),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Option<DirectoryTasks>> {
        self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.shared.store.clone()
    }

    /// Starts the push subscription and the periodic refresh. Idempotent.
    pub fn init(&self) -> Result<(), StoreError> {
        let mut tasks = self.tasks();
        if tasks.is_some() {
            return Ok(());
        }

        let signal = self.shared.refresh_signal.clone();
        let push = self.shared.store.subscribe(
            SESSION_TABLE,
            Filter::new(),
            None,
            Arc::new(move |event: ChangeEvent, row: &Row| {
                debug!("Session table {:?}: {:?}", event, row.get("id"));
                signal.notify_one();
            }),
        )?;

        let weak = Arc::downgrade(&self.shared);
        let signal = self.shared.refresh_signal.clone();
        let period = self.shared.config.directory_refresh();
        let refresher = ScopedTask::spawn("session-directory-refresh", move |cancel_token| async move {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = timer.tick() => {}
                    _ = signal.notified() => {}
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = (SessionDirectory { shared }).refresh().await {
                    warn!("Session directory refresh failed: {}", e);
                }
            }
        });

        *tasks = Some(DirectoryTasks {
            _refresher: refresher,
            _push: push,
        });
        info!("Session directory started, refreshing every {:?}", period);
        Ok(())
    }

    /// Stops the refresh timer and the push subscription.
    pub fn dispose(&self) {
        if self.tasks().take().is_some() {
            info!("Session directory disposed");
        }
    }

    /// Reads the active set and hands it to every listener.
    pub async fn refresh(&self) -> Result<Vec<ShareSession>, StoreError> {
        let sessions = self.list_active_sessions().await?;
        self.shared.listeners.publish(&sessions);
        Ok(sessions)
    }

    /// The listener gets the full active list after every observed change and on
    /// every refresh tick, asynchronously with respect to the change itself.
    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&Vec<ShareSession>) + Send + Sync + 'static,
    {
        let subscription = self.shared.listeners.subscribe(listener);
        self.shared.refresh_signal.notify_one();
        subscription
    }

    pub async fn create_session(
        &self,
        name: &str,
        user_label: &str,
        device_label: &str,
    ) -> Result<ShareSession, StoreError> {
        let row = row_of(json!({
            "name": name,
            "user_label": user_label,
            "device_label": device_label,
            "last_active": Utc::now(),
            "is_active": true,
        }));
        let stored = self.shared.store.insert(SESSION_TABLE, row).await?;
        let session: ShareSession = from_row(SESSION_TABLE, stored)?;
        info!("Created share session {} ({})", session.id, session.name);
        Ok(session)
    }

    pub async fn get_session(&self, id: &SessionId) -> Result<Option<ShareSession>, StoreError> {
        let rows = self
            .shared
            .store
            .select(SESSION_TABLE, &Filter::new().eq("id", id.clone()), None)
            .await?;
        rows.into_iter()
            .next()
            .map(|row| from_row(SESSION_TABLE, row))
            .transpose()
    }

    /// Always a fresh read of the store.
    pub async fn list_active_sessions(&self) -> Result<Vec<ShareSession>, StoreError> {
        let rows = self
            .shared
            .store
            .select(
                SESSION_TABLE,
                &Filter::new().eq("is_active", true),
                Some(&Order::asc("created_at")),
            )
            .await?;
        rows.into_iter().map(|row| from_row(SESSION_TABLE, row)).collect()
    }

    /// Marks the session inactive. Returns whether an active session matched.
    pub async fn close_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let closed = self
            .shared
            .store
            .update(
                SESSION_TABLE,
                &Filter::new().eq("id", id.clone()).eq("is_active", true),
                row_of(json!({ "is_active": false, "last_active": Utc::now() })),
            )
            .await?;
        if closed == 0 {
            return Ok(false);
        }
        info!("Closed share session {}", id);

        if self.shared.config.retention == RetentionPolicy::PurgeOnClose {
            let purged = self
                .shared
                .store
                .delete(RELAY_TABLE, &Filter::new().eq("session_id", id.clone()))
                .await?;
            info!("Purged {} relay records of session {}", purged, id);
        }
        Ok(true)
    }

    /// Refreshes `last_active` of an active session.
    pub async fn touch_session(&self, id: &SessionId) -> Result<bool, StoreError> {
        let touched = self
            .shared
            .store
            .update(
                SESSION_TABLE,
                &Filter::new().eq("id", id.clone()).eq("is_active", true),
                row_of(json!({ "last_active": Utc::now() })),
            )
            .await?;
        Ok(touched > 0)
    }

    /// Hard-deletes inactive sessions together with their relay records.
    /// Returns the number of sessions removed.
    pub async fn cleanup_inactive(&self) -> Result<usize, StoreError> {
        let inactive = Filter::new().eq("is_active", false);
        let rows = self.shared.store.select(SESSION_TABLE, &inactive, None).await?;
        for row in rows {
            let session: ShareSession = from_row(SESSION_TABLE, row)?;
            self.shared
                .store
                .delete(RELAY_TABLE, &Filter::new().eq("session_id", session.id.clone()))
                .await?;
        }
        let removed = self.shared.store.delete(SESSION_TABLE, &inactive).await?;
        if removed > 0 {
            info!("Removed {} inactive share sessions", removed);
        }
        Ok(removed)
    }
}
