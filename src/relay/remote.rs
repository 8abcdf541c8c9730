//! Relay channel, remote side
//! A viewer with no BLE connection. It re-renders the session log from the store
//! on every poll tick and on every insert it is told about, sends support commands
//! by appending records, and notices when the session is no longer active.
//! The end is only declared after the store confirms the session is inactive.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior, interval_at};

use crate::config::relay_config::RelayConfig;
use crate::core::events::{EventBus, Subscription};
use crate::relay::channel::{RelayError, load_records};
use crate::relay::record::{
    NewRelayRecord, RELAY_TABLE, RelayRecord, Sender, TranscriptLine, render_transcript,
};
use crate::relay::session::{SESSION_TABLE, SessionDirectory, SessionId, ShareSession};
use crate::relay::store::{ChangeEvent, Filter, RecordStore, Row, StoreError, from_row, to_row};
use crate::utils::ScopedTask;

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Transcript(Vec<TranscriptLine>),
    /// The device side stopped sharing. Emitted once; the view is torn down.
    SessionEnded(SessionId),
}

struct ViewerTasks {
    _poller: ScopedTask,
    _inserts: Subscription,
    _directory: Subscription,
}

struct ViewerShared {
    store: Arc<dyn RecordStore>,
    session: ShareSession,
    events: EventBus<RemoteEvent>,
    ended: AtomicBool,
    tasks: Mutex<Option<ViewerTasks>>,
}

impl ViewerShared {
    /// Fresh read of the session row. A missing row counts as inactive.
    async fn session_is_active(&self) -> Result<bool, StoreError> {
        let rows = self
            .store
            .select(
                SESSION_TABLE,
                &Filter::new().eq("id", self.session.id.clone()),
                None,
            )
            .await?;
        match rows.into_iter().next() {
            Some(row) => Ok(from_row::<ShareSession>(SESSION_TABLE, row)?.is_active),
            None => Ok(false),
        }
    }

    fn take_tasks(&self) -> Option<ViewerTasks> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Option<ViewerTasks>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tears the view down and tells listeners, at most once.
    fn end(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Session {} is no longer active", self.session.id);
        drop(self.take_tasks());
        self.events.publish(&RemoteEvent::SessionEnded(self.session.id.clone()));
    }
}

/// Handle to a joined session. Clones share state.
#[derive(Clone)]
pub struct RemoteViewer {
    shared: Arc<ViewerShared>,
}

impl RemoteViewer {
    /// Joins an active session. The directory is started if it is not running yet,
    /// since session-end detection depends on it.
    pub async fn join(
        directory: &SessionDirectory,
        session_id: SessionId,
        config: &RelayConfig,
    ) -> Result<Self, RelayError> {
        let session = directory
            .get_session(&session_id)
            .await?
            .ok_or_else(|| RelayError::SessionNotFound(session_id.clone()))?;
        if !session.is_active {
            return Err(RelayError::SessionEnded(session_id));
        }
        directory.init()?;

        let shared = Arc::new(ViewerShared {
            store: directory.store(),
            session,
            events: EventBus::new(),
            ended: AtomicBool::new(false),
            tasks: Mutex::new(None),
        });
        let rerender = Arc::new(Notify::new());

        let signal = rerender.clone();
        let inserts = shared.store.subscribe(
            RELAY_TABLE,
            Filter::new().eq("session_id", session_id.clone()),
            Some(ChangeEvent::Insert),
            Arc::new(move |_: ChangeEvent, _: &Row| signal.notify_one()),
        )?;

        // A directory snapshot can predate the session, so absence from the list
        // only prompts a re-check against the store.
        let missing = Arc::new(Notify::new());
        let signal = missing.clone();
        let watched = session_id.clone();
        let directory_watch = directory.subscribe(move |sessions| {
            if !sessions.iter().any(|session| session.id == watched) {
                signal.notify_one();
            }
        });

        let weak = Arc::downgrade(&shared);
        let period = config.poll_interval();
        let poller = ScopedTask::spawn("remote-poll", move |cancel_token| async move {
            let mut timer = interval_at(Instant::now(), period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                let recheck = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    _ = timer.tick() => false,
                    _ = rerender.notified() => {
                        debug!("Re-rendering on insert");
                        false
                    }
                    _ = missing.notified() => true,
                };
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if recheck {
                    match shared.session_is_active().await {
                        Ok(true) => debug!("Session {} still active, stale directory snapshot", shared.session.id),
                        Ok(false) => {
                            shared.end();
                            break;
                        }
                        Err(e) => warn!("Session status check failed: {}", e),
                    }
                    continue;
                }
                let viewer = RemoteViewer { shared };
                match viewer.render().await {
                    Ok(lines) => viewer.shared.events.publish(&RemoteEvent::Transcript(lines)),
                    Err(e) => warn!("Remote render failed: {}", e),
                }
            }
        });

        *shared.lock_tasks() = Some(ViewerTasks {
            _poller: poller,
            _inserts: inserts,
            _directory: directory_watch,
        });
        if shared.ended.load(Ordering::SeqCst) {
            drop(shared.take_tasks());
        }
        info!("Joined share session {} ({})", shared.session.id, shared.session.name);
        Ok(Self { shared })
    }

    pub fn session(&self) -> &ShareSession {
        &self.shared.session
    }

    pub fn is_ended(&self) -> bool {
        self.shared.ended.load(Ordering::SeqCst)
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RemoteEvent) + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    /// Full render of the session log from the store.
    pub async fn render(&self) -> Result<Vec<TranscriptLine>, StoreError> {
        let records = load_records(self.shared.store.as_ref(), &self.shared.session.id).await?;
        Ok(render_transcript(&records))
    }

    /// Appends a support command for the device side to execute.
    pub async fn send_command(&self, command: &str) -> Result<RelayRecord, RelayError> {
        if self.is_ended() {
            return Err(RelayError::SessionEnded(self.shared.session.id.clone()));
        }
        let record = NewRelayRecord::new(self.shared.session.id.clone(), Sender::Support, command);
        let row = self
            .shared
            .store
            .insert(RELAY_TABLE, to_row(RELAY_TABLE, &record)?)
            .await?;
        Ok(from_row(RELAY_TABLE, row)?)
    }

    /// Leaves the session without the ended notification.
    pub fn leave(&self) {
        self.shared.ended.store(true, Ordering::SeqCst);
        if self.shared.take_tasks().is_some() {
            info!("Left share session {}", self.shared.session.id);
        }
    }
}
