//! Relay channel, device side
//! Mirrors device output and local user lines into the session's relay log and
//! executes support-authored records against the device link.
//!
//! Support records are detected twice: a push subscription on store inserts for
//! low latency, and a periodic poll that re-reads the whole log. Both paths feed
//! one executor queue and the executor claims each record in the
//! [`ExecutionLedger`] before sending, so a record reaches the device at most once.

use std::sync::Arc;

use log::{debug, error, info, warn};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};

use crate::config::relay_config::RelayConfig;
use crate::core::bluetooth::{DeviceLink, ErrorKind, LinkError, LinkEvent};
use crate::core::events::{EventBus, Subscription};
use crate::relay::ledger::ExecutionLedger;
use crate::relay::record::{NewRelayRecord, RELAY_TABLE, RecordId, RelayRecord, Sender, TranscriptLine};
use crate::relay::session::{SessionDirectory, SessionId, ShareSession};
use crate::relay::store::{ChangeEvent, Filter, Order, RecordStore, Row, StoreError, from_row, to_row};
use crate::utils::ScopedTask;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("already sharing session {0}")]
    AlreadySharing(SessionId),
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("session {0} has ended")]
    SessionEnded(SessionId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Full re-render of the session log, oldest first.
    Transcript(Vec<RelayRecord>),
    Executed { id: RecordId, command: String },
    ExecutionFailed { id: RecordId, command: String, error: LinkError },
    /// A local line that is shown but never stored.
    Notice(TranscriptLine),
}

/// Everything that exists only while a session is being shared.
struct ActiveShare {
    session: ShareSession,
    ledger: Arc<ExecutionLedger>,
    outbound: mpsc::UnboundedSender<NewRelayRecord>,
    link_lines: Subscription,
    support_push: Subscription,
    appender: ScopedTask,
    executor: ScopedTask,
    poller: ScopedTask,
    heartbeat: ScopedTask,
}

/// Handle to the device-side relay. Clones share state.
#[derive(Clone)]
pub struct RelayChannel {
    link: DeviceLink,
    directory: SessionDirectory,
    store: Arc<dyn RecordStore>,
    config: RelayConfig,
    events: EventBus<RelayEvent>,
    active: Arc<Mutex<Option<ActiveShare>>>,
}

impl RelayChannel {
    pub fn new(link: DeviceLink, directory: SessionDirectory, config: RelayConfig) -> Self {
        Self {
            store: directory.store(),
            link,
            directory,
            config,
            events: EventBus::new(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    pub async fn is_sharing(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn current_session(&self) -> Option<ShareSession> {
        self.active.lock().await.as_ref().map(|share| share.session.clone())
    }

    /// Number of support records executed in the current session.
    pub async fn executed_count(&self) -> usize {
        self.active
            .lock()
            .await
            .as_ref()
            .map_or(0, |share| share.ledger.len())
    }

    /// Opens a share session for the connected device and starts relaying.
    pub async fn start_sharing(&self, name: &str, user_label: &str) -> Result<ShareSession, RelayError> {
        let mut active = self.active.lock().await;
        if let Some(share) = active.as_ref() {
            return Err(RelayError::AlreadySharing(share.session.id.clone()));
        }

        let device = self.link.connected_device().await.ok_or_else(|| {
            LinkError::new(ErrorKind::DeviceDisconnected, "connect a device before sharing")
        })?;
        let session = self
            .directory
            .create_session(name, user_label, device.label())
            .await?;

        *active = Some(self.activate(session.clone())?);
        info!("Sharing {} as session {}", device, session.id);
        Ok(session)
    }

    fn activate(&self, session: ShareSession) -> Result<ActiveShare, RelayError> {
        let session_id = session.id.clone();
        let ledger = Arc::new(ExecutionLedger::new());
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<NewRelayRecord>();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel::<RelayRecord>();

        let lines_tx = outbound.clone();
        let lines_session = session_id.clone();
        let link_lines = self.link.subscribe(move |event| {
            if let LinkEvent::Line(line) = event {
                let record = NewRelayRecord::new(lines_session.clone(), Sender::Device, line.clone());
                if lines_tx.send(record).is_err() {
                    debug!("Relay appender gone, dropping device line");
                }
            }
        });

        let push_tx = exec_tx.clone();
        let push_ledger = ledger.clone();
        let support_push = self.store.subscribe(
            RELAY_TABLE,
            Filter::new()
                .eq("session_id", session_id.clone())
                .eq("sender", Sender::Support.as_str()),
            Some(ChangeEvent::Insert),
            Arc::new(move |_: ChangeEvent, row: &Row| match from_row::<RelayRecord>(RELAY_TABLE, row.clone()) {
                Ok(record) if !push_ledger.contains(&record.id) => {
                    debug!("Support record {} pushed", record.id);
                    if push_tx.send(record).is_err() {
                        debug!("Relay executor gone, dropping pushed support record");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Ignoring unreadable support record: {}", e),
            }),
        )?;

        let appender = Self::spawn_appender(self.store.clone(), outbound_rx);
        let executor = Self::spawn_executor(self.link.clone(), ledger.clone(), self.events.clone(), exec_rx);
        let poller = self.spawn_poller(session_id.clone(), ledger.clone(), exec_tx);

        let directory = self.directory.clone();
        let heartbeat = ScopedTask::every("share-heartbeat", self.config.heartbeat(), move || {
            let directory = directory.clone();
            let session_id = session_id.clone();
            async move {
                match directory.touch_session(&session_id).await {
                    Ok(true) => debug!("Session {} heartbeat", session_id),
                    Ok(false) => warn!("Session {} is no longer active", session_id),
                    Err(e) => warn!("Session heartbeat failed: {}", e),
                }
            }
        });

        Ok(ActiveShare {
            session,
            ledger,
            outbound,
            link_lines,
            support_push,
            appender,
            executor,
            poller,
            heartbeat,
        })
    }

    /// Appends outbound records in arrival order. A failed append is logged and
    /// the line stays visible locally.
    fn spawn_appender(
        store: Arc<dyn RecordStore>,
        mut outbound_rx: mpsc::UnboundedReceiver<NewRelayRecord>,
    ) -> ScopedTask {
        ScopedTask::spawn("relay-appender", move |cancel_token| async move {
            loop {
                let record = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    record = outbound_rx.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                let row = match to_row(RELAY_TABLE, &record) {
                    Ok(row) => row,
                    Err(e) => {
                        error!("Failed to encode relay record: {}", e);
                        continue;
                    }
                };
                if let Err(e) = store.insert(RELAY_TABLE, row).await {
                    warn!("Failed to append {} line to relay log: {}", record.sender, e);
                }
            }
        })
    }

    /// Executes queued support records. Claiming happens before the send, so a
    /// failed execution is not retried.
    fn spawn_executor(
        link: DeviceLink,
        ledger: Arc<ExecutionLedger>,
        events: EventBus<RelayEvent>,
        mut exec_rx: mpsc::UnboundedReceiver<RelayRecord>,
    ) -> ScopedTask {
        ScopedTask::spawn("relay-executor", move |cancel_token| async move {
            loop {
                let record = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    record = exec_rx.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                if !ledger.claim(&record.id) {
                    debug!("Support record {} already executed", record.id);
                    continue;
                }

                info!("Executing support command {:?} ({})", record.command, record.id);
                match link.send(&record.command).await {
                    Ok(()) => events.publish(&RelayEvent::Executed {
                        id: record.id,
                        command: record.command,
                    }),
                    Err(e) => {
                        error!("Support command {:?} failed: {}", record.command, e);
                        events.publish(&RelayEvent::Notice(TranscriptLine::notice(format!(
                            "Support command \"{}\" failed: {}. {}",
                            record.command,
                            e.kind,
                            e.hint()
                        ))));
                        events.publish(&RelayEvent::ExecutionFailed {
                            id: record.id,
                            command: record.command,
                            error: e,
                        });
                    }
                }
            }
        })
    }

    /// Re-reads the session log every poll interval, re-renders it and queues any
    /// support record not yet in the ledger.
    fn spawn_poller(
        &self,
        session_id: SessionId,
        ledger: Arc<ExecutionLedger>,
        exec_tx: mpsc::UnboundedSender<RelayRecord>,
    ) -> ScopedTask {
        let store = self.store.clone();
        let events = self.events.clone();
        ScopedTask::every("relay-poll", self.config.poll_interval(), move || {
            let store = store.clone();
            let events = events.clone();
            let ledger = ledger.clone();
            let exec_tx = exec_tx.clone();
            let session_id = session_id.clone();
            async move {
                let records = match load_records(store.as_ref(), &session_id).await {
                    Ok(records) => records,
                    Err(e) => {
                        warn!("Relay poll failed: {}", e);
                        return;
                    }
                };
                for record in records
                    .iter()
                    .filter(|record| record.sender == Sender::Support && !ledger.contains(&record.id))
                {
                    debug!("Support record {} found by poll", record.id);
                    if exec_tx.send(record.clone()).is_err() {
                        debug!("Relay executor gone, dropping polled support record");
                        break;
                    }
                }
                events.publish(&RelayEvent::Transcript(records));
            }
        })
    }

    /// Sends a line typed by the local user and echoes it into the relay log.
    pub async fn send_line(&self, line: &str) -> Result<(), RelayError> {
        self.link.send(line).await?;
        if let Some(share) = self.active.lock().await.as_ref() {
            let record = NewRelayRecord::new(share.session.id.clone(), Sender::User, line);
            if share.outbound.send(record).is_err() {
                warn!("Relay appender gone, user line not relayed");
            }
        }
        Ok(())
    }

    /// Stops relaying and closes the session. Returns whether an active session
    /// was closed.
    ///
    /// Lines already surfaced are still appended: the appender drains its queue
    /// (bounded by the drain timeout) before the session is closed.
    pub async fn stop_sharing(&self) -> Result<bool, RelayError> {
        let Some(share) = self.active.lock().await.take() else {
            return Ok(false);
        };
        let ActiveShare {
            session,
            ledger,
            outbound,
            link_lines,
            support_push,
            appender,
            executor,
            poller,
            heartbeat,
        } = share;
        let session_id = session.id;
        drop((support_push, poller, executor, heartbeat));
        debug!("Session {} executed {} support commands", session_id, ledger.len());

        // Closing the queue ends the appender once everything queued is stored.
        drop(link_lines);
        drop(outbound);
        let limit = self.config.drain_timeout();
        if !appender.join(limit).await {
            warn!("Relay log of session {} not fully flushed within {:?}", session_id, limit);
        }

        let closed = self.directory.close_session(&session_id).await?;
        info!("Stopped sharing session {}", session_id);
        Ok(closed)
    }

    pub async fn dispose(&self) {
        if let Err(e) = self.stop_sharing().await {
            warn!("Failed to close share session on dispose: {}", e);
        }
    }
}

/// The session's relay log, oldest first.
pub async fn load_records(
    store: &dyn RecordStore,
    session_id: &SessionId,
) -> Result<Vec<RelayRecord>, StoreError> {
    let rows = store
        .select(
            RELAY_TABLE,
            &Filter::new().eq("session_id", session_id.clone()),
            Some(&Order::asc("created_at")),
        )
        .await?;
    rows.into_iter().map(|row| from_row(RELAY_TABLE, row)).collect()
}
