use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_serial_relay_lib::config::link_config::LinkConfig;
use ble_serial_relay_lib::config::relay_config::{RelayConfig, RetentionPolicy};
use ble_serial_relay_lib::core::bluetooth::{
    DeviceLink, ErrorKind, LinkEvent, SimulatedPeripheral, SimulatedTransport,
};
use ble_serial_relay_lib::core::events::Subscription;
use ble_serial_relay_lib::relay::record::RELAY_TABLE;
use ble_serial_relay_lib::relay::session::SESSION_TABLE;
use ble_serial_relay_lib::relay::{
    ChangeEvent, Filter, MemoryStore, Order, RecordStore, RelayChannel, RelayError, RelayEvent,
    RemoteEvent, RemoteViewer, Sender, SessionDirectory, SessionId, ShareSession, StoreError,
    TranscriptLine,
};
use ble_serial_relay_lib::relay::store::{ChangeListener, Row};

/// Delegates to a `MemoryStore` but never delivers push notifications, so only
/// the polling paths can observe changes.
#[derive(Clone, Default)]
struct LossyStore {
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl RecordStore for LossyStore {
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        self.inner.insert(table, row).await
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.select(table, filter, order).await
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        self.inner.update(table, filter, patch).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.delete(table, filter).await
    }

    fn subscribe(
        &self,
        _table: &str,
        _filter: Filter,
        _event: Option<ChangeEvent>,
        _listener: ChangeListener,
    ) -> Result<Subscription, StoreError> {
        Ok(Subscription::new(|| {}))
    }
}

/// Delegates to a `MemoryStore`. The first session read captures its rows and
/// returns them late, so the directory publishes a list older than later writes.
#[derive(Default)]
struct StaleSnapshotStore {
    inner: MemoryStore,
    stalled: AtomicBool,
}

#[async_trait::async_trait]
impl RecordStore for StaleSnapshotStore {
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        self.inner.insert(table, row).await
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        let rows = self.inner.select(table, filter, order).await?;
        if table == SESSION_TABLE && !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        Ok(rows)
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        self.inner.update(table, filter, patch).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.delete(table, filter).await
    }

    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        event: Option<ChangeEvent>,
        listener: ChangeListener,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe(table, filter, event, listener)
    }
}

/// Delegates to a `MemoryStore` with every insert taking a while.
struct SlowInsertStore {
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl RecordStore for SlowInsertStore {
    async fn insert(&self, table: &str, row: Row) -> Result<Row, StoreError> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.inner.insert(table, row).await
    }

    async fn select(
        &self,
        table: &str,
        filter: &Filter,
        order: Option<&Order>,
    ) -> Result<Vec<Row>, StoreError> {
        self.inner.select(table, filter, order).await
    }

    async fn update(&self, table: &str, filter: &Filter, patch: Row) -> Result<usize, StoreError> {
        self.inner.update(table, filter, patch).await
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.delete(table, filter).await
    }

    fn subscribe(
        &self,
        table: &str,
        filter: Filter,
        event: Option<ChangeEvent>,
        listener: ChangeListener,
    ) -> Result<Subscription, StoreError> {
        self.inner.subscribe(table, filter, event, listener)
    }
}

struct Harness {
    transport: SimulatedTransport,
    link: DeviceLink,
    directory: SessionDirectory,
    channel: RelayChannel,
    config: RelayConfig,
}

fn fast_config() -> RelayConfig {
    RelayConfig {
        poll_interval_ms: 50,
        directory_refresh_secs: 1,
        heartbeat_secs: 1,
        ..RelayConfig::default()
    }
}

async fn connected(store: Arc<dyn RecordStore>, config: RelayConfig, responder: bool) -> Harness {
    let peripheral = SimulatedPeripheral::serial_module("dev-1", "86-Sensor");
    let peripheral = if responder {
        peripheral.with_at_responder()
    } else {
        peripheral
    };
    let transport = SimulatedTransport::new(vec![peripheral]);
    let link = DeviceLink::new(Arc::new(transport.clone()), LinkConfig::default());
    link.connect("dev-1").await.unwrap();
    let directory = SessionDirectory::new(store, config.clone());
    let channel = RelayChannel::new(link.clone(), directory.clone(), config.clone());
    Harness {
        transport,
        link,
        directory,
        channel,
        config,
    }
}

async fn sharing(store: Arc<dyn RecordStore>, config: RelayConfig, responder: bool) -> (Harness, ShareSession) {
    let harness = connected(store, config, responder).await;
    let session = harness
        .channel
        .start_sharing("bench test", "alice")
        .await
        .unwrap();
    (harness, session)
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..300 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn collect_relay_events(channel: &RelayChannel) -> (Arc<Mutex<Vec<RelayEvent>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = channel.subscribe(move |event| {
        if !matches!(event, RelayEvent::Transcript(_)) {
            sink.lock().unwrap().push(event.clone());
        }
    });
    (events, subscription)
}

fn count_lines(transport: &SimulatedTransport, line: &str) -> usize {
    transport.sent_lines().iter().filter(|sent| *sent == line).count()
}

#[tokio::test]
async fn every_support_record_executes_exactly_once() {
    let store = Arc::new(MemoryStore::new());
    let (harness, session) = sharing(store, fast_config(), true).await;
    let (events, _subscription) = collect_relay_events(&harness.channel);
    let remote = RemoteViewer::join(&harness.directory, session.id.clone(), &harness.config)
        .await
        .unwrap();

    // Identical text on purpose: records are told apart by id, never by content.
    for _ in 0..5 {
        remote.send_command("AT").await.unwrap();
    }
    remote.send_command("AT+STATUS").await.unwrap();

    assert!(wait_for(|| count_lines(&harness.transport, "AT") == 5).await);
    assert!(wait_for(|| count_lines(&harness.transport, "AT+STATUS") == 1).await);

    // Several more poll ticks must not execute anything again.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count_lines(&harness.transport, "AT"), 5);
    assert_eq!(count_lines(&harness.transport, "AT+STATUS"), 1);
    assert_eq!(harness.channel.executed_count().await, 6);

    let executed: Vec<_> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            RelayEvent::Executed { id, .. } => Some(id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(executed.len(), 6);
    assert_eq!(executed.iter().collect::<HashSet<_>>().len(), 6);
}

#[tokio::test]
async fn polling_executes_support_records_when_push_is_lost() {
    let store = Arc::new(LossyStore::default());
    let (harness, session) = sharing(store, fast_config(), false).await;
    let remote = RemoteViewer::join(&harness.directory, session.id.clone(), &harness.config)
        .await
        .unwrap();

    remote.send_command("AT+VERSION").await.unwrap();
    assert!(wait_for(|| count_lines(&harness.transport, "AT+VERSION") == 1).await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count_lines(&harness.transport, "AT+VERSION"), 1);
}

#[tokio::test]
async fn device_output_reaches_the_remote_transcript_in_order() {
    let store = Arc::new(MemoryStore::new());
    let (harness, session) = sharing(store, fast_config(), false).await;
    let remote = RemoteViewer::join(&harness.directory, session.id.clone(), &harness.config)
        .await
        .unwrap();
    let transcript = Arc::new(Mutex::new(Vec::<TranscriptLine>::new()));
    let sink = transcript.clone();
    let _view = remote.subscribe(move |event| {
        if let RemoteEvent::Transcript(lines) = event {
            *sink.lock().unwrap() = lines.clone();
        }
    });

    harness.channel.send_line("AT+STATUS").await.unwrap();
    harness.transport.push_notification(b"STATUS: READY\r\n");

    assert!(wait_for(|| transcript.lock().unwrap().len() == 2).await);
    let rendered: Vec<String> = transcript
        .lock()
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(rendered, vec!["[user] AT+STATUS", "[device] STATUS: READY"]);

    let lines = remote.render().await.unwrap();
    assert_eq!(lines[1].sender, Some(Sender::Device));
    assert!(lines[0].timestamp < lines[1].timestamp);
}

#[tokio::test]
async fn store_failures_do_not_hide_device_output() {
    let store = Arc::new(MemoryStore::new());
    let (harness, _session) = sharing(store.clone(), fast_config(), false).await;
    let shown = Arc::new(Mutex::new(Vec::new()));
    let sink = shown.clone();
    let _display = harness.link.subscribe(move |event| {
        if let LinkEvent::Line(line) = event {
            sink.lock().unwrap().push(line.clone());
        }
    });

    store.set_fail_writes(true);
    harness.transport.push_notification(b"TEMP=21.5\r\n");
    assert!(wait_for(|| shown.lock().unwrap().len() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.row_count(RELAY_TABLE), 0);
    assert!(harness.channel.is_sharing().await);

    store.set_fail_writes(false);
    harness.transport.push_notification(b"TEMP=21.6\r\n");
    assert!(wait_for(|| store.row_count(RELAY_TABLE) == 1).await);
    assert_eq!(*shown.lock().unwrap(), vec!["TEMP=21.5", "TEMP=21.6"]);
}

#[tokio::test]
async fn failed_support_command_is_reported_and_not_retried() {
    let store = Arc::new(MemoryStore::new());
    let (harness, session) = sharing(store, fast_config(), false).await;
    let (events, _subscription) = collect_relay_events(&harness.channel);
    let remote = RemoteViewer::join(&harness.directory, session.id.clone(), &harness.config)
        .await
        .unwrap();

    harness.transport.set_fail_writes(true);
    remote.send_command("AT+RESET").await.unwrap();
    assert!(
        wait_for(|| events
            .lock()
            .unwrap()
            .iter()
            .any(|event| matches!(event, RelayEvent::ExecutionFailed { .. })))
        .await
    );

    harness.transport.set_fail_writes(false);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count_lines(&harness.transport, "AT+RESET"), 0);

    let events = events.lock().unwrap();
    let failures: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            RelayEvent::ExecutionFailed { command, error, .. } => Some((command.clone(), error.kind)),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![("AT+RESET".to_string(), ErrorKind::WriteFailed)]);
    let notice = events.iter().find_map(|event| match event {
        RelayEvent::Notice(line) => Some(line.clone()),
        _ => None,
    });
    let notice = notice.unwrap();
    assert_eq!(notice.sender, None);
    assert!(notice.text.contains("AT+RESET"));
    assert!(notice.text.contains("write-failed"));
}

#[tokio::test]
async fn user_lines_are_relayed_only_after_a_successful_send() {
    let store = Arc::new(MemoryStore::new());
    let (harness, session) = sharing(store.clone(), fast_config(), false).await;

    harness.transport.set_fail_writes(true);
    let error = harness.channel.send_line("AT").await.unwrap_err();
    assert!(matches!(error, RelayError::Link(ref e) if e.kind == ErrorKind::WriteFailed));

    harness.transport.set_fail_writes(false);
    harness.channel.send_line("AT+NAME").await.unwrap();
    assert!(wait_for(|| store.row_count(RELAY_TABLE) == 1).await);

    let rows = store
        .select(
            RELAY_TABLE,
            &Filter::new().eq("session_id", session.id.clone()),
            None,
        )
        .await
        .unwrap();
    assert_eq!(rows[0]["command"], "AT+NAME");
    assert_eq!(rows[0]["sender"], "user");
}

#[tokio::test]
async fn remote_notices_when_the_session_ends() {
    let store = Arc::new(MemoryStore::new());
    let (harness, session) = sharing(store, fast_config(), false).await;
    let remote = RemoteViewer::join(&harness.directory, session.id.clone(), &harness.config)
        .await
        .unwrap();
    let ended = Arc::new(Mutex::new(Vec::new()));
    let sink = ended.clone();
    let _watch = remote.subscribe(move |event| {
        if let RemoteEvent::SessionEnded(id) = event {
            sink.lock().unwrap().push(id.clone());
        }
    });

    assert!(harness.channel.stop_sharing().await.unwrap());
    assert!(!harness.channel.is_sharing().await);
    assert!(wait_for(|| ended.lock().unwrap().len() == 1).await);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(*ended.lock().unwrap(), vec![session.id.clone()]);
    assert!(remote.is_ended());
    let error = remote.send_command("AT").await.unwrap_err();
    assert!(matches!(error, RelayError::SessionEnded(_)));
}

#[tokio::test]
async fn outdated_directory_list_does_not_end_a_live_view() {
    let store = Arc::new(StaleSnapshotStore::default());
    let config = fast_config();
    let directory = SessionDirectory::new(store, config.clone());
    directory.init().unwrap();
    let _listener = directory.subscribe(|_| {});
    tokio::time::sleep(Duration::from_millis(20)).await;

    let session = directory.create_session("bench", "alice", "86-Sensor").await.unwrap();
    let remote = RemoteViewer::join(&directory, session.id.clone(), &config)
        .await
        .unwrap();
    let ended = Arc::new(Mutex::new(Vec::new()));
    let sink = ended.clone();
    let _watch = remote.subscribe(move |event| {
        if let RemoteEvent::SessionEnded(id) = event {
            sink.lock().unwrap().push(id.clone());
        }
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!remote.is_ended());
    assert!(ended.lock().unwrap().is_empty());
    let stored = directory.get_session(&session.id).await.unwrap().unwrap();
    assert!(stored.is_active);

    directory.close_session(&session.id).await.unwrap();
    assert!(wait_for(|| remote.is_ended()).await);
    assert_eq!(*ended.lock().unwrap(), vec![session.id.clone()]);
    directory.dispose();
}

#[tokio::test]
async fn joining_requires_an_active_session() {
    let store = Arc::new(MemoryStore::new());
    let harness = connected(store, fast_config(), false).await;

    let missing = RemoteViewer::join(
        &harness.directory,
        SessionId("no-such-session".to_string()),
        &harness.config,
    )
    .await;
    assert!(matches!(missing, Err(RelayError::SessionNotFound(_))));

    let session = harness.channel.start_sharing("bench", "alice").await.unwrap();
    harness.channel.stop_sharing().await.unwrap();
    let closed = RemoteViewer::join(&harness.directory, session.id, &harness.config).await;
    assert!(matches!(closed, Err(RelayError::SessionEnded(_))));
}

#[tokio::test]
async fn sharing_needs_a_connected_device_and_only_one_session() {
    let store = Arc::new(MemoryStore::new());
    let harness = connected(store, fast_config(), false).await;

    let session = harness.channel.start_sharing("bench", "alice").await.unwrap();
    assert_eq!(session.device_label, "86-Sensor");
    assert_eq!(session.user_label, "alice");
    assert!(session.is_active);
    let again = harness.channel.start_sharing("bench", "alice").await;
    assert!(matches!(again, Err(RelayError::AlreadySharing(_))));

    harness.channel.stop_sharing().await.unwrap();
    harness.link.disconnect().await;
    let error = harness.channel.start_sharing("bench", "alice").await.unwrap_err();
    assert!(matches!(error, RelayError::Link(ref e) if e.kind == ErrorKind::DeviceDisconnected));
    assert!(!harness.channel.stop_sharing().await.unwrap());
}

#[tokio::test]
async fn purge_on_close_removes_the_relay_log() {
    let store = Arc::new(MemoryStore::new());
    let config = RelayConfig {
        retention: RetentionPolicy::PurgeOnClose,
        ..fast_config()
    };
    let (harness, _session) = sharing(store.clone(), config, false).await;

    harness.transport.push_notification(b"OK\r\n");
    assert!(wait_for(|| store.row_count(RELAY_TABLE) == 1).await);

    harness.channel.stop_sharing().await.unwrap();
    assert_eq!(store.row_count(RELAY_TABLE), 0);
}

#[tokio::test]
async fn stopping_flushes_device_lines_still_queued_for_the_log() {
    let inner = MemoryStore::new();
    let store = Arc::new(SlowInsertStore { inner: inner.clone() });
    let (harness, _session) = sharing(store, fast_config(), false).await;
    let shown = Arc::new(Mutex::new(Vec::new()));
    let sink = shown.clone();
    let _display = harness.link.subscribe(move |event| {
        if let LinkEvent::Line(line) = event {
            sink.lock().unwrap().push(line.clone());
        }
    });

    harness.transport.push_notification(b"L1\r\nL2\r\nL3\r\nL4\r\nL5\r\n");
    assert!(wait_for(|| shown.lock().unwrap().len() == 5).await);
    assert!(inner.row_count(RELAY_TABLE) < 5);

    assert!(harness.channel.stop_sharing().await.unwrap());
    assert_eq!(inner.row_count(RELAY_TABLE), 5);
}

#[tokio::test]
async fn directory_publishes_changes_pushed_by_the_store() {
    let store = Arc::new(MemoryStore::new());
    let directory = SessionDirectory::new(store, RelayConfig::default());
    directory.init().unwrap();
    let latest = Arc::new(Mutex::new(Vec::<ShareSession>::new()));
    let sink = latest.clone();
    let _listener = directory.subscribe(move |sessions| *sink.lock().unwrap() = sessions.clone());

    let session = directory.create_session("bench", "alice", "86-Sensor").await.unwrap();
    assert!(wait_for(|| latest.lock().unwrap().iter().any(|s| s.id == session.id)).await);

    directory.close_session(&session.id).await.unwrap();
    assert!(wait_for(|| latest.lock().unwrap().is_empty()).await);
    directory.dispose();
}

#[tokio::test(start_paused = true)]
async fn directory_refresh_catches_changes_without_push() {
    let store = Arc::new(LossyStore::default());
    let directory = SessionDirectory::new(store, RelayConfig::default());
    directory.init().unwrap();
    let latest = Arc::new(Mutex::new(Vec::<ShareSession>::new()));
    let sink = latest.clone();
    let _listener = directory.subscribe(move |sessions| *sink.lock().unwrap() = sessions.clone());

    let session = directory.create_session("bench", "alice", "86-Sensor").await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(latest.lock().unwrap().len(), 1);
    assert_eq!(latest.lock().unwrap()[0].id, session.id);

    directory.close_session(&session.id).await.unwrap();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(latest.lock().unwrap().is_empty());
}
