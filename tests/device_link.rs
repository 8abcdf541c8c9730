use std::sync::{Arc, Mutex};
use std::time::Duration;

use ble_serial_relay_lib::config::link_config::LinkConfig;
use ble_serial_relay_lib::core::bluetooth::constants::{
    UUID_GENERIC_ACCESS_SERVICE, UUID_SERIAL_CHAR, UUID_SERIAL_SERVICE,
};
use ble_serial_relay_lib::core::bluetooth::transport::DiscoveryStream;
use ble_serial_relay_lib::core::bluetooth::{
    BleTransport, DeviceLink, ErrorKind, FailureCategory, GattConnection, LinkEvent, LinkState,
    PlatformFailure, SimulatedPeripheral, SimulatedTransport,
};
use proptest::prelude::*;

fn link_with(transport: &SimulatedTransport) -> DeviceLink {
    DeviceLink::new(Arc::new(transport.clone()), LinkConfig::default())
}

fn serial_transport() -> SimulatedTransport {
    SimulatedTransport::new(vec![
        SimulatedPeripheral::serial_module("dev-1", "86-Sensor").with_at_responder(),
    ])
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

fn record_lines(link: &DeviceLink) -> (Arc<Mutex<Vec<String>>>, ble_serial_relay_lib::core::Subscription) {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = lines.clone();
    let subscription = link.subscribe(move |event| {
        if let LinkEvent::Line(line) = event {
            sink.lock().unwrap().push(line.clone());
        }
    });
    (lines, subscription)
}

#[tokio::test]
async fn scan_offers_prefix_matches_and_excludes_the_rest() {
    let transport = SimulatedTransport::new(vec![
        SimulatedPeripheral::new("hc", Some("HC-05")),
        SimulatedPeripheral::serial_module("s86", "86-Sensor"),
    ]);
    let link = link_with(&transport);

    let devices = link.scan().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].name.as_deref(), Some("86-Sensor"));
    assert!(devices.iter().all(|d| d.name.as_deref() != Some("HC-05")));
    assert_eq!(link.state(), LinkState::AwaitingSelection);
}

#[tokio::test]
async fn scan_without_a_match_returns_to_idle() {
    let transport = SimulatedTransport::new(vec![SimulatedPeripheral::new("hc", Some("HC-05"))]);
    let link = link_with(&transport);

    assert!(link.scan().await.unwrap().is_empty());
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn scan_failures_are_classified() {
    let transport = serial_transport();
    let link = link_with(&transport);

    transport.set_unsupported(true);
    assert_eq!(link.scan().await.unwrap_err().kind, ErrorKind::NotSupported);
    assert_eq!(link.state(), LinkState::Idle);
    transport.set_unsupported(false);

    transport.set_insecure(true);
    assert_eq!(link.scan().await.unwrap_err().kind, ErrorKind::SecurityError);
    transport.set_insecure(false);

    transport.set_chooser_cancels(true);
    assert_eq!(link.scan().await.unwrap_err().kind, ErrorKind::UserCancelled);
    assert_eq!(link.state(), LinkState::Idle);
}

#[tokio::test]
async fn connect_walks_the_state_machine() {
    let transport = serial_transport();
    let link = link_with(&transport);
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = states.clone();
    let _subscription = link.subscribe(move |event| {
        if let LinkEvent::StateChanged(state) = event {
            sink.lock().unwrap().push(*state);
        }
    });

    link.scan().await.unwrap();
    link.connect("dev-1").await.unwrap();

    assert!(link.is_connected());
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            LinkState::Scanning,
            LinkState::AwaitingSelection,
            LinkState::Connecting,
            LinkState::Negotiating,
            LinkState::Connected,
        ]
    );
    let device = link.connected_device().await.unwrap();
    assert_eq!(device.name.as_deref(), Some("86-Sensor"));
    assert_eq!(link.last_device_id().as_deref(), Some("dev-1"));
    assert!(transport.has_notification_subscriber());
}

#[tokio::test]
async fn connect_falls_back_to_generic_access_service() {
    let transport = SimulatedTransport::new(vec![
        SimulatedPeripheral::new("gap", Some("86-Gap"))
            .with_service(UUID_GENERIC_ACCESS_SERVICE, &[UUID_SERIAL_CHAR]),
    ]);
    let link = link_with(&transport);

    link.connect("gap").await.unwrap();
    assert!(link.is_connected());
}

#[tokio::test]
async fn connect_without_any_serial_service_is_service_not_found() {
    let transport = SimulatedTransport::new(vec![SimulatedPeripheral::new("bare", Some("86-Bare"))]);
    let link = link_with(&transport);

    let error = link.connect("bare").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ServiceNotFound);
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.disconnect_calls(), 1);
    assert!(!transport.has_notification_subscriber());
}

#[tokio::test]
async fn negotiation_failures_are_classified_and_cleaned_up() {
    let transport = SimulatedTransport::new(vec![
        SimulatedPeripheral::new("nochar", Some("86-A")).with_service(UUID_SERIAL_SERVICE, &[]),
        SimulatedPeripheral::serial_module("nonotify", "86-B"),
    ]);
    let link = link_with(&transport);

    let error = link.connect("nochar").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::CharacteristicNotFound);
    assert!(!link.is_connected());

    transport.set_fail_notifications(true);
    let error = link.connect("nonotify").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::NotificationFailed);
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.disconnect_calls(), 2);
}

#[tokio::test]
async fn connection_failures_are_retried_when_configured() {
    let transport = serial_transport();
    let link = DeviceLink::new(
        Arc::new(transport.clone()),
        LinkConfig {
            connect_attempts: 2,
            connect_retry_delay_ms: 10,
            ..LinkConfig::default()
        },
    );

    transport.fail_next_connect(PlatformFailure::new(
        FailureCategory::Timeout,
        "Connection attempt timed out",
    ));
    link.connect("dev-1").await.unwrap();
    assert_eq!(transport.connect_calls(), 2);

    let single = link_with(&transport);
    link.disconnect().await;
    transport.fail_next_connect(PlatformFailure::new(
        FailureCategory::Timeout,
        "Connection attempt timed out",
    ));
    let error = single.connect("dev-1").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::ConnectionFailed);
    assert!(error.hint().contains("powered on and in range"));
    assert_eq!(single.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn connecting_twice_to_the_same_device_is_a_no_op() {
    let transport = serial_transport();
    let link = link_with(&transport);

    link.connect("dev-1").await.unwrap();
    link.connect("dev-1").await.unwrap();
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn connecting_elsewhere_tears_down_the_previous_device() {
    let transport = SimulatedTransport::new(vec![
        SimulatedPeripheral::serial_module("a", "86-A"),
        SimulatedPeripheral::serial_module("b", "86-B"),
    ]);
    let link = link_with(&transport);

    link.connect("a").await.unwrap();
    link.connect("b").await.unwrap();
    assert_eq!(transport.disconnect_calls(), 1);
    assert_eq!(link.connected_device().await.unwrap().id, "b");
}

#[tokio::test]
async fn scanning_while_connected_is_rejected() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    assert_eq!(link.scan().await.unwrap_err().kind, ErrorKind::Unknown);
    assert!(link.is_connected());
}

#[tokio::test]
async fn device_output_is_framed_into_lines() {
    let transport = serial_transport();
    let link = link_with(&transport);
    let (lines, _subscription) = record_lines(&link);
    link.connect("dev-1").await.unwrap();

    link.send("AT+NAME").await.unwrap();
    assert!(wait_for(|| lines.lock().unwrap().len() >= 2).await);
    assert_eq!(*lines.lock().unwrap(), vec!["+NAME:86-Sensor", "OK"]);

    transport.push_notification(b"STATUS: RE");
    transport.push_notification(b"ADY\r\n");
    assert!(wait_for(|| lines.lock().unwrap().len() >= 3).await);
    assert_eq!(lines.lock().unwrap()[2], "STATUS: READY");
}

#[tokio::test]
async fn long_commands_are_split_into_bounded_writes() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    link.send("AT+NAME=A-VERY-LONG-MODULE-NAME").await.unwrap();
    assert_eq!(transport.write_count(), 2);
    assert_eq!(transport.written_bytes(), b"AT+NAME=A-VERY-LONG-MODULE-NAME\r\n".to_vec());
}

#[tokio::test]
async fn write_errors_are_write_failed() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    transport.set_fail_writes(true);
    let error = link.send("AT").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::WriteFailed);
    assert!(link.is_connected());
}

#[tokio::test]
async fn send_without_a_connection_is_device_disconnected() {
    let transport = serial_transport();
    let link = link_with(&transport);

    let error = link.send("AT").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::DeviceDisconnected);
    assert!(error.offers_reconnect());
    assert_eq!(transport.write_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_liveness_check_disconnects_and_blocks_sends() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    transport.drop_silently();
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert_eq!(link.state(), LinkState::Disconnected);
    let writes = transport.write_count();
    let error = link.send("AT+STATUS").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::DeviceDisconnected);
    assert_eq!(transport.write_count(), writes);
    assert!(!link.verify_connection().await);
}

#[tokio::test]
async fn silent_drop_is_caught_right_before_a_send() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    transport.drop_silently();
    let error = link.send("AT+STATUS").await.unwrap_err();
    assert_eq!(error.kind, ErrorKind::DeviceDisconnected);
    assert_eq!(transport.write_count(), 0);
    assert_eq!(link.state(), LinkState::Disconnected);
}

#[tokio::test]
async fn spontaneous_drop_disconnects_and_reconnect_restores() {
    let transport = serial_transport();
    let link = link_with(&transport);
    link.connect("dev-1").await.unwrap();

    transport.drop_link();
    assert!(wait_for(|| link.state() == LinkState::Disconnected).await);

    link.reconnect().await.unwrap();
    assert!(link.is_connected());
    assert_eq!(transport.connect_calls(), 2);
    link.send("AT").await.unwrap();
}

#[tokio::test]
async fn reconnect_needs_a_known_device() {
    let transport = serial_transport();
    let link = link_with(&transport);
    assert_eq!(link.reconnect().await.unwrap_err().kind, ErrorKind::DeviceDisconnected);
}

#[tokio::test]
async fn disconnect_never_fails_from_any_state() {
    let transport = serial_transport();
    let link = link_with(&transport);

    // Idle
    link.disconnect().await;
    assert!(!link.is_connected());

    // Awaiting selection
    link.scan().await.unwrap();
    link.disconnect().await;
    assert_eq!(link.state(), LinkState::Idle);

    // Connected, with every teardown step failing
    link.connect("dev-1").await.unwrap();
    transport.set_fail_teardown(true);
    link.disconnect().await;
    assert_eq!(link.state(), LinkState::Disconnected);
    assert_eq!(transport.stop_notification_calls(), 1);
    assert_eq!(transport.disconnect_calls(), 1);
    transport.set_fail_teardown(false);

    // Already disconnected
    link.disconnect().await;
    assert!(!link.is_connected());

    // After a failed negotiation
    transport.set_fail_notifications(true);
    assert!(link.connect("dev-1").await.is_err());
    link.disconnect().await;
    assert!(!link.is_connected());
    transport.set_fail_notifications(false);

    // After the device vanished
    link.connect("dev-1").await.unwrap();
    transport.drop_link();
    link.disconnect().await;
    assert!(!link.is_connected());
    assert!(link.connected_device().await.is_none());
}

#[tokio::test]
async fn disconnect_races_with_connect_without_leaving_a_half_open_link() {
    let transport = serial_transport();
    let link = link_with(&transport);

    let connecting = {
        let link = link.clone();
        tokio::spawn(async move { link.connect("dev-1").await })
    };
    link.disconnect().await;
    let connected = connecting.await.unwrap().is_ok();

    if link.is_connected() {
        assert!(connected);
        assert!(link.connected_device().await.is_some());
    } else {
        assert!(link.connected_device().await.is_none());
    }
    link.disconnect().await;
    assert!(!link.is_connected());
    assert!(!transport.has_notification_subscriber());
}

/// Wraps the simulated platform and stalls selected calls.
struct Sluggish {
    inner: SimulatedTransport,
    availability_delay: Duration,
    connect_delay: Duration,
}

#[async_trait::async_trait]
impl BleTransport for Sluggish {
    async fn availability(&self) -> Result<(), PlatformFailure> {
        tokio::time::sleep(self.availability_delay).await;
        self.inner.availability().await
    }

    async fn discover(&self) -> Result<DiscoveryStream, PlatformFailure> {
        self.inner.discover().await
    }

    async fn connect(&self, device_id: &str) -> Result<Box<dyn GattConnection>, PlatformFailure> {
        tokio::time::sleep(self.connect_delay).await;
        self.inner.connect(device_id).await
    }
}

fn sluggish_link(transport: &SimulatedTransport, availability: u64, connect: u64) -> DeviceLink {
    let sluggish = Sluggish {
        inner: transport.clone(),
        availability_delay: Duration::from_millis(availability),
        connect_delay: Duration::from_millis(connect),
    };
    DeviceLink::new(Arc::new(sluggish), LinkConfig::default())
}

#[tokio::test]
async fn scan_issued_during_a_slow_connect_leaves_the_connection_intact() {
    let transport = serial_transport();
    let link = sluggish_link(&transport, 0, 100);

    let connecting = {
        let link = link.clone();
        tokio::spawn(async move { link.connect("dev-1").await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let scanned = link.scan().await;
    assert_eq!(scanned.unwrap_err().kind, ErrorKind::Unknown);
    connecting.await.unwrap().unwrap();

    assert_eq!(link.state(), LinkState::Connected);
    assert!(link.is_connected());
    link.send("AT").await.unwrap();
    assert_eq!(transport.sent_lines(), vec!["AT".to_string()]);
}

#[tokio::test]
async fn cancel_while_waiting_for_the_adapter_ends_the_scan() {
    let transport = serial_transport();
    let link = sluggish_link(&transport, 100, 0);

    let scanning = {
        let link = link.clone();
        tokio::spawn(async move { link.scan().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(link.state(), LinkState::Scanning);
    link.cancel_scan();

    let result = scanning.await.unwrap();
    assert_eq!(result.unwrap_err().kind, ErrorKind::UserCancelled);
    assert_eq!(link.state(), LinkState::Idle);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn sent_bytes_are_the_command_plus_crlf(command in "[^\r\n]{0,48}") {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let transport = SimulatedTransport::new(vec![
                SimulatedPeripheral::serial_module("dev-1", "86-Sensor"),
            ]);
            let link = link_with(&transport);
            link.connect("dev-1").await.unwrap();
            link.send(&command).await.unwrap();

            let mut expected = command.as_bytes().to_vec();
            expected.extend_from_slice(b"\r\n");
            prop_assert_eq!(transport.written_bytes(), expected);
            Ok(())
        })?;
    }
}
