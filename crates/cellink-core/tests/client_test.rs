// Integration tests for `TransportClient` against the in-memory simulator.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;

use cellink_api::sim::SimServer;
use cellink_api::{ServerDescription, StatusCode, ValueType, Variant};
use cellink_core::{ClientConfig, ConnectionState, CoreError, MonitoringConfig, TagWrite, TransportClient};

// ── Helpers ─────────────────────────────────────────────────────────

fn fast_config() -> ClientConfig {
    ClientConfig {
        monitoring: MonitoringConfig {
            tick: Duration::from_millis(20),
            ..MonitoringConfig::default()
        },
        ..ClientConfig::default()
    }
}

fn setup() -> (SimServer, TransportClient) {
    let config = fast_config();
    let sim = SimServer::new(&config.application_uri);
    let client = TransportClient::spawn(Arc::new(sim.clone()), config);
    (sim, client)
}

async fn connected() -> (SimServer, TransportClient) {
    let (sim, client) = setup();
    client.connect("127.0.0.1", 4840).await.unwrap();
    (sim, client)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// ── Connect sequence ────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_resolves_namespace_and_reads() {
    let (sim, client) = connected().await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(sim.is_connected());

    sim.seed([("DeviceType", Variant::UInt16(3))]);
    assert_eq!(client.read_u16("DeviceType").await.unwrap(), 3);
}

#[tokio::test]
async fn test_connect_twice_is_a_noop() {
    let (_sim, client) = connected().await;
    let mut state = client.subscribe_state();
    state.borrow_and_update();

    client.connect("127.0.0.1", 4840).await.unwrap();
    assert!(!state.has_changed().unwrap());
}

#[tokio::test]
async fn test_zero_endpoints_fails_and_stays_disconnected() {
    let (sim, client) = setup();
    sim.set_endpoints(Vec::new());

    let err = client.connect("127.0.0.1", 4840).await.unwrap_err();
    assert!(matches!(err, CoreError::Connection { .. }));
    assert!(err.to_string().contains("Cannot find vaild end point"), "{err}");
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected());
}

#[tokio::test]
async fn test_no_servers_found() {
    let (sim, client) = setup();
    sim.set_servers(Vec::new());

    let err = client.connect("127.0.0.1", 4840).await.unwrap_err();
    assert!(err.to_string().contains("Cannot find server!"), "{err}");
}

#[tokio::test]
async fn test_server_without_discovery_url() {
    let (sim, client) = setup();
    sim.set_servers(vec![ServerDescription {
        application_uri: "urn:cellink:sim".into(),
        discovery_urls: Vec::new(),
    }]);

    let err = client.connect("127.0.0.1", 4840).await.unwrap_err();
    assert!(err.to_string().contains("Cannot find server url!"), "{err}");
}

#[tokio::test]
async fn test_discovery_failure_reports_status() {
    let (sim, client) = setup();
    sim.fail_find_servers(StatusCode::BAD_COMMUNICATION_ERROR);

    let err = client.connect("127.0.0.1", 4840).await.unwrap_err();
    assert!(err.to_string().contains("Find server fail!"), "{err}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_missing_namespace_closes_the_session() {
    let (sim, client) = setup();
    sim.set_namespaces(vec!["http://opcfoundation.org/UA/".into()]);

    let err = client.connect("127.0.0.1", 4840).await.unwrap_err();
    assert!(err.to_string().contains("Cannot find namespace!"), "{err}");
    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert!(!sim.is_connected());
}

// ── Disconnect ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_double_disconnect_emits_nothing_new() {
    let (sim, client) = connected().await;
    let mut state = client.subscribe_state();
    state.borrow_and_update();

    client.disconnect().await.unwrap();
    assert!(state.has_changed().unwrap());
    assert_eq!(*state.borrow_and_update(), ConnectionState::Disconnected);
    assert!(!sim.is_connected());

    client.disconnect().await.unwrap();
    assert!(!state.has_changed().unwrap());
}

#[tokio::test]
async fn test_session_loss_is_reported() {
    let (sim, client) = connected().await;
    sim.drop_session("cable pulled");

    let mut state = client.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(1),
        state.wait_for(|s| *s == ConnectionState::Disconnected),
    )
    .await
    .unwrap()
    .unwrap();
}

// ── Reads & writes ──────────────────────────────────────────────────

#[tokio::test]
async fn test_io_without_session_fails() {
    let (_sim, client) = setup();

    let err = client.read_tag("DeviceType").await.unwrap_err();
    assert!(err.to_string().contains("Read node: node is null!"), "{err}");

    let err = client
        .write_tag("BeLocked", 1_u16, ValueType::UInt16)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("node is null!"), "{err}");
}

#[tokio::test]
async fn test_unknown_tag_reports_status() {
    let (_sim, client) = connected().await;
    let err = client.read_tag("Nope").await.unwrap_err();
    assert_eq!(err.field(), Some("Nope"));
    assert!(err.to_string().contains("BadNodeIdUnknown"), "{err}");
}

#[tokio::test]
async fn test_batch_read_keeps_request_order() {
    let (sim, client) = connected().await;
    sim.seed([
        ("RequireDataIdentifierType", Variant::UInt16(1)),
        (
            "RequireDataIdentifier",
            Variant::ByteString(Bytes::from_static(&[0xAB, 0x12])),
        ),
    ]);

    let values = client
        .read_tags(&["RequireDataIdentifier", "RequireDataIdentifierType"])
        .await
        .unwrap();
    let keys: Vec<&str> = values.keys().map(String::as_str).collect();
    assert_eq!(keys, vec!["RequireDataIdentifier", "RequireDataIdentifierType"]);
    assert_eq!(values["RequireDataIdentifierType"], Variant::UInt16(1));
}

#[tokio::test]
async fn test_batch_read_exposes_no_partial_data() {
    let (sim, client) = connected().await;
    sim.seed([("A", Variant::UInt16(1)), ("B", Variant::UInt16(2))]);
    sim.fail_reads("B", StatusCode::BAD_NOT_FOUND);

    let err = client.read_tags(&["A", "B"]).await.unwrap_err();
    assert_eq!(err.field(), Some("B"));
    assert!(err.to_string().contains("B( index :1 ) : BadNotFound"), "{err}");
}

#[tokio::test]
async fn test_empty_batches_are_rejected() {
    let (sim, client) = connected().await;
    let none: [&str; 0] = [];
    assert!(client.read_tags(&none).await.is_err());
    assert!(client.write_tags(Vec::new()).await.is_err());
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn test_batch_write_preserves_order() {
    let (sim, client) = connected().await;
    client
        .write_tags(vec![
            TagWrite::new("ToolingDataIndex", ValueType::UInt64, 9_u64),
            TagWrite::u16("ToolingDataCommand", 2_u16),
        ])
        .await
        .unwrap();

    let tags: Vec<String> = sim.writes().into_iter().map(|w| w.tag).collect();
    assert_eq!(tags, vec!["ToolingDataIndex", "ToolingDataCommand"]);
    assert_eq!(sim.value("ToolingDataIndex"), Some(Variant::UInt64(9)));
}

#[tokio::test]
async fn test_batch_write_names_failing_item() {
    let (sim, client) = connected().await;
    sim.fail_writes("ToolingDataCommand", StatusCode::BAD_NOT_WRITABLE);

    let err = client
        .write_tags(vec![
            TagWrite::u16("ToolingDataDoAll", 0_u16),
            TagWrite::u16("ToolingDataCommand", 2_u16),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("ToolingDataCommand"));
    assert!(err.to_string().contains("BadNotWritable"), "{err}");
}

#[tokio::test]
async fn test_write_type_mismatch_is_rejected() {
    let (sim, client) = connected().await;
    sim.seed([("BeLocked", Variant::UInt16(0))]);

    let err = client
        .write_tag("BeLocked", true, ValueType::Boolean)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("BadTypeMismatch"), "{err}");
    assert_eq!(sim.value("BeLocked"), Some(Variant::UInt16(0)));
    assert!(sim.writes().is_empty());
}

#[tokio::test]
async fn test_value_that_cannot_be_coerced_never_leaves_the_client() {
    let (sim, client) = connected().await;
    let err = client
        .write_tag("ToolingDataContent", 5_u16, ValueType::ByteString)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation { .. }));
    assert!(sim.writes().is_empty());
}

// ── Change notification ─────────────────────────────────────────────

#[tokio::test]
async fn test_watch_publishes_baseline_then_changes() {
    let (sim, client) = connected().await;
    sim.seed([("DeviceState", Variant::UInt16(1))]);

    let mut watch = client.watch("DeviceState");
    let baseline = tokio::time::timeout(Duration::from_secs(2), watch.changed())
        .await
        .unwrap();
    assert_eq!(baseline, Some(Variant::UInt16(1)));
    assert_eq!(watch.current(), Some(Variant::UInt16(1)));

    sim.set_value("DeviceState", 4_u16);
    let next = tokio::time::timeout(Duration::from_secs(2), watch.changed())
        .await
        .unwrap();
    assert_eq!(next, Some(Variant::UInt16(4)));
    assert_eq!(client.latest("DeviceState"), Some(Variant::UInt16(4)));
}

#[tokio::test]
async fn test_subscription_retries_dropped_enables() {
    let (sim, client) = connected().await;
    sim.seed([("BeLocked", Variant::UInt16(0))]);
    sim.drop_next_enables(2);

    client.monitor("BeLocked");
    eventually(|| client.latest("BeLocked").is_some()).await;

    assert!(sim.is_monitored("BeLocked"));
    assert_eq!(sim.enable_requests("BeLocked"), 3);
}

#[tokio::test]
async fn test_confirmed_tags_are_left_alone() {
    let (sim, client) = connected().await;
    sim.seed([("DeviceType", Variant::UInt16(1))]);

    client.monitor("DeviceType");
    eventually(|| client.latest("DeviceType").is_some()).await;
    let requests = sim.enable_requests("DeviceType");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sim.enable_requests("DeviceType"), requests);
}

#[tokio::test]
async fn test_unreadable_baseline_keeps_retrying() {
    let (sim, client) = connected().await;
    client.monitor("ShowMainControlUi");

    eventually(|| sim.read_count("ShowMainControlUi") >= 2).await;
    assert!(client.latest("ShowMainControlUi").is_none());

    sim.seed([("ShowMainControlUi", Variant::UInt16(1))]);
    eventually(|| client.latest("ShowMainControlUi").is_some()).await;
}

#[tokio::test]
async fn test_subscriptions_return_after_reconnect() {
    let (sim, client) = connected().await;
    sim.seed([("DeviceState", Variant::UInt16(1))]);
    client.monitor("DeviceState");
    eventually(|| sim.is_monitored("DeviceState")).await;

    sim.drop_session("power cycle");
    eventually(|| client.connection_state() == ConnectionState::Disconnected).await;
    assert!(!sim.is_monitored("DeviceState"));

    client.connect("127.0.0.1", 4840).await.unwrap();
    eventually(|| sim.is_monitored("DeviceState")).await;
}

#[tokio::test]
async fn test_shutdown_abandons_outstanding_requests() {
    let (_sim, client) = connected().await;
    client.shutdown().await;
    let err = client.read_tag("DeviceType").await.unwrap_err();
    assert!(matches!(err, CoreError::Abandoned));
}
