// Integration tests for the device-initiated data-request and upload cycles.
#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

use cellink_api::sim::{SimServer, WriteRecord};
use cellink_api::{StatusCode, Variant};
use cellink_core::{
    PollIntervals, RequireDataState, Station, StationConfig, StationEvent, ToolingData,
    ToolingIdentifier,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn station() -> (SimServer, Station) {
    let config = StationConfig {
        poll: PollIntervals::uniform(Duration::from_millis(20)),
        ..StationConfig::default()
    };
    let sim = SimServer::new(&config.client.application_uri);
    let station = Station::new(config, Arc::new(sim.clone())).unwrap();
    station.connect().await.unwrap();
    (sim, station)
}

fn bytes(raw: &'static [u8]) -> Variant {
    Variant::ByteString(Bytes::from_static(raw))
}

fn seed_data_request(sim: &SimServer) {
    sim.seed([
        ("RequireDataExecuteState", Variant::UInt16(0)),
        ("RequireDataIdentifierType", Variant::UInt16(1)),
        ("RequireDataIdentifier", bytes(&[0xAB, 0x12])),
        ("ToolingDataIndex", Variant::UInt64(0)),
        ("ToolingDataContent", bytes(b"")),
        ("ToolingDataDoAll", Variant::UInt16(0)),
        ("ToolingDataIsValid", Variant::UInt16(0)),
        ("ToolingDataCommand", Variant::UInt16(0)),
        ("RequireDataCommand", Variant::UInt16(1)),
    ]);
}

fn seed_upload(sim: &SimServer, valid: u16) {
    sim.seed([
        ("UploadDataExecuteState", Variant::UInt16(0)),
        ("UploadDataIsValid", Variant::UInt16(valid)),
        ("UploadIdentifierType", Variant::UInt16(2)),
        ("UploadIdentifier", bytes(&[0x01, 0xFF])),
        ("UploadToolingIndex", Variant::UInt64(5)),
        ("UploadToolingContent", bytes(b"result")),
        ("UploadDataCommand", Variant::UInt16(1)),
    ]);
}

async fn next_event<T>(
    events: &mut broadcast::Receiver<Arc<StationEvent>>,
    mut pick: impl FnMut(&StationEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let event = events.recv().await.unwrap();
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    })
    .await
    .unwrap()
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

fn record(tag: &str, value: Variant) -> WriteRecord {
    WriteRecord {
        tag: tag.into(),
        value,
    }
}

// ── Data request ────────────────────────────────────────────────────

#[tokio::test]
async fn test_data_request_round_trip() {
    let (sim, station) = station().await;
    seed_data_request(&sim);
    let mut events = station.events().subscribe();
    station.start_require_data_cycle();

    let identifier = next_event(&mut events, |e| match e {
        StationEvent::RequireData { identifier } => Some(identifier.clone()),
        _ => None,
    })
    .await;
    assert_eq!(identifier, ToolingIdentifier::new(1, vec![0xAB, 0x12]));
    assert_eq!(identifier.to_string(), "TYPE=1, ID=0xAB12");

    let data = ToolingData {
        identifier,
        index: 7,
        content: Bytes::from_static(b"recipe"),
    };
    station.send_tooling_data(data, true, false).await.unwrap();

    let pushed = next_event(&mut events, |e| match e {
        StationEvent::DataPushed(result) => Some(result.clone()),
        _ => None,
    })
    .await;
    assert_eq!(pushed, Ok(()));

    eventually(|| sim.value("RequireDataExecuteState") == Some(Variant::UInt16(2))).await;
    assert_eq!(
        sim.writes(),
        vec![
            record("RequireDataExecuteState", Variant::UInt16(1)),
            record("ToolingDataIndex", Variant::UInt64(7)),
            record("ToolingDataContent", bytes(b"recipe")),
            record("ToolingDataDoAll", Variant::UInt16(0)),
            record("ToolingDataIsValid", Variant::UInt16(1)),
            record("ToolingDataCommand", Variant::UInt16(2)),
            record("RequireDataCommand", Variant::UInt16(0)),
            record("RequireDataExecuteState", Variant::UInt16(2)),
        ]
    );

    eventually(|| station.require_data_status().active == Some(RequireDataState::Wait)).await;
}

#[tokio::test]
async fn test_failed_push_leaves_the_request_raised() {
    let (sim, station) = station().await;
    seed_data_request(&sim);
    sim.fail_writes("ToolingDataCommand", StatusCode::BAD_NOT_WRITABLE);
    let mut events = station.events().subscribe();
    station.start_require_data_cycle();

    let identifier = next_event(&mut events, |e| match e {
        StationEvent::RequireData { identifier } => Some(identifier.clone()),
        _ => None,
    })
    .await;
    let data = ToolingData {
        identifier,
        index: 1,
        content: Bytes::from_static(b"x"),
    };
    station.send_tooling_data(data, true, false).await.unwrap();

    let pushed = next_event(&mut events, |e| match e {
        StationEvent::DataPushed(result) => Some(result.clone()),
        _ => None,
    })
    .await;
    let message = pushed.unwrap_err();
    assert!(message.contains("ToolingDataCommand"), "{message}");

    // The cycle fails, returns to waiting, and sees the same request again.
    next_event(&mut events, |e| {
        matches!(e, StationEvent::RequireData { .. }).then_some(())
    })
    .await;
    assert!(sim.writes_to(&["RequireDataCommand"]).is_empty());
    assert_eq!(sim.value("RequireDataCommand"), Some(Variant::UInt16(1)));
}

#[tokio::test]
async fn test_do_all_skips_content() {
    let (sim, station) = station().await;
    seed_data_request(&sim);
    let mut events = station.events().subscribe();
    station.start_require_data_cycle();

    let identifier = next_event(&mut events, |e| match e {
        StationEvent::RequireData { identifier } => Some(identifier.clone()),
        _ => None,
    })
    .await;
    let data = ToolingData {
        identifier,
        index: 0,
        content: Bytes::new(),
    };
    station.send_tooling_data(data, true, true).await.unwrap();

    eventually(|| sim.value("RequireDataExecuteState") == Some(Variant::UInt16(2))).await;
    assert!(sim.writes_to(&["ToolingDataContent"]).is_empty());
    assert_eq!(sim.value("ToolingDataDoAll"), Some(Variant::UInt16(1)));
}

#[tokio::test]
async fn test_stopped_cycle_ignores_requests() {
    let (sim, station) = station().await;
    seed_data_request(&sim);
    station.start_require_data_cycle();
    eventually(|| station.require_data_status().active == Some(RequireDataState::AwaitData)).await;

    station.stop_require_data_cycle();
    eventually(|| !station.require_data_status().running).await;
    sim.clear_writes();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sim.writes().is_empty());
}

// ── Upload ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_upload_round_trip() {
    let (sim, station) = station().await;
    seed_upload(&sim, 1);
    let mut events = station.events().subscribe();
    station.start_upload_cycle();

    let data = next_event(&mut events, |e| match e {
        StationEvent::UploadData { data } => Some(data.clone()),
        _ => None,
    })
    .await;
    assert_eq!(data.identifier, ToolingIdentifier::new(2, vec![0x01, 0xFF]));
    assert_eq!(data.index, 5);
    assert_eq!(data.content, Bytes::from_static(b"result"));

    station.upload_finished().await.unwrap();
    eventually(|| sim.value("UploadDataExecuteState") == Some(Variant::UInt16(2))).await;
    assert_eq!(
        sim.writes(),
        vec![
            record("UploadDataExecuteState", Variant::UInt16(1)),
            record("UploadDataCommand", Variant::UInt16(0)),
            record("UploadDataExecuteState", Variant::UInt16(2)),
        ]
    );
}

#[tokio::test]
async fn test_invalid_upload_is_never_announced() {
    let (sim, station) = station().await;
    seed_upload(&sim, 0);
    let mut events = station.events().subscribe();
    station.start_upload_cycle();

    eventually(|| sim.read_count("UploadDataIsValid") >= 2).await;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(*event, StationEvent::UploadData { .. }));
    }
    assert!(sim.writes().is_empty());
    assert!(station.upload_finished().await.is_err());
}
