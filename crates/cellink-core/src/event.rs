// ── Station events ──
//
// Domain events handed upward to the plant-control application. Every
// component of one station publishes into the same bus; consumers that
// fall behind lose the oldest events.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::trace;

use crate::client::ConnectionState;
use crate::error::CoreError;
use crate::model::{Direction, ToolingData, ToolingIdentifier};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Outcome carried by result events: `Err` holds the logged message.
pub type EventResult<T = ()> = Result<T, String>;

pub(crate) fn outcome<T: Clone>(result: &Result<T, CoreError>) -> EventResult<T> {
    result.clone().map_err(|e| e.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StationEvent {
    // ── Connection ──────────────────────────────────────────────────
    ConnectResult(EventResult),
    ConnectionChanged { state: ConnectionState },
    /// `Ok(true)` when the station reports the configured device type.
    DeviceTypeChecked(EventResult<bool>),
    InitCommandResult(EventResult),

    /// A monitored field took a new value.
    FieldChanged { field: String, value: u16 },

    // ── Data cycles ─────────────────────────────────────────────────
    /// The station asks for the work data of a tooling carrier.
    RequireData { identifier: ToolingIdentifier },
    /// The station hands over the work result of a tooling carrier.
    UploadData { data: ToolingData },
    DataPushed(EventResult),

    // ── Transfers ───────────────────────────────────────────────────
    PlanResult {
        direction: Direction,
        result: EventResult,
    },
    CommandResult {
        direction: Direction,
        result: EventResult,
    },
    CancelPlanResult {
        direction: Direction,
        result: EventResult,
    },
    ReadyState { direction: Direction, ready: bool },

    // ── Run cycle ───────────────────────────────────────────────────
    ConfirmCanPutIn(bool),
    ConfirmCanTakeOut(bool),
    FinishedPutIn,
    FinishedTakeOut,
    /// Operator-facing fault.
    Alert { message: String },
    RunStateChanged { state: String },
}

impl StationEvent {
    pub(crate) fn confirm(direction: Direction, can: bool) -> Self {
        match direction {
            Direction::PutIn => Self::ConfirmCanPutIn(can),
            Direction::TakeOut => Self::ConfirmCanTakeOut(can),
        }
    }

    pub(crate) fn finished(direction: Direction) -> Self {
        match direction {
            Direction::PutIn => Self::FinishedPutIn,
            Direction::TakeOut => Self::FinishedTakeOut,
        }
    }
}

/// Fan-out of [`StationEvent`]s. Cheap to clone.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Arc<StationEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self { tx }
    }

    /// Publish `event`. Having no subscriber is not an error.
    pub fn emit(&self, event: StationEvent) {
        trace!(?event, "station event");
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StationEvent>> {
        self.tx.subscribe()
    }

    /// Events as a `Stream`. Lagged receivers yield an error item and continue.
    pub fn stream(&self) -> BroadcastStream<Arc<StationEvent>> {
        BroadcastStream::new(self.subscribe())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_tag_and_payload() {
        let json = serde_json::to_value(StationEvent::RequireData {
            identifier: ToolingIdentifier::new(1, vec![0xAB, 0x12]),
        })
        .unwrap();
        assert_eq!(json["event"], "require_data");
        assert_eq!(json["data"]["identifier"]["kind"], 1);

        let json = serde_json::to_value(StationEvent::ConnectResult(Err("Cannot find server!".into())))
            .unwrap();
        assert_eq!(json["data"]["Err"], "Cannot find server!");
    }

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(StationEvent::FinishedPutIn);
        bus.emit(StationEvent::confirm(Direction::TakeOut, false));
        assert_eq!(*rx.recv().await.unwrap(), StationEvent::FinishedPutIn);
        assert_eq!(*rx.recv().await.unwrap(), StationEvent::ConfirmCanTakeOut(false));
    }
}
