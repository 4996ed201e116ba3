// ── Data-request cycle ──
//
// Device-initiated: the station raises its request flag when a tooling
// carrier arrives and waits for the carrier's work data.
//
//   Wait ──Requested──▶ Decode ──Decoded──▶ AwaitData ──DataSupplied──▶ PushData
//     ▲                                                                   │
//     └──Restart── Success ◀──Finalized── Finalize ◀──CommandWriteDataSuccess
//
// Any failure posts ExistError, which routes to Fail and from there back
// to Wait. Finalize writes the request flag before the status field;
// the station relies on that order.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strum::Display;
use tracing::{debug, info, trace, warn};

use cellink_api::{ValueType, Variant};

use crate::client::{TagWrite, TransportClient};
use crate::codes::{DataValid, DoAllFlag, ExecuteState, RequireState, SendCommand};
use crate::error::CoreError;
use crate::event::{EventBus, StationEvent, outcome};
use crate::fsm::{Behavior, Chart, ChartError, Context};
use crate::model::{ToolingData, ToolingIdentifier};
use crate::state::DeviceState;
use crate::tags::RequireDataTags;

use super::{advance, decode};

use RequireDataEvent as E;
use RequireDataState as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RequireDataState {
    Cycle,
    Wait,
    Decode,
    AwaitData,
    PushData,
    Finalize,
    Fail,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RequireDataEvent {
    Requested,
    Decoded,
    DataSupplied,
    CommandWriteDataSuccess,
    Finalized,
    ExistError,
    Restart,
}

pub(crate) fn chart() -> Result<Chart<S, E>, ChartError> {
    Chart::builder(S::Cycle)
        .state(S::Cycle)
        .substate(S::Cycle, S::Wait)
        .substate(S::Cycle, S::Decode)
        .substate(S::Cycle, S::AwaitData)
        .substate(S::Cycle, S::PushData)
        .substate(S::Cycle, S::Finalize)
        .substate(S::Cycle, S::Fail)
        .substate(S::Cycle, S::Success)
        .initial(S::Cycle, S::Wait)
        .on(S::Wait, E::Requested, S::Decode)
        .on(S::Decode, E::Decoded, S::AwaitData)
        .on(S::AwaitData, E::DataSupplied, S::PushData)
        .on(S::PushData, E::CommandWriteDataSuccess, S::Finalize)
        .on(S::Finalize, E::Finalized, S::Success)
        .on(S::Cycle, E::ExistError, S::Fail)
        .on(S::Fail, E::Restart, S::Wait)
        .on(S::Success, E::Restart, S::Wait)
        .build()
}

/// Work data handed in by the application for the pending request.
#[derive(Debug, Clone)]
pub(crate) struct Payload {
    pub data: ToolingData,
    pub is_valid: bool,
    pub do_all: bool,
}

pub(crate) struct RequireDataCycle {
    client: TransportClient,
    tags: RequireDataTags,
    state: Arc<DeviceState>,
    events: EventBus,
    period: Duration,
    /// Filled by the decode activity, drained when AwaitData is entered.
    decoded: Arc<Mutex<Option<ToolingIdentifier>>>,
    payload: Option<Payload>,
}

impl RequireDataCycle {
    pub(crate) fn new(
        client: TransportClient,
        state: Arc<DeviceState>,
        events: EventBus,
        period: Duration,
    ) -> Self {
        Self {
            client,
            tags: state.tags().require_data.clone(),
            state,
            events,
            period,
            decoded: Arc::new(Mutex::new(None)),
            payload: None,
        }
    }

    /// Hold `payload` for the push step. Only valid while data is awaited.
    pub(crate) fn accept(&mut self, payload: Payload, cx: &Context<S, E>) -> Result<(), CoreError> {
        if cx.active() != Some(S::AwaitData) {
            return Err(CoreError::ProtocolSequence {
                machine: Self::NAME,
                state: cx.active().map_or_else(|| "<stopped>".into(), |s| format!("{s:?}")),
                event: E::DataSupplied.to_string(),
            });
        }
        self.payload = Some(payload);
        Ok(())
    }

    fn wait_for_request(&self, cx: &mut Context<S, E>) {
        let client = self.client.clone();
        let field = self.tags.request.clone();
        cx.poll(self.period, move || {
            let client = client.clone();
            let field = field.clone();
            async move {
                match client.read_u16(&field).await {
                    Ok(code) if RequireState::from_code(code) == Some(RequireState::Require) => {
                        Some(E::Requested)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        trace!(field = %field, error = %e, "request flag poll failed");
                        None
                    }
                }
            }
        });
    }

    fn decode(&self, cx: &mut Context<S, E>) {
        let client = self.client.clone();
        let tags = self.tags.clone();
        let slot = self.decoded.clone();
        cx.spawn(async move {
            let result = read_identifier(&client, &tags).await.map(|id| {
                *slot.lock() = Some(id);
            });
            advance(Self::NAME, "decode", result, E::Decoded, E::ExistError)
        });
    }

    fn announce(&self, cx: &Context<S, E>) {
        let Some(identifier) = self.decoded.lock().take() else {
            cx.post(E::ExistError);
            return;
        };
        info!(identifier = %identifier, "station requires tooling data");
        self.events.emit(StationEvent::RequireData { identifier });
    }

    fn push(&mut self, cx: &mut Context<S, E>) {
        let Some(payload) = self.payload.take() else {
            warn!("push step entered without data");
            cx.post(E::ExistError);
            return;
        };
        let writes = payload_writes(&self.tags, &payload);
        let client = self.client.clone();
        let events = self.events.clone();
        cx.spawn(async move {
            let result = client.write_tags(writes).await;
            events.emit(StationEvent::DataPushed(outcome(&result)));
            advance(
                Self::NAME,
                "push data",
                result,
                E::CommandWriteDataSuccess,
                E::ExistError,
            )
        });
    }

    fn finalize(&self, cx: &mut Context<S, E>) {
        let client = self.client.clone();
        let tags = self.tags.clone();
        let state = self.state.clone();
        cx.spawn(async move {
            let result = async {
                client
                    .write_tag(&tags.request, RequireState::NotRequire, ValueType::UInt16)
                    .await?;
                state.set_require_data_request(RequireState::NotRequire);
                client
                    .write_tag(&tags.execute_state, ExecuteState::Finished, ValueType::UInt16)
                    .await
            }
            .await;
            advance(Self::NAME, "finalize", result, E::Finalized, E::ExistError)
        });
    }
}

async fn read_identifier(
    client: &TransportClient,
    tags: &RequireDataTags,
) -> Result<ToolingIdentifier, CoreError> {
    let values = client
        .read_tags(&[&tags.identifier_type, &tags.identifier])
        .await?;
    let kind = decode(&values, &tags.identifier_type, Variant::as_u16)?;
    let code = decode(&values, &tags.identifier, Variant::as_bytes)?;
    client
        .write_tag(&tags.execute_state, ExecuteState::Executing, ValueType::UInt16)
        .await?;
    Ok(ToolingIdentifier::new(kind, code))
}

/// Payload fields, then the command word, in one batch.
fn payload_writes(tags: &RequireDataTags, payload: &Payload) -> Vec<TagWrite> {
    let mut writes = vec![TagWrite::new(
        &tags.tooling_index,
        ValueType::UInt64,
        payload.data.index,
    )];
    if !payload.do_all {
        writes.push(TagWrite::new(
            &tags.tooling_content,
            ValueType::ByteString,
            payload.data.content.clone(),
        ));
    }
    let do_all = if payload.do_all {
        DoAllFlag::DoAll
    } else {
        DoAllFlag::NotDoAll
    };
    let valid = if payload.is_valid {
        DataValid::IsValid
    } else {
        DataValid::NotValid
    };
    writes.push(TagWrite::u16(&tags.do_all, do_all));
    writes.push(TagWrite::u16(&tags.data_valid, valid));
    writes.push(TagWrite::u16(&tags.command, SendCommand::Executing));
    writes
}

impl Behavior for RequireDataCycle {
    type State = S;
    type Event = E;
    const NAME: &'static str = "require-data";

    fn on_entry(&mut self, state: S, cx: &mut Context<S, E>) {
        match state {
            S::Cycle => debug!("data request cycle started"),
            S::Wait => self.wait_for_request(cx),
            S::Decode => self.decode(cx),
            S::AwaitData => self.announce(cx),
            S::PushData => self.push(cx),
            S::Finalize => self.finalize(cx),
            S::Fail => {
                warn!("data request cycle failed, waiting for the next request");
                cx.post(E::Restart);
            }
            S::Success => {
                info!("tooling data delivered");
                cx.post(E::Restart);
            }
        }
    }

    fn on_stopped(&mut self, _cx: &mut Context<S, E>) {
        self.payload = None;
        self.decoded.lock().take();
        debug!("data request cycle stopped");
    }
}
