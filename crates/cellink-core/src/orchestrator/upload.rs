// ── Upload cycle ──
//
// Device-initiated: the station raises its upload flag when a carrier's
// work result is ready to be collected.
//
//   Wait ─Requested─▶ CheckValid ─DataIsValid─▶ Decode ─Decoded─▶ AwaitUpload
//     ▲                                                              │
//     │                                                   UploadFinished
//     └─Restart─ Success ◀─Finalized─ Finalize ◀──────────────────────┘
//
// A result flagged invalid is an ExistError like any failed read.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strum::Display;
use tracing::{debug, info, trace, warn};

use cellink_api::{ValueType, Variant};

use crate::client::TransportClient;
use crate::codes::{DataValid, ExecuteState, RequireState};
use crate::error::CoreError;
use crate::event::{EventBus, StationEvent};
use crate::fsm::{Behavior, Chart, ChartError, Context};
use crate::model::{ToolingData, ToolingIdentifier};
use crate::state::DeviceState;
use crate::tags::UploadTags;

use super::{advance, decode};

use UploadEvent as E;
use UploadState as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UploadState {
    Cycle,
    Wait,
    CheckValid,
    Decode,
    AwaitUpload,
    Finalize,
    Fail,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum UploadEvent {
    Requested,
    DataIsValid,
    Decoded,
    UploadFinished,
    Finalized,
    ExistError,
    Restart,
}

pub(crate) fn chart() -> Result<Chart<S, E>, ChartError> {
    Chart::builder(S::Cycle)
        .state(S::Cycle)
        .substate(S::Cycle, S::Wait)
        .substate(S::Cycle, S::CheckValid)
        .substate(S::Cycle, S::Decode)
        .substate(S::Cycle, S::AwaitUpload)
        .substate(S::Cycle, S::Finalize)
        .substate(S::Cycle, S::Fail)
        .substate(S::Cycle, S::Success)
        .initial(S::Cycle, S::Wait)
        .on(S::Wait, E::Requested, S::CheckValid)
        .on(S::CheckValid, E::DataIsValid, S::Decode)
        .on(S::Decode, E::Decoded, S::AwaitUpload)
        .on(S::AwaitUpload, E::UploadFinished, S::Finalize)
        .on(S::Finalize, E::Finalized, S::Success)
        .on(S::Cycle, E::ExistError, S::Fail)
        .on(S::Fail, E::Restart, S::Wait)
        .on(S::Success, E::Restart, S::Wait)
        .build()
}

pub(crate) struct UploadCycle {
    client: TransportClient,
    tags: UploadTags,
    state: Arc<DeviceState>,
    events: EventBus,
    period: Duration,
    decoded: Arc<Mutex<Option<ToolingData>>>,
}

impl UploadCycle {
    pub(crate) fn new(
        client: TransportClient,
        state: Arc<DeviceState>,
        events: EventBus,
        period: Duration,
    ) -> Self {
        Self {
            client,
            tags: state.tags().upload.clone(),
            state,
            events,
            period,
            decoded: Arc::new(Mutex::new(None)),
        }
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
                        trace!(field = %field, error = %e, "upload flag poll failed");
                        None
                    }
                }
            }
        });
    }

    fn check_valid(&self, cx: &mut Context<S, E>) {
        let client = self.client.clone();
        let field = self.tags.data_valid.clone();
        cx.spawn(async move {
            let result = client.read_u16(&field).await.and_then(|code| {
                if DataValid::from_code(code) == Some(DataValid::IsValid) {
                    Ok(())
                } else {
                    Err(CoreError::validation(
                        field.as_str(),
                        format!("upload data is not valid: {field} = {code}"),
                    ))
                }
            });
            advance(Self::NAME, "check valid", result, E::DataIsValid, E::ExistError)
        });
    }

    fn decode(&self, cx: &mut Context<S, E>) {
        let client = self.client.clone();
        let tags = self.tags.clone();
        let slot = self.decoded.clone();
        cx.spawn(async move {
            let result = read_result(&client, &tags).await.map(|data| {
                *slot.lock() = Some(data);
            });
            advance(Self::NAME, "decode", result, E::Decoded, E::ExistError)
        });
    }

    fn announce(&self, cx: &Context<S, E>) {
        let Some(data) = self.decoded.lock().take() else {
            cx.post(E::ExistError);
            return;
        };
        info!(identifier = %data.identifier, index = data.index, "station uploads work result");
        self.events.emit(StationEvent::UploadData { data });
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
                state.set_upload_request(RequireState::NotRequire);
                client
                    .write_tag(&tags.execute_state, ExecuteState::Finished, ValueType::UInt16)
                    .await
            }
            .await;
            advance(Self::NAME, "finalize", result, E::Finalized, E::ExistError)
        });
    }
}

async fn read_result(client: &TransportClient, tags: &UploadTags) -> Result<ToolingData, CoreError> {
    let values = client
        .read_tags(&[
            &tags.identifier_type,
            &tags.identifier,
            &tags.tooling_index,
            &tags.tooling_content,
        ])
        .await?;
    let kind = decode(&values, &tags.identifier_type, Variant::as_u16)?;
    let code = decode(&values, &tags.identifier, Variant::as_bytes)?;
    let index = decode(&values, &tags.tooling_index, Variant::as_u64)?;
    let content = decode(&values, &tags.tooling_content, Variant::as_bytes)?;
    client
        .write_tag(&tags.execute_state, ExecuteState::Executing, ValueType::UInt16)
        .await?;
    Ok(ToolingData {
        identifier: ToolingIdentifier::new(kind, code),
        index,
        content,
    })
}

impl Behavior for UploadCycle {
    type State = S;
    type Event = E;
    const NAME: &'static str = "upload";

    fn on_entry(&mut self, state: S, cx: &mut Context<S, E>) {
        match state {
            S::Cycle => debug!("upload cycle started"),
            S::Wait => self.wait_for_request(cx),
            S::CheckValid => self.check_valid(cx),
            S::Decode => self.decode(cx),
            S::AwaitUpload => self.announce(cx),
            S::Finalize => self.finalize(cx),
            S::Fail => {
                warn!("upload cycle failed, waiting for the next request");
                cx.post(E::Restart);
            }
            S::Success => {
                info!("work result collected");
                cx.post(E::Restart);
            }
        }
    }

    fn on_stopped(&mut self, _cx: &mut Context<S, E>) {
        self.decoded.lock().take();
        debug!("upload cycle stopped");
    }
}
