// ── Station facade ──
//
// One station: its tag client, the device-state mirror fed by change
// notification, the event bus, and the two device-initiated data
// cycles. Every operation reports its outcome twice: as the return
// value and as a `StationEvent` for observers that did not ask.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cellink_api::{TagBackend, ValueType};

use crate::client::{ConnectionState, TagChange, TagWrite, TransportClient};
use crate::codes::{ExecuteState, LockState, PlanRespond, PlanState, ReadyState, SendCommand};
use crate::command::{CommandSpec, execute_command};
use crate::config::StationConfig;
use crate::error::CoreError;
use crate::event::{EventBus, StationEvent, outcome};
use crate::fsm::{ChartError, Context, MachineHandle, MachineStatus};
use crate::model::{Direction, ToolingData};
use crate::state::DeviceState;
use crate::tags::TagMap;

use super::require_data::{self, Payload, RequireDataCycle, RequireDataEvent, RequireDataState};
use super::upload::{self, UploadCycle, UploadEvent, UploadState};

/// Control facade of one station. Cheap to clone.
#[derive(Clone)]
pub struct Station {
    inner: Arc<StationInner>,
}

struct StationInner {
    config: StationConfig,
    client: TransportClient,
    state: Arc<DeviceState>,
    events: EventBus,
    require_data: MachineHandle<RequireDataCycle>,
    upload: MachineHandle<UploadCycle>,
    cancel: CancellationToken,
}

impl Drop for StationInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.require_data.shutdown();
        self.upload.shutdown();
    }
}

pub(super) fn chart_error(e: &ChartError) -> CoreError {
    CoreError::Internal(format!("invalid state chart: {e}"))
}

impl Station {
    /// Build a station on the current runtime. Does not connect.
    ///
    /// Every monitored field is registered for change notification up
    /// front; the client keeps the subscriptions alive across reconnects.
    pub fn new(config: StationConfig, backend: Arc<dyn TagBackend>) -> Result<Self, CoreError> {
        let runtime = Handle::try_current()
            .map_err(|e| CoreError::Internal(format!("station needs a tokio runtime: {e}")))?;
        let client = TransportClient::spawn_on(&runtime, backend, config.client.clone());
        let state = Arc::new(DeviceState::new(config.tags.clone()));
        let events = EventBus::new();
        let cancel = CancellationToken::new();

        for field in config.tags.monitored() {
            client.monitor(field);
        }

        let require_data = MachineHandle::spawn(
            require_data::chart().map_err(|e| chart_error(&e))?,
            RequireDataCycle::new(
                client.clone(),
                state.clone(),
                events.clone(),
                config.poll.require_data,
            ),
        );
        let upload = MachineHandle::spawn(
            upload::chart().map_err(|e| chart_error(&e))?,
            UploadCycle::new(client.clone(), state.clone(), events.clone(), config.poll.upload),
        );

        runtime.spawn(mirror_fields(
            client.changes(),
            state.clone(),
            events.clone(),
            cancel.clone(),
        ));
        runtime.spawn(forward_connection(
            client.subscribe_state(),
            state.clone(),
            events.clone(),
            cancel.clone(),
        ));

        debug!(station = %config.name, endpoint = %config.address(), "station created");
        Ok(Self {
            inner: Arc::new(StationInner {
                config,
                client,
                state,
                events,
                require_data,
                upload,
                cancel,
            }),
        })
    }

    pub fn config(&self) -> &StationConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    fn tags(&self) -> &TagMap {
        &self.inner.config.tags
    }

    pub fn client(&self) -> &TransportClient {
        &self.inner.client
    }

    pub fn device_state(&self) -> &Arc<DeviceState> {
        &self.inner.state
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn is_connected(&self) -> bool {
        self.inner.client.is_connected()
    }

    // ── Connection ──────────────────────────────────────────────────

    /// Connect to the configured address.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let (host, port) = (self.inner.config.host.clone(), self.inner.config.port);
        self.try_connect(&host, port).await
    }

    pub async fn try_connect(&self, host: &str, port: u16) -> Result<(), CoreError> {
        info!(station = %self.name(), host, port, "connecting");
        let result = self.inner.client.connect(host, port).await;
        if let Err(e) = &result {
            warn!(station = %self.name(), error = %e, "connect failed");
        }
        self.inner.events.emit(StationEvent::ConnectResult(outcome(&result)));
        result
    }

    /// Stop both data cycles and close the session. Safe to repeat.
    pub async fn disconnect(&self) -> Result<(), CoreError> {
        self.stop_require_data_cycle();
        self.stop_upload_cycle();
        self.inner.client.disconnect().await
    }

    // ── Station commands ────────────────────────────────────────────

    /// Whether the station reports the configured device type.
    pub async fn check_device_type(&self) -> Result<bool, CoreError> {
        let expected = self.inner.config.expected_device_type;
        let result = self
            .inner
            .client
            .read_u16(&self.tags().device_type)
            .await
            .map(|actual| {
                if actual != expected {
                    warn!(station = %self.name(), expected, actual, "unexpected device type");
                }
                actual == expected
            });
        self.inner
            .events
            .emit(StationEvent::DeviceTypeChecked(outcome(&result)));
        result
    }

    /// Ask the station to (re)initialize.
    pub async fn execute_init_command(&self) -> Result<(), CoreError> {
        let tags = self.tags();
        let spec = CommandSpec::execute(
            "[init]",
            &tags.init_execute_state,
            &tags.init_command,
            SendCommand::NeedExecute,
        );
        let state = self.inner.state.clone();
        let result = execute_command(&self.inner.client, &spec, move || {
            state.set_init_execute_state(ExecuteState::NotExecute);
        })
        .await;
        self.inner
            .events
            .emit(StationEvent::InitCommandResult(outcome(&result)));
        result
    }

    /// Whether the station is ready to receive (put in) or send (take out).
    pub async fn read_ready(&self, direction: Direction) -> Result<bool, CoreError> {
        let field = &self.tags().transfer(direction).ready;
        let ready = self.inner.client.read_u16(field).await? == ReadyState::HasReady.code();
        self.inner
            .events
            .emit(StationEvent::ReadyState { direction, ready });
        Ok(ready)
    }

    pub async fn read_ready_to_receive(&self) -> Result<bool, CoreError> {
        self.read_ready(Direction::PutIn).await
    }

    pub async fn read_ready_to_send(&self) -> Result<bool, CoreError> {
        self.read_ready(Direction::TakeOut).await
    }

    /// Propose a transfer: reset the respond field, then raise the plan state.
    pub async fn plan(&self, direction: Direction) -> Result<(), CoreError> {
        let tags = self.tags().transfer(direction);
        let client = &self.inner.client;
        let result = async {
            client
                .write_tag(&tags.plan_respond, PlanRespond::InitValue, ValueType::UInt16)
                .await
                .map_err(|e| {
                    CoreError::write(&tags.plan_respond, format!("Set plan respond fail! {e}"))
                })?;
            self.inner
                .state
                .set(&tags.plan_respond, PlanRespond::InitValue.code());
            client
                .write_tag(&tags.plan_state, PlanState::BeInPlanning, ValueType::UInt16)
                .await
                .map_err(|e| CoreError::write(&tags.plan_state, format!("Set plan state fail! {e}")))
        }
        .await;
        if let Err(e) = &result {
            warn!(station = %self.name(), %direction, error = %e, "plan failed");
        }
        self.inner.events.emit(StationEvent::PlanResult {
            direction,
            result: outcome(&result),
        });
        result
    }

    pub async fn plan_receive(&self) -> Result<(), CoreError> {
        self.plan(Direction::PutIn).await
    }

    pub async fn plan_send(&self) -> Result<(), CoreError> {
        self.plan(Direction::TakeOut).await
    }

    /// Command the station to carry out the transfer for `direction`.
    pub async fn execute_transfer_command(&self, direction: Direction) -> Result<(), CoreError> {
        let tags = self.tags().transfer(direction);
        let prefix = match direction {
            Direction::PutIn => "[receive tooling]",
            Direction::TakeOut => "[send tooling]",
        };
        let spec = CommandSpec::execute(
            prefix,
            &tags.execute_state,
            &tags.command,
            SendCommand::NeedExecute,
        );
        let state = self.inner.state.clone();
        let status_field = tags.execute_state.clone();
        let result = execute_command(&self.inner.client, &spec, move || {
            state.set(&status_field, ExecuteState::NotExecute.code());
        })
        .await;
        self.inner.events.emit(StationEvent::CommandResult {
            direction,
            result: outcome(&result),
        });
        result
    }

    pub async fn execute_receive_command(&self) -> Result<(), CoreError> {
        self.execute_transfer_command(Direction::PutIn).await
    }

    pub async fn execute_send_command(&self) -> Result<(), CoreError> {
        self.execute_transfer_command(Direction::TakeOut).await
    }

    /// Withdraw a plan in one batch write.
    pub async fn cancel_plan(&self, direction: Direction) -> Result<(), CoreError> {
        let tags = self.tags().transfer(direction);
        let result = self
            .inner
            .client
            .write_tags(vec![
                TagWrite::u16(&tags.plan_respond, PlanRespond::InitValue),
                TagWrite::u16(&tags.plan_state, PlanState::NotBeInPlanning),
            ])
            .await;
        self.inner.events.emit(StationEvent::CancelPlanResult {
            direction,
            result: outcome(&result),
        });
        result
    }

    pub async fn cancel_plan_receive(&self) -> Result<(), CoreError> {
        self.cancel_plan(Direction::PutIn).await
    }

    pub async fn cancel_plan_send(&self) -> Result<(), CoreError> {
        self.cancel_plan(Direction::TakeOut).await
    }

    /// Whether the station is configured to take main control.
    pub async fn read_if_config_main_control(&self) -> Result<bool, CoreError> {
        let field = &self.tags().config_main_control;
        let value = self.inner.client.read_tag(field).await?;
        value.as_bool().ok_or_else(|| {
            CoreError::validation(field, "Read value attribute: value type is not right!")
        })
    }

    /// Claim (`true`) or release the station for a physical transfer.
    pub async fn write_lock(&self, locked: bool) -> Result<(), CoreError> {
        let value = if locked {
            LockState::Locked
        } else {
            LockState::Unlocked
        };
        self.inner
            .client
            .write_tag(&self.tags().lock, value, ValueType::UInt16)
            .await
    }

    // ── Data cycles ─────────────────────────────────────────────────

    /// Answer the pending data request.
    ///
    /// Fails with a sequence error unless the data-request cycle is
    /// waiting for data. The outcome of the write itself arrives as
    /// [`StationEvent::DataPushed`].
    pub async fn send_tooling_data(
        &self,
        data: ToolingData,
        is_valid: bool,
        do_all: bool,
    ) -> Result<(), CoreError> {
        let payload = Payload {
            data,
            is_valid,
            do_all,
        };
        self.inner
            .require_data
            .call(
                move |cycle: &mut RequireDataCycle,
                      cx: &mut Context<RequireDataState, RequireDataEvent>| {
                    cycle.accept(payload, cx)
                },
            )
            .await??;
        self.inner
            .require_data
            .dispatch(RequireDataEvent::DataSupplied)
            .await
            .map(|_| ())
    }

    /// The application has stored the announced work result.
    pub async fn upload_finished(&self) -> Result<(), CoreError> {
        self.inner
            .upload
            .dispatch(UploadEvent::UploadFinished)
            .await
            .map(|_| ())
    }

    /// No-op while running.
    pub fn start_require_data_cycle(&self) {
        self.inner.require_data.start();
    }

    pub fn stop_require_data_cycle(&self) {
        self.inner.require_data.stop();
    }

    pub fn start_upload_cycle(&self) {
        self.inner.upload.start();
    }

    pub fn stop_upload_cycle(&self) {
        self.inner.upload.stop();
    }

    pub fn require_data_status(&self) -> MachineStatus<RequireDataState> {
        self.inner.require_data.status()
    }

    pub fn upload_status(&self) -> MachineStatus<UploadState> {
        self.inner.upload.status()
    }

    /// Observe the data-request cycle's state changes.
    pub fn watch_require_data(&self) -> watch::Receiver<MachineStatus<RequireDataState>> {
        self.inner.require_data.subscribe()
    }

    pub fn watch_upload(&self) -> watch::Receiver<MachineStatus<UploadState>> {
        self.inner.upload.subscribe()
    }
}

// ── Background tasks ────────────────────────────────────────────────

/// Copy notified values into the snapshot; emit an event per real change.
async fn mirror_fields(
    changes: broadcast::Receiver<TagChange>,
    state: Arc<DeviceState>,
    events: EventBus,
    cancel: CancellationToken,
) {
    let mut changes = BroadcastStream::new(changes);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            item = changes.next() => match item {
                Some(Ok(change)) => {
                    if let Some(value) = change.value.as_u16() {
                        if state.apply(&change.tag, value) {
                            trace!(field = %change.tag, value, "field changed");
                            events.emit(StationEvent::FieldChanged {
                                field: change.tag,
                                value,
                            });
                        }
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(n))) => {
                    warn!(skipped = n, "field mirror lagged");
                }
                None => break,
            },
        }
    }
}

async fn forward_connection(
    states: watch::Receiver<ConnectionState>,
    state: Arc<DeviceState>,
    events: EventBus,
    cancel: CancellationToken,
) {
    let mut states = WatchStream::new(states);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = states.next() => {
                let Some(next) = next else { break };
                if state.connection() == next {
                    continue;
                }
                state.set_connection(next);
                if next == ConnectionState::Disconnected {
                    state.invalidate();
                }
                events.emit(StationEvent::ConnectionChanged { state: next });
            }
        }
    }
}
