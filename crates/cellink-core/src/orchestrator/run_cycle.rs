// ── Pick/place run cycle ──
//
//   Running
//   ├── CheckExistingError ──HasErrors──▶ ErrorRecovery
//   │                      ──NoErrors───▶ Normal
//   ├── ErrorRecovery
//   │     Alert ─TryRecover─▶ TryConnect ─Connected─▶ Reset ─InitSent─▶ AwaitReset
//   │                                                   │                  │
//   │                   ErrorRecovery ◀──ResetFailed────┘    ResetOk ──▶ CheckExistingError
//   └── Normal
//         Wait ▶ Plan ▶ PlanRespond ▶ WaitExecuteCommand ▶ Lock ▶ Executing
//              ▶ WaitExternalCompletion ▶ Unlock ▶ Finalize ▶ (Normal | Success)
//
// ExistError, Disconnected and DeviceFault leave Normal for
// ErrorRecovery from any nested state. StopRequested ends the machine
// from anywhere. The station client runs on a dedicated worker thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use indexmap::IndexSet;
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use cellink_api::{TagBackend, ValueType};

use crate::client::ConnectionState;
use crate::codes::{
    ExecuteState, PlanRespond, ReadyState, SendCommand, ToolingPresence,
};
use crate::config::{PollIntervals, RunMode, StationConfig};
use crate::error::CoreError;
use crate::event::{EventBus, StationEvent};
use crate::fsm::{Behavior, Chart, ChartError, Context, MachineHandle, MachineStatus};
use crate::model::Direction;
use crate::operation::{self, AsyncOperation};
use crate::worker::Worker;

use super::station::{Station, chart_error};

use RunEvent as E;
use RunState as S;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RunState {
    Running,
    CheckExistingError,
    ErrorRecovery,
    Alert,
    TryConnect,
    Reset,
    AwaitReset,
    Normal,
    Wait,
    Plan,
    PlanRespond,
    WaitExecuteCommand,
    Lock,
    Executing,
    WaitExternalCompletion,
    Unlock,
    Finalize,
    Fail,
    Success,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RunEvent {
    NoErrors,
    HasErrors,
    TryRecover,
    Connected,
    InitSent,
    ResetOk,
    ResetFailed,
    StartPlanning,
    PlanWritten,
    PlanAllowed,
    PlanDenied,
    NeedExecute,
    Locked,
    ExecutingWritten,
    ExternalDone,
    Unlocked,
    Finalized,
    ExistError,
    Disconnected,
    DeviceFault,
    StopRequested,
    Restart,
}

pub(crate) fn chart(mode: RunMode) -> Result<Chart<S, E>, ChartError> {
    let builder = Chart::builder(S::Running)
        .state(S::Running)
        .state(S::Success)
        .state(S::Stopped)
        .substate(S::Running, S::CheckExistingError)
        .substate(S::Running, S::ErrorRecovery)
        .substate(S::Running, S::Normal)
        .substate(S::ErrorRecovery, S::Alert)
        .substate(S::ErrorRecovery, S::TryConnect)
        .substate(S::ErrorRecovery, S::Reset)
        .substate(S::ErrorRecovery, S::AwaitReset)
        .substate(S::Normal, S::Wait)
        .substate(S::Normal, S::Plan)
        .substate(S::Normal, S::PlanRespond)
        .substate(S::Normal, S::WaitExecuteCommand)
        .substate(S::Normal, S::Lock)
        .substate(S::Normal, S::Executing)
        .substate(S::Normal, S::WaitExternalCompletion)
        .substate(S::Normal, S::Unlock)
        .substate(S::Normal, S::Finalize)
        .substate(S::Normal, S::Fail)
        .initial(S::ErrorRecovery, S::Alert)
        .initial(S::Normal, S::Wait)
        .terminal(S::Success)
        .terminal(S::Stopped)
        .on(S::Running, E::StopRequested, S::Stopped)
        .on(S::CheckExistingError, E::HasErrors, S::ErrorRecovery)
        .on(S::CheckExistingError, E::NoErrors, S::Normal)
        .on(S::Alert, E::TryRecover, S::TryConnect)
        .on(S::TryConnect, E::Connected, S::Reset)
        .on(S::Reset, E::InitSent, S::AwaitReset)
        .on(S::Reset, E::ResetFailed, S::ErrorRecovery)
        .on(S::AwaitReset, E::ResetOk, S::CheckExistingError)
        .on(S::AwaitReset, E::ResetFailed, S::ErrorRecovery)
        .on(S::Normal, E::ExistError, S::ErrorRecovery)
        .on(S::Normal, E::Disconnected, S::ErrorRecovery)
        .on(S::Normal, E::DeviceFault, S::ErrorRecovery)
        .on(S::Wait, E::StartPlanning, S::Plan)
        .on(S::Plan, E::PlanWritten, S::PlanRespond)
        .on(S::PlanRespond, E::PlanAllowed, S::WaitExecuteCommand)
        .on(S::PlanRespond, E::PlanDenied, S::Fail)
        .on(S::WaitExecuteCommand, E::NeedExecute, S::Lock)
        .on(S::Lock, E::Locked, S::Executing)
        .on(S::Executing, E::ExecutingWritten, S::WaitExternalCompletion)
        .on(S::WaitExternalCompletion, E::ExternalDone, S::Unlock)
        .on(S::Unlock, E::Unlocked, S::Finalize);

    let builder = match mode {
        RunMode::Auto => builder
            .initial(S::Running, S::CheckExistingError)
            .on(S::Finalize, E::Finalized, S::Normal)
            .on(S::Fail, E::Restart, S::Normal),
        RunMode::Manual => builder
            .initial(S::Running, S::Normal)
            .on(S::Finalize, E::Finalized, S::Success)
            .terminal(S::Fail),
    };
    builder.build()
}

// ── Shared fault state ──────────────────────────────────────────────

#[derive(Debug, Default)]
struct RunShared {
    /// Accumulated fault messages, cleared only by a successful reset.
    faults: Mutex<IndexSet<String>>,
    has_error: AtomicBool,
}

impl RunShared {
    fn push_fault(&self, message: impl Into<String>) {
        self.faults.lock().insert(message.into());
    }

    fn has_faults(&self) -> bool {
        !self.faults.lock().is_empty()
    }

    fn remove_all_errors(&self) {
        self.faults.lock().clear();
        self.has_error.store(false, Ordering::Release);
    }

    fn message(&self) -> String {
        let faults = self.faults.lock();
        if faults.is_empty() {
            "station entered the error state".to_owned()
        } else {
            faults.iter().map(String::as_str).collect::<Vec<_>>().join("; ")
        }
    }
}

/// Record `e` as a fault and turn it into `ExistError`.
fn fault(shared: &RunShared, step: &'static str, e: &CoreError) -> Option<E> {
    warn!(
        machine = RunBehavior::NAME,
        step,
        field = e.field().unwrap_or_default(),
        error = %e,
        "run step failed"
    );
    shared.push_fault(e.to_string());
    Some(E::ExistError)
}

// ── Behavior ────────────────────────────────────────────────────────

struct RunBehavior {
    station: Station,
    mode: RunMode,
    poll: PollIntervals,
    shared: Arc<RunShared>,
    direction: Option<Direction>,
}

impl RunBehavior {
    fn events(&self) -> &EventBus {
        self.station.events()
    }

    /// Readiness of the station for a transfer in `direction`, from the mirror.
    fn is_ready(&self, direction: Direction) -> bool {
        let state = self.station.device_state();
        let ready = state.ready(direction) == Some(ReadyState::HasReady);
        let tooling = match (self.mode, direction) {
            (RunMode::Manual, _) => true,
            (RunMode::Auto, Direction::PutIn) => {
                state.work_area_tooling() == Some(ToolingPresence::NoTooling)
            }
            (RunMode::Auto, Direction::TakeOut) => {
                state.work_area_tooling() == Some(ToolingPresence::HasTooling)
            }
        };
        self.station.is_connected() && ready && tooling
    }

    fn confirm(&mut self, direction: Direction, cx: &Context<S, E>) -> bool {
        let waiting = cx.active() == Some(S::Wait);
        if waiting && self.is_ready(direction) {
            info!(%direction, "transfer confirmed, start planning");
            self.direction = Some(direction);
            cx.post(E::StartPlanning);
            return true;
        }
        debug!(%direction, waiting, "transfer not possible now");
        self.events().emit(StationEvent::confirm(direction, false));
        false
    }

    fn finish(&self, direction: Direction, cx: &Context<S, E>) -> bool {
        if cx.active() == Some(S::WaitExternalCompletion) && self.direction == Some(direction) {
            cx.post(E::ExternalDone);
            true
        } else {
            debug!(%direction, active = ?cx.active(), "finish signal ignored");
            false
        }
    }

    /// Direction of the transfer in progress, or `ExistError`.
    fn require_direction(&self, cx: &Context<S, E>) -> Option<Direction> {
        if self.direction.is_none() {
            self.shared.push_fault("no transfer direction recorded");
            cx.post(E::ExistError);
        }
        self.direction
    }

    // ── Error recovery ──────────────────────────────────────────────

    fn check_existing_error(&self, cx: &Context<S, E>) {
        if self.shared.has_faults() {
            warn!(faults = %self.shared.message(), "station has existing errors");
            cx.post(E::HasErrors);
        } else {
            cx.post(E::NoErrors);
        }
    }

    fn alert(&self) {
        self.shared.has_error.store(true, Ordering::Release);
        let message = self.shared.message();
        warn!(station = %self.station.name(), %message, "station entered the error state");
        self.events().emit(StationEvent::Alert { message });
    }

    fn try_connect(&self, cx: &mut Context<S, E>) {
        if self.station.is_connected() {
            cx.post(E::Connected);
            return;
        }
        info!(station = %self.station.name(), "reconnecting");
        let station = self.station.clone();
        cx.poll(self.poll.connect, move || {
            let station = station.clone();
            async move {
                match station.client().connection_state() {
                    ConnectionState::Connected => Some(E::Connected),
                    ConnectionState::Disconnected => match station.connect().await {
                        Ok(()) => Some(E::Connected),
                        Err(e) => {
                            debug!(error = %e, "reconnect attempt failed");
                            None
                        }
                    },
                    ConnectionState::Connecting | ConnectionState::Disconnecting => None,
                }
            }
        });
    }

    fn reset(&self, cx: &mut Context<S, E>) {
        let station = self.station.clone();
        let shared = self.shared.clone();
        cx.spawn(async move {
            match station.execute_init_command().await {
                Ok(()) => Some(E::InitSent),
                Err(e) => {
                    shared.push_fault(format!("reset failed: {e}"));
                    Some(E::ResetFailed)
                }
            }
        });
    }

    fn await_reset(&self, cx: &mut Context<S, E>) {
        let station = self.station.clone();
        let shared = self.shared.clone();
        let field = station.config().tags.init_execute_state.clone();
        cx.poll(self.poll.init_finish, move || {
            let station = station.clone();
            let shared = shared.clone();
            let field = field.clone();
            async move {
                match station.client().read_u16(&field).await.map(ExecuteState::from_code) {
                    Ok(Some(ExecuteState::Finished)) => {
                        info!("station recovered from error");
                        shared.remove_all_errors();
                        Some(E::ResetOk)
                    }
                    Ok(Some(ExecuteState::ErrorExecuting)) => {
                        shared.push_fault("reset failed");
                        Some(E::ResetFailed)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        shared.push_fault(format!("reset failed: {e}"));
                        Some(E::ResetFailed)
                    }
                }
            }
        });
    }

    // ── Normal operation ────────────────────────────────────────────

    fn plan(&self, cx: &mut Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        let station = self.station.clone();
        let shared = self.shared.clone();
        cx.spawn(async move {
            match station.plan(direction).await {
                Ok(()) => Some(E::PlanWritten),
                Err(e) => fault(&shared, "plan", &e),
            }
        });
    }

    fn wait_plan_respond(&self, cx: &mut Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        let client = self.station.client().clone();
        let field = self.station.config().tags.transfer(direction).plan_respond.clone();
        cx.poll(self.poll.plan_respond, move || {
            let client = client.clone();
            let field = field.clone();
            async move {
                match client.read_u16(&field).await.map(PlanRespond::from_code) {
                    Ok(Some(PlanRespond::AllowedPlan)) => {
                        info!("plan allowed");
                        Some(E::PlanAllowed)
                    }
                    Ok(Some(PlanRespond::NotAllowedPlan)) => {
                        warn!("plan not allowed");
                        Some(E::PlanDenied)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        trace!(field = %field, error = %e, "plan respond poll failed");
                        None
                    }
                }
            }
        });
    }

    fn wait_execute_command(&self, cx: &mut Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        let client = self.station.client().clone();
        let field = self.station.config().tags.transfer(direction).command.clone();
        cx.poll(self.poll.execute_command, move || {
            let client = client.clone();
            let field = field.clone();
            async move {
                match client.read_u16(&field).await {
                    Ok(code) if SendCommand::from_code(code) == Some(SendCommand::NeedExecute) => {
                        Some(E::NeedExecute)
                    }
                    Ok(_) => None,
                    Err(e) => {
                        trace!(field = %field, error = %e, "command poll failed");
                        None
                    }
                }
            }
        });
    }

    fn lock(&self, cx: &mut Context<S, E>, locked: bool) {
        let station = self.station.clone();
        let shared = self.shared.clone();
        cx.spawn(async move {
            match station.write_lock(locked).await {
                Ok(()) if locked => Some(E::Locked),
                Ok(()) => Some(E::Unlocked),
                Err(e) => fault(&shared, if locked { "lock" } else { "unlock" }, &e),
            }
        });
    }

    fn executing(&self, cx: &mut Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        let client = self.station.client().clone();
        let field = self.station.config().tags.transfer(direction).execute_state.clone();
        let shared = self.shared.clone();
        cx.spawn(async move {
            match client
                .write_tag(&field, ExecuteState::Executing, ValueType::UInt16)
                .await
            {
                Ok(()) => Some(E::ExecutingWritten),
                Err(e) => fault(&shared, "executing", &e),
            }
        });
    }

    fn await_completion(&self, cx: &Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        info!(%direction, "waiting for the transfer to finish");
        self.events().emit(StationEvent::confirm(direction, true));
    }

    fn finalize(&self, cx: &mut Context<S, E>) {
        let Some(direction) = self.require_direction(cx) else {
            return;
        };
        let client = self.station.client().clone();
        let tags = self.station.config().tags.transfer(direction).clone();
        let events = self.events().clone();
        let shared = self.shared.clone();
        cx.spawn(async move {
            let result = async {
                client
                    .write_tag(&tags.command, SendCommand::NotExecute, ValueType::UInt16)
                    .await?;
                client
                    .write_tag(&tags.execute_state, ExecuteState::Finished, ValueType::UInt16)
                    .await
            }
            .await;
            match result {
                Ok(()) => {
                    info!(%direction, "transfer finished");
                    events.emit(StationEvent::finished(direction));
                    Some(E::Finalized)
                }
                Err(e) => fault(&shared, "finalize", &e),
            }
        });
    }
}

impl Behavior for RunBehavior {
    type State = S;
    type Event = E;
    const NAME: &'static str = "run";

    fn on_entry(&mut self, state: S, cx: &mut Context<S, E>) {
        self.events().emit(StationEvent::RunStateChanged {
            state: state.to_string(),
        });
        match state {
            S::Running => info!(station = %self.station.name(), mode = %self.mode, "run cycle started"),
            S::CheckExistingError => self.check_existing_error(cx),
            S::Alert => self.alert(),
            S::TryConnect => self.try_connect(cx),
            S::Reset => self.reset(cx),
            S::AwaitReset => self.await_reset(cx),
            S::ErrorRecovery | S::Normal => {}
            S::Wait => {
                self.direction = None;
                debug!("waiting for a transfer request");
            }
            S::Plan => self.plan(cx),
            S::PlanRespond => self.wait_plan_respond(cx),
            S::WaitExecuteCommand => self.wait_execute_command(cx),
            S::Lock => self.lock(cx, true),
            S::Executing => self.executing(cx),
            S::WaitExternalCompletion => self.await_completion(cx),
            S::Unlock => self.lock(cx, false),
            S::Finalize => self.finalize(cx),
            S::Fail => {
                warn!(station = %self.station.name(), "transfer failed");
                if self.mode == RunMode::Auto {
                    cx.post(E::Restart);
                }
            }
            S::Success => info!("manual transfer complete"),
            S::Stopped => info!("run cycle stopped on request"),
        }
    }

    fn on_stopped(&mut self, _cx: &mut Context<S, E>) {
        self.direction = None;
        debug!("run cycle halted");
    }
}

// ── RunCycle ────────────────────────────────────────────────────────

/// Drives complete put-in/take-out transfers for one station.
///
/// The station and its client live on a dedicated worker thread; every
/// method here only posts to it. Cheap to clone.
#[derive(Clone)]
pub struct RunCycle {
    inner: Arc<RunInner>,
}

struct RunInner {
    station: Station,
    machine: MachineHandle<RunBehavior>,
    shared: Arc<RunShared>,
    mode: RunMode,
    cancel: CancellationToken,
    // Last: joined after everything running on it is released.
    worker: Worker,
}

impl Drop for RunInner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.machine.shutdown();
    }
}

impl RunCycle {
    /// Spawn the worker thread and build the station on it.
    ///
    /// Blocks until the worker is up. Does not connect or start.
    pub fn new(config: StationConfig, backend: Arc<dyn TagBackend>) -> Result<Self, CoreError> {
        let worker = Worker::spawn(&format!("cellink-{}", config.name))?;
        let shared = Arc::new(RunShared::default());
        let cancel = CancellationToken::new();
        let mode = config.run_mode;

        let (station, machine) = {
            let shared = shared.clone();
            let cancel = cancel.clone();
            worker.run_and_wait(move || -> Result<_, CoreError> {
                let poll = config.poll.clone();
                let station = Station::new(config, backend)?;
                let machine = MachineHandle::spawn(
                    chart(mode).map_err(|e| chart_error(&e))?,
                    RunBehavior {
                        station: station.clone(),
                        mode,
                        poll,
                        shared: shared.clone(),
                        direction: None,
                    },
                );
                tokio::spawn(watch_connection(
                    station.client().subscribe_state(),
                    machine.clone(),
                    shared,
                    cancel,
                ));
                Ok((station, machine))
            })??
        };

        Ok(Self {
            inner: Arc::new(RunInner {
                station,
                machine,
                shared,
                mode,
                cancel,
                worker,
            }),
        })
    }

    pub fn station(&self) -> &Station {
        &self.inner.station
    }

    pub fn events(&self) -> &EventBus {
        self.inner.station.events()
    }

    pub fn mode(&self) -> RunMode {
        self.inner.mode
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the cycle. No-op while running.
    pub fn start(&self) {
        self.inner.machine.start();
    }

    pub fn pause(&self) {
        self.inner.machine.pause();
    }

    pub fn resume(&self) {
        self.inner.machine.resume();
    }

    /// End the cycle from any state. No-op when stopped.
    pub fn stop(&self) {
        self.inner.machine.resume();
        self.inner.machine.post(E::StopRequested);
    }

    pub fn status(&self) -> MachineStatus<RunState> {
        self.inner.machine.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineStatus<RunState>> {
        self.inner.machine.subscribe()
    }

    pub fn is_in(&self, state: RunState) -> bool {
        self.inner.machine.is_in(state)
    }

    // ── Transfers ───────────────────────────────────────────────────

    /// Ask whether a carrier may be put in now; starts planning if so.
    ///
    /// `false` is also reported as [`StationEvent::ConfirmCanPutIn`].
    pub fn require_confirm_put_in(&self) -> AsyncOperation<bool> {
        self.require_confirm(Direction::PutIn)
    }

    pub fn require_confirm_take_out(&self) -> AsyncOperation<bool> {
        self.require_confirm(Direction::TakeOut)
    }

    fn require_confirm(&self, direction: Direction) -> AsyncOperation<bool> {
        self.inner
            .machine
            .call(move |run: &mut RunBehavior, cx: &mut Context<S, E>| run.confirm(direction, cx))
    }

    /// The physical put-in is done. `false` if no put-in was awaited.
    pub fn finish_put_in(&self) -> AsyncOperation<bool> {
        self.finish(Direction::PutIn)
    }

    pub fn finish_take_out(&self) -> AsyncOperation<bool> {
        self.finish(Direction::TakeOut)
    }

    fn finish(&self, direction: Direction) -> AsyncOperation<bool> {
        self.inner
            .machine
            .call(move |run: &mut RunBehavior, cx: &mut Context<S, E>| run.finish(direction, cx))
    }

    /// Release the lock outside the cycle, e.g. before moving a carrier by hand.
    pub fn unlock_for_transport(&self) -> AsyncOperation<()> {
        let station = self.inner.station.clone();
        let shared = self.inner.shared.clone();
        let machine = self.inner.machine.clone();
        operation::spawn_on(self.inner.worker.handle(), async move {
            let result = station.write_lock(false).await;
            if let Err(e) = &result {
                if let Some(event) = fault(&shared, "unlock for transport", e) {
                    machine.post(event);
                }
            }
            result
        })
    }

    // ── Faults ──────────────────────────────────────────────────────

    /// Operator request to leave the alert state and recover.
    pub fn try_recover(&self) {
        self.inner.machine.post(E::TryRecover);
    }

    /// Equipment fault reported from outside the protocol.
    pub fn report_fault(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(station = %self.inner.station.name(), %message, "device fault reported");
        self.inner
            .shared
            .push_fault(CoreError::DeviceFault { message }.to_string());
        self.inner.machine.post(E::DeviceFault);
    }

    /// Accumulated fault messages, oldest first.
    pub fn faults(&self) -> Vec<String> {
        self.inner.shared.faults.lock().iter().cloned().collect()
    }

    /// Whether the station is in the error state.
    pub fn has_error(&self) -> bool {
        self.inner.shared.has_error.load(Ordering::Acquire)
    }
}

/// Turn a dropped connection during normal operation into a machine event.
async fn watch_connection(
    states: watch::Receiver<ConnectionState>,
    machine: MachineHandle<RunBehavior>,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
) {
    let mut states = WatchStream::from_changes(states);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = states.next() => {
                let Some(state) = next else { break };
                if state == ConnectionState::Disconnected && machine.is_in(S::Normal) {
                    shared.push_fault("device disconnected");
                    machine.post(E::Disconnected);
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn denied_plan_never_reaches_execute_command() {
        let chart = chart(RunMode::Auto).unwrap();
        let step = chart.resolve(S::PlanRespond, E::PlanDenied).unwrap();
        assert_eq!(step.entries, vec![S::Fail]);
        assert!(chart.resolve(S::Plan, E::NeedExecute).is_none());
        assert!(chart.resolve(S::Wait, E::PlanAllowed).is_none());
    }

    #[test]
    fn faults_in_normal_operation_enter_recovery_at_the_alert() {
        let chart = chart(RunMode::Auto).unwrap();
        for event in [E::ExistError, E::Disconnected, E::DeviceFault] {
            let step = chart.resolve(S::Lock, event).unwrap();
            assert_eq!(step.source, S::Normal);
            assert_eq!(step.exits, vec![S::Lock, S::Normal]);
            assert_eq!(step.entries, vec![S::ErrorRecovery, S::Alert]);
        }
    }

    #[test]
    fn recovery_resumes_through_the_error_check() {
        let chart = chart(RunMode::Auto).unwrap();
        let step = chart.resolve(S::AwaitReset, E::ResetOk).unwrap();
        assert_eq!(step.entries, vec![S::CheckExistingError]);
        assert!(chart.resolve(S::AwaitReset, E::NoErrors).is_none());
    }

    #[test]
    fn modes_differ_in_start_and_completion() {
        let auto = chart(RunMode::Auto).unwrap();
        assert_eq!(auto.start_path(), vec![S::Running, S::CheckExistingError]);
        let step = auto.resolve(S::Finalize, E::Finalized).unwrap();
        assert_eq!(step.entries, vec![S::Normal, S::Wait]);

        let manual = chart(RunMode::Manual).unwrap();
        assert_eq!(manual.start_path(), vec![S::Running, S::Normal, S::Wait]);
        let step = manual.resolve(S::Finalize, E::Finalized).unwrap();
        assert_eq!(step.entries, vec![S::Success]);
        assert!(manual.is_terminal(S::Fail));
        assert!(!auto.is_terminal(S::Fail));
    }

    #[test]
    fn fault_messages_are_deduplicated() {
        let shared = RunShared::default();
        shared.push_fault("device disconnected");
        shared.push_fault("device disconnected");
        shared.push_fault("reset failed");
        assert_eq!(shared.message(), "device disconnected; reset failed");
        shared.remove_all_errors();
        assert!(!shared.has_faults());
    }
}
