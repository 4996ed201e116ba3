// ── Machine runtime ──
//
// Each machine runs in its own task with two queues: control messages
// from handles (start, stop, pause, events, closures run against the
// behavior) and events posted by the machine's own activities. Every
// activity started while entering a state is owned by that state and
// aborted when it is left. Events from an activity carry a stamp of the
// state activation that produced them; once that activation is gone the
// event is dropped, so late completions never reach a state they were
// not meant for.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::chart::{Chart, EventId, StateId, Step};
use crate::error::CoreError;
use crate::operation::{self, AsyncOperation};

// ── Behavior ────────────────────────────────────────────────────────

/// The hooks a machine runs as it enters and leaves states.
pub trait Behavior: Send + 'static {
    type State: StateId;
    type Event: EventId;

    /// Name used in logs and sequence errors.
    const NAME: &'static str;

    fn on_entry(&mut self, state: Self::State, cx: &mut Context<Self::State, Self::Event>);

    fn on_exit(&mut self, _state: Self::State, _cx: &mut Context<Self::State, Self::Event>) {}

    /// The machine stopped, by request or by reaching a terminal state.
    fn on_stopped(&mut self, _cx: &mut Context<Self::State, Self::Event>) {}
}

// ── Events & stamps ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp<S> {
    state: S,
    activation: u64,
}

#[derive(Debug)]
struct Envelope<S, E> {
    event: E,
    stamp: Option<Stamp<S>>,
}

/// Posts events into a machine from a spawned activity.
#[derive(Debug, Clone)]
pub struct EventSender<S, E> {
    tx: mpsc::UnboundedSender<Envelope<S, E>>,
    stamp: Option<Stamp<S>>,
}

impl<S: StateId, E: EventId> EventSender<S, E> {
    /// Queue `event`. Returns `false` once the machine task is gone.
    pub fn post(&self, event: E) -> bool {
        self.tx
            .send(Envelope {
                event,
                stamp: self.stamp,
            })
            .is_ok()
    }
}

// ── Context ─────────────────────────────────────────────────────────

/// What a hook can do: post events and start activities owned by the
/// state being entered.
pub struct Context<S, E> {
    tx: mpsc::UnboundedSender<Envelope<S, E>>,
    owner: Option<Stamp<S>>,
    active: Option<S>,
    activities: HashMap<S, Vec<JoinHandle<()>>>,
    paused: Arc<AtomicBool>,
}

impl<S: StateId, E: EventId> Context<S, E> {
    fn new(tx: mpsc::UnboundedSender<Envelope<S, E>>) -> Self {
        Self {
            tx,
            owner: None,
            active: None,
            activities: HashMap::new(),
            paused: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Innermost active state.
    pub fn active(&self) -> Option<S> {
        self.active
    }

    /// Queue an event. Inside `on_entry` it is bound to the state being entered.
    pub fn post(&self, event: E) {
        let _ = self.sender().post(event);
    }

    pub fn sender(&self) -> EventSender<S, E> {
        EventSender {
            tx: self.tx.clone(),
            stamp: self.owner,
        }
    }

    /// Run `activity` and post the event it yields, if any.
    ///
    /// Inside `on_entry` the task belongs to the entered state and is
    /// aborted when that state is left.
    pub fn spawn<F>(&mut self, activity: F)
    where
        F: Future<Output = Option<E>> + Send + 'static,
    {
        let sender = self.sender();
        let handle = tokio::spawn(async move {
            if let Some(event) = activity.await {
                sender.post(event);
            }
        });
        self.own(handle);
    }

    /// Poll every `period` until the state is left.
    ///
    /// The first check runs one period after entry. Ticks are skipped
    /// while the machine is paused; a check that yields an event posts
    /// it and polling continues until the resulting transition aborts it.
    pub fn poll<F, Fut>(&mut self, period: Duration, mut check: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Option<E>> + Send + 'static,
    {
        let sender = self.sender();
        let paused = self.paused.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if paused.load(Ordering::Acquire) {
                    continue;
                }
                if let Some(event) = check().await {
                    if !sender.post(event) {
                        break;
                    }
                }
            }
        });
        self.own(handle);
    }

    fn own(&mut self, handle: JoinHandle<()>) {
        match self.owner {
            Some(stamp) => self.activities.entry(stamp.state).or_default().push(handle),
            // Untracked: started from a handle closure rather than a state hook.
            None => drop(handle),
        }
    }

    fn cancel(&mut self, state: S) {
        if let Some(handles) = self.activities.remove(&state) {
            for handle in handles {
                handle.abort();
            }
        }
    }

    fn cancel_all(&mut self) {
        for (_, handles) in self.activities.drain() {
            for handle in handles {
                handle.abort();
            }
        }
    }
}

// ── Status ──────────────────────────────────────────────────────────

/// Externally observable machine status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineStatus<S> {
    pub running: bool,
    pub paused: bool,
    /// Innermost active state, or the last one after the machine stopped.
    pub active: Option<S>,
}

impl<S> Default for MachineStatus<S> {
    fn default() -> Self {
        Self {
            running: false,
            paused: false,
            active: None,
        }
    }
}

// ── Handle ──────────────────────────────────────────────────────────

type Job<B> = Box<
    dyn FnOnce(&mut B, &mut Context<<B as Behavior>::State, <B as Behavior>::Event>) + Send,
>;

enum Control<B: Behavior> {
    Start,
    Stop,
    Pause,
    Resume,
    Event(B::Event),
    Dispatch {
        event: B::Event,
        reply: operation::Completer<B::State>,
    },
    Call(Job<B>),
}

/// Handle to a running machine task. Cheap to clone.
pub struct MachineHandle<B: Behavior> {
    control: mpsc::UnboundedSender<Control<B>>,
    status: watch::Receiver<MachineStatus<B::State>>,
    chart: Arc<Chart<B::State, B::Event>>,
    cancel: CancellationToken,
}

impl<B: Behavior> Clone for MachineHandle<B> {
    fn clone(&self) -> Self {
        Self {
            control: self.control.clone(),
            status: self.status.clone(),
            chart: self.chart.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<B: Behavior> MachineHandle<B> {
    /// Spawn the machine task. The machine stays idle until [`start`](Self::start).
    pub fn spawn(chart: Chart<B::State, B::Event>, behavior: B) -> Self {
        let chart = Arc::new(chart);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(MachineStatus::default());
        let cancel = CancellationToken::new();

        let runner = Runner {
            chart: chart.clone(),
            behavior,
            cx: Context::new(events_tx),
            entered: HashMap::new(),
            activation: 0,
            running: false,
            buffer: VecDeque::new(),
            status: status_tx,
        };
        tokio::spawn(runner.run(control_rx, events_rx, cancel.clone()));

        Self {
            control: control_tx,
            status: status_rx,
            chart,
            cancel,
        }
    }

    fn send(&self, control: Control<B>) {
        if self.control.send(control).is_err() {
            trace!(machine = B::NAME, "machine task is gone");
        }
    }

    /// Enter the initial configuration. No-op while running.
    pub fn start(&self) {
        self.send(Control::Start);
    }

    /// Leave every state and stop all activities. No-op when stopped.
    pub fn stop(&self) {
        self.send(Control::Stop);
    }

    /// Hold events and polling until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.send(Control::Pause);
    }

    pub fn resume(&self) {
        self.send(Control::Resume);
    }

    /// Fire-and-forget event. Ignored if no active state accepts it.
    pub fn post(&self, event: B::Event) {
        self.send(Control::Event(event));
    }

    /// Deliver `event` now and report the resulting innermost state.
    ///
    /// Fails with [`CoreError::ProtocolSequence`] when the active state does
    /// not accept the event or the machine is not running.
    pub fn dispatch(&self, event: B::Event) -> AsyncOperation<B::State> {
        let (reply, op) = operation::pending();
        self.send(Control::Dispatch { event, reply });
        op
    }

    /// Run `f` on the machine task against the behavior.
    pub fn call<R, F>(&self, f: F) -> AsyncOperation<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut B, &mut Context<B::State, B::Event>) -> R + Send + 'static,
    {
        let (reply, op) = operation::pending();
        self.send(Control::Call(Box::new(
            move |behavior: &mut B, cx: &mut Context<B::State, B::Event>| {
                reply.succeed(f(behavior, cx));
            },
        )));
        op
    }

    pub fn status(&self) -> MachineStatus<B::State> {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<MachineStatus<B::State>> {
        self.status.clone()
    }

    pub fn is_running(&self) -> bool {
        self.status().running
    }

    /// Whether the machine is running with `state` active, directly or
    /// through a nested state.
    pub fn is_in(&self, state: B::State) -> bool {
        let status = self.status();
        status.running
            && status
                .active
                .is_some_and(|active| self.chart.is_within(active, state))
    }

    /// Terminate the machine task.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Runner ──────────────────────────────────────────────────────────

struct Runner<B: Behavior> {
    chart: Arc<Chart<B::State, B::Event>>,
    behavior: B,
    cx: Context<B::State, B::Event>,
    /// Activation number of every active state.
    entered: HashMap<B::State, u64>,
    activation: u64,
    running: bool,
    buffer: VecDeque<Envelope<B::State, B::Event>>,
    status: watch::Sender<MachineStatus<B::State>>,
}

impl<B: Behavior> Runner<B> {
    async fn run(
        mut self,
        mut control: mpsc::UnboundedReceiver<Control<B>>,
        mut events: mpsc::UnboundedReceiver<Envelope<B::State, B::Event>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                msg = control.recv() => {
                    let Some(msg) = msg else { break };
                    self.handle_control(msg);
                }
                Some(envelope) = events.recv() => self.deliver(envelope),
            }
        }
        self.stop();
        debug!(machine = B::NAME, "machine task finished");
    }

    fn handle_control(&mut self, msg: Control<B>) {
        match msg {
            Control::Start => self.start(),
            Control::Stop => self.stop(),
            Control::Pause => self.set_paused(true),
            Control::Resume => {
                self.set_paused(false);
                let held = std::mem::take(&mut self.buffer);
                for envelope in held {
                    self.deliver(envelope);
                }
            }
            Control::Event(event) => self.deliver(Envelope { event, stamp: None }),
            Control::Dispatch { event, reply } => {
                let outcome = if self.running && !self.is_paused() {
                    self.fire(event)
                } else {
                    Err(self.rejected(event))
                };
                reply.complete(outcome);
            }
            Control::Call(job) => {
                job(&mut self.behavior, &mut self.cx);
                self.publish();
            }
        }
    }

    fn is_paused(&self) -> bool {
        self.cx.paused.load(Ordering::Acquire)
    }

    fn set_paused(&mut self, paused: bool) {
        if !self.running || self.is_paused() == paused {
            return;
        }
        self.cx.paused.store(paused, Ordering::Release);
        debug!(machine = B::NAME, paused, "machine pause state changed");
        self.publish();
    }

    fn publish(&self) {
        let next = MachineStatus {
            running: self.running,
            paused: self.is_paused(),
            active: self.cx.active,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn rejected(&self, event: B::Event) -> CoreError {
        CoreError::ProtocolSequence {
            machine: B::NAME,
            state: self
                .cx
                .active
                .filter(|_| self.running)
                .map_or_else(|| "<stopped>".to_owned(), |s| format!("{s:?}")),
            event: format!("{event:?}"),
        }
    }

    fn start(&mut self) {
        if self.running {
            return;
        }
        self.running = true;
        self.cx.active = None;
        self.entered.clear();
        debug!(machine = B::NAME, "machine started");
        let entries = self.chart.start_path();
        self.enter(entries);
    }

    fn stop(&mut self) {
        if !self.running {
            return;
        }
        if let Some(active) = self.cx.active {
            for state in self.chart.ancestry(active) {
                self.cx.cancel(state);
                self.behavior.on_exit(state, &mut self.cx);
            }
        }
        self.halt();
        debug!(machine = B::NAME, "machine stopped");
    }

    /// Common tail of a stop request and of reaching a terminal state.
    fn halt(&mut self) {
        self.cx.cancel_all();
        self.entered.clear();
        self.running = false;
        self.cx.paused.store(false, Ordering::Release);
        self.buffer.clear();
        self.behavior.on_stopped(&mut self.cx);
        self.publish();
    }

    fn deliver(&mut self, envelope: Envelope<B::State, B::Event>) {
        if !self.running {
            trace!(machine = B::NAME, event = ?envelope.event, "machine not running, event dropped");
            return;
        }
        if self.is_paused() {
            self.buffer.push_back(envelope);
            return;
        }
        if let Some(stamp) = envelope.stamp {
            if self.entered.get(&stamp.state) != Some(&stamp.activation) {
                trace!(
                    machine = B::NAME,
                    event = ?envelope.event,
                    origin = ?stamp.state,
                    "stale event dropped"
                );
                return;
            }
        }
        if let Err(e) = self.fire(envelope.event) {
            debug!(machine = B::NAME, error = %e, "event ignored");
        }
    }

    fn fire(&mut self, event: B::Event) -> Result<B::State, CoreError> {
        let step = self
            .cx
            .active
            .and_then(|active| self.chart.resolve(active, event))
            .ok_or_else(|| self.rejected(event))?;
        let Step {
            source,
            target,
            exits,
            entries,
        } = step;
        debug!(machine = B::NAME, ?event, from = ?source, to = ?target, "transition");

        for state in exits {
            self.cx.cancel(state);
            self.entered.remove(&state);
            self.behavior.on_exit(state, &mut self.cx);
        }
        self.enter(entries);
        Ok(self.cx.active.unwrap_or(target))
    }

    fn enter(&mut self, entries: Vec<B::State>) {
        self.activation += 1;
        let mut terminal = false;
        for state in entries {
            self.entered.insert(state, self.activation);
            self.cx.active = Some(state);
            self.cx.owner = Some(Stamp {
                state,
                activation: self.activation,
            });
            self.behavior.on_entry(state, &mut self.cx);
            terminal |= self.chart.is_terminal(state);
        }
        self.cx.owner = None;
        if terminal {
            debug!(machine = B::NAME, state = ?self.cx.active, "terminal state reached");
            self.halt();
        } else {
            self.publish();
        }
    }
}
