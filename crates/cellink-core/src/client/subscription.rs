// ── Subscription reliability loop ──
//
// Enable-monitoring requests are fire-and-forget and a server may drop
// them without telling us. Every registered tag therefore stays
// "unconfirmed" until its subscription is live AND a baseline read has
// come back. A fixed tick re-examines unconfirmed tags until none are
// left, then stops; registering a new tag restarts it.
//
// The tick never backs off and never gives up: the remote device sees
// a constant, predictable request rate.

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

use cellink_api::{MonitoringParameters, MonitoringState, NodeId, TagBackend, Variant};

use super::Internal;

#[derive(Debug, Clone, Copy, Default)]
struct EntryState {
    confirmed: bool,
    in_flight: bool,
}

/// Outcome of one reconciliation attempt for a tag.
#[derive(Debug)]
pub(crate) struct Report {
    pub session: Uuid,
    pub tag: String,
    /// Baseline value when the entry is confirmed, `None` to retry next tick.
    pub baseline: Option<Variant>,
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Registered tags and the tick that drives them to confirmation.
pub(crate) struct Subscriptions {
    entries: IndexMap<String, EntryState>,
    ticker: Option<Ticker>,
    tick: Duration,
}

impl Subscriptions {
    pub fn new(tick: Duration) -> Self {
        Self {
            entries: IndexMap::new(),
            ticker: None,
            tick,
        }
    }

    /// Add a tag. Returns `false` if it was already registered.
    pub fn register(&mut self, tag: &str) -> bool {
        if self.entries.contains_key(tag) {
            return false;
        }
        self.entries.insert(tag.to_owned(), EntryState::default());
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.stop();
    }

    pub fn is_settled(&self) -> bool {
        self.entries.values().all(|e| e.confirmed)
    }

    pub fn is_ticking(&self) -> bool {
        self.ticker.is_some()
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Forget all confirmations, e.g. after the session went away.
    pub fn reset(&mut self) {
        self.stop();
        for entry in self.entries.values_mut() {
            *entry = EntryState::default();
        }
    }

    /// Start the tick if anything is unconfirmed and it is not running yet.
    pub fn ensure_ticking(&mut self, tx: &mpsc::UnboundedSender<Internal>) {
        if self.ticker.is_some() || self.is_settled() {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(tick_task(self.tick, tx.clone(), cancel.clone()));
        self.ticker = Some(Ticker { cancel, handle });
        debug!(pending = self.pending_count(), "subscription loop started");
    }

    pub fn stop(&mut self) {
        if let Some(ticker) = self.ticker.take() {
            ticker.cancel.cancel();
            ticker.handle.abort();
            debug!("subscription loop stopped");
        }
    }

    /// Tags to examine on this tick. Each is marked in flight until its report arrives.
    pub fn due(&mut self) -> Vec<String> {
        self.entries
            .iter_mut()
            .filter(|(_, e)| !e.confirmed && !e.in_flight)
            .map(|(tag, e)| {
                e.in_flight = true;
                tag.clone()
            })
            .collect()
    }

    /// Apply a report. Returns `true` if the entry became confirmed.
    pub fn apply(&mut self, tag: &str, confirmed: bool) -> bool {
        let Some(entry) = self.entries.get_mut(tag) else {
            return false;
        };
        entry.in_flight = false;
        if confirmed && !entry.confirmed {
            entry.confirmed = true;
            return true;
        }
        false
    }

    fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| !e.confirmed).count()
    }
}

impl Drop for Subscriptions {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn tick_task(period: Duration, tx: mpsc::UnboundedSender<Internal>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                if tx.send(Internal::Tick).is_err() {
                    break;
                }
            }
        }
    }
}

/// Drive one tag one step towards confirmation.
///
/// Inactive: dispatch an enable request, then read the baseline only if
/// the subscription came up. Active but unconfirmed: read the baseline.
pub(crate) async fn reconcile(
    backend: Arc<dyn TagBackend>,
    node: NodeId,
    params: MonitoringParameters,
    timeout: Duration,
) -> Option<Variant> {
    let attempt = async {
        if backend.monitoring_state(&node) == MonitoringState::Inactive {
            if let Err(e) = backend.enable_monitoring(&node, &params).await {
                debug!(node = %node, error = %e, "enable monitoring request failed");
                return None;
            }
            if backend.monitoring_state(&node) == MonitoringState::Inactive {
                trace!(node = %node, "monitoring not active yet");
                return None;
            }
        }
        match backend.read(&node).await {
            Ok(dv) if dv.status.is_good() => Some(dv.value),
            Ok(dv) => {
                debug!(node = %node, status = %dv.status, "baseline read returned bad status");
                None
            }
            Err(e) => {
                debug!(node = %node, error = %e, "baseline read failed");
                None
            }
        }
    };
    tokio::time::timeout(timeout, attempt).await.ok().flatten()
}
