// ── Transport client ──
//
// Actor that owns the backend session, the node cache, and the
// subscription table. Handles are cheap clones that post requests over
// an mpsc channel and get an `AsyncOperation` back. Backend I/O runs in
// spawned tasks that report to the actor, so the actor loop never waits
// on the network.

mod subscription;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use strum::{Display, FromRepr};
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cellink_api::{
    BackendEvent, EndpointDescription, NodeId, TagBackend, ValueType, Variant, WriteValue,
};

use crate::config::ClientConfig;
use crate::error::CoreError;
use crate::operation::{self, AsyncOperation, Completer};

use self::subscription::{Report, Subscriptions};

const CHANGE_CHANNEL_SIZE: usize = 256;

// ── Public types ────────────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, FromRepr, Serialize)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A value change on a watched tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagChange {
    pub tag: String,
    pub value: Variant,
}

/// One item of a typed write.
#[derive(Debug, Clone, PartialEq)]
pub struct TagWrite {
    pub tag: String,
    pub value_type: ValueType,
    pub value: Variant,
}

impl TagWrite {
    pub fn new(tag: impl Into<String>, value_type: ValueType, value: impl Into<Variant>) -> Self {
        Self {
            tag: tag.into(),
            value_type,
            value: value.into(),
        }
    }

    /// A `UInt16` write, the type of every status and command field.
    pub fn u16(tag: impl Into<String>, value: impl Into<u16>) -> Self {
        Self::new(tag, ValueType::UInt16, value.into())
    }
}

/// Change stream for one tag.
pub struct TagWatch {
    tag: String,
    rx: broadcast::Receiver<TagChange>,
    latest: Arc<DashMap<String, Variant>>,
}

impl TagWatch {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Last value seen for the tag, if any.
    pub fn current(&self) -> Option<Variant> {
        self.latest.get(&self.tag).map(|v| v.clone())
    }

    /// Wait for the next change. `None` once the client is gone.
    pub async fn changed(&mut self) -> Option<Variant> {
        loop {
            match self.rx.recv().await {
                Ok(change) if change.tag == self.tag => return Some(change.value),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

// ── Messages ────────────────────────────────────────────────────────

enum Request {
    Connect {
        host: String,
        port: u16,
        reply: Completer<()>,
    },
    Disconnect {
        reply: Completer<()>,
    },
    Read {
        tag: String,
        reply: Completer<Variant>,
    },
    ReadMany {
        tags: Vec<String>,
        reply: Completer<IndexMap<String, Variant>>,
    },
    Write {
        write: TagWrite,
        reply: Completer<()>,
    },
    WriteMany {
        writes: Vec<TagWrite>,
        reply: Completer<()>,
    },
    Watch {
        tag: String,
    },
    ClearWatches,
}

pub(crate) enum Internal {
    ConnectFinished {
        attempt: u64,
        outcome: Result<Session, CoreError>,
        reply: Completer<()>,
    },
    DisconnectFinished {
        reply: Completer<()>,
    },
    Tick,
    Subscription(Report),
}

#[derive(Debug, Clone)]
pub(crate) struct Session {
    id: Uuid,
    namespace: u16,
    endpoint: String,
}

// ── TransportClient ─────────────────────────────────────────────────

/// Handle to a tag client actor.
///
/// Cheaply cloneable. Every operation is non-blocking and returns an
/// [`AsyncOperation`]; the actor runs on whichever runtime it was spawned on.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    requests: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<ConnectionState>,
    changes: broadcast::Sender<TagChange>,
    latest: Arc<DashMap<String, Variant>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl TransportClient {
    /// Spawn a client actor on the current runtime.
    pub fn spawn(backend: Arc<dyn TagBackend>, config: ClientConfig) -> Self {
        Self::spawn_on(&Handle::current(), backend, config)
    }

    /// Spawn a client actor on the given runtime.
    pub fn spawn_on(runtime: &Handle, backend: Arc<dyn TagBackend>, config: ClientConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_SIZE);
        let latest = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let actor = ClientActor {
            subscriptions: Subscriptions::new(config.monitoring.tick),
            backend,
            config,
            state: state_tx,
            changes: changes.clone(),
            latest: latest.clone(),
            internal_tx,
            session: None,
            nodes: HashMap::new(),
            attempt: 0,
        };
        let task = runtime.spawn(actor.run(requests_rx, internal_rx, cancel.clone()));

        Self {
            inner: Arc::new(ClientInner {
                requests: requests_tx,
                state: state_rx,
                changes,
                latest,
                cancel,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Run the connect sequence against `host:port`.
    ///
    /// Discover servers, request endpoints, open a session on the first
    /// viable endpoint, then resolve the application namespace. Aborts on
    /// the first failure, no internal retry. Succeeds at once when already
    /// connected.
    pub fn connect(&self, host: &str, port: u16) -> AsyncOperation<()> {
        self.request(|reply| Request::Connect {
            host: host.to_owned(),
            port,
            reply,
        })
    }

    /// Close the session. Succeeds at once when already disconnected.
    pub fn disconnect(&self) -> AsyncOperation<()> {
        self.request(|reply| Request::Disconnect { reply })
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Observe connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.clone()
    }

    // ── Reads & writes ──────────────────────────────────────────────

    pub fn read_tag(&self, tag: &str) -> AsyncOperation<Variant> {
        self.request(|reply| Request::Read {
            tag: tag.to_owned(),
            reply,
        })
    }

    /// Read several tags in one request. All items must be good.
    pub fn read_tags<S: AsRef<str>>(&self, tags: &[S]) -> AsyncOperation<IndexMap<String, Variant>> {
        let tags = tags.iter().map(|t| t.as_ref().to_owned()).collect();
        self.request(|reply| Request::ReadMany { tags, reply })
    }

    pub fn write_tag(
        &self,
        tag: &str,
        value: impl Into<Variant>,
        value_type: ValueType,
    ) -> AsyncOperation<()> {
        let write = TagWrite::new(tag, value_type, value);
        self.request(|reply| Request::Write { write, reply })
    }

    /// Write several tags in one request, in the given order.
    pub fn write_tags(&self, writes: Vec<TagWrite>) -> AsyncOperation<()> {
        self.request(|reply| Request::WriteMany { writes, reply })
    }

    /// Read a `u16` status or command field.
    pub async fn read_u16(&self, tag: &str) -> Result<u16, CoreError> {
        let value = self.read_tag(tag).await?;
        value.as_u16().ok_or_else(|| {
            CoreError::validation(tag, "Read value attribute: value type is not right!")
        })
    }

    // ── Change notification ─────────────────────────────────────────

    /// Register `tag` for change notification and return its change stream.
    ///
    /// The subscription loop keeps re-enabling the tag until the server
    /// confirms it, and again after every reconnect.
    pub fn watch(&self, tag: &str) -> TagWatch {
        let rx = self.inner.changes.subscribe();
        let _ = self.inner.requests.send(Request::Watch {
            tag: tag.to_owned(),
        });
        TagWatch {
            tag: tag.to_owned(),
            rx,
            latest: self.inner.latest.clone(),
        }
    }

    /// Register `tag` for change notification without taking a stream.
    ///
    /// Changes still reach [`changes`](Self::changes) and [`latest`](Self::latest).
    pub fn monitor(&self, tag: &str) {
        let _ = self.inner.requests.send(Request::Watch {
            tag: tag.to_owned(),
        });
    }

    /// Forget every registered tag.
    pub fn clear_watches(&self) {
        let _ = self.inner.requests.send(Request::ClearWatches);
    }

    /// Changes of every watched tag.
    pub fn changes(&self) -> broadcast::Receiver<TagChange> {
        self.inner.changes.subscribe()
    }

    /// Last value seen for a watched tag.
    pub fn latest(&self, tag: &str) -> Option<Variant> {
        self.inner.latest.get(tag).map(|v| v.clone())
    }

    /// Stop the actor. Outstanding operations resolve as abandoned.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn request<T>(&self, build: impl FnOnce(Completer<T>) -> Request) -> AsyncOperation<T> {
        let (reply, op) = operation::pending();
        // A closed channel drops the completer, which resolves the operation as abandoned.
        let _ = self.inner.requests.send(build(reply));
        op
    }
}

// ── Actor ───────────────────────────────────────────────────────────

struct ClientActor {
    backend: Arc<dyn TagBackend>,
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    changes: broadcast::Sender<TagChange>,
    latest: Arc<DashMap<String, Variant>>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    session: Option<Session>,
    nodes: HashMap<String, NodeId>,
    subscriptions: Subscriptions,
    /// Bumped by every connect and disconnect so late connect results can be discarded.
    attempt: u64,
}

impl ClientActor {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        cancel: CancellationToken,
    ) {
        let mut events = self.backend.events();
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(msg) = internal.recv() => self.handle_internal(msg),
                event = events.recv(), if events_open => match event {
                    Ok(event) => self.handle_backend_event(event),
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "backend event stream lagged"),
                    Err(RecvError::Closed) => events_open = false,
                },
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    self.handle_request(request);
                }
            }
        }

        self.subscriptions.stop();
        debug!("client actor stopped");
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                debug!(from = %current, to = %next, "connection state changed");
                *current = next;
                true
            }
        });
    }

    fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Node for a tag in the current session, `None` when not connected.
    fn resolve(&mut self, tag: &str) -> Option<NodeId> {
        let namespace = self.session.as_ref()?.namespace;
        Some(
            self.nodes
                .entry(tag.to_owned())
                .or_insert_with(|| NodeId::new(namespace, tag))
                .clone(),
        )
    }

    fn publish(&self, tag: &str, value: Variant) {
        self.latest.insert(tag.to_owned(), value.clone());
        let _ = self.changes.send(TagChange {
            tag: tag.to_owned(),
            value,
        });
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.nodes.clear();
        self.subscriptions.reset();
    }

    // ── Requests ────────────────────────────────────────────────────

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { host, port, reply } => self.start_connect(host, port, reply),
            Request::Disconnect { reply } => self.start_disconnect(reply),
            Request::Read { tag, reply } => self.read(tag, reply),
            Request::ReadMany { tags, reply } => self.read_many(tags, reply),
            Request::Write { write, reply } => self.write(write, reply),
            Request::WriteMany { writes, reply } => self.write_many(writes, reply),
            Request::Watch { tag } => {
                if self.subscriptions.register(&tag) {
                    debug!(tag = %tag, "tag registered for monitoring");
                    if self.session.is_some() {
                        self.subscriptions.ensure_ticking(&self.internal_tx);
                    }
                }
            }
            Request::ClearWatches => self.subscriptions.clear(),
        }
    }

    fn start_connect(&mut self, host: String, port: u16, reply: Completer<()>) {
        match self.current_state() {
            ConnectionState::Connected => reply.succeed(()),
            state @ (ConnectionState::Connecting | ConnectionState::Disconnecting) => {
                reply.fail(CoreError::Connection {
                    endpoint: format!("{host}:{port}"),
                    reason: format!("connection is {state}"),
                });
            }
            ConnectionState::Disconnected => {
                self.attempt += 1;
                self.set_state(ConnectionState::Connecting);
                let attempt = self.attempt;
                let backend = self.backend.clone();
                let config = self.config.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let outcome = connect_sequence(backend.as_ref(), &config, &host, port).await;
                    let _ = tx.send(Internal::ConnectFinished {
                        attempt,
                        outcome,
                        reply,
                    });
                });
            }
        }
    }

    fn start_disconnect(&mut self, reply: Completer<()>) {
        if self.current_state() == ConnectionState::Disconnected {
            reply.succeed(());
            return;
        }
        self.attempt += 1;
        self.set_state(ConnectionState::Disconnecting);
        self.drop_session();
        let backend = self.backend.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.disconnect().await {
                warn!(error = %e, "backend disconnect failed");
            }
            let _ = tx.send(Internal::DisconnectFinished { reply });
        });
    }

    fn read(&mut self, tag: String, reply: Completer<Variant>) {
        let Some(node) = self.resolve(&tag) else {
            reply.fail(CoreError::read(tag, "Read node: node is null!"));
            return;
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let outcome = match backend.read(&node).await {
                Ok(dv) if dv.status.is_good() => Ok(dv.value),
                Ok(dv) => Err(CoreError::read(
                    tag,
                    format!("Failed to read attribute: {}", dv.status),
                )),
                Err(e) => Err(CoreError::read(tag, format!("Dispatch read attribute fail! {e}"))),
            };
            reply.complete(outcome);
        });
    }

    fn read_many(&mut self, tags: Vec<String>, reply: Completer<IndexMap<String, Variant>>) {
        if tags.is_empty() {
            reply.fail(CoreError::read(
                "",
                "Fail to read nodes attributes : key names is empty!",
            ));
            return;
        }
        let mut nodes = Vec::with_capacity(tags.len());
        for tag in &tags {
            let Some(node) = self.resolve(tag) else {
                reply.fail(CoreError::read(tag.clone(), "Read node: node is null!"));
                return;
            };
            nodes.push(node);
        }
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let outcome = match backend.read_many(&nodes).await {
                Ok(result) => operation::collect_read(&tags, result),
                Err(e) => Err(CoreError::read(
                    tags.join(","),
                    format!("Fail to read nodes attributes (read service):{e}"),
                )),
            };
            reply.complete(outcome);
        });
    }

    fn typed(&mut self, write: &TagWrite) -> Result<WriteValue, CoreError> {
        let node = self
            .resolve(&write.tag)
            .ok_or_else(|| CoreError::write(write.tag.clone(), "Write node: node is null!"))?;
        let value = write.value.coerce(write.value_type).ok_or_else(|| {
            CoreError::validation(
                write.tag.clone(),
                format!("{} cannot be written as {}", write.value, write.value_type),
            )
        })?;
        Ok(WriteValue { node, value })
    }

    fn write(&mut self, write: TagWrite, reply: Completer<()>) {
        let item = match self.typed(&write) {
            Ok(item) => item,
            Err(e) => {
                reply.fail(e);
                return;
            }
        };
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let outcome = match backend.write(&item.node, item.value).await {
                Ok(status) if status.is_good() => Ok(()),
                Ok(status) => Err(CoreError::write(
                    write.tag,
                    format!("Failed to write attribute: {status}"),
                )),
                Err(e) => Err(CoreError::write(
                    write.tag,
                    format!("Dispatch write attribute fail! {e}"),
                )),
            };
            reply.complete(outcome);
        });
    }

    fn write_many(&mut self, writes: Vec<TagWrite>, reply: Completer<()>) {
        if writes.is_empty() {
            reply.fail(CoreError::write(
                "",
                "Write nodes attributes: items to write is empty!",
            ));
            return;
        }
        let mut items = Vec::with_capacity(writes.len());
        for write in &writes {
            match self.typed(write) {
                Ok(item) => items.push(item),
                Err(e) => {
                    reply.fail(e);
                    return;
                }
            }
        }
        let names: Vec<String> = writes.into_iter().map(|w| w.tag).collect();
        let backend = self.backend.clone();
        tokio::spawn(async move {
            let outcome = match backend.write_many(&items).await {
                Ok(result) => operation::check_write(&names, &result),
                Err(e) => Err(CoreError::write(
                    names.join(","),
                    format!("Dispatch write attributes fail! {e}"),
                )),
            };
            reply.complete(outcome);
        });
    }

    // ── Internal messages ───────────────────────────────────────────

    fn handle_internal(&mut self, msg: Internal) {
        match msg {
            Internal::ConnectFinished {
                attempt,
                outcome,
                reply,
            } => self.finish_connect(attempt, outcome, reply),
            Internal::DisconnectFinished { reply } => {
                self.set_state(ConnectionState::Disconnected);
                info!("disconnected");
                reply.succeed(());
            }
            Internal::Tick => self.reconcile_subscriptions(),
            Internal::Subscription(report) => self.apply_report(report),
        }
    }

    fn finish_connect(
        &mut self,
        attempt: u64,
        outcome: Result<Session, CoreError>,
        reply: Completer<()>,
    ) {
        if attempt != self.attempt {
            if outcome.is_ok() {
                let backend = self.backend.clone();
                tokio::spawn(async move {
                    let _ = backend.disconnect().await;
                });
            }
            reply.fail(CoreError::Internal("connect superseded by disconnect".into()));
            return;
        }
        match outcome {
            Ok(session) => {
                info!(
                    session = %session.id,
                    endpoint = %session.endpoint,
                    namespace = session.namespace,
                    "connected"
                );
                self.nodes.clear();
                self.session = Some(session);
                self.set_state(ConnectionState::Connected);
                self.subscriptions.reset();
                self.subscriptions.ensure_ticking(&self.internal_tx);
                reply.succeed(());
            }
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.set_state(ConnectionState::Disconnected);
                reply.fail(e);
            }
        }
    }

    fn reconcile_subscriptions(&mut self) {
        let Some(session) = self.session.as_ref().map(|s| s.id) else {
            self.subscriptions.stop();
            return;
        };
        let params = self.config.monitoring.parameters();
        let timeout = self.config.request_timeout;
        for tag in self.subscriptions.due() {
            let Some(node) = self.resolve(&tag) else {
                continue;
            };
            let backend = self.backend.clone();
            let params = params.clone();
            let tx = self.internal_tx.clone();
            tokio::spawn(async move {
                let baseline = subscription::reconcile(backend, node, params, timeout).await;
                let _ = tx.send(Internal::Subscription(Report {
                    session,
                    tag,
                    baseline,
                }));
            });
        }
    }

    fn apply_report(&mut self, report: Report) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.id != report.session {
            return;
        }
        let endpoint = session.endpoint.clone();
        let confirmed = report.baseline.is_some();
        if self.subscriptions.apply(&report.tag, confirmed) {
            debug!(tag = %report.tag, "subscription confirmed");
            if let Some(value) = report.baseline {
                self.publish(&report.tag, value);
            }
        }
        if self.subscriptions.is_ticking() && self.subscriptions.is_settled() {
            self.subscriptions.stop();
            info!("monitoring enabled");
            for tag in self.subscriptions.tags() {
                info!("{endpoint} : {tag}");
            }
        }
    }

    // ── Backend events ──────────────────────────────────────────────

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::DataChange { node, value } => {
                let Some(session) = self.session.as_ref() else {
                    return;
                };
                if node.namespace == session.namespace {
                    self.publish(&node.identifier, value);
                }
            }
            BackendEvent::SessionLost { reason } => {
                if self.session.is_some() {
                    warn!(reason = %reason, "session lost");
                    self.attempt += 1;
                    self.drop_session();
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }
}

// ── Connect sequence ────────────────────────────────────────────────

async fn connect_sequence(
    backend: &dyn TagBackend,
    config: &ClientConfig,
    host: &str,
    port: u16,
) -> Result<Session, CoreError> {
    let url = cellink_api::endpoint_url(host, port).map_err(|e| CoreError::Connection {
        endpoint: format!("{host}:{port}"),
        reason: e.to_string(),
    })?;
    let endpoint = url.to_string();
    let fail = |reason: String| CoreError::Connection {
        endpoint: endpoint.clone(),
        reason,
    };

    let servers = backend
        .find_servers(&endpoint)
        .await
        .map_err(|e| fail(format!("Find server fail! {e}")))?;
    let server = servers
        .first()
        .ok_or_else(|| fail("Cannot find server!".into()))?;
    let discovery_url = server
        .discovery_urls
        .first()
        .ok_or_else(|| fail("Cannot find server url!".into()))?;

    let endpoints = backend
        .request_endpoints(discovery_url)
        .await
        .map_err(|e| fail(format!("Find end points fail! {e}")))?;
    let chosen = endpoints
        .into_iter()
        .find(EndpointDescription::is_viable)
        .ok_or_else(|| fail("Cannot find vaild end point!".into()))?;

    backend
        .connect_endpoint(&chosen, &config.identity)
        .await
        .map_err(|e| fail(format!("Open session fail! {e}")))?;

    match resolve_namespace(backend, &config.application_uri).await {
        Ok(namespace) => Ok(Session {
            id: Uuid::new_v4(),
            namespace,
            endpoint: chosen.endpoint_url,
        }),
        Err(reason) => {
            if let Err(e) = backend.disconnect().await {
                debug!(error = %e, "disconnect after namespace failure");
            }
            Err(fail(reason))
        }
    }
}

async fn resolve_namespace(backend: &dyn TagBackend, uri: &str) -> Result<u16, String> {
    let namespaces = backend
        .namespace_array()
        .await
        .map_err(|e| format!("Dispatch update namespace array fail! {e}"))?;
    let index = namespaces
        .iter()
        .position(|ns| ns == uri)
        .ok_or_else(|| "Cannot find namespace!".to_owned())?;
    u16::try_from(index).map_err(|_| format!("namespace index {index} out of range"))
}
