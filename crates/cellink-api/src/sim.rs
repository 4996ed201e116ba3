//! In-memory tag server.
//!
//! `SimServer` implements [`TagBackend`] over a plain value table. Tests use
//! it to flip device-side fields, inject per-item failures, silently drop
//! change-notification requests, and assert the exact order of writes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{TagBackend, UserIdentity};
use crate::error::Error;
use crate::types::{
    BackendEvent, DataValue, EndpointDescription, MonitoringParameters, MonitoringState, NodeId,
    SecurityMode, ServerDescription, ServiceResult, StatusCode, Variant, WriteValue,
};

const EVENT_CHANNEL_SIZE: usize = 256;

/// One accepted write, as seen by the server.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub tag: String,
    pub value: Variant,
}

type WriteHook = Arc<dyn Fn(&SimServer, &Variant) + Send + Sync>;

/// Cheaply cloneable handle to a simulated tag server.
#[derive(Clone)]
pub struct SimServer {
    inner: Arc<SimInner>,
}

struct SimInner {
    state: Mutex<SimState>,
    hooks: Mutex<HashMap<String, Vec<WriteHook>>>,
    events: broadcast::Sender<BackendEvent>,
}

struct SimState {
    servers: Option<Vec<ServerDescription>>,
    endpoints: Vec<EndpointDescription>,
    namespaces: Vec<String>,
    app_namespace: u16,
    find_servers_status: Option<StatusCode>,
    read_service_status: Option<StatusCode>,
    connected: bool,
    values: HashMap<String, Variant>,
    monitored: HashSet<String>,
    drop_enables: u32,
    enable_requests: HashMap<String, u32>,
    read_counts: HashMap<String, u32>,
    failing_reads: HashMap<String, StatusCode>,
    failing_writes: HashMap<String, StatusCode>,
    writes: Vec<WriteRecord>,
}

impl SimServer {
    /// A server exposing `application_uri` at namespace index 2 with one
    /// unsecured endpoint.
    pub fn new(application_uri: &str) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let state = SimState {
            servers: None,
            endpoints: vec![EndpointDescription {
                endpoint_url: String::new(),
                security_mode: SecurityMode::None,
                security_policy_uri: "http://opcfoundation.org/UA/SecurityPolicy#None".into(),
            }],
            namespaces: vec![
                "http://opcfoundation.org/UA/".into(),
                "urn:cellink:sim".into(),
                application_uri.into(),
            ],
            app_namespace: 2,
            find_servers_status: None,
            read_service_status: None,
            connected: false,
            values: HashMap::new(),
            monitored: HashSet::new(),
            drop_enables: 0,
            enable_requests: HashMap::new(),
            read_counts: HashMap::new(),
            failing_reads: HashMap::new(),
            failing_writes: HashMap::new(),
            writes: Vec::new(),
        };
        Self {
            inner: Arc::new(SimInner {
                state: Mutex::new(state),
                hooks: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    // ── Discovery setup ─────────────────────────────────────────────

    /// Override the discovery result. An empty list makes discovery find nothing.
    pub fn set_servers(&self, servers: Vec<ServerDescription>) {
        self.inner.state.lock().servers = Some(servers);
    }

    pub fn set_endpoints(&self, endpoints: Vec<EndpointDescription>) {
        self.inner.state.lock().endpoints = endpoints;
    }

    /// Make `find_servers` fail at the service level.
    pub fn fail_find_servers(&self, status: StatusCode) {
        self.inner.state.lock().find_servers_status = Some(status);
    }

    /// Replace the namespace table.
    pub fn set_namespaces(&self, namespaces: Vec<String>) {
        self.inner.state.lock().namespaces = namespaces;
    }

    pub fn namespace_index(&self) -> u16 {
        self.inner.state.lock().app_namespace
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state.lock().connected
    }

    // ── Device-side values ──────────────────────────────────────────

    /// Set a value from the device side, notifying monitors.
    pub fn set_value(&self, tag: &str, value: impl Into<Variant>) {
        let value = value.into();
        let notify = {
            let mut state = self.inner.state.lock();
            state.values.insert(tag.to_owned(), value.clone());
            state.connected && state.monitored.contains(tag)
        };
        if notify {
            self.notify(tag, value);
        }
    }

    /// Seed several values without notifying monitors.
    pub fn seed<'a>(&self, values: impl IntoIterator<Item = (&'a str, Variant)>) {
        let mut state = self.inner.state.lock();
        for (tag, value) in values {
            state.values.insert(tag.to_owned(), value);
        }
    }

    pub fn value(&self, tag: &str) -> Option<Variant> {
        self.inner.state.lock().values.get(tag).cloned()
    }

    /// Register a callback run after every accepted write to `tag`.
    pub fn on_write<F>(&self, tag: &str, hook: F)
    where
        F: Fn(&SimServer, &Variant) + Send + Sync + 'static,
    {
        self.inner
            .hooks
            .lock()
            .entry(tag.to_owned())
            .or_default()
            .push(Arc::new(hook));
    }

    // ── Fault injection ─────────────────────────────────────────────

    pub fn fail_reads(&self, tag: &str, status: StatusCode) {
        self.inner.state.lock().failing_reads.insert(tag.to_owned(), status);
    }

    pub fn fail_writes(&self, tag: &str, status: StatusCode) {
        self.inner.state.lock().failing_writes.insert(tag.to_owned(), status);
    }

    /// Make batched reads fail at the service level.
    pub fn fail_read_service(&self, status: Option<StatusCode>) {
        self.inner.state.lock().read_service_status = status;
    }

    pub fn clear_failures(&self) {
        let mut state = self.inner.state.lock();
        state.failing_reads.clear();
        state.failing_writes.clear();
        state.read_service_status = None;
        state.find_servers_status = None;
    }

    /// Accept the next `count` enable-monitoring requests without acting on them.
    pub fn drop_next_enables(&self, count: u32) {
        self.inner.state.lock().drop_enables = count;
    }

    /// Drop the session as if the network went away.
    pub fn drop_session(&self, reason: &str) {
        {
            let mut state = self.inner.state.lock();
            state.connected = false;
            state.monitored.clear();
        }
        let _ = self.inner.events.send(BackendEvent::SessionLost {
            reason: reason.to_owned(),
        });
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Every accepted write, in arrival order.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.state.lock().writes.clone()
    }

    /// Accepted writes restricted to the given tags, in arrival order.
    pub fn writes_to(&self, tags: &[&str]) -> Vec<WriteRecord> {
        self.inner
            .state
            .lock()
            .writes
            .iter()
            .filter(|w| tags.contains(&w.tag.as_str()))
            .cloned()
            .collect()
    }

    pub fn clear_writes(&self) {
        self.inner.state.lock().writes.clear();
    }

    pub fn enable_requests(&self, tag: &str) -> u32 {
        self.inner
            .state
            .lock()
            .enable_requests
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    pub fn read_count(&self, tag: &str) -> u32 {
        self.inner.state.lock().read_counts.get(tag).copied().unwrap_or(0)
    }

    pub fn is_monitored(&self, tag: &str) -> bool {
        self.inner.state.lock().monitored.contains(tag)
    }

    // ── Internals ───────────────────────────────────────────────────

    fn notify(&self, tag: &str, value: Variant) {
        let node = NodeId::new(self.namespace_index(), tag);
        let _ = self.inner.events.send(BackendEvent::DataChange { node, value });
    }

    fn read_one(state: &mut SimState, node: &NodeId) -> DataValue {
        if node.namespace != state.app_namespace {
            return DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN);
        }
        *state.read_counts.entry(node.identifier.clone()).or_insert(0) += 1;
        if let Some(status) = state.failing_reads.get(&node.identifier) {
            return DataValue::bad(*status);
        }
        state
            .values
            .get(&node.identifier)
            .map_or_else(|| DataValue::bad(StatusCode::BAD_NODE_ID_UNKNOWN), |v| DataValue::good(v.clone()))
    }

    fn write_one(state: &mut SimState, node: &NodeId, value: &Variant) -> StatusCode {
        if node.namespace != state.app_namespace {
            return StatusCode::BAD_NODE_ID_UNKNOWN;
        }
        if let Some(status) = state.failing_writes.get(&node.identifier) {
            return *status;
        }
        if let Some(existing) = state.values.get(&node.identifier) {
            let known = existing.value_type();
            if known.is_some() && known != value.value_type() {
                return StatusCode::BAD_TYPE_MISMATCH;
            }
        }
        state.values.insert(node.identifier.clone(), value.clone());
        state.writes.push(WriteRecord {
            tag: node.identifier.clone(),
            value: value.clone(),
        });
        StatusCode::GOOD
    }

    /// Notify monitors and run hooks for accepted writes, outside the state lock.
    fn after_writes(&self, accepted: Vec<(String, Variant)>) {
        for (tag, value) in accepted {
            let monitored = {
                let state = self.inner.state.lock();
                state.connected && state.monitored.contains(&tag)
            };
            if monitored {
                self.notify(&tag, value.clone());
            }
            let hooks = self.inner.hooks.lock().get(&tag).cloned().unwrap_or_default();
            for hook in hooks {
                hook(self, &value);
            }
        }
    }

    fn require_connected(state: &SimState) -> Result<(), Error> {
        if state.connected { Ok(()) } else { Err(Error::NotConnected) }
    }
}

#[async_trait]
impl TagBackend for SimServer {
    async fn find_servers(&self, url: &str) -> Result<Vec<ServerDescription>, Error> {
        let state = self.inner.state.lock();
        if let Some(status) = state.find_servers_status {
            return Err(Error::Status {
                operation: "Find server",
                status,
            });
        }
        Ok(state.servers.clone().unwrap_or_else(|| {
            vec![ServerDescription {
                application_uri: "urn:cellink:sim".into(),
                discovery_urls: vec![url.to_owned()],
            }]
        }))
    }

    async fn request_endpoints(&self, url: &str) -> Result<Vec<EndpointDescription>, Error> {
        let state = self.inner.state.lock();
        Ok(state
            .endpoints
            .iter()
            .cloned()
            .map(|mut ep| {
                if ep.endpoint_url.is_empty() {
                    url.clone_into(&mut ep.endpoint_url);
                }
                ep
            })
            .collect())
    }

    async fn connect_endpoint(
        &self,
        endpoint: &EndpointDescription,
        identity: &UserIdentity,
    ) -> Result<(), Error> {
        debug!(endpoint = %endpoint.endpoint_url, anonymous = matches!(identity, UserIdentity::Anonymous), "sim session opened");
        self.inner.state.lock().connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        state.connected = false;
        state.monitored.clear();
        Ok(())
    }

    async fn namespace_array(&self) -> Result<Vec<String>, Error> {
        let state = self.inner.state.lock();
        Self::require_connected(&state)?;
        Ok(state.namespaces.clone())
    }

    async fn read(&self, node: &NodeId) -> Result<DataValue, Error> {
        let mut state = self.inner.state.lock();
        Self::require_connected(&state)?;
        Ok(Self::read_one(&mut state, node))
    }

    async fn read_many(&self, nodes: &[NodeId]) -> Result<ServiceResult<DataValue>, Error> {
        let mut state = self.inner.state.lock();
        Self::require_connected(&state)?;
        if let Some(status) = state.read_service_status {
            return Ok(ServiceResult {
                status,
                results: Vec::new(),
            });
        }
        let results = nodes.iter().map(|n| Self::read_one(&mut state, n)).collect();
        Ok(ServiceResult {
            status: StatusCode::GOOD,
            results,
        })
    }

    async fn write(&self, node: &NodeId, value: Variant) -> Result<StatusCode, Error> {
        let status = {
            let mut state = self.inner.state.lock();
            Self::require_connected(&state)?;
            Self::write_one(&mut state, node, &value)
        };
        if status.is_good() {
            self.after_writes(vec![(node.identifier.clone(), value)]);
        }
        Ok(status)
    }

    async fn write_many(&self, items: &[WriteValue]) -> Result<ServiceResult<StatusCode>, Error> {
        let mut accepted = Vec::new();
        let results = {
            let mut state = self.inner.state.lock();
            Self::require_connected(&state)?;
            items
                .iter()
                .map(|item| {
                    let status = Self::write_one(&mut state, &item.node, &item.value);
                    if status.is_good() {
                        accepted.push((item.node.identifier.clone(), item.value.clone()));
                    }
                    status
                })
                .collect()
        };
        self.after_writes(accepted);
        Ok(ServiceResult {
            status: StatusCode::GOOD,
            results,
        })
    }

    fn monitoring_state(&self, node: &NodeId) -> MonitoringState {
        let state = self.inner.state.lock();
        if state.connected && state.monitored.contains(&node.identifier) {
            MonitoringState::Active
        } else {
            MonitoringState::Inactive
        }
    }

    async fn enable_monitoring(
        &self,
        node: &NodeId,
        _params: &MonitoringParameters,
    ) -> Result<(), Error> {
        let mut state = self.inner.state.lock();
        Self::require_connected(&state)?;
        *state.enable_requests.entry(node.identifier.clone()).or_insert(0) += 1;
        if state.drop_enables > 0 {
            state.drop_enables -= 1;
            return Ok(());
        }
        state.monitored.insert(node.identifier.clone());
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<BackendEvent> {
        self.inner.events.subscribe()
    }
}
