// ── Tag backend ──
//
// The session/transport collaborator seen from the client side.
// Implementations own the wire encoding; everything above this trait
// deals only in node ids, variants, and status codes.

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::sync::broadcast;

use crate::error::Error;
use crate::types::{
    BackendEvent, DataValue, EndpointDescription, MonitoringParameters, MonitoringState, NodeId,
    ServerDescription, ServiceResult, StatusCode, Variant, WriteValue,
};

/// Identity presented when activating a session.
#[derive(Debug, Clone, Default)]
pub enum UserIdentity {
    #[default]
    Anonymous,
    UserName {
        user: String,
        password: SecretString,
    },
}

/// Unified interface to a tag server.
///
/// Every method maps onto one service request. Implementations must not
/// retry internally: callers decide retry cadence.
#[async_trait]
pub trait TagBackend: Send + Sync + 'static {
    /// Discover servers reachable at `url`.
    async fn find_servers(&self, url: &str) -> Result<Vec<ServerDescription>, Error>;

    /// List the endpoints a server offers at its discovery URL.
    async fn request_endpoints(&self, url: &str) -> Result<Vec<EndpointDescription>, Error>;

    /// Open and activate a session on the given endpoint.
    async fn connect_endpoint(
        &self,
        endpoint: &EndpointDescription,
        identity: &UserIdentity,
    ) -> Result<(), Error>;

    /// Close the session. Succeeds if no session is open.
    async fn disconnect(&self) -> Result<(), Error>;

    /// The server's namespace table, indexed by namespace id.
    async fn namespace_array(&self) -> Result<Vec<String>, Error>;

    /// Read the value attribute of one node.
    async fn read(&self, node: &NodeId) -> Result<DataValue, Error>;

    /// Read the value attribute of several nodes in one request.
    async fn read_many(&self, nodes: &[NodeId]) -> Result<ServiceResult<DataValue>, Error>;

    /// Write the value attribute of one node, returning its item status.
    async fn write(&self, node: &NodeId, value: Variant) -> Result<StatusCode, Error>;

    /// Write several nodes in one request.
    async fn write_many(&self, items: &[WriteValue]) -> Result<ServiceResult<StatusCode>, Error>;

    /// Current change-subscription state of a node.
    fn monitoring_state(&self, node: &NodeId) -> MonitoringState;

    /// Request change notification for a node.
    ///
    /// `Ok` only means the request was dispatched. The server may drop it
    /// silently, so callers must confirm via [`monitoring_state`](Self::monitoring_state).
    async fn enable_monitoring(
        &self,
        node: &NodeId,
        params: &MonitoringParameters,
    ) -> Result<(), Error>;

    /// Subscribe to unsolicited backend events.
    fn events(&self) -> broadcast::Receiver<BackendEvent>;
}
