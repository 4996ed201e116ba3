//! Tag protocol surface for cellink.
//!
//! - **[`TagBackend`]**: async trait over the session/transport
//!   collaborator: discovery, session open/close, namespace table,
//!   single and batched reads/writes, and change-notification control.
//!
//! - **Value types** ([`types`]): [`NodeId`], [`Variant`], [`StatusCode`],
//!   discovery descriptors and [`MonitoringParameters`].
//!
//! - **`sim`** (feature `sim`): an in-memory tag server that records
//!   every write in order and can drop or fail requests on demand.

pub mod backend;
pub mod error;
#[cfg(feature = "sim")]
pub mod sim;
pub mod types;

pub use backend::{TagBackend, UserIdentity};
pub use error::Error;
pub use types::{
    BackendEvent, DataValue, EndpointDescription, MonitoringParameters, MonitoringState, NodeId,
    SecurityMode, ServerDescription, ServiceResult, StatusCode, ValueType, Variant, WriteValue,
};

/// Build the `opc.tcp://host:port` discovery URL for a server.
pub fn endpoint_url(host: &str, port: u16) -> Result<url::Url, Error> {
    let mut url = url::Url::parse("opc.tcp://localhost")?;
    url.set_host(Some(host))?;
    url.set_port(Some(port))
        .map_err(|()| Error::Transport(format!("cannot set port {port} on {url}")))?;
    Ok(url)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_formats_host_and_port() {
        let url = endpoint_url("192.168.1.20", 4840).unwrap();
        assert_eq!(url.as_str(), "opc.tcp://192.168.1.20:4840");
    }
}
