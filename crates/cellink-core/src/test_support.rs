#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use cellink_api::sim::SimServer;

use crate::client::TransportClient;
use crate::config::ClientConfig;

/// A simulated server and a client already connected to it.
pub(crate) async fn connected() -> (SimServer, TransportClient) {
    let config = ClientConfig::default();
    let sim = SimServer::new(&config.application_uri);
    let client = TransportClient::spawn(Arc::new(sim.clone()), config);
    client.connect("127.0.0.1", 4840).await.unwrap();
    (sim, client)
}
