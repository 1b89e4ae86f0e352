//! ADS gRPC server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::aggregated_discovery_service_server::AggregatedDiscoveryServiceServer;
use tonic::transport::Server;
use tracing::info;

use crate::config::XdsConfig;
use crate::errors::{Error, Result};
use crate::xds::cache::SnapshotCache;
use crate::xds::node_tracker::ConnectionTracker;
use crate::xds::services::AdsService;

/// Serve ADS until `shutdown_signal` resolves.
pub async fn start_xds_server<F>(
    config: &XdsConfig,
    cache: Arc<SnapshotCache>,
    tracker: Arc<ConnectionTracker>,
    shutdown_signal: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config
        .socket_address()
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS address: {}", e)))?;

    info!(address = %addr, "Starting ADS server");

    let ads_service = AdsService::new(cache, tracker);
    let server = Server::builder()
        .add_service(AggregatedDiscoveryServiceServer::new(ads_service))
        .serve_with_shutdown(addr, shutdown_signal);

    info!("ADS server listening on {}", addr);

    server.await.map_err(|e| {
        let error_msg = e.to_string();
        if error_msg.contains("Address already in use") || error_msg.contains("bind") {
            Error::transport(format!(
                "xDS server failed to bind to {}: port {} is already in use",
                addr,
                addr.port()
            ))
        } else {
            Error::transport(format!("xDS server failed: {}", e))
        }
    })?;

    info!("ADS server stopped");
    Ok(())
}
