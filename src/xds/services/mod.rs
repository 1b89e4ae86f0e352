//! gRPC service implementations

pub mod stream;

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::AggregatedDiscoveryService, DeltaDiscoveryRequest,
    DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use tokio_stream::Stream;
use tonic::{Request, Response, Status};
use tracing::{info, warn};

use crate::xds::cache::SnapshotCache;
use crate::xds::node_tracker::ConnectionTracker;

pub use stream::build_response;

/// Aggregated Discovery Service serving label snapshots.
///
/// Each proxy's node id names the label it receives.
#[derive(Debug, Clone)]
pub struct AdsService {
    cache: Arc<SnapshotCache>,
    tracker: Arc<ConnectionTracker>,
}

impl AdsService {
    pub fn new(cache: Arc<SnapshotCache>, tracker: Arc<ConnectionTracker>) -> Self {
        Self { cache, tracker }
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for AdsService {
    type StreamAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DiscoveryResponse, Status>> + Send>>;
    type DeltaAggregatedResourcesStream =
        Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

    async fn stream_aggregated_resources(
        &self,
        request: Request<tonic::Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        info!(remote_addr = ?request.remote_addr(), "New ADS stream connection established");

        let responses = stream::run_stream_loop(
            self.cache.clone(),
            self.tracker.clone(),
            request.into_inner(),
        );
        Ok(Response::new(Box::pin(responses) as Self::StreamAggregatedResourcesStream))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<tonic::Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        warn!("Rejecting delta ADS stream");
        Err(Status::unimplemented("delta xDS is not supported, use state-of-the-world ADS"))
    }
}
