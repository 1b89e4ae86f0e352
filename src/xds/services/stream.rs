//! State-of-the-world ADS stream loop
//!
//! One loop per proxy connection. The node id of the first request picks
//! the label whose snapshot the stream serves. The loop answers requests
//! from the snapshot cache, skips ACKs, logs NACKs and pushes a fresh
//! response for every subscribed type whenever the label is republished.
//!
//! # Protocol Flow
//!
//! 1. **Initial Request**: Envoy sends a DiscoveryRequest with empty version
//! 2. **Response**: Server sends the label's resources with version and nonce
//! 3. **ACK/NACK**: Envoy echoes the nonce
//!    - ACK: same version and nonce, no error_detail (skipped)
//!    - NACK: error_detail present (logged, nothing resent)
//! 4. **Push Updates**: a publish for the label pushes every subscribed type

use std::collections::HashMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use crate::errors::Result;
use crate::observability::metrics;
use crate::xds::cache::SnapshotCache;
use crate::xds::node_tracker::ConnectionTracker;
use crate::xds::resources::ResourceType;
use crate::xds_span;

/// Tracks the last sent version and nonce for ACK/NACK detection
#[derive(Clone, Debug)]
struct LastDiscoverySnapshot {
    version: Arc<str>,
    nonce: Arc<str>,
}

#[derive(Debug, Default)]
struct StreamState {
    label: Option<String>,
    last_sent: HashMap<String, LastDiscoverySnapshot>,
    /// Type URL to the resource names last requested for it
    subscriptions: HashMap<String, Vec<String>>,
}

type ResponseSender = mpsc::Sender<std::result::Result<DiscoveryResponse, Status>>;

/// Run the ADS loop for one connection.
///
/// Returns the stream of responses to hand back to tonic.
pub fn run_stream_loop<S>(
    cache: Arc<SnapshotCache>,
    tracker: Arc<ConnectionTracker>,
    mut in_stream: S,
) -> ReceiverStream<std::result::Result<DiscoveryResponse, Status>>
where
    S: Stream<Item = std::result::Result<DiscoveryRequest, Status>> + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(100);
    let mut update_rx = cache.subscribe();

    tokio::spawn(async move {
        metrics::record_xds_connection(true);
        let mut state = StreamState::default();

        loop {
            tokio::select! {
                request = in_stream.next() => {
                    match request {
                        Some(Ok(request)) => {
                            if !handle_request(&cache, &tracker, &mut state, request, &tx).await {
                                break;
                            }
                        }
                        Some(Err(status)) => {
                            warn!(label = ?state.label, error = %status, "Error receiving discovery request");
                            let _ = tx.send(Err(status)).await;
                            break;
                        }
                        None => {
                            info!(label = ?state.label, "ADS stream ended by client");
                            break;
                        }
                    }
                }
                update = update_rx.recv() => {
                    match update {
                        Ok(update) => {
                            if state.label.as_deref() != Some(update.label.as_str()) {
                                continue;
                            }
                            let types: Vec<String> = update
                                .types
                                .iter()
                                .map(|ty| ty.type_url().to_string())
                                .filter(|url| state.subscriptions.contains_key(url))
                                .collect();
                            if !push(&cache, &mut state, &types, &tx).await {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(label = ?state.label, skipped, "Missed snapshot notifications, resending subscriptions");
                            let types: Vec<String> = state.subscriptions.keys().cloned().collect();
                            if !push(&cache, &mut state, &types, &tx).await {
                                break;
                            }
                        }
                        Err(RecvError::Closed) => {
                            warn!(label = ?state.label, "Snapshot notification channel closed");
                            break;
                        }
                    }
                }
            }
        }

        metrics::record_xds_connection(false);
        debug!(label = ?state.label, "ADS stream loop exited");
    });

    ReceiverStream::new(rx)
}

/// Handle one request; `false` ends the stream.
async fn handle_request(
    cache: &SnapshotCache,
    tracker: &ConnectionTracker,
    state: &mut StreamState,
    request: DiscoveryRequest,
    tx: &ResponseSender,
) -> bool {
    let node_id = request.node.as_ref().map(|n| n.id.clone()).unwrap_or_default();
    let label = match &state.label {
        Some(label) => label.clone(),
        None => {
            if node_id.is_empty() {
                let _ = tx.send(Err(Status::invalid_argument("node id is required"))).await;
                return false;
            }
            if tracker.is_new_identity(&node_id) {
                info!(node_id = %node_id, "New proxy node connected");
            } else {
                debug!(node_id = %node_id, "Known proxy node reconnected");
            }
            state.label = Some(node_id.clone());
            node_id.clone()
        }
    };

    let span = xds_span!("discovery_request", label, type_url = %request.type_url);
    async move {
        if let Err(e) = ResourceType::from_type_url(&request.type_url) {
            warn!(error = %e, "Rejecting request for unknown resource type");
            let _ = tx.send(Err(Status::invalid_argument(e.to_string()))).await;
            return false;
        }

        state.subscriptions.insert(request.type_url.clone(), request.resource_names.clone());

        if let Some(error_detail) = request.error_detail.as_ref() {
            warn!(
                nonce = %request.response_nonce,
                error_code = error_detail.code,
                error_message = %error_detail.message,
                "[NACK] Envoy rejected previous response"
            );
            return true;
        }

        if !request.response_nonce.is_empty() {
            let current = cache.get_version(&label, &request.type_url).unwrap_or_default();
            match state.last_sent.get(&request.type_url) {
                Some(last) if last.nonce.as_ref() != request.response_nonce => {
                    debug!(nonce = %request.response_nonce, "Ignoring stale nonce");
                    return true;
                }
                Some(last) if last.version.as_ref() == current => {
                    debug!(version = %request.version_info, "[ACK] Skipping duplicate discovery request");
                    return true;
                }
                _ => {}
            }
        }

        respond(cache, state, &label, &request.type_url, tx).await
    }
    .instrument(span)
    .await
}

async fn push(
    cache: &SnapshotCache,
    state: &mut StreamState,
    type_urls: &[String],
    tx: &ResponseSender,
) -> bool {
    let Some(label) = state.label.clone() else {
        return true;
    };
    for type_url in type_urls {
        if !respond(cache, state, &label, type_url, tx).await {
            return false;
        }
    }
    true
}

async fn respond(
    cache: &SnapshotCache,
    state: &mut StreamState,
    label: &str,
    type_url: &str,
    tx: &ResponseSender,
) -> bool {
    let names = state.subscriptions.get(type_url).cloned().unwrap_or_default();
    let response = match build_response(cache, label, type_url, &names) {
        Ok(response) => response,
        Err(e) => {
            warn!(label = %label, type_url = %type_url, error = %e, "Failed to build discovery response");
            let _ = tx.send(Err(Status::invalid_argument(e.to_string()))).await;
            return false;
        }
    };

    info!(
        label = %label,
        type_url = %response.type_url,
        version = %response.version_info,
        nonce = %response.nonce,
        resource_count = response.resources.len(),
        "Sending discovery response"
    );

    state.last_sent.insert(
        type_url.to_string(),
        LastDiscoverySnapshot {
            version: Arc::from(response.version_info.as_str()),
            nonce: Arc::from(response.nonce.as_str()),
        },
    );

    if tx.send(Ok(response)).await.is_err() {
        debug!(label = %label, "Discovery response receiver dropped");
        return false;
    }
    true
}

/// Build the SOTW response for one type of a label's snapshot.
///
/// Route configurations and load assignments honour the requested names;
/// every other type is served whole.
pub fn build_response(
    cache: &SnapshotCache,
    label: &str,
    type_url: &str,
    resource_names: &[String],
) -> Result<DiscoveryResponse> {
    let resource_type = ResourceType::from_type_url(type_url)?;
    let version = cache.get_version(label, type_url)?;
    let resources = cache.get_resources(label, type_url)?;

    let filter_by_name = matches!(resource_type, ResourceType::Route | ResourceType::Endpoint)
        && !resource_names.is_empty()
        && !resource_names.iter().any(|n| n == "*");

    let resources = resources
        .iter()
        .filter(|(name, _)| !filter_by_name || resource_names.contains(name))
        .map(|(_, resource)| resource.to_any())
        .collect();

    Ok(DiscoveryResponse {
        version_info: version,
        resources,
        canary: false,
        type_url: type_url.to_string(),
        nonce: Uuid::new_v4().to_string(),
        control_plane: None,
        resource_errors: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xds::cache::ResourceCollections;
    use crate::xds::resources::{XdsResource, CLUSTER_TYPE_URL, ROUTE_TYPE_URL};
    use envoy_types::pb::envoy::config::cluster::v3::Cluster;
    use envoy_types::pb::envoy::config::core::v3::Node;
    use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
    use std::time::Duration;

    fn request(node: &str, type_url: &str) -> DiscoveryRequest {
        DiscoveryRequest {
            node: Some(Node { id: node.into(), ..Default::default() }),
            type_url: type_url.into(),
            ..Default::default()
        }
    }

    fn clusters(names: &[&str]) -> ResourceCollections {
        ResourceCollections::from([(
            ResourceType::Cluster,
            names
                .iter()
                .map(|n| XdsResource::Cluster(Cluster { name: n.to_string(), ..Default::default() }))
                .collect(),
        )])
    }

    async fn next(
        responses: &mut ReceiverStream<std::result::Result<DiscoveryResponse, Status>>,
    ) -> std::result::Result<DiscoveryResponse, Status> {
        tokio::time::timeout(Duration::from_secs(2), responses.next())
            .await
            .expect("response expected")
            .expect("stream open")
    }

    #[test]
    fn route_requests_filter_by_name() {
        let cache = SnapshotCache::new();
        cache
            .publish(
                "default",
                ResourceCollections::from([(
                    ResourceType::Route,
                    vec![
                        XdsResource::Route(RouteConfiguration { name: "a".into(), ..Default::default() }),
                        XdsResource::Route(RouteConfiguration { name: "b".into(), ..Default::default() }),
                    ],
                )]),
            )
            .unwrap();

        let response = build_response(&cache, "default", ROUTE_TYPE_URL, &["a".into()]).unwrap();
        assert_eq!(response.resources.len(), 1);
        assert_eq!(response.version_info, "1");

        let all = build_response(&cache, "default", ROUTE_TYPE_URL, &[]).unwrap();
        assert_eq!(all.resources.len(), 2);
    }

    #[tokio::test]
    async fn serves_label_snapshot_and_pushes_updates() {
        let cache = Arc::new(SnapshotCache::new());
        cache.publish("default", clusters(&["c1"])).unwrap();
        cache.publish("other", clusters(&["x"])).unwrap();

        let (req_tx, req_rx) = mpsc::channel(8);
        let mut responses = run_stream_loop(
            cache.clone(),
            Arc::new(ConnectionTracker::default()),
            ReceiverStream::new(req_rx),
        );

        req_tx.send(Ok(request("default", CLUSTER_TYPE_URL))).await.unwrap();
        let first = next(&mut responses).await.unwrap();
        assert_eq!(first.version_info, "1");
        assert_eq!(first.resources.len(), 1);

        // ACK of the current version produces nothing; the next message is the push.
        let mut ack = request("default", CLUSTER_TYPE_URL);
        ack.version_info = first.version_info.clone();
        ack.response_nonce = first.nonce.clone();
        req_tx.send(Ok(ack)).await.unwrap();

        cache.publish("other", clusters(&["y"])).unwrap();
        cache.publish("default", clusters(&["c1", "c2"])).unwrap();

        let pushed = next(&mut responses).await.unwrap();
        assert_eq!(pushed.version_info, "2");
        assert_eq!(pushed.resources.len(), 2);
    }

    #[tokio::test]
    async fn unknown_type_url_is_invalid_argument() {
        let cache = Arc::new(SnapshotCache::new());
        let (req_tx, req_rx) = mpsc::channel(8);
        let mut responses =
            run_stream_loop(cache, Arc::new(ConnectionTracker::default()), ReceiverStream::new(req_rx));

        req_tx
            .send(Ok(request("default", "type.googleapis.com/envoy.config.Unknown")))
            .await
            .unwrap();

        let status = next(&mut responses).await.unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
