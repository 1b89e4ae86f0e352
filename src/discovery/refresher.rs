//! Dynamic endpoint refresher
//!
//! One poll task per registry-resolved cluster. Each task waits for the
//! next tick, asks the registry with a per-request timeout and hands a
//! changed result set to the [`EndpointSink`]. Failed, timed-out or empty
//! polls keep the previous endpoints. Every task owns a cancellation token
//! so undeploying a cluster stops its poller and waits for it to exit.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::discovery::{RegistryClient, RegistryQuery, Upstream};
use crate::errors::Result;
use crate::observability::metrics;

/// Receives endpoint sets that differ from the last observed one
#[async_trait]
pub trait EndpointSink: Send + Sync {
    async fn endpoints_changed(&self, cluster_name: &str, upstreams: Vec<Upstream>) -> Result<()>;
}

#[derive(Debug)]
struct Watch {
    query: RegistryQuery,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Shared by every poll task
#[derive(Clone)]
struct PollContext {
    client: Arc<dyn RegistryClient>,
    sink: Weak<dyn EndpointSink>,
    last_results: Arc<DashMap<String, Vec<Upstream>>>,
    poll_interval: Duration,
    request_timeout: Duration,
}

pub struct EndpointRefresher {
    context: PollContext,
    watches: DashMap<String, Watch>,
    shutdown: CancellationToken,
}

impl EndpointRefresher {
    pub fn new(
        client: Arc<dyn RegistryClient>,
        config: &RegistryConfig,
        sink: Weak<dyn EndpointSink>,
    ) -> Self {
        Self::with_timing(client, config.poll_interval(), config.request_timeout(), sink)
    }

    pub fn with_timing(
        client: Arc<dyn RegistryClient>,
        poll_interval: Duration,
        request_timeout: Duration,
        sink: Weak<dyn EndpointSink>,
    ) -> Self {
        Self {
            context: PollContext {
                client,
                sink,
                last_results: Arc::new(DashMap::new()),
                poll_interval,
                request_timeout,
            },
            watches: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start polling for `cluster_name`, seeded with its current upstreams.
    ///
    /// Re-watching with the same query keeps the running poller; a new
    /// query replaces it once the old poller has finished, so no result of
    /// the old query lands after the new seed.
    pub async fn watch(&self, cluster_name: &str, query: RegistryQuery, initial: Vec<Upstream>) {
        let replaced = match self.watches.entry(cluster_name.to_string()) {
            Entry::Occupied(existing) if existing.get().query == query => return,
            Entry::Occupied(existing) => Some(existing.remove()),
            Entry::Vacant(_) => None,
        };
        if let Some(old) = replaced {
            old.cancel.cancel();
            if let Err(e) = old.handle.await {
                warn!(cluster = %cluster_name, error = %e, "Replaced registry poller ended abnormally");
            }
            debug!(cluster = %cluster_name, query = %old.query, "Replaced registry watch");
        }

        self.context.last_results.insert(cluster_name.to_string(), normalize(initial));

        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(poll_loop(
            cluster_name.to_string(),
            query.clone(),
            self.context.clone(),
            cancel.clone(),
        ));

        info!(cluster = %cluster_name, query = %query, "Watching registry for cluster endpoints");
        self.watches.insert(cluster_name.to_string(), Watch { query, cancel, handle });
    }

    /// Stop the cluster's poller and wait for it to finish.
    pub async fn unwatch(&self, cluster_name: &str) {
        let Some((_, watch)) = self.watches.remove(cluster_name) else {
            return;
        };
        watch.cancel.cancel();
        if let Err(e) = watch.handle.await {
            warn!(cluster = %cluster_name, error = %e, "Registry poller ended abnormally");
        }
        self.context.last_results.remove(cluster_name);
        info!(cluster = %cluster_name, "Stopped watching registry");
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        for cluster in self.watched_clusters() {
            self.unwatch(&cluster).await;
        }
    }

    pub fn is_watching(&self, cluster_name: &str) -> bool {
        self.watches.contains_key(cluster_name)
    }

    pub fn watched_clusters(&self) -> Vec<String> {
        let mut clusters: Vec<String> = self.watches.iter().map(|w| w.key().clone()).collect();
        clusters.sort();
        clusters
    }

    /// Last endpoint set observed for the cluster.
    pub fn last_result(&self, cluster_name: &str) -> Option<Vec<Upstream>> {
        self.context.last_results.get(cluster_name).map(|r| r.value().clone())
    }
}

impl Drop for EndpointRefresher {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn poll_loop(
    cluster: String,
    query: RegistryQuery,
    context: PollContext,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(context.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = tokio::time::timeout(context.request_timeout, context.client.resolve(&query)) => outcome,
        };

        let upstreams = match outcome {
            Err(_) => {
                metrics::record_registry_poll("timeout");
                warn!(cluster = %cluster, query = %query, "Registry request timed out");
                continue;
            }
            Ok(Err(e)) => {
                metrics::record_registry_poll("error");
                warn!(cluster = %cluster, query = %query, error = %e, "Registry request failed");
                continue;
            }
            Ok(Ok(upstreams)) if upstreams.is_empty() => {
                metrics::record_registry_poll("empty");
                debug!(cluster = %cluster, "Registry returned no endpoints, keeping previous set");
                continue;
            }
            Ok(Ok(upstreams)) => normalize(upstreams),
        };

        if !record_if_changed(&context.last_results, &cluster, &upstreams) {
            metrics::record_registry_poll("unchanged");
            continue;
        }
        metrics::record_registry_poll("changed");

        let Some(sink) = context.sink.upgrade() else {
            debug!(cluster = %cluster, "Endpoint sink dropped, stopping poller");
            break;
        };

        info!(cluster = %cluster, endpoints = upstreams.len(), "Registry endpoints changed");
        if let Err(e) = sink.endpoints_changed(&cluster, upstreams).await {
            warn!(cluster = %cluster, error = %e, "Failed to apply registry endpoints");
            // Forget the result so the next tick applies it again.
            context.last_results.remove(&cluster);
        }
    }

    debug!(cluster = %cluster, "Registry poller exited");
}

/// Store `upstreams` unless it equals the stored set; `true` when stored.
fn record_if_changed(
    last_results: &DashMap<String, Vec<Upstream>>,
    cluster: &str,
    upstreams: &[Upstream],
) -> bool {
    match last_results.entry(cluster.to_string()) {
        Entry::Occupied(entry) if entry.get().as_slice() == upstreams => false,
        Entry::Occupied(mut entry) => {
            entry.insert(upstreams.to_vec());
            true
        }
        Entry::Vacant(entry) => {
            entry.insert(upstreams.to_vec());
            true
        }
    }
}

fn normalize(mut upstreams: Vec<Upstream>) -> Vec<Upstream> {
    upstreams.sort();
    upstreams.dedup();
    upstreams
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::errors::Error;

    /// Replays scripted responses, repeating the last one.
    struct ScriptedClient {
        responses: Mutex<Vec<Result<Vec<Upstream>>>>,
    }

    #[async_trait]
    impl RegistryClient for ScriptedClient {
        async fn resolve(&self, _query: &RegistryQuery) -> Result<Vec<Upstream>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                responses.remove(0)
            } else {
                match &responses[0] {
                    Ok(upstreams) => Ok(upstreams.clone()),
                    Err(_) => Err(Error::registry("unreachable")),
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(String, Vec<Upstream>)>>,
    }

    #[async_trait]
    impl EndpointSink for RecordingSink {
        async fn endpoints_changed(&self, cluster_name: &str, upstreams: Vec<Upstream>) -> Result<()> {
            self.calls.lock().unwrap().push((cluster_name.to_string(), upstreams));
            Ok(())
        }
    }

    fn refresher(
        responses: Vec<Result<Vec<Upstream>>>,
        sink: &Arc<RecordingSink>,
    ) -> EndpointRefresher {
        let client = Arc::new(ScriptedClient { responses: Mutex::new(responses) });
        let sink: Arc<dyn EndpointSink> = sink.clone();
        EndpointRefresher::with_timing(
            client,
            Duration::from_millis(20),
            Duration::from_millis(10),
            Arc::downgrade(&sink),
        )
    }

    fn query() -> RegistryQuery {
        RegistryQuery::parse("pets").unwrap()
    }

    #[tokio::test]
    async fn changed_result_reaches_sink_once() {
        let sink = Arc::new(RecordingSink::default());
        let refresher = refresher(
            vec![
                Err(Error::registry("down")),
                Ok(vec![]),
                Ok(vec![Upstream::new("10.0.0.2", 80), Upstream::new("10.0.0.1", 80)]),
            ],
            &sink,
        );

        refresher.watch("c1", query(), vec![Upstream::new("pets.local", 80)]).await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        let calls = sink.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "c1");
        assert_eq!(calls[0].1, vec![Upstream::new("10.0.0.1", 80), Upstream::new("10.0.0.2", 80)]);
        assert_eq!(refresher.last_result("c1"), Some(calls[0].1.clone()));

        refresher.shutdown().await;
        assert!(refresher.watched_clusters().is_empty());
    }

    #[tokio::test]
    async fn failures_keep_the_seeded_set() {
        let sink = Arc::new(RecordingSink::default());
        let refresher = refresher(vec![Err(Error::registry("down"))], &sink);
        let seeded = vec![Upstream::new("pets.local", 80)];

        refresher.watch("c1", query(), seeded.clone()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(sink.calls.lock().unwrap().is_empty());
        assert_eq!(refresher.last_result("c1"), Some(seeded));
        refresher.unwatch("c1").await;
        assert!(!refresher.is_watching("c1"));
    }

    #[tokio::test]
    async fn unwatch_stops_polling() {
        let sink = Arc::new(RecordingSink::default());
        let refresher = refresher(vec![Ok(vec![Upstream::new("10.0.0.9", 80)])], &sink);

        refresher.watch("c1", query(), Vec::new()).await;
        refresher.unwatch("c1").await;
        let seen = sink.calls.lock().unwrap().len();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(sink.calls.lock().unwrap().len(), seen);
        assert!(refresher.last_result("c1").is_none());
    }

    /// Answers with a different host per service, slowly enough that a
    /// replaced poller is usually mid-request.
    struct ByServiceClient;

    #[async_trait]
    impl RegistryClient for ByServiceClient {
        async fn resolve(&self, query: &RegistryQuery) -> Result<Vec<Upstream>> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let host = if query.service_name == "old" { "10.0.0.1" } else { "10.0.0.2" };
            Ok(vec![Upstream::new(host, 80)])
        }
    }

    #[tokio::test]
    async fn replaced_watch_applies_nothing_from_the_old_query() {
        let sink = Arc::new(RecordingSink::default());
        let sink_dyn: Arc<dyn EndpointSink> = sink.clone();
        let refresher = EndpointRefresher::with_timing(
            Arc::new(ByServiceClient),
            Duration::from_millis(10),
            Duration::from_millis(8),
            Arc::downgrade(&sink_dyn),
        );
        let fresh = vec![Upstream::new("10.0.0.2", 80)];

        refresher.watch("c1", RegistryQuery::parse("old").unwrap(), Vec::new()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        refresher.watch("c1", RegistryQuery::parse("new").unwrap(), Vec::new()).await;
        let replaced_at = sink.calls.lock().unwrap().len();
        assert!(replaced_at >= 1, "old query was applied before the swap");

        tokio::time::sleep(Duration::from_millis(80)).await;
        let calls = sink.calls.lock().unwrap().clone();
        assert!(calls.len() > replaced_at);
        assert!(calls[replaced_at..].iter().all(|(_, upstreams)| upstreams == &fresh));
        assert_eq!(refresher.last_result("c1"), Some(fresh));
        refresher.shutdown().await;
    }

    #[test]
    fn equal_sets_are_not_recorded_twice() {
        let results = DashMap::new();
        let set = vec![Upstream::new("a", 1)];
        assert!(record_if_changed(&results, "c", &set));
        assert!(!record_if_changed(&results, "c", &set));
        assert!(record_if_changed(&results, "c", &[Upstream::new("b", 1)]));
    }
}
