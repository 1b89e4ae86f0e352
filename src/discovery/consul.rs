//! Service registry client
//!
//! Trait-based access to the service registry so the endpoint refresher can
//! be tested without a live registry. [`ConsulClient`] talks to Consul's
//! health API, one request per datacenter.

use std::collections::BTreeSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::RegistryConfig;
use crate::discovery::{RegistryQuery, Upstream};
use crate::errors::{Error, Result};

/// Resolves a registry query to the current upstream set
#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve(&self, query: &RegistryQuery) -> Result<Vec<Upstream>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    node: NodeEntry,
    service: ServiceEntry,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    #[serde(default)]
    address: String,
    port: u16,
    #[serde(default)]
    tags: Option<Vec<String>>,
}

impl HealthEntry {
    fn into_upstream(self, required_tags: &[String]) -> Option<Upstream> {
        if !required_tags.is_empty() {
            let tags: BTreeSet<&str> =
                self.service.tags.iter().flatten().map(String::as_str).collect();
            if !required_tags.iter().all(|t| tags.contains(t.as_str())) {
                return None;
            }
        }
        let address =
            if self.service.address.is_empty() { self.node.address } else { self.service.address };
        if address.is_empty() {
            return None;
        }
        Some(Upstream::new(address, self.service.port))
    }
}

/// Consul health API client
#[derive(Debug, Clone)]
pub struct ConsulClient {
    client: Client,
    base_url: String,
    healthy_only: bool,
    acl_token: Option<String>,
}

impl ConsulClient {
    pub fn new(config: &RegistryConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            healthy_only: config.healthy_only,
            acl_token: config.acl_token.clone(),
        })
    }

    async fn fetch(&self, query: &RegistryQuery, datacenter: Option<&str>) -> Result<Vec<HealthEntry>> {
        let url = format!("{}/v1/health/service/{}", self.base_url, query.service_name);
        let mut params: Vec<(&str, &str)> = Vec::new();
        if let Some(dc) = datacenter {
            params.push(("dc", dc));
        }
        if self.healthy_only {
            params.push(("passing", "1"));
        }
        if let Some(ns) = query.namespace.as_deref() {
            params.push(("ns", ns));
        }

        let mut request = self.client.get(&url).query(&params);
        if let Some(token) = &self.acl_token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::registry(format!(
                "registry returned {} for service '{}'",
                status, query.service_name
            )));
        }
        Ok(response.json::<Vec<HealthEntry>>().await?)
    }
}

#[async_trait]
impl RegistryClient for ConsulClient {
    async fn resolve(&self, query: &RegistryQuery) -> Result<Vec<Upstream>> {
        let datacenters: Vec<Option<&str>> = if query.datacenters.is_empty() {
            vec![None]
        } else {
            query.datacenters.iter().map(|dc| Some(dc.as_str())).collect()
        };

        let mut upstreams = BTreeSet::new();
        for datacenter in datacenters {
            let entries = self.fetch(query, datacenter).await?;
            debug!(
                service = %query.service_name,
                datacenter = ?datacenter,
                entries = entries.len(),
                "Fetched registry entries"
            );
            upstreams.extend(entries.into_iter().filter_map(|e| e.into_upstream(&query.tags)));
        }

        Ok(upstreams.into_iter().collect())
    }
}
