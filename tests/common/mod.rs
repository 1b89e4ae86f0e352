//! Shared fixtures for integration tests
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use flowgate::config::EnvoyConfig;
use flowgate::domain::{ApiDefinition, ApiType, Endpoint, LabelEnvironments, Resource};
use flowgate::xds::{PublishController, SnapshotCache};

pub fn endpoint(url: &str) -> Endpoint {
    Endpoint::parse(url).expect("valid endpoint url")
}

pub fn resource(id: &str, path: &str, methods: &[&str]) -> Resource {
    Resource {
        id: id.to_string(),
        path: path.to_string(),
        methods: methods.iter().map(|m| m.to_string()).collect(),
        production_endpoints: Vec::new(),
        sandbox_endpoints: Vec::new(),
        vendor_extensions: BTreeMap::new(),
    }
}

/// HTTP API with one production endpoint and a GET `/pets` resource
pub fn http_api(title: &str, version: &str, production: &str) -> ApiDefinition {
    ApiDefinition {
        id: format!("{}-{}", title.to_lowercase().replace(' ', "-"), version),
        title: title.to_string(),
        version: version.to_string(),
        description: String::new(),
        api_type: ApiType::Http,
        basepath_override: None,
        production_endpoints: vec![endpoint(production)],
        sandbox_endpoints: Vec::new(),
        resources: vec![resource("r-pets", "/pets", &["GET"])],
        vendor_extensions: BTreeMap::new(),
    }
}

pub fn labels(names: &[&str]) -> LabelEnvironments {
    names.iter().map(|n| (n.to_string(), vec!["production".to_string()])).collect()
}

pub fn controller() -> (Arc<PublishController>, Arc<SnapshotCache>) {
    let cache = Arc::new(SnapshotCache::new());
    (PublishController::new(EnvoyConfig::default(), cache.clone()), cache)
}
