//! API definition domain model
//!
//! In-memory form of one API as produced by the ingestion pipeline:
//! identity, endpoints, resources and vendor metadata. The synthesizer
//! consumes it; the registry compares content hashes to detect redeploys
//! that changed nothing.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::domain::{ApiKey, Endpoint};
use crate::errors::{ApiIdentity, Error, Result};

/// Vendor extension carrying a basepath override
pub const BASEPATH_EXTENSION: &str = "x-wso2-basepath";

const HTTP_METHODS: &[&str] =
    &["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD", "OPTIONS", "TRACE", "CONNECT"];

/// Protocol family of an API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ApiType {
    #[default]
    Http,
    Ws,
}

impl ApiType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiType::Http => "HTTP",
            ApiType::Ws => "WS",
        }
    }
}

/// One path item of an API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Stable identifier; generated once per resource by the ingestion side
    pub id: String,
    pub path: String,
    pub methods: Vec<String>,
    #[serde(default)]
    pub production_endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub sandbox_endpoints: Vec<Endpoint>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vendor_extensions: BTreeMap<String, Value>,
}

impl Resource {
    /// Declared methods, upper-cased with duplicates removed, in declaration order.
    pub fn normalized_methods(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.methods
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| seen.insert(m.clone()))
            .collect()
    }
}

/// A complete API definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiDefinition {
    pub id: String,
    pub title: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub api_type: ApiType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basepath_override: Option<String>,
    #[serde(default)]
    pub production_endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub sandbox_endpoints: Vec<Endpoint>,
    #[serde(default)]
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vendor_extensions: BTreeMap<String, Value>,
}

impl ApiDefinition {
    pub fn key(&self) -> ApiKey {
        ApiKey::new(&self.title, &self.version)
    }

    pub fn identity(&self) -> ApiIdentity {
        ApiIdentity { title: self.title.clone(), version: self.version.clone(), id: self.id.clone() }
    }

    /// SHA-256 over the canonical JSON encoding.
    ///
    /// Maps are ordered and struct fields serialize in declaration order, so
    /// equal definitions always hash equal.
    pub fn content_hash(&self) -> Result<String> {
        let encoded = serde_json::to_vec(self)?;
        Ok(hex::encode(Sha256::digest(&encoded)))
    }

    /// Basepath override from the dedicated field or the vendor extension.
    ///
    /// Returns the override normalized to a single leading slash without a
    /// trailing slash, or `None` when neither source is set.
    pub fn basepath_override(&self) -> Result<Option<String>> {
        if let Some(explicit) = self.basepath_override.as_deref().map(str::trim) {
            if !explicit.is_empty() {
                return Ok(Some(normalize_basepath(explicit)));
            }
        }

        match self.vendor_extensions.get(BASEPATH_EXTENSION) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(raw)) if raw.trim().is_empty() => Ok(None),
            Some(Value::String(raw)) => Ok(Some(normalize_basepath(raw.trim()))),
            Some(other) => Err(Error::validation_for(
                self.identity(),
                format!("{} must be a string, found {}", BASEPATH_EXTENSION, other),
            )),
        }
    }

    /// Structural checks done before synthesis.
    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(Error::validation_for(self.identity(), message));

        if self.title.trim().is_empty() {
            return fail("API title cannot be empty".into());
        }
        if self.version.trim().is_empty() {
            return fail("API version cannot be empty".into());
        }
        if self.title.contains(':') {
            return fail(format!("API title '{}' cannot contain ':'", self.title));
        }

        let mut ids = HashSet::new();
        for resource in &self.resources {
            if resource.id.trim().is_empty() {
                return fail(format!("resource '{}' has no id", resource.path));
            }
            if !ids.insert(resource.id.as_str()) {
                return fail(format!("duplicate resource id '{}'", resource.id));
            }
            if !resource.path.starts_with('/') {
                return fail(format!("resource path '{}' must start with '/'", resource.path));
            }
            if resource.methods.is_empty() {
                return fail(format!("resource '{}' declares no methods", resource.path));
            }
            for method in resource.normalized_methods() {
                if !HTTP_METHODS.contains(&method.as_str()) {
                    return fail(format!(
                        "resource '{}' declares unknown method '{}'",
                        resource.path, method
                    ));
                }
            }
        }

        self.basepath_override()?;
        Ok(())
    }
}

/// Single leading slash, no trailing slash, "" for root.
pub fn normalize_basepath(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}
