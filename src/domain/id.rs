//! Domain identifiers
//!
//! An API is identified by `title:version`. The key is globally unique per
//! tenant, which is what makes generated cluster names unique across every
//! API sharing a label.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity key of a deployed API (`title:version`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(title: &str, version: &str) -> Self {
        Self(format!("{}:{}", title, version))
    }

    /// Wrap an already formatted key
    pub fn from_string(key: String) -> Self {
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ApiKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ApiKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_joins_title_and_version() {
        let key = ApiKey::new("PetStore", "1.0.5");
        assert_eq!(key.as_str(), "PetStore:1.0.5");
        assert_eq!(key, ApiKey::from("PetStore:1.0.5"));
    }

    #[test]
    fn serializes_transparently() {
        let key = ApiKey::new("Orders", "v2");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"Orders:v2\"");
    }
}
