//! Deployment requests
//!
//! What the ingestion pipeline hands to the control plane: a definition
//! plus the labels it should be served under. Each label maps to the
//! environments that label represents.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::ApiDefinition;

/// Label name to the environments it serves
pub type LabelEnvironments = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub definition: ApiDefinition,
    pub labels: LabelEnvironments,
}

impl DeploymentRequest {
    pub fn label_names(&self) -> BTreeSet<String> {
        self.labels.keys().cloned().collect()
    }
}
