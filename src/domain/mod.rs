//! Domain layer
//!
//! Pure domain types with no infrastructure dependencies: API definitions,
//! their endpoints and identifiers, and deployment requests.

pub mod api_definition;
pub mod deployment;
pub mod endpoint;
pub mod id;

pub use api_definition::{normalize_basepath, ApiDefinition, ApiType, Resource, BASEPATH_EXTENSION};
pub use deployment::{DeploymentRequest, LabelEnvironments};
pub use endpoint::{Endpoint, UrlType};
pub use id::ApiKey;
