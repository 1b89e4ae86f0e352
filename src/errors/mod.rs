//! # Error Handling
//!
//! Crate-wide error type built with `thiserror`. Variants follow the
//! control plane's error taxonomy: validation failures are rejected
//! synchronously at the Deploy/Publish boundary, registry failures are
//! transient and handled by the endpoint refresher.

use std::fmt;

use serde::Serialize;

/// Custom result type for control plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Identity of an API, attached to validation errors raised while
/// synthesizing or deploying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApiIdentity {
    pub title: String,
    pub version: String,
    pub id: String,
}

impl fmt::Display for ApiIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (id {})", self.title, self.version, self.id)
    }
}

fn api_suffix(api: &Option<ApiIdentity>) -> String {
    api.as_ref().map(|api| format!(" [api {}]", api)).unwrap_or_default()
}

/// Main error type for the control plane
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed definitions and rejected deployments
    #[error("Validation error: {message}{}", api_suffix(.api))]
    Validation { message: String, api: Option<ApiIdentity> },

    /// A snapshot references resources it does not contain
    #[error("Inconsistent snapshot for label '{label}': unresolved references {missing:?}")]
    InconsistentSnapshot { label: String, missing: Vec<String> },

    /// Type URL outside the closed resource-type enumeration
    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),

    /// Service registry failures (unreachable, bad payload)
    #[error("Registry error: {0}")]
    Registry(String),

    /// Network transport errors (gRPC, HTTP)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Encoding and decoding failures
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal server errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error not tied to a specific API
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation { message: message.into(), api: None }
    }

    /// Create a validation error identifying the offending API
    pub fn validation_for<S: Into<String>>(api: ApiIdentity, message: S) -> Self {
        Self::Validation { message: message.into(), api: Some(api) }
    }

    /// Create a new registry error
    pub fn registry<S: Into<String>>(message: S) -> Self {
        Self::Registry(message.into())
    }

    /// Create a new transport error
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport(message.into())
    }

    /// Create a new internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// Errors that are rejected synchronously and never partially applied.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::InconsistentSnapshot { .. } | Self::UnknownResourceType(_)
        )
    }

    /// Attach an API identity to a validation error that does not carry one yet.
    pub fn with_api(self, identity: ApiIdentity) -> Self {
        match self {
            Self::Validation { message, api: None } => {
                Self::Validation { message, api: Some(identity) }
            }
            other => other,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Config(errors.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(error: serde_yaml::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(error: prost::DecodeError) -> Self {
        Self::Serialization(error.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        Self::Registry(error.to_string())
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(error: tonic::transport::Error) -> Self {
        Self::Transport(error.to_string())
    }
}
