//! # Flowgate
//!
//! Control plane for an Envoy-based API gateway. API definitions are
//! synthesized into Envoy clusters, routes and listeners plus the
//! enforcer's API descriptors, aggregated per deployment label and served
//! to proxies over the Aggregated Discovery Service.
//!
//! ```text
//! DeploymentRequest → Synthesizer → PublishController → SnapshotCache → ADS → Envoy
//!                                        ↑
//!                           EndpointRefresher (service registry)
//! ```

pub mod config;
pub mod discovery;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod xds;

pub use config::AppConfig;
pub use errors::{Error, Result};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "flowgate");
    }
}
