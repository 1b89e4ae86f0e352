//! Service registry integration
//!
//! Query syntax for registry-resolved endpoints, the registry client and
//! the per-cluster poller that feeds endpoint changes back into the
//! publish pipeline.

pub mod consul;
pub mod query;
pub mod refresher;

pub use consul::{ConsulClient, RegistryClient};
pub use query::{RegistryQuery, Upstream};
pub use refresher::{EndpointRefresher, EndpointSink};
