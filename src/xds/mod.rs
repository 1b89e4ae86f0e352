//! Envoy xDS configuration pipeline
//!
//! Translates API definitions into Envoy and enforcer resources, aggregates
//! them per label and serves the resulting snapshots over ADS:
//!
//! - [`synthesis`] builds the clusters, routes and enforcer descriptor of one API
//! - [`controller`] owns deploy/undeploy and republishes every affected label
//! - [`cache`] holds one versioned, consistency-checked snapshot per label
//! - [`services`] and [`server`] stream those snapshots to proxies

pub mod cache;
pub mod cluster;
pub mod controller;
pub mod enforcer;
pub mod listener;
pub mod node_tracker;
pub mod registry;
pub mod resources;
pub mod route;
pub mod server;
pub mod services;
pub mod synthesis;

pub use cache::{ResourceCollections, Snapshot, SnapshotCache, SnapshotUpdate};
pub use controller::{DeploymentOutcome, DeploymentResult, PublishController};
pub use node_tracker::ConnectionTracker;
pub use resources::{ResourceType, XdsResource};
pub use server::start_xds_server;
pub use services::AdsService;
pub use synthesis::{ArtifactSet, SynthesisWarning, Synthesizer, TrafficClass};
