//! # Structured Logging
//!
//! Subscriber setup and span macros for the control plane. Log fields are
//! structured (`label`, `api_key`, `cluster`, `version`, `node_id`) so they
//! survive the JSON formatter intact.

use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{AppConfig, ObservabilityConfig};
use crate::errors::{Error, Result};

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span around a deployment-time operation
#[macro_export]
macro_rules! deploy_span {
    ($operation:expr, $api_key:expr) => {
        tracing::info_span!(
            "deploy_operation",
            operation = %$operation,
            api_key = %$api_key,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice
/// returns an error instead of panicking.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level).map_err(|e| {
            Error::config(format!("Invalid log level '{}': {}", config.log_level, e))
        })?,
    };

    let result = if config.json_logging {
        fmt().json().with_env_filter(filter).with_current_span(true).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };

    result.map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))
}

/// Log configuration at startup
pub fn log_config_info(config: &AppConfig) {
    tracing::info!(
        xds_address = %config.xds.socket_address(),
        listener_port = config.envoy.listener_port,
        virtual_host = %config.envoy.virtual_host,
        cluster_header = %config.envoy.cluster_header_name,
        registry_enabled = config.registry.enabled,
        registry_url = %config.registry.url,
        "Control plane configuration"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_macros_compile() {
        let _span = xds_span!("stream_aggregated", "prod-gateway");
        let _span = xds_span!("stream_aggregated", "prod-gateway", version = "3");
        let _span = deploy_span!("deploy", "PetStore:1.0.0");
    }

    #[test]
    fn test_log_config_info() {
        let config = AppConfig::default();
        log_config_info(&config);
    }

    #[test]
    fn test_invalid_level_is_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = ObservabilityConfig { log_level: "flowgate=loudest".to_string(), ..Default::default() };
        assert!(init_logging(&config).is_err());
    }
}
