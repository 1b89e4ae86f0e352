//! # Configuration Settings
//!
//! Defines the configuration structure for the control plane. Every section
//! can be built from defaults, from `FLOWGATE_*` environment variables, or
//! from a YAML file with environment overrides applied on top.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::errors::{Error, Result};

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
#[serde(default)]
pub struct AppConfig {
    /// xDS server configuration
    #[validate(nested)]
    pub xds: XdsConfig,

    /// Data-plane objects generated for every label
    #[validate(nested)]
    pub envoy: EnvoyConfig,

    /// Service registry used for dynamic endpoints
    #[validate(nested)]
    pub registry: RegistryConfig,

    /// Logging configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Build configuration from defaults plus environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config: AppConfig = serde_yaml::from_str(&raw).map_err(|e| {
            Error::config(format!("Invalid config file {}: {}", path.display(), e))
        })?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply every `FLOWGATE_*` variable that is set.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.xds.apply_env_overrides()?;
        self.envoy.apply_env_overrides()?;
        self.registry.apply_env_overrides()?;
        self.observability.apply_env_overrides()?;
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.envoy.listener_port == self.xds.port {
            return Err(Error::config("Listener and xDS ports cannot be the same"));
        }

        if self.registry.request_timeout() >= self.registry.poll_interval() {
            return Err(Error::config(
                "Registry request timeout must be shorter than the poll interval",
            ));
        }

        if self.envoy.cluster_header_name.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::config("Cluster header name must be lowercase"));
        }

        Ok(())
    }
}

/// xDS server configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct XdsConfig {
    /// Bind address for the ADS gRPC server
    #[validate(length(min = 1, message = "xDS bind address cannot be empty"))]
    pub bind_address: String,

    /// ADS gRPC port
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub port: u16,
}

impl Default for XdsConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0".to_string(), port: 18000 }
    }
}

impl XdsConfig {
    fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("FLOWGATE_XDS_BIND_ADDRESS", &mut self.bind_address)?;
        override_from_env("FLOWGATE_XDS_PORT", &mut self.port)?;
        Ok(())
    }

    /// Socket address string for the gRPC server
    pub fn socket_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// Settings for the Envoy objects generated per label
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct EnvoyConfig {
    /// Name shared by every label's listener
    #[validate(length(min = 1, message = "Listener name cannot be empty"))]
    pub listener_name: String,

    /// Address the proxies listen on
    #[validate(length(min = 1, message = "Listener address cannot be empty"))]
    pub listener_address: String,

    /// Port the proxies listen on
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub listener_port: u16,

    /// Route configuration name referenced by the listener over RDS
    #[validate(length(min = 1, message = "Route configuration name cannot be empty"))]
    pub route_config_name: String,

    /// Virtual host name, also used to key enforcer API resources
    #[validate(length(min = 1, message = "Virtual host cannot be empty"))]
    pub virtual_host: String,

    /// Upstream connect timeout in seconds
    #[validate(range(min = 1, max = 300, message = "Timeout must be between 1 and 300 seconds"))]
    pub connect_timeout_seconds: u64,

    /// Header carrying the cluster chosen at request time
    #[validate(length(min = 1, message = "Cluster header name cannot be empty"))]
    pub cluster_header_name: String,

    /// CA bundle used to verify TLS upstreams
    #[validate(length(min = 1, message = "CA certificate path cannot be empty"))]
    pub ca_cert_path: String,

    /// Cluster name of the external authorization service
    #[validate(length(min = 1, message = "Enforcer cluster name cannot be empty"))]
    pub enforcer_cluster_name: String,

    /// Host of the external authorization service
    #[validate(length(min = 1, message = "Enforcer host cannot be empty"))]
    pub enforcer_host: String,

    /// Port of the external authorization service
    #[validate(range(min = 1, max = 65535, message = "Port must be between 1 and 65535"))]
    pub enforcer_port: u16,

    /// Timeout for each authorization check in milliseconds
    #[validate(range(min = 1, max = 60000, message = "Timeout must be between 1 and 60000 ms"))]
    pub enforcer_timeout_millis: u64,
}

impl Default for EnvoyConfig {
    fn default() -> Self {
        Self {
            listener_name: "default".to_string(),
            listener_address: "0.0.0.0".to_string(),
            listener_port: 9090,
            route_config_name: "default".to_string(),
            virtual_host: "default".to_string(),
            connect_timeout_seconds: 5,
            cluster_header_name: "x-wso2-cluster-header".to_string(),
            ca_cert_path: "/etc/ssl/certs/ca-certificates.crt".to_string(),
            enforcer_cluster_name: "ext-authz".to_string(),
            enforcer_host: "enforcer".to_string(),
            enforcer_port: 8081,
            enforcer_timeout_millis: 20000,
        }
    }
}

impl EnvoyConfig {
    fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("FLOWGATE_LISTENER_NAME", &mut self.listener_name)?;
        override_from_env("FLOWGATE_LISTENER_ADDRESS", &mut self.listener_address)?;
        override_from_env("FLOWGATE_LISTENER_PORT", &mut self.listener_port)?;
        override_from_env("FLOWGATE_ROUTE_CONFIG_NAME", &mut self.route_config_name)?;
        override_from_env("FLOWGATE_VIRTUAL_HOST", &mut self.virtual_host)?;
        override_from_env("FLOWGATE_CONNECT_TIMEOUT_SECONDS", &mut self.connect_timeout_seconds)?;
        override_from_env("FLOWGATE_CLUSTER_HEADER_NAME", &mut self.cluster_header_name)?;
        override_from_env("FLOWGATE_CA_CERT_PATH", &mut self.ca_cert_path)?;
        override_from_env("FLOWGATE_ENFORCER_CLUSTER_NAME", &mut self.enforcer_cluster_name)?;
        override_from_env("FLOWGATE_ENFORCER_HOST", &mut self.enforcer_host)?;
        override_from_env("FLOWGATE_ENFORCER_PORT", &mut self.enforcer_port)?;
        override_from_env("FLOWGATE_ENFORCER_TIMEOUT_MILLIS", &mut self.enforcer_timeout_millis)?;
        Ok(())
    }

    /// Upstream connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Service registry (Consul) configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct RegistryConfig {
    /// Start endpoint watches for registry-resolved upstreams
    pub enabled: bool,

    /// Base URL of the registry HTTP API
    #[validate(url(message = "Registry URL must be a valid URL"))]
    pub url: String,

    /// Poll interval in seconds
    #[validate(range(min = 1, max = 3600, message = "Poll interval must be between 1 and 3600 seconds"))]
    pub poll_interval_seconds: u64,

    /// Per-request timeout in milliseconds
    #[validate(range(min = 10, max = 600000, message = "Request timeout must be between 10 and 600000 ms"))]
    pub request_timeout_millis: u64,

    /// Only return instances whose health checks pass
    pub healthy_only: bool,

    /// ACL token sent with every registry request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acl_token: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: "http://127.0.0.1:8500".to_string(),
            poll_interval_seconds: 5,
            request_timeout_millis: 2000,
            healthy_only: true,
            acl_token: None,
        }
    }
}

impl RegistryConfig {
    fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("FLOWGATE_REGISTRY_ENABLED", &mut self.enabled)?;
        override_from_env("FLOWGATE_REGISTRY_URL", &mut self.url)?;
        override_from_env("FLOWGATE_REGISTRY_POLL_INTERVAL_SECONDS", &mut self.poll_interval_seconds)?;
        override_from_env("FLOWGATE_REGISTRY_REQUEST_TIMEOUT_MILLIS", &mut self.request_timeout_millis)?;
        override_from_env("FLOWGATE_REGISTRY_HEALTHY_ONLY", &mut self.healthy_only)?;
        if let Ok(token) = std::env::var("FLOWGATE_REGISTRY_ACL_TOKEN") {
            self.acl_token = Some(token).filter(|t| !t.is_empty());
        }
        Ok(())
    }

    /// Poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// Per-request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_millis)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Service name attached to startup logs
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,

    /// Filter directive, e.g. `info` or `flowgate=debug,tonic=info`
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Emit logs as JSON lines
    pub json_logging: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { service_name: "flowgate".to_string(), log_level: "info".to_string(), json_logging: false }
    }
}

impl ObservabilityConfig {
    fn apply_env_overrides(&mut self) -> Result<()> {
        override_from_env("FLOWGATE_SERVICE_NAME", &mut self.service_name)?;
        override_from_env("FLOWGATE_LOG_LEVEL", &mut self.log_level)?;
        override_from_env("FLOWGATE_JSON_LOGGING", &mut self.json_logging)?;
        Ok(())
    }
}

fn override_from_env<T>(key: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Ok(raw) = std::env::var(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.xds.socket_address(), "0.0.0.0:18000");
        assert_eq!(config.envoy.connect_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn rejects_conflicting_ports() {
        let mut config = AppConfig::default();
        config.envoy.listener_port = config.xds.port;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("cannot be the same"));
    }

    #[test]
    fn rejects_timeout_longer_than_poll_interval() {
        let mut config = AppConfig::default();
        config.registry.poll_interval_seconds = 1;
        config.registry.request_timeout_millis = 1500;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("shorter than the poll interval"));
    }

    #[test]
    fn rejects_invalid_registry_url() {
        let mut config = AppConfig::default();
        config.registry.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_uppercase_cluster_header() {
        let mut config = AppConfig::default();
        config.envoy.cluster_header_name = "X-Cluster".to_string();
        assert!(config.validate().is_err());
    }
}
