//! # Configuration Management
//!
//! Configuration is read from `FLOWGATE_*` environment variables, optionally
//! layered over a YAML file. See [`settings`] for the individual sections.

pub mod settings;

pub use settings::{AppConfig, EnvoyConfig, ObservabilityConfig, RegistryConfig, XdsConfig};

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Environment variables are process-global
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_config_from_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("FLOWGATE_XDS_PORT", "19090");
        env::set_var("FLOWGATE_XDS_BIND_ADDRESS", "127.0.0.1");
        env::set_var("FLOWGATE_REGISTRY_ENABLED", "true");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.xds.port, 19090);
        assert_eq!(config.xds.bind_address, "127.0.0.1");
        assert!(config.registry.enabled);

        env::remove_var("FLOWGATE_XDS_PORT");
        env::remove_var("FLOWGATE_XDS_BIND_ADDRESS");
        env::remove_var("FLOWGATE_REGISTRY_ENABLED");
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::set_var("FLOWGATE_LISTENER_PORT", "not-a-port");

        let result = AppConfig::from_env();
        assert!(result.is_err());

        env::remove_var("FLOWGATE_LISTENER_PORT");
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        env::remove_var("FLOWGATE_XDS_PORT");
        env::remove_var("FLOWGATE_XDS_BIND_ADDRESS");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.xds.port, 18000);
        assert_eq!(config.xds.bind_address, "0.0.0.0");
        assert_eq!(config.envoy.cluster_header_name, "x-wso2-cluster-header");
    }
}
