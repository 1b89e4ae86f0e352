//! Resource types served over ADS.
//!
//! `ResourceType` is the closed enumeration of everything a snapshot can
//! hold. Type URLs map to it bijectively; anything else is rejected with
//! [`Error::UnknownResourceType`].

use std::fmt;
use std::str::FromStr;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

use crate::xds::enforcer;
use crate::{Error, Result};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const CONFIG_TYPE_URL: &str = "type.googleapis.com/wso2.discovery.config.enforcer.Config";
pub const API_TYPE_URL: &str = "type.googleapis.com/wso2.discovery.api.Api";
pub const SUBSCRIPTION_LIST_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.subscription.SubscriptionList";
pub const APPLICATION_LIST_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.subscription.ApplicationList";
pub const API_LIST_TYPE_URL: &str = "type.googleapis.com/wso2.discovery.subscription.APIList";
pub const APPLICATION_POLICY_LIST_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.subscription.ApplicationPolicyList";
pub const SUBSCRIPTION_POLICY_LIST_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.subscription.SubscriptionPolicyList";
pub const APPLICATION_KEY_MAPPING_LIST_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.subscription.ApplicationKeyMappingList";
pub const KEY_MANAGER_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/wso2.discovery.keymgt.KeyManagerConfig";
pub const REVOKED_TOKENS_TYPE_URL: &str = "type.googleapis.com/wso2.discovery.keymgt.RevokedToken";
pub const THROTTLE_DATA_TYPE_URL: &str = "type.googleapis.com/wso2.discovery.throttle.ThrottleData";

/// Closed enumeration of snapshot resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cluster,
    Route,
    Listener,
    Endpoint,
    Config,
    Api,
    SubscriptionList,
    ApplicationList,
    ApiList,
    ApplicationPolicyList,
    SubscriptionPolicyList,
    ApplicationKeyMappingList,
    KeyManagerConfig,
    RevokedTokens,
    ThrottleData,
}

impl ResourceType {
    pub const ALL: [ResourceType; 15] = [
        ResourceType::Cluster,
        ResourceType::Route,
        ResourceType::Listener,
        ResourceType::Endpoint,
        ResourceType::Config,
        ResourceType::Api,
        ResourceType::SubscriptionList,
        ResourceType::ApplicationList,
        ResourceType::ApiList,
        ResourceType::ApplicationPolicyList,
        ResourceType::SubscriptionPolicyList,
        ResourceType::ApplicationKeyMappingList,
        ResourceType::KeyManagerConfig,
        ResourceType::RevokedTokens,
        ResourceType::ThrottleData,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Route => ROUTE_TYPE_URL,
            ResourceType::Listener => LISTENER_TYPE_URL,
            ResourceType::Endpoint => ENDPOINT_TYPE_URL,
            ResourceType::Config => CONFIG_TYPE_URL,
            ResourceType::Api => API_TYPE_URL,
            ResourceType::SubscriptionList => SUBSCRIPTION_LIST_TYPE_URL,
            ResourceType::ApplicationList => APPLICATION_LIST_TYPE_URL,
            ResourceType::ApiList => API_LIST_TYPE_URL,
            ResourceType::ApplicationPolicyList => APPLICATION_POLICY_LIST_TYPE_URL,
            ResourceType::SubscriptionPolicyList => SUBSCRIPTION_POLICY_LIST_TYPE_URL,
            ResourceType::ApplicationKeyMappingList => APPLICATION_KEY_MAPPING_LIST_TYPE_URL,
            ResourceType::KeyManagerConfig => KEY_MANAGER_CONFIG_TYPE_URL,
            ResourceType::RevokedTokens => REVOKED_TOKENS_TYPE_URL,
            ResourceType::ThrottleData => THROTTLE_DATA_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|ty| ty.type_url() == type_url)
            .ok_or_else(|| Error::UnknownResourceType(type_url.to_string()))
    }

    /// Resources consumed by the enforcer rather than Envoy
    pub fn is_enforcer(&self) -> bool {
        !matches!(
            self,
            ResourceType::Cluster
                | ResourceType::Route
                | ResourceType::Listener
                | ResourceType::Endpoint
        )
    }

    /// Types owned by label aggregation; everything else is published directly.
    pub fn is_aggregated(&self) -> bool {
        matches!(
            self,
            ResourceType::Cluster | ResourceType::Route | ResourceType::Listener | ResourceType::Api
        )
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl FromStr for ResourceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_type_url(s)
    }
}

/// Fixed names of singleton resources
pub mod names {
    pub const CONFIG: &str = "Config";
    pub const SUBSCRIPTION_LIST: &str = "SubscriptionList";
    pub const APPLICATION_LIST: &str = "ApplicationList";
    pub const API_LIST: &str = "APIList";
    pub const APPLICATION_POLICY_LIST: &str = "ApplicationPolicyList";
    pub const SUBSCRIPTION_POLICY_LIST: &str = "SubscriptionPolicyList";
    pub const APPLICATION_KEY_MAPPING_LIST: &str = "ApplicationKeyMappingList";
    pub const THROTTLE_DATA: &str = "ThrottleData";
}

/// A typed resource held in a snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum XdsResource {
    Cluster(Cluster),
    Route(RouteConfiguration),
    Listener(Listener),
    Endpoint(ClusterLoadAssignment),
    Config(enforcer::EnforcerConfig),
    Api(enforcer::Api),
    SubscriptionList(enforcer::SubscriptionList),
    ApplicationList(enforcer::ApplicationList),
    ApiList(enforcer::ApiList),
    ApplicationPolicyList(enforcer::ApplicationPolicyList),
    SubscriptionPolicyList(enforcer::SubscriptionPolicyList),
    ApplicationKeyMappingList(enforcer::ApplicationKeyMappingList),
    KeyManagerConfig(enforcer::KeyManagerConfig),
    RevokedToken(enforcer::RevokedToken),
    ThrottleData(enforcer::ThrottleData),
}

impl XdsResource {
    pub fn resource_type(&self) -> ResourceType {
        match self {
            XdsResource::Cluster(_) => ResourceType::Cluster,
            XdsResource::Route(_) => ResourceType::Route,
            XdsResource::Listener(_) => ResourceType::Listener,
            XdsResource::Endpoint(_) => ResourceType::Endpoint,
            XdsResource::Config(_) => ResourceType::Config,
            XdsResource::Api(_) => ResourceType::Api,
            XdsResource::SubscriptionList(_) => ResourceType::SubscriptionList,
            XdsResource::ApplicationList(_) => ResourceType::ApplicationList,
            XdsResource::ApiList(_) => ResourceType::ApiList,
            XdsResource::ApplicationPolicyList(_) => ResourceType::ApplicationPolicyList,
            XdsResource::SubscriptionPolicyList(_) => ResourceType::SubscriptionPolicyList,
            XdsResource::ApplicationKeyMappingList(_) => ResourceType::ApplicationKeyMappingList,
            XdsResource::KeyManagerConfig(_) => ResourceType::KeyManagerConfig,
            XdsResource::RevokedToken(_) => ResourceType::RevokedTokens,
            XdsResource::ThrottleData(_) => ResourceType::ThrottleData,
        }
    }

    /// Name of the resource within its collection.
    ///
    /// Envoy objects use their own name, API descriptors key by
    /// `vhost:basepath:version`, singletons use a fixed name and per-item
    /// enforcer types use their declared name.
    pub fn name(&self) -> String {
        match self {
            XdsResource::Cluster(cluster) => cluster.name.clone(),
            XdsResource::Route(route) => route.name.clone(),
            XdsResource::Listener(listener) => listener.name.clone(),
            XdsResource::Endpoint(assignment) => assignment.cluster_name.clone(),
            XdsResource::Api(api) => api_resource_name(&api.vhost, &api.base_path, &api.version),
            XdsResource::Config(_) => names::CONFIG.to_string(),
            XdsResource::SubscriptionList(_) => names::SUBSCRIPTION_LIST.to_string(),
            XdsResource::ApplicationList(_) => names::APPLICATION_LIST.to_string(),
            XdsResource::ApiList(_) => names::API_LIST.to_string(),
            XdsResource::ApplicationPolicyList(_) => names::APPLICATION_POLICY_LIST.to_string(),
            XdsResource::SubscriptionPolicyList(_) => names::SUBSCRIPTION_POLICY_LIST.to_string(),
            XdsResource::ApplicationKeyMappingList(_) => {
                names::APPLICATION_KEY_MAPPING_LIST.to_string()
            }
            XdsResource::ThrottleData(_) => names::THROTTLE_DATA.to_string(),
            XdsResource::KeyManagerConfig(config) => config.name.clone(),
            XdsResource::RevokedToken(token) => token.jti.clone(),
        }
    }

    pub fn to_any(&self) -> Any {
        let type_url = self.resource_type().type_url();
        let value = match self {
            XdsResource::Cluster(m) => m.encode_to_vec(),
            XdsResource::Route(m) => m.encode_to_vec(),
            XdsResource::Listener(m) => m.encode_to_vec(),
            XdsResource::Endpoint(m) => m.encode_to_vec(),
            XdsResource::Config(m) => m.encode_to_vec(),
            XdsResource::Api(m) => m.encode_to_vec(),
            XdsResource::SubscriptionList(m) => m.encode_to_vec(),
            XdsResource::ApplicationList(m) => m.encode_to_vec(),
            XdsResource::ApiList(m) => m.encode_to_vec(),
            XdsResource::ApplicationPolicyList(m) => m.encode_to_vec(),
            XdsResource::SubscriptionPolicyList(m) => m.encode_to_vec(),
            XdsResource::ApplicationKeyMappingList(m) => m.encode_to_vec(),
            XdsResource::KeyManagerConfig(m) => m.encode_to_vec(),
            XdsResource::RevokedToken(m) => m.encode_to_vec(),
            XdsResource::ThrottleData(m) => m.encode_to_vec(),
        };
        Any { type_url: type_url.to_string(), value }
    }
}

/// Network identity of an API descriptor
pub fn api_resource_name(vhost: &str, basepath: &str, version: &str) -> String {
    format!("{}:{}:{}", vhost, basepath, version)
}

/// Pack a message into `Any` under the given type URL.
pub fn any_from_message<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_urls_are_bijective() {
        let mut seen = std::collections::HashSet::new();
        for ty in ResourceType::ALL {
            assert!(seen.insert(ty.type_url()), "duplicate type url for {ty}");
            assert_eq!(ResourceType::from_type_url(ty.type_url()).unwrap(), ty);
        }
    }

    #[test]
    fn unknown_type_url_fails_fast() {
        let err = ResourceType::from_type_url("type.googleapis.com/envoy.config.Unknown").unwrap_err();
        assert!(matches!(err, Error::UnknownResourceType(_)));
        assert!(err.is_validation());
    }

    #[test]
    fn naming_is_per_kind() {
        let api = XdsResource::Api(enforcer::Api {
            vhost: "default".into(),
            base_path: "/pets".into(),
            version: "1.0.0".into(),
            ..Default::default()
        });
        assert_eq!(api.name(), "default:/pets:1.0.0");

        let config = XdsResource::Config(enforcer::EnforcerConfig::default());
        assert_eq!(config.name(), names::CONFIG);

        let token = XdsResource::RevokedToken(enforcer::RevokedToken {
            jti: "abc-123".into(),
            expiry_time: 0,
        });
        assert_eq!(token.name(), "abc-123");
        assert_eq!(token.resource_type(), ResourceType::RevokedTokens);

        let cluster = XdsResource::Cluster(Cluster { name: "c1".into(), ..Default::default() });
        assert_eq!(cluster.name(), "c1");
        assert_eq!(cluster.to_any().type_url, CLUSTER_TYPE_URL);
    }
}
