//! Enforcer resource messages
//!
//! Protobuf payloads served to the enforcer (the external authorization
//! service sitting beside each proxy). They travel over the same ADS
//! stream as the Envoy resources, keyed by their own type URLs.

use std::collections::BTreeMap;

/// Global enforcer settings
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EnforcerConfig {
    /// Header the enforcer sets to pick production or sandbox at request time
    #[prost(string, tag = "1")]
    pub cluster_header_name: String,
    #[prost(string, tag = "2")]
    pub virtual_host: String,
    #[prost(string, tag = "3")]
    pub auth_header_name: String,
}

/// Per-API descriptor used by the enforcer to authorize requests
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Api {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub title: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub api_type: String,
    #[prost(string, tag = "5")]
    pub base_path: String,
    #[prost(string, tag = "6")]
    pub vhost: String,
    #[prost(message, repeated, tag = "7")]
    pub resources: Vec<ApiResource>,
    #[prost(string, tag = "8")]
    pub production_cluster: String,
    #[prost(string, tag = "9")]
    pub sandbox_cluster: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiResource {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub path: String,
    #[prost(string, repeated, tag = "3")]
    pub methods: Vec<String>,
    #[prost(string, tag = "4")]
    pub production_cluster: String,
    #[prost(string, tag = "5")]
    pub sandbox_cluster: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Subscription {
    #[prost(string, tag = "1")]
    pub subscription_id: String,
    #[prost(string, tag = "2")]
    pub api_ref: String,
    #[prost(string, tag = "3")]
    pub app_ref: String,
    #[prost(string, tag = "4")]
    pub policy_id: String,
    #[prost(string, tag = "5")]
    pub status: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<Subscription>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Application {
    #[prost(string, tag = "1")]
    pub uuid: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub owner: String,
    #[prost(string, tag = "4")]
    pub policy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<Application>,
}

/// Entry of the subscribable API list
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiListEntry {
    #[prost(string, tag = "1")]
    pub api_id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub version: String,
    #[prost(string, tag = "4")]
    pub context: String,
    #[prost(string, tag = "5")]
    pub policy: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApiList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<ApiListEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationPolicy {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub quota_type: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationPolicyList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<ApplicationPolicy>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionPolicy {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(int32, tag = "3")]
    pub rate_limit_count: i32,
    #[prost(string, tag = "4")]
    pub rate_limit_time_unit: String,
    #[prost(bool, tag = "5")]
    pub stop_on_quota_reach: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SubscriptionPolicyList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<SubscriptionPolicy>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationKeyMapping {
    #[prost(string, tag = "1")]
    pub consumer_key: String,
    #[prost(string, tag = "2")]
    pub key_type: String,
    #[prost(string, tag = "3")]
    pub application_uuid: String,
    #[prost(string, tag = "4")]
    pub key_manager: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ApplicationKeyMappingList {
    #[prost(message, repeated, tag = "1")]
    pub list: Vec<ApplicationKeyMapping>,
}

/// Token issuer configuration, one resource per key manager
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyManagerConfig {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(bool, tag = "3")]
    pub enabled: bool,
    #[prost(btree_map = "string, string", tag = "4")]
    pub configuration: BTreeMap<String, String>,
}

/// Revoked token, one resource per JWT id
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RevokedToken {
    #[prost(string, tag = "1")]
    pub jti: String,
    #[prost(int64, tag = "2")]
    pub expiry_time: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct BlockingCondition {
    #[prost(string, tag = "1")]
    pub condition_id: String,
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(string, tag = "3")]
    pub value: String,
    #[prost(bool, tag = "4")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ThrottleData {
    #[prost(message, repeated, tag = "1")]
    pub blocking_conditions: Vec<BlockingCondition>,
    #[prost(string, repeated, tag = "2")]
    pub key_templates: Vec<String>,
}
