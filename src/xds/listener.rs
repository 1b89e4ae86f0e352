//! Listener and route configuration for a label.
//!
//! Every label gets one listener whose HTTP connection manager loads its
//! routes over RDS (through ADS), runs the external authorization filter
//! and then the router. The route configuration holds a single virtual
//! host whose route list is replaced in place on later aggregations.

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, grpc_service, AggregatedConfigSource, ApiVersion,
    ConfigSource, GrpcService,
};
use envoy_types::pb::envoy::config::listener::v3::{filter, Filter, FilterChain, Listener};
use envoy_types::pb::envoy::config::route::v3::{Route, RouteConfiguration, VirtualHost};
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::{
    ext_authz::Services, ExtAuthz,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router as RouterFilter;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier, UpgradeConfig},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::google::protobuf::Duration;
use prost::Message;

use crate::config::EnvoyConfig;
use crate::xds::cluster::socket_address;
use crate::xds::resources::any_from_message;
use crate::xds::route::EXT_AUTHZ_FILTER_NAME;

pub const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
pub const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
pub const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

pub fn build_listener(envoy: &EnvoyConfig) -> Listener {
    let hcm = HttpConnectionManager {
        codec_type: CodecType::Auto as i32,
        stat_prefix: "ingress_http".to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            route_config_name: envoy.route_config_name.clone(),
            config_source: Some(ConfigSource {
                config_source_specifier: Some(ConfigSourceSpecifier::Ads(
                    AggregatedConfigSource::default(),
                )),
                resource_api_version: ApiVersion::V3 as i32,
                ..Default::default()
            }),
        })),
        http_filters: vec![ext_authz_filter(envoy), router_filter()],
        upgrade_configs: vec![UpgradeConfig {
            upgrade_type: "websocket".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    Listener {
        name: envoy.listener_name.clone(),
        address: Some(socket_address(&envoy.listener_address, envoy.listener_port)),
        filter_chains: vec![FilterChain {
            filters: vec![Filter {
                name: HCM_FILTER_NAME.to_string(),
                config_type: Some(filter::ConfigType::TypedConfig(any_from_message(
                    HCM_TYPE_URL,
                    &hcm,
                ))),
            }],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub fn build_route_configuration(envoy: &EnvoyConfig, routes: Vec<Route>) -> RouteConfiguration {
    RouteConfiguration {
        name: envoy.route_config_name.clone(),
        virtual_hosts: vec![VirtualHost {
            name: envoy.virtual_host.clone(),
            domains: vec!["*".to_string()],
            routes,
            ..Default::default()
        }],
        // The selection header must not reach the upstream
        request_headers_to_remove: vec![envoy.cluster_header_name.clone()],
        ..Default::default()
    }
}

/// Swap the route list of an already built route configuration.
pub fn replace_routes(route_config: &mut RouteConfiguration, routes: Vec<Route>) {
    match route_config.virtual_hosts.first_mut() {
        Some(vhost) => vhost.routes = routes,
        None => route_config.virtual_hosts.push(VirtualHost {
            name: "default".to_string(),
            domains: vec!["*".to_string()],
            routes,
            ..Default::default()
        }),
    }
}

/// Route configuration names the listener loads over RDS.
pub fn rds_route_config_names(listener: &Listener) -> Vec<String> {
    listener
        .filter_chains
        .iter()
        .flat_map(|chain| chain.filters.iter())
        .filter(|f| f.name == HCM_FILTER_NAME)
        .filter_map(|f| match f.config_type.as_ref()? {
            filter::ConfigType::TypedConfig(any) => {
                HttpConnectionManager::decode(any.value.as_slice()).ok()
            }
            _ => None,
        })
        .filter_map(|hcm| match hcm.route_specifier? {
            RouteSpecifier::Rds(rds) => Some(rds.route_config_name),
            _ => None,
        })
        .collect()
}

fn ext_authz_filter(envoy: &EnvoyConfig) -> HttpFilter {
    let timeout = Duration {
        seconds: (envoy.enforcer_timeout_millis / 1000) as i64,
        nanos: ((envoy.enforcer_timeout_millis % 1000) * 1_000_000) as i32,
    };

    let ext_authz = ExtAuthz {
        services: Some(Services::GrpcService(GrpcService {
            target_specifier: Some(grpc_service::TargetSpecifier::EnvoyGrpc(
                grpc_service::EnvoyGrpc {
                    cluster_name: envoy.enforcer_cluster_name.clone(),
                    ..Default::default()
                },
            )),
            timeout: Some(timeout),
            ..Default::default()
        })),
        transport_api_version: ApiVersion::V3 as i32,
        failure_mode_allow: false,
        ..Default::default()
    };

    HttpFilter {
        name: EXT_AUTHZ_FILTER_NAME.to_string(),
        is_optional: false,
        disabled: false,
        config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
            EXT_AUTHZ_TYPE_URL,
            &ext_authz,
        ))),
    }
}

fn router_filter() -> HttpFilter {
    HttpFilter {
        name: ROUTER_FILTER_NAME.to_string(),
        is_optional: false,
        disabled: false,
        config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
            ROUTER_TYPE_URL,
            &RouterFilter::default(),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_loads_routes_over_ads() {
        let config = EnvoyConfig::default();
        let listener = build_listener(&config);
        assert_eq!(listener.name, "default");
        assert_eq!(rds_route_config_names(&listener), vec![config.route_config_name.clone()]);
    }

    #[test]
    fn authz_runs_before_router() {
        let listener = build_listener(&EnvoyConfig::default());
        let filter::ConfigType::TypedConfig(any) =
            listener.filter_chains[0].filters[0].config_type.clone().unwrap()
        else {
            panic!("typed config expected");
        };
        let hcm = HttpConnectionManager::decode(any.value.as_slice()).unwrap();
        let names: Vec<_> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![EXT_AUTHZ_FILTER_NAME, ROUTER_FILTER_NAME]);
    }

    #[test]
    fn replace_routes_mutates_in_place() {
        let config = EnvoyConfig::default();
        let mut route_config = build_route_configuration(&config, Vec::new());
        replace_routes(&mut route_config, vec![Route { name: "r1".into(), ..Default::default() }]);
        assert_eq!(route_config.virtual_hosts.len(), 1);
        assert_eq!(route_config.virtual_hosts[0].routes[0].name, "r1");
        assert_eq!(route_config.request_headers_to_remove, vec![config.cluster_header_name]);
    }
}
