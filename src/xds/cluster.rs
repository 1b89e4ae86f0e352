//! Cluster construction using envoy-types
//!
//! Clusters resolve hostnames with STRICT_DNS (IPv4 only) and use static
//! discovery when every address is an IP literal. TLS upstreams verify
//! against the configured CA bundle with SNI set to the endpoint host.

use std::collections::HashMap;
use std::net::IpAddr;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, DnsLookupFamily, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::{
    address, data_source::Specifier, socket_address, Address, DataSource, Http2ProtocolOptions,
    SocketAddress, TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint, ClusterLoadAssignment, Endpoint as EnvoyEndpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::ValidationContextType, CertificateValidationContext, CommonTlsContext,
    UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions,
};
use envoy_types::pb::google::protobuf::{Any, Duration};
use tracing::debug;

use crate::config::EnvoyConfig;
use crate::discovery::Upstream;
use crate::domain::Endpoint;
use crate::xds::resources::any_from_message;

pub const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Build the cluster serving one endpoint.
pub fn build_cluster(name: &str, endpoint: &Endpoint, envoy: &EnvoyConfig) -> Cluster {
    let upstreams = [Upstream::new(endpoint.host.clone(), endpoint.port)];
    let mut cluster = Cluster {
        name: name.to_string(),
        connect_timeout: Some(seconds_to_duration(envoy.connect_timeout_seconds)),
        lb_policy: LbPolicy::RoundRobin as i32,
        ..Default::default()
    };
    set_upstreams(&mut cluster, &upstreams);

    if endpoint.url_type.is_secure() {
        cluster.transport_socket = Some(upstream_tls_socket(&endpoint.host, &envoy.ca_cert_path));
    }

    debug!(
        cluster = %name,
        endpoint = %endpoint,
        tls = endpoint.url_type.is_secure(),
        "Built upstream cluster"
    );

    cluster
}

/// Cluster for the gRPC authorization service referenced by the listener.
pub fn build_enforcer_cluster(envoy: &EnvoyConfig) -> Cluster {
    let upstreams = [Upstream::new(envoy.enforcer_host.clone(), envoy.enforcer_port)];
    let mut cluster = Cluster {
        name: envoy.enforcer_cluster_name.clone(),
        connect_timeout: Some(seconds_to_duration(envoy.connect_timeout_seconds)),
        lb_policy: LbPolicy::RoundRobin as i32,
        typed_extension_protocol_options: http2_protocol_options(),
        ..Default::default()
    };
    set_upstreams(&mut cluster, &upstreams);
    cluster
}

/// Replace the cluster's endpoint list, keeping every other setting.
///
/// The discovery type follows the new addresses: static when all of them
/// are IP literals, STRICT_DNS otherwise.
pub fn set_upstreams(cluster: &mut Cluster, upstreams: &[Upstream]) {
    let all_ips = upstreams.iter().all(|u| u.address.parse::<IpAddr>().is_ok());
    if all_ips {
        cluster.cluster_discovery_type =
            Some(ClusterDiscoveryType::Type(DiscoveryType::Static as i32));
        cluster.dns_lookup_family = DnsLookupFamily::Auto as i32;
    } else {
        cluster.cluster_discovery_type =
            Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
        cluster.dns_lookup_family = DnsLookupFamily::V4Only as i32;
    }
    cluster.load_assignment = Some(load_assignment(&cluster.name, upstreams));
}

pub fn load_assignment(cluster_name: &str, upstreams: &[Upstream]) -> ClusterLoadAssignment {
    let lb_endpoints = upstreams
        .iter()
        .map(|upstream| LbEndpoint {
            host_identifier: Some(lb_endpoint::HostIdentifier::Endpoint(EnvoyEndpoint {
                address: Some(socket_address(&upstream.address, upstream.port)),
                ..Default::default()
            })),
            ..Default::default()
        })
        .collect();

    ClusterLoadAssignment {
        cluster_name: cluster_name.to_string(),
        endpoints: vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }],
        ..Default::default()
    }
}

pub fn socket_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(address::Address::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(socket_address::PortSpecifier::PortValue(u32::from(port))),
            protocol: socket_address::Protocol::Tcp as i32,
            ..Default::default()
        })),
    }
}

/// Addresses currently assigned to a cluster, in load-assignment order.
pub fn cluster_upstreams(cluster: &Cluster) -> Vec<Upstream> {
    let Some(assignment) = cluster.load_assignment.as_ref() else {
        return Vec::new();
    };
    assignment
        .endpoints
        .iter()
        .flat_map(|locality| locality.lb_endpoints.iter())
        .filter_map(|lb| match lb.host_identifier.as_ref()? {
            lb_endpoint::HostIdentifier::Endpoint(endpoint) => endpoint.address.as_ref(),
            _ => None,
        })
        .filter_map(|address| match address.address.as_ref()? {
            address::Address::SocketAddress(socket) => match socket.port_specifier {
                Some(socket_address::PortSpecifier::PortValue(port)) => {
                    Some(Upstream::new(socket.address.clone(), u16::try_from(port).ok()?))
                }
                _ => None,
            },
            _ => None,
        })
        .collect()
}

fn upstream_tls_socket(sni: &str, ca_cert_path: &str) -> TransportSocket {
    let tls_context = UpstreamTlsContext {
        sni: sni.to_string(),
        common_tls_context: Some(CommonTlsContext {
            validation_context_type: Some(ValidationContextType::ValidationContext(
                CertificateValidationContext {
                    trusted_ca: Some(DataSource {
                        specifier: Some(Specifier::Filename(ca_cert_path.to_string())),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )),
            ..Default::default()
        }),
        ..Default::default()
    };

    TransportSocket {
        name: "envoy.transport_sockets.tls".to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            UPSTREAM_TLS_TYPE_URL,
            &tls_context,
        ))),
    }
}

fn http2_protocol_options() -> HashMap<String, Any> {
    let options = HttpProtocolOptions {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig {
                protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(
                    Http2ProtocolOptions::default(),
                )),
            },
        )),
        ..Default::default()
    };

    HashMap::from([(
        "envoy.extensions.upstreams.http.v3.HttpProtocolOptions".to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    )])
}

fn seconds_to_duration(value: u64) -> Duration {
    Duration { seconds: value as i64, nanos: 0 }
}
