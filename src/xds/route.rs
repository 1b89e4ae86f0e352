//! Route construction using envoy-types
//!
//! Paths compile to anchored regular expressions: `{param}` segments match
//! one path segment and an optional query-string tail is allowed, so
//! `/pet/{id}` matches `/pet/5` and `/pet/5?x=1` but not `/pet/5/tags`.
//! Methods match the `:method` pseudo-header through an alternation.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier, route::Action, route_action::ClusterSpecifier,
    route_action::HostRewriteSpecifier, route_match::PathSpecifier, HeaderMatcher, Route,
    RouteAction, RouteMatch,
};
use envoy_types::pb::envoy::extensions::filters::http::ext_authz::v3::{
    ext_authz_per_route::Override, CheckSettings, ExtAuthzPerRoute,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{
    string_matcher::MatchPattern, RegexMatchAndSubstitute, RegexMatcher, StringMatcher,
};
use envoy_types::pb::google::protobuf::BoolValue;
use prost::Message;

use crate::xds::resources::any_from_message;

pub const EXT_AUTHZ_FILTER_NAME: &str = "envoy.filters.http.ext_authz";
pub const EXT_AUTHZ_PER_ROUTE_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthzPerRoute";

/// Context extension carrying the production cluster name
pub const PROD_CLUSTER_KEY: &str = "prodClusterName";
/// Context extension carrying the sandbox cluster name
pub const SAND_CLUSTER_KEY: &str = "sandClusterName";

const PATH_PARAM_REGEX: &str = "([^/]+)";
const QUERY_TAIL_REGEX: &str = "(\\?([^/]+))?";

/// Upstream chosen for one traffic class of a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterBinding {
    pub cluster_name: String,
    pub host: String,
    pub basepath: String,
}

/// Everything needed to emit one Envoy route
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub name: String,
    /// Externally visible path (basepath already applied)
    pub path: String,
    pub methods: Vec<String>,
    pub production: Option<ClusterBinding>,
    pub sandbox: Option<ClusterBinding>,
    /// Basepath override to rewrite back to the upstream's own basepath
    pub basepath_override: Option<String>,
    pub api_base_path: String,
    pub api_name: String,
    pub api_version: String,
    /// Let Envoy take the host from the upstream instead of a literal
    pub auto_host_rewrite: bool,
}

/// Join basepath and resource path into one normalized path.
pub fn join_path(basepath: &str, resource_path: &str) -> String {
    let joined = format!("/{}/{}", basepath.trim_matches('/'), resource_path.trim_start_matches('/'));
    let mut normalized = String::with_capacity(joined.len());
    let mut previous_slash = false;
    for ch in joined.chars() {
        if ch == '/' && previous_slash {
            continue;
        }
        previous_slash = ch == '/';
        normalized.push(ch);
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

/// Compile a normalized path to its anchored route regex.
pub fn path_regex(path: &str) -> String {
    let segments: Vec<String> = path
        .split('/')
        .map(|segment| {
            if segment.contains('{') || segment.contains('}') {
                PATH_PARAM_REGEX.to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect();
    format!("^{}{}$", segments.join("/"), QUERY_TAIL_REGEX)
}

/// Case-sensitive alternation of the declared methods.
pub fn method_regex(methods: &[String]) -> String {
    format!("^({})$", methods.join("|"))
}

/// Emit the route, or `None` when neither traffic class has an upstream.
pub fn build_route(spec: &RouteSpec, cluster_header: &str) -> Option<Route> {
    let route_match = RouteMatch {
        path_specifier: Some(PathSpecifier::SafeRegex(RegexMatcher {
            regex: path_regex(&spec.path),
            ..Default::default()
        })),
        headers: vec![regex_header_matcher(":method", &method_regex(&spec.methods))],
        ..Default::default()
    };

    let (cluster_specifier, primary) = match (&spec.production, &spec.sandbox) {
        (Some(production), Some(_)) => {
            (ClusterSpecifier::ClusterHeader(cluster_header.to_string()), production)
        }
        (Some(only), None) | (None, Some(only)) => {
            (ClusterSpecifier::Cluster(only.cluster_name.clone()), only)
        }
        (None, None) => return None,
    };

    let header_selected = spec.production.is_some() && spec.sandbox.is_some();
    let host_rewrite = if spec.auto_host_rewrite || header_selected {
        HostRewriteSpecifier::AutoHostRewrite(BoolValue { value: true })
    } else {
        HostRewriteSpecifier::HostRewriteLiteral(primary.host.clone())
    };

    #[allow(deprecated)]
    let mut action = RouteAction {
        cluster_specifier: Some(cluster_specifier),
        host_rewrite_specifier: Some(host_rewrite),
        ..Default::default()
    };

    if let Some(pattern) = spec.basepath_override.as_deref() {
        action.regex_rewrite = Some(RegexMatchAndSubstitute {
            pattern: Some(RegexMatcher {
                regex: format!("^{}", regex::escape(pattern)),
                ..Default::default()
            }),
            substitution: primary.basepath.clone(),
        });
    }

    Some(Route {
        name: spec.name.clone(),
        r#match: Some(route_match),
        action: Some(Action::Route(action)),
        typed_per_filter_config: HashMap::from([(
            EXT_AUTHZ_FILTER_NAME.to_string(),
            any_from_message(EXT_AUTHZ_PER_ROUTE_TYPE_URL, &authz_context(spec)),
        )]),
        ..Default::default()
    })
}

fn authz_context(spec: &RouteSpec) -> ExtAuthzPerRoute {
    let mut context = HashMap::from([
        ("path".to_string(), spec.path.clone()),
        ("basePath".to_string(), spec.api_base_path.clone()),
        ("method".to_string(), spec.methods.join(" ")),
        ("version".to_string(), spec.api_version.clone()),
        ("name".to_string(), spec.api_name.clone()),
    ]);
    if let Some(production) = &spec.production {
        context.insert(PROD_CLUSTER_KEY.to_string(), production.cluster_name.clone());
    }
    if let Some(sandbox) = &spec.sandbox {
        context.insert(SAND_CLUSTER_KEY.to_string(), sandbox.cluster_name.clone());
    }

    ExtAuthzPerRoute {
        r#override: Some(Override::CheckSettings(CheckSettings {
            context_extensions: context,
            ..Default::default()
        })),
    }
}

fn regex_header_matcher(name: &str, regex: &str) -> HeaderMatcher {
    HeaderMatcher {
        name: name.to_string(),
        header_match_specifier: Some(HeaderMatchSpecifier::StringMatch(StringMatcher {
            match_pattern: Some(MatchPattern::SafeRegex(RegexMatcher {
                regex: regex.to_string(),
                ..Default::default()
            })),
            ignore_case: false,
        })),
        invert_match: false,
        treat_missing_header_as_empty: false,
    }
}

/// Every cluster a route can send traffic to.
///
/// Header-selected routes are resolved through the cluster names recorded
/// in the route's authorization context. A header-selected route without a
/// readable context yields a `cluster_header:<name>` marker, which no
/// snapshot can satisfy.
pub fn referenced_clusters(route: &Route) -> Vec<String> {
    let Some(Action::Route(action)) = route.action.as_ref() else {
        return Vec::new();
    };

    match action.cluster_specifier.as_ref() {
        Some(ClusterSpecifier::Cluster(name)) => vec![name.clone()],
        Some(ClusterSpecifier::WeightedClusters(weighted)) => {
            weighted.clusters.iter().map(|c| c.name.clone()).collect()
        }
        Some(ClusterSpecifier::ClusterHeader(header)) => {
            let names = context_cluster_names(route);
            if names.is_empty() {
                vec![format!("cluster_header:{}", header)]
            } else {
                names
            }
        }
        _ => Vec::new(),
    }
}

fn context_cluster_names(route: &Route) -> Vec<String> {
    let Some(any) = route.typed_per_filter_config.get(EXT_AUTHZ_FILTER_NAME) else {
        return Vec::new();
    };
    let Ok(per_route) = ExtAuthzPerRoute::decode(any.value.as_slice()) else {
        return Vec::new();
    };
    let Some(Override::CheckSettings(settings)) = per_route.r#override else {
        return Vec::new();
    };

    [PROD_CLUSTER_KEY, SAND_CLUSTER_KEY]
        .iter()
        .filter_map(|key| settings.context_extensions.get(*key))
        .filter(|name| !name.is_empty())
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn binding(name: &str, basepath: &str) -> ClusterBinding {
        ClusterBinding { cluster_name: name.into(), host: "petstore.io".into(), basepath: basepath.into() }
    }

    fn route_spec(production: Option<ClusterBinding>, sandbox: Option<ClusterBinding>) -> RouteSpec {
        RouteSpec {
            name: "PetStore1.0.0_r1".into(),
            path: "/petstore/pet/{petId}".into(),
            methods: vec!["GET".into(), "POST".into()],
            production,
            sandbox,
            basepath_override: None,
            api_base_path: "/petstore".into(),
            api_name: "PetStore".into(),
            api_version: "1.0.0".into(),
            auto_host_rewrite: false,
        }
    }

    #[test]
    fn join_path_normalizes_slashes() {
        assert_eq!(join_path("/v2/", "/pet/"), "/v2/pet");
        assert_eq!(join_path("", "/pet"), "/pet");
        assert_eq!(join_path("v2", "pet//{id}"), "/v2/pet/{id}");
        assert_eq!(join_path("", "/"), "/");
    }

    #[test]
    fn path_regex_matches_parameters_and_query() {
        let single = Regex::new(&path_regex("/v2/pet/{petId}")).unwrap();
        assert!(single.is_match("/v2/pet/5"));
        assert!(single.is_match("/v2/pet/5?x=1"));
        assert!(!single.is_match("/v2/pet/5/test"));
        assert!(!single.is_match("/v2/pet"));

        let repeated = Regex::new(&path_regex("/v2/pet/{petId}/tst/{petId}")).unwrap();
        assert!(repeated.is_match("/v2/pet/5/tst/3"));
    }

    #[test]
    fn literal_segments_are_escaped() {
        let regex = Regex::new(&path_regex("/v1.0/items")).unwrap();
        assert!(regex.is_match("/v1.0/items"));
        assert!(!regex.is_match("/v1x0/items"));
    }

    #[test]
    fn method_alternation_is_case_sensitive() {
        let regex = Regex::new(&method_regex(&["GET".into(), "POST".into()])).unwrap();
        assert!(regex.is_match("GET"));
        assert!(regex.is_match("POST"));
        assert!(!regex.is_match("get"));
        assert!(!regex.is_match("PUT"));
    }

    #[test]
    fn single_class_binds_cluster_directly() {
        let route = build_route(&route_spec(Some(binding("prod", "/v2")), None), "x-cluster").unwrap();
        let Some(Action::Route(action)) = route.action.as_ref() else { panic!("route action") };
        assert_eq!(action.cluster_specifier, Some(ClusterSpecifier::Cluster("prod".into())));
        assert_eq!(
            action.host_rewrite_specifier,
            Some(HostRewriteSpecifier::HostRewriteLiteral("petstore.io".into()))
        );
        assert_eq!(referenced_clusters(&route), vec!["prod".to_string()]);
    }

    #[test]
    fn both_classes_defer_to_cluster_header() {
        let route = build_route(
            &route_spec(Some(binding("prod", "/v2")), Some(binding("sand", "/v2"))),
            "x-cluster",
        )
        .unwrap();
        let Some(Action::Route(action)) = route.action.as_ref() else { panic!("route action") };
        assert_eq!(
            action.cluster_specifier,
            Some(ClusterSpecifier::ClusterHeader("x-cluster".into()))
        );
        assert_eq!(referenced_clusters(&route), vec!["prod".to_string(), "sand".to_string()]);
    }

    #[test]
    fn basepath_override_rewrites_to_endpoint_basepath() {
        let mut with_override = route_spec(Some(binding("prod", "/v2")), None);
        with_override.basepath_override = Some("/petstore".into());
        let route = build_route(&with_override, "x-cluster").unwrap();
        let Some(Action::Route(action)) = route.action.as_ref() else { panic!("route action") };
        let rewrite = action.regex_rewrite.as_ref().unwrap();
        assert_eq!(rewrite.pattern.as_ref().unwrap().regex, "^/petstore");
        assert_eq!(rewrite.substitution, "/v2");
    }

    #[test]
    fn no_upstream_means_no_route() {
        assert!(build_route(&route_spec(None, None), "x-cluster").is_none());
    }

    #[test]
    fn header_route_without_context_is_unresolvable() {
        let mut route = build_route(
            &route_spec(Some(binding("prod", "/v2")), Some(binding("sand", "/v2"))),
            "x-cluster",
        )
        .unwrap();
        route.typed_per_filter_config.clear();
        assert_eq!(referenced_clusters(&route), vec!["cluster_header:x-cluster".to_string()]);
    }
}
