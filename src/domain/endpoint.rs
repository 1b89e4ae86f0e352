//! Upstream endpoint domain types
//!
//! An endpoint is parsed from a URL such as `https://petstore.io:8443/v2`.
//! Registry-resolved endpoints use `consul(<query>,<default-url>)`; the
//! default URL is served until the first registry result arrives.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::discovery::RegistryQuery;
use crate::errors::{Error, Result};

/// Scheme of an upstream endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UrlType {
    Http,
    Https,
    Ws,
    Wss,
}

impl UrlType {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlType::Http => "http",
            UrlType::Https => "https",
            UrlType::Ws => "ws",
            UrlType::Wss => "wss",
        }
    }

    /// Port used when the URL does not carry one
    pub fn default_port(&self) -> u16 {
        if self.is_secure() {
            443
        } else {
            80
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, UrlType::Https | UrlType::Wss)
    }
}

impl fmt::Display for UrlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for UrlType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(UrlType::Http),
            "https" => Ok(UrlType::Https),
            "ws" => Ok(UrlType::Ws),
            "wss" => Ok(UrlType::Wss),
            other => Err(Error::validation(format!("unsupported endpoint scheme '{}'", other))),
        }
    }
}

/// One upstream target of an API or resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "EndpointRepr")]
pub struct Endpoint {
    pub host: String,
    /// Path prefix on the upstream, without trailing slash ("" for root)
    pub basepath: String,
    pub url_type: UrlType,
    pub port: u16,
    /// Present when the upstream set is resolved from the service registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_query: Option<RegistryQuery>,
}

impl Endpoint {
    /// Parse a static URL or a `consul(<query>,<default-url>)` expression.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if let Some(inner) = raw.strip_prefix("consul(").and_then(|rest| rest.strip_suffix(')')) {
            let (query, default_url) = inner.rsplit_once(',').ok_or_else(|| {
                Error::validation(format!(
                    "registry endpoint '{}' must be consul(<query>,<default-url>)",
                    raw
                ))
            })?;
            let mut endpoint = Self::parse_url(default_url.trim())?;
            endpoint.registry_query = Some(RegistryQuery::parse(query)?);
            return Ok(endpoint);
        }
        Self::parse_url(raw)
    }

    fn parse_url(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| Error::validation(format!("invalid endpoint URL '{}': {}", raw, e)))?;
        let url_type: UrlType = url.scheme().parse()?;
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::validation(format!("endpoint URL '{}' has no host", raw)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
        let port = url.port().unwrap_or_else(|| url_type.default_port());
        let basepath = url.path().trim_end_matches('/').to_string();

        Ok(Self { host, basepath, url_type, port, registry_query: None })
    }

    pub fn is_registry_resolved(&self) -> bool {
        self.registry_query.is_some()
    }

    pub fn url(&self) -> String {
        format!("{}://{}:{}{}", self.url_type, self.host, self.port, self.basepath)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.registry_query {
            Some(query) => write!(f, "consul({},{})", query, self.url()),
            None => write!(f, "{}", self.url()),
        }
    }
}

/// Definition files may give an endpoint as a URL string or as fields.
#[derive(Deserialize)]
#[serde(untagged)]
enum EndpointRepr {
    Url(String),
    Fields(EndpointFields),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndpointFields {
    host: String,
    #[serde(default)]
    basepath: String,
    url_type: UrlType,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    registry_query: Option<RegistryQuery>,
}

impl TryFrom<EndpointRepr> for Endpoint {
    type Error = Error;

    fn try_from(repr: EndpointRepr) -> Result<Self> {
        match repr {
            EndpointRepr::Url(raw) => Endpoint::parse(&raw),
            EndpointRepr::Fields(fields) => {
                if fields.host.trim().is_empty() {
                    return Err(Error::validation("endpoint host cannot be empty"));
                }
                Ok(Endpoint {
                    port: fields.port.unwrap_or_else(|| fields.url_type.default_port()),
                    host: fields.host,
                    basepath: fields.basepath.trim_end_matches('/').to_string(),
                    url_type: fields.url_type,
                    registry_query: fields.registry_query,
                })
            }
        }
    }
}
