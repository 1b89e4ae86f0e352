//! Registry query syntax.
//!
//! A registry-resolved upstream is described as
//! `[dc1,dc2].namespace.service.[tag1,tag2]`. Datacenters, namespace and
//! tags are optional, so `service`, `ns.service`, `[dc1].service` and
//! `service.[tag]` are all valid.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};

/// What to ask the registry for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryQuery {
    #[serde(default)]
    pub datacenters: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub service_name: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One resolved upstream instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Upstream {
    pub address: String,
    pub port: u16,
}

impl Upstream {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self { address: address.into(), port }
    }
}

impl RegistryQuery {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let segments = split_segments(raw)?;
        if segments.is_empty() {
            return Err(Error::validation(format!("empty registry query '{}'", raw)));
        }

        let mut query = RegistryQuery::default();
        let mut plain: Vec<&str> = Vec::new();
        let last = segments.len() - 1;

        for (index, segment) in segments.iter().enumerate() {
            match bracket_list(segment) {
                Some(items) if index == 0 && last > 0 => query.datacenters = items,
                Some(items) if index == last && index > 0 => query.tags = items,
                Some(_) => {
                    return Err(Error::validation(format!(
                        "unexpected list '{}' in registry query '{}'",
                        segment, raw
                    )))
                }
                None => plain.push(segment),
            }
        }

        match plain.as_slice() {
            [service] => query.service_name = service.to_string(),
            [namespace, service] => {
                query.namespace = Some(namespace.to_string());
                query.service_name = service.to_string();
            }
            _ => {
                return Err(Error::validation(format!(
                    "registry query '{}' must name exactly one service",
                    raw
                )))
            }
        }

        if query.service_name.is_empty() {
            return Err(Error::validation(format!("registry query '{}' has no service name", raw)));
        }

        Ok(query)
    }
}

impl fmt::Display for RegistryQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.datacenters.is_empty() {
            parts.push(format!("[{}]", self.datacenters.join(",")));
        }
        if let Some(namespace) = &self.namespace {
            parts.push(namespace.clone());
        }
        parts.push(self.service_name.clone());
        if !self.tags.is_empty() {
            parts.push(format!("[{}]", self.tags.join(",")));
        }
        write!(f, "{}", parts.join("."))
    }
}

// Splits on '.' outside of brackets.
fn split_segments(raw: &str) -> Result<Vec<&str>> {
    let mut segments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (index, ch) in raw.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| {
                    Error::validation(format!("unbalanced ']' in registry query '{}'", raw))
                })?
            }
            '.' if depth == 0 => {
                segments.push(raw[start..index].trim());
                start = index + 1;
            }
            _ => {}
        }
    }

    if depth != 0 {
        return Err(Error::validation(format!("unbalanced '[' in registry query '{}'", raw)));
    }
    segments.push(raw[start..].trim());

    if segments.iter().any(|s| s.is_empty()) {
        return Err(Error::validation(format!("empty segment in registry query '{}'", raw)));
    }

    Ok(segments)
}

fn bracket_list(segment: &str) -> Option<Vec<String>> {
    let inner = segment.strip_prefix('[')?.strip_suffix(']')?;
    Some(
        inner
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect(),
    )
}
