//! Capability descriptors and the deny-list.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DenyListConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl HttpMethod {
    /// Parse a lowercase OpenAPI path-item key.  Other keys
    /// (`parameters`, `head`, `options`, …) are not operations we expose.
    pub fn from_openapi(key: &str) -> Option<Self> {
        match key.to_ascii_lowercase().as_str() {
            "get" => Some(Self::Get),
            "post" => Some(Self::Post),
            "put" => Some(Self::Put),
            "delete" => Some(Self::Delete),
            "patch" => Some(Self::Patch),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
        }
    }

    /// GET and DELETE carry their parameters in the query string.
    pub fn uses_query(&self) -> bool {
        matches!(self, Self::Get | Self::Delete)
    }

    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Put => reqwest::Method::PUT,
            Self::Delete => reqwest::Method::DELETE,
            Self::Patch => reqwest::Method::PATCH,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Path,
    Query,
    Body,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    /// JSON schema type (`string`, `integer`, …).
    pub ty: String,
    #[serde(default)]
    pub format: Option<String>,
    pub required: bool,
    /// Filled from the caller's identity, never by the model.
    pub auto_inject: bool,
    #[serde(default)]
    pub description: String,
}

/// A remote operation the relay can invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub operation_id: String,
    pub service: String,
    pub method: HttpMethod,
    /// Full path template including the base path, e.g. `/fleet/cars/{id}`.
    pub path: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub required_params: Vec<String>,
    pub auto_inject: Vec<String>,
    pub embedding_text: String,
    /// Function-calling schema exposing only user-supplied parameters.
    pub call_schema: serde_json::Value,
    #[serde(default)]
    pub content_hash: String,
}

impl CapabilityDescriptor {
    /// SHA-256 (hex) over the canonical JSON of everything but the hash.
    pub fn compute_hash(&self) -> String {
        let mut unhashed = self.clone();
        unhashed.content_hash.clear();
        // serde_json maps are BTreeMap-backed, so key order is stable.
        let canonical = serde_json::to_vec(&unhashed).unwrap_or_default();
        sha256_hex(&canonical)
    }

    /// Set `content_hash` from the current contents.
    pub fn sealed(mut self) -> Self {
        self.content_hash = self.compute_hash();
        self
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    digest
        .as_ref()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

// ---------------------------------------------------------------------------
// Deny-list
// ---------------------------------------------------------------------------

/// Operations that must never be offered, by exact id or by substring.
#[derive(Debug, Clone, Default)]
pub struct DenyList {
    names: HashSet<String>,
    patterns: Vec<String>,
}

impl DenyList {
    pub fn from_config(cfg: &DenyListConfig) -> Self {
        Self {
            names: cfg.names.iter().cloned().collect(),
            patterns: cfg.patterns.iter().map(|p| p.to_lowercase()).collect(),
        }
    }

    /// Exact id match, or a case-insensitive pattern in the id or path.
    pub fn is_denied(&self, operation_id: &str, path: &str) -> bool {
        if self.names.contains(operation_id) {
            return true;
        }
        let combined = format!("{} {}", operation_id.to_lowercase(), path.to_lowercase());
        self.patterns.iter().any(|p| combined.contains(p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> CapabilityDescriptor {
        CapabilityDescriptor {
            operation_id: "get_cars".into(),
            service: "fleet".into(),
            method: HttpMethod::Get,
            path: "/fleet/cars".into(),
            description: "List cars".into(),
            params: vec![],
            required_params: vec![],
            auto_inject: vec![],
            embedding_text: "get_cars [fleet] GET /fleet/cars. List cars".into(),
            call_schema: serde_json::json!({}),
            content_hash: String::new(),
        }
    }

    #[test]
    fn hash_ignores_previous_hash_and_tracks_content() {
        let a = descriptor().sealed();
        assert_eq!(a.content_hash.len(), 64);
        assert_eq!(a.compute_hash(), a.content_hash);

        let mut b = descriptor();
        b.description = "List all cars".into();
        assert_ne!(b.sealed().content_hash, a.content_hash);
    }

    #[test]
    fn deny_list_matches_names_and_patterns() {
        let deny = DenyList::from_config(&DenyListConfig::default());
        assert!(deny.is_denied("post_Batch", "/x"));
        assert!(deny.is_denied("get_CarsExport", "/cars"));
        assert!(deny.is_denied("get_things", "/odata/things"));
        assert!(!deny.is_denied("get_cars", "/fleet/cars"));
        // exact names are case sensitive
        assert!(!deny.is_denied("post_booking", "/b"));
    }

    #[test]
    fn method_parsing() {
        assert_eq!(HttpMethod::from_openapi("PATCH"), Some(HttpMethod::Patch));
        assert_eq!(HttpMethod::from_openapi("parameters"), None);
        assert!(HttpMethod::Delete.uses_query());
        assert!(!HttpMethod::Put.uses_query());
    }
}
