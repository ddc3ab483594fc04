//! OpenAPI / Swagger ingestion.
//!
//! Turns a JSON API description into [`CapabilityDescriptor`]s: one per
//! exposed operation, with identity parameters marked for auto-injection
//! and a function-calling schema that only shows what a user can supply.

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::descriptor::{CapabilityDescriptor, DenyList, HttpMethod, ParamKind, ParamSpec};
use crate::utils::cap_chars;

const MAX_DESCRIPTION_CHARS: usize = 1000;
const MAX_PARAM_DESCRIPTION_CHARS: usize = 200;
const MAX_EMBEDDING_TEXT_CHARS: usize = 1000;
const DATE_TIME_HINT: &str = " (ISO 8601: YYYY-MM-DDTHH:MM:SS)";

/// Query/path parameters filled from the caller's identity.
const INJECTED_PARAMS: &[&str] = &["personid", "assignedtoid", "tenantid", "driverid"];
/// Body properties filled from the caller's identity.
const INJECTED_BODY_PROPS: &[&str] = &["personid", "assignedtoid", "tenantid", "vehicleid", "driverid"];
/// Body properties the server sets itself.
const DROPPED_BODY_PROPS: &[&str] = &["createdat", "createdby"];
/// Parameters carried as headers by the gateway.
const HEADER_PARAMS: &[&str] = &["x-tenant", "authorization"];

fn is_one_of(name: &str, set: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    set.contains(&lower.as_str())
}

// ---------------------------------------------------------------------------
// Fetching
// ---------------------------------------------------------------------------

/// GET a JSON document, retrying up to `attempts` times with `pause`
/// between tries.
pub async fn fetch_document(
    client: &Client,
    url: &str,
    attempts: u32,
    pause: Duration,
) -> anyhow::Result<Value> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match fetch_once(client, url).await {
            Ok(doc) => return Ok(doc),
            Err(e) => {
                warn!(url, attempt, error = %e, "API description fetch failed");
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(pause).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("no fetch attempted")))
        .with_context(|| format!("fetch {url} failed after {attempts} attempts"))
}

async fn fetch_once(client: &Client, url: &str) -> anyhow::Result<Value> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        anyhow::bail!("{url} returned {status}");
    }
    let doc: Value = resp.json().await.context("response is not JSON")?;
    if !doc.get("paths").is_some_and(Value::is_object) {
        anyhow::bail!("{url} has no paths object");
    }
    Ok(doc)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Derive descriptors from a parsed document, skipping denied operations.
/// Duplicate ids are left for the caller to detect.
pub fn parse_document(service: &str, doc: &Value, deny: &DenyList) -> Vec<CapabilityDescriptor> {
    let Some(paths) = doc.get("paths").and_then(Value::as_object) else {
        return Vec::new();
    };
    let prefix = base_path(doc).unwrap_or_else(|| format!("/{service}"));

    let mut out = Vec::new();
    for (path, item) in paths {
        let Some(item) = item.as_object() else {
            continue;
        };
        let shared_params = item.get("parameters").and_then(Value::as_array);
        for (key, op) in item {
            let Some(method) = HttpMethod::from_openapi(key) else {
                continue;
            };
            let operation_id = operation_id(method, path, op);
            if deny.is_denied(&operation_id, path) {
                debug!(operation_id, "skipping denied operation");
                continue;
            }
            let full_path = format!("{prefix}{path}");
            out.push(build_descriptor(
                doc,
                service,
                operation_id,
                method,
                full_path,
                op,
                shared_params,
            ));
        }
    }
    out
}

/// Base path from `servers[0].url` (absolute or relative) or `basePath`.
fn base_path(doc: &Value) -> Option<String> {
    let from_servers = doc
        .pointer("/servers/0/url")
        .and_then(Value::as_str)
        .and_then(|url| {
            if url.starts_with('/') {
                Some(url.trim_end_matches('/').to_string())
            } else if url.contains("://") {
                reqwest::Url::parse(url)
                    .ok()
                    .map(|u| u.path().trim_end_matches('/').to_string())
            } else {
                None
            }
        });
    let path = from_servers.or_else(|| {
        doc.get("basePath")
            .and_then(Value::as_str)
            .map(|b| b.trim_end_matches('/').to_string())
    })?;
    (!path.is_empty()).then_some(path)
}

/// `operationId`, else `{method}_{path}` with non-alphanumerics collapsed
/// to single underscores.
fn operation_id(method: HttpMethod, path: &str, op: &Value) -> String {
    if let Some(id) = op.get("operationId").and_then(Value::as_str) {
        return id.to_string();
    }
    let mut clean = String::with_capacity(path.len());
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            clean.push(c);
        } else if !clean.ends_with('_') {
            clean.push('_');
        }
    }
    format!(
        "{}_{}",
        method.as_str().to_ascii_lowercase(),
        clean.trim_matches('_')
    )
}

/// Follow a local `$ref` one level; anything else is returned unchanged.
fn resolve<'a>(doc: &'a Value, v: &'a Value) -> &'a Value {
    v.get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| r.strip_prefix('#'))
        .and_then(|pointer| doc.pointer(pointer))
        .unwrap_or(v)
}

fn text(v: &Value, key: &str) -> String {
    v.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

fn non_empty(s: String) -> Option<String> {
    (!s.is_empty()).then_some(s)
}

struct Collected {
    params: Vec<ParamSpec>,
    required: Vec<String>,
    injected: Vec<String>,
}

impl Collected {
    fn has(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name == name) || self.injected.iter().any(|n| n == name)
    }

    fn add_parameter(&mut self, doc: &Value, raw: &Value) {
        let p = resolve(doc, raw);
        let name = text(p, "name");
        if name.is_empty() || self.has(&name) {
            return;
        }
        let location = p.get("in").and_then(Value::as_str).unwrap_or("query");
        if location == "header" || is_one_of(&name, HEADER_PARAMS) {
            return;
        }
        if location == "body" {
            // Swagger 2 body parameter: its schema describes the JSON body.
            if let Some(schema) = p.get("schema") {
                self.add_body_schema(doc, schema);
            }
            return;
        }

        let schema = p.get("schema").map(|s| resolve(doc, s)).unwrap_or(p);
        let auto_inject = is_one_of(&name, INJECTED_PARAMS);
        let required = p.get("required").and_then(Value::as_bool).unwrap_or(false);
        let kind = match location {
            "path" => ParamKind::Path,
            "formData" => ParamKind::Body,
            _ => ParamKind::Query,
        };
        if auto_inject {
            self.injected.push(name.clone());
        } else if required {
            self.required.push(name.clone());
        }
        self.params.push(ParamSpec {
            name,
            kind,
            ty: non_empty(text(schema, "type")).unwrap_or_else(|| "string".to_string()),
            format: non_empty(text(schema, "format")),
            required,
            auto_inject,
            description: cap_chars(&text(p, "description"), MAX_PARAM_DESCRIPTION_CHARS),
        });
    }

    fn add_body_schema(&mut self, doc: &Value, schema: &Value) {
        let schema = resolve(doc, schema);
        let required_list: Vec<&str> = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|r| r.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let Some(props) = schema.get("properties").and_then(Value::as_object) else {
            return;
        };
        for (name, prop) in props {
            if self.has(name) || is_one_of(name, DROPPED_BODY_PROPS) {
                continue;
            }
            if is_one_of(name, INJECTED_BODY_PROPS) {
                self.injected.push(name.clone());
                continue;
            }
            let prop = resolve(doc, prop);
            let required = required_list.contains(&name.as_str());
            if required {
                self.required.push(name.clone());
            }
            self.params.push(ParamSpec {
                name: name.clone(),
                kind: ParamKind::Body,
                ty: non_empty(text(prop, "type")).unwrap_or_else(|| "string".to_string()),
                format: non_empty(text(prop, "format")),
                required,
                auto_inject: false,
                description: cap_chars(&text(prop, "description"), MAX_PARAM_DESCRIPTION_CHARS),
            });
        }
    }
}

fn build_descriptor(
    doc: &Value,
    service: &str,
    operation_id: String,
    method: HttpMethod,
    path: String,
    op: &Value,
    shared_params: Option<&Vec<Value>>,
) -> CapabilityDescriptor {
    let summary = format!("{} {}", text(op, "summary"), text(op, "description"));
    let description = cap_chars(
        non_empty(summary.trim().to_string())
            .as_deref()
            .unwrap_or(&operation_id),
        MAX_DESCRIPTION_CHARS,
    );

    let mut collected = Collected {
        params: Vec::new(),
        required: Vec::new(),
        injected: Vec::new(),
    };
    // Operation-level parameters win over path-level ones with the same name.
    for p in op.get("parameters").and_then(Value::as_array).into_iter().flatten() {
        collected.add_parameter(doc, p);
    }
    for p in shared_params.into_iter().flatten() {
        collected.add_parameter(doc, p);
    }
    if let Some(schema) = op.pointer("/requestBody/content/application~1json/schema") {
        collected.add_body_schema(doc, schema);
    }

    let embedding_text = embedding_text(&operation_id, service, method, &path, &description, &collected.params);
    let call_schema = call_schema(&operation_id, &description, &collected.params, &collected.required);

    CapabilityDescriptor {
        operation_id,
        service: service.to_string(),
        method,
        path,
        description,
        params: collected.params,
        required_params: collected.required,
        auto_inject: collected.injected,
        embedding_text,
        call_schema,
        content_hash: String::new(),
    }
    .sealed()
}

fn embedding_text(
    operation_id: &str,
    service: &str,
    method: HttpMethod,
    path: &str,
    description: &str,
    params: &[ParamSpec],
) -> String {
    let mut parts = vec![
        format!("{operation_id} [{service}] {method} {path}"),
        description.to_string(),
    ];
    if !params.is_empty() {
        let list: Vec<String> = params.iter().map(|p| format!("{}({})", p.name, p.ty)).collect();
        parts.push(format!("Parameters: {}", list.join(", ")));
    }
    cap_chars(&parts.join(". "), MAX_EMBEDDING_TEXT_CHARS)
}

fn call_schema(name: &str, description: &str, params: &[ParamSpec], required: &[String]) -> Value {
    let mut properties = Map::new();
    for p in params.iter().filter(|p| !p.auto_inject) {
        let mut desc = if p.description.is_empty() {
            p.name.clone()
        } else {
            p.description.clone()
        };
        if p.format.as_deref() == Some("date-time") {
            desc.push_str(DATE_TIME_HINT);
        }
        properties.insert(p.name.clone(), json!({ "type": p.ty, "description": desc }));
    }
    let required: Vec<&String> = required
        .iter()
        .filter(|r| properties.contains_key(r.as_str()))
        .collect();
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            }
        }
    })
}
