//! Remote API gateway.
//!
//! Executes a [`CapabilityDescriptor`] against the remote API: fills the
//! path template, injects the caller's identity, authenticates with a
//! shared bearer token and applies the retry policy and circuit breaker.
//! Every outcome is a value, never a panic or an unbounded retry.

pub mod policy;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::config::GatewayConfig;
use crate::registry::descriptor::{CapabilityDescriptor, ParamKind};
use crate::store::Store;
use crate::value_tree::{self, TrimLimits};

use self::policy::{CircuitBreaker, RetryPolicy};
use self::token::TokenManager;

/// Identity used to fill auto-injected parameters.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub person_id: Option<String>,
    pub tenant_id: Option<String>,
    pub vehicle_id: Option<String>,
}

impl CallContext {
    fn value_for(&self, param: &str) -> Option<&str> {
        match param.to_ascii_lowercase().as_str() {
            "personid" | "assignedtoid" | "driverid" => self.person_id.as_deref(),
            "tenantid" => self.tenant_id.as_deref(),
            "vehicleid" => self.vehicle_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "data", rename_all = "snake_case")]
pub enum CallOutcome {
    Success(Value),
    /// The request was rejected; retrying will not help.
    ClientError { status: u16, message: String },
    /// The dependency is unavailable right now.
    Transient { message: String },
}

impl CallOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// A request ready to send.
#[derive(Debug, PartialEq)]
struct PreparedCall {
    url: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    tenant: Option<String>,
}

pub struct RemoteGateway {
    base_url: String,
    default_tenant: Option<String>,
    http: Client,
    tokens: TokenManager,
    policy: RetryPolicy,
    breaker: CircuitBreaker,
}

impl RemoteGateway {
    pub fn new(cfg: &GatewayConfig, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .connect_timeout(Duration::from_secs(cfg.connect_timeout_secs))
            .build()
            .context("build gateway HTTP client")?;
        Ok(Self {
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            default_tenant: cfg.tenant_id.clone(),
            tokens: TokenManager::new(store, http.clone(), cfg),
            http,
            policy: RetryPolicy {
                max_retries: cfg.max_retries,
                base_delay: Duration::from_millis(cfg.retry_base_ms),
            },
            breaker: CircuitBreaker::new(
                cfg.breaker_failure_threshold,
                Duration::from_secs(cfg.breaker_cooldown_secs),
            ),
        })
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Call the remote operation described by `descriptor`.
    pub async fn execute(
        &self,
        descriptor: &CapabilityDescriptor,
        params: &Map<String, Value>,
        ctx: &CallContext,
    ) -> CallOutcome {
        let call = match self.prepare(descriptor, params, ctx) {
            Ok(call) => call,
            Err(message) => return CallOutcome::ClientError { status: 400, message },
        };

        if !self.breaker.try_acquire() {
            return CallOutcome::Transient {
                message: "circuit open, remote API temporarily unavailable".to_string(),
            };
        }

        let mut attempt = 0u32;
        let mut refreshed = false;
        loop {
            let token = match self.tokens.token().await {
                Ok(t) => t,
                Err(e) => {
                    self.breaker.on_failure();
                    warn!(error = %e, "could not obtain access token");
                    return CallOutcome::Transient {
                        message: format!("authentication unavailable: {e}"),
                    };
                }
            };

            let failure = match self.send(descriptor, &call, &token).await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        self.breaker.on_success();
                        debug!(op = %descriptor.operation_id, status = status.as_u16(), "remote call succeeded");
                        return CallOutcome::Success(read_body(resp).await);
                    }
                    if status == StatusCode::UNAUTHORIZED && !refreshed {
                        info!(op = %descriptor.operation_id, "token rejected, refreshing once");
                        self.tokens.invalidate(&token).await;
                        refreshed = true;
                        continue;
                    }
                    if !RetryPolicy::is_retryable_status(status) {
                        // A 4xx means the API is up and answering.
                        self.breaker.on_success();
                        let mut body = read_body(resp).await;
                        value_tree::trim(&mut body, TrimLimits::default());
                        let message = match body {
                            Value::String(s) => s,
                            other => other.to_string(),
                        };
                        warn!(op = %descriptor.operation_id, status = status.as_u16(), "remote call rejected");
                        return CallOutcome::ClientError {
                            status: status.as_u16(),
                            message,
                        };
                    }
                    format!("remote API returned {status}")
                }
                Err(e) => format!("request failed: {e}"),
            };

            if attempt < self.policy.max_retries {
                let delay = self.policy.delay_for(attempt);
                warn!(
                    op = %descriptor.operation_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %failure,
                    "remote call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }

            self.breaker.on_failure();
            warn!(op = %descriptor.operation_id, attempts = attempt + 1, error = %failure, "remote call gave up");
            return CallOutcome::Transient { message: failure };
        }
    }

    async fn send(
        &self,
        descriptor: &CapabilityDescriptor,
        call: &PreparedCall,
        token: &str,
    ) -> reqwest::Result<reqwest::Response> {
        let mut req = self
            .http
            .request(descriptor.method.to_reqwest(), &call.url)
            .bearer_auth(token);
        if !call.query.is_empty() {
            req = req.query(&call.query);
        }
        if let Some(body) = &call.body {
            req = req.json(body);
        }
        if let Some(tenant) = &call.tenant {
            req = req.header("x-tenant", tenant);
        }
        req.send().await
    }

    /// Resolve the URL, query and body for one call.
    fn prepare(
        &self,
        descriptor: &CapabilityDescriptor,
        params: &Map<String, Value>,
        ctx: &CallContext,
    ) -> Result<PreparedCall, String> {
        let tenant = ctx.tenant_id.clone().or_else(|| self.default_tenant.clone());
        let ctx = CallContext {
            tenant_id: tenant.clone(),
            ..ctx.clone()
        };

        let mut remaining: Vec<(String, Value)> =
            params.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        for name in &descriptor.auto_inject {
            let present = remaining.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
            if !present {
                if let Some(v) = ctx.value_for(name) {
                    remaining.push((name.clone(), Value::String(v.to_string())));
                }
            }
        }

        for required in &descriptor.required_params {
            if !remaining.iter().any(|(k, _)| k.eq_ignore_ascii_case(required)) {
                return Err(format!("missing required parameter '{required}'"));
            }
        }

        let path = fill_path(&descriptor.path, &mut remaining)?;

        let (query, body) = if descriptor.method.uses_query() {
            let query = remaining
                .into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, scalar_string(&v)))
                .collect();
            (query, None)
        } else {
            // Declared query parameters stay in the query string.
            let mut query = Vec::new();
            let mut body = Map::new();
            for (k, v) in remaining {
                let is_query = descriptor
                    .param(&k)
                    .is_some_and(|p| p.kind == ParamKind::Query);
                if is_query {
                    if !v.is_null() {
                        query.push((k, scalar_string(&v)));
                    }
                } else {
                    body.insert(k, v);
                }
            }
            (query, Some(Value::Object(body)))
        };

        Ok(PreparedCall {
            url: format!("{}{}", self.base_url, path),
            query,
            body,
            tenant,
        })
    }
}

/// Substitute `{name}` segments (case-insensitive), consuming the used
/// parameters.
fn fill_path(template: &str, params: &mut Vec<(String, Value)>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let Some(len) = rest[start..].find('}') else {
            break;
        };
        let name = &rest[start + 1..start + len];
        let pos = params
            .iter()
            .position(|(k, _)| k.eq_ignore_ascii_case(name))
            .ok_or_else(|| format!("missing path parameter '{name}'"))?;
        let (_, value) = params.remove(pos);
        out.push_str(&rest[..start]);
        out.push_str(&encode_segment(&scalar_string(&value)));
        rest = &rest[start + len + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Percent-encode everything outside the RFC 3986 unreserved set.
fn encode_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// JSON body, a string for non-JSON bodies, `Null` when empty.
async fn read_body(resp: reqwest::Response) -> Value {
    let text = resp.text().await.unwrap_or_default();
    if text.trim().is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::descriptor::{HttpMethod, ParamSpec};
    use crate::store::MemoryStore;
    use serde_json::json;

    fn gateway() -> RemoteGateway {
        let cfg = GatewayConfig {
            base_url: "https://api.example.com/".into(),
            auth_url: "http://unused".into(),
            client_id: "c".into(),
            client_secret: "s".into(),
            scope: None,
            audience: None,
            tenant_id: Some("tenant-default".into()),
            timeout_secs: 5,
            connect_timeout_secs: 5,
            max_retries: 2,
            retry_base_ms: 1,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
            token_key: "k".into(),
            token_lock_key: "l".into(),
        };
        RemoteGateway::new(&cfg, Arc::new(MemoryStore::new())).unwrap()
    }

    fn param(name: &str, kind: ParamKind) -> ParamSpec {
        ParamSpec {
            name: name.into(),
            kind,
            ty: "string".into(),
            format: None,
            required: false,
            auto_inject: false,
            description: String::new(),
        }
    }

    fn descriptor(method: HttpMethod, path: &str) -> CapabilityDescriptor {
        CapabilityDescriptor {
            operation_id: "op".into(),
            service: "fleet".into(),
            method,
            path: path.into(),
            description: String::new(),
            params: vec![param("Id", ParamKind::Path), param("Filter", ParamKind::Query)],
            required_params: vec!["Id".into()],
            auto_inject: vec!["PersonId".into()],
            embedding_text: String::new(),
            call_schema: json!({}),
            content_hash: String::new(),
        }
    }

    fn params(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn get_substitutes_path_and_queries_the_rest() {
        let gw = gateway();
        let ctx = CallContext {
            person_id: Some("p-1".into()),
            ..Default::default()
        };
        let call = gw
            .prepare(
                &descriptor(HttpMethod::Get, "/fleet/cars/{id}"),
                &params(json!({"id": "a b/c", "Filter": "x", "skip": null})),
                &ctx,
            )
            .unwrap();
        assert_eq!(call.url, "https://api.example.com/fleet/cars/a%20b%2Fc");
        assert!(call.query.contains(&("Filter".into(), "x".into())));
        assert!(call.query.contains(&("PersonId".into(), "p-1".into())));
        assert_eq!(call.query.len(), 2);
        assert!(call.body.is_none());
        assert_eq!(call.tenant.as_deref(), Some("tenant-default"));
    }

    #[test]
    fn post_sends_json_body_and_keeps_caller_values() {
        let gw = gateway();
        let ctx = CallContext {
            person_id: Some("p-1".into()),
            tenant_id: Some("t-9".into()),
            ..Default::default()
        };
        let call = gw
            .prepare(
                &descriptor(HttpMethod::Post, "/fleet/cars/{Id}/cases"),
                &params(json!({"Id": 7, "personid": "explicit", "Subject": "flat tyre", "Filter": "q"})),
                &ctx,
            )
            .unwrap();
        assert_eq!(call.url, "https://api.example.com/fleet/cars/7/cases");
        assert_eq!(
            call.body,
            Some(json!({"personid": "explicit", "Subject": "flat tyre"}))
        );
        assert_eq!(call.query, vec![("Filter".to_string(), "q".to_string())]);
        assert_eq!(call.tenant.as_deref(), Some("t-9"));
    }

    #[test]
    fn missing_required_parameter_is_a_client_error() {
        let gw = gateway();
        let err = gw
            .prepare(
                &descriptor(HttpMethod::Get, "/fleet/cars/{id}"),
                &Map::new(),
                &CallContext::default(),
            )
            .unwrap_err();
        assert!(err.contains("Id"));
    }
}
