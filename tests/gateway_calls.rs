//! Integration tests for the remote-call gateway against a mock API:
//!   - bearer token, tenant header and auto-injected parameters
//!   - 401 refreshes the token exactly once
//!   - 4xx is a client error, 5xx is retried then transient
//!   - the circuit breaker opens after repeated failures

mod common;

use std::sync::Arc;

use claw_relay::config::{DenyListConfig, GatewayConfig};
use claw_relay::gateway::policy::BreakerState;
use claw_relay::gateway::{CallContext, CallOutcome, RemoteGateway};
use claw_relay::registry::descriptor::{CapabilityDescriptor, DenyList};
use claw_relay::registry::openapi::parse_document;
use claw_relay::store::{MemoryStore, Store};
use serde_json::{json, Map, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_config(server: &MockServer) -> GatewayConfig {
    GatewayConfig {
        base_url: server.uri(),
        auth_url: format!("{}/oauth/token", server.uri()),
        client_id: "relay".into(),
        client_secret: "s3cret".into(),
        scope: None,
        audience: None,
        tenant_id: Some("tenant-a".into()),
        timeout_secs: 5,
        connect_timeout_secs: 5,
        max_retries: 2,
        retry_base_ms: 1,
        breaker_failure_threshold: 5,
        breaker_cooldown_secs: 30,
        token_key: "gateway:access_token".into(),
        token_lock_key: "gateway:token_refresh_lock".into(),
    }
}

async fn mount_token(server: &MockServer, expected_fetches: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "tok-1", "expires_in": 3600 })),
        )
        .expect(expected_fetches)
        .mount(server)
        .await;
}

fn descriptor(operation_id: &str) -> CapabilityDescriptor {
    let deny = DenyList::from_config(&DenyListConfig::default());
    parse_document("fleet", &common::fleet_openapi(), &deny)
        .into_iter()
        .find(|d| d.operation_id == operation_id)
        .unwrap()
}

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn gateway(cfg: &GatewayConfig) -> RemoteGateway {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    RemoteGateway::new(cfg, store).unwrap()
}

// ─── Happy path ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn get_sends_token_tenant_and_path_params() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/ZG-1234"))
        .and(header("authorization", "Bearer tok-1"))
        .and(header("x-tenant", "tenant-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "plate": "ZG-1234" })))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(
            &descriptor("get_Vehicle"),
            &params(&[("vehicleid", json!("ZG-1234"))]),
            &CallContext::default(),
        )
        .await;
    assert_eq!(outcome, CallOutcome::Success(json!({ "plate": "ZG-1234" })));
}

#[tokio::test]
async fn post_fills_auto_injected_body_fields() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/fleet/bookings"))
        .and(body_partial_json(json!({
            "from": "2026-01-05T08:00:00Z",
            "personId": "p-7"
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 99 })))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let ctx = CallContext {
        person_id: Some("p-7".into()),
        ..Default::default()
    };
    let outcome = gw
        .execute(
            &descriptor("post_CreateBooking"),
            &params(&[("from", json!("2026-01-05T08:00:00Z"))]),
            &ctx,
        )
        .await;
    assert!(outcome.is_success(), "{outcome:?}");
}

#[tokio::test]
async fn missing_required_parameter_is_rejected_locally() {
    let server = MockServer::start().await;
    mount_token(&server, 0).await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(&descriptor("get_Vehicle"), &Map::new(), &CallContext::default())
        .await;
    assert!(matches!(outcome, CallOutcome::ClientError { status: 400, .. }));
}

// ─── Authentication ──────────────────────────────────────────────────────────

#[tokio::test]
async fn unauthorized_refreshes_token_once() {
    let server = MockServer::start().await;
    mount_token(&server, 2).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/1"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(
            &descriptor("get_Vehicle"),
            &params(&[("vehicleId", json!(1))]),
            &CallContext::default(),
        )
        .await;
    assert_eq!(outcome, CallOutcome::Success(json!({ "id": 1 })));
}

#[tokio::test]
async fn second_unauthorized_is_a_client_error() {
    let server = MockServer::start().await;
    mount_token(&server, 2).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(
            &descriptor("get_Vehicle"),
            &params(&[("vehicleId", json!(1))]),
            &CallContext::default(),
        )
        .await;
    assert!(matches!(outcome, CallOutcome::ClientError { status: 401, .. }));
}

// ─── Failure classes ─────────────────────────────────────────────────────────

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/missing"))
        .respond_with(
            ResponseTemplate::new(404).set_body_json(json!({ "error": "vehicle not found" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(
            &descriptor("get_Vehicle"),
            &params(&[("vehicleId", json!("missing"))]),
            &CallContext::default(),
        )
        .await;
    match outcome {
        CallOutcome::ClientError { status, message } => {
            assert_eq!(status, 404);
            assert!(message.contains("vehicle not found"));
        }
        other => panic!("expected client error, got {other:?}"),
    }
    assert_eq!(gw.breaker().state(), BreakerState::Closed);
}

#[tokio::test]
async fn server_errors_are_retried_then_transient() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let gw = gateway(&gateway_config(&server));
    let outcome = gw
        .execute(
            &descriptor("get_Vehicle"),
            &params(&[("vehicleId", json!(1))]),
            &CallContext::default(),
        )
        .await;
    assert!(matches!(outcome, CallOutcome::Transient { .. }));
}

#[tokio::test]
async fn breaker_opens_after_repeated_failures() {
    let server = MockServer::start().await;
    mount_token(&server, 1).await;
    Mock::given(method("GET"))
        .and(path("/fleet/vehicles/1"))
        .respond_with(ResponseTemplate::new(500))
        .expect(2)
        .mount(&server)
        .await;

    let cfg = GatewayConfig {
        max_retries: 0,
        breaker_failure_threshold: 2,
        ..gateway_config(&server)
    };
    let gw = gateway(&cfg);
    let d = descriptor("get_Vehicle");
    let p = params(&[("vehicleId", json!(1))]);

    for _ in 0..2 {
        let outcome = gw.execute(&d, &p, &CallContext::default()).await;
        assert!(matches!(outcome, CallOutcome::Transient { .. }));
    }
    assert_eq!(gw.breaker().state(), BreakerState::Open);

    // rejected without reaching the server
    match gw.execute(&d, &p, &CallContext::default()).await {
        CallOutcome::Transient { message } => assert!(message.contains("circuit open")),
        other => panic!("expected transient, got {other:?}"),
    }
}

#[test]
fn outcomes_serialize_with_a_tag() {
    let v = serde_json::to_value(CallOutcome::ClientError {
        status: 404,
        message: "nope".into(),
    })
    .unwrap();
    assert_eq!(
        v,
        json!({ "outcome": "client_error", "data": { "status": 404, "message": "nope" } })
    );
}
