//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use claw_relay::config::{QueueConfig, WorkerConfig};
use claw_relay::queue::{InboundMessage, OutboundMessage, QueueService};
use claw_relay::store::{MemoryStore, Store, StoreError, StreamEntry};
use claw_relay::worker::{MessageHandler, OutboundSender, Worker, WorkerStats};

// ---------------------------------------------------------------------------
// Fault-injecting store
// ---------------------------------------------------------------------------

/// A [`MemoryStore`] whose operations can be made to fail by name.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing: Mutex<HashSet<&'static str>>,
    fail_all: Mutex<bool>,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the named operation fail until [`FlakyStore::recover`].
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn fail_everything(&self) {
        *self.fail_all.lock().unwrap() = true;
    }

    pub fn recover(&self) {
        self.failing.lock().unwrap().clear();
        *self.fail_all.lock().unwrap() = false;
    }

    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if *self.fail_all.lock().unwrap() || self.failing.lock().unwrap().contains(op) {
            return Err(StoreError::Backend(format!("{op}: connection refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("get")?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.check("set")?;
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check("set_nx")?;
        self.inner.set_nx(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check("delete")?;
        self.inner.delete(key).await
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        self.check("delete_if_equals")?;
        self.inner.delete_if_equals(key, value).await
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        self.check("incr_with_expiry")?;
        self.inner.incr_with_expiry(key, window).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check("expire")?;
        self.inner.expire(key, ttl).await
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        self.check("rpush")?;
        self.inner.rpush(key, value).await
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check("lpop")?;
        self.inner.lpop(key).await
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.check("blpop")?;
        self.inner.blpop(key, timeout).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        self.check("lrange")?;
        self.inner.lrange(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        self.check("llen")?;
        self.inner.llen(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        self.check("zadd")?;
        self.inner.zadd(key, member, score).await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check("zrange_by_score")?;
        self.inner.zrange_by_score(key, max, limit).await
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.check("zrem")?;
        self.inner.zrem(key, member).await
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        self.check("zcard")?;
        self.inner.zcard(key).await
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        self.check("create_group")?;
        self.inner.create_group(stream, group).await
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StoreError> {
        self.check("xadd")?;
        self.inner.xadd(stream, fields).await
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.check("xread_group")?;
        self.inner
            .xread_group(stream, group, consumer, count, block)
            .await
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        self.check("xautoclaim")?;
        self.inner
            .xautoclaim(stream, group, consumer, min_idle, count)
            .await
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        self.check("xack")?;
        self.inner.xack(stream, group, id).await
    }

    async fn xdel(&self, stream: &str, id: &str) -> Result<bool, StoreError> {
        self.check("xdel")?;
        self.inner.xdel(stream, id).await
    }

    async fn xlen(&self, stream: &str) -> Result<usize, StoreError> {
        self.check("xlen")?;
        self.inner.xlen(stream).await
    }
}

// ---------------------------------------------------------------------------
// Worker collaborators
// ---------------------------------------------------------------------------

/// Replies with the message text.
pub struct EchoHandler;

#[async_trait]
impl MessageHandler for EchoHandler {
    async fn handle(&self, msg: &InboundMessage) -> anyhow::Result<Option<String>> {
        Ok(Some(format!("echo: {}", msg.text)))
    }
}

/// Fails every message.
pub struct BrokenHandler;

#[async_trait]
impl MessageHandler for BrokenHandler {
    async fn handle(&self, _msg: &InboundMessage) -> anyhow::Result<Option<String>> {
        anyhow::bail!("backend timed out")
    }
}

/// Records every delivered message.
#[derive(Default)]
pub struct RecordingSender {
    pub sent: Mutex<Vec<OutboundMessage>>,
}

#[async_trait]
impl OutboundSender for RecordingSender {
    async fn send(&self, msg: &OutboundMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push(msg.clone());
        Ok(())
    }
}

/// Worker settings with short blocking reads so ticks stay fast.
pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        block_ms: 10,
        outbound_block_ms: 10,
        tick_pause_ms: 1,
        error_pause_ms: 5,
        ..Default::default()
    }
}

pub fn worker(
    id: &str,
    queue: &QueueService,
    handler: Arc<dyn MessageHandler>,
    sender: Arc<dyn OutboundSender>,
    cfg: WorkerConfig,
) -> Worker {
    Worker::new(
        id.to_string(),
        queue.clone(),
        handler,
        sender,
        cfg,
        Arc::new(WorkerStats::default()),
    )
}

pub fn queue_on(store: Arc<dyn Store>) -> QueueService {
    QueueService::new(store, QueueConfig::default())
}

// ---------------------------------------------------------------------------
// Remote API fixtures
// ---------------------------------------------------------------------------

/// A small OpenAPI 3 document with two usable operations and one that
/// the default deny-list filters out.
pub fn fleet_openapi() -> serde_json::Value {
    serde_json::json!({
        "openapi": "3.0.1",
        "servers": [{ "url": "https://api.example.com/fleet" }],
        "paths": {
            "/vehicles/{vehicleId}": {
                "get": {
                    "operationId": "get_Vehicle",
                    "summary": "Get a vehicle",
                    "parameters": [
                        { "name": "vehicleId", "in": "path", "required": true,
                          "schema": { "type": "string" } },
                        { "name": "x-tenant", "in": "header", "schema": { "type": "string" } }
                    ]
                }
            },
            "/bookings": {
                "post": {
                    "operationId": "post_CreateBooking",
                    "summary": "Book a vehicle",
                    "requestBody": { "content": { "application/json": { "schema": {
                        "$ref": "#/components/schemas/Booking"
                    }}}}
                }
            },
            "/vehicles/export": {
                "get": { "operationId": "get_VehicleExport", "summary": "Export vehicles" }
            }
        },
        "components": { "schemas": { "Booking": {
            "type": "object",
            "required": ["from"],
            "properties": {
                "from": { "type": "string", "format": "date-time" },
                "personId": { "type": "string" },
                "createdAt": { "type": "string" }
            }
        }}}
    })
}
