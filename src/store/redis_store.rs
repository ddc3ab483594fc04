//! Redis-backed implementation of [`Store`].
//!
//! Ordinary commands share one multiplexed connection.  Blocking reads
//! (`BLPOP`, `XREADGROUP … BLOCK`) would stall every other command queued
//! on that connection, so they check out a dedicated connection from a
//! small pool instead.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Value;
use tokio::sync::Mutex;

use super::{Store, StoreError, StreamEntry};

const RELEASE_IF_OWNER: &str = r#"
if redis.call('get', KEYS[1]) == ARGV[1] then
    return redis.call('del', KEYS[1])
else
    return 0
end
"#;

/// Upper bound on idle blocking connections kept around.
const MAX_IDLE_BLOCKING: usize = 4;

impl From<redis::RedisError> for StoreError {
    fn from(e: redis::RedisError) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn millis(d: Duration) -> u64 {
    d.as_millis().max(1) as u64
}

type RawEntry = (String, Vec<String>);

fn to_entry((id, flat): RawEntry) -> StreamEntry {
    let fields = flat
        .chunks(2)
        .filter(|pair| pair.len() == 2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect();
    StreamEntry { id, fields }
}

/// Redis / Valkey / KeyDB backend.
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    blocking: Mutex<Vec<MultiplexedConnection>>,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        use anyhow::Context;

        let client = redis::Client::open(url).context("invalid redis url")?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to redis")?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("redis PING failed")?;
        tracing::info!("redis store connected");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
        })
    }

    fn conn(&self) -> MultiplexedConnection {
        self.conn.clone()
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection, StoreError> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn checkin_blocking(&self, conn: MultiplexedConnection) {
        let mut pool = self.blocking.lock().await;
        if pool.len() < MAX_IDLE_BLOCKING {
            pool.push(conn);
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("GET").arg(key).query_async(&mut conn).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(n > 0)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::Script::new(RELEASE_IF_OWNER)
            .key(key)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let mut conn = self.conn();
        let (count,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCR")
            .arg(key)
            .cmd("PEXPIRE")
            .arg(key)
            .arg(millis(window))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(n == 1)
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("LPOP").arg(key).query_async(&mut conn).await?)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        // A zero timeout blocks forever in Redis.
        let timeout = timeout.max(Duration::from_millis(1));
        let mut conn = self.checkout_blocking().await?;
        let reply: Result<Option<(String, String)>, redis::RedisError> = redis::cmd("BLPOP")
            .arg(key)
            .arg(timeout.as_secs_f64())
            .query_async(&mut conn)
            .await;
        let reply = reply?;
        self.checkin_blocking(conn).await;
        Ok(reply.map(|(_, value)| value))
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?)
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("LLEN").arg(key).query_async(&mut conn).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(max)
            .arg("LIMIT")
            .arg(0)
            .arg(limit)
            .query_async(&mut conn)
            .await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("ZREM")
            .arg(key)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("ZCARD").arg(key).query_async(&mut conn).await?)
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let reply: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match reply {
            Ok(()) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StoreError> {
        let mut conn = self.conn();
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        Ok(cmd.query_async(&mut conn).await?)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.checkout_blocking().await?;
        let reply: Result<Option<Vec<(String, Vec<RawEntry>)>>, redis::RedisError> =
            redis::cmd("XREADGROUP")
                .arg("GROUP")
                .arg(group)
                .arg(consumer)
                .arg("COUNT")
                .arg(count)
                .arg("BLOCK")
                .arg(millis(block))
                .arg("STREAMS")
                .arg(stream)
                .arg(">")
                .query_async(&mut conn)
                .await;
        let reply = reply?;
        self.checkin_blocking(conn).await;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(to_entry)
            .collect())
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut conn = self.conn();
        let reply: Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        // Reply: [next-cursor, [[id, [field, value, …]], …], (deleted ids on 7.x)]
        let Value::Array(parts) = reply else {
            return Err(StoreError::Protocol("XAUTOCLAIM reply is not an array".into()));
        };
        let claimed = parts
            .get(1)
            .ok_or_else(|| StoreError::Protocol("XAUTOCLAIM reply missing entries".into()))?;
        let raw: Vec<RawEntry> = redis::from_redis_value(claimed)?;
        Ok(raw
            .into_iter()
            .map(to_entry)
            .filter(|e| !e.fields.is_empty())
            .collect())
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn xdel(&self, stream: &str, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn();
        let n: i64 = redis::cmd("XDEL")
            .arg(stream)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn xlen(&self, stream: &str) -> Result<usize, StoreError> {
        let mut conn = self.conn();
        Ok(redis::cmd("XLEN").arg(stream).query_async(&mut conn).await?)
    }
}
