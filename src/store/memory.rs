//! In-process implementation of [`Store`].
//!
//! Keeps every key in one map behind a tokio mutex, so each operation is
//! atomic with respect to other tasks in the same process.  Expiry and
//! idle times use [`tokio::time::Instant`], which lets tests drive the
//! clock with `tokio::time::pause` / `advance`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Store, StoreError, StreamEntry};

type EntryId = (u64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(raw: &str) -> Option<EntryId> {
    let (ms, seq) = raw.split_once('-')?;
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Protocol(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

struct Pending {
    consumer: String,
    delivered_at: Instant,
    deliveries: u32,
}

#[derive(Default)]
struct Group {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, Pending>,
}

#[derive(Default)]
struct Stream {
    entries: BTreeMap<EntryId, Vec<(String, String)>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&mut self) -> EntryId {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let id = if now_ms > self.last_id.0 {
            (now_ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }
}

enum Value {
    Str(String),
    List(VecDeque<String>),
    /// Kept sorted by (score, member).
    ZSet(Vec<(f64, String)>),
    Stream(Stream),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|d| Instant::now() + d),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() >= exp)
    }
}

#[derive(Default)]
struct Inner {
    data: HashMap<String, Slot>,
}

impl Inner {
    fn slot(&mut self, key: &str) -> Option<&mut Slot> {
        if self.data.get(key).is_some_and(Slot::is_expired) {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn list_mut(&mut self, key: &str) -> Result<Option<&mut VecDeque<String>>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::List(list),
                ..
            }) => Ok(Some(list)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn pop_front(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        let (item, now_empty) = match self.list_mut(key)? {
            Some(list) => {
                let item = list.pop_front();
                (item, list.is_empty())
            }
            None => return Ok(None),
        };
        if now_empty {
            self.data.remove(key);
        }
        Ok(item)
    }

    fn zset_mut(&mut self, key: &str) -> Result<Option<&mut Vec<(f64, String)>>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::ZSet(set),
                ..
            }) => Ok(Some(set)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn stream_mut(&mut self, key: &str) -> Result<Option<&mut Stream>, StoreError> {
        match self.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Stream(stream),
                ..
            }) => Ok(Some(stream)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn group_mut<'a>(
        &'a mut self,
        stream: &str,
        group: &str,
    ) -> Result<(&'a mut BTreeMap<EntryId, Vec<(String, String)>>, &'a mut Group), StoreError>
    {
        let s = self
            .stream_mut(stream)?
            .ok_or_else(|| StoreError::Protocol(format!("NOGROUP no such key '{stream}'")))?;
        let g = s.groups.get_mut(group).ok_or_else(|| {
            StoreError::Protocol(format!("NOGROUP no such consumer group '{group}'"))
        })?;
        Ok((&mut s.entries, g))
    }

    fn read_new(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let (entries, g) = self.group_mut(stream, group)?;
        let now = Instant::now();
        let mut out = Vec::new();
        let start = (g.last_delivered.0, g.last_delivered.1.saturating_add(1));
        for (id, fields) in entries.range(start..).take(count) {
            g.pending.insert(
                *id,
                Pending {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                },
            );
            out.push(StreamEntry {
                id: format_id(*id),
                fields: fields.clone(),
            });
        }
        if let Some(last) = out.last().and_then(|e| parse_id(&e.id)) {
            g.last_delivered = last;
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// In-memory [`Store`] backend.
///
/// Suitable for tests and single-process deployments.  Several workers
/// sharing one `Arc<MemoryStore>` behave like several processes sharing a
/// Redis server.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Woken whenever a list or stream receives data.
    arrivals: Notify,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `op` under the lock, retrying after each arrival until it yields
    /// something or `timeout` elapses.
    async fn wait_for<T, F>(&self, timeout: Duration, mut op: F) -> Result<Option<T>, StoreError>
    where
        F: FnMut(&mut Inner) -> Result<Option<T>, StoreError>,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.arrivals.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(found) = op(&mut *self.inner.lock().await)? {
                return Ok(Some(found));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.slot(key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .data
            .insert(key.to_string(), Slot::new(Value::Str(value.to_string()), ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.slot(key).is_some() {
            return Ok(false);
        }
        inner.data.insert(
            key.to_string(),
            Slot::new(Value::Str(value.to_string()), Some(ttl)),
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let existed = inner.slot(key).is_some();
        inner.data.remove(key);
        Ok(existed)
    }

    async fn delete_if_equals(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let matches = matches!(
            inner.slot(key),
            Some(Slot { value: Value::Str(s), .. }) if s == value
        );
        if matches {
            inner.data.remove(key);
        }
        Ok(matches)
    }

    async fn incr_with_expiry(&self, key: &str, window: Duration) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;
        let current = match inner.slot(key) {
            None => 0,
            Some(Slot {
                value: Value::Str(s),
                ..
            }) => s
                .parse::<i64>()
                .map_err(|_| StoreError::Protocol(format!("value at '{key}' is not an integer")))?,
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + 1;
        inner.data.insert(
            key.to_string(),
            Slot::new(Value::Str(next.to_string()), Some(window)),
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.slot(key) {
            Some(slot) => {
                slot.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<usize, StoreError> {
        let len = {
            let mut inner = self.inner.lock().await;
            match inner.list_mut(key)? {
                Some(list) => {
                    list.push_back(value.to_string());
                    list.len()
                }
                None => {
                    let mut list = VecDeque::new();
                    list.push_back(value.to_string());
                    inner
                        .data
                        .insert(key.to_string(), Slot::new(Value::List(list), None));
                    1
                }
            }
        };
        self.arrivals.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.inner.lock().await.pop_front(key)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> Result<Option<String>, StoreError> {
        self.wait_for(timeout, |inner| inner.pop_front(key)).await
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.list_mut(key)? else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| if i < 0 { len + i } else { i };
        let from = norm(start).max(0);
        let to = norm(stop).min(len - 1);
        if from > to {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn llen(&self, key: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.list_mut(key)?.map(|l| l.len()).unwrap_or(0))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.zset_mut(key)?.is_none() {
            inner
                .data
                .insert(key.to_string(), Slot::new(Value::ZSet(Vec::new()), None));
        }
        if let Some(set) = inner.zset_mut(key)? {
            set.retain(|(_, m)| m != member);
            let pos = set
                .iter()
                .position(|(s, m)| (*s, m.as_str()) > (score, member))
                .unwrap_or(set.len());
            set.insert(pos, (score, member.to_string()));
        }
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .zset_mut(key)?
            .map(|set| {
                set.iter()
                    .take_while(|(s, _)| *s <= max)
                    .take(limit)
                    .map(|(_, m)| m.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let (removed, now_empty) = match inner.zset_mut(key)? {
            Some(set) => {
                let before = set.len();
                set.retain(|(_, m)| m != member);
                (set.len() < before, set.is_empty())
            }
            None => return Ok(false),
        };
        if now_empty {
            inner.data.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.zset_mut(key)?.map(|s| s.len()).unwrap_or(0))
    }

    async fn create_group(&self, stream: &str, group: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.stream_mut(stream)?.is_none() {
            inner.data.insert(
                stream.to_string(),
                Slot::new(Value::Stream(Stream::default()), None),
            );
        }
        if let Some(s) = inner.stream_mut(stream)? {
            s.groups.entry(group.to_string()).or_default();
        }
        Ok(())
    }

    async fn xadd(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StoreError> {
        let id = {
            let mut inner = self.inner.lock().await;
            if inner.stream_mut(stream)?.is_none() {
                inner.data.insert(
                    stream.to_string(),
                    Slot::new(Value::Stream(Stream::default()), None),
                );
            }
            let s = inner
                .stream_mut(stream)?
                .ok_or_else(|| StoreError::Backend(format!("stream '{stream}' vanished")))?;
            let id = s.next_id();
            s.entries.insert(id, fields.to_vec());
            format_id(id)
        };
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let found = self
            .wait_for(block, |inner| {
                let batch = inner.read_new(stream, group, consumer, count)?;
                Ok((!batch.is_empty()).then_some(batch))
            })
            .await?;
        Ok(found.unwrap_or_default())
    }

    async fn xautoclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StoreError> {
        let mut inner = self.inner.lock().await;
        let (entries, g) = inner.group_mut(stream, group)?;
        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut gone = Vec::new();

        for (id, pending) in g.pending.iter_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) < min_idle {
                continue;
            }
            match entries.get(id) {
                Some(fields) => {
                    pending.consumer = consumer.to_string();
                    pending.delivered_at = now;
                    pending.deliveries += 1;
                    claimed.push(StreamEntry {
                        id: format_id(*id),
                        fields: fields.clone(),
                    });
                }
                None => gone.push(*id),
            }
        }
        for id in gone {
            g.pending.remove(&id);
        }
        Ok(claimed)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<bool, StoreError> {
        let Some(id) = parse_id(id) else {
            return Ok(false);
        };
        let mut inner = self.inner.lock().await;
        let (_, g) = inner.group_mut(stream, group)?;
        Ok(g.pending.remove(&id).is_some())
    }

    async fn xdel(&self, stream: &str, id: &str) -> Result<bool, StoreError> {
        let Some(id) = parse_id(id) else {
            return Ok(false);
        };
        let mut inner = self.inner.lock().await;
        Ok(match inner.stream_mut(stream)? {
            Some(s) => s.entries.remove(&id).is_some(),
            None => false,
        })
    }

    async fn xlen(&self, stream: &str) -> Result<usize, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.stream_mut(stream)?.map(|s| s.entries.len()).unwrap_or(0))
    }
}

impl MemoryStore {
    /// Owner and delivery count of a pending entry, for tests and diagnostics.
    pub async fn pending_owner(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Option<(String, u32)> {
        let id = parse_id(id)?;
        let mut inner = self.inner.lock().await;
        let (_, g) = inner.group_mut(stream, group).ok()?;
        g.pending
            .get(&id)
            .map(|p| (p.consumer.clone(), p.deliveries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(text: &str) -> Vec<(String, String)> {
        vec![("text".to_string(), text.to_string())]
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_values() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_respects_existing_key_until_expiry() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(10);
        assert!(store.set_nx("lock", "a", ttl).await.unwrap());
        assert!(!store.set_nx("lock", "b", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.set_nx("lock", "b", ttl).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn delete_if_equals_only_removes_matching_owner() {
        let store = MemoryStore::new();
        store.set("lock", "owner-a", None).await.unwrap();
        assert!(!store.delete_if_equals("lock", "owner-b").await.unwrap());
        assert!(store.delete_if_equals("lock", "owner-a").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_with_expiry_counts_within_window() {
        let store = MemoryStore::new();
        let window = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry("rate:x", window).await.unwrap(), 1);
        assert_eq!(store.incr_with_expiry("rate:x", window).await.unwrap(), 2);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.incr_with_expiry("rate:x", window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lists_are_fifo_and_lrange_handles_negative_indices() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c"] {
            store.rpush("l", v).await.unwrap();
        }
        assert_eq!(store.lrange("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.lrange("l", -2, -1).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.lpop("l").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.llen("l").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn blpop_wakes_on_push() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let s2 = store.clone();
        let waiter =
            tokio::spawn(async move { s2.blpop("q", Duration::from_secs(5)).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.rpush("q", "hello").await.unwrap();
        assert_eq!(waiter.await.unwrap().as_deref(), Some("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn blpop_times_out_on_empty_list() {
        let store = MemoryStore::new();
        let got = store.blpop("q", Duration::from_secs(1)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn zset_orders_by_score_and_zrem_is_exclusive() {
        let store = MemoryStore::new();
        store.zadd("z", "late", 20.0).await.unwrap();
        store.zadd("z", "early", 10.0).await.unwrap();
        store.zadd("z", "future", 99.0).await.unwrap();

        let due = store.zrange_by_score("z", 50.0, 10).await.unwrap();
        assert_eq!(due, vec!["early", "late"]);

        assert!(store.zrem("z", "early").await.unwrap());
        assert!(!store.zrem("z", "early").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryStore::new();
        store.set("k", "v", None).await.unwrap();
        assert!(store.rpush("k", "x").await.is_err());
    }

    #[tokio::test]
    async fn consumer_group_delivers_each_entry_once() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        store.xadd("s", &fields("one")).await.unwrap();
        store.xadd("s", &fields("two")).await.unwrap();

        let a = store
            .xread_group("s", "g", "a", 1, Duration::ZERO)
            .await
            .unwrap();
        let b = store
            .xread_group("s", "g", "b", 5, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].field("text"), Some("one"));
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].field("text"), Some("two"));

        let none = store
            .xread_group("s", "g", "c", 5, Duration::ZERO)
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn group_created_after_append_still_sees_backlog() {
        let store = MemoryStore::new();
        store.xadd("s", &fields("early")).await.unwrap();
        store.create_group("s", "g").await.unwrap();
        store.create_group("s", "g").await.unwrap();
        let got = store
            .xread_group("s", "g", "a", 5, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn autoclaim_only_takes_idle_unacked_entries() {
        let store = MemoryStore::new();
        store.create_group("s", "g").await.unwrap();
        let stalled = store.xadd("s", &fields("stalled")).await.unwrap();
        let done = store.xadd("s", &fields("done")).await.unwrap();
        store
            .xread_group("s", "g", "crashed", 10, Duration::ZERO)
            .await
            .unwrap();
        store.xack("s", "g", &done).await.unwrap();
        store.xdel("s", &done).await.unwrap();

        let early = store
            .xautoclaim("s", "g", "rescuer", Duration::from_secs(300), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(301)).await;
        let claimed = store
            .xautoclaim("s", "g", "rescuer", Duration::from_secs(300), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, stalled);
        assert_eq!(
            store.pending_owner("s", "g", &stalled).await,
            Some(("rescuer".to_string(), 2))
        );
    }

    #[tokio::test]
    async fn xread_group_without_group_fails() {
        let store = MemoryStore::new();
        store.xadd("s", &fields("x")).await.unwrap();
        assert!(store
            .xread_group("s", "missing", "a", 1, Duration::ZERO)
            .await
            .is_err());
    }
}
