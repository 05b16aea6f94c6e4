//! Typed gateway over the key-value store
//!
//! Every core entity is a JSON blob under a prefixed key; secondary
//! indexes are sorted sets and plain sets; notifications ride pub/sub.
//! The `RedisStore` backs production, the `InMemoryStore` backs tests.
pub mod keys;

pub use keys::Keys;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::error::Result;

/// One step of a pipelined batch.
#[derive(Debug, Clone)]
pub enum KvOp {
    Set { key: String, value: String },
    Del { key: String },
    ZAdd { key: String, member: String, score: f64 },
    ZRem { key: String, member: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

/// Messages delivered on a subscription: `(channel, payload)`.
pub type SubMessage = (String, String);

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn incr(&self, key: &str) -> Result<u64>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;
    async fn zrem(&self, key: &str, member: &str) -> Result<()>;
    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    async fn sadd(&self, key: &str, member: &str) -> Result<()>;
    async fn srem(&self, key: &str, member: &str) -> Result<()>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>>;

    async fn publish(&self, channel: &str, payload: &str) -> Result<()>;
    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>>;
    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>>;

    /// Execute a batch of writes as one round trip.
    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<()>;
}

/// JSON convenience layer over any [`KvStore`].
#[async_trait]
pub trait KvStoreExt: KvStore {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }
}

impl<S: KvStore + ?Sized> KvStoreExt for S {}

/// Redis-backed store used in production.
pub struct RedisStore {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        Ok(RedisStore { client, conn })
    }

    async fn spawn_pubsub(
        &self,
        target: String,
        pattern: bool,
    ) -> Result<mpsc::UnboundedReceiver<SubMessage>> {
        let conn = self.client.get_async_connection().await?;
        let mut pubsub = conn.into_pubsub();
        if pattern {
            pubsub.psubscribe(&target).await?;
        } else {
            pubsub.subscribe(&target).await?;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        error!("Dropping unreadable pubsub payload on {}: {}", channel, e);
                        continue;
                    }
                };
                if tx.send((channel, payload)).is_err() {
                    break;
                }
            }
            warn!("Pubsub stream for {} ended", target);
        });

        Ok(rx)
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1u64).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        Ok(conn.zscore(key, member).await?)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrevrange(key, start, stop).await?)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(key, member).await?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>> {
        self.spawn_pubsub(channel.to_string(), false).await
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>> {
        self.spawn_pubsub(pattern.to_string(), true).await
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<()> {
        let mut pipe = redis::pipe();
        for op in &ops {
            match op {
                KvOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                KvOp::Del { key } => {
                    pipe.del(key).ignore();
                }
                KvOp::ZAdd { key, member, score } => {
                    pipe.zadd(key, member, *score).ignore();
                }
                KvOp::ZRem { key, member } => {
                    pipe.zrem(key, member).ignore();
                }
                KvOp::SAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                KvOp::SRem { key, member } => {
                    pipe.srem(key, member).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, String>,
    zsets: HashMap<String, HashMap<String, f64>>,
    sets: HashMap<String, std::collections::HashSet<String>>,
    counters: HashMap<String, u64>,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    target: String,
    pattern: bool,
    tx: mpsc::UnboundedSender<SubMessage>,
}

/// In-memory store used by tests.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches(pattern: &str, channel: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            channel.starts_with(prefix)
        } else {
            pattern == channel
        }
    }

    fn ranged(mut members: Vec<(String, f64)>, start: isize, stop: isize, rev: bool) -> Vec<String> {
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        if rev {
            members.reverse();
        }
        let len = members.len() as isize;
        let norm = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let lo = norm(start) as usize;
        let hi = (norm(stop) + 1).min(len) as usize;
        if lo >= hi {
            return Vec::new();
        }
        members[lo..hi].iter().map(|(m, _)| m.clone()).collect()
    }

    fn apply(inner: &mut MemoryInner, op: &KvOp) {
        match op {
            KvOp::Set { key, value } => {
                inner.strings.insert(key.clone(), value.clone());
            }
            KvOp::Del { key } => {
                inner.strings.remove(key);
                inner.zsets.remove(key);
                inner.sets.remove(key);
            }
            KvOp::ZAdd { key, member, score } => {
                inner
                    .zsets
                    .entry(key.clone())
                    .or_default()
                    .insert(member.clone(), *score);
            }
            KvOp::ZRem { key, member } => {
                if let Some(z) = inner.zsets.get_mut(key) {
                    z.remove(member);
                }
            }
            KvOp::SAdd { key, member } => {
                inner.sets.entry(key.clone()).or_default().insert(member.clone());
            }
            KvOp::SRem { key, member } => {
                if let Some(s) = inner.sets.get_mut(key) {
                    s.remove(member);
                }
            }
        }
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        Self::apply(&mut inner, &KvOp::Del { key: key.to_string() });
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(z) = inner.zsets.get_mut(key) {
            z.remove(member);
        }
        Ok(())
    }

    async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).and_then(|z| z.get(member).copied()))
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let members = inner
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        Ok(Self::ranged(members, start, stop, false))
    }

    async fn zrevrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let members = inner
            .zsets
            .get(key)
            .map(|z| z.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        Ok(Self::ranged(members, start, stop, true))
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(s) = inner.sets.get_mut(key) {
            s.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|sub| {
            let delivers = if sub.pattern {
                Self::matches(&sub.target, channel)
            } else {
                sub.target == channel
            };
            if delivers {
                sub.tx.send((channel.to_string(), payload.to_string())).is_ok()
            } else {
                !sub.tx.is_closed()
            }
        });
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(Subscriber {
            target: channel.to_string(),
            pattern: false,
            tx,
        });
        Ok(rx)
    }

    async fn psubscribe(&self, pattern: &str) -> Result<mpsc::UnboundedReceiver<SubMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.push(Subscriber {
            target: pattern.to_string(),
            pattern: true,
            tx,
        });
        Ok(rx)
    }

    async fn pipeline(&self, ops: Vec<KvOp>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for op in &ops {
            Self::apply(&mut inner, op);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        value: f64,
    }

    #[tokio::test]
    async fn test_json_round_trip() {
        let store = InMemoryStore::new();
        let sample = Sample { name: "btcidr".to_string(), value: 1.5 };

        store.set_json("k", &sample).await.unwrap();
        let loaded: Option<Sample> = store.get_json("k").await.unwrap();
        assert_eq!(loaded, Some(sample));

        let missing: Option<Sample> = store.get_json("absent").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_zrevrange_orders_by_score() {
        let store = InMemoryStore::new();
        store.zadd("rank", "low", 1.0).await.unwrap();
        store.zadd("rank", "high", 9.0).await.unwrap();
        store.zadd("rank", "mid", 5.0).await.unwrap();

        let top = store.zrevrange("rank", 0, 1).await.unwrap();
        assert_eq!(top, vec!["high".to_string(), "mid".to_string()]);

        let all = store.zrange("rank", 0, -1).await.unwrap();
        assert_eq!(all, vec!["low".to_string(), "mid".to_string(), "high".to_string()]);
    }

    #[tokio::test]
    async fn test_pubsub_pattern_and_exact() {
        let store = InMemoryStore::new();
        let mut exact = store.subscribe("ws:user:1").await.unwrap();
        let mut pattern = store.psubscribe("ws:user:*").await.unwrap();

        store.publish("ws:user:1", "hello").await.unwrap();
        store.publish("ws:user:2", "other").await.unwrap();

        assert_eq!(exact.recv().await.unwrap().1, "hello");
        assert_eq!(pattern.recv().await.unwrap().1, "hello");
        assert_eq!(pattern.recv().await.unwrap().1, "other");
    }

    #[tokio::test]
    async fn test_pipeline_applies_all_ops() {
        let store = InMemoryStore::new();
        store
            .pipeline(vec![
                KvOp::Set { key: "a".to_string(), value: "1".to_string() },
                KvOp::SAdd { key: "s".to_string(), member: "m".to_string() },
                KvOp::ZAdd { key: "z".to_string(), member: "m".to_string(), score: 2.0 },
            ])
            .await
            .unwrap();

        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(store.smembers("s").await.unwrap(), vec!["m".to_string()]);
        assert_eq!(store.zscore("z", "m").await.unwrap(), Some(2.0));
    }

    #[tokio::test]
    async fn test_incr_is_monotonic() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr("id:bot").await.unwrap(), 1);
        assert_eq!(store.incr("id:bot").await.unwrap(), 2);
        assert_eq!(store.incr("id:bot").await.unwrap(), 3);
    }
}
