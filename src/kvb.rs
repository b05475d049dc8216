//! Key-Value & Bus (KVB): the external collaborator providing TTL-bound
//! key/value storage plus topic pub/sub.
//!
//! The [`Kvb`] trait is the seam the Shell and [`crate::control_plane`] depend
//! on; [`RedisKvb`] is the production backend and [`InMemoryKvb`] is the fake
//! used by this crate's own tests (and by anything embedding the indexer in a
//! single process without a real Redis instance).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, broadcast, mpsc};

/// TTL key/value plus topic pub/sub, as the Shell and control plane need it.
#[async_trait]
pub trait Kvb: Send + Sync {
    /// Sets `key` to `value` with the given TTL only if `key` does not already
    /// exist (`SET key value NX EX ttl`). Returns `true` if the set happened.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvbError>;

    /// Re-sets `key` to `value` with the given TTL only if `key` already
    /// exists (`SET key value XX EX ttl`). Returns `true` if the set happened.
    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvbError>;

    async fn delete(&self, key: &str) -> Result<(), KvbError>;

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvbError>;

    /// Subscribes to `topic`, returning a receiver of raw message payloads.
    /// The subscription is cancelled when the receiver is dropped.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, KvbError>;
}

#[derive(Debug, thiserror::Error)]
pub enum KvbError {
    #[error("kvb transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for KvbError {
    fn from(value: redis::RedisError) -> Self {
        KvbError::Transport(value.to_string())
    }
}

/// Redis-backed [`Kvb`].
///
/// Key/value and set commands share one multiplexed [`ConnectionManager`].
/// Each `subscribe` call opens its own dedicated PubSub connection, so a slow
/// subscriber never blocks publishers sharing the same Redis server — the
/// separation the design doc requires.
#[derive(Clone)]
pub struct RedisKvb {
    client: redis::Client,
    conn: ConnectionManager,
}

impl RedisKvb {
    pub async fn connect(url: &str) -> Result<Self, KvbError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl Kvb for RedisKvb {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvbError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvbError> {
        let mut conn = self.conn.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("XX")
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> Result<(), KvbError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvbError> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(topic, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, KvbError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            use futures_util::StreamExt;
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload_bytes() {
                    bytes => bytes.to_vec(),
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

/// In-memory [`Kvb`] fake for tests: TTLs are tracked but not actively swept,
/// since tests observe presence/absence synchronously within one tick.
#[derive(Clone, Default)]
pub struct InMemoryKvb {
    inner: Arc<Mutex<InMemoryState>>,
}

#[derive(Default)]
struct InMemoryState {
    values: HashMap<String, String>,
    topics: HashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl InMemoryKvb {
    pub fn new() -> Self {
        Self::default()
    }

    fn topic_sender(state: &mut InMemoryState, topic: &str) -> broadcast::Sender<Vec<u8>> {
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

#[async_trait]
impl Kvb for InMemoryKvb {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
    ) -> Result<bool, KvbError> {
        let mut state = self.inner.lock().await;
        if state.values.contains_key(key) {
            Ok(false)
        } else {
            state.values.insert(key.to_string(), value.to_string());
            Ok(true)
        }
    }

    async fn set_if_present(
        &self,
        key: &str,
        value: &str,
        _ttl: Duration,
    ) -> Result<bool, KvbError> {
        let mut state = self.inner.lock().await;
        if state.values.contains_key(key) {
            state.values.insert(key.to_string(), value.to_string());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvbError> {
        let mut state = self.inner.lock().await;
        state.values.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), KvbError> {
        let mut state = self.inner.lock().await;
        let sender = Self::topic_sender(&mut state, topic);
        // No subscribers is not an error: mirrors Redis PUBLISH semantics.
        let _ = sender.send(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, KvbError> {
        let mut state = self.inner.lock().await;
        let sender = Self::topic_sender(&mut state, topic);
        drop(state);
        let mut broadcast_rx = sender.subscribe();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Ok(payload) = broadcast_rx.recv().await {
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_is_exclusive() {
        let kvb = InMemoryKvb::new();
        let first = kvb
            .set_if_absent("indexer:eip155:1:running", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(first);
        let second = kvb
            .set_if_absent("indexer:eip155:1:running", "1", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(!second, "lease already held by the first acquirer");
    }

    #[tokio::test]
    async fn set_if_present_fails_once_deleted() {
        let kvb = InMemoryKvb::new();
        kvb.set_if_absent("k", "1", Duration::from_secs(60))
            .await
            .unwrap();
        kvb.delete("k").await.unwrap();
        let refreshed = kvb.set_if_present("k", "1", Duration::from_secs(60)).await.unwrap();
        assert!(!refreshed, "heartbeat must not resurrect a released lease");
    }

    #[tokio::test]
    async fn publish_then_subscribe_round_trips() {
        let kvb = InMemoryKvb::new();
        let mut rx = kvb.subscribe("indexer:cg:testnet:address:added").await.unwrap();
        kvb.publish("indexer:cg:testnet:address:added", b"hello")
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"hello");
    }
}
