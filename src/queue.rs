//! Work Queue (WQ): the outbound side of the core — one enqueue per detected payment.
//!
//! Enqueueing is fire-and-forget from a Chain Adapter's perspective: the
//! Shell spawns the enqueue as its own task so a slow or failing WQ never
//! blocks the adapter's read loop. A [`QueueError`] here is logged and
//! dropped, not retried inside the core (retry/backoff/priority/retention is
//! the downstream consumer's concern once the job lands on the queue).

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::model::DetectedPayment;

/// Wire shape of one enqueued job, field-named to match the control plane's
/// own JSON conventions rather than this crate's internal Rust naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedPaymentJob {
    #[serde(rename = "blockchainKey")]
    pub blockchain_key: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    #[serde(rename = "walletDerivationPath")]
    pub wallet_derivation_path: String,
    #[serde(rename = "walletAddress")]
    pub wallet_address: String,
    #[serde(rename = "transactionHash")]
    pub transaction_hash: String,
    pub amount: String,
    /// ISO-8601 UTC, derived from the chain event's unix-seconds timestamp.
    #[serde(rename = "detectedAt")]
    pub detected_at: String,
}

impl From<DetectedPayment> for DetectedPaymentJob {
    fn from(payment: DetectedPayment) -> Self {
        let detected_at = chrono::DateTime::<chrono::Utc>::from_timestamp(payment.timestamp, 0)
            .unwrap_or_else(|| chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).unwrap())
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        Self {
            blockchain_key: payment.chain_key.to_string(),
            token_id: payment.token_id.to_string(),
            wallet_derivation_path: payment.derivation_path,
            wallet_address: payment.address,
            transaction_hash: payment.tx_hash,
            amount: payment.amount,
            detected_at,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue transport error: {0}")]
    Transport(String),
    #[error("failed to encode job: {0}")]
    Encode(#[from] serde_json::Error),
}

impl From<redis::RedisError> for QueueError {
    fn from(value: redis::RedisError) -> Self {
        QueueError::Transport(value.to_string())
    }
}

/// Accepts one detected payment at a time, for durable hand-off to whatever
/// downstream consumer performs wallet crediting.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn enqueue(&self, payment: DetectedPayment) -> Result<(), QueueError>;
}

/// Redis-list-backed [`WorkQueue`]. Jobs are pushed as JSON onto a single
/// list key; a downstream worker is expected to `BLPOP`/`BRPOP` it. No
/// in-core retry: the list's durability is Redis's own persistence
/// configuration, per the design doc's deliberate choice not to fabricate a
/// dedicated job-queue dependency.
#[derive(Clone)]
pub struct RedisWorkQueue {
    conn: ConnectionManager,
    list_key: String,
}

impl RedisWorkQueue {
    pub async fn connect(url: &str, list_key: impl Into<String>) -> Result<Self, QueueError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self {
            conn,
            list_key: list_key.into(),
        })
    }
}

#[async_trait]
impl WorkQueue for RedisWorkQueue {
    async fn enqueue(&self, payment: DetectedPayment) -> Result<(), QueueError> {
        let job: DetectedPaymentJob = payment.into();
        let encoded = serde_json::to_string(&job)?;
        let mut conn = self.conn.clone();
        let _: () = conn.rpush(&self.list_key, encoded).await?;
        Ok(())
    }
}

/// In-memory [`WorkQueue`] fake for tests: jobs accumulate in order and can
/// be drained via [`InMemoryWorkQueue::drain`].
#[derive(Clone, Default)]
pub struct InMemoryWorkQueue {
    jobs: std::sync::Arc<Mutex<Vec<DetectedPaymentJob>>>,
}

impl InMemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn drain(&self) -> Vec<DetectedPaymentJob> {
        let mut jobs = self.jobs.lock().await;
        std::mem::take(&mut *jobs)
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

#[async_trait]
impl WorkQueue for InMemoryWorkQueue {
    async fn enqueue(&self, payment: DetectedPayment) -> Result<(), QueueError> {
        let job: DetectedPaymentJob = payment.into();
        self.jobs.lock().await.push(job);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChainKey, TokenId};

    fn sample_payment() -> DetectedPayment {
        DetectedPayment {
            chain_key: ChainKey::new("eip155", "1"),
            token_id: TokenId("slip44:60".into()),
            address: "0xabc".into(),
            derivation_path: "m/44'/60'/0'/0/0".into(),
            tx_hash: "0xdeadbeef".into(),
            sender: "0xfeed".into(),
            amount: "1000000000000000000".into(),
            timestamp: 1_700_000_000,
        }
    }

    #[tokio::test]
    async fn enqueue_preserves_field_naming_on_conversion() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(sample_payment()).await.unwrap();
        let jobs = queue.drain().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].blockchain_key, "eip155:1");
        assert_eq!(jobs[0].wallet_address, "0xabc");
        assert!(jobs[0].detected_at.starts_with("2023-11-14"));
    }

    #[tokio::test]
    async fn drain_empties_the_queue() {
        let queue = InMemoryWorkQueue::new();
        queue.enqueue(sample_payment()).await.unwrap();
        let _ = queue.drain().await;
        assert_eq!(queue.len().await, 0);
    }
}
