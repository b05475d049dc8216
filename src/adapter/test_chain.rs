//! Test Chain Adapter: the reserved `cg:testnet` chain.
//!
//! Receives synthetic payment events from an in-process emitter instead of
//! any network transport, so the Shell and the dispatch pipeline can be
//! exercised deterministically without external dependencies.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::adapter::{AdapterContext, ChainAdapter, enqueue_or_log};
use crate::error::IndexerError;
use crate::model::{AddressEntry, ChainFamily, ChainKey, DetectedPayment, TokenId, TokenStrategy};
use crate::queue::WorkQueue;
use crate::registry::AddressRegistry;

/// One synthetic inbound transfer, as a test harness constructs it.
#[derive(Debug, Clone)]
pub struct SyntheticPaymentEvent {
    pub chain_key: ChainKey,
    pub token_id: TokenId,
    pub address: String,
    pub tx_hash: String,
    pub sender: String,
    pub amount: String,
    pub timestamp: i64,
}

/// Cloneable handle for injecting [`SyntheticPaymentEvent`]s into a running
/// [`TestChainAdapter`].
#[derive(Clone)]
pub struct TestChainEmitter {
    tx: mpsc::UnboundedSender<SyntheticPaymentEvent>,
}

impl TestChainEmitter {
    /// Emits one event. Silently dropped if the adapter is no longer running.
    pub fn emit(&self, event: SyntheticPaymentEvent) {
        let _ = self.tx.send(event);
    }
}

struct Inner {
    chain_key: ChainKey,
    work_queue: Arc<dyn WorkQueue>,
    registry: Mutex<AddressRegistry>,
    emitter_tx: mpsc::UnboundedSender<SyntheticPaymentEvent>,
    emitter_rx: Mutex<Option<mpsc::UnboundedReceiver<SyntheticPaymentEvent>>>,
}

pub struct TestChainAdapter {
    inner: Arc<Inner>,
}

impl TestChainAdapter {
    pub fn new(chain_key: ChainKey, work_queue: Arc<dyn WorkQueue>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                chain_key,
                work_queue,
                registry: Mutex::new(AddressRegistry::new(ChainFamily::Test)),
                emitter_tx: tx,
                emitter_rx: Mutex::new(Some(rx)),
            }),
        }
    }

    /// Returns a handle a test can use to push events while this adapter is running.
    pub fn emitter(&self) -> TestChainEmitter {
        TestChainEmitter {
            tx: self.inner.emitter_tx.clone(),
        }
    }

    /// Whether `address` is currently watched under any active strategy.
    pub async fn is_watching(&self, address: &str) -> bool {
        let registry = self.inner.registry.lock().await;
        registry
            .active_strategies()
            .any(|strategy| registry.lookup_by_address(strategy, address).is_some())
    }

    async fn handle_event(inner: &Arc<Inner>, event: SyntheticPaymentEvent) {
        if event.chain_key != inner.chain_key {
            tracing::warn!(
                expected = %inner.chain_key,
                got = %event.chain_key,
                "dropping synthetic event addressed to a different chain"
            );
            return;
        }
        let Some(strategy) = TokenStrategy::from_token_id(&event.token_id, ChainFamily::Test)
        else {
            return;
        };
        let entry = {
            let registry = inner.registry.lock().await;
            registry
                .lookup_by_address(&strategy, &event.address)
                .cloned()
        };
        let Some(entry) = entry else {
            return;
        };
        let is_positive = event.amount.parse::<u128>().map(|v| v > 0).unwrap_or(false);
        if !is_positive {
            return;
        }
        let payment = DetectedPayment {
            chain_key: inner.chain_key.clone(),
            token_id: entry.token_id,
            address: entry.address,
            derivation_path: entry.derivation_path,
            tx_hash: event.tx_hash,
            sender: event.sender,
            amount: event.amount,
            timestamp: event.timestamp,
        };
        enqueue_or_log(&inner.work_queue, &inner.chain_key, payment).await;
    }
}

#[async_trait]
impl ChainAdapter for TestChainAdapter {
    async fn start(&self, ctx: AdapterContext) -> Result<(), IndexerError> {
        let mut rx_slot = self.inner.emitter_rx.lock().await;
        let rx = rx_slot
            .take()
            .ok_or_else(|| IndexerError::Transport("test chain adapter already running".into()))?;
        drop(rx_slot);

        let inner = self.inner.clone();
        let token = ctx.cancellation_token();
        ctx.spawn_tracked(async move {
            let mut rx = rx;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = rx.recv() => {
                        match event {
                            Some(event) => TestChainAdapter::handle_event(&inner, event).await,
                            None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        // The control-plane-wide cancellation token already stopped the event
        // loop; nothing chain-specific to tear down.
        Ok(())
    }

    async fn on_address_added(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        let mut registry = self.inner.registry.lock().await;
        registry.add(strategy, entry);
        Ok(())
    }

    async fn on_address_removed(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        let mut registry = self.inner.registry.lock().await;
        let watch_key = entry.watch_key(ChainFamily::Test);
        registry.remove(&strategy, &watch_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    fn chain_key() -> ChainKey {
        ChainKey::new("cg", "testnet")
    }

    async fn started_adapter() -> (Arc<TestChainAdapter>, Arc<InMemoryWorkQueue>, CancellationToken) {
        let work_queue = Arc::new(InMemoryWorkQueue::new());
        let adapter = Arc::new(TestChainAdapter::new(chain_key(), work_queue.clone()));
        let tasks = TaskTracker::new();
        let cancellation = CancellationToken::new();
        let ctx = AdapterContext::new(chain_key(), tasks, cancellation.clone());
        adapter.start(ctx).await.unwrap();
        (adapter, work_queue, cancellation)
    }

    #[tokio::test]
    async fn emitting_to_a_watched_address_dispatches_exactly_one_payment() {
        let (adapter, work_queue, _cancellation) = started_adapter().await;
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:1".into()),
        };
        adapter
            .on_address_added(
                strategy,
                AddressEntry::new(TokenId("slip44:1".into()), "addr-1", "m/44'/1'/0'/0/0"),
            )
            .await
            .unwrap();

        adapter.emitter().emit(SyntheticPaymentEvent {
            chain_key: chain_key(),
            token_id: TokenId("slip44:1".into()),
            address: "addr-1".into(),
            tx_hash: "tx-1".into(),
            sender: "sender-1".into(),
            amount: "100".into(),
            timestamp: 1_700_000_000,
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let jobs = work_queue.drain().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].wallet_address, "addr-1");
    }

    #[tokio::test]
    async fn zero_value_event_never_dispatches() {
        let (adapter, work_queue, _cancellation) = started_adapter().await;
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:1".into()),
        };
        adapter
            .on_address_added(
                strategy,
                AddressEntry::new(TokenId("slip44:1".into()), "addr-2", "m/44'/1'/0'/0/1"),
            )
            .await
            .unwrap();

        adapter.emitter().emit(SyntheticPaymentEvent {
            chain_key: chain_key(),
            token_id: TokenId("slip44:1".into()),
            address: "addr-2".into(),
            tx_hash: "tx-2".into(),
            sender: "sender-2".into(),
            amount: "0".into(),
            timestamp: 1_700_000_000,
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(work_queue.len().await, 0);
    }

    #[tokio::test]
    async fn event_for_an_unwatched_address_never_dispatches() {
        let (adapter, work_queue, _cancellation) = started_adapter().await;
        adapter.emitter().emit(SyntheticPaymentEvent {
            chain_key: chain_key(),
            token_id: TokenId("slip44:1".into()),
            address: "never-added".into(),
            tx_hash: "tx-3".into(),
            sender: "sender-3".into(),
            amount: "500".into(),
            timestamp: 1_700_000_000,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(work_queue.len().await, 0);
    }

    #[tokio::test]
    async fn remove_after_add_silences_further_events() {
        let (adapter, work_queue, _cancellation) = started_adapter().await;
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:1".into()),
        };
        let entry = AddressEntry::new(TokenId("slip44:1".into()), "addr-4", "m/44'/1'/0'/0/2");
        adapter
            .on_address_added(strategy.clone(), entry.clone())
            .await
            .unwrap();
        adapter
            .on_address_removed(strategy, entry)
            .await
            .unwrap();

        adapter.emitter().emit(SyntheticPaymentEvent {
            chain_key: chain_key(),
            token_id: TokenId("slip44:1".into()),
            address: "addr-4".into(),
            tx_hash: "tx-4".into(),
            sender: "sender-4".into(),
            amount: "500".into(),
            timestamp: 1_700_000_000,
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(work_queue.len().await, 0);
    }
}
