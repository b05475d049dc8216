//! Chain Adapters: one per chain family, each translating a chain's native
//! event model into [`crate::model::DetectedPayment`]s.
//!
//! [`ChainAdapter`] is deliberately non-generic over the Shell's collaborator
//! types so it stays object-safe (`Arc<dyn ChainAdapter>`) — everything an
//! adapter needs from its Shell arrives through [`AdapterContext`], built
//! fresh on every `start()`.

pub mod bitcoin;
pub mod evm;
pub mod solana;
pub mod test_chain;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::IndexerError;
use crate::model::{AddressEntry, ChainKey, DetectedPayment, TokenStrategy};
use crate::queue::WorkQueue;

/// Everything a [`ChainAdapter`] needs from its wrapping Shell, besides its
/// own [`crate::queue::WorkQueue`] handle (adapters hold that directly,
/// since they're constructed per-chain at wiring time).
#[derive(Clone)]
pub struct AdapterContext {
    pub chain_key: ChainKey,
    tasks: TaskTracker,
    cancellation: CancellationToken,
}

impl AdapterContext {
    pub fn new(chain_key: ChainKey, tasks: TaskTracker, cancellation: CancellationToken) -> Self {
        Self {
            chain_key,
            tasks,
            cancellation,
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Spawns a future tracked by the Shell's [`TaskTracker`], so `stop()`
    /// waits for it before tearing the adapter down.
    pub fn spawn_tracked<F>(&self, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(fut);
    }
}

/// Enqueues a detected payment without blocking the caller, logging (rather
/// than propagating) a failure: a slow or failing work queue should never
/// stall an adapter's own read loop.
pub async fn enqueue_or_log(work_queue: &Arc<dyn WorkQueue>, chain_key: &ChainKey, payment: DetectedPayment) {
    if let Err(e) = work_queue.enqueue(payment).await {
        tracing::error!(%chain_key, error = %e, "failed to enqueue detected payment");
    }
}

/// Chain-family-specific transport and detection logic, wrapped by a
/// [`crate::shell::ListenerShell`].
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    /// Starts the chain-specific transport. Called once per `Idle ->
    /// Running` transition, after the Shell has acquired the singleton
    /// lease; must return once the adapter's own tasks are spawned, not
    /// once the transport is fully connected (reconnection is the
    /// adapter's own concern, not the Shell's).
    async fn start(&self, ctx: AdapterContext) -> Result<(), IndexerError>;

    /// Tears down the chain-specific transport. Called once per `Running ->
    /// Idle` transition, before the Shell releases the singleton lease.
    async fn stop(&self) -> Result<(), IndexerError>;

    /// An address was added to the watch set, already mapped to its
    /// [`TokenStrategy`]. First add for a strategy should start the
    /// corresponding substream.
    async fn on_address_added(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError>;

    /// An address was removed from the watch set. Last remove for a
    /// strategy should stop the corresponding substream.
    async fn on_address_removed(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError>;
}
