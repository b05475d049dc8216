//! Listener Shell: the chain-agnostic lifecycle/coordination layer wrapping
//! one [`crate::adapter::ChainAdapter`] per configured chain.
//!
//! `Idle -> Starting -> Running -> Stopping -> Idle`. The Shell owns
//! singleton-lease coordination, the control-plane subscription, and AIS
//! bootstrap replay; the adapter it wraps owns only the chain-specific
//! transport and the decision of when a watched address has received a
//! payment.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::adapter::{AdapterContext, ChainAdapter};
use crate::ais::ActiveInvoiceSource;
use crate::config::ShellConfig;
use crate::control_plane::{self, ControlPlanePayload};
use crate::error::IndexerError;
use crate::kvb::Kvb;
use crate::model::{AddressEntry, ChainKey, TokenId, TokenStrategy};

/// Observable lifecycle state of a [`ListenerShell`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Idle,
    Starting,
    Running,
    Stopping,
}

/// Wraps one [`ChainAdapter`] with lease coordination, control-plane
/// subscription, and AIS bootstrap.
pub struct ListenerShell<K: Kvb, A: ActiveInvoiceSource> {
    chain_key: ChainKey,
    config: ShellConfig,
    kvb: Arc<K>,
    ais: Arc<A>,
    adapter: Arc<dyn ChainAdapter>,
    state: Mutex<ShellState>,
    tasks: TaskTracker,
    cancellation: CancellationToken,
}

/// Arbitrary, per the design doc: any value proves presence to `EXISTS`/`GET`.
const LEASE_VALUE: &str = "1";

impl<K: Kvb + 'static, A: ActiveInvoiceSource + 'static> ListenerShell<K, A> {
    pub fn new(
        chain_key: ChainKey,
        config: ShellConfig,
        kvb: Arc<K>,
        ais: Arc<A>,
        adapter: Arc<dyn ChainAdapter>,
    ) -> Self {
        Self {
            chain_key,
            config,
            kvb,
            ais,
            adapter,
            state: Mutex::new(ShellState::Idle),
            tasks: TaskTracker::new(),
            cancellation: CancellationToken::new(),
        }
    }

    pub fn chain_key(&self) -> &ChainKey {
        &self.chain_key
    }

    pub async fn state(&self) -> ShellState {
        *self.state.lock().await
    }

    /// Attempts the `Idle -> Starting -> Running` transition.
    ///
    /// Returns `Ok(false)` without error if the lease is already held by
    /// another replica; the Shell remains `Idle` and the caller may retry
    /// later. Returns `Ok(true)` once fully `Running`.
    pub async fn start(self: &Arc<Self>) -> Result<bool, IndexerError> {
        {
            let mut state = self.state.lock().await;
            if *state != ShellState::Idle {
                return Ok(false);
            }
            *state = ShellState::Starting;
        }

        let lease_key = control_plane::lease_key(&self.chain_key);
        let acquired = self
            .kvb
            .set_if_absent(&lease_key, LEASE_VALUE, self.config.lease_ttl())
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        if !acquired {
            tracing::info!(chain_key = %self.chain_key, "lease already held; staying idle");
            *self.state.lock().await = ShellState::Idle;
            return Ok(false);
        }

        self.spawn_heartbeat(lease_key.clone());

        let ctx = AdapterContext::new(
            self.chain_key.clone(),
            self.tasks.clone(),
            self.cancellation.clone(),
        );
        self.adapter.start(ctx).await?;

        self.spawn_control_plane_subscriber(control_plane::added_topic(&self.chain_key), true);
        self.spawn_control_plane_subscriber(control_plane::removed_topic(&self.chain_key), false);

        self.bootstrap_from_ais().await;

        *self.state.lock().await = ShellState::Running;
        tracing::info!(chain_key = %self.chain_key, "listener shell running");
        Ok(true)
    }

    /// `Running -> Stopping -> Idle`.
    pub async fn stop(self: &Arc<Self>) -> Result<(), IndexerError> {
        {
            let mut state = self.state.lock().await;
            if *state != ShellState::Running {
                return Ok(());
            }
            *state = ShellState::Stopping;
        }

        self.cancellation.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        self.adapter.stop().await?;

        let lease_key = control_plane::lease_key(&self.chain_key);
        self.kvb
            .delete(&lease_key)
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;

        *self.state.lock().await = ShellState::Idle;
        tracing::info!(chain_key = %self.chain_key, "listener shell stopped");
        Ok(())
    }

    fn spawn_heartbeat(self: &Arc<Self>, lease_key: String) {
        let shell = self.clone();
        let token = self.cancellation.clone();
        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(shell.config.heartbeat_interval());
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        let renewed = shell
                            .kvb
                            .set_if_present(&lease_key, LEASE_VALUE, shell.config.lease_ttl())
                            .await;
                        match renewed {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::warn!(chain_key = %shell.chain_key, "lease vanished under us during heartbeat");
                            }
                            Err(e) => {
                                tracing::warn!(chain_key = %shell.chain_key, error = %e, "lease heartbeat failed");
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_control_plane_subscriber(self: &Arc<Self>, topic: String, is_add: bool) {
        let shell = self.clone();
        let token = self.cancellation.clone();
        self.tasks.spawn(async move {
            let mut rx = match shell.kvb.subscribe(&topic).await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(chain_key = %shell.chain_key, %topic, error = %e, "failed to subscribe to control plane topic");
                    return;
                }
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    message = rx.recv() => {
                        match message {
                            Some(bytes) => shell.handle_control_plane_message(bytes, is_add).await,
                            None => break,
                        }
                    }
                }
            }
        });
    }

    async fn handle_control_plane_message(&self, bytes: Vec<u8>, is_add: bool) {
        let value = match control_plane::normalize(ControlPlanePayload::Bytes(bytes)) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(chain_key = %self.chain_key, error = %e, "dropping malformed control-plane payload");
                return;
            }
        };
        let event = match control_plane::parse_address_event(&value) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(chain_key = %self.chain_key, error = %e, "dropping control-plane message with missing/invalid fields");
                return;
            }
        };

        let entry = AddressEntry::new(
            TokenId(event.token_id),
            event.address,
            event.derivation_path,
        );
        if is_add {
            self.dispatch_add(entry).await;
        } else {
            self.dispatch_remove(entry).await;
        }
    }

    async fn dispatch_add(&self, entry: AddressEntry) {
        let Some(strategy) = TokenStrategy::from_token_id(&entry.token_id, self.chain_key.family())
        else {
            tracing::warn!(chain_key = %self.chain_key, token_id = %entry.token_id, "rejecting add with unsupported tokenId");
            return;
        };
        if let Err(e) = self.adapter.on_address_added(strategy, entry).await {
            tracing::warn!(chain_key = %self.chain_key, error = %e, "adapter rejected address add");
        }
    }

    async fn dispatch_remove(&self, entry: AddressEntry) {
        let Some(strategy) = TokenStrategy::from_token_id(&entry.token_id, self.chain_key.family())
        else {
            tracing::warn!(chain_key = %self.chain_key, token_id = %entry.token_id, "ignoring remove with unsupported tokenId");
            return;
        };
        if let Err(e) = self.adapter.on_address_removed(strategy, entry).await {
            tracing::warn!(chain_key = %self.chain_key, error = %e, "adapter rejected address remove");
        }
    }

    async fn bootstrap_from_ais(&self) {
        let invoices = match self.ais.active_invoices(&self.chain_key).await {
            Ok(invoices) => invoices,
            Err(e) => {
                tracing::warn!(chain_key = %self.chain_key, error = %e, "active-invoice source bootstrap failed; starting with an empty registry");
                return;
            }
        };
        for invoice in invoices {
            let entry = AddressEntry::new(
                TokenId(invoice.token_id),
                invoice.address,
                invoice.derivation_path,
            );
            self.dispatch_add(entry).await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }
}

/// How long to wait between repeated `start()` attempts when the lease was
/// already held by another replica.
pub fn default_lease_retry_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::test_chain::TestChainAdapter;
    use crate::ais::InMemoryActiveInvoiceSource;
    use crate::control_plane::{AddressEvent, ControlPlanePublisher};
    use crate::kvb::InMemoryKvb;
    use crate::queue::InMemoryWorkQueue;

    #[tokio::test]
    async fn start_acquires_lease_and_replays_ais_bootstrap() {
        let chain_key = ChainKey::new("cg", "testnet");
        let kvb = Arc::new(InMemoryKvb::new());
        let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![
            crate::ais::ActiveInvoice {
                blockchain_key: "cg:testnet".into(),
                token_id: "slip44:1".into(),
                address: "addr-1".into(),
                derivation_path: "m/44'/1'/0'/0/0".into(),
            },
        ]));
        let work_queue = Arc::new(InMemoryWorkQueue::new());
        let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue.clone()));

        let shell = Arc::new(ListenerShell::new(
            chain_key.clone(),
            ShellConfig::default(),
            kvb.clone(),
            ais,
            adapter.clone(),
        ));

        let started = shell.start().await.unwrap();
        assert!(started);
        assert_eq!(shell.state().await, ShellState::Running);
        assert!(adapter.is_watching("addr-1").await);

        shell.stop().await.unwrap();
        assert_eq!(shell.state().await, ShellState::Idle);
    }

    #[tokio::test]
    async fn second_start_attempt_on_a_held_lease_stays_idle() {
        let chain_key = ChainKey::new("cg", "testnet");
        let kvb = Arc::new(InMemoryKvb::new());
        kvb.set_if_absent(
            &control_plane::lease_key(&chain_key),
            "1",
            Duration::from_secs(60),
        )
        .await
        .unwrap();

        let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![]));
        let work_queue = Arc::new(InMemoryWorkQueue::new());
        let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue));
        let shell = Arc::new(ListenerShell::new(
            chain_key,
            ShellConfig::default(),
            kvb,
            ais,
            adapter,
        ));

        let started = shell.start().await.unwrap();
        assert!(!started);
        assert_eq!(shell.state().await, ShellState::Idle);
    }

    #[tokio::test]
    async fn control_plane_add_then_remove_leaves_no_active_watch() {
        let chain_key = ChainKey::new("cg", "testnet");
        let kvb = Arc::new(InMemoryKvb::new());
        let ais = Arc::new(InMemoryActiveInvoiceSource::new(vec![]));
        let work_queue = Arc::new(InMemoryWorkQueue::new());
        let adapter = Arc::new(TestChainAdapter::new(chain_key.clone(), work_queue));

        let shell = Arc::new(ListenerShell::new(
            chain_key.clone(),
            ShellConfig::default(),
            kvb.clone(),
            ais,
            adapter.clone(),
        ));
        shell.start().await.unwrap();

        let publisher = ControlPlanePublisher::new((*kvb).clone());
        publisher
            .publish_added(
                &chain_key,
                AddressEvent {
                    token_id: "slip44:1".into(),
                    address: "addr-2".into(),
                    derivation_path: "m/44'/1'/0'/0/1".into(),
                },
            )
            .await
            .unwrap();

        // Give the subscriber task a chance to process the message.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(adapter.is_watching("addr-2").await);

        publisher
            .publish_removed(
                &chain_key,
                AddressEvent {
                    token_id: "slip44:1".into(),
                    address: "addr-2".into(),
                    derivation_path: "m/44'/1'/0'/0/1".into(),
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!adapter.is_watching("addr-2").await);

        shell.stop().await.unwrap();
    }
}
