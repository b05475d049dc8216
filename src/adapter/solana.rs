//! Solana Adapter: per-address account-change subscriptions over a pubsub
//! WebSocket, seeded by an initial HTTP read of current balance.
//!
//! Unlike the EVM adapter's per-strategy substreams, subscription handles
//! here are tracked per [`WatchKey`] — removing one watched address cancels
//! only that address's subscription, leaving siblings under the same mint
//! or the native strategy untouched.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Utc;
use futures_util::StreamExt;
use solana_account_decoder_client_types::{UiAccountData, UiAccountEncoding};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcAccountInfoConfig;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_commitment_config::CommitmentConfig;
use solana_pubkey::Pubkey;
use spl_token::solana_program::program_pack::Pack;
use spl_token::state::Account as SplTokenAccount;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::adapter::{AdapterContext, ChainAdapter, enqueue_or_log};
use crate::error::IndexerError;
use crate::model::{AddressEntry, ChainFamily, ChainKey, DetectedPayment, TokenStrategy, WatchKey};
use crate::queue::WorkQueue;
use crate::registry::AddressRegistry;

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

fn transport_err<E: std::fmt::Display>(e: E) -> IndexerError {
    IndexerError::Transport(e.to_string())
}

fn account_info_config() -> RpcAccountInfoConfig {
    RpcAccountInfoConfig {
        encoding: Some(UiAccountEncoding::Base64),
        commitment: Some(CommitmentConfig::confirmed()),
        ..RpcAccountInfoConfig::default()
    }
}

fn decode_token_amount(data: &UiAccountData) -> Result<u64, IndexerError> {
    let UiAccountData::Binary(encoded, encoding) = data else {
        return Err(IndexerError::Decode("expected binary-encoded token account data".into()));
    };
    if *encoding != UiAccountEncoding::Base64 {
        return Err(IndexerError::Decode("unexpected token account encoding".into()));
    }
    let bytes = BASE64_STANDARD
        .decode(encoded)
        .map_err(|e| IndexerError::Decode(format!("invalid base64 account data: {e}")))?;
    let account = SplTokenAccount::unpack(&bytes)
        .map_err(|e| IndexerError::Decode(format!("failed to unpack SPL token account: {e}")))?;
    Ok(account.amount)
}

struct Inner {
    chain_key: ChainKey,
    rpc_url: Url,
    pubsub_url: Url,
    work_queue: Arc<dyn WorkQueue>,
    registry: Mutex<AddressRegistry>,
    subscriptions: Mutex<HashMap<WatchKey, CancellationToken>>,
    ctx: OnceCell<AdapterContext>,
}

pub struct SolanaAdapter {
    inner: Arc<Inner>,
}

impl SolanaAdapter {
    pub fn new(chain_key: ChainKey, rpc_url: Url, pubsub_url: Url, work_queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                chain_key,
                rpc_url,
                pubsub_url,
                work_queue,
                registry: Mutex::new(AddressRegistry::new(ChainFamily::Solana)),
                subscriptions: Mutex::new(HashMap::new()),
                ctx: OnceCell::new(),
            }),
        }
    }

    pub async fn is_watching(&self, address: &str) -> bool {
        let registry = self.inner.registry.lock().await;
        registry
            .active_strategies()
            .any(|strategy| registry.lookup_by_address(strategy, address).is_some())
    }

    fn current_ctx(&self) -> Result<AdapterContext, IndexerError> {
        self.inner
            .ctx
            .get()
            .cloned()
            .ok_or_else(|| IndexerError::StateConflict("Solana adapter not started".into()))
    }

    async fn spawn_subscription(
        inner: Arc<Inner>,
        ctx: AdapterContext,
        watch_key: WatchKey,
        strategy: TokenStrategy,
        owner_address: String,
    ) {
        let token = CancellationToken::new();
        {
            let mut subs = inner.subscriptions.lock().await;
            if subs.contains_key(&watch_key) {
                return;
            }
            subs.insert(watch_key.clone(), token.clone());
        }

        ctx.spawn_tracked(Self::subscription_loop(inner, watch_key, strategy, owner_address, token));
    }

    async fn subscription_loop(
        inner: Arc<Inner>,
        watch_key: WatchKey,
        strategy: TokenStrategy,
        owner_address: String,
        token: CancellationToken,
    ) {
        while !token.is_cancelled() {
            let result = match &strategy {
                TokenStrategy::Native { .. } => Self::run_native_subscription(&inner, &owner_address, &token).await,
                TokenStrategy::Fungible { contract, .. } => {
                    Self::run_fungible_subscription(&inner, &owner_address, contract, &token).await
                }
            };
            match result {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(
                        chain_key = %inner.chain_key,
                        address = %owner_address,
                        error = %e,
                        "Solana subscription disconnected; reconnecting"
                    );
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_native_subscription(
        inner: &Arc<Inner>,
        owner_address: &str,
        token: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let pubkey = Pubkey::from_str(owner_address)
            .map_err(|e| IndexerError::Validation(format!("invalid Solana pubkey {owner_address:?}: {e}")))?;

        let rpc = RpcClient::new(inner.rpc_url.to_string());
        let mut previous = rpc.get_balance(&pubkey).await.map_err(transport_err)?;

        let pubsub = PubsubClient::new(inner.pubsub_url.as_str())
            .await
            .map_err(transport_err)?;
        let (mut stream, unsubscribe) = pubsub
            .account_subscribe(&pubkey, Some(account_info_config()))
            .await
            .map_err(transport_err)?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    unsubscribe().await;
                    return Ok(());
                }
                notification = stream.next() => {
                    let Some(response) = notification else {
                        return Err(IndexerError::Transport("account subscription stream ended".into()));
                    };
                    let new_balance = response.value.lamports;
                    if new_balance > previous {
                        let delta = new_balance - previous;
                        Self::dispatch_if_watched(inner, owner_address, format!("slot:{}", response.context.slot), delta).await;
                    }
                    previous = new_balance;
                }
            }
        }
    }

    async fn run_fungible_subscription(
        inner: &Arc<Inner>,
        owner_address: &str,
        mint: &str,
        token: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let owner = Pubkey::from_str(owner_address)
            .map_err(|e| IndexerError::Validation(format!("invalid Solana pubkey {owner_address:?}: {e}")))?;
        let mint_pubkey = Pubkey::from_str(mint)
            .map_err(|e| IndexerError::Validation(format!("invalid Solana mint {mint:?}: {e}")))?;

        let rpc = RpcClient::new(inner.rpc_url.to_string());
        let accounts = rpc
            .get_token_accounts_by_owner(&owner, TokenAccountsFilter::Mint(mint_pubkey))
            .await
            .map_err(transport_err)?;
        let Some(keyed_account) = accounts.into_iter().next() else {
            tracing::warn!(
                chain_key = %inner.chain_key,
                owner = %owner_address,
                mint = %mint,
                "no associated token account exists yet; not subscribing"
            );
            return Ok(());
        };
        let token_account_pubkey = Pubkey::from_str(&keyed_account.pubkey)
            .map_err(|e| IndexerError::Decode(format!("invalid token account pubkey: {e}")))?;

        let account = rpc
            .get_account(&token_account_pubkey)
            .await
            .map_err(transport_err)?;
        let mut previous = SplTokenAccount::unpack(&account.data)
            .map_err(|e| IndexerError::Decode(format!("failed to unpack SPL token account: {e}")))?
            .amount;

        let pubsub = PubsubClient::new(inner.pubsub_url.as_str())
            .await
            .map_err(transport_err)?;
        let (mut stream, unsubscribe) = pubsub
            .account_subscribe(&token_account_pubkey, Some(account_info_config()))
            .await
            .map_err(transport_err)?;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    unsubscribe().await;
                    return Ok(());
                }
                notification = stream.next() => {
                    let Some(response) = notification else {
                        return Err(IndexerError::Transport("account subscription stream ended".into()));
                    };
                    let new_amount = decode_token_amount(&response.value.data)?;
                    if new_amount > previous {
                        let delta = new_amount - previous;
                        Self::dispatch_if_watched(inner, owner_address, format!("slot:{}", response.context.slot), delta).await;
                    }
                    previous = new_amount;
                }
            }
        }
    }

    async fn dispatch_if_watched(inner: &Arc<Inner>, owner_address: &str, tx_hash: String, delta: u64) {
        let entry = {
            let registry = inner.registry.lock().await;
            registry
                .active_strategies()
                .find_map(|s| registry.lookup_by_address(s, owner_address).cloned())
        };
        let Some(entry) = entry else { return };
        let payment = DetectedPayment {
            chain_key: inner.chain_key.clone(),
            token_id: entry.token_id,
            address: entry.address,
            derivation_path: entry.derivation_path,
            tx_hash,
            sender: String::new(),
            amount: delta.to_string(),
            timestamp: Utc::now().timestamp(),
        };
        enqueue_or_log(&inner.work_queue, &inner.chain_key, payment).await;
    }
}

#[async_trait]
impl ChainAdapter for SolanaAdapter {
    async fn start(&self, ctx: AdapterContext) -> Result<(), IndexerError> {
        self.inner
            .ctx
            .set(ctx)
            .map_err(|_| IndexerError::StateConflict("Solana adapter already started".into()))
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        Ok(())
    }

    async fn on_address_added(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        Pubkey::from_str(&entry.address)
            .map_err(|e| IndexerError::Validation(format!("invalid Solana pubkey {:?}: {e}", entry.address)))?;
        let ctx = self.current_ctx()?;
        let watch_key = entry.watch_key(ChainFamily::Solana);
        let owner_address = entry.address.clone();

        {
            let mut registry = self.inner.registry.lock().await;
            registry.add(strategy.clone(), entry);
        }

        Self::spawn_subscription(self.inner.clone(), ctx, watch_key, strategy, owner_address).await;
        Ok(())
    }

    async fn on_address_removed(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        let watch_key = entry.watch_key(ChainFamily::Solana);
        {
            let mut registry = self.inner.registry.lock().await;
            registry.remove(&strategy, &watch_key);
        }
        let mut subs = self.inner.subscriptions.lock().await;
        if let Some(token) = subs.remove(&watch_key) {
            token.cancel();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TokenId;
    use crate::queue::InMemoryWorkQueue;

    fn adapter() -> SolanaAdapter {
        SolanaAdapter::new(
            ChainKey::new("solana", "EtWTRABZaYq6iMfeYKouRu166VU2xqa1"),
            Url::parse("http://localhost:8899").unwrap(),
            Url::parse("ws://localhost:8900").unwrap(),
            Arc::new(InMemoryWorkQueue::new()),
        )
    }

    #[tokio::test]
    async fn on_address_added_before_start_reports_state_conflict() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:501".into()),
        };
        let entry = AddressEntry::new(
            TokenId("slip44:501".into()),
            "11111111111111111111111111111111",
            "m/44'/501'/0'/0'",
        );
        let result = adapter.on_address_added(strategy, entry).await;
        assert!(matches!(result, Err(IndexerError::StateConflict(_))));
    }

    #[tokio::test]
    async fn on_address_added_rejects_invalid_pubkeys() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:501".into()),
        };
        let entry = AddressEntry::new(TokenId("slip44:501".into()), "not-base58!!!", "m/44'/501'/0'/0'");
        let result = adapter.on_address_added(strategy, entry).await;
        assert!(matches!(result, Err(IndexerError::Validation(_))));
        assert!(!adapter.is_watching("not-base58!!!").await);
    }
}
