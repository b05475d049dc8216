//! EVM Adapter: watches `eip155:*` chains over a single WebSocket provider.
//!
//! Two substream kinds per chain, keyed by [`TokenStrategy::token_key`]:
//! a single native-value substream following `newHeads`, and one
//! Transfer-log substream per watched ERC-20/BEP-20 contract. Fungible
//! substreams are rebuilt (cancel-then-resubscribe) on every address
//! mutation so the log filter's `topics[2]` always reflects the current
//! watch set.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_consensus::Transaction;
use alloy_primitives::{Address, B256, U256, keccak256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types_eth::{BlockNumberOrTag, Filter, Log};
use alloy_transport_ws::WsConnect;
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::adapter::{AdapterContext, ChainAdapter, enqueue_or_log};
use crate::error::IndexerError;
use crate::model::{AddressEntry, ChainFamily, ChainKey, DetectedPayment, TokenId, TokenStrategy};
use crate::queue::WorkQueue;
use crate::registry::AddressRegistry;

const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

/// How long to wait before a substream that lost its transport reconnects.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

fn transfer_topic() -> B256 {
    keccak256(TRANSFER_EVENT_SIGNATURE.as_bytes())
}

fn address_topic(address: Address) -> B256 {
    let mut bytes = [0u8; 32];
    bytes[12..].copy_from_slice(address.as_slice());
    B256::from(bytes)
}

fn address_from_topic(topic: B256) -> Address {
    Address::from_slice(&topic.as_slice()[12..])
}

/// A fungible strategy value good only for its [`TokenStrategy::token_key`],
/// used to reach a registry bucket by contract address alone.
fn fungible_bucket_key(contract: &str) -> TokenStrategy {
    TokenStrategy::Fungible {
        token_id: TokenId(String::new()),
        contract: contract.to_string(),
    }
}

struct Inner {
    chain_key: ChainKey,
    ws_url: Url,
    work_queue: Arc<dyn WorkQueue>,
    registry: Mutex<AddressRegistry>,
    native_substream: Mutex<Option<CancellationToken>>,
    fungible_substreams: Mutex<HashMap<String, CancellationToken>>,
    ctx: OnceCell<AdapterContext>,
}

pub struct EvmAdapter {
    inner: Arc<Inner>,
}

impl EvmAdapter {
    pub fn new(chain_key: ChainKey, ws_url: Url, work_queue: Arc<dyn WorkQueue>) -> Self {
        Self {
            inner: Arc::new(Inner {
                chain_key,
                ws_url,
                work_queue,
                registry: Mutex::new(AddressRegistry::new(ChainFamily::Eip155)),
                native_substream: Mutex::new(None),
                fungible_substreams: Mutex::new(HashMap::new()),
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

    /// Rejects addresses that fail a 40-hex-digit parse or, for mixed-case
    /// input, an EIP-55 checksum round-trip.
    fn validate_address(address: &str) -> Result<Address, IndexerError> {
        let parsed = Address::from_str(address)
            .map_err(|e| IndexerError::Validation(format!("invalid EVM address {address:?}: {e}")))?;
        let hex_part = address.strip_prefix("0x").unwrap_or(address);
        let mixed_case = hex_part.chars().any(|c| c.is_ascii_uppercase());
        if mixed_case && parsed.to_checksum(None) != address {
            return Err(IndexerError::Validation(format!(
                "address {address:?} fails EIP-55 checksum"
            )));
        }
        Ok(parsed)
    }

    fn current_ctx(&self) -> Result<AdapterContext, IndexerError> {
        self.inner
            .ctx
            .get()
            .cloned()
            .ok_or_else(|| IndexerError::StateConflict("EVM adapter not started".into()))
    }

    async fn spawn_native_substream(inner: Arc<Inner>, ctx: AdapterContext) {
        let mut guard = inner.native_substream.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        ctx.spawn_tracked(Self::native_substream_loop(inner, token));
    }

    async fn native_substream_loop(inner: Arc<Inner>, token: CancellationToken) {
        while !token.is_cancelled() {
            match Self::run_native_substream(&inner, &token).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(chain_key = %inner.chain_key, error = %e, "EVM native substream disconnected; reconnecting");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_native_substream(inner: &Arc<Inner>, token: &CancellationToken) -> Result<(), IndexerError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(inner.ws_url.to_string()))
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        let mut stream = subscription.into_stream();

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                header = stream.next() => {
                    let Some(header) = header else {
                        return Err(IndexerError::Transport("block subscription stream ended".into()));
                    };
                    if let Err(e) = Self::process_block(inner, &provider, header.number).await {
                        tracing::warn!(chain_key = %inner.chain_key, block = header.number, error = %e, "failed to process block");
                    }
                }
            }
        }
    }

    async fn process_block<P: Provider>(
        inner: &Arc<Inner>,
        provider: &P,
        number: u64,
    ) -> Result<(), IndexerError> {
        let block = provider
            .get_block_by_number(BlockNumberOrTag::Number(number))
            .full()
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?
            .ok_or_else(|| IndexerError::Decode(format!("block {number} not found")))?;

        let registry = inner.registry.lock().await;
        for tx in block.transactions.txns() {
            let Some(to) = tx.to() else { continue };
            let value = tx.value();
            if value.is_zero() {
                continue;
            }
            let to_str = format!("{to:#x}");
            for strategy in registry.active_strategies() {
                if !matches!(strategy, TokenStrategy::Native { .. }) {
                    continue;
                }
                let Some(entry) = registry.lookup_by_address(strategy, &to_str) else {
                    continue;
                };
                let payment = DetectedPayment {
                    chain_key: inner.chain_key.clone(),
                    token_id: entry.token_id.clone(),
                    address: entry.address.clone(),
                    derivation_path: entry.derivation_path.clone(),
                    tx_hash: format!("{:#x}", tx.inner.tx_hash()),
                    sender: format!("{:#x}", tx.inner.signer()),
                    amount: value.to_string(),
                    timestamp: block.header.timestamp as i64,
                };
                enqueue_or_log(&inner.work_queue, &inner.chain_key, payment).await;
            }
        }
        Ok(())
    }

    async fn rebuild_fungible_substream(inner: Arc<Inner>, ctx: AdapterContext, contract: String) {
        let mut substreams = inner.fungible_substreams.lock().await;
        if let Some(old) = substreams.remove(&contract) {
            old.cancel();
        }
        let token = CancellationToken::new();
        substreams.insert(contract.clone(), token.clone());
        drop(substreams);

        ctx.spawn_tracked(Self::fungible_substream_loop(inner, contract, token));
    }

    async fn fungible_substream_loop(inner: Arc<Inner>, contract: String, token: CancellationToken) {
        while !token.is_cancelled() {
            match Self::run_fungible_substream(&inner, &contract, &token).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(chain_key = %inner.chain_key, contract = %contract, error = %e, "EVM fungible substream disconnected; reconnecting");
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }

    async fn run_fungible_substream(
        inner: &Arc<Inner>,
        contract: &str,
        token: &CancellationToken,
    ) -> Result<(), IndexerError> {
        let contract_address = Address::from_str(contract)
            .map_err(|e| IndexerError::Decode(format!("invalid watched contract {contract:?}: {e}")))?;

        let topics2 = {
            let registry = inner.registry.lock().await;
            let bucket = fungible_bucket_key(contract);
            registry
                .entries_for(&bucket)
                .filter_map(|entry| Address::from_str(&entry.address).ok())
                .map(address_topic)
                .collect::<Vec<_>>()
        };

        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(inner.ws_url.to_string()))
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;

        let filter = Filter::new()
            .address(contract_address)
            .event_signature(transfer_topic())
            .topic2(topics2);

        let subscription = provider
            .subscribe_logs(&filter)
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?;
        let mut stream = subscription.into_stream();

        loop {
            tokio::select! {
                _ = token.cancelled() => return Ok(()),
                log = stream.next() => {
                    let Some(log) = log else {
                        return Err(IndexerError::Transport("log subscription stream ended".into()));
                    };
                    if let Err(e) = Self::process_log(inner, &provider, log).await {
                        tracing::warn!(chain_key = %inner.chain_key, error = %e, "failed to process transfer log");
                    }
                }
            }
        }
    }

    async fn process_log<P: Provider>(inner: &Arc<Inner>, provider: &P, log: Log) -> Result<(), IndexerError> {
        let topics = log.topics();
        if topics.len() < 3 {
            return Err(IndexerError::Decode("transfer log missing topics".into()));
        }
        let from = address_from_topic(topics[1]);
        let to = address_from_topic(topics[2]);
        let to_str = format!("{to:#x}");

        let value = U256::from_be_slice(log.data().data.as_ref());
        if value.is_zero() {
            return Ok(());
        }

        let contract = format!("{:#x}", log.address());
        let entry = {
            let registry = inner.registry.lock().await;
            let bucket = fungible_bucket_key(&contract);
            registry.lookup_by_address(&bucket, &to_str).cloned()
        };
        let Some(entry) = entry else {
            return Ok(());
        };

        let block_number = log
            .block_number
            .ok_or_else(|| IndexerError::Decode("transfer log missing block number".into()))?;
        let block = provider
            .get_block_by_number(BlockNumberOrTag::Number(block_number))
            .await
            .map_err(|e| IndexerError::Transport(e.to_string()))?
            .ok_or_else(|| IndexerError::Decode(format!("block {block_number} not found")))?;
        let tx_hash = log
            .transaction_hash
            .map(|h| format!("{h:#x}"))
            .unwrap_or_default();

        let payment = DetectedPayment {
            chain_key: inner.chain_key.clone(),
            token_id: entry.token_id,
            address: entry.address,
            derivation_path: entry.derivation_path,
            tx_hash,
            sender: format!("{from:#x}"),
            amount: value.to_string(),
            timestamp: block.header.timestamp as i64,
        };
        enqueue_or_log(&inner.work_queue, &inner.chain_key, payment).await;
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for EvmAdapter {
    async fn start(&self, ctx: AdapterContext) -> Result<(), IndexerError> {
        self.inner
            .ctx
            .set(ctx)
            .map_err(|_| IndexerError::StateConflict("EVM adapter already started".into()))
    }

    async fn stop(&self) -> Result<(), IndexerError> {
        // The Shell already cancelled the shared token and drained the
        // TaskTracker before calling us; nothing chain-specific remains.
        Ok(())
    }

    async fn on_address_added(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        Self::validate_address(&entry.address)?;
        let ctx = self.current_ctx()?;

        let is_first = {
            let mut registry = self.inner.registry.lock().await;
            registry.add(strategy.clone(), entry)
        };

        match &strategy {
            TokenStrategy::Native { .. } => {
                if is_first {
                    Self::spawn_native_substream(self.inner.clone(), ctx).await;
                }
            }
            TokenStrategy::Fungible { contract, .. } => {
                Self::rebuild_fungible_substream(self.inner.clone(), ctx, contract.clone()).await;
            }
        }
        Ok(())
    }

    async fn on_address_removed(
        &self,
        strategy: TokenStrategy,
        entry: AddressEntry,
    ) -> Result<(), IndexerError> {
        let watch_key = entry.watch_key(ChainFamily::Eip155);
        let is_last = {
            let mut registry = self.inner.registry.lock().await;
            registry.remove(&strategy, &watch_key)
        };

        match &strategy {
            TokenStrategy::Native { .. } => {
                if is_last {
                    let mut guard = self.inner.native_substream.lock().await;
                    if let Some(token) = guard.take() {
                        token.cancel();
                    }
                }
            }
            TokenStrategy::Fungible { contract, .. } => {
                if is_last {
                    let mut substreams = self.inner.fungible_substreams.lock().await;
                    if let Some(token) = substreams.remove(contract) {
                        token.cancel();
                    }
                } else {
                    let ctx = self.current_ctx()?;
                    Self::rebuild_fungible_substream(self.inner.clone(), ctx, contract.clone()).await;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;

    fn adapter() -> EvmAdapter {
        EvmAdapter::new(
            ChainKey::new("eip155", "31337"),
            Url::parse("ws://localhost:8545").unwrap(),
            Arc::new(InMemoryWorkQueue::new()),
        )
    }

    #[test]
    fn validate_address_accepts_lowercase_and_checksummed() {
        assert!(EvmAdapter::validate_address("0x1234567890123456789012345678901234567890").is_ok());
        let checksummed = Address::from_str("0x1234567890123456789012345678901234567890")
            .unwrap()
            .to_checksum(None);
        assert!(EvmAdapter::validate_address(&checksummed).is_ok());
    }

    #[test]
    fn validate_address_rejects_bad_checksum_and_bad_hex() {
        assert!(EvmAdapter::validate_address("0xNotHex").is_err());
        assert!(EvmAdapter::validate_address("0x1234567890123456789012345678901234567A").is_err());
    }

    #[test]
    fn address_topic_zero_pads_into_the_final_20_bytes() {
        let address = Address::from_str("0x1234567890123456789012345678901234567890").unwrap();
        let topic = address_topic(address);
        assert_eq!(&topic.as_slice()[..12], &[0u8; 12]);
        assert_eq!(address_from_topic(topic), address);
    }

    #[tokio::test]
    async fn on_address_added_before_start_reports_state_conflict() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:60".into()),
        };
        let entry = AddressEntry::new(
            TokenId("slip44:60".into()),
            "0x1234567890123456789012345678901234567890",
            "m/44'/60'/0'/0/0",
        );
        let result = adapter.on_address_added(strategy, entry).await;
        assert!(matches!(result, Err(IndexerError::StateConflict(_))));
    }

    #[tokio::test]
    async fn on_address_added_rejects_invalid_address_before_touching_state() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip44:60".into()),
        };
        let entry = AddressEntry::new(TokenId("slip44:60".into()), "not-an-address", "m/44'/60'/0'/0/0");
        let result = adapter.on_address_added(strategy, entry).await;
        assert!(matches!(result, Err(IndexerError::Validation(_))));
        assert!(!adapter.is_watching("not-an-address").await);
    }
}
