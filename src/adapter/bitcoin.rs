//! Bitcoin Adapter: polls a full node over JSON-RPC 1.0 / HTTP Basic auth.
//!
//! Unlike the EVM and Solana adapters there is no per-address subscription:
//! one poll loop walks every new block and checks every output address
//! against the registry. `lastProcessedBlock` only advances once an entire
//! polled range has been processed without error, so a crash (or an RPC
//! failure) mid-range causes the whole range to be reprocessed on the next
//! tick; downstream is expected to deduplicate by `(chainKey, txHash, address)`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bitcoincore_rpc::json::GetRawTransactionResultVoutScriptPubKey;
use bitcoincore_rpc::{Auth, Client, RpcApi};
use tokio::sync::Mutex;
use url::Url;

use crate::adapter::{AdapterContext, ChainAdapter, enqueue_or_log};
use crate::error::IndexerError;
use crate::model::{AddressEntry, ChainFamily, ChainKey, DetectedPayment, TokenId, TokenStrategy};
use crate::queue::WorkQueue;
use crate::registry::AddressRegistry;

fn bitcoin_err(e: bitcoincore_rpc::Error) -> IndexerError {
    IndexerError::Transport(e.to_string())
}

fn extract_output_address(script_pub_key: &GetRawTransactionResultVoutScriptPubKey) -> Option<String> {
    if let Some(address) = &script_pub_key.address {
        return Some(address.clone().assume_checked().to_string());
    }
    script_pub_key
        .addresses
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(|addr| addr.clone().assume_checked().to_string())
}

struct FetchedBlock {
    time: i64,
    /// `(txid, output address, value in satoshis)`.
    outputs: Vec<(String, String, u64)>,
}

struct Inner {
    chain_key: ChainKey,
    client: Arc<Client>,
    poll_interval: Duration,
    work_queue: Arc<dyn WorkQueue>,
    registry: Mutex<AddressRegistry>,
    last_processed_block: Mutex<Option<u64>>,
}

pub struct BitcoinAdapter {
    inner: Arc<Inner>,
}

impl BitcoinAdapter {
    pub fn new(
        chain_key: ChainKey,
        rpc_url: Url,
        rpc_user: String,
        rpc_password: String,
        poll_interval: Duration,
        work_queue: Arc<dyn WorkQueue>,
    ) -> Result<Self, IndexerError> {
        let client = Client::new(rpc_url.as_str(), Auth::UserPass(rpc_user, rpc_password))
            .map_err(|e| IndexerError::Config(format!("failed to construct bitcoin RPC client: {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                chain_key,
                client: Arc::new(client),
                poll_interval,
                work_queue,
                registry: Mutex::new(AddressRegistry::new(ChainFamily::Bip122)),
                last_processed_block: Mutex::new(None),
            }),
        })
    }

    pub async fn is_watching(&self, address: &str) -> bool {
        let registry = self.inner.registry.lock().await;
        registry
            .active_strategies()
            .any(|strategy| registry.lookup_by_address(strategy, address).is_some())
    }

    /// Runs on a blocking thread: walks `(lastProcessed, currentHeight]`,
    /// collecting every output address/value. Returns the observed chain
    /// height and the blocks fetched; an empty `outputs` vec on a block is
    /// normal, not an error.
    fn fetch_range(client: &Client, last_processed: Option<u64>) -> Result<(u64, Vec<FetchedBlock>), IndexerError> {
        let current_height = client.get_block_count().map_err(bitcoin_err)?;
        let from = last_processed.unwrap_or(current_height);
        if current_height <= from {
            return Ok((from, Vec::new()));
        }

        let mut blocks = Vec::new();
        for height in (from + 1)..=current_height {
            let hash = client.get_block_hash(height).map_err(bitcoin_err)?;
            let info = client.get_block_info(&hash).map_err(bitcoin_err)?;
            let mut outputs = Vec::new();
            for txid in &info.tx {
                let raw = client.get_raw_transaction_info(txid, None).map_err(bitcoin_err)?;
                for vout in &raw.vout {
                    let Some(address) = extract_output_address(&vout.script_pub_key) else {
                        continue;
                    };
                    outputs.push((txid.to_string(), address, vout.value.to_sat()));
                }
            }
            blocks.push(FetchedBlock {
                time: info.time as i64,
                outputs,
            });
        }
        Ok((current_height, blocks))
    }

    async fn poll_once(inner: &Arc<Inner>) -> Result<(), IndexerError> {
        let client = inner.client.clone();
        let last = *inner.last_processed_block.lock().await;
        let (new_height, blocks) = tokio::task::spawn_blocking(move || Self::fetch_range(&client, last))
            .await
            .map_err(|e| IndexerError::Transport(format!("bitcoin poll task panicked: {e}")))??;

        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip:0".into()),
        };
        {
            let registry = inner.registry.lock().await;
            for block in &blocks {
                for (txid, address, satoshis) in &block.outputs {
                    if *satoshis == 0 {
                        continue;
                    }
                    let Some(entry) = registry.lookup_by_address(&strategy, address) else {
                        continue;
                    };
                    let payment = DetectedPayment {
                        chain_key: inner.chain_key.clone(),
                        token_id: entry.token_id.clone(),
                        address: entry.address.clone(),
                        derivation_path: entry.derivation_path.clone(),
                        tx_hash: txid.clone(),
                        sender: String::new(),
                        amount: satoshis.to_string(),
                        timestamp: block.time,
                    };
                    enqueue_or_log(&inner.work_queue, &inner.chain_key, payment).await;
                }
            }
        }

        // Advance only now that the whole inclusive range is behind us.
        *inner.last_processed_block.lock().await = Some(new_height);
        Ok(())
    }
}

#[async_trait]
impl ChainAdapter for BitcoinAdapter {
    async fn start(&self, ctx: AdapterContext) -> Result<(), IndexerError> {
        let inner = self.inner.clone();
        let token = ctx.cancellation_token();
        ctx.spawn_tracked(async move {
            let mut interval = tokio::time::interval(inner.poll_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = interval.tick() => {
                        if let Err(e) = BitcoinAdapter::poll_once(&inner).await {
                            tracing::warn!(
                                chain_key = %inner.chain_key,
                                error = %e,
                                "bitcoin poll tick failed; lastProcessedBlock not advanced"
                            );
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn stop(&self) -> Result<(), IndexerError> {
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
        let watch_key = entry.watch_key(ChainFamily::Bip122);
        registry.remove(&strategy, &watch_key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryWorkQueue;

    fn adapter() -> BitcoinAdapter {
        BitcoinAdapter::new(
            ChainKey::new("bip122", "000000000019d6689c085ae165831e93"),
            Url::parse("http://localhost:8332").unwrap(),
            "user".into(),
            "pass".into(),
            Duration::from_secs(5),
            Arc::new(InMemoryWorkQueue::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn add_then_remove_leaves_the_registry_empty() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip:0".into()),
        };
        let entry = AddressEntry::new(TokenId("slip:0".into()), "bc1qexampleaddress", "m/44'/0'/0'/0/0");
        adapter
            .on_address_added(strategy.clone(), entry.clone())
            .await
            .unwrap();
        assert!(adapter.is_watching("bc1qexampleaddress").await);

        adapter.on_address_removed(strategy, entry).await.unwrap();
        assert!(!adapter.is_watching("bc1qexampleaddress").await);
    }

    #[tokio::test]
    async fn lookup_is_exact_case_for_bitcoin_addresses() {
        let adapter = adapter();
        let strategy = TokenStrategy::Native {
            token_id: TokenId("slip:0".into()),
        };
        let entry = AddressEntry::new(TokenId("slip:0".into()), "BC1QEXAMPLE", "m/44'/0'/0'/0/1");
        adapter.on_address_added(strategy, entry).await.unwrap();

        assert!(adapter.is_watching("BC1QEXAMPLE").await);
        assert!(!adapter.is_watching("bc1qexample").await);
    }
}
