//! Active-Invoice Source (AIS): external collaborator returning the
//! currently-active set of watched addresses on demand.
//!
//! The Shell calls this once at `start()` to bootstrap itself before
//! subscribing to live control-plane traffic, so that a freshly started
//! replica (or one recovering from a crash) doesn't miss adds that happened
//! while no listener was running for its chain.

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::model::ChainKey;

/// One entry in the AIS's active-invoice listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActiveInvoice {
    #[serde(rename = "blockchainKey")]
    pub blockchain_key: String,
    #[serde(rename = "tokenId")]
    pub token_id: String,
    pub address: String,
    #[serde(rename = "derivationPath")]
    pub derivation_path: String,
}

#[derive(Debug, thiserror::Error)]
pub enum AisError {
    #[error("active-invoice source request failed: {0}")]
    Request(String),
    #[error("failed to decode active-invoice source response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Returns the active invoices scoped to one chain, as of call time.
#[async_trait]
pub trait ActiveInvoiceSource: Send + Sync {
    async fn active_invoices(&self, chain_key: &ChainKey) -> Result<Vec<ActiveInvoice>, AisError>;
}

/// HTTP-backed default [`ActiveInvoiceSource`].
///
/// A `GET {base_url}/active-invoices?blockchainKey=<chainKey>` returning a
/// JSON array of [`ActiveInvoice`] is the entire contract; the real invoice
/// service lives outside this core.
pub struct HttpActiveInvoiceSource {
    base_url: Url,
    client: std::sync::Arc<dyn HttpClient>,
}

/// Minimal transport seam so tests can swap in a fake without a real socket.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: Url) -> Result<String, AisError>;
}

impl HttpActiveInvoiceSource {
    pub fn new(base_url: Url, client: std::sync::Arc<dyn HttpClient>) -> Self {
        Self { base_url, client }
    }
}

#[async_trait]
impl ActiveInvoiceSource for HttpActiveInvoiceSource {
    async fn active_invoices(&self, chain_key: &ChainKey) -> Result<Vec<ActiveInvoice>, AisError> {
        let mut url = self.base_url.clone();
        url.query_pairs_mut()
            .append_pair("blockchainKey", &chain_key.to_string());
        let body = self.client.get(url).await?;
        let invoices: Vec<ActiveInvoice> = serde_json::from_str(&body)?;
        let chain_key_str = chain_key.to_string();
        Ok(invoices
            .into_iter()
            .filter(|i| i.blockchain_key == chain_key_str)
            .collect())
    }
}

/// `reqwest`-backed [`HttpClient`], the same HTTP stack the teacher crate
/// wraps in its own `x402-reqwest` crate.
#[derive(Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: Url) -> Result<String, AisError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| AisError::Request(e.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AisError::Request(format!("failed to read AIS response body: {e}")))?;
        if !status.is_success() {
            return Err(AisError::Request(format!("AIS responded with status {status}")));
        }
        Ok(body)
    }
}

/// In-memory [`ActiveInvoiceSource`] fake for tests.
#[derive(Clone, Default)]
pub struct InMemoryActiveInvoiceSource {
    invoices: std::sync::Arc<std::sync::Mutex<Vec<ActiveInvoice>>>,
}

impl InMemoryActiveInvoiceSource {
    pub fn new(invoices: Vec<ActiveInvoice>) -> Self {
        Self {
            invoices: std::sync::Arc::new(std::sync::Mutex::new(invoices)),
        }
    }

    pub fn push(&self, invoice: ActiveInvoice) {
        self.invoices.lock().unwrap().push(invoice);
    }
}

#[async_trait]
impl ActiveInvoiceSource for InMemoryActiveInvoiceSource {
    async fn active_invoices(&self, chain_key: &ChainKey) -> Result<Vec<ActiveInvoice>, AisError> {
        let chain_key_str = chain_key.to_string();
        Ok(self
            .invoices
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.blockchain_key == chain_key_str)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_ais_scopes_to_the_requested_chain() {
        let ais = InMemoryActiveInvoiceSource::new(vec![
            ActiveInvoice {
                blockchain_key: "eip155:1".into(),
                token_id: "slip44:60".into(),
                address: "0xabc".into(),
                derivation_path: "m/44'/60'/0'/0/1".into(),
            },
            ActiveInvoice {
                blockchain_key: "solana:x".into(),
                token_id: "slip44:501".into(),
                address: "Abc123".into(),
                derivation_path: "m/44'/501'/0'/0'".into(),
            },
        ]);

        let result = ais.active_invoices(&ChainKey::new("eip155", "1")).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address, "0xabc");
    }

    struct FakeHttpClient {
        body: String,
    }

    #[async_trait]
    impl HttpClient for FakeHttpClient {
        async fn get(&self, url: Url) -> Result<String, AisError> {
            assert_eq!(
                url.query_pairs().find(|(k, _)| k == "blockchainKey").map(|(_, v)| v.into_owned()),
                Some("eip155:1".to_string())
            );
            Ok(self.body.clone())
        }
    }

    #[tokio::test]
    async fn http_ais_scopes_the_response_to_the_requested_chain_and_passes_the_query_param() {
        let body = serde_json::to_string(&serde_json::json!([
            {"blockchainKey": "eip155:1", "tokenId": "slip44:60", "address": "0xabc", "derivationPath": "m/44'/60'/0'/0/1"},
            {"blockchainKey": "solana:x", "tokenId": "slip44:501", "address": "Abc123", "derivationPath": "m/44'/501'/0'/0'"},
        ]))
        .unwrap();
        let client = std::sync::Arc::new(FakeHttpClient { body });
        let ais = HttpActiveInvoiceSource::new(
            Url::parse("http://localhost:9000/active-invoices").unwrap(),
            client,
        );

        let result = ais.active_invoices(&ChainKey::new("eip155", "1")).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].address, "0xabc");
    }
}
