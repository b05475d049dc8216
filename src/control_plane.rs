//! Control plane: the pub/sub interface between the (out-of-scope) invoice
//! module and a [`crate::shell::ListenerShell`].
//!
//! Two halves live here: [`normalize`]/[`parse_address_event`] on the
//! subscriber side (what the Shell uses to decode an incoming message), and
//! [`ControlPlanePublisher`] on the producer side (what a test, or a real
//! invoice module, uses to publish one).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::kvb::{Kvb, KvbError};
use crate::model::ChainKey;

/// The three wire shapes a control-plane message may arrive in. Every
/// transport the KVB might plausibly hand back is covered: an already
/// JSON-decoded structure, a raw byte buffer, or a UTF-8 string.
#[derive(Debug, Clone)]
pub enum ControlPlanePayload {
    Parsed(Value),
    Bytes(Vec<u8>),
    Text(String),
}

impl From<Vec<u8>> for ControlPlanePayload {
    fn from(value: Vec<u8>) -> Self {
        ControlPlanePayload::Bytes(value)
    }
}

impl From<String> for ControlPlanePayload {
    fn from(value: String) -> Self {
        ControlPlanePayload::Text(value)
    }
}

impl From<Value> for ControlPlanePayload {
    fn from(value: Value) -> Self {
        ControlPlanePayload::Parsed(value)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("malformed control-plane payload: {0}")]
    Malformed(String),
    #[error("missing or non-string field {0:?}")]
    MissingField(&'static str),
}

/// Normalizes any of the three accepted wire shapes into a `serde_json::Value`.
///
/// This is the single entry point payload bytes/strings/structures pass
/// through before any field is inspected.
pub fn normalize(payload: ControlPlanePayload) -> Result<Value, ControlPlaneError> {
    match payload {
        ControlPlanePayload::Parsed(value) => Ok(value),
        ControlPlanePayload::Bytes(bytes) => {
            let text = std::str::from_utf8(&bytes)
                .map_err(|e| ControlPlaneError::Malformed(e.to_string()))?;
            serde_json::from_str(text).map_err(|e| ControlPlaneError::Malformed(e.to_string()))
        }
        ControlPlanePayload::Text(text) => {
            serde_json::from_str(&text).map_err(|e| ControlPlaneError::Malformed(e.to_string()))
        }
    }
}

/// A decoded `address:added` / `address:removed` event, field-checked for
/// presence and string-typedness but not yet validated against the address
/// registry's notion of a supported tokenId.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEvent {
    pub token_id: String,
    pub address: String,
    pub derivation_path: String,
}

fn required_string(value: &Value, field: &'static str) -> Result<String, ControlPlaneError> {
    value
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ControlPlaneError::MissingField(field))
}

/// Validates presence and string-typedness of `tokenId` / `address` /
/// `derivationPath` on an already-normalized payload.
pub fn parse_address_event(value: &Value) -> Result<AddressEvent, ControlPlaneError> {
    Ok(AddressEvent {
        token_id: required_string(value, "tokenId")?,
        address: required_string(value, "address")?,
        derivation_path: required_string(value, "derivationPath")?,
    })
}

/// Topic name for `address:added` on a chain.
pub fn added_topic(chain_key: &ChainKey) -> String {
    format!("indexer:{chain_key}:address:added")
}

/// Topic name for `address:removed` on a chain.
pub fn removed_topic(chain_key: &ChainKey) -> String {
    format!("indexer:{chain_key}:address:removed")
}

/// The singleton-lease key for a chain.
pub fn lease_key(chain_key: &ChainKey) -> String {
    format!("indexer:{chain_key}:running")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AddressEventWire {
    #[serde(rename = "tokenId")]
    token_id: String,
    address: String,
    #[serde(rename = "derivationPath")]
    derivation_path: String,
}

/// Thin producer counterpart to the Shell's subscriber half.
///
/// Used by the (out-of-scope) invoice module in production, and by this
/// crate's own integration tests as a stand-in "operator" actor publishing
/// over the same KVB the Shell subscribes through.
pub struct ControlPlanePublisher<K: Kvb> {
    kvb: K,
}

impl<K: Kvb> ControlPlanePublisher<K> {
    pub fn new(kvb: K) -> Self {
        Self { kvb }
    }

    pub async fn publish_added(
        &self,
        chain_key: &ChainKey,
        event: AddressEvent,
    ) -> Result<(), KvbError> {
        self.publish(added_topic(chain_key), event).await
    }

    pub async fn publish_removed(
        &self,
        chain_key: &ChainKey,
        event: AddressEvent,
    ) -> Result<(), KvbError> {
        self.publish(removed_topic(chain_key), event).await
    }

    async fn publish(&self, topic: String, event: AddressEvent) -> Result<(), KvbError> {
        let wire = AddressEventWire {
            token_id: event.token_id,
            address: event.address,
            derivation_path: event.derivation_path,
        };
        let encoded =
            serde_json::to_vec(&wire).expect("AddressEventWire serialization cannot fail");
        self.kvb.publish(&topic, &encoded).await
    }
}
