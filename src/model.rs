//! Core data model shared by the Listener Shell, Chain Adapters, and Address Registry.
//!
//! Mirrors the CAIP-2 chain-identifier approach used elsewhere in this codebase's
//! lineage: a chain is a `namespace:reference` pair that round-trips through a
//! plain string, with a small [`ChainFamily`] classifier layered on top to pick
//! the right adapter.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// A CAIP-2-shaped chain identifier, e.g. `eip155:1`, `bip122:<genesis>`, `solana:<genesis>`.
///
/// The reserved test value is `cg:testnet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainKey {
    pub namespace: String,
    pub reference: String,
}

impl ChainKey {
    pub fn new<N: Into<String>, R: Into<String>>(namespace: N, reference: R) -> Self {
        Self {
            namespace: namespace.into(),
            reference: reference.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    /// Classifies this chain key into the adapter family that should watch it.
    pub fn family(&self) -> ChainFamily {
        match self.namespace.as_str() {
            "eip155" => ChainFamily::Eip155,
            "bip122" => ChainFamily::Bip122,
            "solana" => ChainFamily::Solana,
            "cg" => ChainFamily::Test,
            _ => ChainFamily::Unknown,
        }
    }
}

impl fmt::Display for ChainKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.reference)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid chain key format: {0:?}")]
pub struct ChainKeyFormatError(String);

impl FromStr for ChainKey {
    type Err = ChainKeyFormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, reference) = s
            .split_once(':')
            .ok_or_else(|| ChainKeyFormatError(s.to_string()))?;
        if namespace.is_empty() || reference.is_empty() {
            return Err(ChainKeyFormatError(s.to_string()));
        }
        Ok(ChainKey::new(namespace, reference))
    }
}

impl Serialize for ChainKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChainKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ChainKey::from_str(&s).map_err(de::Error::custom)
    }
}

/// The adapter family a [`ChainKey`] dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    Eip155,
    Bip122,
    Solana,
    Test,
    Unknown,
}

/// An opaque asset identifier within one chain.
///
/// Three shapes are recognized: native (`slip44:<coinType>` or `slip:0`),
/// fungible (`<prefix>:<contract>`), and everything else, which is rejected
/// at registry entry time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(pub String);

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TokenId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_bitcoin_native(&self) -> bool {
        self.0 == "slip:0"
    }

    /// Parses the fungible-token shape `<prefix>:<contract>` if this token id has one.
    pub fn fungible_parts(&self) -> Option<(&str, &str)> {
        let (prefix, contract) = self.0.split_once(':')?;
        match prefix {
            "erc20" | "bep20" | "spl" => Some((prefix, contract)),
            _ => None,
        }
    }

    /// Parses the native-token shape `slip44:<coinType>` if this token id has one.
    pub fn native_slip44(&self) -> Option<&str> {
        self.0.strip_prefix("slip44:")
    }
}

/// The strategy an adapter follows to watch for transfers of one token on one chain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TokenStrategy {
    /// Follow every block's value-bearing transfers.
    Native { token_id: TokenId },
    /// Follow Transfer-log / account-data changes scoped to a contract or mint.
    Fungible { token_id: TokenId, contract: String },
}

impl TokenStrategy {
    /// Computes the strategy for a `(tokenId, chain family)` pair.
    ///
    /// Returns `None` for a tokenId shape this chain family does not support
    /// (e.g. a fungible token on Bitcoin, or an unrecognized prefix).
    pub fn from_token_id(token_id: &TokenId, family: ChainFamily) -> Option<Self> {
        match family {
            ChainFamily::Bip122 => {
                if token_id.is_bitcoin_native() {
                    Some(TokenStrategy::Native {
                        token_id: token_id.clone(),
                    })
                } else {
                    None
                }
            }
            ChainFamily::Eip155 => {
                if let Some((prefix, contract)) = token_id.fungible_parts() {
                    if prefix == "erc20" || prefix == "bep20" {
                        return Some(TokenStrategy::Fungible {
                            token_id: token_id.clone(),
                            contract: contract.to_string(),
                        });
                    }
                    return None;
                }
                if token_id.native_slip44().is_some() {
                    return Some(TokenStrategy::Native {
                        token_id: token_id.clone(),
                    });
                }
                None
            }
            ChainFamily::Solana => {
                if let Some((prefix, contract)) = token_id.fungible_parts() {
                    if prefix == "spl" {
                        return Some(TokenStrategy::Fungible {
                            token_id: token_id.clone(),
                            contract: contract.to_string(),
                        });
                    }
                    return None;
                }
                if token_id.native_slip44().is_some() {
                    return Some(TokenStrategy::Native {
                        token_id: token_id.clone(),
                    });
                }
                None
            }
            ChainFamily::Test => Some(TokenStrategy::Native {
                token_id: token_id.clone(),
            }),
            ChainFamily::Unknown => None,
        }
    }

    /// A key that groups watch entries sharing a single adapter substream.
    pub fn token_key(&self) -> String {
        match self {
            TokenStrategy::Native { token_id } => format!("native:{token_id}"),
            TokenStrategy::Fungible { contract, .. } => format!("fungible:{contract}"),
        }
    }

    pub fn token_id(&self) -> &TokenId {
        match self {
            TokenStrategy::Native { token_id } => token_id,
            TokenStrategy::Fungible { token_id, .. } => token_id,
        }
    }
}

/// Per-(chain, token) identity of one watched wallet.
///
/// For hex (EVM) addresses the address component is lowercased; for every
/// other chain family it is kept as received. Uniqueness is by this pair:
/// duplicate adds are idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatchKey {
    pub address_key: String,
    pub derivation_path: String,
}

impl WatchKey {
    pub fn new(address_key: impl Into<String>, derivation_path: impl Into<String>) -> Self {
        Self {
            address_key: address_key.into(),
            derivation_path: derivation_path.into(),
        }
    }
}

/// A watched wallet, as tracked by the Address Registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub token_id: TokenId,
    /// Original case as received from the control plane / AIS.
    pub address: String,
    pub derivation_path: String,
}

impl AddressEntry {
    pub fn new(
        token_id: TokenId,
        address: impl Into<String>,
        derivation_path: impl Into<String>,
    ) -> Self {
        Self {
            token_id,
            address: address.into(),
            derivation_path: derivation_path.into(),
        }
    }

    /// The registry watch key for this entry, given the chain family's
    /// address-comparison semantics (case-insensitive for EVM hex addresses,
    /// case-sensitive everywhere else).
    pub fn watch_key(&self, family: ChainFamily) -> WatchKey {
        let address_key = match family {
            ChainFamily::Eip155 => self.address.to_lowercase(),
            _ => self.address.clone(),
        };
        WatchKey::new(address_key, self.derivation_path.clone())
    }
}

/// The single output record of the core: one confirmed inbound transfer to a watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedPayment {
    pub chain_key: ChainKey,
    pub token_id: TokenId,
    pub address: String,
    pub derivation_path: String,
    pub tx_hash: String,
    pub sender: String,
    /// Smallest-unit integer amount on the source chain, as a base-10 string.
    pub amount: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_key_round_trips_through_display_and_from_str() {
        let key = ChainKey::new("eip155", "31337");
        let parsed: ChainKey = key.to_string().parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn chain_key_rejects_missing_colon() {
        assert!("eip15531337".parse::<ChainKey>().is_err());
    }

    #[test]
    fn chain_family_dispatches_by_namespace() {
        assert_eq!(ChainKey::new("eip155", "1").family(), ChainFamily::Eip155);
        assert_eq!(ChainKey::new("bip122", "x").family(), ChainFamily::Bip122);
        assert_eq!(ChainKey::new("solana", "x").family(), ChainFamily::Solana);
        assert_eq!(ChainKey::new("cg", "testnet").family(), ChainFamily::Test);
        assert_eq!(ChainKey::new("weird", "1").family(), ChainFamily::Unknown);
    }

    #[test]
    fn token_strategy_rejects_fungible_shapes_on_bitcoin() {
        let token_id = TokenId("erc20:0xabc".to_string());
        assert!(TokenStrategy::from_token_id(&token_id, ChainFamily::Bip122).is_none());
    }

    #[test]
    fn token_strategy_accepts_native_bitcoin() {
        let token_id = TokenId("slip:0".to_string());
        let strategy = TokenStrategy::from_token_id(&token_id, ChainFamily::Bip122).unwrap();
        assert_eq!(strategy.token_key(), "native:slip:0");
    }

    #[test]
    fn watch_key_lowercases_only_for_evm() {
        let entry = AddressEntry::new(TokenId("slip44:60".into()), "0xABCDEF", "m/44'/60'/0'/0/0");
        assert_eq!(entry.watch_key(ChainFamily::Eip155).address_key, "0xabcdef");
        assert_eq!(entry.watch_key(ChainFamily::Solana).address_key, "0xABCDEF");
    }
}
