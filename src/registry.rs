//! In-process Address Registry: tracks watched addresses per (chain, token)
//! strategy for one chain's adapter.
//!
//! Strictly in-process — authoritative state lives in the control plane plus
//! the Active-Invoice Source. Rebuilding from scratch at restart is the
//! normal case, so this type carries no persistence of its own.

use std::collections::HashMap;

use crate::model::{AddressEntry, ChainFamily, TokenStrategy, WatchKey};

/// Per-chain registry of watched addresses, keyed by [`TokenStrategy`] then [`WatchKey`].
#[derive(Debug, Default)]
pub struct AddressRegistry {
    family: Option<ChainFamily>,
    strategies: HashMap<String, (TokenStrategy, HashMap<WatchKey, AddressEntry>)>,
}

impl AddressRegistry {
    pub fn new(family: ChainFamily) -> Self {
        Self {
            family: Some(family),
            strategies: HashMap::new(),
        }
    }

    fn family(&self) -> ChainFamily {
        self.family.unwrap_or(ChainFamily::Unknown)
    }

    /// Adds a watched entry under its strategy.
    ///
    /// Returns `true` iff this is the first entry for the strategy (the
    /// caller should start the corresponding adapter substream). Adding the
    /// same `(strategy, WatchKey)` pair twice is idempotent and returns `false`
    /// on the second call.
    pub fn add(&mut self, strategy: TokenStrategy, entry: AddressEntry) -> bool {
        let key = strategy.token_key();
        let watch_key = entry.watch_key(self.family());
        let bucket = self
            .strategies
            .entry(key)
            .or_insert_with(|| (strategy, HashMap::new()));
        let was_empty = bucket.1.is_empty();
        bucket.1.insert(watch_key, entry);
        was_empty
    }

    /// Removes a watched entry.
    ///
    /// Returns `true` iff this was the last entry for the strategy (the
    /// caller should stop the corresponding adapter substream).
    pub fn remove(&mut self, strategy: &TokenStrategy, watch_key: &WatchKey) -> bool {
        let key = strategy.token_key();
        let Some(bucket) = self.strategies.get_mut(&key) else {
            return false;
        };
        bucket.1.remove(watch_key);
        if bucket.1.is_empty() {
            self.strategies.remove(&key);
            true
        } else {
            false
        }
    }

    /// Looks up a watched entry by its on-chain address within one strategy.
    ///
    /// Comparison follows the chain family's case semantics (see
    /// [`AddressEntry::watch_key`]): case-insensitive for EVM, case-sensitive
    /// everywhere else.
    pub fn lookup_by_address(
        &self,
        strategy: &TokenStrategy,
        address: &str,
    ) -> Option<&AddressEntry> {
        let key = strategy.token_key();
        let (_, entries) = self.strategies.get(&key)?;
        let address_key = match self.family() {
            ChainFamily::Eip155 => address.to_lowercase(),
            _ => address.to_string(),
        };
        entries
            .values()
            .find(|entry| entry.watch_key(self.family()).address_key == address_key)
    }

    /// Returns `true` iff at least one entry maps to this strategy.
    pub fn is_active(&self, strategy: &TokenStrategy) -> bool {
        self.strategies.contains_key(&strategy.token_key())
    }

    /// Returns all currently active strategies, e.g. to rebuild subscriptions on reconnect.
    pub fn active_strategies(&self) -> impl Iterator<Item = &TokenStrategy> {
        self.strategies.values().map(|(strategy, _)| strategy)
    }

    /// Returns every entry currently watched under a strategy.
    pub fn entries_for(&self, strategy: &TokenStrategy) -> impl Iterator<Item = &AddressEntry> {
        self.strategies
            .get(&strategy.token_key())
            .into_iter()
            .flat_map(|(_, entries)| entries.values())
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}
