//! Configuration for the chain-watch indexer.
//!
//! CLI entrypoint via `clap` (env-overridable), chain/adapter settings loaded
//! from a JSON file whose string fields may reference environment variables
//! through `$VAR` / `${VAR}` syntax (the [`LiteralOrEnv`] wrapper).

use std::collections::HashMap;
use std::fs;
use std::ops::Deref;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Deserializer, de};
use url::Url;

use crate::error::ConfigError;
use crate::model::ChainKey;

/// CLI arguments for the indexer binary.
#[derive(Parser, Debug)]
#[command(name = "chainwatch-indexer")]
#[command(about = "Multi-chain payment indexer")]
pub struct CliArgs {
    /// Path to the JSON configuration file describing chains and collaborators.
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

/// A transparent wrapper that resolves `$VAR` / `${VAR}` environment variable
/// references during deserialization, falling back to treating the string as
/// a literal value otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(T);

impl<T> LiteralOrEnv<T> {
    pub fn inner(&self) -> &T {
        &self.0
    }

    pub fn into_inner(self) -> T {
        self.0
    }

    fn parse_env_var_syntax(s: &str) -> Option<String> {
        if let Some(stripped) = s.strip_prefix("${") {
            stripped.strip_suffix('}').map(str::to_string)
        } else if let Some(name) = s.strip_prefix('$') {
            (!name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_'))
                .then(|| name.to_string())
        } else {
            None
        }
    }
}

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<'de, T> Deserialize<'de> for LiteralOrEnv<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let value = if let Some(var_name) = Self::parse_env_var_syntax(&s) {
            std::env::var(&var_name).map_err(|_| {
                de::Error::custom(format!(
                    "environment variable '{var_name}' not found (referenced as '{s}')"
                ))
            })?
        } else {
            s
        };
        let parsed = value
            .parse::<T>()
            .map_err(|e| de::Error::custom(format!("failed to parse value: {e}")))?;
        Ok(LiteralOrEnv(parsed))
    }
}

/// Top-level indexer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// KVB (Redis) connection URL, supports `$VAR` substitution.
    pub kvb_url: LiteralOrEnv<String>,
    /// Active-Invoice Source base URL.
    pub ais_url: LiteralOrEnv<Url>,
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)
            .map_err(|e| ConfigError(format!("failed to read {}: {e}", path.display())))?;
        let config: Config = serde_json::from_str(&raw)
            .map_err(|e| ConfigError(format!("failed to parse {}: {e}", path.display())))?;
        if config.chains.is_empty() {
            return Err(ConfigError("at least one chain must be configured".into()));
        }
        Ok(config)
    }

    pub fn kvb_url(&self) -> &str {
        self.kvb_url.inner()
    }

    pub fn ais_url(&self) -> &Url {
        self.ais_url.inner()
    }
}

/// Per-chain configuration, tagged by adapter family.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum ChainConfig {
    Eip155(Eip155ChainConfig),
    Bitcoin(BitcoinChainConfig),
    Solana(SolanaChainConfig),
    Test(TestChainConfig),
}

impl ChainConfig {
    pub fn chain_key(&self) -> &ChainKey {
        match self {
            ChainConfig::Eip155(c) => &c.chain_key,
            ChainConfig::Bitcoin(c) => &c.chain_key,
            ChainConfig::Solana(c) => &c.chain_key,
            ChainConfig::Test(c) => &c.chain_key,
        }
    }

    pub fn shell(&self) -> &ShellConfig {
        match self {
            ChainConfig::Eip155(c) => &c.shell,
            ChainConfig::Bitcoin(c) => &c.shell,
            ChainConfig::Solana(c) => &c.shell,
            ChainConfig::Test(c) => &c.shell,
        }
    }

    /// The native tokenId this chain uses (`slip44:<coinType>` or `slip:0`), and
    /// the token-prefix string used for fungible tokens (e.g. `erc20`, `bep20`, `spl`).
    pub fn native_token(&self) -> Option<(&str, &str)> {
        match self {
            ChainConfig::Eip155(c) => Some((&c.native_token_id, &c.token_prefix)),
            ChainConfig::Bitcoin(_) => None,
            ChainConfig::Solana(c) => Some((&c.native_token_id, "spl")),
            ChainConfig::Test(_) => None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_lease_ttl_secs() -> u64 {
    60
}

/// Common lifecycle knobs every chain shares, regardless of adapter family.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

impl ShellConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Eip155ChainConfig {
    pub chain_key: ChainKey,
    pub ws_url: LiteralOrEnv<Url>,
    pub native_token_id: String,
    pub token_prefix: String,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitcoinChainConfig {
    pub chain_key: ChainKey,
    pub rpc_url: LiteralOrEnv<Url>,
    pub rpc_user: LiteralOrEnv<String>,
    pub rpc_password: LiteralOrEnv<String>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub shell: ShellConfig,
}

impl BitcoinChainConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolanaChainConfig {
    pub chain_key: ChainKey,
    pub rpc_url: LiteralOrEnv<Url>,
    pub pubsub_url: LiteralOrEnv<Url>,
    pub native_token_id: String,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TestChainConfig {
    pub chain_key: ChainKey,
    #[serde(default)]
    pub shell: ShellConfig,
}

/// Per-entry HashMap alias used when deserializing raw control-plane payloads.
pub type JsonMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_or_env_falls_back_to_literal() {
        let json = serde_json::json!("http://localhost:8545");
        let parsed: LiteralOrEnv<String> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.inner(), "http://localhost:8545");
    }

    #[test]
    fn literal_or_env_resolves_braced_var() {
        unsafe {
            std::env::set_var("CHAINWATCH_TEST_VAR", "resolved-value");
        }
        let json = serde_json::json!("${CHAINWATCH_TEST_VAR}");
        let parsed: LiteralOrEnv<String> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.inner(), "resolved-value");
    }

    #[test]
    fn literal_or_env_errors_on_missing_var() {
        let json = serde_json::json!("$CHAINWATCH_DEFINITELY_UNSET_VAR");
        let result: Result<LiteralOrEnv<String>, _> = serde_json::from_value(json);
        assert!(result.is_err());
    }

    #[test]
    fn config_requires_at_least_one_chain() {
        let dir = std::env::temp_dir().join(format!("chainwatch-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("empty.json");
        std::fs::write(
            &path,
            r#"{"kvb_url": "redis://localhost", "ais_url": "http://localhost/ais", "chains": []}"#,
        )
        .unwrap();
        let result = Config::load(&path);
        assert!(result.is_err());
    }
}
