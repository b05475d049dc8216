//! Chain-watch indexer entrypoint.
//!
//! Loads chain configuration, connects the KVB/WQ/AIS collaborators, and runs
//! one [`shell::ListenerShell`] per configured chain until a shutdown signal
//! arrives.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG` (or `--config`) points at the JSON chain-configuration file
//! - `OTEL_*` variables enable tracing export to systems like Honeycomb

mod adapter;
mod ais;
mod config;
mod control_plane;
mod error;
mod kvb;
mod model;
mod queue;
mod registry;
mod shell;
mod shutdown;
mod telemetry;

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;

use crate::adapter::ChainAdapter;
use crate::adapter::bitcoin::BitcoinAdapter;
use crate::adapter::evm::EvmAdapter;
use crate::adapter::solana::SolanaAdapter;
use crate::adapter::test_chain::TestChainAdapter;
use crate::ais::{HttpActiveInvoiceSource, ReqwestHttpClient};
use crate::config::{ChainConfig, CliArgs, Config};
use crate::error::IndexerError;
use crate::kvb::RedisKvb;
use crate::queue::{RedisWorkQueue, WorkQueue};
use crate::shell::ListenerShell;
use crate::shutdown::SigDown;
use crate::telemetry::Telemetry;

/// List key `RedisWorkQueue` pushes onto; matches the fixed downstream job
/// name for every enqueued `DetectedPayment`.
const WORK_QUEUE_LIST_KEY: &str = "invoice-payment-detected";

fn build_adapter(
    chain: &ChainConfig,
    work_queue: Arc<dyn WorkQueue>,
) -> Result<Arc<dyn ChainAdapter>, IndexerError> {
    let adapter: Arc<dyn ChainAdapter> = match chain {
        ChainConfig::Eip155(c) => Arc::new(EvmAdapter::new(
            c.chain_key.clone(),
            c.ws_url.inner().clone(),
            work_queue,
        )),
        ChainConfig::Bitcoin(c) => Arc::new(BitcoinAdapter::new(
            c.chain_key.clone(),
            c.rpc_url.inner().clone(),
            c.rpc_user.inner().clone(),
            c.rpc_password.inner().clone(),
            c.poll_interval(),
            work_queue,
        )?),
        ChainConfig::Solana(c) => Arc::new(SolanaAdapter::new(
            c.chain_key.clone(),
            c.rpc_url.inner().clone(),
            c.pubsub_url.inner().clone(),
            work_queue,
        )),
        ChainConfig::Test(c) => Arc::new(TestChainAdapter::new(c.chain_key.clone(), work_queue)),
    };
    Ok(adapter)
}

/// Initializes the chain-watch indexer.
///
/// - Loads `.env` variables and the JSON chain configuration.
/// - Initializes OpenTelemetry tracing, if configured.
/// - Connects to the KVB/WQ/AIS collaborators.
/// - Starts one Listener Shell per configured chain.
/// - Runs until SIGTERM/SIGINT, then tears every shell down gracefully.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let _telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let cli = CliArgs::parse();
    let config = Config::load(&cli.config)?;

    let kvb = Arc::new(RedisKvb::connect(config.kvb_url()).await?);
    let work_queue: Arc<dyn WorkQueue> =
        Arc::new(RedisWorkQueue::connect(config.kvb_url(), WORK_QUEUE_LIST_KEY).await?);
    let ais = Arc::new(HttpActiveInvoiceSource::new(
        config.ais_url().clone(),
        Arc::new(ReqwestHttpClient::new()),
    ));

    let sig_down = SigDown::try_new()?;

    let mut shells = Vec::with_capacity(config.chains.len());
    for chain in &config.chains {
        let adapter = match build_adapter(chain, work_queue.clone()) {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::error!(chain_key = %chain.chain_key(), error = %e, "failed to construct chain adapter");
                continue;
            }
        };
        let shell = Arc::new(ListenerShell::new(
            chain.chain_key().clone(),
            chain.shell().clone(),
            kvb.clone(),
            ais.clone(),
            adapter,
        ));
        match shell.start().await {
            Ok(true) => shells.push(shell),
            Ok(false) => tracing::info!(
                chain_key = %chain.chain_key(),
                "lease already held elsewhere; not running this chain locally"
            ),
            Err(e) => tracing::error!(
                chain_key = %chain.chain_key(),
                error = %e,
                "failed to start listener shell"
            ),
        }
    }

    tracing::info!(chains = shells.len(), "indexer running");
    sig_down.recv().await;
    tracing::info!("shutdown signal received; stopping listener shells");

    for shell in &shells {
        if let Err(e) = shell.stop().await {
            tracing::warn!(chain_key = %shell.chain_key(), error = %e, "error stopping listener shell");
        }
    }

    Ok(())
}
