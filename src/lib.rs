//! Multi-chain payment indexer core.
//!
//! Watches a configurable set of blockchains for inbound transfers to a
//! dynamically changing set of watched addresses, and emits a
//! [`model::DetectedPayment`] onto a work queue for each one detected.
//! Operators add and remove watched addresses at runtime through a pub/sub
//! control plane; this crate bootstraps itself from an external
//! active-invoice listing and coordinates with other replicas so that only
//! one listener per chain is ever active.
//!
//! # Modules
//!
//! - [`model`] — the shared data model ([`model::ChainKey`], [`model::TokenStrategy`],
//!   [`model::DetectedPayment`], ...).
//! - [`registry`] — [`registry::AddressRegistry`], the in-process per-chain watch set.
//! - [`adapter`] — one [`adapter::ChainAdapter`] per chain family: [`adapter::evm`],
//!   [`adapter::bitcoin`], [`adapter::solana`], and the deterministic [`adapter::test_chain`].
//! - [`shell`] — [`shell::ListenerShell`], the chain-agnostic lifecycle/coordination layer.
//! - [`kvb`] — the Key-Value & Bus trait and its Redis/in-memory implementations.
//! - [`queue`] — the downstream Work Queue trait and its Redis/in-memory implementations.
//! - [`ais`] — the Active-Invoice Source trait used to bootstrap a freshly started Shell.
//! - [`control_plane`] — topic naming, payload decoding, and the event publisher.
//! - [`config`] — CLI and JSON chain configuration.
//! - [`error`] — the shared error taxonomy.
//! - [`telemetry`] — tracing/OpenTelemetry setup.
//! - [`shutdown`] — SIGTERM/SIGINT handling.

pub mod adapter;
pub mod ais;
pub mod config;
pub mod control_plane;
pub mod error;
pub mod kvb;
pub mod model;
pub mod queue;
pub mod registry;
pub mod shell;
pub mod shutdown;
pub mod telemetry;
