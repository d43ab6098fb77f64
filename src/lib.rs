//! Pricing-state engine for multi-protocol swap aggregation.
//!
//! # Overview
//!
//! Always-available, block-versioned in-memory mirror of AMM pool state.
//!
//! A [`registry::PoolRegistry`] per protocol family resolves token pairs
//! to pools, lazily attaches a [`subscriber::PoolSubscriber`] per pool and
//! answers pricing queries from local snapshots. Subscribers fetch their
//! initial state through one batched read ([`multicall::MulticallBatcher`])
//! and stay current by replaying decoded event logs through pure
//! transitions, so the same ordered log sequence always reproduces the
//! same state. Pricing functions ([`engine`], the StableSwap methods on
//! [`state::StableState`]/[`state::MetaState`]) reproduce the deployed
//! contracts' integer arithmetic exactly.
//!
//! Transport, ABI encoding and out-of-band caching stay behind the
//! [`chain`] collaborator traits; production wiring injects a node-backed
//! [`chain::ChainSource`] and protocol codecs, tests inject scripted
//! mocks.
//!
//! See `./tests` for end-to-end examples.
//!
//! # Limitations/follow-ups
//!
//! * One pool per pair and protocol; multi-fee-tier pair sets are not
//!     modeled.
//!
//! * Reorg handling relies on the embedding indexer calling
//!     [`registry::PoolRegistry::rollback`]; there is no chain-watcher in
//!     the crate itself.

pub mod chain;
pub mod engine;
pub mod error;
pub mod math;
pub mod multicall;
pub mod registry;
pub mod state;
pub mod store;
pub mod subscriber;
pub mod types;

pub use error::PricerError;
pub use types::{PairKey, PoolPrices, StateInstant, SwapSide, Token};
