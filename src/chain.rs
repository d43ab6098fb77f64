//! Collaborator contracts the pricing core depends on.
//!
//! The core never talks to a node or touches ABI byte layouts itself:
//! transport is behind [`ChainSource`], encode/decode behind [`PoolCodec`]
//! and the out-of-band cache behind [`KvCache`]. Production wiring injects
//! real implementations; tests inject counting/scripted mocks.

use alloy::primitives::{Address, Bytes};
use async_trait::async_trait;

use crate::{
    error::PricerError,
    state::{PoolEvent, PoolState},
    types::{Log, PairKey},
};

/// One read-only call of a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub target: Address,
    pub calldata: Bytes,
}

impl Call {
    pub fn new(target: Address, calldata: Bytes) -> Self {
        Self { target, calldata }
    }
}

/// Result of one call within a batch. Per-call success is independent of
/// the rest of the batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallResult {
    pub success: bool,
    pub return_data: Bytes,
}

impl CallResult {
    pub fn ok(return_data: Bytes) -> Self {
        Self { success: true, return_data }
    }

    pub fn failed() -> Self {
        Self { success: false, return_data: Bytes::new() }
    }
}

/// Batched read primitive of the chain data source.
///
/// One `call_many` invocation is one network round trip (e.g. a Multicall
/// aggregate under the hood); results come back in request order.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn call_many(
        &self,
        calls: &[Call],
        block_number: Option<u64>,
    ) -> Result<Vec<CallResult>, PricerError>;

    async fn block_number(&self) -> Result<u64, PricerError>;
}

/// Key/value cache collaborator used outside the hot per-block path
/// (pair resolution, rate caches).
#[async_trait]
pub trait KvCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn setex(&self, key: &str, ttl_seconds: u64, value: &str);
}

/// No-op cache for tests and cache-less deployments.
#[derive(Debug, Default)]
pub struct NullCache;

#[async_trait]
impl KvCache for NullCache {
    async fn get(&self, _key: &str) -> Option<String> {
        None
    }

    async fn setex(&self, _key: &str, _ttl_seconds: u64, _value: &str) {}
}

/// Coin index mapping for index-addressed pools (StableSwap family).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoinIndices {
    pub i: usize,
    pub j: usize,
    /// Indices address a metapool's combined underlying coin space rather
    /// than its own coins.
    pub underlying: bool,
}

/// ABI boundary of one protocol family.
///
/// Encoding of factory/pool reads and decoding of return data and logs is
/// protocol specific and kept outside the core; the codec is pure and
/// side-effect free so state transitions stay replayable.
pub trait PoolCodec: Send + Sync {
    /// Call resolving the exchange address for a canonical pair
    /// (factory `getPair` or equivalent).
    fn pair_lookup_call(&self, pair: &PairKey) -> Call;

    /// Decodes a pair lookup result; `None` means the factory reports no
    /// such pool.
    fn decode_pair_lookup(&self, return_data: &Bytes) -> Result<Option<Address>, PricerError>;

    /// Calls needed to construct a complete initial [`PoolState`] for a
    /// cold pool. Issued as a single batched read.
    fn initial_state_calls(&self, pool: Address, pair: &PairKey) -> Vec<Call>;

    /// Decodes the results of [`Self::initial_state_calls`], in the same
    /// order they were requested.
    fn decode_initial_state(
        &self,
        pool: Address,
        results: &[CallResult],
    ) -> Result<PoolState, PricerError>;

    /// Decodes a raw log into a typed pool event. `Ok(None)` means the log
    /// carries no event this protocol reacts to.
    fn decode_log(&self, log: &Log) -> Result<Option<PoolEvent>, PricerError>;

    /// Maps two token addresses to the pool's coin indices. `None` for
    /// pools addressed by token position rather than index (constant
    /// product), or when a token is not a coin of the pool.
    fn coin_indices(&self, _pool: Address, _from: Address, _to: Address) -> Option<CoinIndices> {
        None
    }

    /// Extra contract addresses a subscriber for `pool` must observe in
    /// addition to the pool itself (e.g. a wrapped basepool).
    fn extra_subscriptions(&self, _pool: Address) -> Vec<Address> {
        Vec::new()
    }

    /// Estimated execution gas for routing one swap through a pool of this
    /// protocol.
    fn pool_gas_cost(&self) -> u64;
}
