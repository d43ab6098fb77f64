use alloy::primitives::{Address, B256, Bytes, U256};
use derive_more::Display;

/// Instant in chain history a state snapshot or event is consistent with.
#[derive(Clone, Copy, Debug, Display, PartialEq, PartialOrd, Eq, Ord, Hash, Default)]
#[display("#{block_number} @ {block_timestamp}")]
pub struct StateInstant {
    block_number: u64,
    block_timestamp: u64,
}

impl StateInstant {
    pub fn new(block_number: u64, block_timestamp: u64) -> Self {
        Self { block_number, block_timestamp }
    }

    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    pub fn block_timestamp(&self) -> u64 {
        self.block_timestamp
    }
}

/// ERC-20 token reference.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub fn new(address: Address, decimals: u8) -> Self {
        Self { address, decimals }
    }
}

/// Canonical pair key: `token0` is the lexicographically smaller address.
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
#[display("{token0}_{token1}")]
pub struct PairKey {
    token0: Address,
    token1: Address,
}

impl PairKey {
    /// Canonicalizes the ordering of two token addresses.
    /// Returns `None` for identical addresses (no such pool).
    pub fn new(a: Address, b: Address) -> Option<Self> {
        if a == b {
            return None;
        }
        if a < b { Some(Self { token0: a, token1: b }) } else { Some(Self { token0: b, token1: a }) }
    }

    pub fn token0(&self) -> Address {
        self.token0
    }

    pub fn token1(&self) -> Address {
        self.token1
    }

    /// Whether `from` is `token1`, i.e. pricing runs against reversed
    /// reserves.
    pub fn is_reversed(&self, from: Address) -> bool {
        self.token1 == from
    }
}

/// Trade direction requested by the aggregation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapSide {
    /// Fixed input amount, compute output.
    Sell,
    /// Fixed output amount, compute required input.
    Buy,
}

/// Undecoded log entry as delivered by the chain data source.
///
/// The core never inspects topics or data itself; decoding is delegated to
/// the [`crate::chain::PoolCodec`] collaborator.
#[derive(Clone, Debug)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// Identifier of a pool usable in `limit_identifiers` filters.
pub type PoolIdentifier = String;

/// Price levels computed for one pool over a vector of amounts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolPrices {
    /// Output (sell) or required input (buy) per requested amount.
    pub prices: Vec<U256>,
    /// Price for one whole unit of the source (sell) or destination (buy)
    /// token.
    pub unit: U256,
    pub pool_identifier: PoolIdentifier,
    pub pool_address: Address,
    /// Estimated execution gas for routing through this pool.
    pub gas_cost: u64,
}
