//! Versioned pool state and pure transitions.
//!
//! Each protocol kind is a variant of [`PoolState`]; decoded log events
//! are variants of [`PoolEvent`]. Transitions are pure functions of
//! `(previous state, event, transition context)` so that replaying the
//! same ordered event sequence from the same initial state always yields
//! the same final state. Matching is exhaustive per kind, so a missing
//! handler is a compile error rather than a silently ignored event.

mod constant_product;
mod metapool;
mod stableswap;

use alloy::primitives::{Address, U256};
pub use constant_product::CpState;
pub use metapool::MetaState;
pub use stableswap::StableState;

use crate::{error::PricerError, types::StateInstant};

/// `1e18`, the fixed-point precision of the StableSwap family.
pub(crate) fn precision() -> U256 {
    U256::from(10u64).pow(U256::from(18))
}

/// `1e10`, the StableSwap fee denominator.
pub(crate) fn fee_denominator() -> U256 {
    U256::from(10u64).pow(U256::from(10))
}

/// Versioned numeric state of one pool, tagged by protocol kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolState {
    ConstantProduct(CpState),
    StableSwap(StableState),
    Metapool(MetaState),
}

/// Decoded pool event, produced by the [`crate::chain::PoolCodec`]
/// collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// Reserve resynchronization of a constant-product pair.
    Sync { reserve0: U256, reserve1: U256 },
    TokenExchange { buyer: Address, sold_id: usize, bought_id: usize, tokens_sold: U256 },
    /// Metapool exchange crossing into the wrapped basepool's coins.
    TokenExchangeUnderlying { buyer: Address, sold_id: usize, bought_id: usize, tokens_sold: U256 },
    AddLiquidity { provider: Address, token_amounts: Vec<U256>, token_supply: U256 },
    RemoveLiquidity { provider: Address, token_amounts: Vec<U256>, token_supply: U256 },
    RemoveLiquidityOne { provider: Address, token_amount: U256, coin_index: usize },
    RemoveLiquidityImbalance { provider: Address, token_amounts: Vec<U256> },
    NewParameters { a: U256, fee: U256, admin_fee: U256 },
    NewFee { fee: U256, admin_fee: U256 },
}

impl PoolEvent {
    /// Originating actor of the economic action, used by wrapping pools to
    /// suppress double application of their own downstream effects.
    pub fn actor(&self) -> Option<Address> {
        match self {
            PoolEvent::Sync { .. }
            | PoolEvent::NewParameters { .. }
            | PoolEvent::NewFee { .. } => None,
            PoolEvent::TokenExchange { buyer, .. }
            | PoolEvent::TokenExchangeUnderlying { buyer, .. } => Some(*buyer),
            PoolEvent::AddLiquidity { provider, .. }
            | PoolEvent::RemoveLiquidity { provider, .. }
            | PoolEvent::RemoveLiquidityOne { provider, .. }
            | PoolEvent::RemoveLiquidityImbalance { provider, .. } => Some(*provider),
        }
    }
}

/// Context a transition is evaluated in. Carries everything a handler may
/// read besides the previous state and the event itself.
#[derive(Clone, Copy, Debug)]
pub struct TransitionCtx {
    /// Address of the pool the subscriber owns.
    pub pool_address: Address,
    /// Address of the wrapped basepool, for composed subscribers.
    pub base_address: Option<Address>,
    pub instant: StateInstant,
}

impl PoolState {
    /// Applies one decoded log to the previous snapshot.
    ///
    /// Returns `Ok(None)` when the event produces no transition for this
    /// pool: a foreign log address, an event kind the protocol does not
    /// react to, or a wrapped-pool action originated by the wrapper itself
    /// (the wrapper's own handler accounts for the combined effect).
    pub fn apply(
        &self,
        log_address: Address,
        event: &PoolEvent,
        ctx: &TransitionCtx,
    ) -> Result<Option<PoolState>, PricerError> {
        match self {
            PoolState::ConstantProduct(state) => {
                if log_address != ctx.pool_address {
                    return Ok(None);
                }
                Ok(state.transition(event)?.map(PoolState::ConstantProduct))
            }
            PoolState::StableSwap(state) => {
                if log_address != ctx.pool_address {
                    return Ok(None);
                }
                Ok(state.transition(event)?.map(PoolState::StableSwap))
            }
            PoolState::Metapool(state) => {
                if log_address == ctx.pool_address {
                    return Ok(state
                        .transition(event, ctx.instant.block_timestamp())?
                        .map(PoolState::Metapool));
                }
                if Some(log_address) == ctx.base_address {
                    // Ownership guard: actions the metapool performed on
                    // its basepool are already reflected by the metapool's
                    // own handler for that physical action.
                    if event.actor() == Some(ctx.pool_address) {
                        return Ok(None);
                    }
                    return Ok(state
                        .basepool()
                        .transition(event)?
                        .map(|base| PoolState::Metapool(state.with_basepool(base))));
                }
                Ok(None)
            }
        }
    }
}
