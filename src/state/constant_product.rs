use alloy::primitives::U256;

use super::PoolEvent;
use crate::{engine::constant_product as cp, error::PricerError};

/// Constant-product pair state: two uint112 reserves and the pool's fee in
/// basis points of [`cp::FEE_FACTOR`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpState {
    reserve0: U256,
    reserve1: U256,
    fee_bips: u64,
}

impl CpState {
    pub fn new(reserve0: U256, reserve1: U256, fee_bips: u64) -> Self {
        Self { reserve0, reserve1, fee_bips }
    }

    pub fn reserve0(&self) -> U256 {
        self.reserve0
    }

    pub fn reserve1(&self) -> U256 {
        self.reserve1
    }

    pub fn fee_bips(&self) -> u64 {
        self.fee_bips
    }

    /// Reserves ordered for a trade entering with `token0` (`reversed ==
    /// false`) or `token1` (`reversed == true`).
    pub fn ordered_reserves(&self, reversed: bool) -> (U256, U256) {
        if reversed { (self.reserve1, self.reserve0) } else { (self.reserve0, self.reserve1) }
    }

    /// The only state-changing event of the pair contract is `Sync`,
    /// emitted after every swap/mint/burn with the post-action reserves.
    /// The fee is a contract constant and survives the transition.
    pub(crate) fn transition(&self, event: &PoolEvent) -> Result<Option<CpState>, PricerError> {
        match event {
            PoolEvent::Sync { reserve0, reserve1 } => {
                let limit = cp::reserve_limit();
                if *reserve0 > limit || *reserve1 > limit {
                    return Err(PricerError::InputRange(
                        "Sync reserves exceed uint112 limit".into(),
                    ));
                }
                Ok(Some(CpState::new(*reserve0, *reserve1, self.fee_bips)))
            }
            _ => Ok(None),
        }
    }
}
