//! Constant-product (x*y=k) pricing.
//!
//! Integer-exact port of the UniswapV2-family router math: same term
//! grouping, same truncation points, so outputs agree with the deployed
//! pair contracts bit for bit. Fees are expressed against a fixed
//! `FEE_FACTOR` of 10000 (30 = 0.3%).

use alloy::primitives::U256;

use crate::error::PricerError;

/// uint112 storage width of pair reserves.
pub fn reserve_limit() -> U256 {
    (U256::ONE << 112) - U256::ONE
}

/// Fee denominator: fees are in basis points of this factor.
pub const FEE_FACTOR: u64 = 10_000;

fn check_reserves(reserve_in: U256, reserve_out: U256) -> Result<(), PricerError> {
    let limit = reserve_limit();
    if reserve_in > limit || reserve_out > limit {
        return Err(PricerError::InputRange("reserve exceeds uint112 limit".into()));
    }
    Ok(())
}

/// Output amount for a fixed input:
/// `floor(in*(F-fee)*reserve_out / (reserve_in*F + in*(F-fee)))`.
///
/// Post-trade input reserve above the uint112 limit is an input-range
/// error, never a silent wrap.
pub fn get_sell_price(
    reserve_in: U256,
    reserve_out: U256,
    fee_bips: u64,
    amount_in: U256,
) -> Result<U256, PricerError> {
    if amount_in.is_zero() {
        return Ok(U256::ZERO);
    }
    check_reserves(reserve_in, reserve_out)?;
    if fee_bips >= FEE_FACTOR {
        return Err(PricerError::InputRange(format!("fee {fee_bips} >= {FEE_FACTOR}")));
    }
    if reserve_in + amount_in > reserve_limit() {
        return Err(PricerError::InputRange("post-trade reserve exceeds uint112 limit".into()));
    }
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(PricerError::Invariant("zero reserve".into()));
    }

    let amount_in_with_fee = amount_in * U256::from(FEE_FACTOR - fee_bips);
    let numerator = amount_in_with_fee * reserve_out;
    let denominator = reserve_in * U256::from(FEE_FACTOR) + amount_in_with_fee;
    Ok(numerator / denominator)
}

/// Required input for a fixed output:
/// `floor(reserve_in*out*F / ((reserve_out-out)*(F-fee))) + 1`.
///
/// The `+1` rounds up so the computed input is always sufficient.
pub fn get_buy_price(
    reserve_in: U256,
    reserve_out: U256,
    fee_bips: u64,
    amount_out: U256,
) -> Result<U256, PricerError> {
    if amount_out.is_zero() {
        return Ok(U256::ZERO);
    }
    check_reserves(reserve_in, reserve_out)?;
    if fee_bips >= FEE_FACTOR {
        return Err(PricerError::InputRange(format!("fee {fee_bips} >= {FEE_FACTOR}")));
    }
    if amount_out >= reserve_out {
        return Err(PricerError::InputRange("requested output exceeds reserve".into()));
    }
    if reserve_in.is_zero() {
        return Err(PricerError::Invariant("zero reserve".into()));
    }

    let numerator = reserve_in * amount_out * U256::from(FEE_FACTOR);
    let denominator = (reserve_out - amount_out) * U256::from(FEE_FACTOR - fee_bips);
    Ok(numerator / denominator + U256::ONE)
}
