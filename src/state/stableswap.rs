use alloy::primitives::U256;

use super::{PoolEvent, fee_denominator, precision};
use crate::{
    error::PricerError,
    math::stable::{get_d, get_y, get_y_d},
};

/// Normalizes raw balances into 1e18 fixed-point units:
/// `xp[k] = rates[k] * balances[k] / 1e18`.
pub(crate) fn xp_mem(rates: &[U256], balances: &[U256]) -> Result<Vec<U256>, PricerError> {
    if rates.len() != balances.len() {
        return Err(PricerError::InvalidArgument(format!(
            "{} rates for {} balances",
            rates.len(),
            balances.len()
        )));
    }
    Ok(rates.iter().zip(balances).map(|(r, b)| *r * *b / precision()).collect())
}

/// Per-coin liquidity fee: `fee * n / (4 * (n - 1))`.
pub(crate) fn liquidity_fee(fee: U256, n_coins: usize) -> U256 {
    fee * U256::from(n_coins) / U256::from(4 * (n_coins - 1))
}

fn sub(a: U256, b: U256, what: &str) -> Result<U256, PricerError> {
    a.checked_sub(b)
        .ok_or_else(|| PricerError::Invariant(format!("{what} underflow")))
}

/// Rejects coin index pairs before any balance vector is indexed. Indices
/// arrive from codecs and decoded events, so a desynced source must
/// surface as an error, never a panic.
pub(crate) fn check_indices(i: usize, j: usize, n_coins: usize) -> Result<(), PricerError> {
    if i == j || i >= n_coins || j >= n_coins {
        return Err(PricerError::InvalidArgument(format!(
            "invalid coin indices {i}/{j} for {n_coins}-coin pool"
        )));
    }
    Ok(())
}

/// StableSwap pool state (plain pool / basepool).
///
/// `rate_multipliers` convert raw coin units into 1e18 fixed point
/// (`1e18` for an 18-decimals coin, `1e30` for 6 decimals); they are
/// deployment constants and ride along in state so transitions stay pure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StableState {
    a: U256,
    fee: U256,
    admin_fee: U256,
    total_supply: U256,
    balances: Vec<U256>,
    rate_multipliers: Vec<U256>,
}

impl StableState {
    pub fn new(
        a: U256,
        fee: U256,
        admin_fee: U256,
        total_supply: U256,
        balances: Vec<U256>,
        rate_multipliers: Vec<U256>,
    ) -> Self {
        Self { a, fee, admin_fee, total_supply, balances, rate_multipliers }
    }

    pub fn a(&self) -> U256 {
        self.a
    }

    pub fn fee(&self) -> U256 {
        self.fee
    }

    pub fn admin_fee(&self) -> U256 {
        self.admin_fee
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn balances(&self) -> &[U256] {
        &self.balances
    }

    pub fn rate_multipliers(&self) -> &[U256] {
        &self.rate_multipliers
    }

    pub fn n_coins(&self) -> usize {
        self.balances.len()
    }

    fn xp(&self) -> Result<Vec<U256>, PricerError> {
        xp_mem(&self.rate_multipliers, &self.balances)
    }

    /// Output of swapping `dx` of coin `i` into coin `j`, fee included.
    pub fn get_dy(&self, i: usize, j: usize, dx: U256) -> Result<U256, PricerError> {
        check_indices(i, j, self.n_coins())?;
        if dx.is_zero() {
            return Ok(U256::ZERO);
        }
        let xp = self.xp()?;
        let x = xp[i] + dx * self.rate_multipliers[i] / precision();
        let y = get_y(i, j, x, &xp, self.a)?;
        let dy = sub(xp[j], y + U256::ONE, "dy")?;
        let dy_fee = dy * self.fee / fee_denominator();
        Ok(sub(dy, dy_fee, "dy fee")? * precision() / self.rate_multipliers[j])
    }

    /// LP token value: `D * 1e18 / total_supply`.
    pub fn get_virtual_price(&self) -> Result<U256, PricerError> {
        let d = get_d(&self.xp()?, self.a)?;
        (d * precision())
            .checked_div(self.total_supply)
            .ok_or_else(|| PricerError::Invariant("zero total supply".into()))
    }

    /// LP amount minted (deposit) or burned (withdrawal) for `amounts`,
    /// fee-less approximation used for quoting.
    pub fn calc_token_amount(&self, amounts: &[U256], is_deposit: bool) -> Result<U256, PricerError> {
        if amounts.len() != self.n_coins() {
            return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
        }
        if self.total_supply.is_zero() {
            return Err(PricerError::Invariant("zero total supply".into()));
        }
        let d0 = get_d(&self.xp()?, self.a)?;
        let mut balances = self.balances.clone();
        for (b, amount) in balances.iter_mut().zip(amounts) {
            *b = if is_deposit { *b + *amount } else { sub(*b, *amount, "balance")? };
        }
        let d1 = get_d(&xp_mem(&self.rate_multipliers, &balances)?, self.a)?;
        let diff = if is_deposit { sub(d1, d0, "D")? } else { sub(d0, d1, "D")? };
        Ok(diff * self.total_supply / d0)
    }

    /// Coin amount received for burning `token_amount` of LP into coin
    /// `i`, with the per-coin imbalance fee applied.
    /// Returns `(dy, dy_fee)` in real coin units.
    pub fn calc_withdraw_one_coin(
        &self,
        token_amount: U256,
        i: usize,
    ) -> Result<(U256, U256), PricerError> {
        calc_withdraw_one_coin(
            token_amount,
            i,
            self.a,
            self.fee,
            self.total_supply,
            &self.rate_multipliers,
            &self.balances,
        )
    }

    /// Swap `dx` of coin `i` for coin `j`, returning the post-trade state
    /// and the real-unit output. Balance bookkeeping matches the contract:
    /// the admin fee portion leaves the pool balance.
    pub fn exchange(&self, i: usize, j: usize, dx: U256) -> Result<(StableState, U256), PricerError> {
        check_indices(i, j, self.n_coins())?;
        let xp = self.xp()?;
        let rates = &self.rate_multipliers;
        let x = xp[i] + dx * rates[i] / precision();
        let y = get_y(i, j, x, &xp, self.a)?;
        let dy = sub(xp[j], y + U256::ONE, "dy")?;
        let dy_fee = dy * self.fee / fee_denominator();
        let dy_real = sub(dy, dy_fee, "dy fee")? * precision() / rates[j];
        let dy_admin = dy_fee * self.admin_fee / fee_denominator() * precision() / rates[j];

        let mut next = self.clone();
        next.balances[i] += dx;
        next.balances[j] = sub(next.balances[j], dy_real + dy_admin, "out balance")?;
        Ok((next, dy_real))
    }

    /// Deposit `amounts`, returning the post-deposit state and the LP
    /// amount minted (invariant-share formula with imbalance fees).
    pub fn add_liquidity(&self, amounts: &[U256]) -> Result<(StableState, U256), PricerError> {
        if amounts.len() != self.n_coins() {
            return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
        }
        let mut next = self.clone();
        let d0 = if self.total_supply.is_zero() {
            U256::ZERO
        } else {
            get_d(&self.xp()?, self.a)?
        };
        let old_balances = self.balances.clone();
        let mut new_balances: Vec<U256> =
            old_balances.iter().zip(amounts).map(|(b, a)| *b + *a).collect();
        let d1 = get_d(&xp_mem(&self.rate_multipliers, &new_balances)?, self.a)?;

        let minted;
        if self.total_supply.is_zero() {
            next.balances = new_balances;
            minted = d1;
        } else {
            let lp_fee = liquidity_fee(self.fee, self.n_coins());
            for i in 0..self.n_coins() {
                let ideal = d1 * old_balances[i] / d0;
                let difference = ideal.abs_diff(new_balances[i]);
                let fee_i = lp_fee * difference / fee_denominator();
                next.balances[i] =
                    sub(new_balances[i], fee_i * self.admin_fee / fee_denominator(), "balance")?;
                new_balances[i] = sub(new_balances[i], fee_i, "balance")?;
            }
            let d2 = get_d(&xp_mem(&self.rate_multipliers, &new_balances)?, self.a)?;
            minted = self.total_supply * sub(d2, d0, "D")? / d0;
        }
        next.total_supply += minted;
        Ok((next, minted))
    }

    /// Burn `token_amount` of LP for coin `i` only.
    pub fn remove_liquidity_one_coin(
        &self,
        token_amount: U256,
        i: usize,
    ) -> Result<(StableState, U256), PricerError> {
        let (dy, dy_fee) = self.calc_withdraw_one_coin(token_amount, i)?;
        let mut next = self.clone();
        next.balances[i] = sub(
            next.balances[i],
            dy + dy_fee * self.admin_fee / fee_denominator(),
            "balance",
        )?;
        next.total_supply = sub(next.total_supply, token_amount, "supply")?;
        Ok((next, dy))
    }

    pub(crate) fn transition(&self, event: &PoolEvent) -> Result<Option<StableState>, PricerError> {
        match event {
            PoolEvent::TokenExchange { sold_id, bought_id, tokens_sold, .. } => {
                let (next, _) = self.exchange(*sold_id, *bought_id, *tokens_sold)?;
                Ok(Some(next))
            }
            PoolEvent::AddLiquidity { token_amounts, token_supply, .. } => {
                let (mut next, _) = self.add_liquidity(token_amounts)?;
                // The event carries the authoritative post-mint supply.
                next.total_supply = *token_supply;
                Ok(Some(next))
            }
            PoolEvent::RemoveLiquidity { token_amounts, token_supply, .. } => {
                if token_amounts.len() != self.n_coins() {
                    return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
                }
                let mut next = self.clone();
                for (b, amount) in next.balances.iter_mut().zip(token_amounts) {
                    *b = sub(*b, *amount, "balance")?;
                }
                next.total_supply = *token_supply;
                Ok(Some(next))
            }
            PoolEvent::RemoveLiquidityOne { token_amount, coin_index, .. } => {
                let (next, _) = self.remove_liquidity_one_coin(*token_amount, *coin_index)?;
                Ok(Some(next))
            }
            PoolEvent::RemoveLiquidityImbalance { token_amounts, .. } => {
                Ok(Some(self.remove_liquidity_imbalance(token_amounts)?))
            }
            PoolEvent::NewParameters { a, fee, admin_fee } => {
                let mut next = self.clone();
                next.a = *a;
                next.fee = *fee;
                next.admin_fee = *admin_fee;
                Ok(Some(next))
            }
            PoolEvent::NewFee { fee, admin_fee } => {
                let mut next = self.clone();
                next.fee = *fee;
                next.admin_fee = *admin_fee;
                Ok(Some(next))
            }
            PoolEvent::Sync { .. } | PoolEvent::TokenExchangeUnderlying { .. } => Ok(None),
        }
    }

    fn remove_liquidity_imbalance(&self, amounts: &[U256]) -> Result<StableState, PricerError> {
        if amounts.len() != self.n_coins() {
            return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
        }
        if self.total_supply.is_zero() {
            return Err(PricerError::Invariant("zero total supply".into()));
        }
        let lp_fee = liquidity_fee(self.fee, self.n_coins());
        let old_balances = self.balances.clone();
        let d0 = get_d(&self.xp()?, self.a)?;
        let mut new_balances: Vec<U256> = old_balances.clone();
        for (b, amount) in new_balances.iter_mut().zip(amounts) {
            *b = sub(*b, *amount, "balance")?;
        }
        let d1 = get_d(&xp_mem(&self.rate_multipliers, &new_balances)?, self.a)?;

        let mut next = self.clone();
        for i in 0..self.n_coins() {
            let ideal = d1 * old_balances[i] / d0;
            let difference = ideal.abs_diff(new_balances[i]);
            let fee_i = lp_fee * difference / fee_denominator();
            next.balances[i] =
                sub(new_balances[i], fee_i * self.admin_fee / fee_denominator(), "balance")?;
            new_balances[i] = sub(new_balances[i], fee_i, "balance")?;
        }
        let d2 = get_d(&xp_mem(&self.rate_multipliers, &new_balances)?, self.a)?;

        // +1 makes rounding unfavorable for the withdrawer.
        let burned = sub(d0, d2, "D")? * self.total_supply / d0 + U256::ONE;
        next.total_supply = sub(self.total_supply, burned, "supply")?;
        Ok(next)
    }
}

/// Shared withdraw-one-coin quoting, parameterized over the rate vector so
/// metapools can substitute the cached base virtual price.
pub(crate) fn calc_withdraw_one_coin(
    token_amount: U256,
    i: usize,
    a: U256,
    fee: U256,
    total_supply: U256,
    rates: &[U256],
    balances: &[U256],
) -> Result<(U256, U256), PricerError> {
    let n_coins = balances.len();
    if i >= n_coins {
        return Err(PricerError::InvalidArgument(format!("coin index {i} out of range")));
    }
    if total_supply.is_zero() {
        return Err(PricerError::Invariant("zero total supply".into()));
    }
    let lp_fee = liquidity_fee(fee, n_coins);
    let xp = xp_mem(rates, balances)?;
    let d0 = get_d(&xp, a)?;
    let d1 = sub(d0, token_amount * d0 / total_supply, "D")?;
    let new_y = get_y_d(a, i, &xp, d1)?;

    let dy_0 = sub(xp[i], new_y, "dy")? * precision() / rates[i];

    let mut xp_reduced = xp.clone();
    for j in 0..n_coins {
        let dx_expected = if j == i {
            sub(xp[j] * d1 / d0, new_y, "dx expected")?
        } else {
            sub(xp[j], xp[j] * d1 / d0, "dx expected")?
        };
        xp_reduced[j] = sub(xp_reduced[j], lp_fee * dx_expected / fee_denominator(), "xp")?;
    }

    let mut dy = sub(xp_reduced[i], get_y_d(a, i, &xp_reduced, d1)?, "dy")?;
    // Withdraw one unit less to absorb rounding errors.
    dy = sub(dy, U256::ONE, "dy")? * precision() / rates[i];
    Ok((dy, sub(dy_0, dy, "dy fee")?))
}

#[cfg(test)]
pub(crate) fn e18(v: u64) -> U256 {
    U256::from(v) * precision()
}

#[cfg(test)]
impl StableState {
    /// Balanced 3-coin pool: 1M of each 18-decimals coin, A=200,
    /// fee 0.04%, admin fee 50%.
    pub(crate) fn three_pool_for_test() -> Self {
        StableState::new(
            U256::from(200),
            U256::from(4_000_000u64),
            U256::from(5_000_000_000u64),
            e18(3_000_000),
            vec![e18(1_000_000); 3],
            vec![precision(); 3],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u(s: &str) -> U256 {
        U256::from_str_radix(s, 10).unwrap()
    }

    #[test]
    fn get_dy_matches_reference_integer() {
        let pool = StableState::three_pool_for_test();
        assert_eq!(pool.get_dy(0, 1, e18(100)).unwrap(), u("99959950268680965991"));
    }

    #[test]
    fn get_dy_of_zero_is_zero() {
        let pool = StableState::three_pool_for_test();
        assert_eq!(pool.get_dy(0, 1, U256::ZERO).unwrap(), U256::ZERO);
    }

    #[test]
    fn calc_token_amount_matches_reference_within_one_unit() {
        let pool = StableState::three_pool_for_test();
        let quoted = pool
            .calc_token_amount(&[e18(100), U256::ZERO, U256::ZERO], true)
            .unwrap();
        let reference = u("99999983417173294399");
        assert!(quoted.abs_diff(reference) <= U256::ONE, "quoted {quoted}");
    }

    #[test]
    fn virtual_price_of_balanced_pool_is_one() {
        let pool = StableState::three_pool_for_test();
        assert_eq!(pool.get_virtual_price().unwrap(), precision());
    }

    #[test]
    fn exchange_transition_matches_reference_balances() {
        let pool = StableState::three_pool_for_test();
        let ev = PoolEvent::TokenExchange {
            buyer: alloy::primitives::Address::ZERO,
            sold_id: 0,
            bought_id: 1,
            tokens_sold: e18(100),
        };
        let next = pool.transition(&ev).unwrap().unwrap();
        assert_eq!(next.balances()[0], u("1000100000000000000000000"));
        assert_eq!(next.balances()[1], u("999900020049741269277914"));
        assert_eq!(next.balances()[2], e18(1_000_000));
        assert_eq!(next.total_supply(), pool.total_supply());
    }

    #[test]
    fn withdraw_one_coin_matches_reference() {
        let pool = StableState::three_pool_for_test();
        let (dy, dy_fee) = pool.calc_withdraw_one_coin(e18(100), 0).unwrap();
        assert_eq!(dy, u("99979983422798936929"));
        assert_eq!(dy_fee, u("19999992537219968"));
    }

    #[test]
    fn remove_liquidity_updates_supply_from_event() {
        let pool = StableState::three_pool_for_test();
        let ev = PoolEvent::RemoveLiquidity {
            provider: alloy::primitives::Address::ZERO,
            token_amounts: vec![e18(10), e18(10), e18(10)],
            token_supply: e18(2_999_970),
        };
        let next = pool.transition(&ev).unwrap().unwrap();
        assert_eq!(next.balances()[0], e18(999_990));
        assert_eq!(next.total_supply(), e18(2_999_970));
    }

    #[test]
    fn new_fee_only_touches_fees() {
        let pool = StableState::three_pool_for_test();
        let ev = PoolEvent::NewFee {
            fee: U256::from(3_000_000u64),
            admin_fee: U256::from(1_000_000_000u64),
        };
        let next = pool.transition(&ev).unwrap().unwrap();
        assert_eq!(next.fee(), U256::from(3_000_000u64));
        assert_eq!(next.admin_fee(), U256::from(1_000_000_000u64));
        assert_eq!(next.balances(), pool.balances());
    }

    #[test]
    fn out_of_range_indices_are_rejected_not_a_panic() {
        let pool = StableState::three_pool_for_test();
        assert!(matches!(
            pool.get_dy(7, 1, e18(1)),
            Err(PricerError::InvalidArgument(_))
        ));
        assert!(pool.get_dy(1, 7, e18(1)).is_err());
        assert!(pool.get_dy(1, 1, e18(1)).is_err());
        // The same indices arrive through decoded events.
        let ev = PoolEvent::TokenExchange {
            buyer: alloy::primitives::Address::ZERO,
            sold_id: 7,
            bought_id: 1,
            tokens_sold: e18(1),
        };
        assert!(matches!(pool.transition(&ev), Err(PricerError::InvalidArgument(_))));
    }

    #[test]
    fn short_remove_liquidity_vector_is_rejected() {
        let pool = StableState::three_pool_for_test();
        let ev = PoolEvent::RemoveLiquidity {
            provider: alloy::primitives::Address::ZERO,
            token_amounts: vec![e18(10), e18(10)],
            token_supply: e18(2_999_980),
        };
        assert!(matches!(pool.transition(&ev), Err(PricerError::InvalidArgument(_))));
    }

    #[test]
    fn desynced_burn_is_an_error_not_a_panic() {
        let pool = StableState::three_pool_for_test();
        let ev = PoolEvent::RemoveLiquidity {
            provider: alloy::primitives::Address::ZERO,
            token_amounts: vec![e18(2_000_000), U256::ZERO, U256::ZERO],
            token_supply: U256::ZERO,
        };
        assert!(pool.transition(&ev).is_err());
    }
}
