use alloy::primitives::U256;

use super::{
    PoolEvent, fee_denominator, precision,
    stableswap::{self, StableState, check_indices, xp_mem},
};
use crate::{
    error::PricerError,
    math::stable::get_y,
};

/// Seconds the cached base virtual price stays valid.
const BASE_CACHE_EXPIRES: u64 = 600;

fn sub(a: U256, b: U256, what: &str) -> Result<U256, PricerError> {
    a.checked_sub(b)
        .ok_or_else(|| PricerError::Invariant(format!("{what} underflow")))
}

/// Metapool state: an outer StableSwap pool whose last coin is the LP
/// token of a wrapped basepool.
///
/// The basepool's state and the cached base virtual price (plus its
/// last-updated timestamp) are part of this versioned state, never an
/// external side channel, so snapshots stay self-contained and replayable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetaState {
    a: U256,
    fee: U256,
    admin_fee: U256,
    total_supply: U256,
    balances: Vec<U256>,
    rate_multipliers: Vec<U256>,
    basepool: StableState,
    base_virtual_price: U256,
    base_cache_updated: u64,
}

impl MetaState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        a: U256,
        fee: U256,
        admin_fee: U256,
        total_supply: U256,
        balances: Vec<U256>,
        rate_multipliers: Vec<U256>,
        basepool: StableState,
        base_virtual_price: U256,
        base_cache_updated: u64,
    ) -> Self {
        Self {
            a,
            fee,
            admin_fee,
            total_supply,
            balances,
            rate_multipliers,
            basepool,
            base_virtual_price,
            base_cache_updated,
        }
    }

    pub fn a(&self) -> U256 {
        self.a
    }

    pub fn fee(&self) -> U256 {
        self.fee
    }

    pub fn total_supply(&self) -> U256 {
        self.total_supply
    }

    pub fn balances(&self) -> &[U256] {
        &self.balances
    }

    pub fn basepool(&self) -> &StableState {
        &self.basepool
    }

    pub fn base_virtual_price(&self) -> U256 {
        self.base_virtual_price
    }

    pub fn base_cache_updated(&self) -> u64 {
        self.base_cache_updated
    }

    pub fn n_coins(&self) -> usize {
        self.balances.len()
    }

    /// Index of the basepool LP coin within the metapool.
    fn max_coin(&self) -> usize {
        self.n_coins() - 1
    }

    /// Width of the combined underlying coin space: the meta coins below
    /// the LP slot plus every basepool coin.
    fn n_underlying(&self) -> usize {
        self.max_coin() + self.basepool.n_coins()
    }

    pub(crate) fn with_basepool(&self, basepool: StableState) -> Self {
        let mut next = self.clone();
        next.basepool = basepool;
        next
    }

    /// Base LP rate: the cached virtual price while fresh, recomputed from
    /// the wrapped pool once `block_timestamp` passes the TTL.
    /// Returns the rate and the cache timestamp to store with it.
    fn vp_rate(&self, block_timestamp: u64) -> Result<(U256, u64), PricerError> {
        if block_timestamp > self.base_cache_updated + BASE_CACHE_EXPIRES {
            Ok((self.basepool.get_virtual_price()?, block_timestamp))
        } else {
            Ok((self.base_virtual_price, self.base_cache_updated))
        }
    }

    /// Read-only variant for quoting: never advances the cache timestamp.
    fn vp_rate_ro(&self, block_timestamp: u64) -> Result<U256, PricerError> {
        self.vp_rate(block_timestamp).map(|(rate, _)| rate)
    }

    fn rates_with(&self, vp_rate: U256) -> Vec<U256> {
        let mut rates = self.rate_multipliers.clone();
        let max_coin = self.max_coin();
        rates[max_coin] = vp_rate;
        rates
    }

    /// Output of swapping `dx` of meta coin `i` into meta coin `j`.
    pub fn get_dy(
        &self,
        i: usize,
        j: usize,
        dx: U256,
        block_timestamp: u64,
    ) -> Result<U256, PricerError> {
        check_indices(i, j, self.n_coins())?;
        if dx.is_zero() {
            return Ok(U256::ZERO);
        }
        let vp_rate = self.vp_rate_ro(block_timestamp)?;
        let rates = self.rates_with(vp_rate);
        let xp = xp_mem(&rates, &self.balances)?;
        let x = xp[i] + dx * rates[i] / precision();
        let y = get_y(i, j, x, &xp, self.a)?;
        let dy = sub(xp[j], y + U256::ONE, "dy")?;
        let fee = self.fee * dy / fee_denominator();
        Ok(sub(dy, fee, "dy fee")? * precision() / rates[j])
    }

    /// Output of swapping across the combined coin space: indices `0..MAX`
    /// are meta coins, `MAX..` map into the wrapped basepool's coins.
    pub fn get_dy_underlying(
        &self,
        i: usize,
        j: usize,
        dx: U256,
        block_timestamp: u64,
    ) -> Result<U256, PricerError> {
        check_indices(i, j, self.n_underlying())?;
        if dx.is_zero() {
            return Ok(U256::ZERO);
        }
        let max_coin = self.max_coin();
        let vp_rate = self.vp_rate_ro(block_timestamp)?;
        let rates = self.rates_with(vp_rate);
        let xp = xp_mem(&rates, &self.balances)?;
        // dx and dy are in underlying units; precisions strip the 1e18
        // scale off the deployment rate multipliers.
        let precisions: Vec<U256> =
            self.rate_multipliers.iter().map(|r| *r / precision()).collect();

        let base_i = i as isize - max_coin as isize;
        let base_j = j as isize - max_coin as isize;
        let meta_i = if base_i < 0 { i } else { max_coin };
        let meta_j = if base_j < 0 { j } else { max_coin };

        let x = if base_i < 0 {
            xp[i] + dx * precisions[i]
        } else if base_j < 0 {
            // Input comes from the basepool: deposit it, value the minted
            // LP in 1e18 units and discount the deposit fee approximation.
            let mut base_inputs = vec![U256::ZERO; self.basepool.n_coins()];
            base_inputs[base_i as usize] = dx;
            let mut x =
                self.basepool.calc_token_amount(&base_inputs, true)? * vp_rate / precision();
            x = sub(
                x,
                x * self.basepool.fee() / (fee_denominator() * U256::from(2)),
                "base deposit fee",
            )?;
            x + xp[max_coin]
        } else {
            // Both legs live in the basepool; the metapool is not involved.
            return self.basepool.get_dy(base_i as usize, base_j as usize, dx);
        };

        let y = get_y(meta_i, meta_j, x, &xp, self.a)?;
        let mut dy = sub(xp[meta_j], y + U256::ONE, "dy")?;
        dy = sub(dy, self.fee * dy / fee_denominator(), "dy fee")?;

        if base_j < 0 {
            Ok(dy / precisions[meta_j])
        } else {
            // Withdraw the LP leg from the basepool; its fee is already
            // accounted for by calc_withdraw_one_coin.
            let lp_amount = dy * precision() / vp_rate;
            Ok(self.basepool.calc_withdraw_one_coin(lp_amount, base_j as usize)?.0)
        }
    }

    pub(crate) fn transition(
        &self,
        event: &PoolEvent,
        block_timestamp: u64,
    ) -> Result<Option<MetaState>, PricerError> {
        match event {
            PoolEvent::TokenExchange { sold_id, bought_id, tokens_sold, .. } => Ok(Some(
                self.handle_token_exchange(*sold_id, *bought_id, *tokens_sold, block_timestamp)?,
            )),
            PoolEvent::TokenExchangeUnderlying { sold_id, bought_id, tokens_sold, .. } => {
                Ok(Some(self.handle_exchange_underlying(
                    *sold_id,
                    *bought_id,
                    *tokens_sold,
                    block_timestamp,
                )?))
            }
            PoolEvent::AddLiquidity { token_amounts, token_supply, .. } => Ok(Some(
                self.handle_add_liquidity(token_amounts, *token_supply, block_timestamp)?,
            )),
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
            PoolEvent::RemoveLiquidityOne { token_amount, coin_index, .. } => Ok(Some(
                self.handle_remove_liquidity_one(*token_amount, *coin_index, block_timestamp)?,
            )),
            PoolEvent::RemoveLiquidityImbalance { token_amounts, .. } => {
                Ok(Some(self.handle_remove_imbalance(token_amounts, block_timestamp)?))
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
            PoolEvent::Sync { .. } => Ok(None),
        }
    }

    fn handle_token_exchange(
        &self,
        i: usize,
        j: usize,
        dx: U256,
        block_timestamp: u64,
    ) -> Result<MetaState, PricerError> {
        check_indices(i, j, self.n_coins())?;
        let mut next = self.clone();
        let (vp_rate, updated) = self.vp_rate(block_timestamp)?;
        next.base_virtual_price = vp_rate;
        next.base_cache_updated = updated;

        let rates = self.rates_with(vp_rate);
        let old_balances = self.balances.clone();
        let xp = xp_mem(&rates, &old_balances)?;

        let x = xp[i] + dx * rates[i] / precision();
        let y = get_y(i, j, x, &xp, self.a)?;
        let dy = sub(xp[j], y + U256::ONE, "dy")?;
        let dy_fee = dy * self.fee / fee_denominator();
        let dy_real = sub(dy, dy_fee, "dy fee")? * precision() / rates[j];
        let dy_admin = dy_fee * self.admin_fee / fee_denominator() * precision() / rates[j];

        next.balances[i] = old_balances[i] + dx;
        // Rounding errors undercharge the admin fee in favor of LPs.
        next.balances[j] = sub(old_balances[j], dy_real + dy_admin, "out balance")?;
        Ok(next)
    }

    fn handle_exchange_underlying(
        &self,
        i: usize,
        j: usize,
        dx: U256,
        block_timestamp: u64,
    ) -> Result<MetaState, PricerError> {
        check_indices(i, j, self.n_underlying())?;
        let mut next = self.clone();
        let (vp_rate, updated) = self.vp_rate(block_timestamp)?;
        next.base_virtual_price = vp_rate;
        next.base_cache_updated = updated;

        let max_coin = self.max_coin();
        let rates = self.rates_with(vp_rate);
        let base_i = i as isize - max_coin as isize;
        let base_j = j as isize - max_coin as isize;
        let meta_i = if base_i < 0 { i } else { max_coin };
        let meta_j = if base_j < 0 { j } else { max_coin };

        if base_i >= 0 && base_j >= 0 {
            // Both coins live in the basepool; the metapool only routes.
            let (base, _) = next.basepool.exchange(base_i as usize, base_j as usize, dx)?;
            next.basepool = base;
            return Ok(next);
        }

        let old_balances = self.balances.clone();
        let xp = xp_mem(&rates, &old_balances)?;

        let mut dx_w_fee = dx;
        let x = if base_i < 0 {
            xp[i] + dx_w_fee * rates[i] / precision()
        } else {
            // Deposit the base coin first; the minted LP amount is what
            // actually enters the metapool.
            let mut base_inputs = vec![U256::ZERO; next.basepool.n_coins()];
            base_inputs[base_i as usize] = dx_w_fee;
            let (base, minted) = next.basepool.add_liquidity(&base_inputs)?;
            next.basepool = base;
            dx_w_fee = minted;
            dx_w_fee * rates[max_coin] / precision() + xp[max_coin]
        };

        let y = get_y(meta_i, meta_j, x, &xp, self.a)?;
        let dy = sub(xp[meta_j], y + U256::ONE, "dy")?;
        let dy_fee = dy * self.fee / fee_denominator();
        let dy_real = sub(dy, dy_fee, "dy fee")? * precision() / rates[meta_j];
        let dy_admin = dy_fee * self.admin_fee / fee_denominator() * precision() / rates[meta_j];

        next.balances[meta_i] = old_balances[meta_i] + dx_w_fee;
        next.balances[meta_j] = sub(old_balances[meta_j], dy_real + dy_admin, "out balance")?;

        if base_j >= 0 {
            let (base, _) = next.basepool.remove_liquidity_one_coin(dy_real, base_j as usize)?;
            next.basepool = base;
        }
        Ok(next)
    }

    fn handle_add_liquidity(
        &self,
        amounts: &[U256],
        token_supply: U256,
        block_timestamp: u64,
    ) -> Result<MetaState, PricerError> {
        if amounts.len() != self.n_coins() {
            return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
        }
        let mut next = self.clone();
        let (vp_rate, updated) = self.vp_rate(block_timestamp)?;
        next.base_virtual_price = vp_rate;
        next.base_cache_updated = updated;

        let rates = self.rates_with(vp_rate);
        let old_balances = self.balances.clone();
        let mut new_balances: Vec<U256> =
            old_balances.iter().zip(amounts).map(|(b, a)| *b + *a).collect();

        if self.total_supply.is_zero() {
            next.balances = new_balances;
        } else {
            let d0 = crate::math::stable::get_d(&xp_mem(&rates, &old_balances)?, self.a)?;
            let d1 = crate::math::stable::get_d(&xp_mem(&rates, &new_balances)?, self.a)?;
            let lp_fee = stableswap::liquidity_fee(self.fee, self.n_coins());
            for i in 0..self.n_coins() {
                let ideal = d1 * old_balances[i] / d0;
                let difference = ideal.abs_diff(new_balances[i]);
                let fee_i = lp_fee * difference / fee_denominator();
                next.balances[i] =
                    sub(new_balances[i], fee_i * self.admin_fee / fee_denominator(), "balance")?;
                new_balances[i] = sub(new_balances[i], fee_i, "balance")?;
            }
        }
        next.total_supply = token_supply;
        Ok(next)
    }

    fn handle_remove_liquidity_one(
        &self,
        token_amount: U256,
        coin_index: usize,
        block_timestamp: u64,
    ) -> Result<MetaState, PricerError> {
        let mut next = self.clone();
        let (vp_rate, updated) = self.vp_rate(block_timestamp)?;
        next.base_virtual_price = vp_rate;
        next.base_cache_updated = updated;

        let rates = self.rates_with(vp_rate);
        let (dy, dy_fee) = stableswap::calc_withdraw_one_coin(
            token_amount,
            coin_index,
            self.a,
            self.fee,
            self.total_supply,
            &rates,
            &self.balances,
        )?;
        next.balances[coin_index] = sub(
            next.balances[coin_index],
            dy + dy_fee * self.admin_fee / fee_denominator(),
            "balance",
        )?;
        next.total_supply = sub(next.total_supply, token_amount, "supply")?;
        Ok(next)
    }

    fn handle_remove_imbalance(
        &self,
        amounts: &[U256],
        block_timestamp: u64,
    ) -> Result<MetaState, PricerError> {
        if amounts.len() != self.n_coins() {
            return Err(PricerError::InvalidArgument("amounts length mismatch".into()));
        }
        if self.total_supply.is_zero() {
            return Err(PricerError::Invariant("zero total supply".into()));
        }
        let mut next = self.clone();
        let (vp_rate, updated) = self.vp_rate(block_timestamp)?;
        next.base_virtual_price = vp_rate;
        next.base_cache_updated = updated;

        let rates = self.rates_with(vp_rate);
        let lp_fee = stableswap::liquidity_fee(self.fee, self.n_coins());
        let old_balances = self.balances.clone();
        let d0 = crate::math::stable::get_d(&xp_mem(&rates, &old_balances)?, self.a)?;
        let mut new_balances = old_balances.clone();
        for (b, amount) in new_balances.iter_mut().zip(amounts) {
            *b = sub(*b, *amount, "balance")?;
        }
        let d1 = crate::math::stable::get_d(&xp_mem(&rates, &new_balances)?, self.a)?;
        for i in 0..self.n_coins() {
            let ideal = d1 * old_balances[i] / d0;
            let difference = ideal.abs_diff(new_balances[i]);
            let fee_i = lp_fee * difference / fee_denominator();
            next.balances[i] =
                sub(new_balances[i], fee_i * self.admin_fee / fee_denominator(), "balance")?;
            new_balances[i] = sub(new_balances[i], fee_i, "balance")?;
        }
        let d2 = crate::math::stable::get_d(&xp_mem(&rates, &new_balances)?, self.a)?;

        let burned = sub(d0, d2, "D")? * self.total_supply / d0 + U256::ONE;
        next.total_supply = sub(self.total_supply, burned, "supply")?;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{Address, address};

    use super::*;
    use crate::{
        state::{PoolState, TransitionCtx, stableswap::e18},
        types::StateInstant,
    };

    const T0: u64 = 1_700_000_000;

    /// 2-coin metapool over the balanced 3-pool: 500k coin, 400k base LP,
    /// A=100, fee 0.04%, admin fee 50%, virtual price cached at T0.
    fn meta_for_test(cached_vp: U256) -> MetaState {
        MetaState::new(
            U256::from(100),
            U256::from(4_000_000u64),
            U256::from(5_000_000_000u64),
            e18(900_000),
            vec![e18(500_000), e18(400_000)],
            vec![precision(); 2],
            StableState::three_pool_for_test(),
            cached_vp,
            T0,
        )
    }

    fn u(s: &str) -> U256 {
        U256::from_str_radix(s, 10).unwrap()
    }

    #[test]
    fn get_dy_matches_reference_integer() {
        let meta = meta_for_test(precision());
        // Cached rate is fresh at T0 + 10.
        assert_eq!(meta.get_dy(0, 1, e18(1_000), T0 + 10).unwrap(), u("997325262889870681200"));
    }

    #[test]
    fn fresh_cache_is_reused_even_when_stale_in_value() {
        // Deliberately wrong cached rate: a read inside the TTL must use
        // it unchanged, proving no recomputation happens.
        let honest = meta_for_test(precision());
        let skewed = meta_for_test(precision() * U256::from(2));
        assert_ne!(
            skewed.get_dy(0, 1, e18(1_000), T0 + 599).unwrap(),
            honest.get_dy(0, 1, e18(1_000), T0 + 599).unwrap(),
        );
    }

    #[test]
    fn expired_cache_is_recomputed_from_the_basepool() {
        // Past the TTL the skewed cache must be ignored: both pools
        // recompute the same rate from the identical basepool.
        let honest = meta_for_test(precision());
        let skewed = meta_for_test(precision() * U256::from(2));
        assert_eq!(
            skewed.get_dy(0, 1, e18(1_000), T0 + 601).unwrap(),
            honest.get_dy(0, 1, e18(1_000), T0 + 601).unwrap(),
        );
    }

    #[test]
    fn transition_past_ttl_stamps_the_new_cache() {
        let meta = meta_for_test(precision() * U256::from(2));
        let ev = PoolEvent::TokenExchange {
            buyer: Address::ZERO,
            sold_id: 0,
            bought_id: 1,
            tokens_sold: e18(10),
        };
        let within = meta.transition(&ev, T0 + 599).unwrap().unwrap();
        assert_eq!(within.base_virtual_price(), precision() * U256::from(2));
        assert_eq!(within.base_cache_updated(), T0);

        let past = meta.transition(&ev, T0 + 601).unwrap().unwrap();
        assert_eq!(past.base_virtual_price(), precision());
        assert_eq!(past.base_cache_updated(), T0 + 601);
    }

    #[test]
    fn out_of_range_indices_are_rejected_not_a_panic() {
        let meta = meta_for_test(precision());
        // 2 meta coins; 4 underlying coins (1 meta + 3 base).
        assert!(matches!(
            meta.get_dy(2, 0, e18(1), T0 + 10),
            Err(PricerError::InvalidArgument(_))
        ));
        assert!(meta.get_dy_underlying(9, 1, e18(1), T0 + 10).is_err());
        assert!(meta.get_dy_underlying(3, 4, e18(1), T0 + 10).is_err());
        assert!(meta.get_dy_underlying(1, 3, e18(1), T0 + 10).is_ok());

        let ev = PoolEvent::TokenExchange {
            buyer: Address::ZERO,
            sold_id: 7,
            bought_id: 0,
            tokens_sold: e18(1),
        };
        assert!(matches!(
            meta.transition(&ev, T0 + 10),
            Err(PricerError::InvalidArgument(_))
        ));
        let ev = PoolEvent::TokenExchangeUnderlying {
            buyer: Address::ZERO,
            sold_id: 0,
            bought_id: 9,
            tokens_sold: e18(1),
        };
        assert!(meta.transition(&ev, T0 + 10).is_err());
    }

    #[test]
    fn underlying_quote_crossing_into_the_basepool() {
        let meta = meta_for_test(precision());
        // Sell the meta coin for basepool coin 0 (underlying index 1).
        let dy = meta.get_dy_underlying(0, 1, e18(1_000), T0 + 10).unwrap();
        // One stable for another: output stays within 1% of input.
        assert!(dy > e18(990) && dy < e18(1_010), "dy {dy}");
    }

    #[test]
    fn underlying_quote_between_base_coins_delegates_to_the_basepool() {
        let meta = meta_for_test(precision());
        let via_meta = meta.get_dy_underlying(1, 2, e18(100), T0 + 10).unwrap();
        let direct = meta.basepool().get_dy(0, 1, e18(100)).unwrap();
        assert_eq!(via_meta, direct);
    }

    #[test]
    fn ownership_guard_suppresses_the_metapools_own_base_actions() {
        let pool = address!("0x00000000000000000000000000000000000000aa");
        let base = address!("0x00000000000000000000000000000000000000bb");
        let ctx = TransitionCtx {
            pool_address: pool,
            base_address: Some(base),
            instant: StateInstant::new(10, T0 + 10),
        };
        let state = PoolState::Metapool(meta_for_test(precision()));

        let own = PoolEvent::TokenExchange {
            buyer: pool,
            sold_id: 0,
            bought_id: 1,
            tokens_sold: e18(10),
        };
        assert!(state.apply(base, &own, &ctx).unwrap().is_none());

        let foreign = PoolEvent::TokenExchange {
            buyer: address!("0x00000000000000000000000000000000000000cc"),
            sold_id: 0,
            bought_id: 1,
            tokens_sold: e18(10),
        };
        let next = state.apply(base, &foreign, &ctx).unwrap().unwrap();
        let PoolState::Metapool(next) = next else { panic!("kind changed") };
        assert_ne!(next.basepool().balances(), meta_for_test(precision()).basepool().balances());
        // The metapool's own balances are untouched by a basepool log.
        assert_eq!(next.balances(), meta_for_test(precision()).balances());
    }

    #[test]
    fn exchange_underlying_base_to_base_only_touches_the_basepool() {
        let meta = meta_for_test(precision());
        let ev = PoolEvent::TokenExchangeUnderlying {
            buyer: Address::ZERO,
            sold_id: 1,
            bought_id: 2,
            tokens_sold: e18(100),
        };
        let next = meta.transition(&ev, T0 + 10).unwrap().unwrap();
        assert_eq!(next.balances(), meta.balances());
        assert_ne!(next.basepool().balances(), meta.basepool().balances());
    }
}
