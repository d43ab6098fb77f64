//! Pool registry: pair resolution, lazy subscribers, pricing entry points.

use std::{str::FromStr, sync::Arc};

use alloy::primitives::{Address, U256};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{
    chain::{ChainSource, KvCache, PoolCodec},
    engine::constant_product as cp,
    error::PricerError,
    multicall::MulticallBatcher,
    state::PoolState,
    subscriber::PoolSubscriber,
    types::{Log, PairKey, PoolIdentifier, PoolPrices, StateInstant, SwapSide, Token},
};

/// Sentinel stored in the external cache for pairs the factory reports as
/// nonexistent, so repeated queries for unlisted pairs stay off-chain.
const NO_POOL: &str = "none";

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Protocol name, prefixed to pool identifiers and cache keys.
    pub name: String,
    /// TTL of externally cached pair resolutions, seconds.
    pub pair_cache_ttl: u64,
    /// Protocol quotes fixed-input trades only (StableSwap family).
    pub sell_only: bool,
}

impl RegistryConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into().to_lowercase(), pair_cache_ttl: 3_600, sell_only: false }
    }

    pub fn sell_only(mut self) -> Self {
        self.sell_only = true;
        self
    }
}

/// One protocol family's pool set.
///
/// Resolves canonical token pairs to pool addresses (memoized in memory
/// and in the external [`KvCache`], negative results included), attaches a
/// [`PoolSubscriber`] per discovered pool lazily, and serves the
/// aggregation-layer entry points: identifier listing, price vectors and
/// log routing.
pub struct PoolRegistry<C> {
    config: RegistryConfig,
    codec: Arc<dyn PoolCodec>,
    batcher: Arc<MulticallBatcher<C>>,
    cache: Arc<dyn KvCache>,
    pairs: DashMap<PairKey, Option<Address>>,
    subscribers: DashMap<Address, Arc<PoolSubscriber<C>>>,
    /// Log routing index: observed address to interested subscribers.
    routes: DashMap<Address, Vec<Arc<PoolSubscriber<C>>>>,
}

impl<C: ChainSource + 'static> PoolRegistry<C> {
    pub fn new(
        config: RegistryConfig,
        codec: Arc<dyn PoolCodec>,
        batcher: Arc<MulticallBatcher<C>>,
        cache: Arc<dyn KvCache>,
    ) -> Self {
        Self {
            config,
            codec,
            batcher,
            cache,
            pairs: DashMap::new(),
            subscribers: DashMap::new(),
            routes: DashMap::new(),
        }
    }

    fn pool_identifier(&self, pool: Address) -> PoolIdentifier {
        format!("{}_{pool:#x}", self.config.name)
    }

    fn pair_cache_key(&self, pair: &PairKey) -> String {
        format!("{}_pair_{:#x}_{:#x}", self.config.name, pair.token0(), pair.token1())
    }

    fn attach(&self, pair: PairKey, pool: Address) -> Arc<PoolSubscriber<C>> {
        let subscriber = self
            .subscribers
            .entry(pool)
            .or_insert_with(|| {
                Arc::new(PoolSubscriber::new(
                    self.pool_identifier(pool),
                    pool,
                    pair,
                    self.codec.clone(),
                    self.batcher.clone(),
                ))
            })
            .clone();
        for address in subscriber.subscribed_addresses() {
            let mut route = self.routes.entry(address).or_default();
            if !route.iter().any(|s| s.pool_address() == pool) {
                route.push(subscriber.clone());
            }
        }
        subscriber
    }

    /// Resolves the pool trading `a`/`b`, if any.
    ///
    /// Lookup order: in-memory map, external cache (both hold negative
    /// results), then one factory read. `Ok(None)` means the factory knows
    /// no such pool; identical addresses never form a pair.
    pub async fn find_pair(
        &self,
        a: Address,
        b: Address,
    ) -> Result<Option<Arc<PoolSubscriber<C>>>, PricerError> {
        let Some(pair) = PairKey::new(a, b) else {
            return Ok(None);
        };
        if let Some(entry) = self.pairs.get(&pair) {
            let resolved = *entry;
            drop(entry);
            return Ok(resolved.map(|pool| self.attach(pair, pool)));
        }

        let key = self.pair_cache_key(&pair);
        if let Some(cached) = self.cache.get(&key).await {
            let resolved = if cached == NO_POOL {
                None
            } else {
                Some(Address::from_str(&cached).map_err(|err| {
                    PricerError::Decode(format!("cached pair address {cached:?}: {err}"))
                })?)
            };
            self.pairs.insert(pair, resolved);
            return Ok(resolved.map(|pool| self.attach(pair, pool)));
        }

        let call = self.codec.pair_lookup_call(&pair);
        let results = self.batcher.execute_require_success(&[call], None).await?;
        let resolved = self.codec.decode_pair_lookup(&results[0].return_data)?;
        self.remember_pair(pair, resolved).await;
        Ok(resolved.map(|pool| self.attach(pair, pool)))
    }

    async fn remember_pair(&self, pair: PairKey, resolved: Option<Address>) {
        self.pairs.insert(pair, resolved);
        let value = match resolved {
            Some(pool) => format!("{pool:#x}"),
            None => NO_POOL.to_string(),
        };
        self.cache.setex(&self.pair_cache_key(&pair), self.config.pair_cache_ttl, &value).await;
    }

    /// Resolves many pairs and warms every cold pool, batching each phase
    /// into a single round trip: one for all unresolved factory lookups,
    /// one for all missing pool states.
    pub async fn batch_resolve(
        &self,
        pairs: &[(Address, Address)],
        instant: StateInstant,
    ) -> Result<(), PricerError> {
        let keys: Vec<PairKey> = pairs.iter().filter_map(|(a, b)| PairKey::new(*a, *b)).collect();

        let unresolved: Vec<PairKey> =
            keys.iter().filter(|pair| !self.pairs.contains_key(pair)).copied().collect();
        if !unresolved.is_empty() {
            let calls: Vec<_> =
                unresolved.iter().map(|pair| self.codec.pair_lookup_call(pair)).collect();
            let results = self.batcher.execute_require_success(&calls, None).await?;
            for (pair, result) in unresolved.iter().zip(&results) {
                match self.codec.decode_pair_lookup(&result.return_data) {
                    Ok(resolved) => self.remember_pair(*pair, resolved).await,
                    Err(err) => warn!(%pair, %err, "pair lookup undecodable, skipping"),
                }
            }
        }

        let mut cold = Vec::new();
        for pair in &keys {
            let Some(Some(pool)) = self.pairs.get(pair).map(|r| *r) else { continue };
            let subscriber = self.attach(*pair, pool);
            if subscriber.state_at_block(instant.block_number()).await.is_none() {
                cold.push(subscriber);
            }
        }
        if cold.is_empty() {
            return Ok(());
        }

        let mut calls = Vec::new();
        let mut spans = Vec::with_capacity(cold.len());
        for subscriber in &cold {
            let pool_calls = subscriber.initial_state_calls();
            spans.push(calls.len()..calls.len() + pool_calls.len());
            calls.extend(pool_calls);
        }
        let results =
            self.batcher.execute_require_success(&calls, Some(instant.block_number())).await?;
        for (subscriber, span) in cold.iter().zip(spans) {
            match self.codec.decode_initial_state(subscriber.pool_address(), &results[span]) {
                Ok(state) => subscriber.seed_state(instant, state).await,
                Err(err) => {
                    warn!(pool = %subscriber.pool_address(), %err, "initial state undecodable");
                }
            }
        }
        Ok(())
    }

    /// Identifiers of pools able to serve a trade between the two tokens
    /// on the requested side. The instant is part of the query surface for
    /// parity with [`Self::get_prices_volume`]; pair resolution itself is
    /// block-independent.
    pub async fn get_pool_identifiers(
        &self,
        from: Address,
        to: Address,
        side: SwapSide,
        _instant: StateInstant,
    ) -> Result<Vec<PoolIdentifier>, PricerError> {
        if self.config.sell_only && side == SwapSide::Buy {
            return Ok(Vec::new());
        }
        Ok(self
            .find_pair(from, to)
            .await?
            .map(|subscriber| vec![subscriber.identifier().clone()])
            .unwrap_or_default())
    }

    /// Price vector for `amounts` plus a unit price, or `None` when no
    /// pool applies or this pool cannot quote the requested side.
    ///
    /// Invariant failures while pricing drop only this pool's quote; they
    /// are logged and surfaced as `None`, never as a hard error.
    pub async fn get_prices_volume(
        &self,
        from: &Token,
        to: &Token,
        amounts: &[U256],
        side: SwapSide,
        instant: StateInstant,
        limit_identifiers: Option<&[PoolIdentifier]>,
    ) -> Result<Option<PoolPrices>, PricerError> {
        if self.config.sell_only && side == SwapSide::Buy {
            return Ok(None);
        }
        let Some(subscriber) = self.find_pair(from.address, to.address).await? else {
            return Ok(None);
        };
        if let Some(limit) = limit_identifiers
            && !limit.contains(subscriber.identifier())
        {
            return Ok(None);
        }
        let (at, state) = subscriber.state_at(instant).await?;

        let quoted = match &state {
            PoolState::ConstantProduct(pool) => {
                let reversed = subscriber.pair().is_reversed(from.address);
                let (reserve_in, reserve_out) = pool.ordered_reserves(reversed);
                let price = |amount: U256| match side {
                    SwapSide::Sell => {
                        cp::get_sell_price(reserve_in, reserve_out, pool.fee_bips(), amount)
                    }
                    SwapSide::Buy => {
                        cp::get_buy_price(reserve_in, reserve_out, pool.fee_bips(), amount)
                    }
                };
                let unit_amount = match side {
                    SwapSide::Sell => one_unit(from.decimals),
                    SwapSide::Buy => one_unit(to.decimals),
                };
                self.quote(|amount| price(amount), amounts, unit_amount)
            }
            PoolState::StableSwap(pool) => {
                // Index-addressed quoting is sell-only, as on chain.
                if side == SwapSide::Buy {
                    return Ok(None);
                }
                let Some(indices) =
                    self.codec.coin_indices(subscriber.pool_address(), from.address, to.address)
                else {
                    return Ok(None);
                };
                self.quote(
                    |amount| pool.get_dy(indices.i, indices.j, amount),
                    amounts,
                    one_unit(from.decimals),
                )
            }
            PoolState::Metapool(pool) => {
                if side == SwapSide::Buy {
                    return Ok(None);
                }
                let Some(indices) =
                    self.codec.coin_indices(subscriber.pool_address(), from.address, to.address)
                else {
                    return Ok(None);
                };
                let ts = at.block_timestamp();
                self.quote(
                    |amount| {
                        if indices.underlying {
                            pool.get_dy_underlying(indices.i, indices.j, amount, ts)
                        } else {
                            pool.get_dy(indices.i, indices.j, amount, ts)
                        }
                    },
                    amounts,
                    one_unit(from.decimals),
                )
            }
        };

        let (prices, unit) = match quoted {
            Ok(q) => q,
            Err(err) => {
                debug!(pool = %subscriber.pool_address(), %err, "pricing failed, omitting pool");
                return Ok(None);
            }
        };
        Ok(Some(PoolPrices {
            prices,
            unit,
            pool_identifier: subscriber.identifier().clone(),
            pool_address: subscriber.pool_address(),
            gas_cost: self.codec.pool_gas_cost(),
        }))
    }

    fn quote(
        &self,
        price: impl Fn(U256) -> Result<U256, PricerError>,
        amounts: &[U256],
        unit_amount: U256,
    ) -> Result<(Vec<U256>, U256), PricerError> {
        let prices = amounts.iter().map(|amount| price(*amount)).collect::<Result<_, _>>()?;
        Ok((prices, price(unit_amount)?))
    }

    /// Routes decoded-address logs of one block to their subscribers.
    /// Logs must arrive in on-chain order.
    pub async fn on_logs(&self, logs: &[Log], instant: StateInstant) {
        for log in logs {
            let Some(route) = self.routes.get(&log.address).map(|r| r.value().clone()) else {
                continue;
            };
            for subscriber in route {
                subscriber.on_log(log, instant).await;
            }
        }
    }

    /// Rolls every pool back to `to_block` after a reorg. Pools whose
    /// retained history does not reach back that far go cold and re-fetch
    /// on next use.
    pub async fn rollback(&self, to_block: u64) {
        for entry in self.subscribers.iter() {
            entry.value().rollback(to_block).await;
        }
    }
}

fn one_unit(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}
