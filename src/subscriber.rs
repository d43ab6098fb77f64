//! Per-pool state subscriber: cold start, log replay, rollback.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use alloy::primitives::Address;
use futures::{FutureExt, future::Shared};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::{
    chain::{ChainSource, PoolCodec},
    error::{PricerError, SharedError},
    multicall::MulticallBatcher,
    state::{PoolState, TransitionCtx},
    store::StateStore,
    types::{Log, PairKey, PoolIdentifier, StateInstant},
};

type ColdStartFuture = Shared<Pin<Box<dyn Future<Output = Result<(), SharedError>> + Send>>>;

/// Owner of one pool's versioned state.
///
/// Lifecycle is `Cold` (empty store) to `Warm` (at least one complete
/// snapshot). The first read at a block triggers a cold start: one batched
/// read of the pool's complete state, decoded by the protocol codec.
/// Concurrent cold starts collapse into a single in-flight shared future.
/// Once warm, decoded logs advance the state through pure transitions and
/// reads never touch the network.
pub struct PoolSubscriber<C> {
    identifier: PoolIdentifier,
    pool_address: Address,
    base_address: Option<Address>,
    pair: PairKey,
    codec: Arc<dyn PoolCodec>,
    batcher: Arc<MulticallBatcher<C>>,
    store: Arc<RwLock<StateStore<PoolState>>>,
    inflight: Mutex<Option<ColdStartFuture>>,
    /// Block of the newest call-derived snapshot (0 = none). A read call
    /// pinned at block N returns end-of-block-N state, so logs of blocks
    /// `<= N` are already reflected and must not be applied again.
    fetched_block: Arc<AtomicU64>,
}

impl<C: ChainSource + 'static> PoolSubscriber<C> {
    pub fn new(
        identifier: PoolIdentifier,
        pool_address: Address,
        pair: PairKey,
        codec: Arc<dyn PoolCodec>,
        batcher: Arc<MulticallBatcher<C>>,
    ) -> Self {
        let base_address = codec.extra_subscriptions(pool_address).into_iter().next();
        Self {
            identifier,
            pool_address,
            base_address,
            pair,
            codec,
            batcher,
            store: Arc::new(RwLock::new(StateStore::default())),
            inflight: Mutex::new(None),
            fetched_block: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn identifier(&self) -> &PoolIdentifier {
        &self.identifier
    }

    pub fn pool_address(&self) -> Address {
        self.pool_address
    }

    pub fn pair(&self) -> &PairKey {
        &self.pair
    }

    /// Addresses whose logs this subscriber consumes.
    pub fn subscribed_addresses(&self) -> Vec<Address> {
        let mut addresses = vec![self.pool_address];
        addresses.extend(self.base_address);
        addresses
    }

    /// Snapshot at the greatest recorded block `<= instant`, fetching the
    /// initial state first when cold. Returns the snapshot together with
    /// the instant it was recorded at.
    pub async fn state_at(
        &self,
        instant: StateInstant,
    ) -> Result<(StateInstant, PoolState), PricerError> {
        {
            let guard = self.store.read().await;
            if let Some((at, state)) = guard.get_state(instant.block_number()) {
                return Ok((*at, state.clone()));
            }
            // Warm but the requested block predates retained history: a
            // re-fetch at that block would truncate newer snapshots.
            if !guard.is_empty() {
                return Err(PricerError::Unavailable(
                    self.pool_address,
                    format!("history does not reach back to block {}", instant.block_number()),
                ));
            }
        }
        self.cold_start(instant).await.map_err(|err| {
            PricerError::Unavailable(self.pool_address, err.message().to_string())
        })?;
        let guard = self.store.read().await;
        let (at, state) = guard.get_state(instant.block_number()).ok_or_else(|| {
            PricerError::Unavailable(self.pool_address, "no snapshot after cold start".into())
        })?;
        Ok((*at, state.clone()))
    }

    async fn cold_start(&self, instant: StateInstant) -> Result<(), SharedError> {
        let fut = {
            let mut guard = self.inflight.lock().await;
            match guard.as_ref() {
                Some(fut) => fut.clone(),
                None => {
                    let codec = self.codec.clone();
                    let batcher = self.batcher.clone();
                    let store = self.store.clone();
                    let fetched_block = self.fetched_block.clone();
                    let pool = self.pool_address;
                    let pair = self.pair;
                    let fetch: Pin<Box<dyn Future<Output = Result<(), SharedError>> + Send>> =
                        Box::pin(async move {
                            let calls = codec.initial_state_calls(pool, &pair);
                            let results = batcher
                                .execute_require_success(&calls, Some(instant.block_number()))
                                .await
                                .map_err(SharedError::from)?;
                            let state = codec
                                .decode_initial_state(pool, &results)
                                .map_err(SharedError::from)?;
                            store.write().await.set_state(instant, state);
                            fetched_block.store(instant.block_number(), Ordering::SeqCst);
                            Ok(())
                        });
                    let fut = fetch.shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };
        let result = fut.await;
        // Clear the marker only once its future has completed, so a newer
        // in-flight fetch is never discarded by a stale waiter.
        let mut guard = self.inflight.lock().await;
        if guard.as_ref().is_some_and(|f| f.peek().is_some()) {
            *guard = None;
        }
        result
    }

    /// Presence probe that never triggers a cold start.
    pub(crate) async fn state_at_block(&self, block_number: u64) -> Option<StateInstant> {
        self.store.read().await.get_state(block_number).map(|(at, _)| *at)
    }

    /// Calls whose batched results [`Self::seed_state`] expects, for
    /// callers that warm many pools in one round trip.
    pub(crate) fn initial_state_calls(&self) -> Vec<crate::chain::Call> {
        self.codec.initial_state_calls(self.pool_address, &self.pair)
    }

    /// Installs an externally fetched snapshot, bypassing the cold-start
    /// path.
    pub(crate) async fn seed_state(&self, instant: StateInstant, state: PoolState) {
        self.store.write().await.set_state(instant, state);
        self.fetched_block.store(instant.block_number(), Ordering::SeqCst);
    }

    /// Applies one raw log observed at `instant`.
    ///
    /// No-ops while cold (the next cold start reads post-log state anyway),
    /// for logs of addresses this subscriber does not own, and for event
    /// kinds the protocol does not react to. A failing transition keeps the
    /// previous snapshot: stale-but-available beats unavailable.
    pub async fn on_log(&self, log: &Log, instant: StateInstant) {
        let fetched = self.fetched_block.load(Ordering::SeqCst);
        if fetched != 0 && instant.block_number() <= fetched {
            return;
        }
        let mut store = self.store.write().await;
        let Some((_, prev)) = store.get_state(instant.block_number()) else {
            return;
        };
        let event = match self.codec.decode_log(log) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(err) => {
                warn!(pool = %self.pool_address, %err, "undecodable log, keeping previous state");
                return;
            }
        };
        let ctx = TransitionCtx {
            pool_address: self.pool_address,
            base_address: self.base_address,
            instant,
        };
        match prev.apply(log.address, &event, &ctx) {
            Ok(Some(next)) => store.set_state(instant, next),
            Ok(None) => {}
            Err(err) => {
                warn!(
                    pool = %self.pool_address,
                    block = instant.block_number(),
                    %err,
                    "transition failed, keeping previous state",
                );
            }
        }
    }

    /// Drops snapshots above `to_block` after a reorg. When nothing
    /// survives the subscriber is cold again and the next read re-fetches.
    pub async fn rollback(&self, to_block: u64) -> bool {
        let survived = self.store.write().await.rollback(to_block);
        if !survived {
            self.fetched_block.store(0, Ordering::SeqCst);
            debug!(pool = %self.pool_address, to_block, "rollback past history, going cold");
        }
        survived
    }

    pub async fn is_warm(&self) -> bool {
        !self.store.read().await.is_empty()
    }
}
