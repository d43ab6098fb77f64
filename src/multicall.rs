//! Chunked, retrying batch reads over a [`ChainSource`].

use std::{sync::Arc, time::Duration};

use tokio::time::{sleep, timeout};
use tracing::warn;

use crate::{
    chain::{Call, CallResult, ChainSource},
    error::PricerError,
};

/// Tuning knobs for one batcher instance.
#[derive(Clone, Debug)]
pub struct BatcherConfig {
    /// Maximum calls per round trip.
    pub chunk_size: usize,
    /// Total attempts per chunk, including the first.
    pub max_attempts: u32,
    /// Backoff before the first retry; doubles per retry.
    pub initial_backoff: Duration,
    /// Upper bound on a single backoff sleep.
    pub max_backoff: Duration,
    /// Deadline for one round trip.
    pub call_timeout: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Splits large call sets into chunks, runs each chunk as one round trip
/// with timeout and bounded exponential backoff, and reassembles results
/// in request order.
///
/// A chunk that still fails after the last attempt fails the whole batch:
/// callers treat that as their own operation failing, unrelated pools are
/// untouched.
#[derive(derive_more::Debug)]
pub struct MulticallBatcher<C> {
    #[debug(skip)]
    source: Arc<C>,
    config: BatcherConfig,
}

impl<C: ChainSource> MulticallBatcher<C> {
    pub fn new(source: Arc<C>, config: BatcherConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &Arc<C> {
        &self.source
    }

    /// Executes `calls` at `block_number` (or latest when `None`).
    ///
    /// The returned vector has exactly one [`CallResult`] per input call,
    /// index-aligned. Per-call reverts come back as `success == false`
    /// entries rather than batch errors.
    pub async fn execute(
        &self,
        calls: &[Call],
        block_number: Option<u64>,
    ) -> Result<Vec<CallResult>, PricerError> {
        let mut results = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(self.config.chunk_size.max(1)) {
            results.extend(self.execute_chunk(chunk, block_number).await?);
        }
        Ok(results)
    }

    /// Like [`Self::execute`] but maps any failed entry to a batch error.
    /// Used by callers that cannot proceed with partial data, e.g. initial
    /// state fetches.
    pub async fn execute_require_success(
        &self,
        calls: &[Call],
        block_number: Option<u64>,
    ) -> Result<Vec<CallResult>, PricerError> {
        let results = self.execute(calls, block_number).await?;
        if let Some(index) = results.iter().position(|r| !r.success) {
            return Err(PricerError::Transport(format!(
                "call {index} of {} to {} reverted",
                calls.len(),
                calls[index].target
            )));
        }
        Ok(results)
    }

    async fn execute_chunk(
        &self,
        chunk: &[Call],
        block_number: Option<u64>,
    ) -> Result<Vec<CallResult>, PricerError> {
        let mut backoff = self.config.initial_backoff;
        let mut last_error = None;
        for attempt in 1..=self.config.max_attempts.max(1) {
            if attempt > 1 {
                sleep(backoff).await;
                backoff = (backoff * 2).min(self.config.max_backoff);
            }
            match timeout(self.config.call_timeout, self.source.call_many(chunk, block_number))
                .await
            {
                Ok(Ok(results)) => {
                    if results.len() != chunk.len() {
                        return Err(PricerError::Transport(format!(
                            "batch returned {} results for {} calls",
                            results.len(),
                            chunk.len()
                        )));
                    }
                    return Ok(results);
                }
                Ok(Err(err)) => {
                    warn!(attempt, %err, "batched read failed");
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(attempt, timeout = ?self.config.call_timeout, "batched read timed out");
                    last_error = Some(PricerError::Transport("batched read timed out".into()));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| PricerError::Transport("no attempts made".into())))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use alloy::primitives::{Address, Bytes};
    use async_trait::async_trait;

    use super::*;

    /// Echoes each call's index; optionally fails the first N round trips.
    struct ScriptedSource {
        round_trips: AtomicU32,
        fail_first: u32,
    }

    impl ScriptedSource {
        fn new(fail_first: u32) -> Self {
            Self { round_trips: AtomicU32::new(0), fail_first }
        }
    }

    #[async_trait]
    impl ChainSource for ScriptedSource {
        async fn call_many(
            &self,
            calls: &[Call],
            _block_number: Option<u64>,
        ) -> Result<Vec<CallResult>, PricerError> {
            let n = self.round_trips.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(PricerError::Transport("scripted failure".into()));
            }
            Ok(calls.iter().map(|c| CallResult::ok(c.calldata.clone())).collect())
        }

        async fn block_number(&self) -> Result<u64, PricerError> {
            Ok(0)
        }
    }

    fn fast_config(chunk_size: usize, max_attempts: u32) -> BatcherConfig {
        BatcherConfig {
            chunk_size,
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            call_timeout: Duration::from_secs(1),
        }
    }

    fn calls(n: usize) -> Vec<Call> {
        (0..n).map(|i| Call::new(Address::ZERO, Bytes::from(vec![i as u8]))).collect()
    }

    #[tokio::test]
    async fn chunks_preserve_request_order() {
        let source = Arc::new(ScriptedSource::new(0));
        let batcher = MulticallBatcher::new(source.clone(), fast_config(3, 1));
        let input = calls(8);
        let results = batcher.execute(&input, None).await.unwrap();
        assert_eq!(results.len(), 8);
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.return_data, Bytes::from(vec![i as u8]));
        }
        // 8 calls in chunks of 3 -> 3 round trips.
        assert_eq!(source.round_trips.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_failure_is_retried() {
        let source = Arc::new(ScriptedSource::new(2));
        let batcher = MulticallBatcher::new(source.clone(), fast_config(10, 3));
        let results = batcher.execute(&calls(2), None).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(source.round_trips.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_batch() {
        let source = Arc::new(ScriptedSource::new(u32::MAX));
        let batcher = MulticallBatcher::new(source.clone(), fast_config(10, 3));
        let err = batcher.execute(&calls(1), None).await.unwrap_err();
        assert!(matches!(err, PricerError::Transport(_)));
        assert_eq!(source.round_trips.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn require_success_rejects_reverted_entries() {
        struct Reverting;

        #[async_trait]
        impl ChainSource for Reverting {
            async fn call_many(
                &self,
                calls: &[Call],
                _block_number: Option<u64>,
            ) -> Result<Vec<CallResult>, PricerError> {
                let mut out: Vec<CallResult> =
                    calls.iter().map(|c| CallResult::ok(c.calldata.clone())).collect();
                out[1] = CallResult::failed();
                Ok(out)
            }

            async fn block_number(&self) -> Result<u64, PricerError> {
                Ok(0)
            }
        }

        let batcher = MulticallBatcher::new(Arc::new(Reverting), fast_config(10, 1));
        let partial = batcher.execute(&calls(3), None).await.unwrap();
        assert!(!partial[1].success);
        assert!(batcher.execute_require_success(&calls(3), None).await.is_err());
    }
}
