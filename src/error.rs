use alloy::primitives::Address;
use thiserror::Error;

/// Errors surfaced by the pricing core.
///
/// All failures are pool-scoped: an error for one pool must never abort
/// pricing of other pools in the same aggregated query. Callers treat a
/// missing pool result as "no price offered", not as a fatal condition.
#[derive(Debug, Error)]
pub enum PricerError {
    /// Transport-level failure of a batched read that survived all retries.
    #[error("transport error: {0}")]
    Transport(String),

    /// A batched read timed out or exhausted its retry budget; the affected
    /// pool is temporarily unavailable.
    #[error("pool {0} temporarily unavailable: {1}")]
    Unavailable(Address, String),

    /// Input outside the protocol's declared storage width, e.g. a
    /// constant-product reserve above 2^112 - 1.
    #[error("input out of range: {0}")]
    InputRange(String),

    /// Invariant computation failed: zero balance division or a solver not
    /// converging within the iteration bound.
    #[error("invariant computation failed: {0}")]
    Invariant(String),

    /// A collaborator failed to decode call return data or a log.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Cheaply cloneable error for results shared between collapsed cold-start
/// callers.
#[derive(Clone, Debug, Error)]
#[error("{message}")]
pub struct SharedError {
    message: String,
}

impl SharedError {
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<PricerError> for SharedError {
    fn from(err: PricerError) -> Self {
        Self { message: err.to_string() }
    }
}
