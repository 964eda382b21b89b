//! Error taxonomy for the anchor/proof-of-fee engine.
//!
//! Maps 1:1 onto the error kinds the engine's propagation policy
//! distinguishes between: transport errors that are worth retrying,
//! malformed upstream data that kills just the current block, storage
//! failures, programmer-invariant violations, and bad caller input on the
//! query side.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// The upstream call did not complete within its per-attempt timeout.
    /// Retried with exponential backoff up to `request_max_retries`.
    #[error("upstream timeout: {0}")]
    UpstreamTimeout(String),

    /// The upstream call failed for a reason other than a timeout
    /// (connection refused, non-2xx, RPC error object). Also retryable.
    #[error("upstream error: {0}")]
    UpstreamError(String),

    /// The upstream responded but the payload did not have the shape this
    /// engine expects (missing field, wrong type). Fatal for the block
    /// currently being processed; the tick aborts and retries next time.
    #[error("malformed upstream response: {0}")]
    UpstreamMalformed(String),

    /// A durable-store write or read failed. Retryable; aborts the
    /// in-flight tick or rollback step without advancing engine state.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// A broken invariant the engine itself is responsible for upholding
    /// (duplicate transaction_number slipped through a uniqueness check,
    /// out-of-range index_within_block, non-contiguous batch ids). Not
    /// retryable — indicates a programming bug.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// The caller's query was malformed or referenced a view of the chain
    /// this engine no longer agrees with (stale fork). Returned to the
    /// caller, never retried internally.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl EngineError {
    /// Whether a single upstream *call* should be retried with backoff
    /// (see [`crate::blockchain_client::with_retry`]) before giving up and
    /// surfacing the error to its caller. This is a per-attempt concern,
    /// distinct from whether the *process* should keep running after a tick
    /// fails — every tick-level error aborts that tick and is retried on
    /// the next poll regardless of this flag; only `Invariant` is fatal to
    /// the process (see `main`'s tick loop).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamTimeout(_) | EngineError::UpstreamError(_) | EngineError::PersistenceError(_)
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
