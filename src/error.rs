//! Error taxonomy for the oracle and its pipelines.
//!
//! Collaborator traits keep `anyhow::Result` at the boundary; everything the
//! pipelines themselves can get wrong is classified here so callers can tell
//! a retryable peer hiccup from a chain-integrity violation.
use bitcoin::BlockHash;
use thiserror::Error;

use crate::chain::BlockPosition;

/// Errors surfaced by the filter oracle and its sync pipelines.
#[derive(Debug, Error)]
pub enum OracleError {
    /// A peer-supplied filter body did not decode as a valid GCS stream.
    #[error("malformed filter body for block {0}")]
    MalformedFilter(BlockHash),

    /// A filter body did not reproduce the header already committed for its
    /// height. Protocol violation by the serving peer.
    #[error("filter body at {position} does not reproduce its committed header")]
    HeaderMismatch {
        /// Height and hash of the offending block.
        position: BlockPosition,
    },

    /// A batch arrived out of order with respect to the contiguous tip.
    #[error("batch start mismatch: got {got}, expected {expected}")]
    BatchStart {
        /// First height the batch claims to cover.
        got: u32,
        /// Height the pipeline was waiting for.
        expected: u32,
    },

    /// A locally chained header disagreed with a compiled checkpoint.
    #[error("checkpoint mismatch at height {height}")]
    CheckpointMismatch {
        /// Checkpoint height that failed verification.
        height: u32,
    },

    /// The best chain has no block at a height the pipeline needed.
    #[error("no best-chain block at height {0}")]
    BlockUnavailable(u32),

    /// A filter body is missing below the filter tip. Treated as local
    /// corruption, answered with a rollback rather than silent absence.
    #[error("missing filter data at {0}")]
    MissingFilter(BlockPosition),

    /// Bounded wait for the predecessor header expired. The chain must be
    /// re-established via a reset before the height can be retried.
    #[error("timed out waiting for chained header at height {0}")]
    ChainWait(u32),

    /// The job's pipeline was reset while the job was in flight; its result
    /// was discarded.
    #[error("pipeline reset invalidated an in-flight job")]
    Stale,

    /// The oracle is shutting down.
    #[error("oracle is shutting down")]
    Shutdown,

    /// A collaborator (database, header oracle, transport, block source)
    /// failed.
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl OracleError {
    /// Whether re-issuing the same batch (possibly against another peer) is a
    /// reasonable response. Integrity violations and shutdown are not
    /// retryable; they need a rollback or a teardown instead.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            OracleError::MalformedFilter(_)
                | OracleError::HeaderMismatch { .. }
                | OracleError::BatchStart { .. }
                | OracleError::BlockUnavailable(_)
                | OracleError::Collaborator(_)
        )
    }
}

/// Result alias used throughout the pipelines.
pub type Result<T, E = OracleError> = std::result::Result<T, E>;
