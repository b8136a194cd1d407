//! Error types for the schedulers
//!
//! Individual transaction failures are not errors; they are ordinary
//! outcomes recorded through `set_status`. Every variant here indicates a
//! bug in the calling pipeline and is fatal to the current candidate block.

use fugue_state::StateError;
use fugue_types::{BatchId, TxnId};
use thiserror::Error;

/// Scheduler errors
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Batch added after `finalize`
    #[error("batch {0} added to a finalized scheduler")]
    Finalized(BatchId),

    /// Status reported for a transaction that was never dispatched
    #[error("transaction was never dispatched: {0}")]
    UnknownTransaction(TxnId),

    /// Status reported twice for the same transaction
    #[error("status already recorded for transaction: {0}")]
    DuplicateStatus(TxnId),

    /// Serial scheduler status did not match the outstanding transaction
    #[error("status for {got} does not match outstanding transaction {expected:?}")]
    MismatchedTransaction {
        /// The transaction currently outstanding, if any
        expected: Option<TxnId>,
        /// The transaction the status was reported for
        got: TxnId,
    },

    /// Dependency cycle detected while ordering
    #[error("cyclic dependency detected involving transaction {0}")]
    CyclicDependency(TxnId),

    /// Interaction with a scheduler after `abandon`
    #[error("scheduler has been abandoned")]
    Abandoned,

    /// The state/context collaborator failed
    #[error("state context failure: {0}")]
    State(#[from] StateError),
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;
