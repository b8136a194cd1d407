//! The scheduling contract shared by all scheduler implementations
//!
//! A scheduler is owned by exactly one candidate block under construction
//! or validation. A block pipeline feeds it batches, worker threads pull
//! ready transactions with [`Scheduler::next_transaction`] and report
//! outcomes with [`Scheduler::set_status`], and the block publisher or
//! validator reads final per-batch results in original arrival order.

use crate::error::SchedulerResult;
use fugue_state::{ContextId, StateRoot};
use fugue_types::{Batch, BatchId, Transaction, TxnId};

/// Reported outcome of one executed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxnStatus {
    /// The transaction applied successfully against the given context
    Valid(ContextId),
    /// The transaction failed and was not applied
    Invalid,
}

impl TxnStatus {
    /// True for `Valid`
    pub fn is_valid(&self) -> bool {
        matches!(self, TxnStatus::Valid(_))
    }

    /// The context id, for valid outcomes
    pub fn context_id(&self) -> Option<&ContextId> {
        match self {
            TxnStatus::Valid(ctx) => Some(ctx),
            TxnStatus::Invalid => None,
        }
    }
}

/// A recorded per-transaction outcome. Created exactly once and never
/// overwritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxnResult {
    /// Id of the transaction
    pub txn_id: TxnId,
    /// The reported outcome
    pub status: TxnStatus,
}

impl TxnResult {
    /// Create a result record
    pub fn new(txn_id: TxnId, status: TxnStatus) -> Self {
        Self { txn_id, status }
    }

    /// True if the transaction applied successfully
    pub fn is_valid(&self) -> bool {
        self.status.is_valid()
    }

    /// The context id, for valid outcomes
    pub fn context_id(&self) -> Option<&ContextId> {
        self.status.context_id()
    }
}

/// Final outcome of a whole batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchResult {
    /// True if every transaction in the batch was valid
    pub is_valid: bool,
    /// Resulting state root, when the batch marked a state boundary
    /// (explicitly via an expected root, or as the last valid batch of a
    /// finalized schedule)
    pub state_root: Option<StateRoot>,
}

/// A transaction handed to a worker, together with everything needed to
/// build its execution context.
#[derive(Clone, Debug)]
pub struct TxnDispatch {
    /// The transaction to execute
    pub txn: Transaction,
    /// The state root the whole schedule is based on
    pub base_root: StateRoot,
    /// Context ids of recorded predecessors, highest precedence first.
    /// Empty when the transaction reads the base root directly.
    pub base_contexts: Vec<ContextId>,
}

impl TxnDispatch {
    /// Id of the dispatched transaction
    pub fn id(&self) -> &TxnId {
        self.txn.id()
    }
}

/// Contract for scheduling transaction execution.
///
/// Implementations are thread-safe: batches arrive from the block pipeline
/// while multiple workers pull and report concurrently.
pub trait Scheduler: Send + Sync {
    /// Add a batch to the schedule.
    ///
    /// `expected_root` marks a block-validation boundary: when the batch
    /// completes, the squashed root is compared against it before being
    /// persisted. `required` batches survive
    /// [`unschedule_incomplete_batches`](Scheduler::unschedule_incomplete_batches).
    fn add_batch(
        &self,
        batch: Batch,
        expected_root: Option<StateRoot>,
        required: bool,
    ) -> SchedulerResult<()>;

    /// Return one transaction that is ready (every predecessor has a
    /// recorded outcome) and not already dispatched, or `None` without
    /// blocking. Never returns a transaction twice while it is
    /// outstanding.
    fn next_transaction(&self) -> Option<TxnDispatch>;

    /// Record the outcome of a dispatched transaction. An invalid outcome
    /// triggers the invalidation cascade.
    fn set_status(&self, txn_id: &TxnId, status: TxnStatus) -> SchedulerResult<()>;

    /// Stop accepting batches; the schedule drains from here.
    fn finalize(&self);

    /// True once finalized and every accepted transaction has a recorded
    /// outcome. With `block`, suspends the caller until that holds or the
    /// scheduler is abandoned.
    fn complete(&self, block: bool) -> bool;

    /// Cancel the schedule: release every issued context and wake all
    /// waiters. Idempotent; a no-op once the schedule has completed.
    fn abandon(&self);

    /// True if `abandon` has been called
    fn is_abandoned(&self) -> bool;

    /// Ids of accepted batches in original arrival order
    fn batch_ids(&self) -> Vec<BatchId>;

    /// Final result for a batch, or `Ok(None)` while any of its
    /// transactions lacks an outcome or the batch is unknown
    fn batch_result(&self, batch_id: &BatchId) -> SchedulerResult<Option<BatchResult>>;

    /// Recorded per-transaction results for a batch, in the batch's
    /// transaction order; `None` for an unknown batch
    fn transaction_results(&self, batch_id: &BatchId) -> Option<Vec<TxnResult>>;

    /// Remove batches that still have unfinished transactions, except
    /// required/preserved ones, so the schedule can be finalized early
    fn unschedule_incomplete_batches(&self);

    /// True if the transaction belongs to this schedule
    fn is_transaction_in_schedule(&self, txn_id: &TxnId) -> bool;

    /// Number of transactions dispatched so far
    fn dispatch_count(&self) -> usize;

    /// The `index`-th dispatch, in dispatch order. Every consumer
    /// iterating from zero observes the same sequence.
    fn dispatched(&self, index: usize) -> Option<TxnDispatch>;
}
