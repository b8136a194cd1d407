//! Serial scheduler: strict FIFO replay
//!
//! Returns transactions in the exact order their batches were added, one
//! at a time; a transaction must have its outcome recorded before the next
//! is handed out. Used as a correctness baseline for the parallel
//! scheduler and as a fallback when parallelism is not worth the
//! bookkeeping.

use crate::error::{SchedulerError, SchedulerResult};
use crate::scheduler::{BatchResult, Scheduler, TxnDispatch, TxnResult, TxnStatus};
use fugue_state::{ContextId, ContextManager, StateRoot};
use fugue_types::{Batch, BatchId, Transaction, TxnId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

struct AnnotatedBatch {
    batch: Batch,
    preserve: bool,
    required: bool,
}

#[derive(Default)]
struct Inner {
    txn_queue: VecDeque<Transaction>,
    dispatched: Vec<TxnDispatch>,
    batch_results: HashMap<BatchId, BatchResult>,
    txn_results: HashMap<TxnId, TxnResult>,
    txn_to_batch: HashMap<TxnId, BatchId>,
    batches_by_id: HashMap<BatchId, AnnotatedBatch>,
    /// Ids of the last transaction of each batch, in arrival order
    last_in_batch: Vec<TxnId>,
    batch_order: Vec<BatchId>,
    expected_roots: HashMap<BatchId, StateRoot>,
    in_progress: Option<TxnId>,
    previous_context: Option<ContextId>,
    previous_valid_batch_context: Option<ContextId>,
    root_calculated: bool,
    finalized: bool,
    abandoned: bool,
}

impl Inner {
    fn is_complete(&self) -> bool {
        self.finalized && self.txn_results.len() == self.txn_to_batch.len()
    }

    fn explicit_dependency_failed(&self, txn: &Transaction) -> bool {
        txn.dependencies().iter().any(|dep| {
            self.txn_to_batch
                .get(dep)
                .and_then(|batch_id| self.batch_results.get(batch_id))
                .map(|result| !result.is_valid)
                .unwrap_or(false)
        })
    }

    fn in_invalid_batch(&self, txn_id: &TxnId) -> bool {
        self.txn_to_batch
            .get(txn_id)
            .and_then(|batch_id| self.batch_results.get(batch_id))
            .map(|result| !result.is_valid)
            .unwrap_or(false)
    }

    /// Fail the transaction's whole batch: record the invalid batch result
    /// and an invalid outcome for every member that has none yet.
    fn fail_batch_of(&mut self, txn_id: &TxnId) {
        let Some(batch_id) = self.txn_to_batch.get(txn_id).cloned() else {
            return;
        };
        self.batch_results.insert(
            batch_id.clone(),
            BatchResult {
                is_valid: false,
                state_root: None,
            },
        );
        if let Some(annotated) = self.batches_by_id.get(&batch_id) {
            let missing: Vec<TxnId> = annotated
                .batch
                .transactions
                .iter()
                .map(|t| t.id().clone())
                .filter(|id| !self.txn_results.contains_key(id))
                .collect();
            for id in missing {
                self.txn_results
                    .insert(id.clone(), TxnResult::new(id, TxnStatus::Invalid));
            }
        }
    }

    /// After excluding a batch, execution resumes from the last context
    /// that ended a valid batch.
    fn rewind_to_last_valid_context(&mut self, txn_id: &TxnId) {
        if self.last_in_batch.contains(txn_id) {
            self.previous_context = self.previous_valid_batch_context.clone();
        }
    }
}

/// FIFO reference scheduler.
pub struct SerialScheduler {
    context_manager: Arc<dyn ContextManager>,
    first_root: StateRoot,
    always_persist: bool,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl SerialScheduler {
    /// Create a scheduler executing on top of `first_root`.
    ///
    /// With `always_persist`, completion squashes straight into the
    /// canonical state (block publishing); otherwise the squashed root is
    /// only persisted when it matches a batch's expected root (block
    /// validation).
    pub fn new(
        context_manager: Arc<dyn ContextManager>,
        first_root: StateRoot,
        always_persist: bool,
    ) -> Self {
        Self {
            context_manager,
            first_root,
            always_persist,
            inner: Mutex::new(Inner::default()),
            condvar: Condvar::new(),
        }
    }

    /// Squash the chain ending at the last valid batch's context and
    /// stamp the resulting root onto that batch's result.
    fn calculate_final_root(&self, inner: &mut Inner) {
        if inner.root_calculated {
            return;
        }
        inner.root_calculated = true;

        let Some(last_txn) = inner.last_in_batch.last() else {
            return;
        };
        let last_batch = inner.txn_to_batch[last_txn].clone();
        let expected = inner.expected_roots.get(&last_batch).cloned();

        let Some(context) = inner.previous_valid_batch_context.clone() else {
            return;
        };
        let chain = [context];
        let publishing = self.always_persist || expected.is_none();
        let root = match self.context_manager.squash(
            &self.first_root,
            &chain,
            self.always_persist,
            publishing,
        ) {
            Ok(root) => root,
            Err(err) => {
                tracing::warn!("final squash failed: {err}");
                return;
            }
        };
        if !self.always_persist && Some(&root) == expected.as_ref() {
            if let Err(err) = self
                .context_manager
                .squash(&self.first_root, &chain, true, true)
            {
                tracing::warn!("persisting verified root failed: {err}");
            }
        }

        // Stamp the root on the last valid batch.
        for txn_id in inner.last_in_batch.iter().rev() {
            let batch_id = inner.txn_to_batch[txn_id].clone();
            if let Some(result) = inner.batch_results.get_mut(&batch_id) {
                if result.is_valid {
                    result.state_root = Some(root.clone());
                    break;
                }
            }
        }
    }
}

impl Scheduler for SerialScheduler {
    fn add_batch(
        &self,
        batch: Batch,
        expected_root: Option<StateRoot>,
        required: bool,
    ) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if inner.abandoned {
            return Err(SchedulerError::Abandoned);
        }
        if inner.finalized {
            return Err(SchedulerError::Finalized(batch.id().clone()));
        }

        // The first non-required batch is preserved so an early
        // unschedule cannot produce an empty schedule.
        let preserve =
            required || !inner.batches_by_id.values().any(|b| !b.required);

        let batch_id = batch.id().clone();
        if let Some(root) = expected_root {
            inner.expected_roots.insert(batch_id.clone(), root);
        }
        for (idx, txn) in batch.transactions.iter().enumerate() {
            if idx == batch.transactions.len() - 1 {
                inner.last_in_batch.push(txn.id().clone());
            }
            inner.txn_to_batch.insert(txn.id().clone(), batch_id.clone());
            inner.txn_queue.push_back(txn.clone());
        }
        inner.batch_order.push(batch_id.clone());
        inner.batches_by_id.insert(
            batch_id,
            AnnotatedBatch {
                batch,
                preserve,
                required,
            },
        );
        self.condvar.notify_all();
        Ok(())
    }

    fn next_transaction(&self) -> Option<TxnDispatch> {
        let mut inner = self.inner.lock();
        if inner.abandoned || inner.in_progress.is_some() {
            return None;
        }

        let txn = loop {
            let txn = inner.txn_queue.pop_front()?;
            if inner.explicit_dependency_failed(&txn) || inner.in_invalid_batch(txn.id()) {
                inner.fail_batch_of(txn.id());
                inner.rewind_to_last_valid_context(txn.id());
                self.condvar.notify_all();
                continue;
            }
            break txn;
        };

        inner.in_progress = Some(txn.id().clone());
        let dispatch = TxnDispatch {
            txn,
            base_root: self.first_root.clone(),
            base_contexts: inner.previous_context.iter().cloned().collect(),
        };
        inner.dispatched.push(dispatch.clone());
        Some(dispatch)
    }

    fn set_status(&self, txn_id: &TxnId, status: TxnStatus) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if inner.abandoned {
            return Err(SchedulerError::Abandoned);
        }
        if inner.in_progress.as_ref() != Some(txn_id) {
            return Err(SchedulerError::MismatchedTransaction {
                expected: inner.in_progress.clone(),
                got: txn_id.clone(),
            });
        }
        inner.in_progress = None;

        let batch_id = inner
            .txn_to_batch
            .get(txn_id)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownTransaction(txn_id.clone()))?;

        inner
            .txn_results
            .insert(txn_id.clone(), TxnResult::new(txn_id.clone(), status.clone()));

        match &status {
            TxnStatus::Valid(context_id) => {
                inner.previous_context = Some(context_id.clone());
            }
            TxnStatus::Invalid => {
                inner.fail_batch_of(txn_id);
            }
        }

        if inner.last_in_batch.contains(txn_id) {
            if inner.batch_results.contains_key(&batch_id) {
                // The batch failed earlier; resume from the last good batch.
                inner.previous_context = inner.previous_valid_batch_context.clone();
            } else {
                inner.previous_valid_batch_context = inner.previous_context.clone();
                inner.batch_results.insert(
                    batch_id,
                    BatchResult {
                        is_valid: true,
                        state_root: None,
                    },
                );
            }
        }

        self.condvar.notify_all();
        Ok(())
    }

    fn finalize(&self) {
        let mut inner = self.inner.lock();
        inner.finalized = true;
        self.condvar.notify_all();
    }

    fn complete(&self, block: bool) -> bool {
        let mut inner = self.inner.lock();
        loop {
            if inner.is_complete() {
                self.calculate_final_root(&mut inner);
                return true;
            }
            if inner.abandoned || !block {
                return false;
            }
            self.condvar.wait(&mut inner);
        }
    }

    fn abandon(&self) {
        let mut inner = self.inner.lock();
        if inner.abandoned || inner.is_complete() {
            return;
        }
        if let Some(context) = inner.previous_context.clone() {
            if let Err(err) =
                self.context_manager
                    .squash(&self.first_root, &[context], false, true)
            {
                tracing::warn!("context release on abandon failed: {err}");
            }
        }
        inner.abandoned = true;
        self.condvar.notify_all();
    }

    fn is_abandoned(&self) -> bool {
        self.inner.lock().abandoned
    }

    fn batch_ids(&self) -> Vec<BatchId> {
        self.inner.lock().batch_order.clone()
    }

    fn batch_result(&self, batch_id: &BatchId) -> SchedulerResult<Option<BatchResult>> {
        Ok(self.inner.lock().batch_results.get(batch_id).cloned())
    }

    fn transaction_results(&self, batch_id: &BatchId) -> Option<Vec<TxnResult>> {
        let inner = self.inner.lock();
        let annotated = inner.batches_by_id.get(batch_id)?;
        Some(
            annotated
                .batch
                .transactions
                .iter()
                .filter_map(|txn| inner.txn_results.get(txn.id()).cloned())
                .collect(),
        )
    }

    fn unschedule_incomplete_batches(&self) {
        let mut inner = self.inner.lock();

        let mut keep_in_progress: Option<BatchId> = None;
        if let Some(in_progress) = inner.in_progress.clone() {
            let batch_id = inner.txn_to_batch[&in_progress].clone();
            if inner.batches_by_id[&batch_id].preserve {
                keep_in_progress = Some(batch_id);
            } else {
                inner.in_progress = None;
            }
        }

        let incomplete: Vec<BatchId> = inner
            .batches_by_id
            .iter()
            .filter(|(batch_id, annotated)| {
                !inner.batch_results.contains_key(*batch_id)
                    && !annotated.preserve
                    && keep_in_progress.as_ref() != Some(*batch_id)
            })
            .map(|(batch_id, _)| batch_id.clone())
            .collect();

        for batch_id in &incomplete {
            let Some(annotated) = inner.batches_by_id.remove(batch_id) else {
                continue;
            };
            for txn in &annotated.batch.transactions {
                inner.txn_results.remove(txn.id());
                inner.txn_to_batch.remove(txn.id());
                inner.txn_queue.retain(|queued| queued.id() != txn.id());
            }
            if let Some(last) = annotated.batch.transactions.last() {
                inner.last_in_batch.retain(|id| id != last.id());
            }
            inner.batch_order.retain(|id| id != batch_id);
        }

        if !incomplete.is_empty() {
            tracing::debug!(
                removed = incomplete.len(),
                "removed incomplete batches from the schedule"
            );
        }
        self.condvar.notify_all();
    }

    fn is_transaction_in_schedule(&self, txn_id: &TxnId) -> bool {
        self.inner.lock().txn_to_batch.contains_key(txn_id)
    }

    fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatched.len()
    }

    fn dispatched(&self, index: usize) -> Option<TxnDispatch> {
        self.inner.lock().dispatched.get(index).cloned()
    }
}
