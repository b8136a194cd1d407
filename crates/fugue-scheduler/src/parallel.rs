//! Parallel scheduler: dependency-gated concurrent dispatch
//!
//! Maintains the conflict index and dependency graph incrementally as
//! batches arrive. Any ready transaction may be dispatched to any worker;
//! only dependency edges constrain the order. Regardless of which worker
//! executes which transaction, and in what wall-clock order, the final
//! merged state transition is identical to executing every transaction
//! strictly in original batch order.

use crate::error::{SchedulerError, SchedulerResult};
use crate::graph::DependencyGraph;
use crate::predecessor::PredecessorTree;
use crate::scheduler::{BatchResult, Scheduler, TxnDispatch, TxnResult, TxnStatus};
use fugue_state::{ContextId, ContextManager, StateRoot};
use fugue_types::{Batch, BatchId, Transaction, TxnId};
use parking_lot::{Condvar, Mutex};
use std::cmp::Reverse;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

struct AnnotatedBatch {
    batch: Batch,
    index: usize,
    preserve: bool,
    required: bool,
}

#[derive(Default)]
struct Inner {
    tree: PredecessorTree,
    graph: DependencyGraph,
    /// Batch ids in arrival order
    batch_order: Vec<BatchId>,
    batches_by_id: HashMap<BatchId, AnnotatedBatch>,
    batch_by_txn: HashMap<TxnId, BatchId>,
    transactions: HashMap<TxnId, Transaction>,
    /// Undispatched transactions, arrival order
    available: Vec<TxnId>,
    /// Dispatches in dispatch order, for consistent consumer iteration
    dispatched: Vec<TxnDispatch>,
    dispatched_ids: HashSet<TxnId>,
    /// Dispatched, outcome not yet recorded
    outstanding: HashSet<TxnId>,
    /// Invalidated by cascade while in flight; the worker's eventual
    /// report is accepted once and dropped
    discarded: HashSet<TxnId>,
    results: HashMap<TxnId, TxnResult>,
    /// Closure of batches excluded by the invalidation cascade
    invalid_batches: HashSet<BatchId>,
    computed_results: HashMap<BatchId, BatchResult>,
    expected_roots: HashMap<BatchId, StateRoot>,
    finalized: bool,
    abandoned: bool,
}

impl Inner {
    fn is_complete(&self) -> bool {
        self.finalized && self.results.len() == self.batch_by_txn.len()
    }

    fn txn_in_valid_batch(&self, txn_id: &TxnId) -> bool {
        self.batch_by_txn
            .get(txn_id)
            .map(|batch_id| !self.invalid_batches.contains(batch_id))
            .unwrap_or(false)
    }

    fn all_in_batch_have_results(&self, batch_id: &BatchId) -> bool {
        self.batches_by_id
            .get(batch_id)
            .map(|annotated| {
                annotated
                    .batch
                    .transactions
                    .iter()
                    .all(|txn| self.results.contains_key(txn.id()))
            })
            .unwrap_or(false)
    }

    /// Context derivation reaches through predecessors and, when a
    /// predecessor's batch failed, through that predecessor's own
    /// predecessors. Dispatch must wait for outcomes two levels out.
    /// Predecessors no longer in the schedule (unscheduled batches) are
    /// treated as resolved.
    fn has_unresolved_predecessors(&self, txn_id: &TxnId) -> bool {
        let unresolved =
            |id: &TxnId| self.batch_by_txn.contains_key(id) && !self.results.contains_key(id);
        for pred in self.graph.predecessors_of(txn_id) {
            if unresolved(pred) {
                return true;
            }
            for pre_pred in self.graph.predecessors_of(pred) {
                if unresolved(pre_pred) {
                    return true;
                }
            }
        }
        false
    }

    /// An explicit dependency gates dispatch until the dependency's whole
    /// batch has outcomes. Dependencies not in this schedule are assumed
    /// committed by a prior block.
    fn dependency_not_processed(&self, txn: &Transaction) -> bool {
        txn.dependencies().iter().any(|dep| {
            self.batch_by_txn
                .get(dep)
                .map(|batch_id| !self.all_in_batch_have_results(batch_id))
                .unwrap_or(false)
        })
    }

    fn failed_by_dependency(&self, txn: &Transaction) -> bool {
        txn.dependencies().iter().any(|dep| {
            self.batch_by_txn
                .get(dep)
                .map(|batch_id| self.invalid_batches.contains(batch_id))
                .unwrap_or(false)
        })
    }

    fn sorted_by_arrival_desc(&self, mut ids: Vec<TxnId>) -> Vec<TxnId> {
        ids.sort_by_key(|id| Reverse(self.graph.arrival_index(id).unwrap_or(0)));
        ids
    }

    /// Collect the base context chain for a dispatch: the contexts of
    /// recorded predecessors, newest first, skipping members of excluded
    /// batches by recursing into their own predecessors.
    fn initial_contexts_for(&self, txn_id: &TxnId) -> Vec<ContextId> {
        let mut contexts = Vec::new();
        let mut in_chain: Vec<TxnId> = Vec::new();
        let mut deps: VecDeque<TxnId> = self
            .sorted_by_arrival_desc(self.graph.predecessors_of(txn_id).cloned().collect())
            .into();

        while let Some(prior) = deps.pop_front() {
            if self.txn_in_valid_batch(&prior) {
                if self.chain_lacks(&prior, &in_chain) {
                    if let Some(ctx) = self.results.get(&prior).and_then(|r| r.context_id()) {
                        in_chain.push(prior.clone());
                        contexts.push(ctx.clone());
                    }
                }
            } else {
                deps.extend(self.sorted_by_arrival_desc(
                    self.graph.predecessors_of(&prior).cloned().collect(),
                ));
            }
        }
        contexts
    }

    /// True when `prior`'s state is not already reachable through the
    /// chain collected so far.
    fn chain_lacks(&self, prior: &TxnId, chain: &[TxnId]) -> bool {
        for member in chain {
            let covered = self.graph.predecessors_of(member).any(|p| p == prior)
                || chain.contains(prior);
            if covered && self.txn_in_valid_batch(member) {
                return false;
            }
        }
        true
    }

    /// Record an invalid outcome for a transaction that will never
    /// execute (or whose in-flight result must be discarded). Returns
    /// false if an outcome already exists.
    fn record_invalid_outcome(&mut self, txn_id: &TxnId) -> bool {
        if self.results.contains_key(txn_id) {
            return false;
        }
        self.results.insert(
            txn_id.clone(),
            TxnResult::new(txn_id.clone(), TxnStatus::Invalid),
        );
        if self.outstanding.remove(txn_id) {
            self.discarded.insert(txn_id.clone());
        } else if let Some(pos) = self.available.iter().position(|id| id == txn_id) {
            self.available.remove(pos);
        }
        true
    }

    /// Invalidation cascade. A batch containing an invalid transaction is
    /// excluded as a whole; every transaction of an excluded batch drags
    /// the batches of its out-of-batch successors with it, transitively.
    fn invalidate_batch_closure(&mut self, batch_id: &BatchId) {
        let mut stack = vec![batch_id.clone()];
        let mut invalidated = 0usize;

        while let Some(bid) = stack.pop() {
            if !self.invalid_batches.insert(bid.clone()) {
                continue;
            }
            let member_ids: Vec<TxnId> = match self.batches_by_id.get(&bid) {
                Some(annotated) => annotated
                    .batch
                    .transactions
                    .iter()
                    .map(|txn| txn.id().clone())
                    .collect(),
                None => continue,
            };
            for id in &member_ids {
                if self.record_invalid_outcome(id) {
                    invalidated += 1;
                }
            }
            for id in &member_ids {
                for succ in self.graph.successors_of(id).to_vec() {
                    if let Some(succ_batch) = self.batch_by_txn.get(&succ) {
                        if *succ_batch != bid && !self.invalid_batches.contains(succ_batch)
                        {
                            stack.push(succ_batch.clone());
                        }
                    }
                }
            }
        }

        if invalidated > 0 {
            tracing::debug!(
                batch = %batch_id,
                cascaded = invalidated,
                "invalidation cascade excluded dependent transactions"
            );
        }
    }

    /// Contexts to squash for a batch boundary: every valid batch's
    /// contexts back to the previous squash boundary, newest first. When
    /// an earlier batch already computed a root, that root replaces the
    /// base (its contexts were released by that squash).
    fn squash_boundary(&self, batch_index: usize) -> (Option<StateRoot>, Vec<ContextId>) {
        let mut contexts = Vec::new();
        for batch_id in self.batch_order[..=batch_index].iter().rev() {
            if let Some(prior) = self
                .computed_results
                .get(batch_id)
                .and_then(|result| result.state_root.clone())
            {
                return (Some(prior), contexts);
            }
            if self.invalid_batches.contains(batch_id) {
                continue;
            }
            let Some(annotated) = self.batches_by_id.get(batch_id) else {
                continue;
            };
            for txn in annotated.batch.transactions.iter().rev() {
                if let Some(ctx) = self.results.get(txn.id()).and_then(|r| r.context_id()) {
                    contexts.push(ctx.clone());
                }
            }
        }
        (None, contexts)
    }

    /// Whether `batch_index` names the last valid batch of the schedule.
    /// `None` while any later batch is still undetermined.
    fn is_last_valid_batch(&self, batch_index: usize) -> Option<bool> {
        for batch_id in &self.batch_order[batch_index + 1..] {
            if self.invalid_batches.contains(batch_id) {
                continue;
            }
            if !self.all_in_batch_have_results(batch_id) {
                return None;
            }
            // A later batch with full results and no invalid member is valid.
            return Some(false);
        }
        Some(true)
    }
}

/// Production scheduler allowing safe concurrent dispatch.
pub struct ParallelScheduler {
    context_manager: Arc<dyn ContextManager>,
    first_root: StateRoot,
    always_persist: bool,
    inner: Mutex<Inner>,
    condvar: Condvar,
}

impl ParallelScheduler {
    /// Create a scheduler executing on top of `first_root`.
    ///
    /// With `always_persist`, batch-boundary squashes commit directly
    /// (block publishing); otherwise a squashed root is only persisted
    /// when it matches the batch's expected root (block validation).
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

    /// Number of transactions currently ready for dispatch
    pub fn available(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .available
            .iter()
            .filter(|&id| !inner.has_unresolved_predecessors(id))
            .count()
    }
}

impl Scheduler for ParallelScheduler {
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

        let preserve =
            required || !inner.batches_by_id.values().any(|b| !b.required);
        let batch_id = batch.id().clone();
        if let Some(root) = expected_root {
            inner.expected_roots.insert(batch_id.clone(), root);
        }

        for txn in &batch.transactions {
            let txn_id = txn.id().clone();
            inner.graph.add_transaction(txn_id.clone());
            inner.batch_by_txn.insert(txn_id.clone(), batch_id.clone());
            inner.transactions.insert(txn_id.clone(), txn.clone());
            inner.available.push(txn_id);
        }

        // First derive this transaction's predecessors from the current
        // index, then register its own claims. Registering inputs before
        // outputs lets a same-address writer overshadow its own reader,
        // keeping the minimal relevant records in the tree.
        for txn in &batch.transactions {
            let txn_id = txn.id().clone();

            let mut predecessors: HashSet<TxnId> = HashSet::new();
            for address in txn.inputs() {
                predecessors.extend(inner.tree.read_predecessors(address));
            }
            for address in txn.outputs() {
                predecessors.extend(inner.tree.write_predecessors(address));
            }
            for pred in predecessors {
                inner.graph.add_relation(&pred, &txn_id);
            }
            for dep in txn.dependencies() {
                if inner.batch_by_txn.contains_key(dep) && dep != &txn_id {
                    let dep = dep.clone();
                    inner.graph.add_relation(&dep, &txn_id);
                }
            }

            for address in txn.inputs() {
                inner.tree.add_reader(address, txn_id.clone());
            }
            for address in txn.outputs() {
                inner.tree.set_writer(address, txn_id.clone());
            }
        }

        inner.batch_order.push(batch_id.clone());
        let index = inner.batch_order.len() - 1;
        inner.batches_by_id.insert(
            batch_id,
            AnnotatedBatch {
                batch,
                index,
                preserve,
                required,
            },
        );
        self.condvar.notify_all();
        Ok(())
    }

    fn next_transaction(&self) -> Option<TxnDispatch> {
        let mut inner = self.inner.lock();
        if inner.abandoned {
            return None;
        }

        let mut chosen = None;
        let mut i = 0;
        while i < inner.available.len() {
            let txn_id = inner.available[i].clone();
            let txn = inner.transactions[&txn_id].clone();

            if inner.dependency_not_processed(&txn)
                || inner.has_unresolved_predecessors(&txn_id)
            {
                i += 1;
                continue;
            }
            if inner.failed_by_dependency(&txn) || !inner.txn_in_valid_batch(&txn_id) {
                // Never dispatched; the cascade records the outcome.
                inner.record_invalid_outcome(&txn_id);
                let batch_id = inner.batch_by_txn[&txn_id].clone();
                inner.invalidate_batch_closure(&batch_id);
                self.condvar.notify_all();
                // The cascade can shrink `available` anywhere; rescan.
                i = 0;
                continue;
            }
            chosen = Some(i);
            break;
        }

        let i = chosen?;
        let txn_id = inner.available.remove(i);
        let base_contexts = inner.initial_contexts_for(&txn_id);
        let dispatch = TxnDispatch {
            txn: inner.transactions[&txn_id].clone(),
            base_root: self.first_root.clone(),
            base_contexts,
        };
        inner.outstanding.insert(txn_id.clone());
        inner.dispatched_ids.insert(txn_id);
        inner.dispatched.push(dispatch.clone());
        Some(dispatch)
    }

    fn set_status(&self, txn_id: &TxnId, status: TxnStatus) -> SchedulerResult<()> {
        let mut inner = self.inner.lock();
        if inner.abandoned {
            return Err(SchedulerError::Abandoned);
        }
        if !inner.dispatched_ids.contains(txn_id) {
            return Err(SchedulerError::UnknownTransaction(txn_id.clone()));
        }
        if inner.discarded.remove(txn_id) {
            // The in-flight result of a cascade-invalidated transaction:
            // accept the report, drop the result, free its context.
            if let TxnStatus::Valid(ctx) = status {
                self.context_manager.release_contexts(&[ctx]);
            }
            self.condvar.notify_all();
            return Ok(());
        }
        if inner.results.contains_key(txn_id) {
            return Err(SchedulerError::DuplicateStatus(txn_id.clone()));
        }
        inner.outstanding.remove(txn_id);
        inner.results.insert(
            txn_id.clone(),
            TxnResult::new(txn_id.clone(), status.clone()),
        );

        if !status.is_valid() {
            let batch_id = inner.batch_by_txn[txn_id].clone();
            inner.invalidate_batch_closure(&batch_id);
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
        let contexts: Vec<ContextId> = inner
            .results
            .values()
            .filter_map(|result| result.context_id().cloned())
            .collect();
        self.context_manager.release_contexts(&contexts);
        inner.abandoned = true;
        tracing::debug!(
            outstanding = inner.outstanding.len(),
            undispatched = inner.available.len(),
            "schedule abandoned"
        );
        self.condvar.notify_all();
    }

    fn is_abandoned(&self) -> bool {
        self.inner.lock().abandoned
    }

    fn batch_ids(&self) -> Vec<BatchId> {
        self.inner.lock().batch_order.clone()
    }

    fn batch_result(&self, batch_id: &BatchId) -> SchedulerResult<Option<BatchResult>> {
        let mut inner = self.inner.lock();
        if let Some(cached) = inner.computed_results.get(batch_id) {
            return Ok(Some(cached.clone()));
        }
        let Some(annotated) = inner.batches_by_id.get(batch_id) else {
            return Ok(None);
        };
        let index = annotated.index;
        if !inner.all_in_batch_have_results(batch_id) {
            return Ok(None);
        }

        if inner.invalid_batches.contains(batch_id) {
            let result = BatchResult {
                is_valid: false,
                state_root: None,
            };
            inner
                .computed_results
                .insert(batch_id.clone(), result.clone());
            return Ok(Some(result));
        }

        let mut state_root = None;
        if let Some(expected) = inner.expected_roots.get(batch_id).cloned() {
            let (base, contexts) = inner.squash_boundary(index);
            let base = base.unwrap_or_else(|| self.first_root.clone());
            let root = self.context_manager.squash(&base, &contexts, false, false)?;
            let verified = root == expected;
            if !verified {
                tracing::warn!(
                    batch = %batch_id,
                    expected = %expected,
                    got = %root,
                    "batch state root mismatch"
                );
            }
            self.context_manager
                .squash(&base, &contexts, verified, true)?;
            state_root = Some(root);
        } else if inner.finalized {
            match inner.is_last_valid_batch(index) {
                None => return Ok(None),
                Some(true) => {
                    let (base, contexts) = inner.squash_boundary(index);
                    let base = base.unwrap_or_else(|| self.first_root.clone());
                    let root = self.context_manager.squash(
                        &base,
                        &contexts,
                        self.always_persist,
                        true,
                    )?;
                    state_root = Some(root);
                }
                Some(false) => {}
            }
        } else {
            // A later batch may still make this one the squash boundary
            // once the schedule is finalized; report without caching.
            return Ok(Some(BatchResult {
                is_valid: true,
                state_root: None,
            }));
        }

        let result = BatchResult {
            is_valid: true,
            state_root,
        };
        inner
            .computed_results
            .insert(batch_id.clone(), result.clone());
        Ok(Some(result))
    }

    fn transaction_results(&self, batch_id: &BatchId) -> Option<Vec<TxnResult>> {
        let inner = self.inner.lock();
        let annotated = inner.batches_by_id.get(batch_id)?;
        Some(
            annotated
                .batch
                .transactions
                .iter()
                .filter_map(|txn| inner.results.get(txn.id()).cloned())
                .collect(),
        )
    }

    fn unschedule_incomplete_batches(&self) {
        let mut inner = self.inner.lock();

        let mut incomplete: HashSet<BatchId> = HashSet::new();
        for txn_id in inner.available.iter().chain(inner.outstanding.iter()) {
            let batch_id = &inner.batch_by_txn[txn_id];
            if !inner.batches_by_id[batch_id].preserve {
                incomplete.insert(batch_id.clone());
            }
        }

        for batch_id in &incomplete {
            let annotated = match inner.batches_by_id.remove(batch_id) {
                Some(annotated) => annotated,
                None => continue,
            };
            for txn in &annotated.batch.transactions {
                let txn_id = txn.id();
                inner.batch_by_txn.remove(txn_id);
                inner.transactions.remove(txn_id);
                inner.results.remove(txn_id);
                inner.outstanding.remove(txn_id);
                inner.discarded.remove(txn_id);
                inner.available.retain(|id| id != txn_id);
            }
            inner.batch_order.retain(|id| id != batch_id);
            inner.expected_roots.remove(batch_id);
        }
        // Reindex the surviving batches; squash boundaries slice batch_order.
        let order = inner.batch_order.clone();
        for (index, batch_id) in order.iter().enumerate() {
            if let Some(annotated) = inner.batches_by_id.get_mut(batch_id) {
                annotated.index = index;
            }
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
        self.inner.lock().batch_by_txn.contains_key(txn_id)
    }

    fn dispatch_count(&self) -> usize {
        self.inner.lock().dispatched.len()
    }

    fn dispatched(&self, index: usize) -> Option<TxnDispatch> {
        self.inner.lock().dispatched.get(index).cloned()
    }
}
