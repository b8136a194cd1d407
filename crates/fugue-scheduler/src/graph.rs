//! Dependency graph over scheduled transactions
//!
//! Edges are "must-follow" relations derived from conflict-index lookups
//! (and explicit header dependencies): an edge `before -> after` means
//! `before` must have a recorded outcome before `after` is dispatched.

use crate::error::{SchedulerError, SchedulerResult};
use fugue_types::TxnId;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Directed acyclic graph of must-follow relations.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// Edges out of a transaction, toward the transactions that follow it
    forward: HashMap<TxnId, Vec<TxnId>>,
    /// Edges into a transaction, from the transactions it must follow
    backward: HashMap<TxnId, HashSet<TxnId>>,
    /// Original arrival index per transaction
    arrival: HashMap<TxnId, usize>,
    /// Transactions in arrival order
    order: Vec<TxnId>,
}

impl DependencyGraph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transaction at the next arrival index
    pub fn add_transaction(&mut self, txn_id: TxnId) {
        if self.arrival.contains_key(&txn_id) {
            return;
        }
        self.arrival.insert(txn_id.clone(), self.order.len());
        self.forward.entry(txn_id.clone()).or_default();
        self.backward.entry(txn_id.clone()).or_default();
        self.order.push(txn_id);
    }

    /// Add a must-follow relation: `before` needs a recorded outcome
    /// before `after` can be dispatched
    pub fn add_relation(&mut self, before: &TxnId, after: &TxnId) {
        if before == after {
            return;
        }
        if self
            .backward
            .entry(after.clone())
            .or_default()
            .insert(before.clone())
        {
            self.forward
                .entry(before.clone())
                .or_default()
                .push(after.clone());
        }
    }

    /// Transactions that must precede `txn_id`
    pub fn predecessors_of(&self, txn_id: &TxnId) -> impl Iterator<Item = &TxnId> {
        self.backward.get(txn_id).into_iter().flatten()
    }

    /// Transactions that follow `txn_id`
    pub fn successors_of(&self, txn_id: &TxnId) -> &[TxnId] {
        self.forward
            .get(txn_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Arrival index of a registered transaction
    pub fn arrival_index(&self, txn_id: &TxnId) -> Option<usize> {
        self.arrival.get(txn_id).copied()
    }

    /// True when every predecessor of `txn_id` satisfies `has_outcome`
    pub fn is_ready(&self, txn_id: &TxnId, has_outcome: impl Fn(&TxnId) -> bool) -> bool {
        self.predecessors_of(txn_id).all(has_outcome)
    }

    /// Number of registered transactions
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no transactions are registered
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Total number of relations
    pub fn relation_count(&self) -> usize {
        self.backward.values().map(HashSet::len).sum()
    }

    /// Deterministic total order: repeatedly dispatch the zero-in-degree
    /// transaction with the lowest arrival index.
    ///
    /// An append-only index built by a single forward pass cannot produce
    /// a cycle; leftover in-degree here means an internal invariant broke.
    pub fn order(&self) -> SchedulerResult<Vec<TxnId>> {
        let mut in_degree: HashMap<&TxnId, usize> = self
            .order
            .iter()
            .map(|txn| (txn, self.backward.get(txn).map_or(0, HashSet::len)))
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(txn, _)| Reverse(self.arrival[*txn]))
            .collect();

        let mut sorted = Vec::with_capacity(self.order.len());
        while let Some(Reverse(idx)) = ready.pop() {
            let txn = &self.order[idx];
            sorted.push(txn.clone());

            for succ in self.successors_of(txn) {
                if let Some(deg) = in_degree.get_mut(succ) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse(self.arrival[succ]));
                    }
                }
            }
        }

        if sorted.len() != self.order.len() {
            let stuck = self
                .order
                .iter()
                .find(|txn| in_degree.get(txn).copied().unwrap_or(0) > 0)
                .cloned()
                .unwrap_or_else(|| TxnId::new(""));
            return Err(SchedulerError::CyclicDependency(stuck));
        }

        Ok(sorted)
    }
}
