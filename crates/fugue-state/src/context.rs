//! Execution contexts and the in-memory context manager

use crate::error::{StateError, StateResult};
use dashmap::DashMap;
use fugue_types::Address;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle naming a state overlay.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ContextId(String);

impl ContextId {
    /// Get the raw context id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hex digest naming a committed state.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateRoot(String);

impl StateRoot {
    /// Create a state root from a hex digest string
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    /// Get the raw hex digest
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StateRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Interface to the state/context collaborator.
///
/// The scheduler derives each transaction's execution context from the
/// contexts of its predecessors through this trait, and squashes the
/// surviving contexts into the canonical state once a schedule completes.
pub trait ContextManager: Send + Sync {
    /// The root of the empty (genesis) state
    fn first_root(&self) -> StateRoot;

    /// Create a context on top of `base_root`, layering `base_contexts`
    /// (highest precedence first). Reads are restricted to `inputs`,
    /// writes to `outputs`.
    fn create_context(
        &self,
        base_root: &StateRoot,
        base_contexts: &[ContextId],
        inputs: &[Address],
        outputs: &[Address],
    ) -> StateResult<ContextId>;

    /// Read an address through the context's overlay chain
    fn get(&self, context_id: &ContextId, address: &Address) -> StateResult<Option<Vec<u8>>>;

    /// Write address/value pairs into the context
    fn set(&self, context_id: &ContextId, writes: Vec<(Address, Vec<u8>)>) -> StateResult<()>;

    /// Merge the writes reachable from `context_ids` (highest precedence
    /// first) onto `base_root` and return the resulting root. `persist`
    /// commits the new root; `clean_up` releases every context visited.
    fn squash(
        &self,
        base_root: &StateRoot,
        context_ids: &[ContextId],
        persist: bool,
        clean_up: bool,
    ) -> StateResult<StateRoot>;

    /// Drop contexts that will never be squashed
    fn release_contexts(&self, context_ids: &[ContextId]);
}

/// A single state overlay: writes on top of a chain of base contexts,
/// anchored to a committed root.
struct ExecutionContext {
    base_root: StateRoot,
    base_contexts: Vec<ContextId>,
    inputs: Vec<Address>,
    outputs: Vec<Address>,
    writes: HashMap<Address, Vec<u8>>,
}

impl ExecutionContext {
    fn may_read(&self, address: &Address) -> bool {
        self.inputs
            .iter()
            .any(|prefix| address.starts_with(prefix.as_str()))
    }

    fn may_write(&self, address: &Address) -> bool {
        self.outputs
            .iter()
            .any(|prefix| address.starts_with(prefix.as_str()))
    }
}

/// In-memory [`ContextManager`].
///
/// Contexts live in a concurrent map so worker threads can read and write
/// their own overlays without contending on a global lock; the committed
/// root table only changes on squash.
pub struct InMemoryContextManager {
    contexts: DashMap<ContextId, ExecutionContext>,
    roots: Mutex<HashMap<StateRoot, BTreeMap<Address, Vec<u8>>>>,
    next_id: AtomicU64,
    first_root: StateRoot,
}

impl InMemoryContextManager {
    /// Create a manager holding only the empty state
    pub fn new() -> Self {
        let empty = BTreeMap::new();
        let first_root = hash_state(&empty);
        let mut roots = HashMap::new();
        roots.insert(first_root.clone(), empty);
        Self {
            contexts: DashMap::new(),
            roots: Mutex::new(roots),
            next_id: AtomicU64::new(1),
            first_root,
        }
    }

    /// Read the full committed state at a root, if known
    pub fn state_at(&self, root: &StateRoot) -> Option<BTreeMap<Address, Vec<u8>>> {
        self.roots.lock().get(root).cloned()
    }

    /// Number of live (unreleased) contexts
    pub fn live_context_count(&self) -> usize {
        self.contexts.len()
    }

    fn fresh_id(&self) -> ContextId {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        ContextId(format!("ctx-{n:016x}"))
    }

    /// Breadth-first walk over a context chain. The earliest-visited write
    /// wins per address, so callers list the highest-precedence context
    /// first. Returns the merged writes and every id visited.
    fn collect_chain_writes(
        &self,
        context_ids: &[ContextId],
    ) -> StateResult<(HashMap<Address, Vec<u8>>, Vec<ContextId>)> {
        let mut merged: HashMap<Address, Vec<u8>> = HashMap::new();
        let mut queue: VecDeque<ContextId> = context_ids.iter().cloned().collect();
        let mut visited: Vec<ContextId> = context_ids.to_vec();

        while let Some(cid) = queue.pop_front() {
            let ctx = self
                .contexts
                .get(&cid)
                .ok_or_else(|| StateError::UnknownContext(cid.clone()))?;
            for (address, value) in &ctx.writes {
                merged
                    .entry(address.clone())
                    .or_insert_with(|| value.clone());
            }
            for base in &ctx.base_contexts {
                if !visited.contains(base) {
                    visited.push(base.clone());
                    queue.push_back(base.clone());
                }
            }
        }

        Ok((merged, visited))
    }
}

impl Default for InMemoryContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextManager for InMemoryContextManager {
    fn first_root(&self) -> StateRoot {
        self.first_root.clone()
    }

    fn create_context(
        &self,
        base_root: &StateRoot,
        base_contexts: &[ContextId],
        inputs: &[Address],
        outputs: &[Address],
    ) -> StateResult<ContextId> {
        if !self.roots.lock().contains_key(base_root) {
            return Err(StateError::UnknownStateRoot(base_root.clone()));
        }
        for cid in base_contexts {
            if !self.contexts.contains_key(cid) {
                return Err(StateError::UnknownContext(cid.clone()));
            }
        }

        let id = self.fresh_id();
        self.contexts.insert(
            id.clone(),
            ExecutionContext {
                base_root: base_root.clone(),
                base_contexts: base_contexts.to_vec(),
                inputs: inputs.to_vec(),
                outputs: outputs.to_vec(),
                writes: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn get(&self, context_id: &ContextId, address: &Address) -> StateResult<Option<Vec<u8>>> {
        let (base_root, base_contexts) = {
            let ctx = self
                .contexts
                .get(context_id)
                .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
            if !ctx.may_read(address) {
                return Err(StateError::NotAuthorized {
                    address: address.clone(),
                    op: "read",
                    context: context_id.clone(),
                });
            }
            if let Some(value) = ctx.writes.get(address) {
                return Ok(Some(value.clone()));
            }
            (ctx.base_root.clone(), ctx.base_contexts.clone())
        };

        // Walk the base chain, nearest context first.
        let mut queue: VecDeque<ContextId> = base_contexts.into_iter().collect();
        let mut visited: Vec<ContextId> = Vec::new();
        while let Some(cid) = queue.pop_front() {
            if visited.contains(&cid) {
                continue;
            }
            visited.push(cid.clone());
            let ctx = self
                .contexts
                .get(&cid)
                .ok_or_else(|| StateError::UnknownContext(cid.clone()))?;
            if let Some(value) = ctx.writes.get(address) {
                return Ok(Some(value.clone()));
            }
            for base in &ctx.base_contexts {
                queue.push_back(base.clone());
            }
        }

        let roots = self.roots.lock();
        Ok(roots
            .get(&base_root)
            .and_then(|state| state.get(address).cloned()))
    }

    fn set(&self, context_id: &ContextId, writes: Vec<(Address, Vec<u8>)>) -> StateResult<()> {
        let mut ctx = self
            .contexts
            .get_mut(context_id)
            .ok_or_else(|| StateError::UnknownContext(context_id.clone()))?;
        for (address, _) in &writes {
            if !ctx.may_write(address) {
                return Err(StateError::NotAuthorized {
                    address: address.clone(),
                    op: "write",
                    context: context_id.clone(),
                });
            }
        }
        for (address, value) in writes {
            ctx.writes.insert(address, value);
        }
        Ok(())
    }

    fn squash(
        &self,
        base_root: &StateRoot,
        context_ids: &[ContextId],
        persist: bool,
        clean_up: bool,
    ) -> StateResult<StateRoot> {
        let (updates, visited) = self.collect_chain_writes(context_ids)?;

        let new_root = {
            let mut roots = self.roots.lock();
            let base = roots
                .get(base_root)
                .ok_or_else(|| StateError::UnknownStateRoot(base_root.clone()))?;

            if updates.is_empty() {
                base_root.clone()
            } else {
                let mut state = base.clone();
                for (address, value) in updates {
                    state.insert(address, value);
                }
                let root = hash_state(&state);
                if persist {
                    roots.insert(root.clone(), state);
                }
                root
            }
        };

        if clean_up {
            tracing::debug!(
                released = visited.len(),
                root = %new_root,
                "squash released context chain"
            );
            self.release_contexts(&visited);
        }

        Ok(new_root)
    }

    fn release_contexts(&self, context_ids: &[ContextId]) {
        for cid in context_ids {
            self.contexts.remove(cid);
        }
    }
}

/// Deterministic digest over the full state: SHA-256 of the sorted
/// address/value entries, length-prefixed so entry boundaries are
/// unambiguous.
fn hash_state(state: &BTreeMap<Address, Vec<u8>>) -> StateRoot {
    let mut hasher = Sha256::new();
    for (address, value) in state {
        hasher.update((address.len() as u64).to_be_bytes());
        hasher.update(address.as_bytes());
        hasher.update((value.len() as u64).to_be_bytes());
        hasher.update(value);
    }
    StateRoot(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.to_string()
    }

    #[test]
    fn test_first_root_is_stable() {
        let cm1 = InMemoryContextManager::new();
        let cm2 = InMemoryContextManager::new();
        assert_eq!(cm1.first_root(), cm2.first_root());
    }

    #[test]
    fn test_set_then_get() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let ctx = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();

        cm.set(&ctx, vec![(addr("aabb"), b"1".to_vec())]).unwrap();
        assert_eq!(cm.get(&ctx, &addr("aabb")).unwrap(), Some(b"1".to_vec()));
        assert_eq!(cm.get(&ctx, &addr("aacc")).unwrap(), None);
    }

    #[test]
    fn test_read_through_base_chain() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();

        let older = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&older, vec![(addr("aa01"), b"old".to_vec())]).unwrap();
        cm.set(&older, vec![(addr("aa02"), b"keep".to_vec())]).unwrap();

        let newer = cm
            .create_context(&root, &[older.clone()], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&newer, vec![(addr("aa01"), b"new".to_vec())]).unwrap();

        let reader = cm
            .create_context(&root, &[newer, older], &[addr("aa")], &[])
            .unwrap();

        // Nearest context in the chain shadows the older write.
        assert_eq!(
            cm.get(&reader, &addr("aa01")).unwrap(),
            Some(b"new".to_vec())
        );
        assert_eq!(
            cm.get(&reader, &addr("aa02")).unwrap(),
            Some(b"keep".to_vec())
        );
    }

    #[test]
    fn test_read_falls_back_to_committed_state() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let writer = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&writer, vec![(addr("aa01"), b"v".to_vec())]).unwrap();
        let committed = cm.squash(&root, &[writer], true, true).unwrap();

        let reader = cm
            .create_context(&committed, &[], &[addr("aa")], &[])
            .unwrap();
        assert_eq!(cm.get(&reader, &addr("aa01")).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_access_outside_declared_sets_is_rejected() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let ctx = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("bb")])
            .unwrap();

        let err = cm.get(&ctx, &addr("bb01")).unwrap_err();
        assert!(matches!(err, StateError::NotAuthorized { op: "read", .. }));

        let err = cm.set(&ctx, vec![(addr("aa01"), vec![1])]).unwrap_err();
        assert!(matches!(err, StateError::NotAuthorized { op: "write", .. }));
    }

    #[test]
    fn test_squash_persists_and_cleans_up() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let ctx = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&ctx, vec![(addr("aa01"), b"v".to_vec())]).unwrap();

        let new_root = cm.squash(&root, &[ctx], true, true).unwrap();
        assert_ne!(new_root, root);
        assert_eq!(cm.live_context_count(), 0);

        let state = cm.state_at(&new_root).unwrap();
        assert_eq!(state.get(&addr("aa01")), Some(&b"v".to_vec()));
    }

    #[test]
    fn test_squash_virtual_does_not_persist() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let ctx = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&ctx, vec![(addr("aa01"), b"v".to_vec())]).unwrap();

        let virtual_root = cm.squash(&root, &[ctx], false, false).unwrap();
        assert!(cm.state_at(&virtual_root).is_none());
    }

    #[test]
    fn test_squash_precedence_is_first_context_wins() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();

        let first = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&first, vec![(addr("aa01"), b"early".to_vec())])
            .unwrap();

        let second = cm
            .create_context(&root, &[first.clone()], &[addr("aa")], &[addr("aa")])
            .unwrap();
        cm.set(&second, vec![(addr("aa01"), b"late".to_vec())])
            .unwrap();

        // Latest context listed first takes precedence.
        let new_root = cm.squash(&root, &[second, first], true, true).unwrap();
        let state = cm.state_at(&new_root).unwrap();
        assert_eq!(state.get(&addr("aa01")), Some(&b"late".to_vec()));
    }

    #[test]
    fn test_squash_empty_chain_returns_base_root() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let out = cm.squash(&root, &[], true, true).unwrap();
        assert_eq!(out, root);
    }

    #[test]
    fn test_release_contexts() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let ctx = cm
            .create_context(&root, &[], &[addr("aa")], &[addr("aa")])
            .unwrap();
        assert_eq!(cm.live_context_count(), 1);

        cm.release_contexts(std::slice::from_ref(&ctx));
        assert_eq!(cm.live_context_count(), 0);
        assert!(matches!(
            cm.get(&ctx, &addr("aa01")),
            Err(StateError::UnknownContext(_))
        ));
    }

    #[test]
    fn test_unknown_base_context_rejected() {
        let cm = InMemoryContextManager::new();
        let root = cm.first_root();
        let bogus = ContextId("ctx-missing".to_string());
        let err = cm
            .create_context(&root, &[bogus], &[addr("aa")], &[])
            .unwrap_err();
        assert!(matches!(err, StateError::UnknownContext(_)));
    }
}
