//! Radix tree over state addresses recording reader and writer claims
//!
//! Each node covers an address prefix and holds the transactions that have
//! claimed read access plus at most one writer. A write claim at a prefix
//! dominates everything nested beneath it: finer-grained records below the
//! prefix stop being independently meaningful, so the subtree is discarded
//! when the writer is set.
//!
//! Nodes live in an arena and refer to their children by index, keyed by
//! the next fixed-size address token.

use fugue_types::{Address, TxnId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Number of address characters consumed per tree level.
const DEFAULT_TOKEN_SIZE: usize = 2;

#[derive(Default)]
struct Node {
    children: HashMap<String, usize>,
    readers: Vec<TxnId>,
    writer: Option<TxnId>,
}

/// Conflict index over the state address space.
pub struct PredecessorTree {
    token_size: usize,
    nodes: Vec<Node>,
}

impl PredecessorTree {
    /// Create a tree with the default token size
    pub fn new() -> Self {
        Self::with_token_size(DEFAULT_TOKEN_SIZE)
    }

    /// Create a tree that consumes `token_size` address characters per level
    pub fn with_token_size(token_size: usize) -> Self {
        assert!(token_size > 0, "token size must be nonzero");
        Self {
            token_size,
            nodes: vec![Node::default()],
        }
    }

    fn tokenize<'a>(&self, address: &'a str) -> Vec<&'a str> {
        let mut tokens = Vec::with_capacity(address.len() / self.token_size + 1);
        let mut i = 0;
        while i < address.len() {
            let end = usize::min(i + self.token_size, address.len());
            tokens.push(&address[i..end]);
            i = end;
        }
        tokens
    }

    /// Index of the node for `address`, creating intermediate nodes.
    fn node_for(&mut self, address: &str) -> usize {
        let tokens: Vec<String> = self.tokenize(address).iter().map(|t| t.to_string()).collect();
        let mut idx = 0;
        for token in tokens {
            idx = match self.nodes[idx].children.get(&token) {
                Some(&child) => child,
                None => {
                    self.nodes.push(Node::default());
                    let child = self.nodes.len() - 1;
                    self.nodes[idx].children.insert(token, child);
                    child
                }
            };
        }
        idx
    }

    /// Record a read claim on `address`
    pub fn add_reader(&mut self, address: &Address, reader: TxnId) {
        let idx = self.node_for(address);
        self.nodes[idx].readers.push(reader);
    }

    /// Record a write claim on `address`.
    ///
    /// The terminal node's readers and entire child subtree are discarded:
    /// everything under the prefix is now transitively ordered after this
    /// writer. Orphaned arena slots are reclaimed when the tree is dropped
    /// with its scheduler.
    pub fn set_writer(&mut self, address: &Address, writer: TxnId) {
        let idx = self.node_for(address);
        let node = &mut self.nodes[idx];
        node.readers.clear();
        node.children.clear();
        node.writer = Some(writer);
    }

    /// Transactions a new read of `address` must be ordered after: the
    /// nearest enclosing writer on the path, plus every writer in the
    /// subtree under the address. Readers never order after other readers.
    pub fn read_predecessors(&self, address: &Address) -> HashSet<TxnId> {
        let mut predecessors = HashSet::new();
        let mut idx = 0;
        let mut enclosing_writer = self.nodes[0].writer.clone();

        for token in self.tokenize(address) {
            match self.nodes[idx].children.get(token) {
                Some(&child) => idx = child,
                None => {
                    // Nothing recorded at or below the address.
                    predecessors.extend(enclosing_writer);
                    return predecessors;
                }
            }
            if let Some(writer) = &self.nodes[idx].writer {
                enclosing_writer = Some(writer.clone());
            }
        }
        predecessors.extend(enclosing_writer);

        self.visit_subtree(idx, &mut |node| {
            predecessors.extend(node.writer.iter().cloned());
        });

        predecessors
    }

    /// Transactions a new write of `address` must be ordered after: every
    /// reader along the path, the nearest enclosing writer, and every
    /// reader and writer in the subtree under the address.
    pub fn write_predecessors(&self, address: &Address) -> HashSet<TxnId> {
        let mut predecessors: HashSet<TxnId> = self.nodes[0].readers.iter().cloned().collect();
        let mut idx = 0;
        let mut enclosing_writer = self.nodes[0].writer.clone();

        for token in self.tokenize(address) {
            match self.nodes[idx].children.get(token) {
                Some(&child) => idx = child,
                None => {
                    predecessors.extend(enclosing_writer);
                    return predecessors;
                }
            }
            predecessors.extend(self.nodes[idx].readers.iter().cloned());
            if let Some(writer) = &self.nodes[idx].writer {
                enclosing_writer = Some(writer.clone());
            }
        }
        predecessors.extend(enclosing_writer);

        self.visit_subtree(idx, &mut |node| {
            predecessors.extend(node.readers.iter().cloned());
            predecessors.extend(node.writer.iter().cloned());
        });

        predecessors
    }

    /// Breadth-first visit of every node strictly below `idx`.
    fn visit_subtree(&self, idx: usize, visit: &mut impl FnMut(&Node)) {
        let mut queue: VecDeque<usize> = self.nodes[idx].children.values().copied().collect();
        while let Some(child) = queue.pop_front() {
            let node = &self.nodes[child];
            visit(node);
            queue.extend(node.children.values().copied());
        }
    }

    fn fmt_node(&self, idx: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let node = &self.nodes[idx];
        let mut map = f.debug_map();
        if !node.readers.is_empty() {
            map.entry(&"readers", &node.readers);
        }
        if let Some(writer) = &node.writer {
            map.entry(&"writer", writer);
        }
        if !node.children.is_empty() {
            let mut children: Vec<(&String, usize)> =
                node.children.iter().map(|(k, &v)| (k, v)).collect();
            children.sort();
            map.entry(
                &"children",
                &ChildList {
                    tree: self,
                    children,
                },
            );
        }
        map.finish()
    }
}

struct ChildList<'a> {
    tree: &'a PredecessorTree,
    children: Vec<(&'a String, usize)>,
}

impl fmt::Debug for ChildList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (token, idx) in &self.children {
            map.entry(token, &NodeRef {
                tree: self.tree,
                idx: *idx,
            });
        }
        map.finish()
    }
}

struct NodeRef<'a> {
    tree: &'a PredecessorTree,
    idx: usize,
}

impl fmt::Debug for NodeRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.tree.fmt_node(self.idx, f)
    }
}

impl fmt::Debug for PredecessorTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(0, f)
    }
}

impl Default for PredecessorTree {
    fn default() -> Self {
        Self::new()
    }
}
