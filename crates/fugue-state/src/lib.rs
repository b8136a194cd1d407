//! # fugue-state
//!
//! State overlay contexts for transaction execution.
//!
//! A [`ContextManager`] materializes the state overlay a transaction
//! executes against: a new context reads through its own writes, then a
//! chain of base contexts, then the committed state at a base root. Squash
//! merges a chain of contexts permanently into a new state root.
//!
//! The scheduler only ever holds opaque [`ContextId`] handles; all overlay
//! mechanics live behind the [`ContextManager`] trait.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod error;

pub use context::{ContextId, ContextManager, InMemoryContextManager, StateRoot};
pub use error::{StateError, StateResult};
