//! Error types for state context operations

use crate::context::{ContextId, StateRoot};
use fugue_types::Address;
use thiserror::Error;

/// State context errors
#[derive(Debug, Error)]
pub enum StateError {
    /// Referenced context id is not held by the manager
    #[error("unknown context: {0}")]
    UnknownContext(ContextId),

    /// Referenced state root has not been committed
    #[error("unknown state root: {0}")]
    UnknownStateRoot(StateRoot),

    /// Address access outside the context's declared input/output sets
    #[error("address {address} not authorized for {op} in context {context}")]
    NotAuthorized {
        /// The address that was accessed
        address: Address,
        /// The offending operation, "read" or "write"
        op: &'static str,
        /// The context the access ran against
        context: ContextId,
    },
}

/// Result type for state context operations
pub type StateResult<T> = Result<T, StateError>;
