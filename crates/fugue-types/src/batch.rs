//! Batch types for Fugue

use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a batch: its opaque, signature-derived id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(String);

impl BatchId {
    /// Create a batch id from a signature string
    pub fn new(sig: impl Into<String>) -> Self {
        Self(sig.into())
    }

    /// Get the raw signature string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BatchId {
    fn from(sig: &str) -> Self {
        Self(sig.to_owned())
    }
}

impl From<String> for BatchId {
    fn from(sig: String) -> Self {
        Self(sig)
    }
}

/// An atomically-applied, ordered group of transactions.
///
/// A batch's effects are committed only if every contained transaction is
/// valid. If any transaction is invalid, the whole batch, and anything
/// depending on it, is excluded.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    /// Signature-derived unique id
    pub header_signature: BatchId,
    /// Transactions in submission order
    pub transactions: Vec<Transaction>,
}

impl Batch {
    /// Create a new batch
    pub fn new(header_signature: impl Into<BatchId>, transactions: Vec<Transaction>) -> Self {
        Self {
            header_signature: header_signature.into(),
            transactions,
        }
    }

    /// The batch's unique id
    pub fn id(&self) -> &BatchId {
        &self.header_signature
    }

    /// Number of transactions in the batch
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    /// Check if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
