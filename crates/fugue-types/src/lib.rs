//! # fugue-types
//!
//! Core data model for the Fugue transaction scheduler.
//!
//! This crate provides:
//! - [`Transaction`](transaction::Transaction) - A single state-mutating operation
//! - [`Batch`](batch::Batch) - An atomically-applied group of transactions
//! - Identifier newtypes for transactions and batches

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod batch;
pub mod transaction;

// Re-export commonly used types
pub use batch::{Batch, BatchId};
pub use transaction::{Address, Transaction, TransactionHeader, TxnId};
