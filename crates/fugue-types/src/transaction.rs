//! Transaction types for Fugue

use serde::{Deserialize, Serialize};
use std::fmt;

/// A key into the global state namespace.
///
/// Addresses are hex-radix strings; conflict granularity between
/// transactions is by address prefix, not full equality.
pub type Address = String;

/// Identifier of a transaction: its opaque, signature-derived id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxnId(String);

impl TxnId {
    /// Create a transaction id from a signature string
    pub fn new(sig: impl Into<String>) -> Self {
        Self(sig.into())
    }

    /// Get the raw signature string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TxnId {
    fn from(sig: &str) -> Self {
        Self(sig.to_owned())
    }
}

impl From<String> for TxnId {
    fn from(sig: String) -> Self {
        Self(sig)
    }
}

/// Declared metadata for a transaction
///
/// The header carries everything the scheduler needs to order a
/// transaction: the state addresses it may read (`inputs`), the addresses
/// it may write (`outputs`), and any explicit prior-transaction
/// dependencies. Signature and well-formedness checks happen upstream,
/// before a header reaches the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    /// Public key of the transaction signer
    pub signer: String,
    /// Transaction family name
    pub family_name: String,
    /// Transaction family version
    pub family_version: String,
    /// Addresses this transaction may read
    pub inputs: Vec<Address>,
    /// Addresses this transaction may write
    pub outputs: Vec<Address>,
    /// Ids of transactions that must have committed before this one
    pub dependencies: Vec<TxnId>,
    /// Hex digest of the payload
    pub payload_sha512: String,
}

/// A single state-mutating operation with declared input/output sets.
///
/// Immutable once submitted to a scheduler.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Signature-derived unique id
    pub header_signature: TxnId,
    /// Declared metadata
    pub header: TransactionHeader,
    /// Opaque payload, interpreted by externally executed transaction logic
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Create a new transaction
    pub fn new(
        header_signature: impl Into<TxnId>,
        header: TransactionHeader,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            header_signature: header_signature.into(),
            header,
            payload,
        }
    }

    /// The transaction's unique id
    pub fn id(&self) -> &TxnId {
        &self.header_signature
    }

    /// Declared input addresses
    pub fn inputs(&self) -> &[Address] {
        &self.header.inputs
    }

    /// Declared output addresses
    pub fn outputs(&self) -> &[Address] {
        &self.header.outputs
    }

    /// Explicit prior-transaction dependencies
    pub fn dependencies(&self) -> &[TxnId] {
        &self.header.dependencies
    }
}
