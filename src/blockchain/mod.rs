// Blockchain module
//
// This module contains the ledger core:
// - Block and transaction structures
// - Canonical block hashing
// - Proof of work
// - The ledger itself (chain + pending pool)
// - Persistent storage
// - Node keys used to sign transactions before submission

pub mod block;
pub mod chain;
pub mod crypto;
pub mod hasher;
pub mod pow;
pub mod storage;
pub mod transaction;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{ChainFault, ChainValidationError, Ledger, LedgerError};
pub use crypto::VehicleNode;
pub use pow::{CancelToken, ProofEngine};
pub use storage::{LedgerStorage, StorageError};
pub use transaction::{Payload, StoredTransaction, Transaction};
