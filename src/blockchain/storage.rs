use std::path::Path;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;
use super::transaction::{Payload, StoredTransaction, Transaction};

const BLOCKS_TREE: &str = "blocks";
const TRANSACTIONS_TREE: &str = "transactions";
const METADATA_TREE: &str = "metadata";

const SCHEMA_VERSION: u32 = 1;
const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";
const BLOCK_HEIGHT_KEY: &[u8] = b"block_height";
const NEXT_TRANSACTION_ID_KEY: &[u8] = b"next_transaction_id";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Corrupt {record} record {key}: {reason}")]
    Corrupt {
        record: &'static str,
        key: String,
        reason: String,
    },

    #[error("Block {0} already exists")]
    BlockExists(u64),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: u32, found: u32 },
}

impl From<TransactionError<StorageError>> for StorageError {
    fn from(err: TransactionError<StorageError>) -> Self {
        match err {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => StorageError::DatabaseError(err),
        }
    }
}

/// Stored form of a block; transactions are kept as one JSON blob
#[derive(Debug, Serialize, Deserialize)]
struct BlockRow {
    block_index: u64,
    timestamp: f64,
    transactions: String,
    proof: u64,
    previous_hash: String,
}

/// Stored form of an audit log entry
#[derive(Debug, Serialize, Deserialize)]
struct TransactionRow {
    id: u64,
    sender: String,
    data: String,
    signature: String,
    timestamp: f64,
}

/// Durable storage for the ledger
pub struct LedgerStorage {
    /// The database instance
    db: Db,

    /// Blocks keyed by big-endian block index
    blocks: Tree,

    /// Transaction audit log keyed by big-endian id
    transactions: Tree,

    /// Schema version, block height and id counter
    metadata: Tree,
}

impl std::fmt::Debug for LedgerStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStorage").finish_non_exhaustive()
    }
}

impl LedgerStorage {
    /// Opens (or creates) ledger storage
    ///
    /// # Arguments
    ///
    /// * `path` - The path to the database directory
    ///
    /// # Returns
    ///
    /// A LedgerStorage instance with its schema in place
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Opens storage that is deleted when dropped
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, StorageError> {
        let storage = Self {
            blocks: db.open_tree(BLOCKS_TREE)?,
            transactions: db.open_tree(TRANSACTIONS_TREE)?,
            metadata: db.open_tree(METADATA_TREE)?,
            db,
        };
        storage.ensure_schema()?;
        Ok(storage)
    }

    /// Creates the trees and records the schema version if absent.
    ///
    /// Calling it again on an initialized store changes nothing.
    pub fn ensure_schema(&self) -> Result<(), StorageError> {
        for name in [BLOCKS_TREE, TRANSACTIONS_TREE, METADATA_TREE] {
            self.db.open_tree(name)?;
        }

        let version = encode_u64(SCHEMA_VERSION as u64)?;
        match self
            .metadata
            .compare_and_swap(SCHEMA_VERSION_KEY, None::<&[u8]>, Some(version))?
        {
            Ok(()) => {
                self.flush()?;
                info!("Initialized ledger schema version {}", SCHEMA_VERSION);
                Ok(())
            }
            Err(existing) => {
                let raw = existing.current.ok_or_else(|| {
                    corrupt("metadata", "schema_version", "value vanished during schema check")
                })?;
                let found = decode_u64("metadata", "schema_version", &raw)?;
                if found != SCHEMA_VERSION as u64 {
                    return Err(StorageError::SchemaMismatch {
                        expected: SCHEMA_VERSION,
                        found: found as u32,
                    });
                }
                Ok(())
            }
        }
    }

    /// Durably writes a block keyed by its index
    ///
    /// # Arguments
    ///
    /// * `block` - The block to save
    ///
    /// # Returns
    ///
    /// Ok(()) once the block is flushed, or `BlockExists` if the index is taken
    pub fn append_block(&self, block: &Block) -> Result<(), StorageError> {
        self.insert_block(block)?;
        self.flush()
    }

    /// Commits a block without waiting for it to reach disk.
    ///
    /// Once this returns Ok the block is part of the store, whatever a later
    /// `flush` reports.
    pub(crate) fn insert_block(&self, block: &Block) -> Result<(), StorageError> {
        let key = block.index.to_be_bytes();
        let row = BlockRow {
            block_index: block.index,
            timestamp: block.timestamp,
            transactions: serde_json::to_string(&block.transactions)
                .map_err(|e| StorageError::SerializationError(e.to_string()))?,
            proof: block.proof,
            previous_hash: block.previous_hash.clone(),
        };
        let value = serde_json::to_vec(&row)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;
        let height = encode_u64(block.index)?;

        (&self.blocks, &self.metadata).transaction(|(blocks, metadata)| {
            if blocks.get(&key[..])?.is_some() {
                return Err(ConflictableTransactionError::Abort(StorageError::BlockExists(
                    block.index,
                )));
            }
            blocks.insert(&key[..], value.clone())?;
            metadata.insert(BLOCK_HEIGHT_KEY, height.clone())?;
            Ok(())
        })?;

        debug!("Saved block {} to storage", block.index);
        Ok(())
    }

    /// Durably appends one entry to the transaction audit log
    ///
    /// # Returns
    ///
    /// The id assigned to the entry
    pub fn append_transaction(
        &self,
        sender: &str,
        payload: &Payload,
        signature: &str,
        timestamp: f64,
    ) -> Result<u64, StorageError> {
        let id = self.insert_transaction(sender, payload, signature, timestamp)?;
        self.flush()?;
        Ok(id)
    }

    /// Commits one audit log entry without waiting for it to reach disk
    pub(crate) fn insert_transaction(
        &self,
        sender: &str,
        payload: &Payload,
        signature: &str,
        timestamp: f64,
    ) -> Result<u64, StorageError> {
        let data = serde_json::to_string(payload)
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let id = (&self.transactions, &self.metadata).transaction(|(transactions, metadata)| {
            let id = match metadata.get(NEXT_TRANSACTION_ID_KEY)? {
                Some(raw) => decode_u64("metadata", "next_transaction_id", &raw)
                    .map_err(ConflictableTransactionError::Abort)?,
                None => 1,
            };

            let row = TransactionRow {
                id,
                sender: sender.to_string(),
                data: data.clone(),
                signature: signature.to_string(),
                timestamp,
            };
            let value = serde_json::to_vec(&row).map_err(|e| {
                ConflictableTransactionError::Abort(StorageError::SerializationError(e.to_string()))
            })?;
            let next = encode_u64(id + 1).map_err(ConflictableTransactionError::Abort)?;

            transactions.insert(&id.to_be_bytes()[..], value)?;
            metadata.insert(NEXT_TRANSACTION_ID_KEY, next)?;
            Ok(id)
        })?;

        Ok(id)
    }

    /// Loads every stored block in ascending index order.
    ///
    /// A record that cannot be decoded fails the whole load.
    pub fn load_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();

        for entry in self.blocks.iter() {
            let (key, value) = entry?;
            let block = decode_block(&key, &value)
                .inspect_err(|err| warn!("Failed to load block: {}", err))?;
            blocks.push(block);
        }

        Ok(blocks)
    }

    /// Loads the whole transaction audit log in storage order
    pub fn load_all_transactions(&self) -> Result<Vec<StoredTransaction>, StorageError> {
        let mut transactions = Vec::new();

        for entry in self.transactions.iter() {
            let (key, value) = entry?;
            let stored = decode_transaction(&key, &value)
                .inspect_err(|err| warn!("Failed to load transaction: {}", err))?;
            transactions.push(stored);
        }

        Ok(transactions)
    }

    /// Gets the index of the last stored block, 0 for an empty store
    pub fn block_height(&self) -> Result<u64, StorageError> {
        match self.metadata.get(BLOCK_HEIGHT_KEY)? {
            Some(raw) => decode_u64("metadata", "block_height", &raw),
            None => Ok(0),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

fn corrupt(
    record: &'static str,
    key: impl Into<String>,
    reason: impl Into<String>,
) -> StorageError {
    StorageError::Corrupt {
        record,
        key: key.into(),
        reason: reason.into(),
    }
}

fn encode_u64(value: u64) -> Result<Vec<u8>, StorageError> {
    bincode::serialize(&value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode_u64(record: &'static str, key: &str, raw: &[u8]) -> Result<u64, StorageError> {
    bincode::deserialize(raw).map_err(|e| corrupt(record, key, e.to_string()))
}

fn decode_index(record: &'static str, key: &[u8]) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| corrupt(record, hex::encode(key), "key is not an 8 byte index"))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_block(key: &[u8], value: &[u8]) -> Result<Block, StorageError> {
    let index = decode_index("block", key)?;
    let row: BlockRow = serde_json::from_slice(value)
        .map_err(|e| corrupt("block", index.to_string(), e.to_string()))?;

    if row.block_index != index {
        return Err(corrupt(
            "block",
            index.to_string(),
            format!("row carries block_index {}", row.block_index),
        ));
    }

    let transactions: Vec<Transaction> = serde_json::from_str(&row.transactions)
        .map_err(|e| corrupt("block", index.to_string(), format!("transactions blob: {}", e)))?;

    Ok(Block {
        index: row.block_index,
        timestamp: row.timestamp,
        transactions,
        proof: row.proof,
        previous_hash: row.previous_hash,
    })
}

fn decode_transaction(key: &[u8], value: &[u8]) -> Result<StoredTransaction, StorageError> {
    let id = decode_index("transaction", key)?;
    let row: TransactionRow = serde_json::from_slice(value)
        .map_err(|e| corrupt("transaction", id.to_string(), e.to_string()))?;

    if row.id != id {
        return Err(corrupt(
            "transaction",
            id.to_string(),
            format!("row carries id {}", row.id),
        ));
    }

    let payload: Payload = serde_json::from_str(&row.data)
        .map_err(|e| corrupt("transaction", id.to_string(), format!("data blob: {}", e)))?;

    Ok(StoredTransaction {
        id,
        transaction: Transaction {
            sender: row.sender,
            payload,
            signature: row.signature,
            timestamp: row.timestamp,
        },
    })
}
