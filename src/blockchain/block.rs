use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use super::hasher;
use super::transaction::{timestamp_to_datetime, unix_timestamp, Transaction};

/// Previous hash carried by the genesis block, which has no predecessor
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Proof stored in the genesis block
pub const GENESIS_PROOF: u64 = 1;

/// Represents a block in the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Block {
    /// 1-based position of the block in the chain
    pub index: u64,

    /// Creation time in seconds since the Unix epoch
    pub timestamp: f64,

    /// Transactions that were pending when the block was mined
    pub transactions: Vec<Transaction>,

    /// Proof of work relative to the previous block's proof
    pub proof: u64,

    /// Hash of the previous block
    pub previous_hash: String,
}

impl Block {
    /// Creates a new block stamped with the current time
    ///
    /// # Arguments
    ///
    /// * `index` - The index of the block in the chain
    /// * `transactions` - The list of transactions to include in the block
    /// * `proof` - The proof of work
    /// * `previous_hash` - The hash of the previous block
    ///
    /// # Returns
    ///
    /// A new Block instance
    pub fn new(
        index: u64,
        transactions: Vec<Transaction>,
        proof: u64,
        previous_hash: String,
    ) -> Self {
        Block {
            index,
            timestamp: unix_timestamp(),
            transactions,
            proof,
            previous_hash,
        }
    }

    /// Creates the first block of a chain
    pub fn genesis() -> Self {
        Block::new(1, Vec::new(), GENESIS_PROOF, GENESIS_PREVIOUS_HASH.to_string())
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 1
    }

    /// Calculates the hash of the block
    ///
    /// # Returns
    ///
    /// The SHA-256 hash of the block as a hexadecimal string
    pub fn calculate_hash(&self) -> String {
        hasher::digest(self)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        timestamp_to_datetime(self.timestamp)
    }

    pub(crate) fn canonical_value(&self) -> Value {
        let mut fields = Map::new();
        fields.insert("index".to_string(), Value::from(self.index));
        fields.insert("timestamp".to_string(), Value::from(self.timestamp));
        fields.insert(
            "transactions".to_string(),
            Value::Array(self.transactions.iter().map(Transaction::canonical_value).collect()),
        );
        fields.insert("proof".to_string(), Value::from(self.proof));
        fields.insert("previous_hash".to_string(), Value::String(self.previous_hash.clone()));
        Value::Object(fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::transaction::Payload;
    use serde_json::json;

    #[test]
    fn test_new_block() {
        let mut payload = Payload::new();
        payload.insert("speed".to_string(), json!(120));
        let transactions = vec![Transaction::new("V7", payload, "beef")];

        let block = Block::new(2, transactions, 100, "previous_hash".to_string());

        assert_eq!(block.index, 2);
        assert_eq!(block.proof, 100);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.transactions.len(), 1);
        assert!(!block.is_genesis());
    }

    #[test]
    fn test_genesis_block() {
        let genesis = Block::genesis();

        assert_eq!(genesis.index, 1);
        assert_eq!(genesis.proof, 1);
        assert_eq!(genesis.previous_hash, "0");
        assert!(genesis.transactions.is_empty());
        assert!(genesis.is_genesis());
    }

    #[test]
    fn test_calculate_hash() {
        let block = Block::new(1, Vec::new(), 100, "previous_hash".to_string());

        let hash = block.calculate_hash();
        assert_eq!(hash.len(), 64); // SHA-256 hash is 64 characters in hex
        assert_eq!(hash, block.clone().calculate_hash());
    }

    #[test]
    fn test_canonical_value_matches_serialized_form() {
        let block = Block::genesis();
        assert_eq!(block.canonical_value(), serde_json::to_value(&block).unwrap());
    }

    #[test]
    fn test_created_at() {
        let block = Block::genesis();
        let created = block.created_at().unwrap();
        assert!((Utc::now() - created).num_seconds().abs() < 5);
    }
}
