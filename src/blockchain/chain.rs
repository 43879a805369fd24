use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info, warn};
use thiserror::Error;

use super::block::Block;
use super::hasher;
use super::pow::{CancelToken, ProofEngine, ProofError};
use super::storage::{LedgerStorage, StorageError};
use super::transaction::{Payload, StoredTransaction, Transaction};

/// Errors that can occur during ledger operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Mining cancelled before a proof was found")]
    Cancelled,

    #[error("System error: {0}")]
    SystemError(String),
}

impl From<ProofError> for LedgerError {
    fn from(err: ProofError) -> Self {
        match err {
            ProofError::Cancelled => LedgerError::Cancelled,
        }
    }
}

/// Why a block failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainFault {
    #[error("expected index {expected}, found {found}")]
    IndexMismatch { expected: u64, found: u64 },

    #[error("previous_hash does not match the hash of the previous block")]
    PreviousHashMismatch,

    #[error("proof is not valid for the previous block's proof")]
    InvalidProof,
}

/// The first block of a chain that failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid block {index}: {fault}")]
pub struct ChainValidationError {
    pub index: u64,
    pub fault: ChainFault,
}

/// Validates hash links, proofs and indices of a chain.
///
/// Chains with zero or one block are valid.
pub fn validate_chain(chain: &[Block], engine: &ProofEngine) -> Result<(), ChainValidationError> {
    for pair in chain.windows(2) {
        let (previous, block) = (&pair[0], &pair[1]);

        // No block can follow u64::MAX, so an overflow is always a mismatch
        let expected = previous.index.checked_add(1);
        if expected != Some(block.index) {
            return Err(ChainValidationError {
                index: block.index,
                fault: ChainFault::IndexMismatch {
                    expected: expected.unwrap_or(u64::MAX),
                    found: block.index,
                },
            });
        }

        if block.previous_hash != hasher::digest(previous) {
            return Err(ChainValidationError {
                index: block.index,
                fault: ChainFault::PreviousHashMismatch,
            });
        }

        if !engine.is_valid(previous.proof, block.proof) {
            return Err(ChainValidationError {
                index: block.index,
                fault: ChainFault::InvalidProof,
            });
        }
    }

    Ok(())
}

#[derive(Debug, Default)]
struct LedgerState {
    chain: Vec<Block>,
    pending: Vec<Transaction>,
}

/// Represents the ledger
///
/// Cloning is cheap; clones share the same chain, pending pool and storage.
#[derive(Debug, Clone)]
pub struct Ledger {
    /// The chain of blocks and the transactions waiting for the next block
    state: Arc<Mutex<LedgerState>>,

    /// Held for the whole of a mining run so only one proof search is in flight
    mining: Arc<Mutex<()>>,

    /// Proof of work used for mining and validation
    engine: ProofEngine,

    /// Storage for ledger data
    storage: Arc<LedgerStorage>,
}

impl Ledger {
    /// Loads the ledger from storage with the default proof difficulty
    pub fn initialize(storage: LedgerStorage) -> Result<Self, LedgerError> {
        Self::initialize_with_engine(storage, ProofEngine::default())
    }

    /// Loads the ledger from storage
    ///
    /// # Arguments
    ///
    /// * `storage` - The store the chain is rebuilt from
    /// * `engine` - The proof of work used for mining and validation
    ///
    /// # Returns
    ///
    /// A ledger holding every stored block, or a fresh genesis block if the
    /// store is empty. Fails if the recorded block height disagrees with the
    /// stored blocks.
    pub fn initialize_with_engine(
        storage: LedgerStorage,
        engine: ProofEngine,
    ) -> Result<Self, LedgerError> {
        storage.ensure_schema()?;
        let mut chain = storage.load_blocks()?;

        let height = storage.block_height()?;
        let last_index = chain.last().map_or(0, |block| block.index);
        if height != last_index {
            return Err(StorageError::Corrupt {
                record: "metadata",
                key: "block_height".to_string(),
                reason: format!("records {} but the last stored block is {}", height, last_index),
            }
            .into());
        }

        if chain.is_empty() {
            info!("No existing chain found in storage, creating genesis block");
            let genesis = Block::genesis();
            storage.append_block(&genesis)?;
            chain.push(genesis);
        } else {
            info!("Loaded {} blocks from storage", chain.len());
            if !chain[0].is_genesis() {
                warn!("First stored block has index {}, expected 1", chain[0].index);
            }
            if let Err(err) = validate_chain(&chain, &engine) {
                warn!("Stored chain does not validate: {}", err);
            }
        }

        Ok(Ledger {
            state: Arc::new(Mutex::new(LedgerState {
                chain,
                pending: Vec::new(),
            })),
            mining: Arc::new(Mutex::new(())),
            engine,
            storage: Arc::new(storage),
        })
    }

    /// Adds a new transaction to the pending pool and the audit log.
    ///
    /// The signature is stored as given; checking it is the sender's job.
    ///
    /// # Returns
    ///
    /// The transaction as it was recorded
    pub fn submit_transaction(
        &self,
        sender: &str,
        payload: Payload,
        signature: &str,
    ) -> Result<Transaction, LedgerError> {
        let transaction = Transaction::new(sender, payload, signature);

        let mut state = self.write_state()?;
        let id = self.storage.insert_transaction(
            &transaction.sender,
            &transaction.payload,
            &transaction.signature,
            transaction.timestamp,
        )?;
        // Committed rows are in the audit log, so the pool takes them even if
        // the flush fails
        state.pending.push(transaction.clone());
        self.storage.flush()?;

        debug!(
            "Transaction {} from {} added to pending pool ({} pending)",
            id,
            sender,
            state.pending.len()
        );
        Ok(transaction)
    }

    /// Mines a new block with the pending transactions
    pub fn mine_block(&self) -> Result<Block, LedgerError> {
        self.mine_block_with_cancel(&CancelToken::new())
    }

    /// Mines a new block, giving up if `cancel` is set during the proof search.
    ///
    /// The proof search runs without holding the pending pool, so transactions
    /// submitted meanwhile go into whichever block is assembled after them.
    /// Assembly, persistence, append and clearing the pool happen under one lock.
    ///
    /// # Returns
    ///
    /// The newly mined block, or `LedgerError::Cancelled`
    pub fn mine_block_with_cancel(&self, cancel: &CancelToken) -> Result<Block, LedgerError> {
        let _mining = self
            .mining
            .lock()
            .map_err(|_| LedgerError::SystemError("mining lock poisoned".to_string()))?;

        let last_block = self
            .last_block()
            .ok_or_else(|| LedgerError::SystemError("chain is empty".to_string()))?;

        let next_index = last_block.index.checked_add(1).ok_or_else(|| {
            LedgerError::SystemError(format!("block index {} cannot grow", last_block.index))
        })?;

        let proof = self
            .engine
            .find_proof_with_cancel(last_block.proof, cancel)
            .inspect_err(|_| warn!("Mining of block {} cancelled", next_index))?;
        debug!("Found proof {} for block {}", proof, next_index);

        let previous_hash = hasher::digest(&last_block);

        let mut state = self.write_state()?;
        let block = Block::new(
            state.chain.len() as u64 + 1,
            state.pending.clone(),
            proof,
            previous_hash,
        );

        self.storage.insert_block(&block)?;
        // From here the block is stored; memory must follow before the flush
        // can report anything
        state.chain.push(block.clone());
        state.pending.clear();
        self.storage.flush()?;

        info!(
            "Mined block {} with {} transactions",
            block.index,
            block.transactions.len()
        );
        Ok(block)
    }

    /// Validates any chain with this ledger's proof of work
    pub fn validate_chain(&self, chain: &[Block]) -> Result<(), ChainValidationError> {
        validate_chain(chain, &self.engine)
    }

    pub fn is_chain_valid(&self, chain: &[Block]) -> bool {
        self.validate_chain(chain).is_ok()
    }

    /// Validates a snapshot of the ledger's own chain
    pub fn validate(&self) -> Result<(), ChainValidationError> {
        let chain = self.chain();
        self.validate_chain(&chain)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }

    /// Hash of a block as used in `previous_hash`
    pub fn hash(block: &Block) -> String {
        hasher::digest(block)
    }

    /// Gets a copy of the entire chain
    pub fn chain(&self) -> Vec<Block> {
        self.read_state().chain.clone()
    }

    /// Gets a copy of the transactions waiting for the next block
    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.read_state().pending.clone()
    }

    pub fn last_block(&self) -> Option<Block> {
        self.read_state().chain.last().cloned()
    }

    pub fn len(&self) -> usize {
        self.read_state().chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().chain.is_empty()
    }

    pub fn difficulty(&self) -> usize {
        self.engine.difficulty()
    }

    /// Gets the full transaction audit log from storage
    pub fn transaction_history(&self) -> Result<Vec<StoredTransaction>, LedgerError> {
        Ok(self.storage.load_all_transactions()?)
    }

    pub fn storage(&self) -> &LedgerStorage {
        &self.storage
    }

    // Readers only copy data out, and blocks are pushed whole, so a poisoned
    // lock still holds a consistent chain.
    fn read_state(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> Result<MutexGuard<'_, LedgerState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::SystemError("ledger lock poisoned".to_string()))
    }
}
