use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use super::hasher::sha256_hex;

/// Default number of leading zero hex digits a proof hash must have
pub const DEFAULT_DIFFICULTY: usize = 4;

/// How many candidates are tried between two looks at the cancel flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Errors that can occur during a proof search
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProofError {
    #[error("Proof search cancelled")]
    Cancelled,
}

/// Shared flag used to abandon a running proof search
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of every search observing this token
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Brute-force proof of work over the previous block's proof.
///
/// A candidate `c` is valid for a previous proof `p` when the SHA-256 hex
/// digest of the decimal string `"{p}{c}"` starts with `difficulty` zeros.
#[derive(Debug, Clone)]
pub struct ProofEngine {
    difficulty: usize,
    target: String,
}

impl Default for ProofEngine {
    fn default() -> Self {
        Self::new(DEFAULT_DIFFICULTY)
    }
}

impl ProofEngine {
    /// Creates a proof engine
    ///
    /// # Arguments
    ///
    /// * `difficulty` - The number of leading zero hex digits required
    pub fn new(difficulty: usize) -> Self {
        ProofEngine {
            difficulty,
            target: "0".repeat(difficulty),
        }
    }

    pub fn difficulty(&self) -> usize {
        self.difficulty
    }

    /// Checks a candidate proof against the previous proof
    pub fn is_valid(&self, previous_proof: u64, candidate: u64) -> bool {
        let guess = format!("{}{}", previous_proof, candidate);
        sha256_hex(guess.as_bytes()).starts_with(&self.target)
    }

    /// Finds the lowest valid proof for `previous_proof`.
    ///
    /// Blocks the calling thread until a proof is found.
    pub fn find_proof(&self, previous_proof: u64) -> u64 {
        let mut candidate = 0;
        while !self.is_valid(previous_proof, candidate) {
            candidate += 1;
        }
        candidate
    }

    /// Same search as [`ProofEngine::find_proof`], abandoned once `cancel` is set
    ///
    /// # Returns
    ///
    /// The lowest valid proof, or `ProofError::Cancelled`
    pub fn find_proof_with_cancel(
        &self,
        previous_proof: u64,
        cancel: &CancelToken,
    ) -> Result<u64, ProofError> {
        let mut candidate = 0;
        loop {
            if candidate % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(ProofError::Cancelled);
            }
            if self.is_valid(previous_proof, candidate) {
                return Ok(candidate);
            }
            candidate += 1;
        }
    }
}
