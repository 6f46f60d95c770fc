use serde::{Deserialize, Serialize};

use crate::crypto::{ZERO_HASH, canonical_json, meets_difficulty, sha256_hex};
use crate::errors::{ChainError, ChainResult};

use super::Transaction;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub index: u64,
    pub timestamp: u64,
    pub previous_hash: String,
    pub transactions: Vec<Transaction>,
    pub difficulty: u32,
    pub nonce: u64,
    pub hash: String,
}

#[derive(Serialize)]
struct BlockPreimage<'a> {
    index: u64,
    timestamp: u64,
    previous_hash: &'a str,
    transactions: &'a [Transaction],
    difficulty: u32,
    nonce: u64,
}

impl Block {
    /// Fixed first block. It carries no transactions and no proof token, so
    /// every process derives the same hash for it.
    pub fn genesis() -> Self {
        let mut block = Self {
            index: 0,
            timestamp: 0,
            previous_hash: ZERO_HASH.to_string(),
            transactions: Vec::new(),
            difficulty: 0,
            nonce: 0,
            hash: String::new(),
        };
        block.hash = block.compute_hash();
        block
    }

    /// Searches nonces until the hash satisfies `difficulty`, giving up after
    /// `max_attempts`.
    pub fn mine(
        index: u64,
        timestamp: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
        max_attempts: u64,
    ) -> ChainResult<Self> {
        let mut block = Self {
            index,
            timestamp,
            previous_hash,
            transactions,
            difficulty,
            nonce: 0,
            hash: String::new(),
        };
        for nonce in 0..max_attempts {
            block.nonce = nonce;
            let hash = sha256_hex(&block.preimage_bytes()?);
            if meets_difficulty(&hash, difficulty) {
                block.hash = hash;
                return Ok(block);
            }
        }
        Err(ChainError::MiningExhausted {
            attempts: max_attempts,
            difficulty,
        })
    }

    fn preimage_bytes(&self) -> ChainResult<Vec<u8>> {
        canonical_json(&BlockPreimage {
            index: self.index,
            timestamp: self.timestamp,
            previous_hash: &self.previous_hash,
            transactions: &self.transactions,
            difficulty: self.difficulty,
            nonce: self.nonce,
        })
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        self.preimage_bytes().expect("serializing block preimage")
    }

    pub fn compute_hash(&self) -> String {
        sha256_hex(&self.canonical_bytes())
    }

    /// Recomputes everything derivable from the stored fields and checks the
    /// link to `previous`.
    pub fn verify(&self, previous: Option<&Block>) -> ChainResult<()> {
        if self.compute_hash() != self.hash {
            return Err(ChainError::IntegrityMismatch(format!(
                "block {} hash does not match its contents",
                self.index
            )));
        }
        match previous {
            None => {
                if *self != Block::genesis() {
                    return Err(ChainError::IntegrityMismatch(
                        "genesis block differs from the fixed genesis".into(),
                    ));
                }
            }
            Some(prev) => {
                if self.index != prev.index + 1 {
                    return Err(ChainError::IntegrityMismatch(format!(
                        "block {} does not follow block {}",
                        self.index, prev.index
                    )));
                }
                if self.previous_hash != prev.hash {
                    return Err(ChainError::IntegrityMismatch(format!(
                        "block {} does not link to its predecessor",
                        self.index
                    )));
                }
                if !meets_difficulty(&self.hash, self.difficulty) {
                    return Err(ChainError::IntegrityMismatch(format!(
                        "block {} hash misses difficulty {}",
                        self.index, self.difficulty
                    )));
                }
            }
        }
        if let Some(tx) = self.transactions.iter().find(|tx| !tx.is_intact()) {
            return Err(ChainError::IntegrityMismatch(format!(
                "transaction {} in block {} was altered",
                tx.sequence, self.index
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockSummary {
    pub index: u64,
    pub hash: String,
    pub transaction_count: usize,
    pub timestamp: u64,
    pub nonce: u64,
}

impl From<&Block> for BlockSummary {
    fn from(block: &Block) -> Self {
        Self {
            index: block.index,
            hash: block.hash.clone(),
            transaction_count: block.transactions.len(),
            timestamp: block.timestamp,
            nonce: block.nonce,
        }
    }
}
