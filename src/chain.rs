use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::MiningConfig;
use crate::errors::{ChainError, ChainResult};
use crate::storage::LedgerStore;
use crate::types::{Block, BlockSummary, StageEvent, Transaction};

/// Result of walking the chain from genesis.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ChainVerdict {
    Valid { blocks: usize },
    Invalid { index: u64, reason: String },
}

impl ChainVerdict {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChainVerdict::Valid { .. })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransactionVerdict {
    pub product_id: String,
    pub checked: usize,
    /// Sequence of the first transaction whose content hash no longer matches.
    pub mismatch: Option<u64>,
}

impl TransactionVerdict {
    pub fn is_intact(&self) -> bool {
        self.mismatch.is_none()
    }
}

/// A transaction and the block holding it, `None` while still pending.
#[derive(Clone, Debug, PartialEq)]
pub struct LocatedTransaction {
    pub block_index: Option<u64>,
    pub transaction: Transaction,
}

/// Consistent point-in-time copy of committed blocks and the pending pool.
#[derive(Clone, Debug)]
pub struct ChainSnapshot {
    pub blocks: Vec<Arc<Block>>,
    pub pending: Vec<Transaction>,
}

impl ChainSnapshot {
    pub fn verify(&self) -> ChainVerdict {
        verify_blocks(&self.blocks)
    }

    /// Verifies blocks `0..=index`.
    pub fn verify_until(&self, index: u64) -> ChainVerdict {
        verify_blocks(prefix(&self.blocks, index))
    }

    /// Mined transactions in block order followed by pending ones.
    pub fn transactions(&self) -> impl Iterator<Item = LocatedTransaction> + '_ {
        let mined = self.blocks.iter().flat_map(|block| {
            block.transactions.iter().map(move |tx| LocatedTransaction {
                block_index: Some(block.index),
                transaction: tx.clone(),
            })
        });
        let pending = self.pending.iter().map(|tx| LocatedTransaction {
            block_index: None,
            transaction: tx.clone(),
        });
        mined.chain(pending)
    }

    pub fn product_transactions(&self, product_id: &str) -> Vec<LocatedTransaction> {
        self.transactions()
            .filter(|located| located.transaction.product_id() == product_id)
            .collect()
    }

    pub fn transaction_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|block| block.transactions.len())
            .sum::<usize>()
            + self.pending.len()
    }
}

/// Blocks `0..=index`, clamped to the chain length.
fn prefix(blocks: &[Arc<Block>], index: u64) -> &[Arc<Block>] {
    let end = usize::try_from(index)
        .map(|index| index.saturating_add(1))
        .unwrap_or(usize::MAX)
        .min(blocks.len());
    &blocks[..end]
}

fn verify_blocks(blocks: &[Arc<Block>]) -> ChainVerdict {
    let mut previous: Option<&Block> = None;
    for (position, block) in blocks.iter().enumerate() {
        if let Err(err) = block.verify(previous) {
            return ChainVerdict::Invalid {
                index: position as u64,
                reason: err.to_string(),
            };
        }
        previous = Some(block);
    }
    ChainVerdict::Valid {
        blocks: blocks.len(),
    }
}

struct PendingPool {
    next_sequence: u64,
    queue: VecDeque<Transaction>,
}

pub struct HashChain {
    config: MiningConfig,
    blocks: RwLock<Vec<Arc<Block>>>,
    pending: Mutex<PendingPool>,
    mining: Mutex<()>,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl HashChain {
    /// Starts a fresh chain holding only the genesis block.
    pub fn new(
        config: MiningConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> ChainResult<Self> {
        let genesis = Block::genesis();
        store.store_block(&genesis)?;
        info!(hash = %genesis.hash, "initialized genesis block");
        Ok(Self::assemble(config, store, clock, vec![genesis], Vec::new(), 1))
    }

    /// Rebuilds from persisted blocks and pending transactions. A chain that
    /// fails verification is rejected, never repaired.
    pub fn restore(
        config: MiningConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        blocks: Vec<Block>,
        pending: Vec<Transaction>,
    ) -> ChainResult<Self> {
        if blocks.is_empty() {
            return Err(ChainError::IntegrityMismatch(
                "persisted chain has no genesis block".into(),
            ));
        }
        let mut previous: Option<&Block> = None;
        for block in &blocks {
            block.verify(previous)?;
            previous = Some(block);
        }

        let mined: HashSet<u64> = blocks
            .iter()
            .flat_map(|block| block.transactions.iter().map(|tx| tx.sequence))
            .collect();
        let (stale, pending): (Vec<Transaction>, Vec<Transaction>) = pending
            .into_iter()
            .partition(|tx| mined.contains(&tx.sequence));
        if !stale.is_empty() {
            let sequences: Vec<u64> = stale.iter().map(|tx| tx.sequence).collect();
            store.remove_pending(&sequences)?;
            debug!(count = sequences.len(), "dropped pending entries already mined");
        }
        if let Some(tx) = pending.iter().find(|tx| !tx.is_intact()) {
            return Err(ChainError::IntegrityMismatch(format!(
                "pending transaction {} was altered",
                tx.sequence
            )));
        }

        let next_sequence = mined
            .iter()
            .copied()
            .chain(pending.iter().map(|tx| tx.sequence))
            .max()
            .map_or(1, |highest| highest + 1);
        info!(
            height = blocks.len() - 1,
            pending = pending.len(),
            next_sequence,
            "restored chain"
        );
        Ok(Self::assemble(config, store, clock, blocks, pending, next_sequence))
    }

    fn assemble(
        config: MiningConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        blocks: Vec<Block>,
        pending: Vec<Transaction>,
        next_sequence: u64,
    ) -> Self {
        Self {
            config,
            blocks: RwLock::new(blocks.into_iter().map(Arc::new).collect()),
            pending: Mutex::new(PendingPool {
                next_sequence,
                queue: pending.into(),
            }),
            mining: Mutex::new(()),
            store,
            clock,
        }
    }

    /// Wraps the event in a transaction with the next sequence number and
    /// queues it for the next block.
    pub fn append_transaction(&self, event: StageEvent) -> ChainResult<Transaction> {
        self.append_transaction_with(event, |tx| self.store.store_pending(tx))
    }

    /// Like [`HashChain::append_transaction`], but `persist` decides how the
    /// transaction reaches the store. The sequence is consumed and the
    /// transaction queued only once `persist` succeeds.
    pub fn append_transaction_with<F>(&self, event: StageEvent, persist: F) -> ChainResult<Transaction>
    where
        F: FnOnce(&Transaction) -> ChainResult<()>,
    {
        let mut pool = self.pending.lock();
        let tx = Transaction::new(pool.next_sequence, event);
        persist(&tx)?;
        pool.next_sequence += 1;
        pool.queue.push_back(tx.clone());
        Ok(tx)
    }

    /// Seals the current pending pool into a block. Returns `None` when there
    /// is nothing to seal. On failure the pool is left untouched.
    pub fn mine_block(&self) -> ChainResult<Option<BlockSummary>> {
        let _mining = self.mining.lock();
        let batch: Vec<Transaction> = self.pending.lock().queue.iter().cloned().collect();
        if batch.is_empty() && !self.config.mine_empty_blocks {
            return Ok(None);
        }

        let tip = self.tip();
        let timestamp = self.clock.now().max(tip.timestamp);
        let sequences: Vec<u64> = batch.iter().map(|tx| tx.sequence).collect();
        let block = Block::mine(
            tip.index + 1,
            timestamp,
            tip.hash.clone(),
            batch,
            self.config.difficulty,
            self.config.max_attempts,
        )?;
        self.store.store_block(&block)?;
        self.store.remove_pending(&sequences)?;

        let summary = BlockSummary::from(&block);
        {
            // Lock order: blocks, then pending.
            let mut blocks = self.blocks.write();
            let mut pool = self.pending.lock();
            blocks.push(Arc::new(block));
            // Appends only go to the back, so the sealed batch is the prefix.
            pool.queue.drain(..sequences.len());
        }
        info!(
            height = summary.index,
            hash = %summary.hash,
            transactions = summary.transaction_count,
            nonce = summary.nonce,
            "sealed block"
        );
        Ok(Some(summary))
    }

    pub fn snapshot(&self) -> ChainSnapshot {
        let blocks = self.blocks.read();
        let pool = self.pending.lock();
        ChainSnapshot {
            blocks: blocks.clone(),
            pending: pool.queue.iter().cloned().collect(),
        }
    }

    pub fn verify_chain(&self) -> ChainVerdict {
        let blocks = self.blocks.read().clone();
        verify_blocks(&blocks)
    }

    pub fn verify_chain_until(&self, index: u64) -> ChainVerdict {
        let blocks = self.blocks.read().clone();
        verify_blocks(prefix(&blocks, index))
    }

    /// Recomputes the content hash of every transaction for `product_id`,
    /// mined and pending.
    pub fn verify_transaction(&self, product_id: &str) -> TransactionVerdict {
        let located = self.snapshot().product_transactions(product_id);
        TransactionVerdict {
            product_id: product_id.to_string(),
            checked: located.len(),
            mismatch: located
                .iter()
                .find(|entry| !entry.transaction.is_intact())
                .map(|entry| entry.transaction.sequence),
        }
    }

    pub fn tip(&self) -> Arc<Block> {
        let blocks = self.blocks.read();
        // The genesis block is installed at construction.
        blocks[blocks.len() - 1].clone()
    }

    pub fn genesis(&self) -> Arc<Block> {
        self.blocks.read()[0].clone()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().queue.len()
    }
}
