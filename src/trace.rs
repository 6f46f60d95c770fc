use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::chain::{ChainSnapshot, ChainVerdict, HashChain, LocatedTransaction};
use crate::contracts::{ContractEngine, ContractSummary};
use crate::errors::{ChainError, ChainResult};
use crate::registry::StageRegistry;
use crate::types::{Stage, StageEvent};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TimelineEntry {
    pub sequence: u64,
    pub tx_id: String,
    /// `None` while the transaction waits in the pending pool.
    pub block_index: Option<u64>,
    pub content_hash: String,
    pub event: StageEvent,
}

impl From<LocatedTransaction> for TimelineEntry {
    fn from(located: LocatedTransaction) -> Self {
        let tx = located.transaction;
        Self {
            sequence: tx.sequence,
            tx_id: tx.tx_id,
            block_index: located.block_index,
            content_hash: tx.content_hash,
            event: tx.event,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthenticityResult {
    pub product_id: String,
    pub is_authentic: bool,
    pub reason: Option<String>,
    pub transaction_count: usize,
    pub blocks_touched: Vec<u64>,
    pub pending_transactions: usize,
    pub stages: Vec<Stage>,
    pub first_recorded: Option<u64>,
    pub last_recorded: Option<u64>,
    /// Verdict over the chain prefix ending at the last block holding one of
    /// the product's transactions.
    pub chain: ChainVerdict,
    pub tampered_sequence: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TraceResult {
    pub product_id: String,
    pub timeline: Vec<TimelineEntry>,
    pub contracts: Vec<ContractSummary>,
    pub authenticity: AuthenticityResult,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkStats {
    pub block_count: usize,
    pub transaction_count: usize,
    pub pending_transactions: usize,
    pub contract_count: usize,
    pub product_count: usize,
    pub total_penalties: u64,
    pub genesis_hash: String,
    pub tip_hash: String,
    pub last_block_timestamp: u64,
}

/// Read-only views composed from the chain, registry and contracts.
pub struct TraceService {
    chain: Arc<HashChain>,
    registry: Arc<StageRegistry>,
    contracts: Arc<ContractEngine>,
}

impl TraceService {
    pub fn new(
        chain: Arc<HashChain>,
        registry: Arc<StageRegistry>,
        contracts: Arc<ContractEngine>,
    ) -> Self {
        Self {
            chain,
            registry,
            contracts,
        }
    }

    /// Full history of a product. Deadlines are expected to have been
    /// enforced by the caller so contract summaries are current.
    pub fn trace(&self, product_id: &str) -> ChainResult<TraceResult> {
        if !self.registry.is_registered(product_id) {
            return Err(ChainError::ProductNotFound(product_id.to_string()));
        }
        let snapshot = self.chain.snapshot();
        let located = snapshot.product_transactions(product_id);
        let authenticity = authenticity(&snapshot, product_id, &located, true);

        let mut timeline: Vec<TimelineEntry> = located.into_iter().map(TimelineEntry::from).collect();
        // Stable: ties on stage and timestamp keep recording order.
        timeline.sort_by_key(|entry| (entry.event.stage, entry.event.timestamp));

        let contracts = self
            .contracts
            .contracts_for_product(product_id)
            .iter()
            .map(ContractSummary::from)
            .collect();
        Ok(TraceResult {
            product_id: product_id.to_string(),
            timeline,
            contracts,
            authenticity,
        })
    }

    pub fn verify_authenticity(&self, product_id: &str) -> AuthenticityResult {
        let registered = self.registry.is_registered(product_id);
        let snapshot = self.chain.snapshot();
        let located = snapshot.product_transactions(product_id);
        authenticity(&snapshot, product_id, &located, registered)
    }

    pub fn network_stats(&self) -> NetworkStats {
        let snapshot = self.chain.snapshot();
        let genesis = snapshot.blocks.first();
        let tip = snapshot.blocks.last();
        NetworkStats {
            block_count: snapshot.blocks.len(),
            transaction_count: snapshot.transaction_count(),
            pending_transactions: snapshot.pending.len(),
            contract_count: self.contracts.count(),
            product_count: self.registry.product_count(),
            total_penalties: self.contracts.total_penalties(),
            genesis_hash: genesis.map(|block| block.hash.clone()).unwrap_or_default(),
            tip_hash: tip.map(|block| block.hash.clone()).unwrap_or_default(),
            last_block_timestamp: tip.map_or(0, |block| block.timestamp),
        }
    }
}

fn authenticity(
    snapshot: &ChainSnapshot,
    product_id: &str,
    located: &[LocatedTransaction],
    registered: bool,
) -> AuthenticityResult {
    let mut blocks_touched: Vec<u64> = located.iter().filter_map(|entry| entry.block_index).collect();
    blocks_touched.dedup();
    let chain = snapshot.verify_until(blocks_touched.last().copied().unwrap_or(0));
    let tampered_sequence = located
        .iter()
        .find(|entry| !entry.transaction.is_intact())
        .map(|entry| entry.transaction.sequence);

    let mut stages: Vec<Stage> = located.iter().map(|entry| entry.transaction.event.stage).collect();
    stages.sort();
    stages.dedup();
    let timestamps = located.iter().map(|entry| entry.transaction.event.timestamp);

    let reason = if !registered {
        Some("product is not registered".to_string())
    } else if located.is_empty() {
        Some("no stage events recorded".to_string())
    } else if let Some(sequence) = tampered_sequence {
        Some(format!("transaction {sequence} does not match its content hash"))
    } else if let ChainVerdict::Invalid { index, reason } = &chain {
        Some(format!("chain broken at block {index}: {reason}"))
    } else {
        None
    };

    AuthenticityResult {
        product_id: product_id.to_string(),
        is_authentic: reason.is_none(),
        reason,
        transaction_count: located.len(),
        pending_transactions: located.iter().filter(|entry| entry.block_index.is_none()).count(),
        blocks_touched,
        stages,
        first_recorded: timestamps.clone().min(),
        last_recorded: timestamps.max(),
        chain,
        tampered_sequence,
    }
}
