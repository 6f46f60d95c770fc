use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::{info, warn};

use crate::chain::{ChainVerdict, HashChain, TransactionVerdict};
use crate::clock::{Clock, SystemClock};
use crate::config::NodeConfig;
use crate::contracts::{
    ContractEngine, ContractOutcome, ContractSummary, ContractTerms, ContractTransition,
    ContractUpdate, SmartContract,
};
use crate::errors::{ChainError, ChainResult};
use crate::registry::StageRegistry;
use crate::reputation::{FarmerStatistics, ReputationRecord, ReputationTracker};
use crate::storage::{LedgerBatch, LedgerStore, ProductRegistration, Storage};
use crate::trace::{AuthenticityResult, NetworkStats, TraceResult, TraceService};
use crate::types::{BlockSummary, StageEvent, StageSubmission, Transaction};

/// What `record_stage` did with a submission.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StageReceipt {
    pub transaction: Transaction,
    pub contract: Option<ContractUpdate>,
    /// Set when the referenced contract was already closed. The event is
    /// still recorded on the ledger.
    pub warning: Option<String>,
    /// Block sealed by auto-mining right after this submission.
    pub block: Option<BlockSummary>,
}

pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    config: NodeConfig,
    chain: Arc<HashChain>,
    registry: Arc<StageRegistry>,
    contracts: Arc<ContractEngine>,
    reputation: ReputationTracker,
    trace: TraceService,
    store: Arc<dyn LedgerStore>,
    /// Held from contract evaluation until the resulting records are
    /// stored and installed.
    commit: Mutex<()>,
    block_interval: Duration,
}

#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Opens (or creates) the RocksDB ledger under `config.data_dir`.
    pub fn open(config: NodeConfig) -> ChainResult<Self> {
        config.validate()?;
        config.ensure_directories()?;
        let storage = Storage::open(&config.db_path())?;
        Self::with_store(config, Arc::new(storage), Arc::new(SystemClock))
    }

    /// Builds the ledger on top of `store`: a fresh genesis when the store
    /// holds no blocks, a verified rebuild otherwise.
    pub fn with_store(
        config: NodeConfig,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
    ) -> ChainResult<Self> {
        config.validate()?;
        let blocks = store.load_blocks()?;
        let chain = if blocks.is_empty() {
            HashChain::new(config.mining.clone(), store.clone(), clock.clone())?
        } else {
            let pending = store.load_pending()?;
            HashChain::restore(
                config.mining.clone(),
                store.clone(),
                clock.clone(),
                blocks,
                pending,
            )?
        };
        let chain = Arc::new(chain);

        let events: Vec<StageEvent> = chain
            .snapshot()
            .transactions()
            .map(|located| located.transaction.event)
            .collect();
        let registry = Arc::new(StageRegistry::replay(
            config.registry.clone(),
            store.clone(),
            clock.clone(),
            store.load_products()?,
            events.iter(),
        ));
        let contracts = Arc::new(ContractEngine::load(
            config.contracts.clone(),
            store.clone(),
            clock,
            store.load_contracts()?,
        ));
        let reputation = ReputationTracker::load(config.reputation.clone(), store.load_reputations()?);
        let trace = TraceService::new(chain.clone(), registry.clone(), contracts.clone());
        info!(
            blocks = chain.block_count(),
            pending = chain.pending_count(),
            products = registry.product_count(),
            contracts = contracts.count(),
            "ledger ready"
        );

        let inner = Arc::new(NodeInner {
            block_interval: Duration::from_millis(config.mining.block_time_ms.max(1)),
            config,
            chain,
            registry,
            contracts,
            reputation,
            trace,
            store,
            commit: Mutex::new(()),
        });
        Ok(Self { inner })
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            inner: self.inner.clone(),
        }
    }

    /// Seals pending transactions on the configured block interval.
    pub async fn start(self) -> ChainResult<()> {
        self.inner.clone().run().await
    }
}

impl NodeHandle {
    pub fn record_stage(&self, submission: StageSubmission) -> ChainResult<StageReceipt> {
        self.inner.record_stage(submission)
    }

    pub fn register_product(&self, product_id: &str) -> ChainResult<ProductRegistration> {
        let lock = self.inner.registry.product_lock(product_id);
        let _guard = lock.lock();
        self.inner.registry.register_product(product_id)
    }

    pub fn create_contract(&self, terms: ContractTerms) -> ChainResult<SmartContract> {
        self.inner.contracts.create_contract(terms)
    }

    pub fn mine_block(&self) -> ChainResult<Option<BlockSummary>> {
        self.inner.chain.mine_block()
    }

    pub fn trace(&self, product_id: &str) -> ChainResult<TraceResult> {
        self.inner.trace(product_id)
    }

    pub fn verify_authenticity(&self, product_id: &str) -> AuthenticityResult {
        self.inner.trace.verify_authenticity(product_id)
    }

    pub fn verify_chain(&self) -> ChainVerdict {
        self.inner.chain.verify_chain()
    }

    /// Verifies blocks `0..=index` only.
    pub fn verify_chain_until(&self, index: u64) -> ChainVerdict {
        self.inner.chain.verify_chain_until(index)
    }

    pub fn verify_transaction(&self, product_id: &str) -> TransactionVerdict {
        self.inner.chain.verify_transaction(product_id)
    }

    pub fn contract_status(&self, contract_id: &str) -> ChainResult<ContractSummary> {
        self.inner.contract_status(contract_id)
    }

    pub fn reputation_of(&self, farmer_id: &str) -> ReputationRecord {
        self.inner.reputation.reputation_of(farmer_id)
    }

    pub fn farmer_statistics(&self, farmer_id: &str) -> FarmerStatistics {
        let contracts = self.inner.contracts.contracts_for_farmer(farmer_id);
        FarmerStatistics::new(self.inner.reputation.reputation_of(farmer_id), &contracts)
    }

    pub fn network_stats(&self) -> NetworkStats {
        self.inner.trace.network_stats()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }
}

impl NodeInner {
    async fn run(self: Arc<Self>) -> ChainResult<()> {
        info!(
            interval_ms = self.block_interval.as_millis() as u64,
            difficulty = self.config.mining.difficulty,
            "starting block producer"
        );
        let mut ticker = time::interval(self.block_interval);
        loop {
            ticker.tick().await;
            if let Err(err) = self.chain.mine_block() {
                warn!(?err, "block production failed");
            }
        }
    }

    /// Records touched by the event are stored in one batch before any of
    /// them becomes visible. A failed write leaves no trace.
    fn record_stage(&self, submission: StageSubmission) -> ChainResult<StageReceipt> {
        let lock = self.registry.product_lock(&submission.product_id);
        let mut receipt = {
            let _guard = lock.lock();
            let prepared = self.registry.prepare(submission)?;
            let _commit = self.commit.lock();

            let (outcome, closed) = if prepared.event.contract_id.is_some() {
                match self.contracts.evaluate_event(&prepared.event) {
                    Ok(outcome) => (Some(outcome), None),
                    Err(err @ ChainError::ContractTerminal { .. }) => (None, Some(err)),
                    Err(err) => return Err(err),
                }
            } else {
                (None, None)
            };
            let registration = prepared
                .needs_registration
                .then(|| self.registry.draft_registration(&prepared.event.product_id));
            let outcomes: Vec<ContractOutcome> = outcome.into_iter().collect();
            let reputations = self.reputation.preview(&transitions(&outcomes));
            let mut batch = LedgerBatch {
                product: registration.clone(),
                pending: None,
                contracts: outcomes.iter().map(|outcome| outcome.contract.clone()).collect(),
                reputations: reputations.clone(),
            };
            let transaction = self.chain.append_transaction_with(prepared.event, |tx| {
                batch.pending = Some(tx.clone());
                self.store.write_batch(&batch)
            })?;

            if let Some(registration) = registration {
                self.registry.install_registration(registration);
            }
            self.registry.commit_event(&transaction.event);
            for outcome in &outcomes {
                self.contracts.install(outcome);
            }
            self.reputation.install(reputations);
            if let Some(err) = &closed {
                warn!(
                    tx = %transaction.tx_id,
                    %err,
                    "stage recorded against a closed contract"
                );
            }
            StageReceipt {
                transaction,
                contract: outcomes.into_iter().next().map(|outcome| outcome.update),
                warning: closed.map(|err| err.to_string()),
                block: None,
            }
        };

        let threshold = self.config.mining.auto_mine_threshold;
        if threshold > 0 && self.chain.pending_count() >= threshold {
            match self.chain.mine_block() {
                Ok(block) => receipt.block = block,
                Err(err) => warn!(?err, "auto-mining failed, transactions stay pending"),
            }
        }
        Ok(receipt)
    }

    /// Stores and installs deadline breaches reported by `evaluate`.
    fn settle<F>(&self, evaluate: F) -> ChainResult<()>
    where
        F: FnOnce() -> ChainResult<Vec<ContractOutcome>>,
    {
        let _commit = self.commit.lock();
        let outcomes = evaluate()?;
        if outcomes.is_empty() {
            return Ok(());
        }
        let reputations = self.reputation.preview(&transitions(&outcomes));
        self.store.write_batch(&LedgerBatch {
            contracts: outcomes.iter().map(|outcome| outcome.contract.clone()).collect(),
            reputations: reputations.clone(),
            ..LedgerBatch::default()
        })?;
        for outcome in &outcomes {
            self.contracts.install(outcome);
        }
        self.reputation.install(reputations);
        Ok(())
    }

    fn contract_status(&self, contract_id: &str) -> ChainResult<ContractSummary> {
        self.settle(|| Ok(self.contracts.evaluate_deadline(contract_id)?.into_iter().collect()))?;
        self.contracts.summary(contract_id)
    }

    fn trace(&self, product_id: &str) -> ChainResult<TraceResult> {
        self.settle(|| self.contracts.evaluate_deadlines_for_product(product_id))?;
        self.trace.trace(product_id)
    }
}

fn transitions(outcomes: &[ContractOutcome]) -> Vec<ContractTransition> {
    outcomes
        .iter()
        .filter_map(|outcome| outcome.update.transition.clone())
        .collect()
}
