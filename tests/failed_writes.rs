mod support;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use trace_chain::clock::ManualClock;
use trace_chain::contracts::{ContractStatus, ContractTerms, SmartContract};
use trace_chain::errors::{ChainError, ChainResult};
use trace_chain::node::{Node, NodeHandle};
use trace_chain::reputation::ReputationRecord;
use trace_chain::storage::{LedgerBatch, LedgerStore, MemoryStore, ProductRegistration};
use trace_chain::types::{Block, Stage, Transaction};

use support::{stage, test_config, START};

/// Memory store whose batch writes fail while `full` is set.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    full: AtomicBool,
}

impl FlakyStore {
    fn fill(&self) {
        self.full.store(true, Ordering::SeqCst);
    }

    fn drain(&self) {
        self.full.store(false, Ordering::SeqCst);
    }
}

impl LedgerStore for FlakyStore {
    fn store_block(&self, block: &Block) -> ChainResult<()> {
        self.inner.store_block(block)
    }

    fn load_blocks(&self) -> ChainResult<Vec<Block>> {
        self.inner.load_blocks()
    }

    fn store_pending(&self, tx: &Transaction) -> ChainResult<()> {
        self.inner.store_pending(tx)
    }

    fn remove_pending(&self, sequences: &[u64]) -> ChainResult<()> {
        self.inner.remove_pending(sequences)
    }

    fn load_pending(&self) -> ChainResult<Vec<Transaction>> {
        self.inner.load_pending()
    }

    fn store_contract(&self, contract: &SmartContract) -> ChainResult<()> {
        self.inner.store_contract(contract)
    }

    fn load_contracts(&self) -> ChainResult<Vec<SmartContract>> {
        self.inner.load_contracts()
    }

    fn store_reputation(&self, record: &ReputationRecord) -> ChainResult<()> {
        self.inner.store_reputation(record)
    }

    fn load_reputations(&self) -> ChainResult<Vec<ReputationRecord>> {
        self.inner.load_reputations()
    }

    fn store_product(&self, registration: &ProductRegistration) -> ChainResult<()> {
        self.inner.store_product(registration)
    }

    fn load_products(&self) -> ChainResult<Vec<ProductRegistration>> {
        self.inner.load_products()
    }

    fn write_batch(&self, batch: &LedgerBatch) -> ChainResult<()> {
        if self.full.load(Ordering::SeqCst) {
            return Err(ChainError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
        }
        self.inner.write_batch(batch)
    }
}

fn flaky_ledger() -> (Node, NodeHandle, Arc<FlakyStore>, Arc<ManualClock>) {
    let store = Arc::new(FlakyStore::default());
    let clock = Arc::new(ManualClock::new(START));
    let node = Node::with_store(test_config(), store.clone() as Arc<dyn LedgerStore>, clock.clone())
        .expect("open node");
    let handle = node.handle();
    (node, handle, store, clock)
}

fn terms(product: &str, farmer: &str, days: u32) -> ContractTerms {
    ContractTerms::new(product, farmer, "coffee", 300.0, 4_000.0, days)
}

#[test]
fn failed_write_leaves_nothing_behind_and_retry_succeeds() {
    let (_node, handle, store, _) = flaky_ledger();
    let contract = handle
        .create_contract(terms("lot-1", "farmer-1", 30))
        .expect("create contract");

    store.fill();
    let err = handle
        .record_stage(stage("lot-1", Stage::Planted).with_contract(&contract.contract_id))
        .expect_err("write fails");
    assert!(matches!(err, ChainError::Io(_)));

    let stats = handle.network_stats();
    assert_eq!(stats.transaction_count, 0);
    assert_eq!(stats.product_count, 0);
    assert!(store.load_pending().expect("pending").is_empty());
    assert!(store.load_products().expect("products").is_empty());
    let summary = handle.contract_status(&contract.contract_id).expect("status");
    assert_eq!(summary.completion_percentage, 0.0);

    store.drain();
    let receipt = handle
        .record_stage(stage("lot-1", Stage::Planted).with_contract(&contract.contract_id))
        .expect("retry");
    assert_eq!(receipt.transaction.sequence, 1);
    assert_eq!(receipt.contract.expect("update").completion_percentage, 10.0);
    assert_eq!(handle.network_stats().transaction_count, 1);
    assert_eq!(store.load_products().expect("products").len(), 1);
}

#[test]
fn failed_completing_write_keeps_contract_active_until_retried() {
    let (_node, handle, store, clock) = flaky_ledger();
    let contract = handle
        .create_contract(terms("lot-2", "farmer-2", 30))
        .expect("create contract");
    for next in &Stage::ALL[..Stage::COUNT - 1] {
        clock.advance(60);
        handle
            .record_stage(stage("lot-2", *next).with_contract(&contract.contract_id))
            .expect("record stage");
    }

    store.fill();
    handle
        .record_stage(stage("lot-2", Stage::Sold).with_contract(&contract.contract_id))
        .expect_err("write fails");
    let summary = handle.contract_status(&contract.contract_id).expect("status");
    assert_eq!(summary.contract.status, ContractStatus::Active);
    assert_eq!(summary.completion_percentage, 90.0);
    assert_eq!(handle.reputation_of("farmer-2").total_contracts, 0);

    store.drain();
    let receipt = handle
        .record_stage(stage("lot-2", Stage::Sold).with_contract(&contract.contract_id))
        .expect("retry");
    assert_eq!(receipt.transaction.sequence, Stage::COUNT as u64);
    assert_eq!(receipt.contract.expect("update").status, ContractStatus::Completed);

    let record = handle.reputation_of("farmer-2");
    assert_eq!(record.total_contracts, 1);
    assert_eq!(record.completed_contracts, 1);
    assert_eq!(store.load_reputations().expect("reputations"), vec![record]);
    assert_eq!(handle.network_stats().transaction_count, Stage::COUNT);
}

#[test]
fn failed_deadline_settlement_is_retried_on_next_read() {
    let (_node, handle, store, clock) = flaky_ledger();
    let contract = handle
        .create_contract(terms("lot-3", "farmer-3", 1))
        .expect("create contract");
    clock.advance_days(2);

    store.fill();
    assert!(matches!(
        handle.contract_status(&contract.contract_id),
        Err(ChainError::Io(_))
    ));
    assert_eq!(handle.reputation_of("farmer-3").total_contracts, 0);

    store.drain();
    let summary = handle.contract_status(&contract.contract_id).expect("status");
    assert_eq!(summary.contract.status, ContractStatus::Breached);
    assert_eq!(summary.contract.penalties, 1);
    let record = handle.reputation_of("farmer-3");
    assert_eq!(record.breached_contracts, 1);
    assert_eq!(store.load_contracts().expect("contracts")[0].status, ContractStatus::Breached);
}
