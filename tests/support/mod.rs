#![allow(dead_code)]

use std::sync::Arc;

use trace_chain::clock::ManualClock;
use trace_chain::config::NodeConfig;
use trace_chain::node::{Node, NodeHandle};
use trace_chain::storage::{LedgerStore, MemoryStore};
use trace_chain::types::{ActorRole, Stage, StageSubmission};

pub const START: u64 = 1_700_000_000;

/// Cheap mining and no auto-mining so tests control block boundaries.
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.mining.difficulty = 1;
    config.mining.max_attempts = 500_000;
    config.mining.auto_mine_threshold = 0;
    config
}

pub struct TestLedger {
    pub node: Node,
    pub handle: NodeHandle,
    pub clock: Arc<ManualClock>,
    pub store: Arc<MemoryStore>,
}

pub fn memory_ledger(config: NodeConfig) -> TestLedger {
    let clock = Arc::new(ManualClock::new(START));
    let store = Arc::new(MemoryStore::new());
    let node = Node::with_store(config, store.clone() as Arc<dyn LedgerStore>, clock.clone())
        .expect("open node");
    let handle = node.handle();
    TestLedger {
        node,
        handle,
        clock,
        store,
    }
}

pub fn stage(product: &str, stage: Stage) -> StageSubmission {
    let role = match stage {
        Stage::Planted | Stage::Growing | Stage::Harvested => ActorRole::Farmer,
        Stage::QualityChecked => ActorRole::Inspector,
        Stage::Processed | Stage::Packaged => ActorRole::Processor,
        Stage::Shipped | Stage::InTransit | Stage::Delivered => ActorRole::Transporter,
        Stage::Sold => ActorRole::Retailer,
    };
    StageSubmission::new(product, stage, role, format!("{role}-1"), "Yamoussoukro")
}
