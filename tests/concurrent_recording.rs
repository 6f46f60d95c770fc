mod support;

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use trace_chain::chain::ChainVerdict;
use trace_chain::errors::ChainError;
use trace_chain::types::Stage;

use support::{memory_ledger, stage, test_config};

#[test]
fn racing_stages_for_one_product_never_regress() {
    for _ in 0..20 {
        let ledger = memory_ledger(test_config());
        let handle = ledger.handle.clone();
        handle.record_stage(stage("lot-9", Stage::Planted)).expect("planted");
        handle.record_stage(stage("lot-9", Stage::Growing)).expect("growing");

        let barrier = Arc::new(Barrier::new(2));
        let workers: Vec<_> = [Stage::Harvested, Stage::QualityChecked]
            .into_iter()
            .map(|next| {
                let handle = handle.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    handle.record_stage(stage("lot-9", next))
                })
            })
            .collect();
        let results: Vec<_> = workers
            .into_iter()
            .map(|worker| worker.join().expect("worker panicked"))
            .collect();

        match (&results[0], &results[1]) {
            (Ok(harvested), Ok(checked)) => {
                assert!(harvested.transaction.sequence < checked.transaction.sequence);
            }
            (Err(ChainError::OutOfOrderStage { .. }), Ok(_)) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}

#[test]
fn parallel_products_get_unique_contiguous_sequences() {
    let ledger = memory_ledger(test_config());
    let threads = 8;
    let per_thread = 10;
    let barrier = Arc::new(Barrier::new(threads));

    let workers: Vec<_> = (0..threads)
        .map(|worker| {
            let handle = ledger.handle.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                let product = format!("lot-{worker}");
                let mut sequences = Vec::new();
                for next in Stage::ALL.into_iter().take(per_thread) {
                    let receipt = handle.record_stage(stage(&product, next)).expect("record");
                    sequences.push(receipt.transaction.sequence);
                    if worker == 0 {
                        handle.mine_block().expect("mine");
                    }
                }
                sequences
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        let sequences = worker.join().expect("worker panicked");
        assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]));
        seen.extend(sequences);
    }
    let total = (threads * per_thread) as u64;
    assert_eq!(seen, (1..=total).collect::<HashSet<u64>>());

    ledger.handle.mine_block().expect("final mine");
    let stats = ledger.handle.network_stats();
    assert_eq!(stats.transaction_count, threads * per_thread);
    assert_eq!(stats.pending_transactions, 0);
    assert!(matches!(ledger.handle.verify_chain(), ChainVerdict::Valid { .. }));
    for worker in 0..threads {
        assert!(ledger.handle.verify_authenticity(&format!("lot-{worker}")).is_authentic);
    }
}
