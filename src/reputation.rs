use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::contracts::{ContractStatus, ContractTransition, SmartContract};
use crate::types::FarmerId;

pub const MAX_SCORE: f64 = 100.0;

/// Weights used to evaluate the reputation score. Scores saturate towards
/// 100 with completions and towards 0 with breaches and penalties.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationWeights {
    /// Score of a farmer with no contract history.
    pub base: f64,
    /// Completions needed to cover ~63% of the distance to the maximum.
    pub completion_scale: f64,
    pub breach_weight: f64,
    pub penalty_weight: f64,
    /// Weighted faults needed to cover ~63% of the distance to zero.
    pub fault_scale: f64,
}

impl Default for ReputationWeights {
    fn default() -> Self {
        Self {
            base: 50.0,
            completion_scale: 10.0,
            breach_weight: 2.0,
            penalty_weight: 1.0,
            fault_scale: 10.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ReputationRecord {
    pub farmer_id: FarmerId,
    pub total_contracts: u64,
    pub completed_contracts: u64,
    pub breached_contracts: u64,
    pub cumulative_penalties: u64,
    pub score: f64,
    pub last_updated: u64,
}

impl ReputationRecord {
    pub fn new(farmer_id: impl Into<FarmerId>, weights: &ReputationWeights) -> Self {
        let mut record = Self {
            farmer_id: farmer_id.into(),
            total_contracts: 0,
            completed_contracts: 0,
            breached_contracts: 0,
            cumulative_penalties: 0,
            score: 0.0,
            last_updated: 0,
        };
        record.recompute_score(weights);
        record
    }

    fn saturating_curve(value: f64, scale: f64) -> f64 {
        if scale <= 0.0 {
            return 0.0;
        }
        1.0 - (-value / scale).exp()
    }

    /// Pure function of the counters: more completions never lower the
    /// score, more breaches or penalties never raise it.
    pub fn recompute_score(&mut self, weights: &ReputationWeights) {
        let base = weights.base.clamp(0.0, MAX_SCORE);
        let up = Self::saturating_curve(self.completed_contracts as f64, weights.completion_scale);
        let faults = weights.breach_weight.max(0.0) * self.breached_contracts as f64
            + weights.penalty_weight.max(0.0) * self.cumulative_penalties as f64;
        let down = Self::saturating_curve(faults, weights.fault_scale);
        self.score = (base + (MAX_SCORE - base) * up - base * down).clamp(0.0, MAX_SCORE);
    }

    pub fn apply(&mut self, transition: &ContractTransition, weights: &ReputationWeights) {
        self.total_contracts = self.total_contracts.saturating_add(1);
        match transition.status {
            ContractStatus::Completed => {
                self.completed_contracts = self.completed_contracts.saturating_add(1);
            }
            ContractStatus::Breached => {
                self.breached_contracts = self.breached_contracts.saturating_add(1);
                self.cumulative_penalties = self
                    .cumulative_penalties
                    .saturating_add(u64::from(transition.penalties));
            }
            ContractStatus::Active => {}
        }
        self.last_updated = transition.timestamp;
        self.recompute_score(weights);
    }
}

pub struct ReputationTracker {
    weights: ReputationWeights,
    records: RwLock<HashMap<FarmerId, ReputationRecord>>,
}

impl ReputationTracker {
    pub fn new(weights: ReputationWeights) -> Self {
        Self {
            weights,
            records: RwLock::new(HashMap::new()),
        }
    }

    pub fn load(weights: ReputationWeights, records: Vec<ReputationRecord>) -> Self {
        let tracker = Self::new(weights);
        {
            let mut map = tracker.records.write();
            for record in records {
                map.insert(record.farmer_id.clone(), record);
            }
        }
        tracker
    }

    /// Records that result from folding `transitions` into the current
    /// state, one per affected farmer. Nothing is stored or installed.
    pub fn preview(&self, transitions: &[ContractTransition]) -> Vec<ReputationRecord> {
        let records = self.records.read();
        let mut updated: Vec<ReputationRecord> = Vec::new();
        for transition in transitions {
            let position = match updated
                .iter()
                .position(|record| record.farmer_id == transition.farmer_id)
            {
                Some(position) => position,
                None => {
                    updated.push(records.get(&transition.farmer_id).cloned().unwrap_or_else(|| {
                        ReputationRecord::new(transition.farmer_id.clone(), &self.weights)
                    }));
                    updated.len() - 1
                }
            };
            updated[position].apply(transition, &self.weights);
        }
        updated
    }

    /// Installs persisted records in memory.
    pub fn install(&self, updated: Vec<ReputationRecord>) {
        let mut records = self.records.write();
        for record in updated {
            info!(
                farmer = %record.farmer_id,
                contracts = record.total_contracts,
                score = record.score,
                "reputation updated"
            );
            records.insert(record.farmer_id.clone(), record);
        }
    }

    pub fn reputation_of(&self, farmer_id: &str) -> ReputationRecord {
        self.records
            .read()
            .get(farmer_id)
            .cloned()
            .unwrap_or_else(|| ReputationRecord::new(farmer_id, &self.weights))
    }
}

/// Reputation plus figures derived from the farmer's contracts.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FarmerStatistics {
    pub reputation: ReputationRecord,
    pub contracts: usize,
    pub active_contracts: usize,
    pub total_quantity: f64,
    pub total_penalties: u64,
    pub average_penalty: f64,
}

impl FarmerStatistics {
    pub fn new(reputation: ReputationRecord, contracts: &[SmartContract]) -> Self {
        let active_contracts = contracts
            .iter()
            .filter(|contract| contract.status == ContractStatus::Active)
            .count();
        let total_quantity = contracts.iter().map(|contract| contract.quantity).sum();
        let total_penalties: u64 = contracts
            .iter()
            .map(|contract| u64::from(contract.penalties))
            .sum();
        let average_penalty = if contracts.is_empty() {
            0.0
        } else {
            total_penalties as f64 / contracts.len() as f64
        };
        Self {
            reputation,
            contracts: contracts.len(),
            active_contracts,
            total_quantity,
            total_penalties,
            average_penalty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition(farmer: &str, status: ContractStatus, penalties: u32) -> ContractTransition {
        ContractTransition {
            contract_id: format!("SC-{farmer}-{penalties}"),
            farmer_id: farmer.to_string(),
            status,
            penalties,
            timestamp: 10,
        }
    }

    #[test]
    fn unknown_farmer_gets_neutral_record() {
        let tracker = ReputationTracker::new(ReputationWeights::default());
        let record = tracker.reputation_of("nobody");
        assert_eq!(record.total_contracts, 0);
        assert_eq!(record.score, 50.0);
    }

    #[test]
    fn completions_raise_and_breaches_lower_the_score() {
        let tracker = ReputationTracker::new(ReputationWeights::default());
        let baseline = tracker.reputation_of("f-1").score;

        let completed = tracker.preview(&[transition("f-1", ContractStatus::Completed, 0)]);
        assert_eq!(tracker.reputation_of("f-1").score, baseline);
        tracker.install(completed);
        let completed = tracker.reputation_of("f-1");
        assert!(completed.score > baseline);
        assert_eq!(completed.completed_contracts, 1);

        tracker.install(tracker.preview(&[transition("f-1", ContractStatus::Breached, 3)]));
        let breached = tracker.reputation_of("f-1");
        assert!(breached.score < completed.score);
        assert_eq!(breached.total_contracts, 2);
        assert_eq!(breached.cumulative_penalties, 3);
    }

    #[test]
    fn preview_folds_transitions_per_farmer() {
        let tracker = ReputationTracker::new(ReputationWeights::default());
        let records = tracker.preview(&[
            transition("f-1", ContractStatus::Completed, 0),
            transition("f-2", ContractStatus::Breached, 2),
            transition("f-1", ContractStatus::Breached, 1),
        ]);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].farmer_id, "f-1");
        assert_eq!(records[0].total_contracts, 2);
        assert_eq!(records[0].cumulative_penalties, 1);
        assert_eq!(records[1].breached_contracts, 1);
        assert!(tracker.preview(&[]).is_empty());
    }

    #[test]
    fn score_stays_within_bounds() {
        let weights = ReputationWeights::default();
        let mut record = ReputationRecord::new("f-9", &weights);
        for _ in 0..500 {
            record.apply(&transition("f-9", ContractStatus::Completed, 0), &weights);
        }
        assert!(record.score <= MAX_SCORE);
        for _ in 0..500 {
            record.apply(&transition("f-9", ContractStatus::Breached, 5), &weights);
        }
        assert!(record.score >= 0.0);
    }

    #[test]
    fn score_is_monotonic_in_each_counter() {
        let weights = ReputationWeights::default();
        let mut previous = ReputationRecord::new("f-2", &weights);
        for completed in 1..50 {
            let mut next = previous.clone();
            next.completed_contracts = completed;
            next.recompute_score(&weights);
            assert!(next.score >= previous.score);
            previous = next;
        }
        for penalties in 1..50 {
            let mut next = previous.clone();
            next.cumulative_penalties = penalties;
            next.recompute_score(&weights);
            assert!(next.score <= previous.score);
            previous = next;
        }
    }
}
