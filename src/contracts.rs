use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SECONDS_PER_DAY};
use crate::config::ContractPolicy;
use crate::crypto::hash_canonical;
use crate::errors::{ChainError, ChainResult};
use crate::storage::LedgerStore;
use crate::types::{FarmerId, ProductId, Stage, StageEvent};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContractStatus {
    Active,
    Completed,
    Breached,
}

impl ContractStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ContractStatus::Active)
    }

    pub fn name(self) -> &'static str {
        match self {
            ContractStatus::Active => "active",
            ContractStatus::Completed => "completed",
            ContractStatus::Breached => "breached",
        }
    }
}

impl fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Inclusive bounds for an environmental reading.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConditionRange {
    pub min: f64,
    pub max: f64,
}

impl ConditionRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn is_well_formed(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min <= self.max
    }
}

/// Commercial terms supplied when a contract is created.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractTerms {
    pub product_id: ProductId,
    pub farmer_id: FarmerId,
    pub farmer_name: String,
    pub buyer_id: Option<String>,
    pub product_type: String,
    pub quantity: f64,
    pub unit: String,
    pub price: f64,
    pub expected_delivery_days: u32,
    pub temperature_range: Option<ConditionRange>,
    pub humidity_range: Option<ConditionRange>,
}

impl ContractTerms {
    pub fn new(
        product_id: impl Into<ProductId>,
        farmer_id: impl Into<FarmerId>,
        product_type: impl Into<String>,
        quantity: f64,
        price: f64,
        expected_delivery_days: u32,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            farmer_id: farmer_id.into(),
            farmer_name: String::new(),
            buyer_id: None,
            product_type: product_type.into(),
            quantity,
            unit: "kg".to_string(),
            price,
            expected_delivery_days,
            temperature_range: None,
            humidity_range: None,
        }
    }

    pub fn with_farmer_name(mut self, name: impl Into<String>) -> Self {
        self.farmer_name = name.into();
        self
    }

    pub fn with_buyer(mut self, buyer_id: impl Into<String>) -> Self {
        self.buyer_id = Some(buyer_id.into());
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_temperature_range(mut self, min: f64, max: f64) -> Self {
        self.temperature_range = Some(ConditionRange::new(min, max));
        self
    }

    pub fn with_humidity_range(mut self, min: f64, max: f64) -> Self {
        self.humidity_range = Some(ConditionRange::new(min, max));
        self
    }

    fn validate(&self) -> ChainResult<()> {
        if self.product_id.trim().is_empty() {
            return Err(ChainError::InvalidContract("product id is empty".into()));
        }
        if self.farmer_id.trim().is_empty() {
            return Err(ChainError::InvalidContract("farmer id is empty".into()));
        }
        if !(self.quantity.is_finite() && self.quantity > 0.0) {
            return Err(ChainError::InvalidContract(format!(
                "quantity must be positive, got {}",
                self.quantity
            )));
        }
        if !(self.price.is_finite() && self.price >= 0.0) {
            return Err(ChainError::InvalidContract(format!(
                "price must not be negative, got {}",
                self.price
            )));
        }
        if self.expected_delivery_days == 0 {
            return Err(ChainError::InvalidContract(
                "delivery window must be at least one day".into(),
            ));
        }
        for (label, range) in [
            ("temperature", self.temperature_range),
            ("humidity", self.humidity_range),
        ] {
            if let Some(range) = range {
                if !range.is_well_formed() {
                    return Err(ChainError::InvalidContract(format!(
                        "{label} range [{}, {}] is malformed",
                        range.min, range.max
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    QualityBelowMinimum,
    TemperatureOutOfRange,
    HumidityOutOfRange,
    DeadlineMissed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub kind: ViolationKind,
    pub stage: Option<Stage>,
    pub observed: Option<f64>,
    pub detail: String,
    pub timestamp: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SmartContract {
    pub contract_id: String,
    pub product_id: ProductId,
    pub farmer_id: FarmerId,
    pub farmer_name: String,
    pub buyer_id: Option<String>,
    pub product_type: String,
    pub quantity: f64,
    pub unit: String,
    pub price: f64,
    pub created_at: u64,
    pub expected_delivery_days: u32,
    pub deadline: u64,
    pub temperature_range: Option<ConditionRange>,
    pub humidity_range: Option<ConditionRange>,
    pub observed_stages: BTreeSet<Stage>,
    pub penalties: u32,
    pub violations: Vec<Violation>,
    pub status: ContractStatus,
    pub closed_at: Option<u64>,
    pub contract_hash: String,
}

#[derive(Serialize)]
struct ContractPreimage<'a> {
    contract_id: &'a str,
    product_id: &'a str,
    farmer_id: &'a str,
    created_at: u64,
}

impl SmartContract {
    fn from_terms(terms: ContractTerms, created_at: u64) -> ChainResult<Self> {
        let contract_id = format!("SC-{}", Uuid::new_v4().simple());
        let contract_hash = hash_canonical(&ContractPreimage {
            contract_id: &contract_id,
            product_id: &terms.product_id,
            farmer_id: &terms.farmer_id,
            created_at,
        })?;
        let deadline = created_at
            .saturating_add(u64::from(terms.expected_delivery_days).saturating_mul(SECONDS_PER_DAY));
        Ok(Self {
            contract_id,
            product_id: terms.product_id,
            farmer_id: terms.farmer_id,
            farmer_name: terms.farmer_name,
            buyer_id: terms.buyer_id,
            product_type: terms.product_type,
            quantity: terms.quantity,
            unit: terms.unit,
            price: terms.price,
            created_at,
            expected_delivery_days: terms.expected_delivery_days,
            deadline,
            temperature_range: terms.temperature_range,
            humidity_range: terms.humidity_range,
            observed_stages: BTreeSet::new(),
            penalties: 0,
            violations: Vec::new(),
            status: ContractStatus::Active,
            closed_at: None,
            contract_hash,
        })
    }

    /// Every contract requires the full lifecycle.
    pub fn required_stages(&self) -> &'static [Stage] {
        &Stage::ALL
    }

    pub fn completion_percentage(&self) -> f64 {
        self.observed_stages.len() as f64 / Stage::COUNT as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.required_stages()
            .iter()
            .all(|stage| self.observed_stages.contains(stage))
    }

    pub fn is_overdue(&self, now: u64) -> bool {
        self.status == ContractStatus::Active && now > self.deadline && !self.is_complete()
    }

    fn close(&mut self, status: ContractStatus, timestamp: u64) -> ContractTransition {
        self.status = status;
        self.closed_at = Some(timestamp);
        ContractTransition {
            contract_id: self.contract_id.clone(),
            farmer_id: self.farmer_id.clone(),
            status,
            penalties: self.penalties,
            timestamp,
        }
    }

    fn breach_for_deadline(&mut self, now: u64) -> ContractTransition {
        self.penalties = self.penalties.saturating_add(1);
        self.violations.push(Violation {
            kind: ViolationKind::DeadlineMissed,
            stage: None,
            observed: None,
            detail: format!(
                "deadline {} passed with {:.0}% of stages recorded",
                self.deadline,
                self.completion_percentage()
            ),
            timestamp: now,
        });
        self.close(ContractStatus::Breached, now)
    }

    fn condition_violations(&self, event: &StageEvent, policy: &ContractPolicy) -> Vec<Violation> {
        let mut violations = Vec::new();
        let mut push = |kind, observed, detail: String| {
            violations.push(Violation {
                kind,
                stage: Some(event.stage),
                observed: Some(observed),
                detail,
                timestamp: event.timestamp,
            })
        };
        if let Some(score) = event.quality_score {
            if score < policy.min_quality_score {
                push(
                    ViolationKind::QualityBelowMinimum,
                    score,
                    format!("quality {score} below minimum {}", policy.min_quality_score),
                );
            }
        }
        if let (Some(range), Some(temperature)) = (self.temperature_range, event.temperature) {
            if !range.contains(temperature) {
                push(
                    ViolationKind::TemperatureOutOfRange,
                    temperature,
                    format!("temperature {temperature} outside [{}, {}]", range.min, range.max),
                );
            }
        }
        if let (Some(range), Some(humidity)) = (self.humidity_range, event.humidity) {
            if !range.contains(humidity) {
                push(
                    ViolationKind::HumidityOutOfRange,
                    humidity,
                    format!("humidity {humidity} outside [{}, {}]", range.min, range.max),
                );
            }
        }
        violations
    }
}

/// Emitted exactly once when a contract leaves `Active`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractTransition {
    pub contract_id: String,
    pub farmer_id: FarmerId,
    pub status: ContractStatus,
    pub penalties: u32,
    pub timestamp: u64,
}

/// Outcome of evaluating one stage event against its contract.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractUpdate {
    pub contract_id: String,
    pub status: ContractStatus,
    pub completion_percentage: f64,
    pub penalties: u32,
    /// Violations raised by this event only.
    pub violations: Vec<Violation>,
    pub transition: Option<ContractTransition>,
}

impl ContractUpdate {
    fn new(contract: &SmartContract, violations: Vec<Violation>, transition: Option<ContractTransition>) -> Self {
        Self {
            contract_id: contract.contract_id.clone(),
            status: contract.status,
            completion_percentage: contract.completion_percentage(),
            penalties: contract.penalties,
            violations,
            transition,
        }
    }
}

/// Contract state computed for an event or a deadline check, together with
/// the update reported to the caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ContractOutcome {
    pub contract: SmartContract,
    pub update: ContractUpdate,
}

impl ContractOutcome {
    fn new(contract: SmartContract, violations: Vec<Violation>, transition: Option<ContractTransition>) -> Self {
        let update = ContractUpdate::new(&contract, violations, transition);
        Self { contract, update }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Compliance {
    pub conditions_met: bool,
    pub total_penalties: u32,
    pub stages_completed: usize,
    pub total_stages: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContractSummary {
    pub contract: SmartContract,
    pub completion_percentage: f64,
    pub compliance: Compliance,
}

impl From<&SmartContract> for ContractSummary {
    fn from(contract: &SmartContract) -> Self {
        Self {
            completion_percentage: contract.completion_percentage(),
            compliance: Compliance {
                conditions_met: contract.violations.is_empty(),
                total_penalties: contract.penalties,
                stages_completed: contract.observed_stages.len(),
                total_stages: contract.required_stages().len(),
            },
            contract: contract.clone(),
        }
    }
}

pub struct ContractEngine {
    policy: ContractPolicy,
    contracts: RwLock<HashMap<String, SmartContract>>,
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl ContractEngine {
    pub fn new(policy: ContractPolicy, store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            contracts: RwLock::new(HashMap::new()),
            store,
            clock,
        }
    }

    pub fn load(
        policy: ContractPolicy,
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        contracts: Vec<SmartContract>,
    ) -> Self {
        let engine = Self::new(policy, store, clock);
        {
            let mut map = engine.contracts.write();
            for contract in contracts {
                map.insert(contract.contract_id.clone(), contract);
            }
        }
        engine
    }

    pub fn create_contract(&self, terms: ContractTerms) -> ChainResult<SmartContract> {
        terms.validate()?;
        let contract = SmartContract::from_terms(terms, self.clock.now())?;
        self.store.store_contract(&contract)?;
        self.contracts
            .write()
            .insert(contract.contract_id.clone(), contract.clone());
        info!(
            contract = %contract.contract_id,
            product = %contract.product_id,
            farmer = %contract.farmer_id,
            deadline = contract.deadline,
            "contract created"
        );
        Ok(contract)
    }

    /// Evaluates a stage event against the contract it names. Nothing is
    /// stored or installed; see [`ContractEngine::install`].
    ///
    /// Terminal contracts are reported as [`ChainError::ContractTerminal`].
    pub fn evaluate_event(&self, event: &StageEvent) -> ChainResult<ContractOutcome> {
        let contract_id = event
            .contract_id
            .as_deref()
            .ok_or_else(|| ChainError::InvalidContract("stage event carries no contract".into()))?;
        let contracts = self.contracts.read();
        let current = contracts
            .get(contract_id)
            .ok_or_else(|| ChainError::ContractNotFound(contract_id.to_string()))?;
        if current.product_id != event.product_id {
            return Err(ChainError::ContractProductMismatch {
                contract_id: contract_id.to_string(),
                expected: current.product_id.clone(),
                actual: event.product_id.clone(),
            });
        }
        if current.status.is_terminal() {
            return Err(ChainError::ContractTerminal {
                contract_id: contract_id.to_string(),
                status: current.status,
            });
        }

        let mut updated = current.clone();
        drop(contracts);
        let (violations, transition) = if updated.is_overdue(event.timestamp) {
            let transition = updated.breach_for_deadline(event.timestamp);
            let raised: Vec<Violation> = updated.violations.last().cloned().into_iter().collect();
            (raised, Some(transition))
        } else {
            updated.observed_stages.insert(event.stage);
            let raised = updated.condition_violations(event, &self.policy);
            updated.penalties = updated
                .penalties
                .saturating_add(u32::try_from(raised.len()).unwrap_or(u32::MAX));
            updated.violations.extend(raised.iter().cloned());
            let transition = if updated.penalties >= self.policy.breach_penalty_limit {
                Some(updated.close(ContractStatus::Breached, event.timestamp))
            } else if updated.is_complete() {
                Some(updated.close(ContractStatus::Completed, event.timestamp))
            } else {
                None
            };
            (raised, transition)
        };
        Ok(ContractOutcome::new(updated, violations, transition))
    }

    /// Breach outcome for a contract whose deadline passed while incomplete.
    pub fn evaluate_deadline(&self, contract_id: &str) -> ChainResult<Option<ContractOutcome>> {
        let now = self.clock.now();
        let contracts = self.contracts.read();
        let current = contracts
            .get(contract_id)
            .ok_or_else(|| ChainError::ContractNotFound(contract_id.to_string()))?;
        if !current.is_overdue(now) {
            return Ok(None);
        }
        let mut updated = current.clone();
        drop(contracts);
        let transition = updated.breach_for_deadline(now);
        let raised = updated.violations.last().cloned().into_iter().collect();
        Ok(Some(ContractOutcome::new(updated, raised, Some(transition))))
    }

    pub fn evaluate_deadlines_for_product(&self, product_id: &str) -> ChainResult<Vec<ContractOutcome>> {
        let ids = self
            .contracts_for_product(product_id)
            .into_iter()
            .map(|contract| contract.contract_id);
        let mut outcomes = Vec::new();
        for id in ids {
            outcomes.extend(self.evaluate_deadline(&id)?);
        }
        Ok(outcomes)
    }

    /// Installs a persisted outcome in memory.
    pub fn install(&self, outcome: &ContractOutcome) {
        self.contracts
            .write()
            .insert(outcome.contract.contract_id.clone(), outcome.contract.clone());
        let update = &outcome.update;
        if !update.violations.is_empty() {
            warn!(
                contract = %update.contract_id,
                violations = update.violations.len(),
                penalties = update.penalties,
                "contract violations recorded"
            );
        }
        if let Some(transition) = &update.transition {
            info!(
                contract = %transition.contract_id,
                status = %transition.status,
                penalties = transition.penalties,
                "contract closed"
            );
        }
    }

    pub fn summary(&self, contract_id: &str) -> ChainResult<ContractSummary> {
        self.contracts
            .read()
            .get(contract_id)
            .map(ContractSummary::from)
            .ok_or_else(|| ChainError::ContractNotFound(contract_id.to_string()))
    }

    /// Contracts for a product, oldest first.
    pub fn contracts_for_product(&self, product_id: &str) -> Vec<SmartContract> {
        self.collect(|contract| contract.product_id == product_id)
    }

    pub fn contracts_for_farmer(&self, farmer_id: &str) -> Vec<SmartContract> {
        self.collect(|contract| contract.farmer_id == farmer_id)
    }

    fn collect(&self, filter: impl Fn(&SmartContract) -> bool) -> Vec<SmartContract> {
        let mut matched: Vec<SmartContract> = self
            .contracts
            .read()
            .values()
            .filter(|contract| filter(contract))
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.contract_id.cmp(&b.contract_id))
        });
        matched
    }

    pub fn count(&self) -> usize {
        self.contracts.read().len()
    }

    pub fn total_penalties(&self) -> u64 {
        self.contracts
            .read()
            .values()
            .map(|contract| u64::from(contract.penalties))
            .sum()
    }
}
