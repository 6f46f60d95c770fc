use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ChainError;

/// Lifecycle stage of a product. Declaration order is the stage ordinal.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Planted,
    Growing,
    Harvested,
    QualityChecked,
    Processed,
    Packaged,
    Shipped,
    InTransit,
    Delivered,
    Sold,
}

impl Stage {
    pub const ALL: [Stage; 10] = [
        Stage::Planted,
        Stage::Growing,
        Stage::Harvested,
        Stage::QualityChecked,
        Stage::Processed,
        Stage::Packaged,
        Stage::Shipped,
        Stage::InTransit,
        Stage::Delivered,
        Stage::Sold,
    ];

    pub const COUNT: usize = Self::ALL.len();

    /// Ordinal in `1..=10`.
    pub fn ordinal(self) -> u8 {
        self as u8 + 1
    }

    pub fn from_ordinal(ordinal: u8) -> Option<Stage> {
        Self::ALL.get(usize::from(ordinal).checked_sub(1)?).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::Planted => "planted",
            Stage::Growing => "growing",
            Stage::Harvested => "harvested",
            Stage::QualityChecked => "quality_checked",
            Stage::Processed => "processed",
            Stage::Packaged => "packaged",
            Stage::Shipped => "shipped",
            Stage::InTransit => "in_transit",
            Stage::Delivered => "delivered",
            Stage::Sold => "sold",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Stage {
    type Err = ChainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|stage| stage.name() == value)
            .ok_or_else(|| ChainError::UnknownStage(value.to_string()))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    Farmer,
    Inspector,
    Processor,
    Transporter,
    Buyer,
    Retailer,
    System,
}

impl ActorRole {
    pub fn name(self) -> &'static str {
        match self {
            ActorRole::Farmer => "farmer",
            ActorRole::Inspector => "inspector",
            ActorRole::Processor => "processor",
            ActorRole::Transporter => "transporter",
            ActorRole::Buyer => "buyer",
            ActorRole::Retailer => "retailer",
            ActorRole::System => "system",
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ActorRole {
    type Err = ChainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "farmer" => Ok(ActorRole::Farmer),
            "inspector" => Ok(ActorRole::Inspector),
            "processor" => Ok(ActorRole::Processor),
            "transporter" => Ok(ActorRole::Transporter),
            "buyer" => Ok(ActorRole::Buyer),
            "retailer" => Ok(ActorRole::Retailer),
            "system" => Ok(ActorRole::System),
            other => Err(ChainError::UnknownActorRole(other.to_string())),
        }
    }
}

/// Caller-supplied stage observation, before the registry stamps it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StageSubmission {
    pub product_id: String,
    pub stage: Stage,
    pub actor_role: ActorRole,
    pub actor_id: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub quality_score: Option<f64>,
    pub note: String,
    pub contract_id: Option<String>,
}

impl StageSubmission {
    pub fn new(
        product_id: impl Into<String>,
        stage: Stage,
        actor_role: ActorRole,
        actor_id: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            stage,
            actor_role,
            actor_id: actor_id.into(),
            location: location.into(),
            temperature: None,
            humidity: None,
            quality_score: None,
            note: String::new(),
            contract_id: None,
        }
    }

    pub fn with_contract(mut self, contract_id: impl Into<String>) -> Self {
        self.contract_id = Some(contract_id.into());
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    pub fn with_conditions(mut self, temperature: Option<f64>, humidity: Option<f64>) -> Self {
        self.temperature = temperature;
        self.humidity = humidity;
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = note.into();
        self
    }

    /// Rejects NaN and infinite sensor readings.
    pub fn validate_readings(&self) -> Result<(), ChainError> {
        for (field, reading) in [
            ("temperature", self.temperature),
            ("humidity", self.humidity),
            ("quality_score", self.quality_score),
        ] {
            if let Some(value) = reading {
                if !value.is_finite() {
                    return Err(ChainError::NonFiniteReading { field, value });
                }
            }
        }
        Ok(())
    }

    pub fn finalize(self, timestamp: u64) -> StageEvent {
        StageEvent {
            product_id: self.product_id,
            stage: self.stage,
            actor_role: self.actor_role,
            actor_id: self.actor_id,
            location: self.location,
            temperature: self.temperature,
            humidity: self.humidity,
            quality_score: self.quality_score,
            note: self.note,
            contract_id: self.contract_id,
            timestamp,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StageEvent {
    pub product_id: String,
    pub stage: Stage,
    pub actor_role: ActorRole,
    pub actor_id: String,
    pub location: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub quality_score: Option<f64>,
    pub note: String,
    pub contract_id: Option<String>,
    pub timestamp: u64,
}

#[derive(Serialize)]
struct ContentPreimage<'a> {
    product_id: &'a str,
    stage: u8,
    actor_id: &'a str,
    location: &'a str,
    timestamp: u64,
    quality_score: Option<f64>,
}

impl StageEvent {
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let preimage = ContentPreimage {
            product_id: &self.product_id,
            stage: self.stage.ordinal(),
            actor_id: &self.actor_id,
            location: &self.location,
            timestamp: self.timestamp,
            quality_score: self.quality_score,
        };
        serde_json::to_vec(&preimage).expect("serializing stage event")
    }

    pub fn content_hash(&self) -> String {
        crate::crypto::sha256_hex(&self.canonical_bytes())
    }
}
