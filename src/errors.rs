use std::io;

use thiserror::Error;

use crate::contracts::ContractStatus;
use crate::types::Stage;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("canonical encoding error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(
        "storage schema is outdated (found version {found}, requires {required}); rebuild the data directory"
    )]
    MigrationRequired { found: u32, required: u32 },
    #[error("unknown stage `{0}`")]
    UnknownStage(String),
    #[error("unknown actor role `{0}`")]
    UnknownActorRole(String),
    #[error("{field} reading {value} is not a finite number")]
    NonFiniteReading { field: &'static str, value: f64 },
    #[error("stage {stage} for product {product_id} regresses below recorded stage {highest}")]
    OutOfOrderStage {
        product_id: String,
        stage: Stage,
        highest: Stage,
    },
    #[error("product {0} is not registered")]
    ProductNotFound(String),
    #[error("contract {0} not found")]
    ContractNotFound(String),
    #[error("contract {contract_id} covers product {expected}, not {actual}")]
    ContractProductMismatch {
        contract_id: String,
        expected: String,
        actual: String,
    },
    #[error("invalid contract: {0}")]
    InvalidContract(String),
    #[error("contract {contract_id} is already {status}")]
    ContractTerminal {
        contract_id: String,
        status: ContractStatus,
    },
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),
    #[error("mining exhausted after {attempts} attempts at difficulty {difficulty}")]
    MiningExhausted { attempts: u64, difficulty: u32 },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type ChainResult<T> = Result<T, ChainError>;
