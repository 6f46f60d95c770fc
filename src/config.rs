use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{ChainError, ChainResult};
use crate::reputation::ReputationWeights;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub mining: MiningConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub contracts: ContractPolicy,
    #[serde(default)]
    pub reputation: ReputationWeights,
}

impl NodeConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("db")
    }

    pub fn validate(&self) -> ChainResult<()> {
        if self.mining.difficulty > 64 {
            return Err(ChainError::Config(
                "mining difficulty cannot exceed the 64 hex digits of a hash".into(),
            ));
        }
        if self.mining.max_attempts == 0 {
            return Err(ChainError::Config("mining max_attempts must be positive".into()));
        }
        if self.contracts.breach_penalty_limit == 0 {
            return Err(ChainError::Config(
                "breach_penalty_limit must be positive".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            mining: MiningConfig::default(),
            registry: RegistryConfig::default(),
            contracts: ContractPolicy::default(),
            reputation: ReputationWeights::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Required number of leading zero hex digits in a block hash.
    #[serde(default = "default_difficulty")]
    pub difficulty: u32,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u64,
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    /// Pending pool size that triggers mining on record; 0 disables.
    #[serde(default = "default_auto_mine_threshold")]
    pub auto_mine_threshold: usize,
    #[serde(default)]
    pub mine_empty_blocks: bool,
}

fn default_difficulty() -> u32 {
    2
}

fn default_max_attempts() -> u64 {
    1_000_000
}

fn default_block_time_ms() -> u64 {
    5_000
}

fn default_auto_mine_threshold() -> usize {
    5
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            difficulty: default_difficulty(),
            max_attempts: default_max_attempts(),
            block_time_ms: default_block_time_ms(),
            auto_mine_threshold: default_auto_mine_threshold(),
            mine_empty_blocks: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Register unknown products on their first stage event instead of
    /// rejecting them.
    #[serde(default = "default_auto_register")]
    pub auto_register_products: bool,
}

fn default_auto_register() -> bool {
    true
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            auto_register_products: default_auto_register(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContractPolicy {
    #[serde(default = "default_min_quality_score")]
    pub min_quality_score: f64,
    /// Penalties at which an active contract is declared breached.
    #[serde(default = "default_breach_penalty_limit")]
    pub breach_penalty_limit: u32,
}

fn default_min_quality_score() -> f64 {
    70.0
}

fn default_breach_penalty_limit() -> u32 {
    2
}

impl Default for ContractPolicy {
    fn default() -> Self {
        Self {
            min_quality_score: default_min_quality_score(),
            breach_penalty_limit: default_breach_penalty_limit(),
        }
    }
}
