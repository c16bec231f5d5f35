//! Ledger configuration.
//!
//! Loaded from TOML; every field has a default so partial files are accepted.
//! The validator decryption password is deliberately absent: it is supplied at
//! startup from the environment or the command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::crypto::PublicKey;
use crate::ledger::ChainSettings;
use crate::storage::FileStorageOptions;
use crate::validators::SelectionStrategy;

/// Environment variable holding the validator key password.
pub const VALIDATOR_PASSWORD_ENV: &str = "AIDLEDGER_VALIDATOR_PASSWORD";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockchainConfig {
    pub verify_transaction_signatures: bool,
    pub verify_block_signatures: bool,
}

impl Default for BlockchainConfig {
    fn default() -> Self {
        Self {
            verify_transaction_signatures: true,
            verify_block_signatures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub block_interval_secs: u64,
    pub min_transactions_per_block: usize,
    /// Unset means every pending transaction goes into the next block
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_transactions_per_block: Option<usize>,
    pub selection_strategy: SelectionStrategy,
    pub automated_block_creation: bool,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            block_interval_secs: 10,
            min_transactions_per_block: 1,
            max_transactions_per_block: None,
            selection_strategy: SelectionStrategy::RoundRobin,
            automated_block_creation: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub path: PathBuf,
    pub auto_save: bool,
    pub auto_load: bool,
    pub backups_enabled: bool,
    pub max_backups: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/blockchain.json"),
            auto_save: true,
            auto_load: true,
            backups_enabled: true,
            max_backups: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContractsConfig {
    pub builtin_contracts: bool,
    /// Offer every committed block to the contract engine
    pub dispatch_on_commit: bool,
    pub minimum_payment_amount: f64,
    /// Hex public keys allowed to verify suppliers. Empty accepts any signer.
    pub supplier_verifiers: Vec<String>,
}

impl Default for ContractsConfig {
    fn default() -> Self {
        Self {
            builtin_contracts: true,
            dispatch_on_commit: true,
            minimum_payment_amount: 0.0,
            supplier_verifiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub blockchain: BlockchainConfig,
    pub consensus: ConsensusConfig,
    pub persistence: PersistenceConfig,
    pub contracts: ContractsConfig,
}

impl LedgerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: LedgerConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let consensus = &self.consensus;
        if consensus.block_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "consensus.block_interval_secs must be greater than zero".to_string(),
            ));
        }
        if let Some(max) = consensus.max_transactions_per_block {
            if max == 0 {
                return Err(ConfigError::Invalid(
                    "consensus.max_transactions_per_block must be greater than zero".to_string(),
                ));
            }
            if consensus.min_transactions_per_block > max {
                return Err(ConfigError::Invalid(format!(
                    "consensus.min_transactions_per_block ({}) exceeds max ({})",
                    consensus.min_transactions_per_block, max
                )));
            }
        }
        if self.persistence.backups_enabled && self.persistence.max_backups == 0 {
            return Err(ConfigError::Invalid(
                "persistence.max_backups must be at least 1 when backups are enabled".to_string(),
            ));
        }
        if self.contracts.minimum_payment_amount < 0.0 {
            return Err(ConfigError::Invalid(
                "contracts.minimum_payment_amount must not be negative".to_string(),
            ));
        }
        if let Some(bad) = self
            .contracts
            .supplier_verifiers
            .iter()
            .find(|key| PublicKey::from_hex(key).is_err())
        {
            return Err(ConfigError::Invalid(format!(
                "contracts.supplier_verifiers contains an invalid public key: {}",
                bad
            )));
        }
        Ok(())
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            verify_transaction_signatures: self.blockchain.verify_transaction_signatures,
            verify_block_signatures: self.blockchain.verify_block_signatures,
        }
    }

    pub fn storage_options(&self) -> FileStorageOptions {
        FileStorageOptions {
            path: self.persistence.path.clone(),
            backups_enabled: self.persistence.backups_enabled,
            max_backups: self.persistence.max_backups,
        }
    }

    pub fn block_interval(&self) -> Duration {
        Duration::from_secs(self.consensus.block_interval_secs)
    }
}
