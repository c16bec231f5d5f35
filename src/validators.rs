//! Validator registry and proof-of-authority signer selection.
//!
//! The round-robin cursor lives in a [`ValidatorSelector`] owned by one registry
//! instance. It starts at zero, advances once per selection for the lifetime of
//! that instance, and can be rewound with [`ValidatorSelector::reset`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No active validators registered")]
    NoActiveValidators,
    #[error("Validator not found: {0}")]
    ValidatorNotFound(String),
    #[error("Validator already registered with public key {0}")]
    DuplicatePublicKey(String),
}

/// A registered identity authorized to sign blocks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Validator {
    pub id: String,
    pub name: String,
    pub public_key: String,
    pub encrypted_private_key: String,
    pub is_active: bool,
    /// Lower values are selected first in round-robin order
    pub priority: i32,
    pub total_blocks_created: u64,
    pub last_block_created_at: Option<DateTime<Utc>>,
}

impl Validator {
    pub fn new(
        name: impl Into<String>,
        public_key: impl Into<String>,
        encrypted_private_key: impl Into<String>,
        priority: i32,
    ) -> Self {
        Validator {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            public_key: public_key.into(),
            encrypted_private_key: encrypted_private_key.into(),
            is_active: true,
            priority,
            total_blocks_created: 0,
            last_block_created_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    Random,
}

impl std::str::FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Ok(SelectionStrategy::RoundRobin),
            "random" => Ok(SelectionStrategy::Random),
            other => Err(format!("Unknown selection strategy: {}", other)),
        }
    }
}

/// Picks the next signer from a set of active validators.
#[derive(Debug)]
pub struct ValidatorSelector {
    strategy: SelectionStrategy,
    cursor: usize,
}

impl ValidatorSelector {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            cursor: 0,
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// `active` must already be filtered to active validators.
    pub fn select(&mut self, active: &[Validator]) -> Result<Validator, RegistryError> {
        if active.is_empty() {
            return Err(RegistryError::NoActiveValidators);
        }
        if active.len() == 1 {
            return Ok(active[0].clone());
        }

        let mut ordered: Vec<&Validator> = active.iter().collect();
        ordered.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));

        let chosen = match self.strategy {
            SelectionStrategy::RoundRobin => {
                let picked = ordered[self.cursor % ordered.len()];
                self.cursor = self.cursor.wrapping_add(1);
                picked
            }
            SelectionStrategy::Random => ordered[rand::thread_rng().gen_range(0..ordered.len())],
        };
        Ok(chosen.clone())
    }
}

/// External key-store collaborator supplying block signers.
#[async_trait]
pub trait ValidatorRegistry: Send + Sync {
    async fn active_validators(&self) -> Vec<Validator>;

    async fn next_validator(&self) -> Result<Validator, RegistryError>;

    /// Report that `validator_id` produced a block at `at`.
    async fn record_block_created(
        &self,
        validator_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError>;
}

/// Process-local registry.
pub struct InMemoryValidatorRegistry {
    validators: RwLock<Vec<Validator>>,
    selector: Mutex<ValidatorSelector>,
}

impl InMemoryValidatorRegistry {
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            validators: RwLock::new(Vec::new()),
            selector: Mutex::new(ValidatorSelector::new(strategy)),
        }
    }

    pub fn register(&self, validator: Validator) -> Result<(), RegistryError> {
        let mut validators = self.validators.write();
        if validators.iter().any(|v| v.public_key == validator.public_key) {
            return Err(RegistryError::DuplicatePublicKey(validator.public_key));
        }
        debug!(name = %validator.name, priority = validator.priority, "Validator registered");
        validators.push(validator);
        Ok(())
    }

    pub fn set_active(&self, validator_id: &str, active: bool) -> Result<(), RegistryError> {
        let mut validators = self.validators.write();
        let validator = validators
            .iter_mut()
            .find(|v| v.id == validator_id)
            .ok_or_else(|| RegistryError::ValidatorNotFound(validator_id.to_string()))?;
        validator.is_active = active;
        Ok(())
    }

    pub fn get(&self, validator_id: &str) -> Option<Validator> {
        self.validators
            .read()
            .iter()
            .find(|v| v.id == validator_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Validator> {
        self.validators.read().clone()
    }

    pub fn reset_selection(&self) {
        self.selector.lock().reset();
    }
}

#[async_trait]
impl ValidatorRegistry for InMemoryValidatorRegistry {
    async fn active_validators(&self) -> Vec<Validator> {
        self.validators
            .read()
            .iter()
            .filter(|v| v.is_active)
            .cloned()
            .collect()
    }

    async fn next_validator(&self) -> Result<Validator, RegistryError> {
        let active = self.active_validators().await;
        self.selector.lock().select(&active)
    }

    async fn record_block_created(
        &self,
        validator_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), RegistryError> {
        let mut validators = self.validators.write();
        let validator = validators
            .iter_mut()
            .find(|v| v.id == validator_id)
            .ok_or_else(|| RegistryError::ValidatorNotFound(validator_id.to_string()))?;
        validator.total_blocks_created += 1;
        validator.last_block_created_at = Some(at);
        Ok(())
    }
}
