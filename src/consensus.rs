//! Proof-of-authority block production.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::{self, CryptoError};
use crate::ledger::{Blockchain, LedgerError};
use crate::types::{now, Block};
use crate::validators::{RegistryError, ValidatorRegistry};

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("No active validators available")]
    NoActiveValidators,
    #[error("Failed to decrypt private key of validator {0}")]
    KeyDecryptionFailed(String),
    #[error("Validator {0} key does not match its registered public key")]
    UnauthorizedSigner(String),
    #[error("No pending transactions available to generate a block")]
    NoPendingTransactions,
    #[error("Block {index} was rejected by the chain")]
    BlockRejected { index: u64 },
    #[error("Ledger error: {0}")]
    Ledger(LedgerError),
    #[error("Validator registry error: {0}")]
    Registry(RegistryError),
    #[error("Key decryption task failed: {0}")]
    TaskFailed(String),
}

impl ConsensusError {
    /// Operational failures that are retried next cycle rather than reported as faults.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            ConsensusError::NoActiveValidators
                | ConsensusError::NoPendingTransactions
                | ConsensusError::KeyDecryptionFailed(_)
        )
    }
}

impl From<LedgerError> for ConsensusError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::NoPendingTransactions => ConsensusError::NoPendingTransactions,
            other => ConsensusError::Ledger(other),
        }
    }
}

impl From<RegistryError> for ConsensusError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NoActiveValidators => ConsensusError::NoActiveValidators,
            other => ConsensusError::Registry(other),
        }
    }
}

#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Produce, sign and commit one block from the pending pool.
    async fn create_block(
        &self,
        chain: &Blockchain,
        validator_password: &str,
    ) -> Result<Block, ConsensusError>;
}

/// Proof-of-authority block production over a closed validator set.
pub struct PoAConsensus<R: ValidatorRegistry> {
    registry: Arc<R>,
    max_transactions_per_block: Option<usize>,
}

impl<R: ValidatorRegistry> PoAConsensus<R> {
    pub fn new(registry: Arc<R>, max_transactions_per_block: Option<usize>) -> Self {
        Self {
            registry,
            max_transactions_per_block,
        }
    }

    pub fn registry(&self) -> &Arc<R> {
        &self.registry
    }
}

#[async_trait]
impl<R: ValidatorRegistry + 'static> ConsensusEngine for PoAConsensus<R> {
    async fn create_block(
        &self,
        chain: &Blockchain,
        validator_password: &str,
    ) -> Result<Block, ConsensusError> {
        let validator = self.registry.next_validator().await?;
        debug!(validator = %validator.name, "Validator selected");

        // Argon2 key derivation is CPU-bound; keep it off the async workers.
        let sealed = validator.encrypted_private_key.clone();
        let password = validator_password.to_string();
        let signing_key =
            tokio::task::spawn_blocking(move || crypto::decrypt_private_key(&sealed, &password))
                .await
                .map_err(|e| ConsensusError::TaskFailed(e.to_string()))?
                .map_err(|e| match e {
                    CryptoError::KeyDecryptionFailed | CryptoError::InvalidPrivateKey => {
                        ConsensusError::KeyDecryptionFailed(validator.name.clone())
                    }
                    other => ConsensusError::Ledger(LedgerError::CryptoError(other)),
                })?;
        if crypto::public_key_hex(&signing_key) != validator.public_key {
            return Err(ConsensusError::UnauthorizedSigner(validator.name));
        }

        let (block, appended) = chain.seal_block(
            &validator.public_key,
            self.max_transactions_per_block,
            |block| block.sign(&signing_key),
        )?;
        if !appended {
            warn!(index = block.index, validator = %validator.name, "Sealed block rejected");
            return Err(ConsensusError::BlockRejected { index: block.index });
        }

        self.registry
            .record_block_created(&validator.id, now())
            .await?;
        info!(
            index = block.index,
            hash = %block.hash,
            validator = %validator.name,
            transactions = block.transactions.len(),
            "Block created"
        );
        Ok(block)
    }
}
