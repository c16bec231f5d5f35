//! Ledger runtime: the facade the service layer talks to.
//!
//! Wires the chain engine, snapshot storage, proof-of-authority consensus, the
//! contract engine and the block producer together according to a
//! [`LedgerConfig`].

use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::{ConfigError, LedgerConfig};
use crate::consensus::{ConsensusError, PoAConsensus};
use crate::contracts::{
    ContractEngine, ExecutionContext, ExecutionResult, PaymentReleaseContract,
};
use crate::crypto;
use crate::ledger::{Blockchain, LedgerError, TransactionLocation};
use crate::scheduler::{BlockProducer, ProducerHandle, ProducerSettings};
use crate::storage::{FileStorage, Storage, StorageError};
use crate::types::{Block, Transaction, TransactionType};
use crate::validators::ValidatorRegistry;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Ledger error: {0}")]
    LedgerError(#[from] LedgerError),
    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),
    #[error("Consensus error: {0}")]
    ConsensusError(#[from] ConsensusError),
    #[error("Config error: {0}")]
    ConfigError(#[from] ConfigError),
    #[error("Automated block creation is disabled")]
    AutomationDisabled,
    #[error("Block producer already running")]
    AlreadyRunning,
    #[error("Block producer not running")]
    NotRunning,
}

pub struct LedgerRuntime {
    config: LedgerConfig,
    chain: Arc<Blockchain>,
    storage: Arc<FileStorage>,
    contracts: Arc<ContractEngine>,
    producer: BlockProducer,
    producer_handle: Mutex<Option<ProducerHandle>>,
}

impl LedgerRuntime {
    /// Build the runtime, restoring the persisted chain when configured to.
    ///
    /// A persisted chain that fails validation aborts startup with
    /// `LedgerError::InvalidPersistedChain`.
    pub fn open<R>(
        config: LedgerConfig,
        registry: Arc<R>,
        validator_password: impl Into<String>,
    ) -> Result<Self, RuntimeError>
    where
        R: ValidatorRegistry + 'static,
    {
        config.validate()?;
        let settings = config.chain_settings();
        let storage = Arc::new(FileStorage::new(config.storage_options()));

        let restored = if config.persistence.auto_load {
            storage.load()?
        } else {
            None
        };
        let chain = match restored {
            Some(snapshot) => {
                Blockchain::from_parts(snapshot.chain, snapshot.pending_transactions, settings)?
            }
            None => Blockchain::new(settings)?,
        };
        let chain = Arc::new(chain);

        let consensus = Arc::new(PoAConsensus::new(
            registry,
            config.consensus.max_transactions_per_block,
        ));
        let contracts = Arc::new(if config.contracts.builtin_contracts {
            ContractEngine::with_builtin_contracts(
                PaymentReleaseContract::new(config.contracts.minimum_payment_amount)
                    .with_verifiers(config.contracts.supplier_verifiers.iter().cloned()),
            )
        } else {
            ContractEngine::new()
        });

        let mut producer = BlockProducer::new(
            Arc::clone(&chain),
            consensus,
            ProducerSettings {
                interval: config.block_interval(),
                min_transactions: config.consensus.min_transactions_per_block,
                validator_password: validator_password.into(),
                auto_save: config.persistence.auto_save,
            },
        )
        .with_storage(storage.clone());
        if config.contracts.dispatch_on_commit {
            producer = producer.with_contracts(Arc::clone(&contracts));
        }

        info!(
            chain_length = chain.chain_length(),
            pending = chain.pending_count(),
            snapshot = %storage.path().display(),
            "Ledger runtime ready"
        );
        Ok(Self {
            config,
            chain,
            storage,
            contracts,
            producer,
            producer_handle: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<Blockchain> {
        &self.chain
    }

    pub fn contracts(&self) -> &Arc<ContractEngine> {
        &self.contracts
    }

    /// Start the background block producer. Must be called inside a tokio runtime.
    pub fn start(&self) -> Result<(), RuntimeError> {
        if !self.config.consensus.automated_block_creation {
            return Err(RuntimeError::AutomationDisabled);
        }
        let mut handle = self.producer_handle.lock();
        if handle.is_some() {
            return Err(RuntimeError::AlreadyRunning);
        }
        *handle = Some(self.producer.clone().spawn());
        info!("Ledger runtime started");
        Ok(())
    }

    /// Stop the block producer and take a final snapshot when auto-save is on.
    pub async fn stop(&self) -> Result<(), RuntimeError> {
        let handle = self
            .producer_handle
            .lock()
            .take()
            .ok_or(RuntimeError::NotRunning)?;
        handle.shutdown().await;
        if self.config.persistence.auto_save {
            self.save_snapshot()?;
        }
        info!("Ledger runtime stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.producer_handle.lock().is_some()
    }

    pub fn submit_transaction(&self, transaction: Transaction) -> Result<(), RuntimeError> {
        Ok(self.chain.submit_transaction(transaction)?)
    }

    /// Build, sign and submit a transaction on behalf of a key held by the caller.
    pub fn submit_signed(
        &self,
        tx_type: TransactionType,
        sender: &SigningKey,
        payload: impl Into<String>,
    ) -> Result<Transaction, RuntimeError> {
        let mut tx = Transaction::new(tx_type, crypto::public_key_hex(sender), payload);
        tx.sign(sender);
        self.chain.submit_transaction(tx.clone())?;
        Ok(tx)
    }

    pub fn query_transaction(&self, id: &str) -> Option<(Transaction, TransactionLocation)> {
        self.chain.find_transaction(id)
    }

    pub fn query_chain_validity(&self) -> bool {
        self.chain.is_chain_valid()
    }

    pub fn query_chain_length(&self) -> usize {
        self.chain.chain_length()
    }

    pub fn latest_block(&self) -> Block {
        self.chain.latest_block()
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        self.chain.block_by_index(index)
    }

    pub fn transactions_by_sender(&self, sender_public_key: &str) -> Vec<Transaction> {
        self.chain.transactions_by_sender(sender_public_key)
    }

    pub fn pending_count(&self) -> usize {
        self.chain.pending_count()
    }

    /// Produce a block immediately, bypassing the minimum threshold.
    pub async fn produce_block(&self) -> Result<Block, RuntimeError> {
        Ok(self.producer.produce_block().await?)
    }

    pub fn save_snapshot(&self) -> Result<(), RuntimeError> {
        let (blocks, pending) = self.chain.snapshot();
        self.storage.save(&blocks, &pending)?;
        Ok(())
    }

    /// Offer a committed transaction to every applicable contract.
    pub fn execute_contracts(&self, ctx: &ExecutionContext) -> Vec<ExecutionResult> {
        self.contracts.execute_applicable(ctx)
    }
}
