//! Timed block production.
//!
//! [`BlockProducer`] wakes up every interval, and when enough transactions are
//! pending asks the consensus engine for a block. Each committed block is then
//! snapshotted and offered to the contract engine. A failing or panicking cycle
//! is logged and the loop carries on with the next tick.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::consensus::{ConsensusEngine, ConsensusError};
use crate::contracts::ContractEngine;
use crate::ledger::Blockchain;
use crate::storage::Storage;
use crate::types::Block;

#[derive(Clone)]
pub struct ProducerSettings {
    pub interval: Duration,
    pub min_transactions: usize,
    pub validator_password: String,
    pub auto_save: bool,
}

impl std::fmt::Debug for ProducerSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerSettings")
            .field("interval", &self.interval)
            .field("min_transactions", &self.min_transactions)
            .field("validator_password", &"<redacted>")
            .field("auto_save", &self.auto_save)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped { pending: usize },
    Produced(Block),
}

#[derive(Clone)]
pub struct BlockProducer {
    chain: Arc<Blockchain>,
    consensus: Arc<dyn ConsensusEngine>,
    storage: Option<Arc<dyn Storage>>,
    contracts: Option<Arc<ContractEngine>>,
    settings: Arc<ProducerSettings>,
}

impl BlockProducer {
    pub fn new(
        chain: Arc<Blockchain>,
        consensus: Arc<dyn ConsensusEngine>,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            chain,
            consensus,
            storage: None,
            contracts: None,
            settings: Arc::new(settings),
        }
    }

    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_contracts(mut self, contracts: Arc<ContractEngine>) -> Self {
        self.contracts = Some(contracts);
        self
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    /// Produce a block now, regardless of the minimum threshold.
    pub async fn produce_block(&self) -> Result<Block, ConsensusError> {
        let block = self
            .consensus
            .create_block(&self.chain, &self.settings.validator_password)
            .await?;
        self.after_commit(&block).await;
        Ok(block)
    }

    /// One scheduler tick.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, ConsensusError> {
        let pending = self.chain.pending_count();
        if pending == 0 || pending < self.settings.min_transactions {
            debug!(
                pending,
                min = self.settings.min_transactions,
                "Not enough pending transactions, skipping block creation"
            );
            return Ok(CycleOutcome::Skipped { pending });
        }
        self.produce_block().await.map(CycleOutcome::Produced)
    }

    async fn after_commit(&self, block: &Block) {
        if self.settings.auto_save {
            if let Some(storage) = &self.storage {
                let storage = Arc::clone(storage);
                let (blocks, pending) = self.chain.snapshot();
                // File I/O runs on the blocking pool.
                let saved =
                    tokio::task::spawn_blocking(move || storage.save(&blocks, &pending)).await;
                match saved {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(index = block.index, error = %e, "Failed to snapshot chain");
                    }
                    Err(e) => {
                        error!(index = block.index, error = %e, "Snapshot task failed");
                    }
                }
            }
        }

        if let Some(contracts) = &self.contracts {
            let results = contracts.execute_for_block(block);
            let failed = results.iter().filter(|r| !r.success).count();
            for result in results.iter().filter(|r| !r.success) {
                warn!(
                    contract = %result.contract_id,
                    tx = %result.transaction_id,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "Contract rejected transaction"
                );
            }
            debug!(
                index = block.index,
                executions = results.len(),
                failed,
                "Contracts dispatched"
            );
        }
    }

    /// Loop until `cancel` fires. An in-flight cycle is allowed to finish.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.settings.interval.as_millis() as u64,
            min_transactions = self.settings.min_transactions,
            "Block producer started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
            if cancel.is_cancelled() {
                break;
            }

            let this = self.clone();
            match tokio::spawn(async move { this.run_cycle().await }).await {
                Ok(Ok(CycleOutcome::Produced(block))) => {
                    debug!(index = block.index, "Scheduled block produced");
                }
                Ok(Ok(CycleOutcome::Skipped { .. })) => {}
                Ok(Err(e)) if e.is_expected() => {
                    warn!(error = %e, "Block production cycle skipped");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "Block production cycle failed");
                }
                Err(e) => {
                    error!(error = %e, "Block production cycle panicked");
                }
            }
        }
        info!("Block producer stopped");
    }

    pub fn spawn(self) -> ProducerHandle {
        let cancel = CancellationToken::new();
        let join = tokio::spawn(self.run(cancel.clone()));
        ProducerHandle { cancel, join }
    }
}

pub struct ProducerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl ProducerHandle {
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Signal the loop and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            error!(error = %e, "Block producer task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::PoAConsensus;
    use crate::contracts::PaymentReleaseContract;
    use crate::crypto::{encrypt_private_key, generate_signing_key, public_key_hex};
    use crate::ledger::ChainSettings;
    use crate::storage::{FileStorage, FileStorageOptions};
    use crate::types::{Transaction, TransactionType};
    use crate::validators::{InMemoryValidatorRegistry, SelectionStrategy, Validator};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    const PASSWORD: &str = "scheduler-secret";

    fn settings(interval_ms: u64, min_transactions: usize) -> ProducerSettings {
        ProducerSettings {
            interval: Duration::from_millis(interval_ms),
            min_transactions,
            validator_password: PASSWORD.to_string(),
            auto_save: true,
        }
    }

    fn poa() -> Arc<dyn ConsensusEngine> {
        let registry = Arc::new(InMemoryValidatorRegistry::new(SelectionStrategy::RoundRobin));
        let key = generate_signing_key();
        registry
            .register(Validator::new(
                "alpha",
                public_key_hex(&key),
                encrypt_private_key(&key, PASSWORD).unwrap(),
                0,
            ))
            .unwrap();
        Arc::new(PoAConsensus::new(registry, None))
    }

    fn submit(chain: &Blockchain, count: usize) {
        let key = generate_signing_key();
        for _ in 0..count {
            let mut tx = Transaction::new(
                TransactionType::ShipmentCreated,
                public_key_hex(&key),
                r#"{"shipmentId":"S-1"}"#,
            );
            tx.sign(&key);
            chain.submit_transaction(tx).unwrap();
        }
    }

    struct Flaky {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ConsensusEngine for Flaky {
        async fn create_block(
            &self,
            _chain: &Blockchain,
            _password: &str,
        ) -> Result<Block, ConsensusError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                panic!("validator store unavailable");
            }
            Err(ConsensusError::NoActiveValidators)
        }
    }

    #[tokio::test]
    async fn test_cycle_skips_below_minimum() {
        let chain = Arc::new(Blockchain::new(ChainSettings::default()).unwrap());
        let producer = BlockProducer::new(Arc::clone(&chain), poa(), settings(10, 3));
        submit(&chain, 2);

        assert_eq!(
            producer.run_cycle().await.unwrap(),
            CycleOutcome::Skipped { pending: 2 }
        );
        assert_eq!(chain.chain_length(), 1);

        submit(&chain, 1);
        match producer.run_cycle().await.unwrap() {
            CycleOutcome::Produced(block) => assert_eq!(block.transactions.len(), 3),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(chain.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_loop_produces_and_snapshots() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FileStorage::new(FileStorageOptions {
            path: dir.path().join("chain.json"),
            backups_enabled: false,
            max_backups: 1,
        }));
        let chain = Arc::new(Blockchain::new(ChainSettings::default()).unwrap());
        let contracts = Arc::new(ContractEngine::with_builtin_contracts(
            PaymentReleaseContract::new(0.0),
        ));
        let handle = BlockProducer::new(Arc::clone(&chain), poa(), settings(20, 1))
            .with_storage(storage.clone())
            .with_contracts(Arc::clone(&contracts))
            .spawn();

        submit(&chain, 2);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while chain.chain_length() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert_eq!(chain.chain_length(), 2);
        let saved = storage.load().unwrap().unwrap();
        assert_eq!(saved.chain.len(), 2);
        assert!(!contracts
            .state(crate::contracts::shipment::SHIPMENT_LIFECYCLE_CONTRACT_ID)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_loop_survives_failing_cycles() {
        let chain = Arc::new(Blockchain::new(ChainSettings::default()).unwrap());
        submit(&chain, 1);
        let calls = Arc::new(AtomicUsize::new(0));
        let consensus = Arc::new(Flaky {
            calls: Arc::clone(&calls),
        });
        let handle = BlockProducer::new(Arc::clone(&chain), consensus, settings(5, 1)).spawn();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while calls.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!handle.is_finished());
        handle.shutdown().await;

        assert!(calls.load(Ordering::SeqCst) >= 3);
        assert_eq!(chain.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_sleep() {
        let chain = Arc::new(Blockchain::new(ChainSettings::default()).unwrap());
        let handle = BlockProducer::new(chain, poa(), settings(60_000, 1)).spawn();
        let started = tokio::time::Instant::now();
        handle.shutdown().await;
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
