//! Chain engine: the authoritative block list and pending-transaction pool.
//!
//! Submission-time problems are caller mistakes and surface as [`LedgerError`].
//! Append-time problems are ordinary validation outcomes and surface as a
//! `false` return from [`Blockchain::append_block`].

use parking_lot::RwLock;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::crypto::CryptoError;
use crate::types::{now, Block, Transaction};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),
    #[error("Invalid signature for transaction {0}")]
    InvalidSignature(String),
    #[error("No pending transactions available to assemble a block")]
    NoPendingTransactions,
    #[error("Persisted chain is invalid: {0}")]
    InvalidPersistedChain(String),
    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),
}

/// Toggles for signature checks. Production keeps both enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainSettings {
    pub verify_transaction_signatures: bool,
    pub verify_block_signatures: bool,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            verify_transaction_signatures: true,
            verify_block_signatures: true,
        }
    }
}

/// Where a looked-up transaction currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionLocation {
    Pending,
    Committed { block_index: u64 },
}

#[derive(Debug)]
struct ChainState {
    blocks: Vec<Block>,
    pending: Vec<Transaction>,
}

pub struct Blockchain {
    state: RwLock<ChainState>,
    settings: ChainSettings,
}

impl Blockchain {
    /// A fresh chain holding only the genesis block.
    pub fn new(settings: ChainSettings) -> Result<Self, LedgerError> {
        let genesis = Block::genesis()?;
        info!(hash = %genesis.hash, "Chain initialized with genesis block");
        Ok(Self {
            state: RwLock::new(ChainState {
                blocks: vec![genesis],
                pending: Vec::new(),
            }),
            settings,
        })
    }

    /// Rebuild a chain from persisted data, validating it end to end first.
    ///
    /// Restored pending transactions go through the submission checks. An
    /// inconsistent chain or pool is rejected as a whole; nothing is partially
    /// loaded.
    pub fn from_parts(
        blocks: Vec<Block>,
        pending: Vec<Transaction>,
        settings: ChainSettings,
    ) -> Result<Self, LedgerError> {
        validate_chain(&blocks, &settings)?;
        for tx in &pending {
            check_transaction(tx, &settings).map_err(|e| {
                LedgerError::InvalidPersistedChain(format!("pending transaction {}: {}", tx.id, e))
            })?;
        }
        info!(
            blocks = blocks.len(),
            pending = pending.len(),
            "Restored chain from persisted data"
        );
        Ok(Self {
            state: RwLock::new(ChainState { blocks, pending }),
            settings,
        })
    }

    pub fn settings(&self) -> ChainSettings {
        self.settings
    }

    /// Validate and enqueue a transaction. No duplicate detection is done here.
    pub fn submit_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        check_transaction(&tx, &self.settings)?;

        debug!(id = %tx.id, tx_type = %tx.tx_type, "Transaction submitted");
        self.state.write().pending.push(tx);
        Ok(())
    }

    /// Build an unsigned candidate block from the whole pending pool.
    pub fn assemble_block(&self, validator_public_key: &str) -> Result<Block, LedgerError> {
        let state = self.state.read();
        assemble(&state, validator_public_key, None)
    }

    /// Validate `block` against the chain tip and append it.
    ///
    /// Returns `false` without touching state if any check fails. On success the
    /// pending pool is cleared in full.
    pub fn append_block(&self, block: Block) -> bool {
        let mut state = self.state.write();
        append(&mut state, block, &self.settings, PoolDrain::All)
    }

    /// Assemble, sign and append under a single exclusive lock so that no
    /// submission can interleave with block production.
    ///
    /// `max_transactions` caps the block at the oldest N pending transactions;
    /// only the sealed ones leave the pool and the remainder stays queued.
    /// Uncapped, a successful append clears the pool. Returns the sealed block
    /// and whether it was appended.
    pub fn seal_block<F>(
        &self,
        validator_public_key: &str,
        max_transactions: Option<usize>,
        sign: F,
    ) -> Result<(Block, bool), LedgerError>
    where
        F: FnOnce(&mut Block),
    {
        let mut state = self.state.write();
        let mut block = assemble(&state, validator_public_key, max_transactions)?;
        sign(&mut block);
        let drain = match max_transactions {
            Some(_) => PoolDrain::Sealed,
            None => PoolDrain::All,
        };
        let appended = append(&mut state, block.clone(), &self.settings, drain);
        Ok((block, appended))
    }

    pub fn is_chain_valid(&self) -> bool {
        let state = self.state.read();
        match validate_chain(&state.blocks, &self.settings) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Chain validation failed");
                false
            }
        }
    }

    pub fn chain_length(&self) -> usize {
        self.state.read().blocks.len()
    }

    pub fn latest_block(&self) -> Block {
        let state = self.state.read();
        // The chain always holds at least the genesis block.
        state.blocks[state.blocks.len() - 1].clone()
    }

    pub fn block_by_index(&self, index: u64) -> Option<Block> {
        let state = self.state.read();
        usize::try_from(index)
            .ok()
            .and_then(|i| state.blocks.get(i))
            .cloned()
    }

    pub fn find_transaction(&self, id: &str) -> Option<(Transaction, TransactionLocation)> {
        let state = self.state.read();
        for block in &state.blocks {
            if let Some(tx) = block.transactions.iter().find(|tx| tx.id == id) {
                return Some((
                    tx.clone(),
                    TransactionLocation::Committed {
                        block_index: block.index,
                    },
                ));
            }
        }
        state
            .pending
            .iter()
            .find(|tx| tx.id == id)
            .map(|tx| (tx.clone(), TransactionLocation::Pending))
    }

    /// Committed transactions submitted by `sender_public_key`, in chain order.
    pub fn transactions_by_sender(&self, sender_public_key: &str) -> Vec<Transaction> {
        self.state
            .read()
            .blocks
            .iter()
            .flat_map(|b| b.transactions.iter())
            .filter(|tx| tx.sender_public_key == sender_public_key)
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.state.read().pending.len()
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.state.read().pending.clone()
    }

    pub fn blocks(&self) -> Vec<Block> {
        self.state.read().blocks.clone()
    }

    /// Queue a transaction without the submission checks.
    #[cfg(test)]
    pub(crate) fn push_pending_unchecked(&self, tx: Transaction) {
        self.state.write().pending.push(tx);
    }

    /// Copy of the chain and pool taken under one read lock, for persistence.
    pub fn snapshot(&self) -> (Vec<Block>, Vec<Transaction>) {
        let state = self.state.read();
        (state.blocks.clone(), state.pending.clone())
    }
}

fn assemble(
    state: &ChainState,
    validator_public_key: &str,
    max_transactions: Option<usize>,
) -> Result<Block, LedgerError> {
    if state.pending.is_empty() {
        return Err(LedgerError::NoPendingTransactions);
    }
    let take = max_transactions
        .map(|max| max.min(state.pending.len()))
        .unwrap_or(state.pending.len());
    let prev = &state.blocks[state.blocks.len() - 1];

    let mut block = Block {
        index: state.blocks.len() as u64,
        timestamp: now(),
        transactions: state.pending[..take].to_vec(),
        previous_hash: prev.hash.clone(),
        hash: String::new(),
        nonce: 0,
        validator_public_key: validator_public_key.to_string(),
        validator_signature: String::new(),
    };
    block.hash = block.calculate_hash()?;
    Ok(block)
}

/// What leaves the pending pool when a block is appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PoolDrain {
    All,
    /// Only transactions whose ids are in the block
    Sealed,
}

fn append(
    state: &mut ChainState,
    block: Block,
    settings: &ChainSettings,
    drain: PoolDrain,
) -> bool {
    let prev = &state.blocks[state.blocks.len() - 1];
    if let Err(reason) = check_block(&block, prev, settings) {
        warn!(index = block.index, %reason, "Block rejected");
        return false;
    }

    match drain {
        PoolDrain::All => state.pending.clear(),
        PoolDrain::Sealed => {
            let sealed: HashSet<&str> =
                block.transactions.iter().map(|tx| tx.id.as_str()).collect();
            state.pending.retain(|tx| !sealed.contains(tx.id.as_str()));
        }
    }
    info!(
        index = block.index,
        hash = %block.hash,
        transactions = block.transactions.len(),
        "Block appended"
    );
    state.blocks.push(block);
    true
}

/// Submission rules, also applied to restored pending transactions.
fn check_transaction(tx: &Transaction, settings: &ChainSettings) -> Result<(), LedgerError> {
    if tx.sender_public_key.trim().is_empty() {
        return Err(LedgerError::InvalidTransaction(
            "sender public key is empty".to_string(),
        ));
    }
    if tx.payload_data.trim().is_empty() {
        return Err(LedgerError::InvalidTransaction(
            "payload is empty".to_string(),
        ));
    }
    if settings.verify_transaction_signatures && !tx.verify_signature() {
        return Err(LedgerError::InvalidSignature(tx.id.clone()));
    }
    Ok(())
}

/// The rule set shared by append and whole-chain validation.
fn check_block(block: &Block, prev: &Block, settings: &ChainSettings) -> Result<(), String> {
    if block.index != prev.index + 1 {
        return Err(format!(
            "invalid index: expected {}, got {}",
            prev.index + 1,
            block.index
        ));
    }
    if block.previous_hash != prev.hash {
        return Err(format!(
            "invalid previous hash: expected {}, got {}",
            prev.hash, block.previous_hash
        ));
    }
    let calculated = block.calculate_hash().map_err(|e| e.to_string())?;
    if calculated != block.hash {
        return Err(format!(
            "invalid block hash: expected {}, got {}",
            calculated, block.hash
        ));
    }
    if settings.verify_block_signatures && !block.verify_validator_signature() {
        return Err("invalid validator signature".to_string());
    }
    if settings.verify_transaction_signatures {
        if let Some(tx) = block.transactions.iter().find(|tx| !tx.verify_signature()) {
            return Err(format!("invalid signature for transaction {}", tx.id));
        }
    }
    Ok(())
}

fn validate_chain(blocks: &[Block], settings: &ChainSettings) -> Result<(), LedgerError> {
    let genesis = Block::genesis()?;
    let first = blocks
        .first()
        .ok_or_else(|| LedgerError::InvalidPersistedChain("chain is empty".to_string()))?;
    if first.hash != genesis.hash || first.calculate_hash()? != genesis.hash {
        return Err(LedgerError::InvalidPersistedChain(
            "genesis block mismatch".to_string(),
        ));
    }
    for pair in blocks.windows(2) {
        check_block(&pair[1], &pair[0], settings).map_err(|reason| {
            LedgerError::InvalidPersistedChain(format!("block {}: {}", pair[1].index, reason))
        })?;
    }
    Ok(())
}
