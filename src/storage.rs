//! Snapshot persistence for the chain and the pending pool.
//!
//! A snapshot is a single JSON document. Before an existing snapshot is
//! overwritten it can be copied to a timestamped backup; backups beyond the
//! retention count are pruned oldest first.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{Block, Transaction};

/// Current snapshot document format.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Backup names embed `%Y%m%d%H%M%S` plus nanoseconds, all digits.
const BACKUP_STAMP_LEN: usize = 23;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),
}

/// The persisted document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainSnapshot {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub chain: Vec<Block>,
    pub pending_transactions: Vec<Transaction>,
}

pub trait Storage: Send + Sync {
    fn save(&self, chain: &[Block], pending: &[Transaction]) -> Result<(), StorageError>;
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<ChainSnapshot>, StorageError>;
    /// Returns whether a snapshot existed.
    fn delete(&self) -> Result<bool, StorageError>;
    fn exists(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct FileStorageOptions {
    pub path: PathBuf,
    pub backups_enabled: bool,
    pub max_backups: usize,
}

/// File-backed snapshot store. All file mutations go through one gate.
pub struct FileStorage {
    options: FileStorageOptions,
    gate: Mutex<()>,
}

impl FileStorage {
    pub fn new(options: FileStorageOptions) -> Self {
        Self {
            options,
            gate: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    fn backup_dir(&self) -> PathBuf {
        self.options
            .path
            .parent()
            .map(|p| p.join("backups"))
            .unwrap_or_else(|| PathBuf::from("backups"))
    }

    fn file_stem(&self) -> String {
        self.options
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "blockchain".to_string())
    }

    /// Backup files for this snapshot, oldest first.
    pub fn list_backups(&self) -> Result<Vec<PathBuf>, StorageError> {
        let dir = self.backup_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let prefix = format!("{}_", self.file_stem());
        let mut backups: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| is_backup_name(n, &prefix))
                    .unwrap_or(false)
            })
            .collect();
        // Names embed a fixed-width timestamp, so lexicographic order is chronological.
        backups.sort();
        Ok(backups)
    }

    fn create_backup(&self) -> Result<(), StorageError> {
        let dir = self.backup_dir();
        fs::create_dir_all(&dir)?;
        let stem = self.file_stem();
        let backup_path = |stamp: u128| dir.join(format!("{}_{:023}.bak", stem, stamp));
        // A same-instant backup bumps the stamp instead of overwriting.
        let mut stamp: u128 = Utc::now()
            .format("%Y%m%d%H%M%S%9f")
            .to_string()
            .parse()
            .unwrap_or_default();
        while backup_path(stamp).exists() {
            stamp += 1;
        }
        let target = backup_path(stamp);
        fs::copy(&self.options.path, &target)?;
        debug!(backup = %target.display(), "Snapshot backup created");

        let backups = self.list_backups()?;
        if backups.len() > self.options.max_backups {
            let excess = backups.len() - self.options.max_backups;
            for old in &backups[..excess] {
                fs::remove_file(old)?;
                debug!(backup = %old.display(), "Old snapshot backup removed");
            }
        }
        Ok(())
    }

    fn write_atomically(&self, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = self.options.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.options.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.options.path)?;
        Ok(())
    }
}

fn is_backup_name(name: &str, prefix: &str) -> bool {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.strip_suffix(".bak"))
        .map(|stamp| stamp.len() == BACKUP_STAMP_LEN && stamp.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

impl Storage for FileStorage {
    fn save(&self, chain: &[Block], pending: &[Transaction]) -> Result<(), StorageError> {
        let _guard = self.gate.lock();

        let snapshot = ChainSnapshot {
            version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            chain: chain.to_vec(),
            pending_transactions: pending.to_vec(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        if self.options.backups_enabled && self.options.path.exists() {
            if let Err(e) = self.create_backup() {
                warn!(error = %e, "Snapshot backup failed, continuing with save");
            }
        }

        self.write_atomically(&bytes)?;
        info!(
            path = %self.options.path.display(),
            blocks = chain.len(),
            pending = pending.len(),
            "Chain snapshot saved"
        );
        Ok(())
    }

    fn load(&self) -> Result<Option<ChainSnapshot>, StorageError> {
        let _guard = self.gate.lock();

        if !self.options.path.exists() {
            debug!(path = %self.options.path.display(), "No snapshot to load");
            return Ok(None);
        }
        let bytes = fs::read(&self.options.path)?;
        let snapshot: ChainSnapshot = serde_json::from_slice(&bytes)?;
        if snapshot.version != SNAPSHOT_FORMAT_VERSION {
            return Err(StorageError::UnsupportedVersion(snapshot.version));
        }
        info!(
            blocks = snapshot.chain.len(),
            pending = snapshot.pending_transactions.len(),
            saved_at = %snapshot.saved_at,
            "Chain snapshot loaded"
        );
        Ok(Some(snapshot))
    }

    fn delete(&self) -> Result<bool, StorageError> {
        let _guard = self.gate.lock();

        if !self.options.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.options.path)?;
        info!(path = %self.options.path.display(), "Chain snapshot deleted");
        Ok(true)
    }

    fn exists(&self) -> bool {
        self.options.path.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_signing_key, public_key_hex};
    use crate::ledger::{Blockchain, ChainSettings};
    use crate::types::TransactionType;
    use tempfile::TempDir;

    fn storage_in(dir: &TempDir, max_backups: usize) -> FileStorage {
        FileStorage::new(FileStorageOptions {
            path: dir.path().join("chain.json"),
            backups_enabled: true,
            max_backups,
        })
    }

    fn signed_tx(key: &ed25519_dalek::SigningKey) -> Transaction {
        let mut tx = Transaction::new(
            TransactionType::ShipmentCreated,
            public_key_hex(key),
            r#"{"shipmentId":"S-1"}"#,
        );
        tx.sign(key);
        tx
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 3);
        assert!(storage.load().unwrap().is_none());
        assert!(!storage.delete().unwrap());
    }

    #[test]
    fn test_genesis_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 3);
        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let (blocks, pending) = chain.snapshot();
        storage.save(&blocks, &pending).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.version, SNAPSHOT_FORMAT_VERSION);
        assert_eq!(loaded.chain.len(), 1);
        assert_eq!(loaded.chain[0].hash, blocks[0].hash);
        assert!(loaded.pending_transactions.is_empty());
    }

    #[test]
    fn test_blocks_and_pending_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 3);
        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let key = generate_signing_key();

        for _ in 0..2 {
            chain.submit_transaction(signed_tx(&key)).unwrap();
            let mut block = chain.assemble_block(&public_key_hex(&key)).unwrap();
            block.sign(&key);
            assert!(chain.append_block(block));
        }
        let pending: Vec<_> = (0..3).map(|_| signed_tx(&key)).collect();
        for tx in &pending {
            chain.submit_transaction(tx.clone()).unwrap();
        }

        let (blocks, pool) = chain.snapshot();
        storage.save(&blocks, &pool).unwrap();
        let loaded = storage.load().unwrap().unwrap();

        assert_eq!(loaded.chain, blocks);
        let ids: Vec<_> = loaded.pending_transactions.iter().map(|t| &t.id).collect();
        let expected: Vec<_> = pending.iter().map(|t| &t.id).collect();
        assert_eq!(ids, expected);

        let restored = Blockchain::from_parts(
            loaded.chain,
            loaded.pending_transactions,
            ChainSettings::default(),
        )
        .unwrap();
        assert_eq!(restored.chain_length(), 3);
        assert_eq!(restored.pending_count(), 3);
        assert!(restored.is_chain_valid());
    }

    #[test]
    fn test_unparsable_snapshot_is_hard_failure() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 3);
        fs::write(storage.path(), b"{ not json").unwrap();
        assert!(matches!(
            storage.load(),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn test_backup_rotation() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 2);
        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let (blocks, pending) = chain.snapshot();

        for _ in 0..5 {
            storage.save(&blocks, &pending).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        let backups = storage.list_backups().unwrap();
        assert_eq!(backups.len(), 2);
        assert!(backups[0] < backups[1]);
        assert!(storage.exists());
        assert!(storage.delete().unwrap());
        assert!(!storage.exists());
    }

    #[test]
    fn test_back_to_back_saves_keep_distinct_backups() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 10);
        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let (blocks, pending) = chain.snapshot();

        for _ in 0..4 {
            storage.save(&blocks, &pending).unwrap();
        }
        let backups = storage.list_backups().unwrap();
        assert_eq!(backups.len(), 3);
        assert!(backups.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_backups_of_other_snapshots_are_ignored() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 1);
        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let foreign = backups.join("chain_v2_20240101000000000000000.bak");
        fs::write(&foreign, b"{}").unwrap();
        fs::write(backups.join("chain_notes.bak"), b"{}").unwrap();

        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let (blocks, pending) = chain.snapshot();
        for _ in 0..3 {
            storage.save(&blocks, &pending).unwrap();
        }

        assert_eq!(storage.list_backups().unwrap().len(), 1);
        assert!(foreign.exists());
    }

    #[test]
    fn test_backup_failure_does_not_block_save() {
        let dir = TempDir::new().unwrap();
        let storage = storage_in(&dir, 3);
        // A plain file where the backup directory belongs.
        fs::write(dir.path().join("backups"), b"in the way").unwrap();

        let chain = Blockchain::new(ChainSettings::default()).unwrap();
        let (blocks, pending) = chain.snapshot();
        storage.save(&blocks, &pending).unwrap();

        let key = generate_signing_key();
        let tx = signed_tx(&key);
        storage.save(&blocks, &[tx.clone()]).unwrap();

        let loaded = storage.load().unwrap().unwrap();
        assert_eq!(loaded.pending_transactions.len(), 1);
        assert_eq!(loaded.pending_transactions[0].id, tx.id);
        assert!(dir.path().join("backups").is_file());
    }
}
