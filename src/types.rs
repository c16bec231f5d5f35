//! Core ledger data model.
//!
//! This module contains the transaction and block types anchored in the chain,
//! together with their canonical signable content, hashing and signature
//! helpers.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

use crate::crypto::{self, CryptoError};

/// Validator identity recorded on the genesis block.
pub const GENESIS_VALIDATOR: &str = "GENESIS";
/// `previous_hash` of the genesis block.
pub const GENESIS_PREVIOUS_HASH: &str = "0";

/// Render a timestamp the way it enters signable content.
pub fn iso8601(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Current time truncated to millisecond precision.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// Lifecycle events that can be anchored in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    ShipmentCreated,
    StatusUpdated,
    DeliveryConfirmed,
    PaymentInitiated,
    PaymentCompleted,
    SupplierVerified,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::ShipmentCreated => "ShipmentCreated",
            TransactionType::StatusUpdated => "StatusUpdated",
            TransactionType::DeliveryConfirmed => "DeliveryConfirmed",
            TransactionType::PaymentInitiated => "PaymentInitiated",
            TransactionType::PaymentCompleted => "PaymentCompleted",
            TransactionType::SupplierVerified => "SupplierVerified",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ShipmentCreated" => Ok(TransactionType::ShipmentCreated),
            "StatusUpdated" => Ok(TransactionType::StatusUpdated),
            "DeliveryConfirmed" => Ok(TransactionType::DeliveryConfirmed),
            "PaymentInitiated" => Ok(TransactionType::PaymentInitiated),
            "PaymentCompleted" => Ok(TransactionType::PaymentCompleted),
            "SupplierVerified" => Ok(TransactionType::SupplierVerified),
            other => Err(format!("Unknown transaction type: {}", other)),
        }
    }
}

/// A signed, typed ledger event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    #[serde(rename = "type")]
    pub tx_type: TransactionType,
    pub timestamp: DateTime<Utc>,
    /// Hex-encoded ed25519 public key of the submitter
    pub sender_public_key: String,
    /// Opaque payload, JSON by convention
    pub payload_data: String,
    /// Hex-encoded signature over [`Transaction::signable_content`]
    pub signature: String,
}

impl Transaction {
    /// Build an unsigned transaction with a fresh id and the current time.
    pub fn new(
        tx_type: TransactionType,
        sender_public_key: impl Into<String>,
        payload_data: impl Into<String>,
    ) -> Self {
        Transaction {
            id: Uuid::new_v4().to_string(),
            tx_type,
            timestamp: now(),
            sender_public_key: sender_public_key.into(),
            payload_data: payload_data.into(),
            signature: String::new(),
        }
    }

    /// Deterministic concatenation of id, type, timestamp, sender key and payload.
    pub fn signable_content(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.id,
            self.tx_type,
            iso8601(&self.timestamp),
            self.sender_public_key,
            self.payload_data
        )
    }

    pub fn sign(&mut self, private_key: &SigningKey) {
        self.signature = crypto::sign_message(private_key, self.signable_content().as_bytes());
    }

    pub fn verify_signature(&self) -> bool {
        if self.signature.is_empty() {
            return false;
        }
        crypto::verify_message(
            &self.sender_public_key,
            self.signable_content().as_bytes(),
            &self.signature,
        )
    }
}

/// An immutable, hash-linked, validator-signed batch of transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Sequential block number starting from 0 (genesis)
    pub index: u64,
    pub timestamp: DateTime<Utc>,
    pub transactions: Vec<Transaction>,
    pub previous_hash: String,
    /// Hex SHA-256 of the block content, see [`Block::calculate_hash`]
    pub hash: String,
    /// Unused under proof-of-authority, kept in the hashed content
    pub nonce: u64,
    pub validator_public_key: String,
    pub validator_signature: String,
}

impl Block {
    /// The deterministic first block of every chain.
    pub fn genesis() -> Result<Block, CryptoError> {
        let mut block = Block {
            index: 0,
            timestamp: DateTime::<Utc>::default(),
            transactions: Vec::new(),
            previous_hash: GENESIS_PREVIOUS_HASH.to_string(),
            hash: String::new(),
            nonce: 0,
            validator_public_key: GENESIS_VALIDATOR.to_string(),
            validator_signature: String::new(),
        };
        block.hash = block.calculate_hash()?;
        Ok(block)
    }

    /// Calculate the SHA-256 hash of the block.
    ///
    /// Covers every field except `hash` and `validator_signature`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::HashConversionError` if serialization fails.
    pub fn calculate_hash(&self) -> Result<String, CryptoError> {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(iso8601(&self.timestamp).as_bytes());
        hasher.update(self.previous_hash.as_bytes());
        hasher.update(self.nonce.to_le_bytes());
        hasher.update(self.validator_public_key.as_bytes());

        let serialized_txns =
            bincode::serialize(&self.transactions).map_err(|_| CryptoError::HashConversionError)?;
        hasher.update(serialized_txns);

        Ok(hex::encode(hasher.finalize()))
    }

    /// Content covered by the validator signature: index, hash, timestamp, validator key.
    pub fn validator_signable_content(&self) -> String {
        format!(
            "{}{}{}{}",
            self.index,
            self.hash,
            iso8601(&self.timestamp),
            self.validator_public_key
        )
    }

    pub fn sign(&mut self, validator_key: &SigningKey) {
        self.validator_signature = crypto::sign_message(
            validator_key,
            self.validator_signable_content().as_bytes(),
        );
    }

    pub fn verify_validator_signature(&self) -> bool {
        crypto::verify_message(
            &self.validator_public_key,
            self.validator_signable_content().as_bytes(),
            &self.validator_signature,
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0 && self.validator_public_key == GENESIS_VALIDATOR
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{generate_signing_key, public_key_hex};

    fn signed_tx(key: &SigningKey, payload: &str) -> Transaction {
        let mut tx = Transaction::new(
            TransactionType::ShipmentCreated,
            public_key_hex(key),
            payload,
        );
        tx.sign(key);
        tx
    }

    #[test]
    fn test_genesis_is_deterministic() {
        let a = Block::genesis().unwrap();
        let b = Block::genesis().unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.previous_hash, "0");
        assert!(a.transactions.is_empty());
        assert!(a.is_genesis());
    }

    #[test]
    fn test_block_hash_calculation() {
        let key = generate_signing_key();
        let block = Block {
            index: 1,
            timestamp: now(),
            transactions: vec![signed_tx(&key, r#"{"shipmentId":"S-1"}"#)],
            previous_hash: Block::genesis().unwrap().hash,
            hash: String::new(),
            nonce: 0,
            validator_public_key: public_key_hex(&key),
            validator_signature: String::new(),
        };

        let hash1 = block.calculate_hash().unwrap();
        assert_eq!(hash1, block.clone().calculate_hash().unwrap());

        let mut modified = block.clone();
        modified.index = 2;
        assert_ne!(hash1, modified.calculate_hash().unwrap());

        let mut tampered = block.clone();
        tampered.transactions[0].payload_data = r#"{"shipmentId":"S-2"}"#.to_string();
        assert_ne!(hash1, tampered.calculate_hash().unwrap());

        // the signature is not part of the hashed content
        let mut signed = block.clone();
        signed.validator_signature = "ab".repeat(64);
        assert_eq!(hash1, signed.calculate_hash().unwrap());
    }

    #[test]
    fn test_transaction_signing_and_verification() {
        let key = generate_signing_key();
        let mut tx = Transaction::new(
            TransactionType::StatusUpdated,
            public_key_hex(&key),
            r#"{"shipmentId":"S-1","status":"Validated"}"#,
        );

        assert!(!tx.verify_signature());
        tx.sign(&key);
        assert!(tx.verify_signature());

        let mut tampered = tx.clone();
        tampered.payload_data.push(' ');
        assert!(!tampered.verify_signature());

        let mut wrong_sender = tx.clone();
        wrong_sender.sender_public_key = public_key_hex(&generate_signing_key());
        assert!(!wrong_sender.verify_signature());
    }

    #[test]
    fn test_block_signature_covers_header() {
        let key = generate_signing_key();
        let mut block = Block::genesis().unwrap();
        block.index = 1;
        block.validator_public_key = public_key_hex(&key);
        block.hash = block.calculate_hash().unwrap();
        block.sign(&key);
        assert!(block.verify_validator_signature());

        block.index = 2;
        assert!(!block.verify_validator_signature());
    }

    #[test]
    fn test_transaction_json_shape() {
        let key = generate_signing_key();
        let tx = signed_tx(&key, "{}");
        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["type"], "ShipmentCreated");
        assert!(json.get("senderPublicKey").is_some());
        assert!(json.get("payloadData").is_some());

        let back: Transaction = serde_json::from_value(json).unwrap();
        assert_eq!(back, tx);
        assert!(back.verify_signature());
    }
}
