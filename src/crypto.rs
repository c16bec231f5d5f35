//! Stateless cryptographic services used across the ledger.
//!
//! Keys and signatures travel through the ledger as lowercase hex strings so that
//! they can be embedded in transactions, blocks and snapshot documents verbatim.
//! Validator private keys are stored encrypted under a shared password using
//! Argon2id for key derivation and AES-256-GCM for sealing.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors that can occur during cryptographic operations.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Hash conversion error")]
    HashConversionError,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Key encryption failed: {0}")]
    KeyEncryptionFailed(String),
    #[error("Key decryption failed")]
    KeyDecryptionFailed,
}

const KEY_ENVELOPE_VERSION: u8 = 0x01;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;

/// SHA-256 of `data`, hex encoded.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Wrapper around an ed25519 verifying key addressed by its hex form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(encoded).map_err(|_| CryptoError::InvalidPublicKey)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        VerifyingKey::from_bytes(&bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    /// Verify a hex-encoded signature over `message`.
    pub fn verify(&self, message: &[u8], signature_hex: &str) -> Result<(), CryptoError> {
        let bytes = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidSignature)?;
        let bytes: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidSignature)?;
        let signature = Signature::from_bytes(&bytes);
        self.0
            .verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl From<VerifyingKey> for PublicKey {
    fn from(vk: VerifyingKey) -> Self {
        PublicKey(vk)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Generate a fresh ed25519 signing key from the OS RNG.
pub fn generate_signing_key() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

pub fn public_key_hex(key: &SigningKey) -> String {
    PublicKey::from(key.verifying_key()).to_hex()
}

/// Sign `message` and return the hex-encoded signature.
pub fn sign_message(key: &SigningKey, message: &[u8]) -> String {
    hex::encode(key.sign(message).to_bytes())
}

/// Returns `false` for malformed keys or signatures instead of erroring.
pub fn verify_message(public_key_hex: &str, message: &[u8], signature_hex: &str) -> bool {
    match PublicKey::from_hex(public_key_hex) {
        Ok(pk) => pk.verify(message, signature_hex).is_ok(),
        Err(_) => false,
    }
}

fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut key = [0u8; 32];
    Argon2::default()
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CryptoError::KeyEncryptionFailed(e.to_string()))?;
    Ok(key)
}

/// Seal a signing key under `password`.
///
/// Layout (hex encoded): `[version: 1][salt: 16][nonce: 12][ciphertext]`.
pub fn encrypt_private_key(key: &SigningKey, password: &str) -> Result<String, CryptoError> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut salt);
    OsRng.fill_bytes(&mut nonce_bytes);

    let mut derived = derive_key(password, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&derived)
        .map_err(|e| CryptoError::KeyEncryptionFailed(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), key.to_bytes().as_ref())
        .map_err(|e| CryptoError::KeyEncryptionFailed(e.to_string()))?;
    derived.iter_mut().for_each(|b| *b = 0);

    let mut envelope = Vec::with_capacity(1 + SALT_LEN + NONCE_LEN + ciphertext.len());
    envelope.push(KEY_ENVELOPE_VERSION);
    envelope.extend_from_slice(&salt);
    envelope.extend_from_slice(&nonce_bytes);
    envelope.extend_from_slice(&ciphertext);
    Ok(hex::encode(envelope))
}

/// Open a key sealed by [`encrypt_private_key`]. Any mismatch (wrong password,
/// tampered envelope, unknown version) is reported as `KeyDecryptionFailed`.
pub fn decrypt_private_key(encrypted: &str, password: &str) -> Result<SigningKey, CryptoError> {
    let envelope = hex::decode(encrypted).map_err(|_| CryptoError::KeyDecryptionFailed)?;
    if envelope.len() <= 1 + SALT_LEN + NONCE_LEN || envelope[0] != KEY_ENVELOPE_VERSION {
        return Err(CryptoError::KeyDecryptionFailed);
    }
    let salt = &envelope[1..1 + SALT_LEN];
    let nonce_bytes = &envelope[1 + SALT_LEN..1 + SALT_LEN + NONCE_LEN];
    let ciphertext = &envelope[1 + SALT_LEN + NONCE_LEN..];

    let mut derived = derive_key(password, salt).map_err(|_| CryptoError::KeyDecryptionFailed)?;
    let cipher =
        Aes256Gcm::new_from_slice(&derived).map_err(|_| CryptoError::KeyDecryptionFailed)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| CryptoError::KeyDecryptionFailed)?;
    derived.iter_mut().for_each(|b| *b = 0);

    let secret: [u8; 32] = plaintext
        .try_into()
        .map_err(|_| CryptoError::InvalidPrivateKey)?;
    Ok(SigningKey::from_bytes(&secret))
}
