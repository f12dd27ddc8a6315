//! AES-256-GCM field encryption/decryption
//!
//! Encrypted columns store a single blob:
//! `[lookup hash (32 bytes, optional)] nonce (12 bytes) ciphertext+tag`.
//! The optional hash prefix supports equality lookups on encrypted data
//! and is stripped before decrypting.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};

use crate::error::{AuditError, AuditResult};
use crate::rules::FieldDecryptor;

use super::key_derivation::{derive_key, DerivedKey, KeyDerivationParams};

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

/// Size of the lookup hash carried ahead of the nonce
pub const HASH_PREFIX_SIZE: usize = 32;

/// Encrypt a field value into the column blob layout
///
/// Generates a random nonce for each encryption operation.
pub fn encrypt_field(
    plaintext: &[u8],
    key: &DerivedKey,
    hash_prefix: Option<&[u8; HASH_PREFIX_SIZE]>,
) -> AuditResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| AuditError::Config(format!("Failed to create cipher: {}", e)))?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| AuditError::Decryption(format!("Encryption failed: {}", e)))?;

    let mut blob = Vec::with_capacity(HASH_PREFIX_SIZE + NONCE_SIZE + ciphertext.len());
    if let Some(hash) = hash_prefix {
        blob.extend_from_slice(hash);
    }
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt a column blob produced by [`encrypt_field`]
pub fn decrypt_field(blob: &[u8], key: &DerivedKey, includes_hash: bool) -> AuditResult<Vec<u8>> {
    let payload = if includes_hash {
        blob.get(HASH_PREFIX_SIZE..).ok_or_else(|| {
            AuditError::Decryption(format!(
                "Blob too short for hash prefix: {} bytes",
                blob.len()
            ))
        })?
    } else {
        blob
    };

    if payload.len() < NONCE_SIZE {
        return Err(AuditError::Decryption(format!(
            "Invalid nonce size: expected {}, got {}",
            NONCE_SIZE,
            payload.len()
        )));
    }
    let (nonce_bytes, ciphertext) = payload.split_at(NONCE_SIZE);

    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| AuditError::Config(format!("Failed to create cipher: {}", e)))?;

    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| {
            AuditError::Decryption("Decryption failed: invalid key or corrupted data".to_string())
        })
}

/// [`FieldDecryptor`] backed by AES-256-GCM
#[derive(Debug)]
pub struct AesGcmDecryptor {
    key: DerivedKey,
}

impl AesGcmDecryptor {
    pub fn new(key: DerivedKey) -> Self {
        Self { key }
    }

    /// Derive the key from a passphrase with Argon2id
    pub fn from_passphrase(passphrase: &str, params: &KeyDerivationParams) -> AuditResult<Self> {
        Ok(Self::new(derive_key(passphrase, params)?))
    }
}

impl FieldDecryptor for AesGcmDecryptor {
    fn decrypt(&self, cipher: &[u8], includes_hash: bool) -> AuditResult<Option<String>> {
        let plaintext = decrypt_field(cipher, &self.key, includes_hash)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|e| AuditError::Decryption(format!("Invalid UTF-8 in decrypted data: {}", e)))
    }
}
