//! Cryptographic support for decrypt rules
//!
//! Provides AES-256-GCM column decryption with Argon2id key derivation.

pub mod encryption;
pub mod key_derivation;

pub use encryption::{decrypt_field, encrypt_field, AesGcmDecryptor, HASH_PREFIX_SIZE};
pub use key_derivation::{derive_key, DerivedKey, KeyDerivationParams};
