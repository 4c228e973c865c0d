//! Cryptographic primitives for AkraVault.
//!
//! This module provides:
//! - Key derivation using Argon2id with a verifier for wrong-password detection
//! - Per-file key derivation using keyed BLAKE2b
//! - Chunk authenticated encryption using XChaCha20-Poly1305
//! - The `AKRA` envelope format and a streaming pipeline over it
//!
//! # Security Guarantees
//! - All key material is automatically zeroized on drop
//! - No plaintext or key material is ever logged
//! - Constant-time operations for sensitive comparisons

pub mod aead;
pub mod envelope;
pub mod kdf;
pub mod keys;
pub mod names;
pub mod stream;

pub use aead::{decrypt_chunk, encrypt_chunk};
pub use envelope::{EnvelopeHeader, FILE_EXTENSION, FORMAT_VERSION, MAGIC};
pub use kdf::{derive_secret_key, CatalogHeader, KdfParams};
pub use keys::{FileKey, Salt, SecretKey, Verifier};
pub use names::{decrypt_name, encrypt_name};
pub use stream::{DecryptingStream, EncryptingStream, DEFAULT_BLOCK_SIZE};
