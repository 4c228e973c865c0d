//! File and folder name encryption.
//!
//! An encrypted name is URL-safe base64 (no padding) of
//! `salt (16) | nonce (24) | ciphertext+tag`. The salt selects the file key,
//! so every name is encrypted under its own key.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::aead;
use crate::keys::{Salt, SecretKey, SALT_LENGTH};
use akravault_common::{Error, Result};

/// Encrypt a display name.
pub fn encrypt_name(secret: &SecretKey, name: &str) -> Result<String> {
    let salt = Salt::generate();
    let file_key = secret.derive_file_key(&salt)?;
    let sealed = aead::encrypt(file_key.as_bytes(), name.as_bytes())?;

    let mut blob = Vec::with_capacity(SALT_LENGTH + sealed.len());
    blob.extend_from_slice(salt.as_bytes());
    blob.extend_from_slice(&sealed);

    Ok(URL_SAFE_NO_PAD.encode(blob))
}

/// Decrypt a name produced by [`encrypt_name`].
///
/// # Errors
/// - `Format` if the value is not valid base64, too short, or not UTF-8
/// - `Integrity` if authentication fails
pub fn decrypt_name(secret: &SecretKey, encrypted: &str) -> Result<String> {
    let blob = URL_SAFE_NO_PAD
        .decode(encrypted)
        .map_err(|e| Error::Format(format!("Encrypted name is not valid base64: {}", e)))?;
    if blob.len() < SALT_LENGTH {
        return Err(Error::Format("Encrypted name too short".to_string()));
    }

    let (salt_bytes, sealed) = blob.split_at(SALT_LENGTH);
    let file_key = secret.derive_file_key(&Salt::from_slice(salt_bytes)?)?;
    let plaintext = aead::decrypt(file_key.as_bytes(), sealed)?;

    String::from_utf8(plaintext)
        .map_err(|_| Error::Format("Decrypted name is not valid UTF-8".to_string()))
}
