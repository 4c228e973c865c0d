//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! XChaCha20-Poly1305 provides both confidentiality and authenticity,
//! with a 24-byte nonce that is safe for random generation.
//!
//! Chunks are framed as `nonce (24) | length (u32 BE) | ciphertext+tag`,
//! where `length` counts the ciphertext and the tag.

use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, AeadCore, KeyInit, OsRng},
    XChaCha20Poly1305,
};

use crate::keys::KEY_LENGTH;
use akravault_common::{Error, Result};

/// Nonce size for XChaCha20-Poly1305 (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Authentication tag size (16 bytes).
pub const TAG_SIZE: usize = 16;

/// Size of the length field in a chunk frame.
pub const LENGTH_SIZE: usize = 4;

/// Bytes preceding the ciphertext in a chunk frame.
pub const FRAME_HEADER_SIZE: usize = NONCE_SIZE + LENGTH_SIZE;

/// Largest plaintext accepted in a single chunk.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;

fn cipher(key: &[u8]) -> Result<XChaCha20Poly1305> {
    if key.len() != KEY_LENGTH {
        return Err(Error::Crypto(format!(
            "Invalid key length: expected {}, got {}",
            KEY_LENGTH,
            key.len()
        )));
    }
    Ok(XChaCha20Poly1305::new(GenericArray::from_slice(key)))
}

/// Encrypt a short message, returning `nonce || ciphertext || tag`.
///
/// Used for values that are not streamed, such as names.
pub fn encrypt(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Decrypt the output of [`encrypt`].
///
/// # Errors
/// - `Format` if the input is shorter than a nonce and a tag
/// - `Integrity` if authentication fails
pub fn decrypt(key: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    let cipher = cipher(key)?;

    if ciphertext.len() < NONCE_SIZE + TAG_SIZE {
        return Err(Error::Format("Ciphertext too short".to_string()));
    }

    let (nonce_bytes, encrypted) = ciphertext.split_at(NONCE_SIZE);

    cipher
        .decrypt(GenericArray::from_slice(nonce_bytes), encrypted)
        .map_err(|_| Error::Integrity("Authentication tag mismatch".to_string()))
}

/// Encrypt one chunk into a self-describing frame.
///
/// # Preconditions
/// - `plaintext.len() <= MAX_CHUNK_SIZE`
///
/// # Postconditions
/// - Frame length is `FRAME_HEADER_SIZE + plaintext.len() + TAG_SIZE`
/// - A fresh random nonce is used for every call
pub fn encrypt_chunk(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if plaintext.len() > MAX_CHUNK_SIZE {
        return Err(Error::InvalidInput(format!(
            "Chunk of {} bytes exceeds the maximum of {}",
            plaintext.len(),
            MAX_CHUNK_SIZE
        )));
    }

    let cipher = cipher(key)?;
    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + ciphertext.len());
    frame.extend_from_slice(&nonce);
    frame.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    frame.extend_from_slice(&ciphertext);

    Ok(frame)
}

/// Read the ciphertext length out of a frame header.
///
/// # Errors
/// - `Format` if the length cannot belong to a valid chunk
pub fn frame_ciphertext_len(header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    let mut len_bytes = [0u8; LENGTH_SIZE];
    len_bytes.copy_from_slice(&header[NONCE_SIZE..]);
    let len = u32::from_be_bytes(len_bytes) as usize;

    if len < TAG_SIZE || len > MAX_CHUNK_SIZE + TAG_SIZE {
        return Err(Error::Format(format!("Invalid chunk length: {}", len)));
    }
    Ok(len)
}

/// Decrypt a single complete frame produced by [`encrypt_chunk`].
///
/// # Errors
/// - `Format` if the length field is invalid
/// - `TruncatedData` if the frame is shorter than its length field says
/// - `Integrity` if authentication fails
pub fn decrypt_chunk(key: &[u8], frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < FRAME_HEADER_SIZE {
        return Err(Error::TruncatedData(format!(
            "Frame of {} bytes has no complete header",
            frame.len()
        )));
    }

    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
    let len = frame_ciphertext_len(&header)?;

    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() < len {
        return Err(Error::TruncatedData(format!(
            "Frame declares {} bytes but only {} are present",
            len,
            body.len()
        )));
    }
    if body.len() > len {
        return Err(Error::Format(format!(
            "{} trailing bytes after frame",
            body.len() - len
        )));
    }

    let cipher = cipher(key)?;
    cipher
        .decrypt(GenericArray::from_slice(&header[..NONCE_SIZE]), body)
        .map_err(|_| Error::Integrity("Chunk authentication failed".to_string()))
}
