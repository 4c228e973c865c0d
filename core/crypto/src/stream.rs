//! Streaming encryption for large files.
//!
//! Files are processed block by block so memory stays bounded by the block
//! size. On encryption every block becomes exactly one chunk. On decryption
//! reads of any size are accumulated and chunks are emitted as soon as a
//! complete frame is buffered.

use std::io::{ErrorKind, Read, Write};
use tracing::trace;

use crate::aead::{
    decrypt_chunk, encrypt_chunk, frame_ciphertext_len, FRAME_HEADER_SIZE, MAX_CHUNK_SIZE,
};
use crate::envelope::EnvelopeHeader;
use crate::keys::SecretKey;
use akravault_common::{Error, Result};

/// Default block size for streaming encryption (512 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 512 * 1024;

/// Read buffer used while decrypting.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Encrypting stream that processes data in blocks.
pub struct EncryptingStream<'a> {
    secret: &'a SecretKey,
    block_size: usize,
}

impl<'a> EncryptingStream<'a> {
    /// Create a new encrypting stream using the default block size.
    pub fn new(secret: &'a SecretKey) -> Self {
        Self {
            secret,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    /// Set a custom block size.
    pub fn with_block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Encrypt data from reader and write it to writer.
    ///
    /// Writes the envelope header once, then one chunk per block. An empty
    /// input produces a header with no chunks. `on_progress` receives the
    /// cumulative number of plaintext bytes after each chunk.
    ///
    /// Returns the number of plaintext bytes processed.
    ///
    /// # Errors
    /// - `InvalidInput` if the block size is zero or above the chunk limit
    /// - I/O errors from reader/writer
    pub fn encrypt_stream<R, W, F>(&self, mut reader: R, mut writer: W, mut on_progress: F) -> Result<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(u64),
    {
        if self.block_size == 0 || self.block_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "Block size must be between 1 and {}, got {}",
                MAX_CHUNK_SIZE, self.block_size
            )));
        }

        let header = EnvelopeHeader::generate();
        let file_key = self.secret.derive_file_key(&header.salt)?;
        header.write_to(&mut writer)?;

        let mut buffer = vec![0u8; self.block_size];
        let mut total_bytes = 0u64;
        let mut chunks = 0u64;

        loop {
            let bytes_read = fill_block(&mut reader, &mut buffer)?;
            if bytes_read == 0 {
                break;
            }

            let frame = encrypt_chunk(file_key.as_bytes(), &buffer[..bytes_read])?;
            writer.write_all(&frame)?;

            total_bytes += bytes_read as u64;
            chunks += 1;
            trace!(chunk = chunks, bytes = bytes_read, "Encrypted chunk");
            on_progress(total_bytes);

            if bytes_read < self.block_size {
                break;
            }
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Decrypting stream that processes encrypted chunks.
pub struct DecryptingStream<'a> {
    secret: &'a SecretKey,
}

impl<'a> DecryptingStream<'a> {
    /// Create a new decrypting stream.
    pub fn new(secret: &'a SecretKey) -> Self {
        Self { secret }
    }

    /// Decrypt data from reader and write the plaintext to writer.
    ///
    /// `on_progress` receives the cumulative number of encrypted bytes
    /// consumed (header included), so the final value equals the size of
    /// the encrypted input.
    ///
    /// Returns the number of plaintext bytes written.
    ///
    /// # Errors
    /// - `Format` if the input is not an encrypted file or a frame is invalid
    /// - `TruncatedData` if the input ends inside a chunk
    /// - `Integrity` if any chunk fails authentication
    pub fn decrypt_stream<R, W, F>(&self, mut reader: R, mut writer: W, mut on_progress: F) -> Result<u64>
    where
        R: Read,
        W: Write,
        F: FnMut(u64),
    {
        let (header, header_len) = EnvelopeHeader::read_from(&mut reader)?;
        let file_key = self.secret.derive_file_key(&header.salt)?;

        let mut consumed = header_len;
        on_progress(consumed);

        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut pending: Vec<u8> = Vec::with_capacity(READ_BUFFER_SIZE);
        let mut total_bytes = 0u64;
        let mut chunks = 0u64;

        loop {
            let n = match reader.read(&mut read_buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            };
            pending.extend_from_slice(&read_buf[..n]);

            // Emit every complete frame currently buffered
            loop {
                let Some(frame_len) = complete_frame_len(&pending)? else {
                    break;
                };

                let plaintext = decrypt_chunk(file_key.as_bytes(), &pending[..frame_len])?;
                writer.write_all(&plaintext)?;
                pending.drain(..frame_len);

                total_bytes += plaintext.len() as u64;
                consumed += frame_len as u64;
                chunks += 1;
                trace!(chunk = chunks, bytes = plaintext.len(), "Decrypted chunk");
                on_progress(consumed);
            }
        }

        if !pending.is_empty() {
            return Err(Error::TruncatedData(format!(
                "{} bytes of an incomplete chunk at end of stream",
                pending.len()
            )));
        }

        writer.flush()?;
        Ok(total_bytes)
    }
}

/// Length of the first frame in `buf` if it is fully buffered.
fn complete_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Ok(None);
    }
    let mut header = [0u8; FRAME_HEADER_SIZE];
    header.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
    let total = FRAME_HEADER_SIZE + frame_ciphertext_len(&header)?;
    Ok((buf.len() >= total).then_some(total))
}

/// Read until `buf` is full or the reader is exhausted.
fn fill_block<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
