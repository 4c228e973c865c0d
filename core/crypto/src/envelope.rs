//! Encrypted file envelope.
//!
//! Layout:
//! ```text
//! MAGIC "AKRA" (4) | VERSION (1) | HEADER_LEN (u32 BE) | HEADER (JSON) | chunk*
//! ```
//! The JSON header carries the per-file salt (hex) and the format version.
//! Chunks follow the framing in [`crate::aead`].

use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Read, Write};

use crate::keys::Salt;
use akravault_common::{Error, Result};

/// Magic bytes at the start of every encrypted file.
pub const MAGIC: [u8; 4] = *b"AKRA";

/// Current envelope format version.
pub const FORMAT_VERSION: u8 = 1;

/// File extension of encrypted files, without the dot.
pub const FILE_EXTENSION: &str = "akra";

/// Size of the fixed prefix: magic, version byte and header length.
pub const PREFIX_SIZE: usize = MAGIC.len() + 1 + 4;

/// Upper bound on the JSON header length.
pub const MAX_HEADER_LEN: usize = 4096;

/// Per-file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    /// Salt the file key is derived from.
    pub salt: Salt,
    /// Format version.
    pub version: u8,
}

impl EnvelopeHeader {
    /// Header for a new file with a fresh random salt.
    pub fn generate() -> Self {
        Self {
            salt: Salt::generate(),
            version: FORMAT_VERSION,
        }
    }

    /// Encode the header with its fixed prefix.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| Error::Serialization(format!("Envelope header: {}", e)))?;

        let mut out = Vec::with_capacity(PREFIX_SIZE + json.len());
        out.extend_from_slice(&MAGIC);
        out.push(self.version);
        out.extend_from_slice(&(json.len() as u32).to_be_bytes());
        out.extend_from_slice(&json);
        Ok(out)
    }

    /// Write the header to `writer`, returning the number of bytes written.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        let bytes = self.to_bytes()?;
        writer.write_all(&bytes)?;
        Ok(bytes.len() as u64)
    }

    /// Read a header from the front of `reader`.
    ///
    /// Returns the header and the number of bytes consumed.
    ///
    /// # Errors
    /// - `Format` on magic mismatch, unsupported version, or a truncated or
    ///   malformed header
    pub fn read_from<R: Read>(reader: &mut R) -> Result<(Self, u64)> {
        let mut prefix = [0u8; PREFIX_SIZE];
        read_exact_or_format(reader, &mut prefix, "envelope prefix")?;

        if prefix[..MAGIC.len()] != MAGIC {
            return Err(Error::Format("Not an encrypted file (magic mismatch)".to_string()));
        }
        let version = prefix[MAGIC.len()];
        if version != FORMAT_VERSION {
            return Err(Error::Format(format!("Unsupported format version: {}", version)));
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&prefix[MAGIC.len() + 1..]);
        let header_len = u32::from_be_bytes(len_bytes) as usize;
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(Error::Format(format!("Invalid header length: {}", header_len)));
        }

        let mut json = vec![0u8; header_len];
        read_exact_or_format(reader, &mut json, "envelope header")?;

        let header: EnvelopeHeader = serde_json::from_slice(&json)
            .map_err(|e| Error::Format(format!("Malformed envelope header: {}", e)))?;
        if header.version != version {
            return Err(Error::Format(format!(
                "Header version {} does not match prefix version {}",
                header.version, version
            )));
        }

        Ok((header, (PREFIX_SIZE + header_len) as u64))
    }

    /// Parse a header from a byte slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, u64)> {
        let mut cursor = bytes;
        Self::read_from(&mut cursor)
    }
}

/// Whether `prefix` starts with the envelope magic.
pub fn has_magic(prefix: &[u8]) -> bool {
    prefix.len() >= MAGIC.len() && prefix[..MAGIC.len()] == MAGIC
}

fn read_exact_or_format<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::Format(format!("Truncated {}", what))
        } else {
            Error::Io(e)
        }
    })
}
