//! Key derivation using Argon2id.
//!
//! Argon2id is a memory-hard password hashing function that provides
//! resistance to both GPU and time-memory trade-off attacks.

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::{Salt, SecretKey, Verifier, KEY_LENGTH};
use akravault_common::{Error, Result, SensitiveBytes};

/// Algorithm id persisted in the catalog header for Argon2id v1.3.
pub const ALG_ARGON2ID13: u8 = 2;

const MIB: u64 = 1024 * 1024;

/// Parameters for Argon2id key derivation.
///
/// `memlimit` is expressed in bytes and converted to KiB for Argon2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Number of passes over memory (Argon2 time cost).
    pub opslimit: u64,
    /// Memory in bytes.
    pub memlimit: u64,
}

impl KdfParams {
    /// Fast parameters for interactive use. Below the accepted floor.
    pub fn interactive() -> Self {
        Self {
            opslimit: 2,
            memlimit: 64 * MIB,
        }
    }

    /// Moderate parameters. This is the minimum accepted.
    pub fn moderate() -> Self {
        Self {
            opslimit: 3,
            memlimit: 256 * MIB,
        }
    }

    /// Higher security parameters that may take several seconds.
    pub fn sensitive() -> Self {
        Self {
            opslimit: 4,
            memlimit: 1024 * MIB,
        }
    }

    /// Fail with [`Error::InsecureParameters`] if below the moderate preset.
    pub fn check_floor(&self) -> Result<()> {
        let floor = Self::moderate();
        if self.opslimit < floor.opslimit || self.memlimit < floor.memlimit {
            return Err(Error::InsecureParameters(format!(
                "opslimit={} memlimit={} is below the minimum opslimit={} memlimit={}",
                self.opslimit, self.memlimit, floor.opslimit, floor.memlimit
            )));
        }
        Ok(())
    }

    fn to_argon2(self) -> Result<Params> {
        let t_cost = u32::try_from(self.opslimit)
            .map_err(|_| Error::InvalidInput(format!("opslimit too large: {}", self.opslimit)))?;
        let m_cost = u32::try_from(self.memlimit / 1024)
            .map_err(|_| Error::InvalidInput(format!("memlimit too large: {}", self.memlimit)))?;

        Params::new(m_cost, t_cost, 1, Some(KEY_LENGTH))
            .map_err(|e| Error::Crypto(format!("Invalid KDF parameters: {}", e)))
    }
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::moderate()
    }
}

/// Header stored at the front of the catalog file.
///
/// The verifier is written once, the first time a key is derived
/// against this header, and never changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogHeader {
    /// KDF algorithm id.
    pub kdf: u8,
    /// Argon2 time cost.
    pub opslimit: u64,
    /// Argon2 memory in bytes.
    pub memlimit: u64,
    /// Passphrase salt.
    pub salt: Salt,
    /// Keyed hash of the derived secret key.
    pub verifier: Option<Verifier>,
}

impl CatalogHeader {
    /// Create a fresh header with a random salt and no verifier.
    pub fn new(params: KdfParams) -> Self {
        Self {
            kdf: ALG_ARGON2ID13,
            opslimit: params.opslimit,
            memlimit: params.memlimit,
            salt: Salt::generate(),
            verifier: None,
        }
    }

    /// KDF parameters recorded in this header.
    pub fn params(&self) -> KdfParams {
        KdfParams {
            opslimit: self.opslimit,
            memlimit: self.memlimit,
        }
    }
}

/// Derive the vault secret key from a passphrase.
///
/// The passphrase is consumed and wiped on return, whatever the outcome.
///
/// Returns the key together with the verifier to persist when the header
/// does not carry one yet. When it does, the derived key is checked
/// against it and a mismatch yields [`Error::WrongPassword`].
///
/// # Errors
/// - `InvalidInput` if the passphrase is empty
/// - `Crypto` if the header names an unsupported algorithm
/// - `InsecureParameters` if the header parameters are below the floor
/// - `WrongPassword` if the verifier does not match
pub fn derive_secret_key(
    passphrase: SensitiveBytes,
    header: &CatalogHeader,
) -> Result<(SecretKey, Option<Verifier>)> {
    if passphrase.is_empty() {
        return Err(Error::InvalidInput("Passphrase cannot be empty".to_string()));
    }
    if header.kdf != ALG_ARGON2ID13 {
        return Err(Error::Crypto(format!(
            "Unsupported KDF algorithm id: {}",
            header.kdf
        )));
    }

    let params = header.params();
    params.check_floor()?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params.to_argon2()?);

    let mut key_bytes = [0u8; KEY_LENGTH];
    argon2
        .hash_password_into(passphrase.as_bytes(), header.salt.as_bytes(), &mut key_bytes)
        .map_err(|e| Error::Crypto(format!("Key derivation failed: {}", e)))?;
    drop(passphrase);

    let key = SecretKey::from_bytes(key_bytes);
    let derived = key.verifier()?;

    match &header.verifier {
        Some(stored) if stored.matches(&derived) => {
            debug!("Passphrase verified against catalog header");
            Ok((key, None))
        }
        Some(_) => Err(Error::WrongPassword),
        None => {
            debug!("No verifier in catalog header, returning a new one");
            Ok((key, Some(derived)))
        }
    }
}
