//! Common error types for AkraVault.

use std::io;
use thiserror::Error;

/// Windows `ERROR_SHARING_VIOLATION`, reported when another process holds the file open.
const WINDOWS_SHARING_VIOLATION: i32 = 32;

/// POSIX `EBUSY`.
const EBUSY: i32 = 16;

/// Top-level error type for AkraVault operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Input is not in the expected encrypted file or catalog format.
    #[error("Format error: {0}")]
    Format(String),

    /// The encrypted stream ended in the middle of a chunk.
    #[error("Truncated data: {0}")]
    TruncatedData(String),

    /// Authentication tag did not verify (wrong key or tampered bytes).
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Passphrase does not match the catalog verifier.
    #[error("Wrong password")]
    WrongPassword,

    /// KDF parameters are below the accepted security floor.
    #[error("Insecure parameters: {0}")]
    InsecureParameters(String),

    /// The item is already encrypted or already tracked by the catalog.
    #[error("Already encrypted: {0}")]
    AlreadyEncrypted(String),

    /// Catalog file is inconsistent and cannot be trusted.
    #[error("Corrupt catalog: {0}")]
    CorruptCatalog(String),

    /// Temporary I/O failure that may succeed when retried.
    #[error("Transient I/O error: {context}: {source}")]
    TransientIo {
        context: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure that will not go away by retrying.
    #[error("Fatal I/O error: {context}: {source}")]
    FatalIo {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Internal invariant was violated.
    #[error("Should not occur: {0}")]
    ShouldNotOccur(String),
}

impl Error {
    /// Classify an I/O error raised while performing `context`.
    ///
    /// Resource-busy conditions become [`Error::TransientIo`], permission
    /// problems become [`Error::FatalIo`], everything else stays [`Error::Io`].
    pub fn from_io(source: io::Error, context: impl Into<String>) -> Self {
        if is_busy(&source) {
            Self::TransientIo {
                context: context.into(),
                source,
            }
        } else if source.kind() == io::ErrorKind::PermissionDenied {
            Self::FatalIo {
                context: context.into(),
                source,
            }
        } else {
            Self::Io(source)
        }
    }

    /// Whether the operation that produced this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo { .. })
    }

    /// Promote a transient error to a fatal one once retries are exhausted.
    pub fn into_fatal(self) -> Self {
        match self {
            Self::TransientIo { context, source } => Self::FatalIo { context, source },
            other => other,
        }
    }
}

fn is_busy(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::ResourceBusy
        || matches!(err.raw_os_error(), Some(code) if code == EBUSY || (cfg!(windows) && code == WINDOWS_SHARING_VIOLATION))
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
