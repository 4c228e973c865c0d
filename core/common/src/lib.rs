//! Common utilities and types shared across AkraVault modules.
//!
//! This module provides the error taxonomy used by every layer of the
//! vault engine and a handful of small foundational types.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ItemId, SensitiveBytes};
