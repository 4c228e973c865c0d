//! Filesystem collaborators for AkraVault.
//!
//! - [`LocalFs`]: async local filesystem access with blocking helpers for
//!   cipher workers
//! - [`RetryExecutor`]: bounded exponential backoff for resource-busy errors
//! - [`VisibilityToggler`]: hide/reveal of vault artifacts
//!
//! All operations report errors through [`akravault_common::Error`], with
//! transient failures escalated to `FatalIo` once retries are exhausted.

pub mod fs;
pub mod retry;
pub mod visibility;

pub use fs::{DirEntry, FileStat, LocalFs};
pub use retry::{RetryConfig, RetryExecutor};
pub use visibility::{DotfileToggler, VisibilityToggler};
