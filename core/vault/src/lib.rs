//! Vault engine for AkraVault.
//!
//! This module provides:
//! - The encrypted catalog of vault items and its persistence
//! - A bounded pool of cipher workers with progress reporting
//! - Single-file and recursive folder encryption and decryption
//! - The [`Vault`] facade tying a session key, catalog and pool together
//!
//! # Architecture
//! The coordinating logic (folder walking, catalog mutation) runs on the
//! async runtime; chunk-level cipher work runs on blocking workers that
//! only ever see paths, the shared key and a progress channel.

pub mod catalog;
pub mod config;
pub mod item;
pub(crate) mod operations;
pub mod progress;
pub mod scheduler;
pub mod vault;
pub(crate) mod walker;

pub use catalog::Catalog;
pub use config::{VaultOptions, DEFAULT_CATALOG_PATH};
pub use item::{ExtraProps, FileItem, FolderItem, ItemMeta, ItemPatch, StorageItem};
pub use progress::{NoopSink, ProgressSink};
pub use scheduler::{CipherTask, PoolSession, TaskKind, TaskPool, TaskScheduler};
pub use vault::Vault;
