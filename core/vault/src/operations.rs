//! Single-file encryption and decryption.
//!
//! Cipher output always goes to a temporary file first and is moved into
//! place only once the task has succeeded, so a failure never leaves a
//! half-written artifact next to the user's data. Temporary files live in
//! a scratch directory private to the operation, removed when it ends.

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::VaultOptions;
use crate::item::{ExtraProps, FileItem, ItemMeta, StorageItem};
use crate::progress::ProgressSink;
use crate::scheduler::{CipherTask, TaskKind, TaskScheduler};
use akravault_common::{Error, ItemId, Result};
use akravault_crypto::envelope::has_magic;
use akravault_crypto::{decrypt_name, encrypt_name, SecretKey, FILE_EXTENSION, MAGIC};
use akravault_storage::fs::file_name;
use akravault_storage::LocalFs;

/// Accumulates byte progress across every task of one operation.
pub(crate) struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    processed: AtomicU64,
    total: u64,
}

impl<'a> ProgressTracker<'a> {
    pub(crate) fn new(sink: &'a dyn ProgressSink, total: u64) -> Self {
        Self {
            sink,
            processed: AtomicU64::new(0),
            total,
        }
    }

    fn advance(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        let processed = self.processed.fetch_add(delta, Ordering::SeqCst) + delta;
        self.sink.on_progress(processed, self.total);
    }
}

/// Everything an operation needs, borrowed from the vault for its duration.
pub(crate) struct OpContext<'a> {
    pub key: Arc<SecretKey>,
    pub options: &'a VaultOptions,
    pub fs: &'a LocalFs,
    pub catalog: &'a RwLock<Catalog>,
    pub scheduler: Arc<TaskScheduler>,
    pub progress: ProgressTracker<'a>,
    /// Private directory under `options.temp_dir` for this operation.
    pub scratch: PathBuf,
}

impl OpContext<'_> {
    /// Unique path in the scratch directory for output derived from `name`.
    pub fn temp_path(&self, name: &str) -> PathBuf {
        self.scratch
            .join(format!("{}-{}.{}.tmp", name, Uuid::new_v4(), FILE_EXTENSION))
    }

    /// Remove the scratch directory and anything left in it.
    pub async fn release(self) {
        self.discard(&self.scratch).await;
    }

    /// An id unused by the catalog.
    pub async fn fresh_id(&self) -> ItemId {
        self.catalog.read().await.fresh_id()
    }

    /// Run one cipher task, feeding its progress into the tracker.
    pub async fn run_task(&self, kind: TaskKind, source: &Path, dest: &Path) -> Result<u64> {
        let progress = &self.progress;
        let mut last = 0u64;
        let task = CipherTask {
            kind,
            source: source.to_path_buf(),
            dest: dest.to_path_buf(),
            key: self.key.clone(),
            block_size: self.options.block_size,
        };

        self.scheduler
            .run(task, move |bytes| {
                progress.advance(bytes.saturating_sub(last));
                last = bytes;
            })
            .await
    }

    /// Best-effort removal of leftovers after a failure.
    pub async fn discard(&self, path: &Path) {
        if let Err(e) = self.fs.remove(path).await {
            if !matches!(e, Error::NotFound(_)) {
                warn!(path = %path.display(), error = %e, "Could not clean up");
            }
        }
    }

    /// Apply the extra-properties policy.
    pub fn accept_extra_props(&self, extra_props: Option<ExtraProps>) -> Option<ExtraProps> {
        match extra_props {
            Some(_) if !self.options.allow_extra_props => {
                warn!("Extra properties are not allowed, set allow_extra_props to keep them");
                None
            }
            other => other,
        }
    }
}

/// Name of the encrypted artifact for a file id.
pub(crate) fn file_artifact_name(id: &ItemId) -> String {
    format!("{}.{}", id, FILE_EXTENSION)
}

/// Catalog id encoded in an artifact path (`[.]<id>[.akra]`).
pub(crate) fn id_from_artifact(path: &Path) -> Result<ItemId> {
    let name = file_name(path)?;
    let suffix = format!(".{}", FILE_EXTENSION);
    let stem = name.strip_suffix(suffix.as_str()).unwrap_or(&name);
    let stem = stem.strip_prefix('.').unwrap_or(stem);

    ItemId::new(stem).map_err(|_| Error::NotFound(format!("No catalog id in {}", path.display())))
}

fn parent_of(path: &Path) -> Result<PathBuf> {
    path.parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::InvalidInput(format!("Path has no parent: {}", path.display())))
}

/// Encrypt `path` into a temporary file and build its record.
///
/// Returns the record and the temporary output; nothing next to `path`
/// has been touched yet.
async fn encrypt_to_temp(
    ctx: &OpContext<'_>,
    path: &Path,
    id: ItemId,
    record_dir: &Path,
) -> Result<(FileItem, PathBuf)> {
    let name = file_name(path)?;

    let magic = ctx.fs.read_magic(path, MAGIC.len()).await?;
    if has_magic(&magic) {
        return Err(Error::AlreadyEncrypted(path.display().to_string()));
    }
    let size = ctx.fs.stat(path).await?.size;

    let tmp = ctx.temp_path(&name);
    if let Err(e) = ctx.run_task(TaskKind::Encrypt, path, &tmp).await {
        ctx.discard(&tmp).await;
        return Err(e);
    }

    let encrypted_name = match encrypt_name(&ctx.key, &name) {
        Ok(encrypted) => encrypted,
        Err(e) => {
            ctx.discard(&tmp).await;
            return Err(e);
        }
    };

    let item = FileItem {
        meta: ItemMeta {
            id,
            encrypted_name,
            original_name: Some(name),
            path: record_dir.to_path_buf(),
            size,
            encrypted_at: Utc::now(),
            is_hidden: false,
            extra_props: None,
        },
    };
    Ok((item, tmp))
}

/// Encrypt a file inside a working copy, replacing it with `<id>.akra`.
///
/// The record is not added to the catalog; it becomes part of the
/// enclosing folder's content.
pub(crate) async fn encrypt_nested_file(
    ctx: &OpContext<'_>,
    path: &Path,
    record_dir: &Path,
) -> Result<FileItem> {
    let id = ctx.fresh_id().await;
    let (item, tmp) = encrypt_to_temp(ctx, path, id, record_dir).await?;

    let dest = parent_of(path)?.join(file_artifact_name(&item.meta.id));
    if let Err(e) = ctx.fs.move_item(&tmp, &dest).await {
        ctx.discard(&tmp).await;
        return Err(e);
    }
    ctx.fs.remove(path).await?;

    debug!(id = %item.meta.id, "Nested file encrypted");
    Ok(item)
}

/// Encrypt a file, record it in the catalog and replace it with `<id>.akra`.
///
/// If anything fails after the record was written, the record is removed
/// again and the original file is left in place.
pub(crate) async fn encrypt_file(
    ctx: &OpContext<'_>,
    path: &Path,
    extra_props: Option<ExtraProps>,
) -> Result<StorageItem> {
    let dir = parent_of(path)?;
    let id = ctx.fresh_id().await;
    let (mut item, tmp) = encrypt_to_temp(ctx, path, id, &dir).await?;
    item.meta.extra_props = ctx.accept_extra_props(extra_props);

    let stored = match ctx.catalog.write().await.set(StorageItem::File(item)).await {
        Ok(stored) => stored,
        Err(e) => {
            ctx.discard(&tmp).await;
            return Err(e);
        }
    };

    let dest = dir.join(stored.artifact_name());
    let placed = async {
        ctx.fs.move_item(&tmp, &dest).await?;
        ctx.fs.remove(path).await
    }
    .await;

    if let Err(e) = placed {
        warn!(id = %stored.id(), error = %e, "Rolling back catalog record");
        if let Err(rollback) = ctx.catalog.write().await.delete(stored.id()).await {
            warn!(id = %stored.id(), error = %rollback, "Rollback failed");
        }
        ctx.discard(&tmp).await;
        if ctx.fs.exists(path).await.unwrap_or(false) {
            ctx.discard(&dest).await;
        }
        return Err(e);
    }

    info!(id = %stored.id(), path = %path.display(), "File encrypted");
    Ok(stored)
}

/// Restore an encrypted file next to itself under its original name.
///
/// Returns the restored path. The catalog is not touched.
pub(crate) async fn decrypt_file_item(
    ctx: &OpContext<'_>,
    encrypted_path: &Path,
    item: &FileItem,
) -> Result<PathBuf> {
    let name = decrypt_name(&ctx.key, &item.meta.encrypted_name)?;
    let dest = parent_of(encrypted_path)?.join(&name);
    if ctx.fs.exists(&dest).await? {
        return Err(Error::AlreadyExists(dest.display().to_string()));
    }

    let tmp = ctx.temp_path(&item.meta.id.to_string());
    if let Err(e) = ctx.run_task(TaskKind::Decrypt, encrypted_path, &tmp).await {
        ctx.discard(&tmp).await;
        return Err(e);
    }

    if let Err(e) = ctx.fs.move_item(&tmp, &dest).await {
        ctx.discard(&tmp).await;
        return Err(e);
    }
    ctx.fs.remove(encrypted_path).await?;

    debug!(id = %item.meta.id, "File restored");
    Ok(dest)
}

/// Decrypt a top-level encrypted file and drop its catalog record.
pub(crate) async fn decrypt_file(ctx: &OpContext<'_>, path: &Path) -> Result<PathBuf> {
    let id = id_from_artifact(path)?;
    let item = match ctx.catalog.read().await.get(&id) {
        Some(StorageItem::File(file)) => file.clone(),
        Some(StorageItem::Folder(_)) => {
            return Err(Error::InvalidInput(format!("{} is a folder", id)))
        }
        None => return Err(Error::NotFound(format!("Catalog item {}", id))),
    };

    let restored = decrypt_file_item(ctx, path, &item).await?;
    ctx.catalog.write().await.delete(&id).await?;

    info!(id = %id, path = %restored.display(), "File decrypted");
    Ok(restored)
}
