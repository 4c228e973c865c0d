//! Recursive folder encryption and decryption.
//!
//! Every directory level is processed in two phases: all subfolders (with
//! everything below them) finish before the first file of the level starts.
//! Within a phase, entries run concurrently up to
//! `min(max_threads, entries)`. After the first failure no further entry
//! starts; entries already running are awaited so their cleanup happens
//! before the level reports the error.
//!
//! Encryption works on a private copy of the tree in the operation's
//! scratch directory, so the source stays untouched until the whole tree
//! has succeeded.
//! Decryption works in place.

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::item::{ExtraProps, FolderItem, ItemMeta, StorageItem};
use crate::operations::{
    decrypt_file_item, encrypt_nested_file, file_artifact_name, id_from_artifact, OpContext,
};
use akravault_common::{Error, ItemId, Result};
use akravault_crypto::{decrypt_name, encrypt_name};
use akravault_storage::fs::{file_name, DirEntry};

/// Concurrency limiter for one directory level.
fn level_limit(ctx: &OpContext<'_>, entries: usize) -> Semaphore {
    Semaphore::new(ctx.options.max_threads.min(entries).max(1))
}

/// Subfolders first, then files, each group by name.
fn sort_entries(entries: &mut [DirEntry]) {
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
}

fn closed() -> Error {
    Error::ShouldNotOccur("Level limiter closed".to_string())
}

/// Run one phase of a level under `limit`.
///
/// Returns the results in input order, or the first error by position.
async fn run_phase<T, F>(limit: &Semaphore, jobs: impl IntoIterator<Item = F>) -> Result<Vec<T>>
where
    F: Future<Output = Result<T>>,
{
    let failed = AtomicBool::new(false);
    let outcomes = join_all(jobs.into_iter().map(|job| {
        let failed = &failed;
        async move {
            let Ok(_slot) = limit.acquire().await else {
                return Err(closed());
            };
            if failed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let outcome = job.await;
            if outcome.is_err() {
                failed.store(true, Ordering::SeqCst);
            }
            outcome.map(Some)
        }
    }))
    .await;

    let done = outcomes.into_iter().collect::<Result<Vec<_>>>()?;
    Ok(done.into_iter().flatten().collect())
}

/// Encrypt everything inside `dir`, in place.
///
/// `record_dir` is where `dir` lives in the user's tree, recorded as the
/// location of each child.
async fn encrypt_contents(
    ctx: &OpContext<'_>,
    dir: &Path,
    record_dir: &Path,
) -> Result<Vec<StorageItem>> {
    let mut entries = ctx.fs.read_dir(dir).await?;
    sort_entries(&mut entries);
    let limit = level_limit(ctx, entries.len());
    let (folders, files): (Vec<_>, Vec<_>) = entries.iter().partition(|e| e.is_dir);

    let subfolders = run_phase(
        &limit,
        folders
            .into_iter()
            .map(|entry| encrypt_nested_folder(ctx, &entry.path, record_dir)),
    )
    .await?;

    let files = run_phase(
        &limit,
        files
            .into_iter()
            .map(|entry| encrypt_nested_file(ctx, &entry.path, record_dir)),
    )
    .await?;

    let mut content: Vec<StorageItem> = subfolders.into_iter().map(StorageItem::Folder).collect();
    content.extend(files.into_iter().map(StorageItem::File));
    Ok(content)
}

fn content_size(content: &[StorageItem]) -> u64 {
    content.iter().map(|item| item.meta().size).sum()
}

/// Build a folder record for `name`.
fn folder_record(
    ctx: &OpContext<'_>,
    id: ItemId,
    name: String,
    record_dir: &Path,
    content: Vec<StorageItem>,
) -> Result<FolderItem> {
    Ok(FolderItem {
        meta: ItemMeta {
            id,
            encrypted_name: encrypt_name(&ctx.key, &name)?,
            original_name: Some(name),
            path: record_dir.to_path_buf(),
            size: content_size(&content),
            encrypted_at: Utc::now(),
            is_hidden: false,
            extra_props: None,
        },
        content,
    })
}

/// Encrypt a subfolder of a working copy and rename it to its id.
fn encrypt_nested_folder<'a, 'b: 'a>(
    ctx: &'a OpContext<'b>,
    path: &'a Path,
    record_dir: &'a Path,
) -> BoxFuture<'a, Result<FolderItem>> {
    async move {
        let name = file_name(path)?;
        let content = encrypt_contents(ctx, path, &record_dir.join(&name)).await?;

        let id = ctx.fresh_id().await;
        let folder = folder_record(ctx, id, name, record_dir, content)?;

        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("No parent: {}", path.display())))?;
        ctx.fs.rename(path, &parent.join(folder.meta.id.as_str())).await?;

        debug!(id = %folder.meta.id, "Nested folder encrypted");
        Ok(folder)
    }
    .boxed()
}

/// Encrypt a folder tree, record it and replace it with a folder named by its id.
pub(crate) async fn encrypt_folder(
    ctx: &OpContext<'_>,
    path: &Path,
    extra_props: Option<ExtraProps>,
) -> Result<StorageItem> {
    if !ctx.fs.is_dir(path).await? {
        return Err(Error::InvalidInput(format!("Not a folder: {}", path.display())));
    }
    if let Ok(id) = id_from_artifact(path) {
        if ctx.catalog.read().await.contains(&id) {
            return Err(Error::AlreadyEncrypted(path.display().to_string()));
        }
    }

    let name = file_name(path)?;
    let parent = path
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::InvalidInput(format!("No parent: {}", path.display())))?;

    let staging = ctx.scratch.join(Uuid::new_v4().to_string());
    let working = staging.join(&name);
    ctx.fs.create_dir_all(&staging).await?;

    let result = async {
        ctx.fs.copy_recursive(path, &working).await?;
        let content = encrypt_contents(ctx, &working, path).await?;

        let id = ctx.fresh_id().await;
        let mut folder = folder_record(ctx, id, name, &parent, content)?;
        folder.meta.extra_props = ctx.accept_extra_props(extra_props);
        commit_folder(ctx, folder, path, &staging, &working).await
    }
    .await;
    ctx.discard(&staging).await;
    result
}

/// Record an encrypted working copy and swap it in for `source`.
///
/// If anything fails after the record was written, the record is removed
/// again and `source` is left in place.
async fn commit_folder(
    ctx: &OpContext<'_>,
    folder: FolderItem,
    source: &Path,
    staging: &Path,
    working: &Path,
) -> Result<StorageItem> {
    let stored = ctx
        .catalog
        .write()
        .await
        .set(StorageItem::Folder(folder))
        .await?;

    let renamed = staging.join(stored.artifact_name());
    let dest = stored.meta().path.join(stored.artifact_name());

    let mut moved = false;
    let placed = async {
        ctx.fs.rename(working, &renamed).await?;
        if ctx.fs.exists(&dest).await? {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }
        ctx.fs.move_item(&renamed, &dest).await?;
        moved = true;
        ctx.fs.remove(source).await
    }
    .await;

    if let Err(e) = placed {
        warn!(id = %stored.id(), error = %e, "Rolling back catalog record");
        if let Err(rollback) = ctx.catalog.write().await.delete(stored.id()).await {
            warn!(id = %stored.id(), error = %rollback, "Rollback failed");
        }
        if moved && ctx.fs.exists(source).await.unwrap_or(false) {
            ctx.discard(&dest).await;
        }
        return Err(e);
    }

    info!(id = %stored.id(), path = %source.display(), "Folder encrypted");
    Ok(stored)
}

/// Decrypt the content of an encrypted folder, in place.
async fn decrypt_contents(ctx: &OpContext<'_>, dir: &Path, content: &[StorageItem]) -> Result<()> {
    let limit = level_limit(ctx, content.len());

    let folders = content.iter().filter_map(|item| match item {
        StorageItem::Folder(folder) => Some(folder),
        StorageItem::File(_) => None,
    });
    run_phase(
        &limit,
        folders.map(|folder| decrypt_nested_folder(ctx, dir.join(folder.meta.id.as_str()), folder)),
    )
    .await?;

    let files = content.iter().filter_map(|item| match item {
        StorageItem::File(file) => Some(file),
        StorageItem::Folder(_) => None,
    });
    run_phase(
        &limit,
        files.map(|file| async move {
            let path = dir.join(file_artifact_name(&file.meta.id));
            decrypt_file_item(ctx, &path, file).await
        }),
    )
    .await?;

    Ok(())
}

/// Decrypt a folder's content, then rename it back to its original name.
fn decrypt_nested_folder<'a, 'b: 'a>(
    ctx: &'a OpContext<'b>,
    path: PathBuf,
    folder: &'a FolderItem,
) -> BoxFuture<'a, Result<PathBuf>> {
    async move {
        let name = decrypt_name(&ctx.key, &folder.meta.encrypted_name)?;
        let parent = path
            .parent()
            .ok_or_else(|| Error::InvalidInput(format!("No parent: {}", path.display())))?;
        let dest = parent.join(&name);
        if ctx.fs.exists(&dest).await? {
            return Err(Error::AlreadyExists(dest.display().to_string()));
        }

        decrypt_contents(ctx, &path, &folder.content).await?;
        ctx.fs.rename(&path, &dest).await?;

        debug!(id = %folder.meta.id, "Folder restored");
        Ok(dest)
    }
    .boxed()
}

/// Decrypt a top-level encrypted folder and drop its catalog record.
///
/// A failure part-way leaves already restored entries restored.
pub(crate) async fn decrypt_folder(ctx: &OpContext<'_>, path: &Path) -> Result<PathBuf> {
    if !ctx.fs.is_dir(path).await? {
        return Err(Error::InvalidInput(format!("Not a folder: {}", path.display())));
    }

    let id = id_from_artifact(path)?;
    let folder = match ctx.catalog.read().await.get(&id) {
        Some(StorageItem::Folder(folder)) => folder.clone(),
        Some(StorageItem::File(_)) => {
            return Err(Error::InvalidInput(format!("{} is a file", id)))
        }
        None => return Err(Error::NotFound(format!("Catalog item {}", id))),
    };

    let restored = decrypt_nested_folder(ctx, path.to_path_buf(), &folder).await?;
    ctx.catalog.write().await.delete(&id).await?;

    info!(id = %id, path = %restored.display(), "Folder decrypted");
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;
    use crate::config::VaultOptions;
    use crate::operations::ProgressTracker;
    use crate::progress::NoopSink;
    use crate::scheduler::TaskScheduler;
    use akravault_crypto::SecretKey;
    use akravault_storage::LocalFs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::RwLock;

    struct Fixture {
        dir: TempDir,
        options: VaultOptions,
        fs: LocalFs,
        catalog: RwLock<Catalog>,
        key: Arc<SecretKey>,
        scheduler: Arc<TaskScheduler>,
    }

    impl Fixture {
        async fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let options = VaultOptions::new(dir.path().join("storage.bin"))
                .with_temp_dir(dir.path().join("tmp"))
                .with_max_threads(2);
            let fs = LocalFs::default();
            let key = Arc::new(SecretKey::from_bytes([3u8; 32]));

            let mut catalog = Catalog::load(options.catalog_path.clone(), options.kdf, fs.clone())
                .await
                .unwrap();
            catalog.unlock(key.clone()).unwrap();
            catalog.update_verifier(key.verifier().unwrap()).await.unwrap();

            Self {
                scheduler: Arc::new(TaskScheduler::new(options.max_threads, fs.clone())),
                dir,
                options,
                fs,
                catalog: RwLock::new(catalog),
                key,
            }
        }

        fn context(&self) -> OpContext<'_> {
            let scratch = self.options.temp_dir.join("op");
            std::fs::create_dir_all(&scratch).unwrap();
            OpContext {
                key: self.key.clone(),
                options: &self.options,
                fs: &self.fs,
                catalog: &self.catalog,
                scheduler: self.scheduler.clone(),
                progress: ProgressTracker::new(&NoopSink, 0),
                scratch,
            }
        }
    }

    #[tokio::test]
    async fn test_phase_stops_starting_after_failure() {
        let limit = Semaphore::new(1);
        let started = AtomicUsize::new(0);

        let result: Result<Vec<u32>> = run_phase(
            &limit,
            (0..3u32).map(|i| {
                let started = &started;
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if i == 0 {
                        Err(Error::Integrity("first entry".to_string()))
                    } else {
                        Ok(i)
                    }
                }
            }),
        )
        .await;

        assert!(matches!(result, Err(Error::Integrity(_))));
        assert_eq!(started.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_phase_waits_for_running_siblings() {
        let limit = Semaphore::new(2);
        let cleaned = AtomicBool::new(false);

        let slow = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cleaned.store(true, Ordering::SeqCst);
            Ok(1u32)
        }
        .boxed();
        let failing = async { Err(Error::Integrity("tampered".to_string())) }.boxed();

        let result = run_phase(&limit, vec![slow, failing]).await;
        assert!(matches!(result, Err(Error::Integrity(_))));
        assert!(cleaned.load(Ordering::SeqCst));

        let all = run_phase(&limit, (1..=3u32).map(|i| async move { Ok(i) })).await;
        assert_eq!(all.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_commit_failure_rolls_back_record() {
        let fx = Fixture::new().await;
        let ctx = fx.context();

        let parent = fx.dir.path().join("data");
        let source = parent.join("docs");
        std::fs::create_dir_all(&source).unwrap();
        std::fs::write(source.join("a.txt"), b"original").unwrap();

        let staging = ctx.scratch.join("staging");
        let working = staging.join("docs");
        std::fs::create_dir_all(&staging).unwrap();
        fx.fs.copy_recursive(&source, &working).await.unwrap();

        // Someone else's folder already sits where the artifact would go.
        let id = ctx.fresh_id().await;
        let occupied = parent.join(id.as_str());
        std::fs::create_dir_all(&occupied).unwrap();
        std::fs::write(occupied.join("keep.txt"), b"not ours").unwrap();

        let folder = folder_record(&ctx, id, "docs".to_string(), &parent, Vec::new()).unwrap();
        let result = commit_folder(&ctx, folder, &source, &staging, &working).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));

        assert!(fx.catalog.read().await.is_empty());
        assert_eq!(std::fs::read(source.join("a.txt")).unwrap(), b"original");
        assert_eq!(std::fs::read(occupied.join("keep.txt")).unwrap(), b"not ours");

        let mut reloaded = Catalog::load(fx.options.catalog_path.clone(), fx.options.kdf, LocalFs::default())
            .await
            .unwrap();
        reloaded.unlock(fx.key.clone()).unwrap();
        assert!(reloaded.is_empty());
    }

    #[tokio::test]
    async fn test_failed_folder_leaves_source_and_catalog_alone() {
        let fx = Fixture::new().await;
        let ctx = fx.context();

        let source = fx.dir.path().join("data/photos");
        std::fs::create_dir_all(source.join("trip")).unwrap();
        std::fs::write(source.join("trip/a.jpg"), b"jpg").unwrap();
        // Already carries the envelope magic, so encrypting it fails.
        std::fs::write(source.join("trip/b.akra"), b"AKRA\x01rest").unwrap();

        let result = encrypt_folder(&ctx, &source, None).await;
        assert!(matches!(result, Err(Error::AlreadyEncrypted(_))));

        assert!(fx.catalog.read().await.is_empty());
        assert_eq!(std::fs::read(source.join("trip/a.jpg")).unwrap(), b"jpg");
        assert!(std::fs::read_dir(&ctx.scratch).unwrap().next().is_none());
    }

    fn entry(name: &str, is_dir: bool) -> DirEntry {
        DirEntry {
            name: name.to_string(),
            path: PathBuf::from("/x").join(name),
            is_dir,
        }
    }

    #[test]
    fn test_sort_entries() {
        let mut entries = vec![
            entry("b.txt", false),
            entry("zeta", true),
            entry("a.txt", false),
            entry("alpha", true),
        ];
        sort_entries(&mut entries);

        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta", "a.txt", "b.txt"]);
    }
}
