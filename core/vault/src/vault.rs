//! The vault facade.
//!
//! A [`Vault`] owns one unlocked catalog, the session key and the task
//! pool. Several vaults over different catalogs can live side by side.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::VaultOptions;
use crate::item::{ExtraProps, ItemPatch, StorageItem};
use crate::operations::{self, OpContext, ProgressTracker};
use crate::progress::ProgressSink;
use crate::scheduler::{TaskPool, TaskScheduler};
use crate::walker;
use akravault_common::{Error, ItemId, Result, SensitiveBytes};
use akravault_crypto::{derive_secret_key, SecretKey, Verifier};
use akravault_storage::{DotfileToggler, LocalFs, VisibilityToggler};

/// An unlocked vault.
///
/// Every top-level operation takes a [`ProgressSink`] and reports its
/// outcome through `on_end` exactly once, in addition to returning it.
pub struct Vault {
    options: VaultOptions,
    fs: LocalFs,
    catalog: RwLock<Catalog>,
    key: RwLock<Option<Arc<SecretKey>>>,
    toggler: DotfileToggler,
    pool: TaskPool,
}

impl Vault {
    /// Open the catalog at `options.catalog_path` with a passphrase.
    ///
    /// A new catalog gets its verifier on first open, binding it to this
    /// passphrase.
    ///
    /// # Errors
    /// - `InvalidInput` if the options are invalid or the passphrase is empty
    /// - `WrongPassword` if the passphrase does not match the catalog;
    ///   nothing on disk has been touched in that case
    /// - `CorruptCatalog` if the catalog cannot be decoded
    pub async fn open(options: VaultOptions, passphrase: SensitiveBytes) -> Result<Self> {
        options.validate()?;
        let fs = LocalFs::new(options.retry.clone());
        let catalog = Catalog::load(options.catalog_path.clone(), options.kdf, fs).await?;

        let header = catalog.header().clone();
        let (key, verifier) = tokio::task::spawn_blocking(move || derive_secret_key(passphrase, &header))
            .await
            .map_err(|e| Error::ShouldNotOccur(format!("Key derivation task failed: {}", e)))??;

        Self::assemble(options, catalog, key, verifier).await
    }

    /// Build a vault from an already derived key.
    ///
    /// The key is still checked against the catalog verifier.
    pub async fn unlock_with_key(
        options: VaultOptions,
        catalog: Catalog,
        key: SecretKey,
    ) -> Result<Self> {
        options.validate()?;
        let derived = key.verifier()?;
        let verifier = match &catalog.header().verifier {
            Some(stored) if stored.matches(&derived) => None,
            Some(_) => return Err(Error::WrongPassword),
            None => Some(derived),
        };

        Self::assemble(options, catalog, key, verifier).await
    }

    async fn assemble(
        options: VaultOptions,
        mut catalog: Catalog,
        key: SecretKey,
        verifier: Option<Verifier>,
    ) -> Result<Self> {
        let key = Arc::new(key);
        catalog.unlock(key.clone())?;
        if let Some(verifier) = verifier {
            catalog.update_verifier(verifier).await?;
        }

        let fs = LocalFs::new(options.retry.clone());
        fs.create_dir_all(&options.temp_dir).await?;
        let pool = TaskPool::new(options.max_threads, options.pool_idle_timeout, fs.clone());

        info!(
            catalog = %catalog.path().display(),
            items = catalog.len(),
            max_threads = options.max_threads,
            "Vault unlocked"
        );

        Ok(Self {
            toggler: DotfileToggler::new(fs.clone()),
            options,
            fs,
            catalog: RwLock::new(catalog),
            key: RwLock::new(Some(key)),
            pool,
        })
    }

    /// The options this vault was opened with.
    pub fn options(&self) -> &VaultOptions {
        &self.options
    }

    /// Whether [`Vault::lock`] has been called.
    pub async fn is_locked(&self) -> bool {
        self.key.read().await.is_none()
    }

    /// Drop the session key and the opened catalog, and stop the pool.
    ///
    /// Every later call fails with `InvalidInput`.
    pub async fn lock(&self) {
        self.key.write().await.take();
        self.catalog.write().await.lock();
        self.pool.shutdown();
        info!("Vault locked");
    }

    /// Encrypt a file in place, leaving `<id>.akra` next to where it was.
    ///
    /// # Errors
    /// - `AlreadyEncrypted` if the file already carries the envelope magic
    pub async fn encrypt_file(
        &self,
        path: impl AsRef<Path>,
        extra_props: Option<ExtraProps>,
        sink: &dyn ProgressSink,
    ) -> Result<StorageItem> {
        let path = path.as_ref();
        let result = async {
            let key = self.secret().await?;
            let total = self.fs.stat(path).await?.size;
            let session = self.pool.session();
            let ctx = self.context(key, session.scheduler(), sink, total).await?;
            let outcome = operations::encrypt_file(&ctx, path, extra_props).await;
            ctx.release().await;
            outcome
        }
        .await;
        finish(sink, result)
    }

    /// Restore an encrypted file and drop its record. Returns the restored path.
    ///
    /// # Errors
    /// - `NotFound` if the artifact's id is not in the catalog
    /// - `AlreadyExists` if the original name is taken
    /// - `Integrity` if the artifact was tampered with
    pub async fn decrypt_file(&self, path: impl AsRef<Path>, sink: &dyn ProgressSink) -> Result<PathBuf> {
        let path = path.as_ref();
        let result = async {
            let key = self.secret().await?;
            let total = self.fs.stat(path).await?.size;
            let session = self.pool.session();
            let ctx = self.context(key, session.scheduler(), sink, total).await?;
            let outcome = operations::decrypt_file(&ctx, path).await;
            ctx.release().await;
            outcome
        }
        .await;
        finish(sink, result)
    }

    /// Encrypt a folder tree, replacing it with a folder named by its id.
    ///
    /// The original tree is removed only after every entry succeeded.
    ///
    /// Entry names are recorded as UTF-8. A tree holding any name that is
    /// not valid UTF-8 is rejected as a whole and left untouched.
    ///
    /// # Errors
    /// - `AlreadyEncrypted` if the folder name is already a catalog id
    /// - `InvalidInput` naming the first entry whose name is not valid UTF-8
    pub async fn encrypt_folder(
        &self,
        path: impl AsRef<Path>,
        extra_props: Option<ExtraProps>,
        sink: &dyn ProgressSink,
    ) -> Result<StorageItem> {
        let path = path.as_ref();
        let result = async {
            let key = self.secret().await?;
            let total = self.fs.folder_size(path).await?;
            let session = self.pool.session();
            let ctx = self.context(key, session.scheduler(), sink, total).await?;
            let outcome = walker::encrypt_folder(&ctx, path, extra_props).await;
            ctx.release().await;
            outcome
        }
        .await;
        finish(sink, result)
    }

    /// Restore an encrypted folder tree and drop its record.
    pub async fn decrypt_folder(&self, path: impl AsRef<Path>, sink: &dyn ProgressSink) -> Result<PathBuf> {
        let path = path.as_ref();
        let result = async {
            let key = self.secret().await?;
            let total = self.fs.folder_size(path).await?;
            let session = self.pool.session();
            let ctx = self.context(key, session.scheduler(), sink, total).await?;
            let outcome = walker::decrypt_folder(&ctx, path).await;
            ctx.release().await;
            outcome
        }
        .await;
        finish(sink, result)
    }

    /// All top-level records, oldest first.
    pub async fn items(&self) -> Result<Vec<StorageItem>> {
        self.secret().await?;
        Ok(self.catalog.read().await.get_all())
    }

    /// One top-level record.
    pub async fn get_item(&self, id: &ItemId) -> Result<Option<StorageItem>> {
        self.secret().await?;
        Ok(self.catalog.read().await.get(id).cloned())
    }

    /// Patch a record's metadata.
    pub async fn update_item(&self, id: &ItemId, patch: ItemPatch) -> Result<StorageItem> {
        self.secret().await?;
        self.catalog.write().await.update(id, patch).await
    }

    /// Forget a record. The artifact on disk is left alone.
    pub async fn delete_item(&self, id: &ItemId) -> Result<Option<StorageItem>> {
        self.secret().await?;
        let removed = self.catalog.write().await.delete(id).await?;
        if removed.is_some() {
            info!(id = %id, "Catalog record removed");
        }
        Ok(removed)
    }

    /// Hide an item's artifact. Hiding a hidden item does nothing.
    pub async fn hide_item(&self, id: &ItemId) -> Result<StorageItem> {
        self.set_hidden(id, true).await
    }

    /// Reveal an item's artifact. Revealing a visible item does nothing.
    pub async fn reveal_item(&self, id: &ItemId) -> Result<StorageItem> {
        self.set_hidden(id, false).await
    }

    async fn set_hidden(&self, id: &ItemId, hidden: bool) -> Result<StorageItem> {
        self.secret().await?;
        let mut catalog = self.catalog.write().await;
        let item = catalog
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Catalog item {}", id)))?;
        if item.meta().is_hidden == hidden {
            return Ok(item);
        }

        let visible = item.meta().path.join(item.artifact_name());
        let current = if self.fs.exists(&visible).await? {
            visible
        } else {
            DotfileToggler::hidden_path(&visible)?
        };

        // The artifact may already be in the requested state on disk.
        let moved = if self.toggler.is_hidden(&current) == hidden {
            None
        } else if hidden {
            Some(self.toggler.hide(&current).await?)
        } else {
            Some(self.toggler.reveal(&current).await?)
        };

        match catalog.update(id, ItemPatch::hidden(hidden)).await {
            Ok(updated) => {
                debug!(id = %id, hidden, moved = moved.is_some(), "Visibility changed");
                Ok(updated)
            }
            Err(e) => {
                if let Some(moved) = moved {
                    let undo = if hidden {
                        self.toggler.reveal(&moved).await
                    } else {
                        self.toggler.hide(&moved).await
                    };
                    if let Err(undo) = undo {
                        warn!(id = %id, error = %undo, "Could not restore visibility");
                    }
                }
                Err(e)
            }
        }
    }

    async fn secret(&self) -> Result<Arc<SecretKey>> {
        self.key
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::InvalidInput("Vault is locked".to_string()))
    }

    async fn context<'a>(
        &'a self,
        key: Arc<SecretKey>,
        scheduler: Arc<TaskScheduler>,
        sink: &'a dyn ProgressSink,
        total: u64,
    ) -> Result<OpContext<'a>> {
        let scratch = self.options.temp_dir.join(format!("op-{}", Uuid::new_v4()));
        self.fs.create_dir_all(&scratch).await?;

        Ok(OpContext {
            key,
            options: &self.options,
            fs: &self.fs,
            catalog: &self.catalog,
            scheduler,
            progress: ProgressTracker::new(sink, total),
            scratch,
        })
    }
}

fn finish<T>(sink: &dyn ProgressSink, result: Result<T>) -> Result<T> {
    sink.on_end(result.as_ref().err());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopSink;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        progress: Mutex<Vec<(u64, u64)>>,
        ends: Mutex<Vec<Option<String>>>,
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, processed: u64, total: u64) {
            self.progress.lock().unwrap().push((processed, total));
        }

        fn on_end(&self, error: Option<&Error>) {
            self.ends.lock().unwrap().push(error.map(|e| e.to_string()));
        }
    }

    fn options(dir: &TempDir) -> VaultOptions {
        VaultOptions::new(dir.path().join("storage.bin"))
            .with_temp_dir(dir.path().join("tmp"))
            .with_max_threads(2)
    }

    fn data_dir(dir: &TempDir) -> PathBuf {
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        data
    }

    async fn unlock(options: VaultOptions) -> Result<Vault> {
        let catalog = Catalog::load(options.catalog_path.clone(), options.kdf, LocalFs::default()).await?;
        Vault::unlock_with_key(options, catalog, SecretKey::from_bytes([7u8; 32])).await
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("notes.txt");
        std::fs::write(&source, b"meet at noon").unwrap();

        let sink = RecordingSink::default();
        let item = vault.encrypt_file(&source, None, &sink).await.unwrap();

        assert!(!source.exists());
        let artifact = data.join(format!("{}.akra", item.id()));
        assert!(artifact.exists());
        assert_eq!(item.meta().size, 12);
        assert_eq!(item.meta().original_name.as_deref(), Some("notes.txt"));
        assert_eq!(item.meta().path, data);
        assert_eq!(*sink.ends.lock().unwrap(), vec![None]);
        assert_eq!(sink.progress.lock().unwrap().last(), Some(&(12, 12)));

        let restored = vault.decrypt_file(&artifact, &NoopSink).await.unwrap();
        assert_eq!(restored, source);
        assert_eq!(std::fs::read(&source).unwrap(), b"meet at noon");
        assert!(!artifact.exists());
        assert!(vault.items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_file_with_small_blocks() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir).with_block_size(512 * 1024)).await.unwrap();

        let content: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
        let source = data.join("blob.bin");
        std::fs::write(&source, &content).unwrap();

        let sink = RecordingSink::default();
        let item = vault.encrypt_file(&source, None, &sink).await.unwrap();
        assert_eq!(
            sink.progress.lock().unwrap().last(),
            Some(&(content.len() as u64, content.len() as u64))
        );

        let artifact = data.join(item.artifact_name());
        vault.decrypt_file(&artifact, &NoopSink).await.unwrap();
        assert_eq!(std::fs::read(&source).unwrap(), content);
    }

    #[tokio::test]
    async fn test_empty_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("empty");
        std::fs::write(&source, b"").unwrap();

        let item = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();
        vault
            .decrypt_file(data.join(item.artifact_name()), &NoopSink)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&source).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_folder_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let root = data.join("photos");
        std::fs::create_dir_all(root.join("2023/summer")).unwrap();
        std::fs::create_dir_all(root.join("empty")).unwrap();
        std::fs::write(root.join("index.txt"), b"index").unwrap();
        std::fs::write(root.join("2023/a.jpg"), vec![1u8; 4000]).unwrap();
        std::fs::write(root.join("2023/summer/b.jpg"), vec![2u8; 70_000]).unwrap();
        std::fs::write(root.join("2023/summer/c.jpg"), b"").unwrap();

        let sink = RecordingSink::default();
        let item = vault.encrypt_folder(&root, None, &sink).await.unwrap();
        assert_eq!(*sink.ends.lock().unwrap(), vec![None]);

        assert!(!root.exists());
        let encrypted = data.join(item.id().as_str());
        assert!(encrypted.is_dir());
        assert_eq!(item.meta().size, 5 + 4000 + 70_000);
        assert_eq!(vault.items().await.unwrap().len(), 1);

        let StorageItem::Folder(folder) = &item else {
            panic!("expected a folder record");
        };
        assert_eq!(folder.content.len(), 3);
        assert!(folder.content[0].is_folder());
        assert!(folder.content[1].is_folder());
        assert!(!folder.content[2].is_folder());
        assert_eq!(folder.content[0].meta().original_name.as_deref(), Some("2023"));
        assert_eq!(folder.content[0].meta().path, root);

        let top_level = names_in(&encrypted);
        assert!(!top_level.iter().any(|n| n == "index.txt" || n == "2023" || n == "empty"));
        assert!(top_level.contains(&format!("{}.akra", folder.content[2].id())));

        let restored = vault.decrypt_folder(&encrypted, &NoopSink).await.unwrap();
        assert_eq!(restored, root);
        assert!(!encrypted.exists());
        assert_eq!(std::fs::read(root.join("index.txt")).unwrap(), b"index");
        assert_eq!(std::fs::read(root.join("2023/a.jpg")).unwrap(), vec![1u8; 4000]);
        assert_eq!(std::fs::read(root.join("2023/summer/b.jpg")).unwrap(), vec![2u8; 70_000]);
        assert_eq!(std::fs::read(root.join("2023/summer/c.jpg")).unwrap(), b"");
        assert!(root.join("empty").is_dir());
        assert_eq!(names_in(&root), vec!["2023", "empty", "index.txt"]);
        assert!(vault.items().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_quiet_pool_outlives_idle_timeout() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let opts = options(&dir)
            .with_max_threads(1)
            .with_pool_idle_timeout(std::time::Duration::from_millis(1));
        let vault = unlock(opts).await.unwrap();

        let root = data.join("inbox");
        std::fs::create_dir_all(&root).unwrap();
        for i in 0..200 {
            std::fs::write(root.join(format!("m{:03}.eml", i)), format!("message {}", i)).unwrap();
        }

        let item = vault.encrypt_folder(&root, None, &NoopSink).await.unwrap();
        let StorageItem::Folder(folder) = &item else {
            panic!("expected a folder record");
        };
        assert_eq!(folder.content.len(), 200);

        vault
            .decrypt_folder(data.join(item.artifact_name()), &NoopSink)
            .await
            .unwrap();
        assert_eq!(std::fs::read(root.join("m199.eml")).unwrap(), b"message 199");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_folder_decrypt_leaves_no_plaintext_behind() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let root = data.join("docs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("a.bin"), vec![0x5au8; 8 * 1024 * 1024]).unwrap();
        std::fs::write(root.join("b.txt"), b"short note").unwrap();

        let item = vault.encrypt_folder(&root, None, &NoopSink).await.unwrap();
        let StorageItem::Folder(folder) = &item else {
            panic!("expected a folder record");
        };
        let encrypted = data.join(item.artifact_name());
        let small = folder
            .content
            .iter()
            .find(|child| child.meta().original_name.as_deref() == Some("b.txt"))
            .unwrap();
        let artifact = encrypted.join(small.artifact_name());
        let mut bytes = std::fs::read(&artifact).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&artifact, &bytes).unwrap();

        let result = vault.decrypt_folder(&encrypted, &NoopSink).await;
        assert!(matches!(result, Err(Error::Integrity(_))));

        assert!(names_in(&dir.path().join("tmp")).is_empty());
        assert!(vault.get_item(item.id()).await.unwrap().is_some());
        assert!(artifact.exists());
    }

    /// Snapshots the names under the temp dir on every progress report.
    struct SnapshotSink {
        root: PathBuf,
        snapshots: Mutex<Vec<Vec<String>>>,
    }

    fn all_names(dir: &Path, out: &mut Vec<String>) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            out.push(entry.file_name().to_string_lossy().into_owned());
            if entry.path().is_dir() {
                all_names(&entry.path(), out);
            }
        }
    }

    impl ProgressSink for SnapshotSink {
        fn on_progress(&self, _processed: u64, _total: u64) {
            let mut names = Vec::new();
            all_names(&self.root, &mut names);
            self.snapshots.lock().unwrap().push(names);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subfolders_finish_before_level_files_start() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir).with_max_threads(4)).await.unwrap();

        let root = data.join("project");
        std::fs::create_dir_all(root.join("src/inner")).unwrap();
        std::fs::create_dir_all(root.join("assets")).unwrap();
        std::fs::write(root.join("top.txt"), b"top level").unwrap();
        std::fs::write(root.join("src/mid.txt"), b"middle").unwrap();
        std::fs::write(root.join("src/inner/deep.bin"), vec![1u8; 300_000]).unwrap();
        std::fs::write(root.join("assets/logo.png"), vec![2u8; 200_000]).unwrap();

        let sink = SnapshotSink {
            root: dir.path().join("tmp"),
            snapshots: Mutex::new(Vec::new()),
        };
        vault.encrypt_folder(&root, None, &sink).await.unwrap();

        let snapshots = sink.snapshots.lock().unwrap();
        let running = |names: &[String], file: &str| {
            let prefix = format!("{}-", file);
            names.iter().any(|n| n.starts_with(&prefix) && n.ends_with(".tmp"))
        };
        let present = |names: &[String], dir: &str| names.iter().any(|n| n == dir);

        let mut seen_top = false;
        let mut seen_mid = false;
        for names in snapshots.iter() {
            if running(names, "top.txt") {
                seen_top = true;
                // Subfolders of the working copy are renamed to ids once done.
                assert!(!present(names, "src"));
                assert!(!present(names, "assets"));
                assert!(!present(names, "inner"));
            }
            if running(names, "mid.txt") {
                seen_mid = true;
                assert!(!present(names, "inner"));
            }
        }
        assert!(seen_top);
        assert!(seen_mid);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_entry_rejects_folder() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let root = data.join("mixed");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("fine.txt"), b"fine").unwrap();
        std::fs::write(root.join(OsStr::from_bytes(b"bad\xff.txt")), b"bad").unwrap();

        let sink = RecordingSink::default();
        let result = vault.encrypt_folder(&root, None, &sink).await;
        let message = match result {
            Err(Error::InvalidInput(message)) => message,
            other => panic!("expected InvalidInput, got {:?}", other.err()),
        };
        assert!(message.contains("bad"));
        assert!(message.contains("UTF-8"));

        assert_eq!(sink.ends.lock().unwrap().len(), 1);
        assert!(vault.items().await.unwrap().is_empty());
        assert_eq!(std::fs::read(root.join("fine.txt")).unwrap(), b"fine");
        assert_eq!(std::fs::read_dir(&root).unwrap().count(), 2);
        assert!(names_in(&dir.path().join("tmp")).is_empty());
    }

    #[tokio::test]
    async fn test_already_encrypted() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let file = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();
        let result = vault
            .encrypt_file(data.join(file.artifact_name()), None, &NoopSink)
            .await;
        assert!(matches!(result, Err(Error::AlreadyEncrypted(_))));

        let folder_path = data.join("docs");
        std::fs::create_dir_all(&folder_path).unwrap();
        std::fs::write(folder_path.join("b.txt"), b"b").unwrap();
        let folder = vault.encrypt_folder(&folder_path, None, &NoopSink).await.unwrap();
        let result = vault
            .encrypt_folder(data.join(folder.artifact_name()), None, &NoopSink)
            .await;
        assert!(matches!(result, Err(Error::AlreadyEncrypted(_))));
        assert_eq!(vault.items().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_tampered_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("secret.txt");
        std::fs::write(&source, b"attack at dawn").unwrap();
        let item = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();

        let artifact = data.join(item.artifact_name());
        let mut bytes = std::fs::read(&artifact).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&artifact, &bytes).unwrap();

        let sink = RecordingSink::default();
        let result = vault.decrypt_file(&artifact, &sink).await;
        assert!(matches!(result, Err(Error::Integrity(_))));
        assert_eq!(sink.ends.lock().unwrap().len(), 1);
        assert!(sink.ends.lock().unwrap()[0].is_some());
        assert!(!source.exists());
        assert!(artifact.exists());
        assert!(vault.get_item(item.id()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_decrypt_errors() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let stray = data.join(format!("{}.akra", ItemId::generate()));
        std::fs::write(&stray, b"AKRA").unwrap();
        let result = vault.decrypt_file(&stray, &NoopSink).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        let source = data.join("a.txt");
        std::fs::write(&source, b"first").unwrap();
        let item = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();
        std::fs::write(&source, b"second").unwrap();

        let artifact = data.join(item.artifact_name());
        let result = vault.decrypt_file(&artifact, &NoopSink).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
        assert!(artifact.exists());
        assert_eq!(std::fs::read(&source).unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_hide_and_reveal() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let item = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();
        let visible = data.join(item.artifact_name());
        let hidden = data.join(format!(".{}", item.artifact_name()));

        let updated = vault.hide_item(item.id()).await.unwrap();
        assert!(updated.meta().is_hidden);
        assert!(hidden.exists());
        assert!(!visible.exists());

        vault.hide_item(item.id()).await.unwrap();
        assert!(hidden.exists());

        let updated = vault.reveal_item(item.id()).await.unwrap();
        assert!(!updated.meta().is_hidden);
        assert!(visible.exists());

        vault.hide_item(item.id()).await.unwrap();
        vault.decrypt_file(&hidden, &NoopSink).await.unwrap();
        assert_eq!(std::fs::read(&source).unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_hide_follows_artifact_already_hidden_on_disk() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let source = data.join("a.txt");
        std::fs::write(&source, b"a").unwrap();
        let item = vault.encrypt_file(&source, None, &NoopSink).await.unwrap();
        let visible = data.join(item.artifact_name());
        let hidden = data.join(format!(".{}", item.artifact_name()));

        // Hidden by hand, the record still says visible.
        std::fs::rename(&visible, &hidden).unwrap();
        let updated = vault.hide_item(item.id()).await.unwrap();
        assert!(updated.meta().is_hidden);
        assert!(hidden.exists());
        assert!(!data.join(format!("..{}", item.artifact_name())).exists());

        let updated = vault.reveal_item(item.id()).await.unwrap();
        assert!(!updated.meta().is_hidden);
        assert!(visible.exists());
        assert!(!hidden.exists());
    }

    #[tokio::test]
    async fn test_hidden_folder_roundtrip() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        let root = data.join("docs");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("x.txt"), b"x").unwrap();

        let item = vault.encrypt_folder(&root, None, &NoopSink).await.unwrap();
        vault.hide_item(item.id()).await.unwrap();

        let hidden = data.join(format!(".{}", item.id()));
        assert!(hidden.is_dir());
        vault.decrypt_folder(&hidden, &NoopSink).await.unwrap();
        assert_eq!(std::fs::read(root.join("x.txt")).unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_extra_props_policy() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let mut props = ExtraProps::new();
        props.insert("tag".to_string(), serde_json::json!({"color": "red"}));

        let vault = unlock(options(&dir)).await.unwrap();
        std::fs::write(data.join("a.txt"), b"a").unwrap();
        let dropped = vault
            .encrypt_file(data.join("a.txt"), Some(props.clone()), &NoopSink)
            .await
            .unwrap();
        assert!(dropped.meta().extra_props.is_none());
        drop(vault);

        let vault = unlock(options(&dir).with_extra_props(true)).await.unwrap();
        std::fs::write(data.join("b.txt"), b"b").unwrap();
        let kept = vault
            .encrypt_file(data.join("b.txt"), Some(props.clone()), &NoopSink)
            .await
            .unwrap();
        assert_eq!(kept.meta().extra_props.as_ref(), Some(&props));
        drop(vault);

        let vault = unlock(options(&dir)).await.unwrap();
        let reloaded = vault.get_item(kept.id()).await.unwrap().unwrap();
        assert_eq!(reloaded.meta().extra_props.as_ref(), Some(&props));
    }

    #[tokio::test]
    async fn test_ids_unique_across_reload() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let mut ids = Vec::new();

        for round in 0..3 {
            let vault = unlock(options(&dir)).await.unwrap();
            for i in 0..3 {
                let path = data.join(format!("f{}-{}.txt", round, i));
                std::fs::write(&path, b"x").unwrap();
                ids.push(vault.encrypt_file(&path, None, &NoopSink).await.unwrap().id().clone());
            }
            assert_eq!(vault.items().await.unwrap().len(), ids.len());
        }

        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[tokio::test]
    async fn test_update_and_delete_item() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();

        std::fs::write(data.join("a.txt"), b"a").unwrap();
        let item = vault.encrypt_file(data.join("a.txt"), None, &NoopSink).await.unwrap();

        let patch = ItemPatch {
            original_name: Some("renamed.txt".to_string()),
            ..ItemPatch::default()
        };
        let updated = vault.update_item(item.id(), patch).await.unwrap();
        assert_eq!(updated.meta().original_name.as_deref(), Some("renamed.txt"));

        assert!(vault.delete_item(item.id()).await.unwrap().is_some());
        assert!(vault.delete_item(item.id()).await.unwrap().is_none());
        assert!(data.join(item.artifact_name()).exists());

        let result = vault.update_item(item.id(), ItemPatch::hidden(true)).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_locked_vault_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);
        let vault = unlock(options(&dir)).await.unwrap();
        std::fs::write(data.join("a.txt"), b"a").unwrap();

        vault.lock().await;
        assert!(vault.is_locked().await);

        let sink = RecordingSink::default();
        let result = vault.encrypt_file(data.join("a.txt"), None, &sink).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(sink.ends.lock().unwrap().len(), 1);
        assert!(matches!(vault.items().await, Err(Error::InvalidInput(_))));
        assert!(data.join("a.txt").exists());
    }

    #[tokio::test]
    async fn test_unlock_with_other_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let vault = unlock(options(&dir)).await.unwrap();
        drop(vault);

        let opts = options(&dir);
        let catalog = Catalog::load(opts.catalog_path.clone(), opts.kdf, LocalFs::default())
            .await
            .unwrap();
        let result = Vault::unlock_with_key(opts, catalog, SecretKey::from_bytes([8u8; 32])).await;
        assert!(matches!(result, Err(Error::WrongPassword)));
    }

    #[tokio::test]
    async fn test_wrong_passphrase_leaves_catalog_untouched() {
        let dir = TempDir::new().unwrap();
        let data = data_dir(&dir);

        let vault = Vault::open(options(&dir), SensitiveBytes::from("correct horse"))
            .await
            .unwrap();
        std::fs::write(data.join("a.txt"), b"a").unwrap();
        vault.encrypt_file(data.join("a.txt"), None, &NoopSink).await.unwrap();
        drop(vault);

        let catalog_path = dir.path().join("storage.bin");
        let before = std::fs::read(&catalog_path).unwrap();

        let result = Vault::open(options(&dir), SensitiveBytes::from("battery staple")).await;
        assert!(matches!(result, Err(Error::WrongPassword)));
        assert_eq!(std::fs::read(&catalog_path).unwrap(), before);

        let vault = Vault::open(options(&dir), SensitiveBytes::from("correct horse"))
            .await
            .unwrap();
        assert_eq!(vault.items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_open_rejects_invalid_options() {
        let dir = TempDir::new().unwrap();
        let result = Vault::open(options(&dir).with_max_threads(0), SensitiveBytes::from("pw")).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert!(!dir.path().join("storage.bin").exists());
    }
}
