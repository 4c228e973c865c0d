//! Encrypted catalog of vault items.
//!
//! The catalog is loaded into memory once and rewritten wholesale after
//! every mutation. On disk it is a single bincode blob:
//!
//! ```text
//! { header: CatalogHeader, body: salt (16) | framed chunk }
//! ```
//!
//! The body is the bincode-encoded item map sealed under a key derived
//! from the secret key. An empty catalog has an empty body.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::item::{ItemPatch, StorageItem};
use akravault_common::{Error, ItemId, Result};
use akravault_crypto::keys::SALT_LENGTH;
use akravault_crypto::{
    decrypt_chunk, encrypt_chunk, CatalogHeader, KdfParams, Salt, SecretKey, Verifier,
};
use akravault_storage::LocalFs;

/// On-disk catalog blob.
#[derive(Serialize, Deserialize)]
struct CatalogFile {
    header: CatalogHeader,
    body: Vec<u8>,
}

/// In-memory catalog bound to its file.
pub struct Catalog {
    path: PathBuf,
    fs: LocalFs,
    header: CatalogHeader,
    /// Body read from disk and not opened yet.
    sealed: Option<Vec<u8>>,
    items: BTreeMap<ItemId, StorageItem>,
    secret: Option<Arc<SecretKey>>,
}

impl Catalog {
    /// Load the catalog at `path`.
    ///
    /// A missing file yields a fresh header built from `kdf`. The body, if
    /// any, stays sealed until [`Catalog::unlock`].
    ///
    /// # Errors
    /// - `CorruptCatalog` if the file cannot be decoded or holds a body
    ///   without a verifier
    pub async fn load(path: impl Into<PathBuf>, kdf: KdfParams, fs: LocalFs) -> Result<Self> {
        let path = path.into();

        let (header, sealed) = if fs.exists(&path).await? {
            let bytes = fs.read_file(&path).await?;
            let file: CatalogFile = bincode::deserialize(&bytes)
                .map_err(|e| Error::CorruptCatalog(format!("{}: {}", path.display(), e)))?;

            if !file.body.is_empty() && file.header.verifier.is_none() {
                return Err(Error::CorruptCatalog(
                    "Catalog has items but no verifier".to_string(),
                ));
            }
            debug!(path = %path.display(), body_len = file.body.len(), "Catalog loaded");
            (file.header, (!file.body.is_empty()).then_some(file.body))
        } else {
            debug!(path = %path.display(), "No catalog on disk, starting fresh");
            (CatalogHeader::new(kdf), None)
        };

        Ok(Self {
            path,
            fs,
            header,
            sealed,
            items: BTreeMap::new(),
            secret: None,
        })
    }

    /// Path of the catalog file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The catalog header.
    pub fn header(&self) -> &CatalogHeader {
        &self.header
    }

    /// Whether the body has been opened.
    pub fn is_unlocked(&self) -> bool {
        self.secret.is_some()
    }

    /// Open the body with the session key.
    ///
    /// # Errors
    /// - `Integrity` if the body was not sealed with this key
    /// - `CorruptCatalog` if the opened body cannot be decoded
    pub fn unlock(&mut self, secret: Arc<SecretKey>) -> Result<()> {
        if let Some(sealed) = self.sealed.take() {
            match open_body(&secret, &sealed) {
                Ok(items) => self.items = items,
                Err(e) => {
                    self.sealed = Some(sealed);
                    return Err(e);
                }
            }
        }
        self.secret = Some(secret);
        Ok(())
    }

    /// Drop the session key and the opened items.
    pub fn lock(&mut self) {
        self.secret = None;
        self.items.clear();
    }

    /// Record the verifier in the header. Allowed exactly once.
    pub async fn update_verifier(&mut self, verifier: Verifier) -> Result<()> {
        if self.header.verifier.is_some() {
            return Err(Error::ShouldNotOccur(
                "Catalog verifier is already set".to_string(),
            ));
        }
        self.header.verifier = Some(verifier);
        if let Err(e) = self.persist().await {
            self.header.verifier = None;
            return Err(e);
        }
        info!(path = %self.path.display(), "Catalog verifier stored");
        Ok(())
    }

    /// Look up a top-level record.
    pub fn get(&self, id: &ItemId) -> Option<&StorageItem> {
        self.items.get(id)
    }

    /// Snapshot of all records, oldest first.
    pub fn get_all(&self) -> Vec<StorageItem> {
        let mut all: Vec<StorageItem> = self.items.values().cloned().collect();
        all.sort_by(|a, b| {
            a.meta()
                .encrypted_at
                .cmp(&b.meta().encrypted_at)
                .then_with(|| a.id().cmp(b.id()))
        });
        all
    }

    /// Number of top-level records.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether there are no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `id` is used anywhere in the catalog, nested content included.
    pub fn contains(&self, id: &ItemId) -> bool {
        self.items.contains_key(id) || self.items.values().any(|item| item.contains_id(id))
    }

    /// The record whose artifact lives at `path`, hidden or not.
    pub fn find_by_path(&self, path: &Path) -> Option<&StorageItem> {
        let parent = path.parent()?;
        let name = path.file_name()?.to_str()?;
        let name = name.strip_prefix('.').unwrap_or(name);

        self.items
            .values()
            .find(|item| item.meta().path == parent && item.artifact_name() == name)
    }

    /// An id not present anywhere in the catalog.
    pub fn fresh_id(&self) -> ItemId {
        loop {
            let id = ItemId::generate();
            if !self.contains(&id) {
                return id;
            }
        }
    }

    /// Insert a record and persist.
    ///
    /// If the record's id is already used, a fresh one is assigned. The
    /// stored record is returned.
    pub async fn set(&mut self, mut item: StorageItem) -> Result<StorageItem> {
        self.require_unlocked()?;

        if self.contains(item.id()) {
            item.meta_mut().id = self.fresh_id();
        }
        let id = item.id().clone();

        self.items.insert(id.clone(), item.clone());
        if let Err(e) = self.persist().await {
            self.items.remove(&id);
            return Err(e);
        }

        debug!(id = %id, "Catalog record added");
        Ok(item)
    }

    /// Apply `patch` to a record and persist.
    pub async fn update(&mut self, id: &ItemId, patch: ItemPatch) -> Result<StorageItem> {
        self.require_unlocked()?;

        let previous = self
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Catalog item {}", id)))?;

        let mut updated = previous.clone();
        patch.apply(updated.meta_mut());
        self.items.insert(id.clone(), updated.clone());

        if let Err(e) = self.persist().await {
            self.items.insert(id.clone(), previous);
            return Err(e);
        }

        debug!(id = %id, "Catalog record updated");
        Ok(updated)
    }

    /// Remove a record and persist. Returns `None` if it did not exist.
    pub async fn delete(&mut self, id: &ItemId) -> Result<Option<StorageItem>> {
        self.require_unlocked()?;

        let Some(removed) = self.items.remove(id) else {
            return Ok(None);
        };
        if let Err(e) = self.persist().await {
            self.items.insert(id.clone(), removed);
            return Err(e);
        }

        debug!(id = %id, "Catalog record deleted");
        Ok(Some(removed))
    }

    fn require_unlocked(&self) -> Result<()> {
        if self.secret.is_none() {
            return Err(Error::InvalidInput("Catalog is locked".to_string()));
        }
        Ok(())
    }

    /// Rewrite the whole catalog through a temporary sibling file.
    async fn persist(&self) -> Result<()> {
        let body = match (&self.secret, self.items.is_empty()) {
            (_, true) => self.sealed.clone().unwrap_or_default(),
            (Some(secret), false) => seal_body(secret, &self.items)?,
            (None, false) => {
                return Err(Error::ShouldNotOccur(
                    "Catalog has items but no key".to_string(),
                ))
            }
        };

        let file = CatalogFile {
            header: self.header.clone(),
            body,
        };
        let bytes = bincode::serialize(&file)
            .map_err(|e| Error::Serialization(format!("Catalog: {}", e)))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.fs.create_dir_all(parent).await?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        self.fs.write_file(&tmp, &bytes).await?;
        self.fs.rename(&tmp, &self.path).await?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Catalog persisted");
        Ok(())
    }
}

fn seal_body(secret: &SecretKey, items: &BTreeMap<ItemId, StorageItem>) -> Result<Vec<u8>> {
    let plain = bincode::serialize(items)
        .map_err(|e| Error::Serialization(format!("Catalog body: {}", e)))?;

    let salt = Salt::generate();
    let key = secret.derive_file_key(&salt)?;
    let frame = encrypt_chunk(key.as_bytes(), &plain)?;

    let mut body = Vec::with_capacity(SALT_LENGTH + frame.len());
    body.extend_from_slice(salt.as_bytes());
    body.extend_from_slice(&frame);
    Ok(body)
}

fn open_body(secret: &SecretKey, body: &[u8]) -> Result<BTreeMap<ItemId, StorageItem>> {
    if body.len() < SALT_LENGTH {
        return Err(Error::CorruptCatalog("Catalog body too short".to_string()));
    }
    let (salt, frame) = body.split_at(SALT_LENGTH);
    let key = secret.derive_file_key(&Salt::from_slice(salt)?)?;

    let plain = decrypt_chunk(key.as_bytes(), frame).map_err(|e| match e {
        Error::Integrity(msg) => Error::Integrity(msg),
        other => Error::CorruptCatalog(other.to_string()),
    })?;

    bincode::deserialize(&plain).map_err(|e| Error::CorruptCatalog(format!("Catalog body: {}", e)))
}
