//! Catalog records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use akravault_common::ItemId;
use akravault_crypto::FILE_EXTENSION;

/// Caller-defined properties attached to a record.
pub type ExtraProps = BTreeMap<String, serde_json::Value>;

/// Fields shared by file and folder records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMeta {
    /// Catalog key and on-disk name of the encrypted artifact.
    pub id: ItemId,
    /// Display name, encrypted with [`akravault_crypto::encrypt_name`].
    pub encrypted_name: String,
    /// Plaintext name, when the caller chose to keep it.
    pub original_name: Option<String>,
    /// Directory the item was encrypted in.
    pub path: PathBuf,
    /// Plaintext size in bytes (sum of contents for folders).
    pub size: u64,
    /// When the encryption completed.
    pub encrypted_at: DateTime<Utc>,
    /// Whether the artifact is currently hidden.
    pub is_hidden: bool,
    /// Stored as a JSON string so binary encoders can carry arbitrary values.
    #[serde(with = "json_string")]
    pub extra_props: Option<ExtraProps>,
}

/// An encrypted file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileItem {
    pub meta: ItemMeta,
}

/// An encrypted folder and its content tree.
///
/// `content` lists subfolders first, then files, each group sorted by
/// plaintext name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderItem {
    pub meta: ItemMeta,
    pub content: Vec<StorageItem>,
}

/// A catalog record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StorageItem {
    File(FileItem),
    Folder(FolderItem),
}

impl StorageItem {
    /// Shared fields.
    pub fn meta(&self) -> &ItemMeta {
        match self {
            StorageItem::File(file) => &file.meta,
            StorageItem::Folder(folder) => &folder.meta,
        }
    }

    /// Shared fields, mutably.
    pub fn meta_mut(&mut self) -> &mut ItemMeta {
        match self {
            StorageItem::File(file) => &mut file.meta,
            StorageItem::Folder(folder) => &mut folder.meta,
        }
    }

    /// The record id.
    pub fn id(&self) -> &ItemId {
        &self.meta().id
    }

    /// Whether this is a folder record.
    pub fn is_folder(&self) -> bool {
        matches!(self, StorageItem::Folder(_))
    }

    /// Name of the encrypted artifact on disk, ignoring visibility.
    pub fn artifact_name(&self) -> String {
        match self {
            StorageItem::File(file) => format!("{}.{}", file.meta.id, FILE_EXTENSION),
            StorageItem::Folder(folder) => folder.meta.id.to_string(),
        }
    }

    /// Whether `id` is this record's id or the id of anything nested in it.
    pub fn contains_id(&self, id: &ItemId) -> bool {
        if self.id() == id {
            return true;
        }
        match self {
            StorageItem::File(_) => false,
            StorageItem::Folder(folder) => folder.content.iter().any(|child| child.contains_id(id)),
        }
    }
}

/// Changes applied by [`crate::Catalog::update`]. `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub original_name: Option<String>,
    pub path: Option<PathBuf>,
    pub is_hidden: Option<bool>,
    pub extra_props: Option<ExtraProps>,
}

impl ItemPatch {
    /// Patch toggling visibility only.
    pub fn hidden(is_hidden: bool) -> Self {
        Self {
            is_hidden: Some(is_hidden),
            ..Self::default()
        }
    }

    pub(crate) fn apply(self, meta: &mut ItemMeta) {
        if let Some(name) = self.original_name {
            meta.original_name = Some(name);
        }
        if let Some(path) = self.path {
            meta.path = path;
        }
        if let Some(hidden) = self.is_hidden {
            meta.is_hidden = hidden;
        }
        if let Some(props) = self.extra_props {
            meta.extra_props = Some(props);
        }
    }
}

mod json_string {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::ExtraProps;

    pub fn serialize<S: Serializer>(value: &Option<ExtraProps>, serializer: S) -> Result<S::Ok, S::Error> {
        let encoded = value
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(S::Error::custom)?;
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<ExtraProps>, D::Error> {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(D::Error::custom)
    }
}
