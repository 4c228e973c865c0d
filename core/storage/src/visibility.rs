//! Hiding and revealing vault artifacts.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::fs::{file_name, LocalFs};
use akravault_common::{Error, Result};

/// Toggles the visibility of a file or folder on disk.
#[async_trait]
pub trait VisibilityToggler: Send + Sync {
    /// Hide `path`, returning where it now lives.
    async fn hide(&self, path: &Path) -> Result<PathBuf>;

    /// Reveal `path`, returning where it now lives.
    async fn reveal(&self, path: &Path) -> Result<PathBuf>;

    /// Whether `path` is currently hidden.
    fn is_hidden(&self, path: &Path) -> bool;
}

/// Hides entries with the leading-dot naming convention.
#[derive(Debug, Clone, Default)]
pub struct DotfileToggler {
    fs: LocalFs,
}

impl DotfileToggler {
    /// Create a toggler renaming through `fs`.
    pub fn new(fs: LocalFs) -> Self {
        Self { fs }
    }

    /// Path `path` would have once hidden.
    pub fn hidden_path(path: &Path) -> Result<PathBuf> {
        let name = file_name(path)?;
        if name.starts_with('.') {
            return Ok(path.to_path_buf());
        }
        Ok(path.with_file_name(format!(".{}", name)))
    }

    /// Path `path` would have once revealed.
    pub fn visible_path(path: &Path) -> Result<PathBuf> {
        let name = file_name(path)?;
        match name.strip_prefix('.') {
            Some("") => Err(Error::InvalidInput(format!(
                "Cannot reveal {}",
                path.display()
            ))),
            Some(stripped) => Ok(path.with_file_name(stripped)),
            None => Ok(path.to_path_buf()),
        }
    }

    async fn move_to(&self, from: &Path, to: PathBuf) -> Result<PathBuf> {
        if from == to {
            return Ok(to);
        }
        if self.fs.exists(&to).await? {
            return Err(Error::AlreadyExists(format!(
                "Target already exists: {}",
                to.display()
            )));
        }
        self.fs.rename(from, &to).await?;
        Ok(to)
    }
}

#[async_trait]
impl VisibilityToggler for DotfileToggler {
    async fn hide(&self, path: &Path) -> Result<PathBuf> {
        self.move_to(path, Self::hidden_path(path)?).await
    }

    async fn reveal(&self, path: &Path) -> Result<PathBuf> {
        self.move_to(path, Self::visible_path(path)?).await
    }

    fn is_hidden(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with('.'))
    }
}
