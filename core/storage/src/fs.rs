//! Local filesystem access.
//!
//! Every call goes through a [`RetryExecutor`] so that resource-busy
//! failures are retried before being reported.

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use crate::retry::{RetryConfig, RetryExecutor};
use akravault_common::{Error, Result};

/// `EXDEV` on Unix.
const CROSS_DEVICE_UNIX: i32 = 18;
/// `ERROR_NOT_SAME_DEVICE` on Windows.
const CROSS_DEVICE_WINDOWS: i32 = 17;

/// A directory entry, discriminated file/dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name (last path component).
    pub name: String,
    /// Full path.
    pub path: PathBuf,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Result of [`LocalFs::stat`].
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Size in bytes (0 for directories).
    pub size: u64,
    /// Whether the path is a directory.
    pub is_dir: bool,
}

/// Convert an I/O error, mapping missing paths to [`Error::NotFound`].
fn map_io(err: io::Error, context: &str, path: &Path) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotFound(format!("{}: {}", context, path.display()))
    } else {
        Error::from_io(err, format!("{} {}", context, path.display()))
    }
}

fn is_cross_device(err: &Error) -> bool {
    match err {
        Error::Io(e) | Error::FatalIo { source: e, .. } => matches!(
            e.raw_os_error(),
            Some(code) if (cfg!(unix) && code == CROSS_DEVICE_UNIX)
                || (cfg!(windows) && code == CROSS_DEVICE_WINDOWS)
        ),
        _ => false,
    }
}

/// Name of the last component of `path`, as UTF-8.
///
/// Names that are not valid UTF-8 are rejected with an error naming the
/// offending path.
pub fn file_name(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("Path has no file name: {}", path.display())))?;
    name.to_str().map(str::to_string).ok_or_else(|| {
        Error::InvalidInput(format!(
            "Entry name is not valid UTF-8: {}",
            path.display()
        ))
    })
}

/// Local filesystem with transient-error retry.
#[derive(Debug, Clone, Default)]
pub struct LocalFs {
    retry: RetryExecutor,
}

impl LocalFs {
    /// Create a filesystem handle with the given retry policy.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            retry: RetryExecutor::new(config),
        }
    }

    /// Metadata of `path`.
    pub async fn stat(&self, path: &Path) -> Result<FileStat> {
        let meta = self
            .retry
            .execute(|| async move { fs::metadata(path).await.map_err(|e| map_io(e, "stat", path)) })
            .await?;

        Ok(FileStat {
            size: if meta.is_dir() { 0 } else { meta.len() },
            is_dir: meta.is_dir(),
        })
    }

    /// Whether `path` exists.
    pub async fn exists(&self, path: &Path) -> Result<bool> {
        self.retry
            .execute(|| async move {
                fs::try_exists(path)
                    .await
                    .map_err(|e| map_io(e, "exists", path))
            })
            .await
    }

    /// Whether `path` is an existing directory.
    pub async fn is_dir(&self, path: &Path) -> Result<bool> {
        match self.stat(path).await {
            Ok(stat) => Ok(stat.is_dir),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List the entries of a directory, in no particular order.
    pub async fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>> {
        self.retry
            .execute(|| async move {
                let mut entries = fs::read_dir(path)
                    .await
                    .map_err(|e| map_io(e, "read_dir", path))?;
                let mut out = Vec::new();

                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| map_io(e, "read_dir", path))?
                {
                    let entry_path = entry.path();
                    let meta = fs::metadata(&entry_path)
                        .await
                        .map_err(|e| map_io(e, "stat", &entry_path))?;
                    out.push(DirEntry {
                        name: file_name(&entry_path)?,
                        path: entry_path,
                        is_dir: meta.is_dir(),
                    });
                }
                Ok(out)
            })
            .await
    }

    /// Read up to `len` bytes from the start of a file.
    pub async fn read_magic(&self, path: &Path, len: usize) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;

        self.retry
            .execute(|| async move {
                let file = fs::File::open(path)
                    .await
                    .map_err(|e| map_io(e, "open", path))?;
                let mut buf = Vec::with_capacity(len);
                file.take(len as u64)
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| map_io(e, "read", path))?;
                Ok(buf)
            })
            .await
    }

    /// Read a whole file.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.retry
            .execute(|| async move { fs::read(path).await.map_err(|e| map_io(e, "read", path)) })
            .await
    }

    /// Write `data` to `path`, replacing any existing file.
    pub async fn write_file(&self, path: &Path, data: &[u8]) -> Result<()> {
        self.retry
            .execute(|| async move {
                fs::write(path, data)
                    .await
                    .map_err(|e| map_io(e, "write", path))
            })
            .await
    }

    /// Rename `from` to `to` (atomic on the same filesystem).
    pub async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.retry
            .execute(|| async move {
                fs::rename(from, to)
                    .await
                    .map_err(|e| map_io(e, "rename", from))
            })
            .await
    }

    /// Create a directory and all missing parents.
    pub async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.retry
            .execute(|| async move {
                fs::create_dir_all(path)
                    .await
                    .map_err(|e| map_io(e, "create_dir_all", path))
            })
            .await
    }

    /// Remove a file, or a directory with all its content.
    pub async fn remove(&self, path: &Path) -> Result<()> {
        let is_dir = self.stat(path).await?.is_dir;
        self.retry
            .execute(|| async move {
                let result = if is_dir {
                    fs::remove_dir_all(path).await
                } else {
                    fs::remove_file(path).await
                };
                result.map_err(|e| map_io(e, "remove", path))
            })
            .await
    }

    async fn copy_file(&self, from: &Path, to: &Path) -> Result<u64> {
        self.retry
            .execute(|| async move { fs::copy(from, to).await.map_err(|e| map_io(e, "copy", from)) })
            .await
    }

    /// Copy a file or a whole directory tree to `to`, which must not exist.
    pub async fn copy_recursive(&self, from: &Path, to: &Path) -> Result<()> {
        if self.exists(to).await? {
            return Err(Error::AlreadyExists(format!(
                "Destination already exists: {}",
                to.display()
            )));
        }

        if !self.is_dir(from).await? {
            self.copy_file(from, to).await?;
            return Ok(());
        }

        let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src, dst)) = pending.pop() {
            self.create_dir_all(&dst).await?;
            for entry in self.read_dir(&src).await? {
                let target = dst.join(&entry.name);
                if entry.is_dir {
                    pending.push((entry.path, target));
                } else {
                    self.copy_file(&entry.path, &target).await?;
                }
            }
        }
        Ok(())
    }

    /// Total size of the files below `path` (or the file itself).
    pub async fn folder_size(&self, path: &Path) -> Result<u64> {
        let stat = self.stat(path).await?;
        if !stat.is_dir {
            return Ok(stat.size);
        }

        let mut total = 0;
        let mut pending = vec![path.to_path_buf()];
        while let Some(dir) = pending.pop() {
            for entry in self.read_dir(&dir).await? {
                if entry.is_dir {
                    pending.push(entry.path);
                } else {
                    total += self.stat(&entry.path).await?.size;
                }
            }
        }
        Ok(total)
    }

    /// Move `from` to `to`, copying across devices when a rename is not possible.
    pub async fn move_item(&self, from: &Path, to: &Path) -> Result<()> {
        match self.rename(from, to).await {
            Err(e) if is_cross_device(&e) => {
                debug!(from = %from.display(), to = %to.display(), "Cross-device move, copying");
                self.copy_recursive(from, to).await?;
                self.remove(from).await
            }
            other => other,
        }
    }

    /// Open a file for reading from a blocking context.
    pub fn open_read(&self, path: &Path) -> Result<std::fs::File> {
        self.retry
            .execute_blocking(|| std::fs::File::open(path).map_err(|e| map_io(e, "open", path)))
    }

    /// Remove a file from a blocking context.
    pub fn remove_file_blocking(&self, path: &Path) -> Result<()> {
        self.retry
            .execute_blocking(|| std::fs::remove_file(path).map_err(|e| map_io(e, "remove", path)))
    }

    /// Create (or truncate) a file for writing from a blocking context.
    pub fn create_write(&self, path: &Path) -> Result<std::fs::File> {
        self.retry
            .execute_blocking(|| std::fs::File::create(path).map_err(|e| map_io(e, "create", path)))
    }
}
