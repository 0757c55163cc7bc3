//! Payload storage
//!
//! Binary payloads are addressed by a relative, `/`-separated stored path.
//! [`StorageBackend`] is the capability the file lifecycle controller calls;
//! [`FilesystemStorage`] keeps payloads under a root directory.

use async_trait::async_trait;
use std::io::{Error, ErrorKind, Result};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Storage backend trait for payload stores.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Write a payload to a path that must not exist yet.
    ///
    /// Fails with [`ErrorKind::AlreadyExists`] when the path is taken, so
    /// an existing payload is never overwritten.
    async fn write_new(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Read the payload at `path`.
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Delete the payload at `path`. Deleting a missing path succeeds.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if a payload exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of the files directly inside `dir`; empty if `dir` is missing.
    async fn list(&self, dir: &str) -> Result<Vec<String>>;
}

/// Filesystem storage backend rooted at one directory.
pub struct FilesystemStorage {
    root: PathBuf,
    temp_counter: AtomicU64,
}

impl FilesystemStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            temp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a stored path below the root, rejecting anything that could
    /// escape it.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let valid = !path.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
        if !valid {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                format!("invalid storage path '{}'", path),
            ));
        }
        Ok(self.root.join(relative))
    }

    /// Validate that the root can be written, read and cleaned up.
    ///
    /// Run at start-up to surface permission problems early.
    pub async fn validate(&self) -> Result<()> {
        let probe = ".health-check/probe.bin";
        let data = b"storage-health-check";

        // A leftover probe from an interrupted run would block write_new
        self.delete(probe).await?;
        self.write_new(probe, data).await?;
        let read_back = self.read(probe).await?;
        self.delete(probe).await?;
        let _ = fs::remove_dir(self.root.join(".health-check")).await;

        if read_back != data {
            return Err(Error::new(ErrorKind::Other, "storage read-back mismatch"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    async fn write_new(&self, path: &str, data: &[u8]) -> Result<()> {
        let full_path = self.full_path(path)?;
        debug!(storage_path = %path, size = data.len(), "storage: write");

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "storage: create_dir_all failed");
                e
            })?;
        }

        // Write to a private temp file, then link it into place. The link
        // fails if the target exists, which keeps the write exclusive.
        let temp_path = full_path.with_file_name(format!(
            ".{}.{}.{}.tmp",
            full_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            std::process::id(),
            self.temp_counter.fetch_add(1, Ordering::Relaxed)
        ));

        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::hard_link(&temp_path, &full_path).await
        }
        .await;

        if let Err(e) = fs::remove_file(&temp_path).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(temp_path = %temp_path.display(), error = %e, "storage: temp cleanup failed");
            }
        }
        written
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        fs::read(self.full_path(path)?).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => {
                debug!(storage_path = %path, "storage: delete");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path)?).await
    }

    async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full_dir = if dir.is_empty() {
            self.root.clone()
        } else {
            self.full_path(dir)?
        };

        let mut entries = match fs::read_dir(&full_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage() -> (tempfile::TempDir, FilesystemStorage) {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let storage = FilesystemStorage::new(dir.path());
        (dir, storage)
    }

    #[tokio::test]
    async fn test_write_read_delete() {
        let (_dir, storage) = storage();

        storage.write_new("images/a.jpg", b"jpeg").await.unwrap();
        assert!(storage.exists("images/a.jpg").await.unwrap());
        assert_eq!(storage.read("images/a.jpg").await.unwrap(), b"jpeg");

        storage.delete("images/a.jpg").await.unwrap();
        assert!(!storage.exists("images/a.jpg").await.unwrap());

        // Deleting again is not an error
        storage.delete("images/a.jpg").await.unwrap();
    }

    #[tokio::test]
    async fn test_write_new_never_overwrites() {
        let (_dir, storage) = storage();

        storage.write_new("files/a.pdf", b"first").await.unwrap();
        let err = storage.write_new("files/a.pdf", b"second").await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::AlreadyExists);
        assert_eq!(storage.read("files/a.pdf").await.unwrap(), b"first");
        // No temp files left behind
        assert_eq!(storage.list("files").await.unwrap(), vec!["a.pdf"]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_paths() {
        let (_dir, storage) = storage();

        for path in ["../outside.txt", "/etc/passwd", "images/../../x", ""] {
            let err = storage.write_new(path, b"x").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "{path}");
        }
    }

    #[tokio::test]
    async fn test_list() {
        let (_dir, storage) = storage();

        assert!(storage.list("images").await.unwrap().is_empty());

        storage.write_new("images/b.jpg", b"b").await.unwrap();
        storage.write_new("images/a.jpg", b"a").await.unwrap();
        storage.write_new("images/thumbs/a_100x100_q85.jpg", b"t").await.unwrap();

        assert_eq!(storage.list("images").await.unwrap(), vec!["a.jpg", "b.jpg"]);
        assert_eq!(
            storage.list("images/thumbs").await.unwrap(),
            vec!["a_100x100_q85.jpg"]
        );
    }

    #[tokio::test]
    async fn test_validate() {
        let (dir, storage) = storage();
        storage.validate().await.unwrap();
        assert!(!dir.path().join(".health-check").exists());
    }
}
