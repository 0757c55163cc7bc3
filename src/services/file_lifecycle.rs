//! File lifecycle controller
//!
//! Owns the binary payload behind a media item: storing new payloads under
//! unique names, replacing and clearing them, and deleting a payload only
//! once no other item of the same kind references its stored path.
//! Image derivatives (thumbnails) are swept after every payload change.
//!
//! Reference checks and physical deletes for one path run under a per-path
//! lock, so two sibling deletions cannot both decide they were the last
//! referencer.

use regex::Regex;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::db::repositories::{MediaRepository, MediaRow};
use crate::error::MediaError;
use crate::models::{FileFieldInput, Payload};
use crate::services::locks::KeyedLocks;
use crate::storage::StorageBackend;

/// Give up finding a free name after this many suffixes
const MAX_NAME_ATTEMPTS: usize = 1000;

/// What a submitted file field did to an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// A new payload was stored
    Replaced,
    /// The payload was removed and the path cleared
    Cleared,
    /// Nothing changed
    Unchanged,
}

/// Payload store operations bound to one storage backend
pub struct FileLifecycle {
    storage: Arc<dyn StorageBackend>,
    config: StorageConfig,
    path_locks: KeyedLocks<String>,
}

impl FileLifecycle {
    pub fn new(storage: Arc<dyn StorageBackend>, config: StorageConfig) -> Self {
        Self {
            storage,
            config,
            path_locks: KeyedLocks::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Hold the lock for a stored path while creating rows that reference it
    pub async fn lock_path(&self, path: &str) -> OwnedMutexGuard<()> {
        self.path_locks.lock(path.to_string()).await
    }

    /// Write `payload` into the upload directory of `M` under a name no
    /// other payload uses, returning the stored path.
    pub async fn store<M: MediaRow>(&self, payload: &Payload) -> Result<String, MediaError> {
        let dir = self.config.upload_dir(M::VARIANT).ok_or_else(|| {
            MediaError::ValidationError(format!("{} items do not store payloads", M::VARIANT))
        })?;
        if payload.name.trim().is_empty() {
            return Err(MediaError::ValidationError(
                "Payload name cannot be empty".to_string(),
            ));
        }
        if payload.data.len() as u64 > self.config.max_file_size {
            return Err(MediaError::ValidationError(format!(
                "Payload '{}' is {} bytes, the limit is {}",
                payload.name,
                payload.data.len(),
                self.config.max_file_size
            )));
        }

        let sanitized = sanitize_file_name(&payload.name);
        let (stem, ext) = split_extension(&sanitized);
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = match attempt {
                0 => format!("{stem}{ext}"),
                n => format!("{stem}_{n}{ext}"),
            };
            let path = join_path(dir, &name);
            match self.storage.write_new(&path, &payload.data).await {
                Ok(()) => {
                    debug!(path = %path, size = payload.data.len(), "Stored payload");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(MediaError::storage(path, e)),
            }
        }

        Err(MediaError::storage(
            join_path(dir, &payload.name),
            std::io::Error::new(ErrorKind::AlreadyExists, "no free file name"),
        ))
    }

    /// Replace the payload of `item`.
    ///
    /// The new payload is written first; if that fails nothing else
    /// changes. A persisted item is updated in the store, then the old
    /// payload is released if no other item references it. Failing to
    /// remove the old payload is logged and does not fail the replace.
    pub async fn replace<M: MediaRow>(
        &self,
        repo: &dyn MediaRepository<M>,
        item: &mut M,
        payload: &Payload,
    ) -> Result<(), MediaError> {
        let new_path = self.store::<M>(payload).await?;
        let previous = item.clone();
        let old_path = item.stored_path().map(str::to_string);

        item.set_stored_path(Some(new_path.clone()));
        let persisted = match item.payload_stored(payload) {
            Ok(()) if item.id() > 0 => repo.update(item).await.map(|_| ()).map_err(MediaError::from),
            other => other,
        };
        if let Err(e) = persisted {
            *item = previous;
            if let Err(cleanup) = self.storage.delete(&new_path).await {
                warn!(path = %new_path, error = %cleanup, "Failed to remove unused payload");
            }
            return Err(e);
        }

        if let Some(old_path) = old_path.filter(|old| *old != new_path) {
            let exclude = (item.id() > 0).then(|| item.id());
            match self.release(repo, &old_path, exclude).await {
                Ok(true) => self.sweep_derivatives::<M>(&old_path).await,
                Ok(false) => {}
                Err(e) => {
                    warn!(path = %old_path, item_id = item.id(), error = %e, "Failed to delete replaced payload");
                }
            }
        }
        self.sweep_derivatives::<M>(&new_path).await;
        Ok(())
    }

    /// Release the payload of `item` and clear its stored path.
    ///
    /// The payload is removed only if it exists and no other item
    /// references it. Storage failures are returned. The item row is not
    /// written; callers persist the cleared path themselves.
    pub async fn delete<M: MediaRow>(
        &self,
        repo: &dyn MediaRepository<M>,
        item: &mut M,
    ) -> Result<bool, MediaError> {
        let removed = match item.stored_path().map(str::to_string) {
            Some(path) => {
                let exclude = (item.id() > 0).then(|| item.id());
                let removed = self.release(repo, &path, exclude).await?;
                if removed {
                    self.sweep_derivatives::<M>(&path).await;
                }
                removed
            }
            None => false,
        };
        item.set_stored_path(None);
        Ok(removed)
    }

    /// Delete the payload at `path` unless an item other than `exclude_id`
    /// still references it. Returns whether the payload was removed.
    pub async fn release<M: MediaRow>(
        &self,
        repo: &dyn MediaRepository<M>,
        path: &str,
        exclude_id: Option<i64>,
    ) -> Result<bool, MediaError> {
        let _guard = self.lock_path(path).await;

        let exists = self
            .storage
            .exists(path)
            .await
            .map_err(|e| MediaError::storage(path, e))?;
        if !exists {
            return Ok(false);
        }

        let others = repo.count_path_references(path, exclude_id).await?;
        if others > 0 {
            debug!(path = %path, references = others, "Payload still referenced, keeping it");
            return Ok(false);
        }

        self.storage
            .delete(path)
            .await
            .map_err(|e| MediaError::storage(path, e))?;
        debug!(path = %path, "Deleted payload");
        Ok(true)
    }

    /// Apply a submitted file field to `item`.
    ///
    /// A new payload always wins over a clear request. Clearing only
    /// happens for kinds whose path is optional; otherwise the request is
    /// ignored.
    pub async fn apply_form<M: MediaRow>(
        &self,
        repo: &dyn MediaRepository<M>,
        item: &mut M,
        input: FileFieldInput,
    ) -> Result<FileAction, MediaError> {
        if let Some(payload) = input.payload {
            self.replace(repo, item, &payload).await?;
            return Ok(FileAction::Replaced);
        }

        if input.clear && M::PATH_NULLABLE && item.stored_path().is_some() {
            self.delete(repo, item).await?;
            if item.id() > 0 {
                repo.update(item).await?;
            }
            return Ok(FileAction::Cleared);
        }

        Ok(FileAction::Unchanged)
    }

    /// Remove every derivative generated from the payload at `path`.
    ///
    /// Derivatives live in `<dir>/<thumbnail_subdir>` and are named
    /// `<prefix><base>_<WxH>[_<options>]_q<quality><ext>`, optionally with
    /// the source extension repeated before the size
    /// (`photo_jpg_100x80_crop_q85.jpg`).
    pub async fn clean_derivatives(&self, path: &str) -> Result<usize, MediaError> {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some((dir, name)) => (dir, name),
            None => ("", path),
        };
        let (base, ext) = split_extension(file_name);
        let thumb_dir = join_path(dir, &self.config.thumbnail_subdir);
        let pattern = derivative_pattern(&self.config.thumbnail_prefix, base, ext)?;

        let names = self
            .storage
            .list(&thumb_dir)
            .await
            .map_err(|e| MediaError::storage(thumb_dir.clone(), e))?;

        let mut removed = 0;
        for name in names.iter().filter(|n| pattern.is_match(n)) {
            let derivative = join_path(&thumb_dir, name);
            self.storage
                .delete(&derivative)
                .await
                .map_err(|e| MediaError::storage(derivative.clone(), e))?;
            removed += 1;
        }

        if removed > 0 {
            debug!(path = %path, removed, "Removed payload derivatives");
        }
        Ok(removed)
    }

    /// Derivative cleanup after a committed change; failures are logged
    pub(crate) async fn sweep_derivatives<M: MediaRow>(&self, path: &str) {
        if !M::HAS_DERIVATIVES {
            return;
        }
        if let Err(e) = self.clean_derivatives(path).await {
            warn!(path = %path, error = %e, "Failed to clean payload derivatives");
        }
    }
}

fn derivative_pattern(prefix: &str, base: &str, ext: &str) -> Result<Regex, MediaError> {
    let source_ext = match ext.strip_prefix('.') {
        Some(e) if !e.is_empty() => format!("(?:{}_)?", regex::escape(e)),
        _ => String::new(),
    };
    let pattern = format!(
        r"^{}{}_{}\d+x\d+(?:_[A-Za-z0-9-]+)*_q\d+{}$",
        regex::escape(prefix),
        regex::escape(base),
        source_ext,
        regex::escape(ext)
    );
    Regex::new(&pattern)
        .map_err(|e| MediaError::InternalError(anyhow::anyhow!("Invalid derivative pattern: {}", e)))
}

/// Reduce a client-supplied name to a safe single path segment
fn sanitize_file_name(name: &str) -> String {
    let last = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = last
        .trim()
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

/// Split `name` into stem and extension (with its dot)
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 => name.split_at(idx),
        _ => (name, ""),
    }
}

fn join_path(dir: &str, name: &str) -> String {
    match (dir.trim_end_matches('/'), name) {
        ("", name) => name.to_string(),
        (dir, "") => dir.to_string(),
        (dir, name) => format!("{dir}/{name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::SqlxMediaRepository;
    use crate::db::{create_test_pool, migrations};
    use crate::models::{File, Image, MediaItem};
    use crate::storage::FilesystemStorage;
    use async_trait::async_trait;

    struct Fixture {
        _dir: tempfile::TempDir,
        storage: Arc<FilesystemStorage>,
        lifecycle: FileLifecycle,
        files: SqlxMediaRepository<File>,
        images: SqlxMediaRepository<Image>,
    }

    async fn fixture_with(config: StorageConfig) -> Fixture {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let pool = create_test_pool().await.expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");

        let storage = Arc::new(FilesystemStorage::new(dir.path()));
        let lifecycle = FileLifecycle::new(storage.clone(), config);
        Fixture {
            _dir: dir,
            storage,
            lifecycle,
            files: SqlxMediaRepository::new(pool.clone()),
            images: SqlxMediaRepository::new(pool),
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(StorageConfig::default()).await
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::RgbImage::new(width, height)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    async fn saved_file(f: &Fixture, name: &str, data: &[u8]) -> File {
        let mut file = File::new("");
        file.filename = Some(f.lifecycle.store::<File>(&Payload::new(name, data)).await.unwrap());
        f.files.create(&file).await.unwrap()
    }

    #[tokio::test]
    async fn test_store_never_overwrites() {
        let f = fixture().await;

        let first = f.lifecycle.store::<File>(&Payload::new("report.pdf", b"a".to_vec())).await.unwrap();
        let second = f.lifecycle.store::<File>(&Payload::new("report.pdf", b"b".to_vec())).await.unwrap();
        let third = f.lifecycle.store::<File>(&Payload::new("../report.pdf", b"c".to_vec())).await.unwrap();

        assert_eq!(first, "files/report.pdf");
        assert_eq!(second, "files/report_1.pdf");
        assert_eq!(third, "files/report_2.pdf");
        assert_eq!(f.storage.read(&first).await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn test_store_validates_input() {
        let mut config = StorageConfig::default();
        config.max_file_size = 4;
        let f = fixture_with(config).await;

        let err = f.lifecycle.store::<File>(&Payload::new("", b"x".to_vec())).await.unwrap_err();
        assert!(matches!(err, MediaError::ValidationError(_)));

        let err = f.lifecycle.store::<File>(&Payload::new("big.bin", b"12345".to_vec())).await.unwrap_err();
        assert!(matches!(err, MediaError::ValidationError(_)));

        let err = f
            .lifecycle
            .store::<crate::models::Video>(&Payload::new("clip.mp4", b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::ValidationError(_)));
    }

    #[tokio::test]
    async fn test_replace_deletes_unshared_old_payload() {
        let f = fixture().await;
        let mut file = saved_file(&f, "old.pdf", b"old").await;

        f.lifecycle
            .replace(&f.files, &mut file, &Payload::new("new.pdf", b"new".to_vec()))
            .await
            .unwrap();

        assert_eq!(file.filename.as_deref(), Some("files/new.pdf"));
        assert!(!f.storage.exists("files/old.pdf").await.unwrap());
        let stored = f.files.get(file.meta.id).await.unwrap().unwrap();
        assert_eq!(stored.filename.as_deref(), Some("files/new.pdf"));
    }

    #[tokio::test]
    async fn test_replace_keeps_shared_old_payload() {
        let f = fixture().await;
        let mut first = saved_file(&f, "shared.pdf", b"shared").await;
        let mut twin = File::new("Twin");
        twin.filename = first.filename.clone();
        f.files.create(&twin).await.unwrap();

        f.lifecycle
            .replace(&f.files, &mut first, &Payload::new("mine.pdf", b"mine".to_vec()))
            .await
            .unwrap();

        assert!(f.storage.exists("files/shared.pdf").await.unwrap());
        assert!(f.storage.exists("files/mine.pdf").await.unwrap());
    }

    struct RejectingWrites(FilesystemStorage);

    #[async_trait]
    impl StorageBackend for RejectingWrites {
        async fn write_new(&self, _path: &str, _data: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(ErrorKind::PermissionDenied, "read-only"))
        }
        async fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
            self.0.read(path).await
        }
        async fn delete(&self, path: &str) -> std::io::Result<()> {
            self.0.delete(path).await
        }
        async fn exists(&self, path: &str) -> std::io::Result<bool> {
            self.0.exists(path).await
        }
        async fn list(&self, dir: &str) -> std::io::Result<Vec<String>> {
            self.0.list(dir).await
        }
    }

    #[tokio::test]
    async fn test_failed_write_aborts_replace() {
        let f = fixture().await;
        let mut file = saved_file(&f, "keep.pdf", b"keep").await;

        let readonly = FileLifecycle::new(
            Arc::new(RejectingWrites(FilesystemStorage::new(f.storage.root()))),
            StorageConfig::default(),
        );
        let err = readonly
            .replace(&f.files, &mut file, &Payload::new("new.pdf", b"new".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::StorageError { .. }));
        assert_eq!(file.filename.as_deref(), Some("files/keep.pdf"));
        assert!(f.storage.exists("files/keep.pdf").await.unwrap());
        let stored = f.files.get(file.meta.id).await.unwrap().unwrap();
        assert_eq!(stored.filename.as_deref(), Some("files/keep.pdf"));
    }

    #[tokio::test]
    async fn test_invalid_image_payload_rolls_back() {
        let f = fixture().await;
        let mut image = Image::new("Photo");
        image.filename = Some(f.lifecycle.store::<Image>(&Payload::new("a.png", png(2, 2))).await.unwrap());
        image.width = 2;
        image.height = 2;
        let mut image = f.images.create(&image).await.unwrap();

        let err = f
            .lifecycle
            .replace(&f.images, &mut image, &Payload::new("b.png", b"garbage".to_vec()))
            .await
            .unwrap_err();

        assert!(matches!(err, MediaError::ValidationError(_)));
        assert_eq!(image.filename.as_deref(), Some("images/a.png"));
        assert!(!f.storage.exists("images/b.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_image_reads_dimensions() {
        let f = fixture().await;
        let mut image = Image::new("Photo");
        image.filename = Some(f.lifecycle.store::<Image>(&Payload::new("a.png", png(2, 2))).await.unwrap());
        let mut image = f.images.create(&image).await.unwrap();

        f.lifecycle
            .replace(&f.images, &mut image, &Payload::new("b.png", png(5, 3)))
            .await
            .unwrap();

        let stored = f.images.get(image.meta.id).await.unwrap().unwrap();
        assert_eq!((stored.width, stored.height), (5, 3));
        assert_eq!(stored.filename.as_deref(), Some("images/b.png"));
        assert!(!f.storage.exists("images/a.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_respects_shared_paths() {
        let f = fixture().await;
        let mut first = saved_file(&f, "shared.pdf", b"shared").await;
        let mut twin = File::new("Twin");
        twin.filename = first.filename.clone();
        let mut twin = f.files.create(&twin).await.unwrap();

        let removed = f.lifecycle.delete(&f.files, &mut first).await.unwrap();
        assert!(!removed);
        assert_eq!(first.filename, None);
        f.files.update(&first).await.unwrap();
        assert!(f.storage.exists("files/shared.pdf").await.unwrap());

        let removed = f.lifecycle.delete(&f.files, &mut twin).await.unwrap();
        assert!(removed);
        assert!(!f.storage.exists("files/shared.pdf").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_with_missing_payload_still_clears_path() {
        let f = fixture().await;
        let mut file = File::new("Ghost");
        file.filename = Some("files/ghost.pdf".to_string());
        let mut file = f.files.create(&file).await.unwrap();

        assert!(!f.lifecycle.delete(&f.files, &mut file).await.unwrap());
        assert_eq!(file.stored_path(), None);
    }

    #[tokio::test]
    async fn test_apply_form_policy() {
        let f = fixture().await;
        let mut file = saved_file(&f, "a.pdf", b"a").await;

        // Payload wins over the clear flag
        let input = FileFieldInput {
            payload: Some(Payload::new("b.pdf", b"b".to_vec())),
            clear: true,
        };
        let action = f.lifecycle.apply_form(&f.files, &mut file, input).await.unwrap();
        assert_eq!(action, FileAction::Replaced);
        assert_eq!(file.filename.as_deref(), Some("files/b.pdf"));

        let action = f
            .lifecycle
            .apply_form(&f.files, &mut file, FileFieldInput::default())
            .await
            .unwrap();
        assert_eq!(action, FileAction::Unchanged);

        let action = f
            .lifecycle
            .apply_form(&f.files, &mut file, FileFieldInput::clear())
            .await
            .unwrap();
        assert_eq!(action, FileAction::Cleared);
        assert!(!f.storage.exists("files/b.pdf").await.unwrap());
        let stored = f.files.get(file.meta.id).await.unwrap().unwrap();
        assert_eq!(stored.filename, None);
    }

    #[tokio::test]
    async fn test_apply_form_ignores_clear_for_required_payload() {
        let f = fixture().await;
        let mut image = Image::new("Photo");
        image.filename = Some(f.lifecycle.store::<Image>(&Payload::new("a.png", png(1, 1))).await.unwrap());
        let mut image = f.images.create(&image).await.unwrap();

        let action = f
            .lifecycle
            .apply_form(&f.images, &mut image, FileFieldInput::clear())
            .await
            .unwrap();

        assert_eq!(action, FileAction::Unchanged);
        assert_eq!(image.filename.as_deref(), Some("images/a.png"));
        assert!(f.storage.exists("images/a.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_clean_derivatives() {
        let mut config = StorageConfig::default();
        config.thumbnail_prefix = "_thumb_".to_string();
        config.thumbnail_subdir = "_thumbs".to_string();
        let f = fixture_with(config).await;

        for name in [
            "_thumb_photo_100x80_q85.jpg",
            "_thumb_photo_jpg_640x480_crop_sharpen_q90.jpg",
            "_thumb_photo_2_100x80_q85.jpg",
            "_thumb_photo_100x80_q85.png",
            "photo_100x80_q85.jpg",
        ] {
            f.storage
                .write_new(&format!("images/_thumbs/{name}"), b"t")
                .await
                .unwrap();
        }

        let removed = f.lifecycle.clean_derivatives("images/photo.jpg").await.unwrap();

        assert_eq!(removed, 2);
        assert_eq!(
            f.storage.list("images/_thumbs").await.unwrap(),
            vec![
                "_thumb_photo_100x80_q85.png",
                "_thumb_photo_2_100x80_q85.jpg",
                "photo_100x80_q85.jpg",
            ]
        );
    }

    #[tokio::test]
    async fn test_replace_image_sweeps_old_derivatives() {
        let f = fixture().await;
        let mut image = Image::new("Photo");
        image.filename = Some(f.lifecycle.store::<Image>(&Payload::new("a.png", png(1, 1))).await.unwrap());
        let mut image = f.images.create(&image).await.unwrap();
        f.storage.write_new("images/a_50x50_q85.png", b"t").await.unwrap();

        f.lifecycle
            .replace(&f.images, &mut image, &Payload::new("b.png", png(1, 1)))
            .await
            .unwrap();

        assert!(!f.storage.exists("images/a_50x50_q85.png").await.unwrap());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("My Photo (1).JPG"), "My_Photo__1_.JPG");
        assert_eq!(sanitize_file_name("C:\\tmp\\a.pdf"), "a.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "file");
        assert_eq!(sanitize_file_name(".bashrc"), "bashrc");
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
        assert_eq!(split_extension("README"), ("README", ""));
        assert_eq!(join_path("images", "a.jpg"), "images/a.jpg");
        assert_eq!(join_path("", "a.jpg"), "a.jpg");
        assert_eq!(join_path("images", ""), "images");
    }
}
