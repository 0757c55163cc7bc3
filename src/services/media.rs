//! Media item service
//!
//! Implements the item-side lifecycle for images, files and videos:
//! - Creating items with an uploaded payload or an already stored one
//! - Updating metadata and applying submitted file fields
//! - Deleting items together with their relation rows and, when no other
//!   item shares it, their payload

use std::sync::Arc;
use tracing::{info, warn};

use crate::db::repositories::{MediaRepository, MediaRow, SqlxMediaRepository};
use crate::db::DynDatabasePool;
use crate::error::MediaError;
use crate::models::{FileFieldInput, Payload, Video, VideoInfo};
use crate::services::file_lifecycle::{FileAction, FileLifecycle};

/// Service for one media item kind
pub struct MediaService<M: MediaRow> {
    repo: Arc<dyn MediaRepository<M>>,
    files: Arc<FileLifecycle>,
}

impl<M: MediaRow> MediaService<M> {
    /// Create a new media service
    ///
    /// # Arguments
    /// * `repo` - Repository for the item table
    /// * `files` - Payload lifecycle shared by every item kind
    pub fn new(repo: Arc<dyn MediaRepository<M>>, files: Arc<FileLifecycle>) -> Self {
        Self { repo, files }
    }

    /// Create a service backed by the SQLx repository
    pub fn from_pool(pool: DynDatabasePool, files: Arc<FileLifecycle>) -> Self {
        Self::new(SqlxMediaRepository::boxed(pool), files)
    }

    pub fn repository(&self) -> &Arc<dyn MediaRepository<M>> {
        &self.repo
    }

    /// Create a new item, storing `payload` first if one is given.
    ///
    /// An empty title is filled from the stored file name. If the row
    /// cannot be inserted the freshly stored payload is removed again.
    ///
    /// # Errors
    /// - `ValidationError` if the kind requires a payload and none is given,
    ///   or the payload is rejected
    /// - `StorageError` if the payload cannot be written
    pub async fn create(&self, mut item: M, payload: Option<Payload>) -> Result<M, MediaError> {
        let Some(payload) = payload else {
            if !M::PATH_NULLABLE && item.stored_path().is_none() {
                return Err(MediaError::ValidationError(format!(
                    "A new {} requires a payload",
                    M::VARIANT
                )));
            }
            item.fill_default_title();
            let created = self.repo.create(&item).await?;
            info!(kind = M::VARIANT.as_str(), id = created.id(), "Created media item");
            return Ok(created);
        };

        let path = self.files.store::<M>(&payload).await?;
        item.set_stored_path(Some(path.clone()));
        item.fill_default_title();

        let created = match item.payload_stored(&payload) {
            Ok(()) => self.repo.create(&item).await.map_err(MediaError::from),
            Err(e) => Err(e),
        };
        let created = match created {
            Ok(created) => created,
            Err(e) => {
                self.discard(&path).await;
                return Err(e);
            }
        };

        self.files.sweep_derivatives::<M>(&path).await;
        info!(kind = M::VARIANT.as_str(), id = created.id(), path = %path, "Created media item");
        Ok(created)
    }

    /// Create an item that shares a payload already on storage.
    ///
    /// The path lock is held across the existence check and the insert, so
    /// a concurrent delete of the last other referencer cannot remove the
    /// payload underneath the new row.
    ///
    /// # Errors
    /// - `ValidationError` if this kind has no payload or nothing is stored
    ///   at `path`
    pub async fn attach_existing(&self, mut item: M, path: &str) -> Result<M, MediaError> {
        if M::PATH_COLUMN.is_none() {
            return Err(MediaError::ValidationError(format!(
                "{} items do not store payloads",
                M::VARIANT
            )));
        }

        let _guard = self.files.lock_path(path).await;
        let storage = self.files.storage();
        let exists = storage
            .exists(path)
            .await
            .map_err(|e| MediaError::storage(path, e))?;
        if !exists {
            return Err(MediaError::ValidationError(format!(
                "No payload stored at '{}'",
                path
            )));
        }

        if M::HAS_DERIVATIVES {
            let data = storage
                .read(path)
                .await
                .map_err(|e| MediaError::storage(path, e))?;
            item.payload_stored(&Payload::new(path, data))?;
        }
        item.set_stored_path(Some(path.to_string()));
        item.fill_default_title();

        let created = self.repo.create(&item).await?;
        info!(kind = M::VARIANT.as_str(), id = created.id(), path = %path, "Attached stored payload");
        Ok(created)
    }

    /// Get an item by ID
    ///
    /// # Errors
    /// - `NotFound` if the item does not exist
    pub async fn get(&self, id: i64) -> Result<M, MediaError> {
        self.find(id)
            .await?
            .ok_or_else(|| MediaError::not_found(M::VARIANT, format!("no item with id {}", id)))
    }

    pub async fn find(&self, id: i64) -> Result<Option<M>, MediaError> {
        Ok(self.repo.get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<M>, MediaError> {
        Ok(self.repo.list().await?)
    }

    /// Published items only
    pub async fn published(&self) -> Result<Vec<M>, MediaError> {
        Ok(self.repo.published().await?)
    }

    /// Save metadata changes and apply a submitted file field.
    ///
    /// # Returns
    /// The stored item and what happened to its payload
    ///
    /// # Errors
    /// - `NotFound` if the item was never persisted or no longer exists
    pub async fn update(
        &self,
        mut item: M,
        input: FileFieldInput,
    ) -> Result<(M, FileAction), MediaError> {
        if item.id() <= 0 || self.repo.get(item.id()).await?.is_none() {
            return Err(MediaError::not_found(
                M::VARIANT,
                format!("no item with id {}", item.id()),
            ));
        }

        let action = self
            .files
            .apply_form(self.repo.as_ref(), &mut item, input)
            .await?;
        item.fill_default_title();
        let updated = self.repo.update(&item).await?;
        // Thumbnails of the current payload are stale after any save
        if let Some(path) = updated.stored_path() {
            self.files.sweep_derivatives::<M>(path).await;
        }
        Ok((updated, action))
    }

    /// Delete an item, its relation rows and, if nothing else shares it,
    /// its payload.
    ///
    /// The row and its relations are removed in one transaction before the
    /// payload is released.
    ///
    /// # Errors
    /// - `NotFound` if the item does not exist
    /// - `StorageError` if the payload cannot be removed; the row is gone
    ///   by then
    pub async fn delete(&self, id: i64) -> Result<(), MediaError> {
        let item = self.get(id).await?;
        if !self.repo.delete(id).await? {
            return Err(MediaError::not_found(
                M::VARIANT,
                format!("no item with id {}", id),
            ));
        }

        if let Some(path) = item.stored_path() {
            if self.files.release(self.repo.as_ref(), path, None).await? {
                self.files.sweep_derivatives::<M>(path).await;
            }
        }

        info!(kind = M::VARIANT.as_str(), id, "Deleted media item");
        Ok(())
    }

    /// Number of owners the item is related to
    pub async fn relation_count(&self, id: i64) -> Result<u64, MediaError> {
        Ok(self.repo.relation_count(id).await?)
    }

    async fn discard(&self, path: &str) {
        if let Err(e) = self.files.storage().delete(path).await {
            warn!(path = %path, error = %e, "Failed to remove unused payload");
        }
    }
}

impl MediaService<Video> {
    /// Create a video, copying cached provider information onto it first
    ///
    /// # Errors
    /// - `ValidationError` if the URL is empty
    pub async fn create_video(
        &self,
        mut video: Video,
        info: Option<VideoInfo>,
    ) -> Result<Video, MediaError> {
        if video.url.trim().is_empty() {
            return Err(MediaError::ValidationError(
                "Video URL cannot be empty".to_string(),
            ));
        }
        if let Some(info) = &info {
            video.apply_info(info);
        }
        self.create(video, None).await
    }
}
