//! Media item models
//!
//! Images, files and videos share the same metadata block ([`MediaMeta`]) and
//! are handled generically through the [`MediaItem`] trait. Images and files
//! own a payload on storage referenced by a stored path; videos only point at
//! an external URL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::RelationVariant;
use crate::error::MediaError;

/// Fields common to every media item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaMeta {
    /// Unique identifier (0 until persisted)
    pub id: i64,
    pub title: String,
    /// Deselect to keep the item private
    pub published: bool,
    pub caption: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl MediaMeta {
    /// Create metadata for a new, published item.
    ///
    /// The ID will be set to 0 and should be assigned by the database.
    pub fn new(title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            title: title.into(),
            published: true,
            caption: String::new(),
            created_at: now,
            modified_at: now,
        }
    }
}

impl Default for MediaMeta {
    fn default() -> Self {
        Self::new("")
    }
}

/// An uploaded binary payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Client-supplied file name, used to derive the stored name
    pub name: String,
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// A submitted file field: an optional replacement payload plus an optional
/// "clear this file" intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileFieldInput {
    pub payload: Option<Payload>,
    pub clear: bool,
}

impl FileFieldInput {
    /// Submit a replacement payload
    pub fn replace(payload: Payload) -> Self {
        Self {
            payload: Some(payload),
            clear: false,
        }
    }

    /// Ask for the current payload to be removed
    pub fn clear() -> Self {
        Self {
            payload: None,
            clear: true,
        }
    }
}

/// Behaviour shared by every media item kind.
pub trait MediaItem: Clone + Send + Sync + Unpin + 'static {
    /// Relation variant (and item table) this kind belongs to
    const VARIANT: RelationVariant;
    /// Whether the stored path may be cleared without a replacement
    const PATH_NULLABLE: bool;
    /// Whether derivative files (thumbnails) are generated from the payload
    const HAS_DERIVATIVES: bool;

    fn meta(&self) -> &MediaMeta;

    fn meta_mut(&mut self) -> &mut MediaMeta;

    /// Path of the payload on storage, if this item has one
    fn stored_path(&self) -> Option<&str>;

    fn set_stored_path(&mut self, path: Option<String>);

    /// Called after a new payload has been written for this item
    fn payload_stored(&mut self, _payload: &Payload) -> Result<(), MediaError> {
        Ok(())
    }

    fn id(&self) -> i64 {
        self.meta().id
    }

    /// Guess the MIME type from the stored file name
    fn mimetype(&self) -> String {
        self.stored_path()
            .and_then(|path| mime_guess::from_path(path).first())
            .map(|mime| mime.essence_str().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Name of the item kind ("image", "file", "video")
    fn kind(&self) -> &'static str {
        Self::VARIANT.as_str()
    }

    /// Fill an empty title from the stored file name
    fn fill_default_title(&mut self) {
        if !self.meta().title.trim().is_empty() {
            return;
        }
        if let Some(title) = self.stored_path().map(title_from_filename) {
            self.meta_mut().title = title;
        }
    }
}

/// An image with a mandatory payload and its pixel dimensions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Image {
    #[serde(flatten)]
    pub meta: MediaMeta,
    pub filename: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl Image {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            meta: MediaMeta::new(title),
            filename: None,
            width: 0,
            height: 0,
        }
    }
}

impl MediaItem for Image {
    const VARIANT: RelationVariant = RelationVariant::Image;
    const PATH_NULLABLE: bool = false;
    const HAS_DERIVATIVES: bool = true;

    fn meta(&self) -> &MediaMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut MediaMeta {
        &mut self.meta
    }

    fn stored_path(&self) -> Option<&str> {
        self.filename.as_deref().filter(|p| !p.is_empty())
    }

    fn set_stored_path(&mut self, path: Option<String>) {
        self.filename = path;
    }

    fn payload_stored(&mut self, payload: &Payload) -> Result<(), MediaError> {
        // Header only, the pixels are never decoded
        let (width, height) = image::ImageReader::new(std::io::Cursor::new(&payload.data))
            .with_guessed_format()
            .map_err(|e| {
                MediaError::ValidationError(format!("Failed to read image '{}': {}", payload.name, e))
            })?
            .into_dimensions()
            .map_err(|e| {
                MediaError::ValidationError(format!("Failed to decode image '{}': {}", payload.name, e))
            })?;
        self.width = width;
        self.height = height;
        Ok(())
    }
}

/// A generic downloadable file; its payload may be cleared
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct File {
    #[serde(flatten)]
    pub meta: MediaMeta,
    pub filename: Option<String>,
}

impl File {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            meta: MediaMeta::new(title),
            filename: None,
        }
    }
}

impl MediaItem for File {
    const VARIANT: RelationVariant = RelationVariant::File;
    const PATH_NULLABLE: bool = true;
    const HAS_DERIVATIVES: bool = false;

    fn meta(&self) -> &MediaMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut MediaMeta {
        &mut self.meta
    }

    fn stored_path(&self) -> Option<&str> {
        self.filename.as_deref().filter(|p| !p.is_empty())
    }

    fn set_stored_path(&mut self, path: Option<String>) {
        self.filename = path;
    }
}

/// Metadata about an externally hosted video, as returned by the provider
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub thumbnail_url: Option<String>,
    /// Full provider response, cached verbatim
    #[serde(default)]
    pub raw: serde_json::Value,
}

/// A video hosted elsewhere
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Video {
    #[serde(flatten)]
    pub meta: MediaMeta,
    pub url: String,
    pub thumbnail_url: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl Video {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            meta: MediaMeta::new(""),
            url: url.into(),
            thumbnail_url: None,
            metadata: None,
        }
    }

    /// Copy cached provider information onto this video.
    ///
    /// An empty title is filled from the provider title.
    pub fn apply_info(&mut self, info: &VideoInfo) {
        self.thumbnail_url = info.thumbnail_url.clone();
        if self.meta.title.trim().is_empty() {
            if let Some(title) = &info.title {
                self.meta.title = title.clone();
            }
        }
        if !info.raw.is_null() {
            self.metadata = Some(info.raw.clone());
        }
    }
}

impl MediaItem for Video {
    const VARIANT: RelationVariant = RelationVariant::Video;
    const PATH_NULLABLE: bool = true;
    const HAS_DERIVATIVES: bool = false;

    fn meta(&self) -> &MediaMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut MediaMeta {
        &mut self.meta
    }

    fn stored_path(&self) -> Option<&str> {
        None
    }

    fn set_stored_path(&mut self, _path: Option<String>) {}
}

/// Derive a display title from a stored path.
///
/// `"images/my_holiday_photo.jpg"` becomes `"My Holiday Photo"`.
pub fn title_from_filename(path: &str) -> String {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let stem = match name.rfind('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    };

    let mut title = String::with_capacity(stem.len());
    let mut at_word_start = true;
    for c in stem.replace('_', " ").chars() {
        if c.is_alphabetic() {
            if at_word_start {
                title.extend(c.to_uppercase());
            } else {
                title.extend(c.to_lowercase());
            }
            at_word_start = false;
        } else {
            title.push(c);
            at_word_start = true;
        }
    }
    title
}
