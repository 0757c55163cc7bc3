//! Relation model
//!
//! Owner references, partitions and relation rows shared by every
//! relation variant (image, file, video).

use serde::{Deserialize, Serialize};

use crate::error::MediaError;

/// The concrete association table a relation row lives in.
///
/// Each media item kind has exactly one variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationVariant {
    /// `image_relations` -> `media_images`
    Image,
    /// `file_relations` -> `media_files`
    File,
    /// `video_relations` -> `media_videos`
    Video,
}

impl RelationVariant {
    /// Every variant, in table creation order
    pub const ALL: [RelationVariant; 3] = [Self::Image, Self::File, Self::Video];

    /// Table holding the relation rows of this variant
    pub fn relation_table(self) -> &'static str {
        match self {
            Self::Image => "image_relations",
            Self::File => "file_relations",
            Self::Video => "video_relations",
        }
    }

    /// Table holding the media items of this variant
    pub fn item_table(self) -> &'static str {
        match self {
            Self::Image => "media_images",
            Self::File => "media_files",
            Self::Video => "media_videos",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::File => "file",
            Self::Video => "video",
        }
    }
}

impl std::fmt::Display for RelationVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RelationVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" | "images" => Ok(Self::Image),
            "file" | "files" => Ok(Self::File),
            "video" | "videos" => Ok(Self::Video),
            _ => Err(anyhow::anyhow!("Invalid relation variant: {}", s)),
        }
    }
}

/// A typed reference to an owner entity.
///
/// `id` is `None` until the owner has been persisted; relation managers
/// refuse to operate on such owners.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef {
    /// Owner type tag, as declared in the content registry
    pub owner_type: String,
    /// Persisted identity
    pub id: Option<i64>,
}

impl OwnerRef {
    /// Reference a persisted owner
    pub fn new(owner_type: impl Into<String>, id: i64) -> Self {
        Self {
            owner_type: owner_type.into(),
            id: Some(id),
        }
    }

    /// Reference an owner that has not been saved yet
    pub fn unsaved(owner_type: impl Into<String>) -> Self {
        Self {
            owner_type: owner_type.into(),
            id: None,
        }
    }

    /// Resolve the partition this owner's relations live in.
    ///
    /// # Errors
    /// - `UnboundOwner` if the owner has no id
    pub fn partition(&self, variant: RelationVariant) -> Result<Partition, MediaError> {
        match self.id {
            Some(id) => Ok(Partition::new(self.owner_type.clone(), id)),
            None => Err(MediaError::UnboundOwner {
                owner_type: self.owner_type.clone(),
                variant,
            }),
        }
    }
}

/// The `(owner_type, owner_id)` pair relation rows are ordered within
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Partition {
    pub owner_type: String,
    pub owner_id: i64,
}

impl Partition {
    pub fn new(owner_type: impl Into<String>, owner_id: i64) -> Self {
        Self {
            owner_type: owner_type.into(),
            owner_id,
        }
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.owner_type, self.owner_id)
    }
}

/// A single owner -> item link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRelation {
    /// Row identity, also the ordering tie-break
    pub id: i64,
    pub variant: RelationVariant,
    pub owner_type: String,
    pub owner_id: i64,
    pub item_id: i64,
    /// Position within the partition (ascending)
    pub sort: Option<i64>,
}

/// Result of replacing the full related set of an owner
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaceOutcome {
    /// Number of relation rows removed
    pub removed: u64,
    /// Relation rows created, in the order they were appended
    pub added: Vec<MediaRelation>,
}
