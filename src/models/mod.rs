//! Data models
//!
//! This module contains the data structures shared by the registry, the
//! repositories and the services:
//! - Media items (Image, File, Video) and their common metadata
//! - Relation rows, owner references and partitions
//! - Payload and file-field inputs

mod media;
mod relation;

pub use media::{
    title_from_filename, File, FileFieldInput, Image, MediaItem, MediaMeta, Payload, Video,
    VideoInfo,
};
pub use relation::{MediaRelation, OwnerRef, Partition, RelationVariant, ReplaceOutcome};
