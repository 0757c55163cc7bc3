//! Services layer - Business logic
//!
//! This module contains the operations callers use on top of the
//! repositories:
//! - `relations`: per-owner managers for ordered related media
//! - `media`: item CRUD that drives the payload lifecycle
//! - `file_lifecycle`: storing, replacing and reference-counted deletion of
//!   payloads, plus derivative cleanup
//! - `locks`: keyed async locks guarding partitions and stored paths

pub mod file_lifecycle;
pub mod locks;
pub mod media;
pub mod relations;

pub use file_lifecycle::{FileAction, FileLifecycle};
pub use locks::KeyedLocks;
pub use media::MediaService;
pub use relations::{FieldManager, MediaRelations, RelatedMedia};
