//! Database repositories
//!
//! Repository pattern implementations for database access:
//! - `media`: the three media item tables behind one generic repository
//! - `relation`: owner -> item relation rows for every variant

pub mod media;
pub mod relation;

pub use media::{MediaRepository, MediaRow, SqlxMediaRepository};
pub use relation::{RelationRepository, SqlxRelationRepository};
