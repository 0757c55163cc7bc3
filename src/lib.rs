//! Mediarel - Polymorphic media relations with reference-counted payloads
//!
//! Owners of any registered type hold ordered, deduplicated collections of
//! images, files and videos. Media items own payloads on storage that are
//! only deleted once no other item references the same stored path.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod registry;
pub mod services;
pub mod storage;

pub use error::MediaError;
