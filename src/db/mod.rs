//! Database layer
//!
//! Media items and their relation rows are persisted through sqlx on either
//! backend:
//! - SQLite (default, single file or in-memory)
//! - MySQL
//!
//! # Usage
//!
//! ```ignore
//! use mediarel::config::DatabaseConfig;
//! use mediarel::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//! pool.ping().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DynDatabasePool, MysqlDatabase, SqliteDatabase,
};
