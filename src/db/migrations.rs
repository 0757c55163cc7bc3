//! Database migrations module
//!
//! Schema for media items and the three relation tables, embedded as SQL for
//! both SQLite and MySQL. Applied versions are tracked in `_migrations`.
//!
//! # Usage
//!
//! ```ignore
//! use mediarel::db::{create_pool, migrations};
//!
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::DynDatabasePool;
use crate::config::DatabaseDriver;

/// A database migration with SQL for both SQLite and MySQL
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number (must be unique and sequential)
    pub version: i32,
    /// Human-readable migration name
    pub name: &'static str,
    /// SQL statements for SQLite
    pub up_sqlite: &'static str,
    /// SQL statements for MySQL
    pub up_mysql: &'static str,
}

/// Migration record stored in the database
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// All schema migrations, in application order.
pub const MIGRATIONS: &[Migration] = &[
    // Media item tables. Images always carry a payload, files may not.
    Migration {
        version: 1,
        name: "create_media_items",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS media_images (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT 1,
                caption TEXT NOT NULL DEFAULT '',
                filename VARCHAR(255) NOT NULL,
                width BIGINT NOT NULL DEFAULT 0,
                height BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_media_images_filename ON media_images(filename);
            CREATE TABLE IF NOT EXISTS media_files (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT 1,
                caption TEXT NOT NULL DEFAULT '',
                filename VARCHAR(255),
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX IF NOT EXISTS idx_media_files_filename ON media_files(filename);
            CREATE TABLE IF NOT EXISTS media_videos (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT 1,
                caption TEXT NOT NULL DEFAULT '',
                url VARCHAR(500) NOT NULL,
                thumbnail_url VARCHAR(500),
                metadata TEXT,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS media_images (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT TRUE,
                caption TEXT NOT NULL,
                filename VARCHAR(255) NOT NULL,
                width BIGINT NOT NULL DEFAULT 0,
                height BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX idx_media_images_filename ON media_images(filename);
            CREATE TABLE IF NOT EXISTS media_files (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT TRUE,
                caption TEXT NOT NULL,
                filename VARCHAR(255) NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
            CREATE INDEX idx_media_files_filename ON media_files(filename);
            CREATE TABLE IF NOT EXISTS media_videos (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(255) NOT NULL DEFAULT '',
                published BOOLEAN NOT NULL DEFAULT TRUE,
                caption TEXT NOT NULL,
                url VARCHAR(500) NOT NULL,
                thumbnail_url VARCHAR(500) NULL,
                metadata TEXT NULL,
                created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
                modified_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            );
        "#,
    },
    // Relation tables: one per item kind, ordered within (owner_type, owner_id)
    Migration {
        version: 2,
        name: "create_media_relations",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS image_relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id INTEGER NOT NULL,
                sort BIGINT DEFAULT 0,
                UNIQUE (owner_type, owner_id, item_id),
                FOREIGN KEY (item_id) REFERENCES media_images(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_image_relations_owner_sort ON image_relations(owner_type, owner_id, sort);
            CREATE INDEX IF NOT EXISTS idx_image_relations_item ON image_relations(item_id);
            CREATE TABLE IF NOT EXISTS file_relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id INTEGER NOT NULL,
                sort BIGINT DEFAULT 0,
                UNIQUE (owner_type, owner_id, item_id),
                FOREIGN KEY (item_id) REFERENCES media_files(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_file_relations_owner_sort ON file_relations(owner_type, owner_id, sort);
            CREATE INDEX IF NOT EXISTS idx_file_relations_item ON file_relations(item_id);
            CREATE TABLE IF NOT EXISTS video_relations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id INTEGER NOT NULL,
                sort BIGINT DEFAULT 0,
                UNIQUE (owner_type, owner_id, item_id),
                FOREIGN KEY (item_id) REFERENCES media_videos(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_video_relations_owner_sort ON video_relations(owner_type, owner_id, sort);
            CREATE INDEX IF NOT EXISTS idx_video_relations_item ON video_relations(item_id);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS image_relations (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id BIGINT NOT NULL,
                sort BIGINT NULL DEFAULT 0,
                UNIQUE KEY uq_image_relations (owner_type, owner_id, item_id),
                INDEX idx_image_relations_owner_sort (owner_type, owner_id, sort),
                FOREIGN KEY (item_id) REFERENCES media_images(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS file_relations (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id BIGINT NOT NULL,
                sort BIGINT NULL DEFAULT 0,
                UNIQUE KEY uq_file_relations (owner_type, owner_id, item_id),
                INDEX idx_file_relations_owner_sort (owner_type, owner_id, sort),
                FOREIGN KEY (item_id) REFERENCES media_files(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS video_relations (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                owner_type VARCHAR(100) NOT NULL,
                owner_id BIGINT NOT NULL,
                item_id BIGINT NOT NULL,
                sort BIGINT NULL DEFAULT 0,
                UNIQUE KEY uq_video_relations (owner_type, owner_id, item_id),
                INDEX idx_video_relations_owner_sort (owner_type, owner_id, sort),
                FOREIGN KEY (item_id) REFERENCES media_videos(id) ON DELETE CASCADE
            );
        "#,
    },
];

/// Run all pending migrations
///
/// Creates the tracking table if needed and applies every migration whose
/// version has not been recorded yet, in order.
///
/// # Returns
///
/// Number of migrations applied
pub async fn run_migrations(pool: &DynDatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = get_applied_migrations(pool).await?;
    let applied_versions: Vec<i32> = applied.iter().map(|m| m.version as i32).collect();

    let mut count = 0;

    for migration in MIGRATIONS {
        if !applied_versions.contains(&migration.version) {
            tracing::info!(
                "Applying migration {}: {}",
                migration.version,
                migration.name
            );
            apply_migration(pool, migration)
                .await
                .with_context(|| format!("Failed to apply migration: {}", migration.name))?;
            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Applied {} migration(s)", count);
    } else {
        tracing::debug!("No pending migrations");
    }

    Ok(count)
}

/// Create the migrations tracking table if it doesn't exist
async fn create_migrations_table(pool: &DynDatabasePool) -> Result<()> {
    let sql = match pool.driver() {
        DatabaseDriver::Sqlite => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
        DatabaseDriver::Mysql => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INT PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#
        }
    };

    pool.execute(sql).await?;
    Ok(())
}

async fn get_applied_migrations(pool: &DynDatabasePool) -> Result<Vec<MigrationRecord>> {
    match pool.driver() {
        DatabaseDriver::Sqlite => get_applied_migrations_sqlite(pool.sqlite_pool()?).await,
        DatabaseDriver::Mysql => get_applied_migrations_mysql(pool.mysql_pool()?).await,
    }
}

async fn get_applied_migrations_sqlite(pool: &SqlitePool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .context("Failed to read applied migrations")?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: row.get("version"),
            name: row.get("name"),
            applied_at: row.get("applied_at"),
        })
        .collect())
}

async fn get_applied_migrations_mysql(pool: &MySqlPool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await
        .context("Failed to read applied migrations")?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: i64::from(row.get::<i32, _>("version")),
            name: row.get("name"),
            applied_at: row.get("applied_at"),
        })
        .collect())
}

async fn apply_migration(pool: &DynDatabasePool, migration: &Migration) -> Result<()> {
    match pool.driver() {
        DatabaseDriver::Sqlite => apply_migration_sqlite(pool.sqlite_pool()?, migration).await,
        DatabaseDriver::Mysql => apply_migration_mysql(pool.mysql_pool()?, migration).await,
    }
}

async fn apply_migration_sqlite(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    // SQLite DDL is transactional, so a failed migration leaves nothing behind
    let mut tx = pool.begin().await?;
    for statement in split_sql_statements(migration.up_sqlite) {
        sqlx::query(statement)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(())
}

async fn apply_migration_mysql(pool: &MySqlPool, migration: &Migration) -> Result<()> {
    // MySQL commits DDL implicitly; statements run one by one
    for statement in split_sql_statements(migration.up_mysql) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name) VALUES (?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .execute(pool)
        .await?;

    Ok(())
}

/// Truncate SQL for error messages
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}

/// Split SQL into individual statements, dropping comment-only fragments
fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty() && !is_comment_only(stmt))
        .collect()
}

/// Check if a string contains only SQL comments
fn is_comment_only(s: &str) -> bool {
    s.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// Check if migrations are up to date
pub async fn is_up_to_date(pool: &DynDatabasePool) -> Result<bool> {
    Ok(pending_count(pool).await? == 0)
}

/// Get pending migrations count
pub async fn pending_count(pool: &DynDatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = get_applied_migrations(pool).await?;
    Ok(MIGRATIONS.len().saturating_sub(applied.len()))
}

/// Get the total number of migrations defined
pub fn total_migrations() -> usize {
    MIGRATIONS.len()
}

/// Get migration by version
pub fn get_migration(version: i32) -> Option<&'static Migration> {
    MIGRATIONS.iter().find(|m| m.version == version)
}
