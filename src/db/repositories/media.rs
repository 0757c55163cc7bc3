//! Media item repository
//!
//! One generic repository serves all three item tables. The per-kind column
//! layout lives in [`MediaRow`]; the shared metadata columns (title,
//! published, caption, timestamps) are handled here.

use crate::config::DatabaseDriver;
use crate::db::DynDatabasePool;
use crate::models::{File, Image, MediaItem, MediaMeta, Partition, Video};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::mysql::{MySqlArguments, MySqlRow};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{MySql, MySqlPool, Row, Sqlite, SqlitePool};
use std::marker::PhantomData;
use std::sync::Arc;

const META_COLUMNS: &[&str] = &[
    "id",
    "title",
    "published",
    "caption",
    "created_at",
    "modified_at",
];

/// Table layout of one media item kind
pub trait MediaRow: MediaItem {
    /// Kind-specific columns, in bind order
    const COLUMNS: &'static [&'static str];

    /// Column holding the stored payload path, if the kind has one
    const PATH_COLUMN: Option<&'static str>;

    fn from_sqlite_row(row: &SqliteRow) -> Result<Self>;

    fn from_mysql_row(row: &MySqlRow) -> Result<Self>;

    /// Bind [`COLUMNS`](Self::COLUMNS) in order
    fn bind_sqlite<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>>;

    /// Bind [`COLUMNS`](Self::COLUMNS) in order
    fn bind_mysql<'q>(
        &self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments>;
}

/// Media item repository trait
#[async_trait]
pub trait MediaRepository<M: MediaRow>: Send + Sync {
    /// Insert a new item; the returned copy carries the assigned id
    async fn create(&self, item: &M) -> Result<M>;

    async fn get(&self, id: i64) -> Result<Option<M>>;

    /// All items, oldest first
    async fn list(&self) -> Result<Vec<M>>;

    /// Published items only, oldest first
    async fn published(&self) -> Result<Vec<M>>;

    /// Persist every column of an existing item
    async fn update(&self, item: &M) -> Result<M>;

    /// Delete the item and every relation row pointing at it.
    ///
    /// Returns `false` if the item did not exist.
    async fn delete(&self, id: i64) -> Result<bool>;

    /// Number of items whose stored path equals `path`, ignoring `exclude_id`
    async fn count_path_references(&self, path: &str, exclude_id: Option<i64>) -> Result<u64>;

    /// Items related to an owner, in relation order
    async fn for_owner(&self, partition: &Partition) -> Result<Vec<M>>;

    /// Number of owners the item is related to
    async fn relation_count(&self, item_id: i64) -> Result<u64>;
}

/// SQLx-based media repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxMediaRepository<M> {
    pool: DynDatabasePool,
    _kind: PhantomData<fn() -> M>,
}

impl<M: MediaRow> SqlxMediaRepository<M> {
    /// Create a new SQLx media repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self {
            pool,
            _kind: PhantomData,
        }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn MediaRepository<M>> {
        Arc::new(Self::new(pool))
    }
}

#[async_trait]
impl<M: MediaRow> MediaRepository<M> for SqlxMediaRepository<M> {
    async fn create(&self, item: &M) -> Result<M> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => create_item_sqlite(self.pool.sqlite_pool()?, item).await,
            DatabaseDriver::Mysql => create_item_mysql(self.pool.mysql_pool()?, item).await,
        }
    }

    async fn get(&self, id: i64) -> Result<Option<M>> {
        let sql = format!("{} WHERE id = ?", select_sql::<M>());
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let row = sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(self.pool.sqlite_pool()?)
                    .await
                    .with_context(|| format!("Failed to get {} {}", M::VARIANT, id))?;
                row.as_ref().map(M::from_sqlite_row).transpose()
            }
            DatabaseDriver::Mysql => {
                let row = sqlx::query(&sql)
                    .bind(id)
                    .fetch_optional(self.pool.mysql_pool()?)
                    .await
                    .with_context(|| format!("Failed to get {} {}", M::VARIANT, id))?;
                row.as_ref().map(M::from_mysql_row).transpose()
            }
        }
    }

    async fn list(&self) -> Result<Vec<M>> {
        let sql = format!("{} ORDER BY id", select_sql::<M>());
        self.fetch_all(&sql).await
    }

    async fn published(&self) -> Result<Vec<M>> {
        let sql = format!("{} WHERE published = ? ORDER BY id", select_sql::<M>());
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = sqlx::query(&sql)
                    .bind(true)
                    .fetch_all(self.pool.sqlite_pool()?)
                    .await
                    .context("Failed to list published items")?;
                rows.iter().map(M::from_sqlite_row).collect()
            }
            DatabaseDriver::Mysql => {
                let rows = sqlx::query(&sql)
                    .bind(true)
                    .fetch_all(self.pool.mysql_pool()?)
                    .await
                    .context("Failed to list published items")?;
                rows.iter().map(M::from_mysql_row).collect()
            }
        }
    }

    async fn update(&self, item: &M) -> Result<M> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => update_item_sqlite(self.pool.sqlite_pool()?, item).await,
            DatabaseDriver::Mysql => update_item_mysql(self.pool.mysql_pool()?, item).await,
        }
    }

    async fn delete(&self, id: i64) -> Result<bool> {
        let relations_sql = format!(
            "DELETE FROM {} WHERE item_id = ?",
            M::VARIANT.relation_table()
        );
        let item_sql = format!("DELETE FROM {} WHERE id = ?", M::VARIANT.item_table());

        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut tx = self.pool.sqlite_pool()?.begin().await?;
                sqlx::query(&relations_sql)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to delete item relations")?;
                let result = sqlx::query(&item_sql)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to delete {} {}", M::VARIANT, id))?;
                tx.commit().await?;
                result.rows_affected()
            }
            DatabaseDriver::Mysql => {
                let mut tx = self.pool.mysql_pool()?.begin().await?;
                sqlx::query(&relations_sql)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .context("Failed to delete item relations")?;
                let result = sqlx::query(&item_sql)
                    .bind(id)
                    .execute(&mut *tx)
                    .await
                    .with_context(|| format!("Failed to delete {} {}", M::VARIANT, id))?;
                tx.commit().await?;
                result.rows_affected()
            }
        };

        Ok(affected > 0)
    }

    async fn count_path_references(&self, path: &str, exclude_id: Option<i64>) -> Result<u64> {
        let Some(column) = M::PATH_COLUMN else {
            return Ok(0);
        };
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE {} = ? AND id <> ?",
            M::VARIANT.item_table(),
            column
        );
        // Persisted ids start at 1, so 0 excludes nothing
        let exclude = exclude_id.unwrap_or(0);

        let count: i64 = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query_scalar(&sql)
                .bind(path)
                .bind(exclude)
                .fetch_one(self.pool.sqlite_pool()?)
                .await
                .context("Failed to count path references")?,
            DatabaseDriver::Mysql => sqlx::query_scalar(&sql)
                .bind(path)
                .bind(exclude)
                .fetch_one(self.pool.mysql_pool()?)
                .await
                .context("Failed to count path references")?,
        };
        Ok(count as u64)
    }

    async fn for_owner(&self, partition: &Partition) -> Result<Vec<M>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM {} m
            INNER JOIN {} r ON r.item_id = m.id
            WHERE r.owner_type = ? AND r.owner_id = ?
            ORDER BY r.sort, r.id
            "#,
            column_list::<M>("m."),
            M::VARIANT.item_table(),
            M::VARIANT.relation_table()
        );

        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = sqlx::query(&sql)
                    .bind(&partition.owner_type)
                    .bind(partition.owner_id)
                    .fetch_all(self.pool.sqlite_pool()?)
                    .await
                    .with_context(|| format!("Failed to load {} items for {}", M::VARIANT, partition))?;
                rows.iter().map(M::from_sqlite_row).collect()
            }
            DatabaseDriver::Mysql => {
                let rows = sqlx::query(&sql)
                    .bind(&partition.owner_type)
                    .bind(partition.owner_id)
                    .fetch_all(self.pool.mysql_pool()?)
                    .await
                    .with_context(|| format!("Failed to load {} items for {}", M::VARIANT, partition))?;
                rows.iter().map(M::from_mysql_row).collect()
            }
        }
    }

    async fn relation_count(&self, item_id: i64) -> Result<u64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE item_id = ?",
            M::VARIANT.relation_table()
        );
        let count: i64 = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query_scalar(&sql)
                .bind(item_id)
                .fetch_one(self.pool.sqlite_pool()?)
                .await
                .context("Failed to count item relations")?,
            DatabaseDriver::Mysql => sqlx::query_scalar(&sql)
                .bind(item_id)
                .fetch_one(self.pool.mysql_pool()?)
                .await
                .context("Failed to count item relations")?,
        };
        Ok(count as u64)
    }
}

impl<M: MediaRow> SqlxMediaRepository<M> {
    async fn fetch_all(&self, sql: &str) -> Result<Vec<M>> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let rows = sqlx::query(sql)
                    .fetch_all(self.pool.sqlite_pool()?)
                    .await
                    .with_context(|| format!("Failed to list {} items", M::VARIANT))?;
                rows.iter().map(M::from_sqlite_row).collect()
            }
            DatabaseDriver::Mysql => {
                let rows = sqlx::query(sql)
                    .fetch_all(self.pool.mysql_pool()?)
                    .await
                    .with_context(|| format!("Failed to list {} items", M::VARIANT))?;
                rows.iter().map(M::from_mysql_row).collect()
            }
        }
    }
}

fn column_list<M: MediaRow>(prefix: &str) -> String {
    META_COLUMNS
        .iter()
        .chain(M::COLUMNS)
        .map(|c| format!("{prefix}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql<M: MediaRow>() -> String {
    format!(
        "SELECT {} FROM {}",
        column_list::<M>(""),
        M::VARIANT.item_table()
    )
}

fn insert_sql<M: MediaRow>() -> String {
    let columns = ["title", "published", "caption", "created_at", "modified_at"]
        .iter()
        .chain(M::COLUMNS)
        .copied()
        .collect::<Vec<_>>();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        M::VARIANT.item_table(),
        columns.join(", "),
        vec!["?"; columns.len()].join(", ")
    )
}

fn update_sql<M: MediaRow>() -> String {
    let assignments = ["title", "published", "caption", "modified_at"]
        .iter()
        .chain(M::COLUMNS)
        .map(|c| format!("{c} = ?"))
        .collect::<Vec<_>>();
    format!(
        "UPDATE {} SET {} WHERE id = ?",
        M::VARIANT.item_table(),
        assignments.join(", ")
    )
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_item_sqlite<M: MediaRow>(pool: &SqlitePool, item: &M) -> Result<M> {
    let now = Utc::now();
    let sql = insert_sql::<M>();
    let meta = item.meta();

    let query = sqlx::query(&sql)
        .bind(meta.title.clone())
        .bind(meta.published)
        .bind(meta.caption.clone())
        .bind(now)
        .bind(now);
    let result = item
        .bind_sqlite(query)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to create {}", M::VARIANT))?;

    let mut created = item.clone();
    let meta = created.meta_mut();
    meta.id = result.last_insert_rowid();
    meta.created_at = now;
    meta.modified_at = now;
    Ok(created)
}

async fn update_item_sqlite<M: MediaRow>(pool: &SqlitePool, item: &M) -> Result<M> {
    let now = Utc::now();
    let sql = update_sql::<M>();
    let meta = item.meta();

    let query = sqlx::query(&sql)
        .bind(meta.title.clone())
        .bind(meta.published)
        .bind(meta.caption.clone())
        .bind(now);
    item.bind_sqlite(query)
        .bind(meta.id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to update {} {}", M::VARIANT, meta.id))?;

    let mut updated = item.clone();
    updated.meta_mut().modified_at = now;
    Ok(updated)
}

fn meta_from_sqlite_row(row: &SqliteRow) -> MediaMeta {
    MediaMeta {
        id: row.get("id"),
        title: row.get("title"),
        published: row.get("published"),
        caption: row.get("caption"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    }
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_item_mysql<M: MediaRow>(pool: &MySqlPool, item: &M) -> Result<M> {
    let now = Utc::now();
    let sql = insert_sql::<M>();
    let meta = item.meta();

    let query = sqlx::query(&sql)
        .bind(meta.title.clone())
        .bind(meta.published)
        .bind(meta.caption.clone())
        .bind(now)
        .bind(now);
    let result = item
        .bind_mysql(query)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to create {}", M::VARIANT))?;

    let mut created = item.clone();
    let meta = created.meta_mut();
    meta.id = result.last_insert_id() as i64;
    meta.created_at = now;
    meta.modified_at = now;
    Ok(created)
}

async fn update_item_mysql<M: MediaRow>(pool: &MySqlPool, item: &M) -> Result<M> {
    let now = Utc::now();
    let sql = update_sql::<M>();
    let meta = item.meta();

    let query = sqlx::query(&sql)
        .bind(meta.title.clone())
        .bind(meta.published)
        .bind(meta.caption.clone())
        .bind(now);
    item.bind_mysql(query)
        .bind(meta.id)
        .execute(pool)
        .await
        .with_context(|| format!("Failed to update {} {}", M::VARIANT, meta.id))?;

    let mut updated = item.clone();
    updated.meta_mut().modified_at = now;
    Ok(updated)
}

fn meta_from_mysql_row(row: &MySqlRow) -> MediaMeta {
    MediaMeta {
        id: row.get("id"),
        title: row.get("title"),
        published: row.get("published"),
        caption: row.get("caption"),
        created_at: row.get("created_at"),
        modified_at: row.get("modified_at"),
    }
}

// ============================================================================
// Per-kind row layouts
// ============================================================================

fn dimension(value: i64, column: &str) -> Result<u32> {
    u32::try_from(value).with_context(|| format!("Invalid image {}: {}", column, value))
}

fn parse_metadata(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    raw.map(|text| serde_json::from_str(&text).context("Invalid video metadata"))
        .transpose()
}

fn metadata_text(value: &Option<serde_json::Value>) -> Option<String> {
    value.as_ref().map(|v| v.to_string())
}

impl MediaRow for Image {
    const COLUMNS: &'static [&'static str] = &["filename", "width", "height"];
    const PATH_COLUMN: Option<&'static str> = Some("filename");

    fn from_sqlite_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_sqlite_row(row),
            filename: row.get("filename"),
            width: dimension(row.get("width"), "width")?,
            height: dimension(row.get("height"), "height")?,
        })
    }

    fn from_mysql_row(row: &MySqlRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_mysql_row(row),
            filename: row.get("filename"),
            width: dimension(row.get("width"), "width")?,
            height: dimension(row.get("height"), "height")?,
        })
    }

    fn bind_sqlite<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.filename.clone())
            .bind(i64::from(self.width))
            .bind(i64::from(self.height))
    }

    fn bind_mysql<'q>(
        &self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments> {
        query
            .bind(self.filename.clone())
            .bind(i64::from(self.width))
            .bind(i64::from(self.height))
    }
}

impl MediaRow for File {
    const COLUMNS: &'static [&'static str] = &["filename"];
    const PATH_COLUMN: Option<&'static str> = Some("filename");

    fn from_sqlite_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_sqlite_row(row),
            filename: row.get("filename"),
        })
    }

    fn from_mysql_row(row: &MySqlRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_mysql_row(row),
            filename: row.get("filename"),
        })
    }

    fn bind_sqlite<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query.bind(self.filename.clone())
    }

    fn bind_mysql<'q>(
        &self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments> {
        query.bind(self.filename.clone())
    }
}

impl MediaRow for Video {
    const COLUMNS: &'static [&'static str] = &["url", "thumbnail_url", "metadata"];
    const PATH_COLUMN: Option<&'static str> = None;

    fn from_sqlite_row(row: &SqliteRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_sqlite_row(row),
            url: row.get("url"),
            thumbnail_url: row.get("thumbnail_url"),
            metadata: parse_metadata(row.get("metadata"))?,
        })
    }

    fn from_mysql_row(row: &MySqlRow) -> Result<Self> {
        Ok(Self {
            meta: meta_from_mysql_row(row),
            url: row.get("url"),
            thumbnail_url: row.get("thumbnail_url"),
            metadata: parse_metadata(row.get("metadata"))?,
        })
    }

    fn bind_sqlite<'q>(
        &self,
        query: Query<'q, Sqlite, SqliteArguments<'q>>,
    ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
        query
            .bind(self.url.clone())
            .bind(self.thumbnail_url.clone())
            .bind(metadata_text(&self.metadata))
    }

    fn bind_mysql<'q>(
        &self,
        query: Query<'q, MySql, MySqlArguments>,
    ) -> Query<'q, MySql, MySqlArguments> {
        query
            .bind(self.url.clone())
            .bind(self.thumbnail_url.clone())
            .bind(metadata_text(&self.metadata))
    }
}
