//! Relation repository
//!
//! Owner -> item links for all three relation variants. Rows are partitioned
//! by `(owner_type, owner_id)` and ordered by `sort`, with the row id as the
//! tie-break.
//!
//! Append positions come from the store: `max(sort) + 1` inside the
//! partition, computed in the same transaction as the insert while the
//! partition lock is held. On MySQL the read also takes `FOR UPDATE` locks so
//! other processes serialize on the same partition.

use crate::db::DynDatabasePool;
use crate::error::MediaError;
use crate::models::{MediaRelation, Partition, RelationVariant, ReplaceOutcome};
use crate::config::DatabaseDriver;
use crate::services::locks::KeyedLocks;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::mysql::MySqlRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{MySqlConnection, MySqlPool, Row, SqliteConnection, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;

type PartitionKey = (RelationVariant, String, i64);

/// Relation repository trait
#[async_trait]
pub trait RelationRepository: Send + Sync {
    /// Insert one relation row.
    ///
    /// Without an explicit `sort` the row is appended at the end of the
    /// partition.
    ///
    /// # Errors
    /// - `ConstraintViolation` if the item is already related to the owner
    /// - `DanglingReference` if the item does not exist
    async fn insert(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
        sort: Option<i64>,
    ) -> Result<MediaRelation, MediaError>;

    /// Append every item not yet related, in the given order.
    ///
    /// Items already related (or repeated in `item_ids`) are skipped.
    async fn append(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<Vec<MediaRelation>, MediaError>;

    /// Make the related set exactly `item_ids`.
    ///
    /// Rows for items outside `item_ids` are deleted; rows that stay keep
    /// their sort; missing items are appended in the given order.
    async fn replace(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<ReplaceOutcome, MediaError>;

    /// All rows of the partition, ordered by sort then row id
    async fn list(
        &self,
        variant: RelationVariant,
        partition: &Partition,
    ) -> Result<Vec<MediaRelation>, MediaError>;

    /// The row linking `item_id` to the partition, if any
    async fn get(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
    ) -> Result<Option<MediaRelation>, MediaError>;

    /// Number of rows in the partition
    async fn count(&self, variant: RelationVariant, partition: &Partition)
        -> Result<u64, MediaError>;

    /// Delete the rows for exactly these items; absent items are ignored
    async fn remove(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<u64, MediaError>;

    /// Delete every row in the partition
    async fn clear(&self, variant: RelationVariant, partition: &Partition)
        -> Result<u64, MediaError>;

    /// Overwrite the sort of one row. Returns `false` if no row matches.
    async fn set_sort(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
        sort: i64,
    ) -> Result<bool, MediaError>;

    /// Delete the owner's rows across every relation variant
    async fn delete_for_owner(&self, owner_type: &str, owner_id: i64) -> Result<u64, MediaError>;

    /// Number of owners an item is related to
    async fn count_for_item(&self, variant: RelationVariant, item_id: i64)
        -> Result<u64, MediaError>;
}

/// SQLx-based relation repository implementation
///
/// Supports both SQLite and MySQL databases. Share one instance per pool:
/// the partition locks live in the repository.
pub struct SqlxRelationRepository {
    pool: DynDatabasePool,
    locks: KeyedLocks<PartitionKey>,
}

impl SqlxRelationRepository {
    /// Create a new SQLx relation repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self {
            pool,
            locks: KeyedLocks::new(),
        }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn RelationRepository> {
        Arc::new(Self::new(pool))
    }

    async fn lock_partition(
        &self,
        variant: RelationVariant,
        partition: &Partition,
    ) -> tokio::sync::OwnedMutexGuard<()> {
        self.locks
            .lock((variant, partition.owner_type.clone(), partition.owner_id))
            .await
    }
}

#[async_trait]
impl RelationRepository for SqlxRelationRepository {
    async fn insert(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
        sort: Option<i64>,
    ) -> Result<MediaRelation, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let pool = self.pool.sqlite_pool()?;
                let mut tx = pool.begin().await.context("Failed to begin transaction")?;
                let row = insert_row_sqlite(&mut tx, variant, partition, item_id, sort).await?;
                tx.commit().await.context("Failed to commit relation insert")?;
                Ok(row)
            }
            DatabaseDriver::Mysql => {
                let pool = self.pool.mysql_pool()?;
                let mut tx = pool.begin().await.context("Failed to begin transaction")?;
                let row = insert_row_mysql(&mut tx, variant, partition, item_id, sort).await?;
                tx.commit().await.context("Failed to commit relation insert")?;
                Ok(row)
            }
        }
    }

    async fn append(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<Vec<MediaRelation>, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                append_sqlite(self.pool.sqlite_pool()?, variant, partition, item_ids).await
            }
            DatabaseDriver::Mysql => {
                append_mysql(self.pool.mysql_pool()?, variant, partition, item_ids).await
            }
        }
    }

    async fn replace(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<ReplaceOutcome, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                replace_sqlite(self.pool.sqlite_pool()?, variant, partition, item_ids).await
            }
            DatabaseDriver::Mysql => {
                replace_mysql(self.pool.mysql_pool()?, variant, partition, item_ids).await
            }
        }
    }

    async fn list(
        &self,
        variant: RelationVariant,
        partition: &Partition,
    ) -> Result<Vec<MediaRelation>, MediaError> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut conn = self
                    .pool
                    .sqlite_pool()?
                    .acquire()
                    .await
                    .context("Failed to acquire connection")?;
                list_rows_sqlite(&mut conn, variant, partition).await
            }
            DatabaseDriver::Mysql => {
                let mut conn = self
                    .pool
                    .mysql_pool()?
                    .acquire()
                    .await
                    .context("Failed to acquire connection")?;
                list_rows_mysql(&mut conn, variant, partition, false).await
            }
        }
    }

    async fn get(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
    ) -> Result<Option<MediaRelation>, MediaError> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                get_row_sqlite(self.pool.sqlite_pool()?, variant, partition, item_id).await
            }
            DatabaseDriver::Mysql => {
                get_row_mysql(self.pool.mysql_pool()?, variant, partition, item_id).await
            }
        }
    }

    async fn count(
        &self,
        variant: RelationVariant,
        partition: &Partition,
    ) -> Result<u64, MediaError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE owner_type = ? AND owner_id = ?",
            variant.relation_table()
        );
        let count: i64 = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query_scalar(&sql)
                .bind(&partition.owner_type)
                .bind(partition.owner_id)
                .fetch_one(self.pool.sqlite_pool()?)
                .await
                .context("Failed to count relations")?,
            DatabaseDriver::Mysql => sqlx::query_scalar(&sql)
                .bind(&partition.owner_type)
                .bind(partition.owner_id)
                .fetch_one(self.pool.mysql_pool()?)
                .await
                .context("Failed to count relations")?,
        };
        Ok(count as u64)
    }

    async fn remove(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_ids: &[i64],
    ) -> Result<u64, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                remove_sqlite(self.pool.sqlite_pool()?, variant, partition, item_ids).await
            }
            DatabaseDriver::Mysql => {
                remove_mysql(self.pool.mysql_pool()?, variant, partition, item_ids).await
            }
        }
    }

    async fn clear(
        &self,
        variant: RelationVariant,
        partition: &Partition,
    ) -> Result<u64, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        let sql = format!(
            "DELETE FROM {} WHERE owner_type = ? AND owner_id = ?",
            variant.relation_table()
        );
        let affected = match self.pool.driver() {
            DatabaseDriver::Sqlite => sqlx::query(&sql)
                .bind(&partition.owner_type)
                .bind(partition.owner_id)
                .execute(self.pool.sqlite_pool()?)
                .await
                .context("Failed to clear relations")?
                .rows_affected(),
            DatabaseDriver::Mysql => sqlx::query(&sql)
                .bind(&partition.owner_type)
                .bind(partition.owner_id)
                .execute(self.pool.mysql_pool()?)
                .await
                .context("Failed to clear relations")?
                .rows_affected(),
        };
        Ok(affected)
    }

    async fn set_sort(
        &self,
        variant: RelationVariant,
        partition: &Partition,
        item_id: i64,
        sort: i64,
    ) -> Result<bool, MediaError> {
        let _guard = self.lock_partition(variant, partition).await;
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                set_sort_sqlite(self.pool.sqlite_pool()?, variant, partition, item_id, sort).await
            }
            DatabaseDriver::Mysql => {
                set_sort_mysql(self.pool.mysql_pool()?, variant, partition, item_id, sort).await
            }
        }
    }

    async fn delete_for_owner(&self, owner_type: &str, owner_id: i64) -> Result<u64, MediaError> {
        match self.pool.driver() {
            DatabaseDriver::Sqlite => {
                let mut tx = self
                    .pool
                    .sqlite_pool()?
                    .begin()
                    .await
                    .context("Failed to begin transaction")?;
                let mut total = 0;
                for variant in RelationVariant::ALL {
                    let sql = format!(
                        "DELETE FROM {} WHERE owner_type = ? AND owner_id = ?",
                        variant.relation_table()
                    );
                    total += sqlx::query(&sql)
                        .bind(owner_type)
                        .bind(owner_id)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("Failed to delete {} relations", variant))?
                        .rows_affected();
                }
                tx.commit().await.context("Failed to commit owner cleanup")?;
                Ok(total)
            }
            DatabaseDriver::Mysql => {
                let mut tx = self
                    .pool
                    .mysql_pool()?
                    .begin()
                    .await
                    .context("Failed to begin transaction")?;
                let mut total = 0;
                for variant in RelationVariant::ALL {
                    let sql = format!(
                        "DELETE FROM {} WHERE owner_type = ? AND owner_id = ?",
                        variant.relation_table()
                    );
                    total += sqlx::query(&sql)
                        .bind(owner_type)
                        .bind(owner_id)
                        .execute(&mut *tx)
                        .await
                        .with_context(|| format!("Failed to delete {} relations", variant))?
                        .rows_affected();
                }
                tx.commit().await.context("Failed to commit owner cleanup")?;
                Ok(total)
            }
        }
    }

    async fn count_for_item(
        &self,
        variant: RelationVariant,
        item_id: i64,
    ) -> Result<u64, MediaError> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE item_id = ?",
            variant.relation_table()
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

/// Translate a driver error from an insert into the relation taxonomy
fn map_insert_error(
    err: sqlx::Error,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
) -> MediaError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return MediaError::ConstraintViolation {
                variant,
                owner_type: partition.owner_type.clone(),
                owner_id: partition.owner_id,
                item_id,
            };
        }
        if db_err.is_foreign_key_violation() {
            return MediaError::DanglingReference { variant, item_id };
        }
    }
    MediaError::InternalError(anyhow::Error::new(err).context("Failed to insert relation"))
}

/// Dedup while keeping first occurrences in order
fn unique_in_order(item_ids: &[i64]) -> Vec<i64> {
    let mut seen = HashSet::new();
    item_ids
        .iter()
        .copied()
        .filter(|id| seen.insert(*id))
        .collect()
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn item_exists_sqlite(
    conn: &mut SqliteConnection,
    variant: RelationVariant,
    item_id: i64,
) -> Result<bool, MediaError> {
    let sql = format!("SELECT COUNT(*) FROM {} WHERE id = ?", variant.item_table());
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(item_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to check item")?;
    Ok(count > 0)
}

async fn next_sort_sqlite(
    conn: &mut SqliteConnection,
    variant: RelationVariant,
    partition: &Partition,
) -> Result<i64, MediaError> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort), 0) + 1 FROM {} WHERE owner_type = ? AND owner_id = ?",
        variant.relation_table()
    );
    let next: i64 = sqlx::query_scalar(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to compute next sort")?;
    Ok(next)
}

async fn insert_row_sqlite(
    conn: &mut SqliteConnection,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
    sort: Option<i64>,
) -> Result<MediaRelation, MediaError> {
    if !item_exists_sqlite(conn, variant, item_id).await? {
        return Err(MediaError::DanglingReference { variant, item_id });
    }

    let sort = match sort {
        Some(sort) => sort,
        None => next_sort_sqlite(conn, variant, partition).await?,
    };

    let sql = format!(
        "INSERT INTO {} (owner_type, owner_id, item_id, sort) VALUES (?, ?, ?, ?)",
        variant.relation_table()
    );
    let result = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .bind(sort)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_insert_error(e, variant, partition, item_id))?;

    Ok(MediaRelation {
        id: result.last_insert_rowid(),
        variant,
        owner_type: partition.owner_type.clone(),
        owner_id: partition.owner_id,
        item_id,
        sort: Some(sort),
    })
}

async fn list_rows_sqlite(
    conn: &mut SqliteConnection,
    variant: RelationVariant,
    partition: &Partition,
) -> Result<Vec<MediaRelation>, MediaError> {
    let sql = format!(
        r#"
        SELECT id, owner_type, owner_id, item_id, sort
        FROM {}
        WHERE owner_type = ? AND owner_id = ?
        ORDER BY sort, id
        "#,
        variant.relation_table()
    );
    let rows = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list relations")?;

    Ok(rows
        .iter()
        .map(|row| row_to_relation_sqlite(row, variant))
        .collect())
}

async fn get_row_sqlite(
    pool: &SqlitePool,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
) -> Result<Option<MediaRelation>, MediaError> {
    let sql = format!(
        r#"
        SELECT id, owner_type, owner_id, item_id, sort
        FROM {}
        WHERE owner_type = ? AND owner_id = ? AND item_id = ?
        "#,
        variant.relation_table()
    );
    let row = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get relation")?;

    Ok(row.map(|r| row_to_relation_sqlite(&r, variant)))
}

async fn append_sqlite(
    pool: &SqlitePool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<Vec<MediaRelation>, MediaError> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let existing: HashSet<i64> = list_rows_sqlite(&mut tx, variant, partition)
        .await?
        .into_iter()
        .map(|r| r.item_id)
        .collect();

    let mut added = Vec::new();
    for item_id in unique_in_order(item_ids) {
        if existing.contains(&item_id) {
            continue;
        }
        added.push(insert_row_sqlite(&mut tx, variant, partition, item_id, None).await?);
    }

    tx.commit().await.context("Failed to commit relation append")?;
    Ok(added)
}

async fn replace_sqlite(
    pool: &SqlitePool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<ReplaceOutcome, MediaError> {
    let wanted = unique_in_order(item_ids);
    let wanted_set: HashSet<i64> = wanted.iter().copied().collect();

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let current = list_rows_sqlite(&mut tx, variant, partition).await?;

    let delete_sql = format!("DELETE FROM {} WHERE id = ?", variant.relation_table());
    let mut outcome = ReplaceOutcome::default();
    for row in current.iter().filter(|r| !wanted_set.contains(&r.item_id)) {
        outcome.removed += sqlx::query(&delete_sql)
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete relation")?
            .rows_affected();
    }

    let kept: HashSet<i64> = current.iter().map(|r| r.item_id).collect();
    for item_id in wanted.into_iter().filter(|id| !kept.contains(id)) {
        outcome
            .added
            .push(insert_row_sqlite(&mut tx, variant, partition, item_id, None).await?);
    }

    tx.commit().await.context("Failed to commit relation replace")?;
    Ok(outcome)
}

async fn remove_sqlite(
    pool: &SqlitePool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<u64, MediaError> {
    let sql = format!(
        "DELETE FROM {} WHERE owner_type = ? AND owner_id = ? AND item_id = ?",
        variant.relation_table()
    );
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let mut removed = 0;
    for item_id in unique_in_order(item_ids) {
        removed += sqlx::query(&sql)
            .bind(&partition.owner_type)
            .bind(partition.owner_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .context("Failed to remove relation")?
            .rows_affected();
    }
    tx.commit().await.context("Failed to commit relation removal")?;
    Ok(removed)
}

async fn set_sort_sqlite(
    pool: &SqlitePool,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
    sort: i64,
) -> Result<bool, MediaError> {
    let sql = format!(
        "UPDATE {} SET sort = ? WHERE owner_type = ? AND owner_id = ? AND item_id = ?",
        variant.relation_table()
    );
    let result = sqlx::query(&sql)
        .bind(sort)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .execute(pool)
        .await
        .context("Failed to update relation sort")?;
    Ok(result.rows_affected() > 0)
}

fn row_to_relation_sqlite(row: &SqliteRow, variant: RelationVariant) -> MediaRelation {
    MediaRelation {
        id: row.get("id"),
        variant,
        owner_type: row.get("owner_type"),
        owner_id: row.get("owner_id"),
        item_id: row.get("item_id"),
        sort: row.get("sort"),
    }
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn item_exists_mysql(
    conn: &mut MySqlConnection,
    variant: RelationVariant,
    item_id: i64,
) -> Result<bool, MediaError> {
    // Shared lock keeps the item from disappearing before the insert commits
    let sql = format!(
        "SELECT COUNT(*) FROM {} WHERE id = ? LOCK IN SHARE MODE",
        variant.item_table()
    );
    let count: i64 = sqlx::query_scalar(&sql)
        .bind(item_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to check item")?;
    Ok(count > 0)
}

async fn next_sort_mysql(
    conn: &mut MySqlConnection,
    variant: RelationVariant,
    partition: &Partition,
) -> Result<i64, MediaError> {
    let sql = format!(
        "SELECT COALESCE(MAX(sort), 0) + 1 FROM {} WHERE owner_type = ? AND owner_id = ? FOR UPDATE",
        variant.relation_table()
    );
    let next: i64 = sqlx::query_scalar(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .fetch_one(&mut *conn)
        .await
        .context("Failed to compute next sort")?;
    Ok(next)
}

async fn insert_row_mysql(
    conn: &mut MySqlConnection,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
    sort: Option<i64>,
) -> Result<MediaRelation, MediaError> {
    if !item_exists_mysql(conn, variant, item_id).await? {
        return Err(MediaError::DanglingReference { variant, item_id });
    }

    let sort = match sort {
        Some(sort) => sort,
        None => next_sort_mysql(conn, variant, partition).await?,
    };

    let sql = format!(
        "INSERT INTO {} (owner_type, owner_id, item_id, sort) VALUES (?, ?, ?, ?)",
        variant.relation_table()
    );
    let result = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .bind(sort)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_insert_error(e, variant, partition, item_id))?;

    Ok(MediaRelation {
        id: result.last_insert_id() as i64,
        variant,
        owner_type: partition.owner_type.clone(),
        owner_id: partition.owner_id,
        item_id,
        sort: Some(sort),
    })
}

async fn list_rows_mysql(
    conn: &mut MySqlConnection,
    variant: RelationVariant,
    partition: &Partition,
    for_update: bool,
) -> Result<Vec<MediaRelation>, MediaError> {
    let sql = format!(
        r#"
        SELECT id, owner_type, owner_id, item_id, sort
        FROM {}
        WHERE owner_type = ? AND owner_id = ?
        ORDER BY sort, id
        {}
        "#,
        variant.relation_table(),
        if for_update { "FOR UPDATE" } else { "" }
    );
    let rows = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to list relations")?;

    Ok(rows
        .iter()
        .map(|row| row_to_relation_mysql(row, variant))
        .collect())
}

async fn get_row_mysql(
    pool: &MySqlPool,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
) -> Result<Option<MediaRelation>, MediaError> {
    let sql = format!(
        r#"
        SELECT id, owner_type, owner_id, item_id, sort
        FROM {}
        WHERE owner_type = ? AND owner_id = ? AND item_id = ?
        "#,
        variant.relation_table()
    );
    let row = sqlx::query(&sql)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .fetch_optional(pool)
        .await
        .context("Failed to get relation")?;

    Ok(row.map(|r| row_to_relation_mysql(&r, variant)))
}

async fn append_mysql(
    pool: &MySqlPool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<Vec<MediaRelation>, MediaError> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let existing: HashSet<i64> = list_rows_mysql(&mut tx, variant, partition, true)
        .await?
        .into_iter()
        .map(|r| r.item_id)
        .collect();

    let mut added = Vec::new();
    for item_id in unique_in_order(item_ids) {
        if existing.contains(&item_id) {
            continue;
        }
        added.push(insert_row_mysql(&mut tx, variant, partition, item_id, None).await?);
    }

    tx.commit().await.context("Failed to commit relation append")?;
    Ok(added)
}

async fn replace_mysql(
    pool: &MySqlPool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<ReplaceOutcome, MediaError> {
    let wanted = unique_in_order(item_ids);
    let wanted_set: HashSet<i64> = wanted.iter().copied().collect();

    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let current = list_rows_mysql(&mut tx, variant, partition, true).await?;

    let delete_sql = format!("DELETE FROM {} WHERE id = ?", variant.relation_table());
    let mut outcome = ReplaceOutcome::default();
    for row in current.iter().filter(|r| !wanted_set.contains(&r.item_id)) {
        outcome.removed += sqlx::query(&delete_sql)
            .bind(row.id)
            .execute(&mut *tx)
            .await
            .context("Failed to delete relation")?
            .rows_affected();
    }

    let kept: HashSet<i64> = current.iter().map(|r| r.item_id).collect();
    for item_id in wanted.into_iter().filter(|id| !kept.contains(id)) {
        outcome
            .added
            .push(insert_row_mysql(&mut tx, variant, partition, item_id, None).await?);
    }

    tx.commit().await.context("Failed to commit relation replace")?;
    Ok(outcome)
}

async fn remove_mysql(
    pool: &MySqlPool,
    variant: RelationVariant,
    partition: &Partition,
    item_ids: &[i64],
) -> Result<u64, MediaError> {
    let sql = format!(
        "DELETE FROM {} WHERE owner_type = ? AND owner_id = ? AND item_id = ?",
        variant.relation_table()
    );
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;
    let mut removed = 0;
    for item_id in unique_in_order(item_ids) {
        removed += sqlx::query(&sql)
            .bind(&partition.owner_type)
            .bind(partition.owner_id)
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .context("Failed to remove relation")?
            .rows_affected();
    }
    tx.commit().await.context("Failed to commit relation removal")?;
    Ok(removed)
}

async fn set_sort_mysql(
    pool: &MySqlPool,
    variant: RelationVariant,
    partition: &Partition,
    item_id: i64,
    sort: i64,
) -> Result<bool, MediaError> {
    let sql = format!(
        "UPDATE {} SET sort = ? WHERE owner_type = ? AND owner_id = ? AND item_id = ?",
        variant.relation_table()
    );
    let result = sqlx::query(&sql)
        .bind(sort)
        .bind(&partition.owner_type)
        .bind(partition.owner_id)
        .bind(item_id)
        .execute(pool)
        .await
        .context("Failed to update relation sort")?;
    if result.rows_affected() > 0 {
        return Ok(true);
    }
    // Unchanged rows report zero affected rows on MySQL
    Ok(get_row_mysql(pool, variant, partition, item_id).await?.is_some())
}

fn row_to_relation_mysql(row: &MySqlRow, variant: RelationVariant) -> MediaRelation {
    MediaRelation {
        id: row.get("id"),
        variant,
        owner_type: row.get("owner_type"),
        owner_id: row.get("owner_id"),
        item_id: row.get("item_id"),
        sort: row.get("sort"),
    }
}
