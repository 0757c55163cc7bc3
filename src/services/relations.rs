//! Related media managers
//!
//! A [`RelatedMedia`] is bound to one persisted owner and one item kind and
//! carries every operation on that owner's ordered collection: listing,
//! adding, removing, replacing the whole set, reordering and clearing.
//! [`MediaRelations`] hands out managers after checking the owner against the
//! content registry.

use std::sync::Arc;
use tracing::{debug, info};

use crate::db::repositories::{
    MediaRepository, MediaRow, RelationRepository, SqlxMediaRepository, SqlxRelationRepository,
};
use crate::db::DynDatabasePool;
use crate::error::MediaError;
use crate::models::{
    File, Image, MediaRelation, OwnerRef, Partition, RelationVariant, ReplaceOutcome, Video,
};
use crate::registry::{self, ContentRegistry};

/// Ordered collection of `M` items held by one owner
pub struct RelatedMedia<M: MediaRow> {
    partition: Partition,
    relations: Arc<dyn RelationRepository>,
    items: Arc<dyn MediaRepository<M>>,
}

impl<M: MediaRow> RelatedMedia<M> {
    /// Bind a manager to an already resolved partition
    pub fn new(
        partition: Partition,
        relations: Arc<dyn RelationRepository>,
        items: Arc<dyn MediaRepository<M>>,
    ) -> Self {
        Self {
            partition,
            relations,
            items,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn variant(&self) -> RelationVariant {
        M::VARIANT
    }

    /// Related items ordered by sort, ties broken by relation row id
    pub async fn ordered_items(&self) -> Result<Vec<M>, MediaError> {
        Ok(self.items.for_owner(&self.partition).await?)
    }

    /// The relation rows themselves, in the same order
    pub async fn relations(&self) -> Result<Vec<MediaRelation>, MediaError> {
        self.relations.list(M::VARIANT, &self.partition).await
    }

    pub async fn count(&self) -> Result<u64, MediaError> {
        self.relations.count(M::VARIANT, &self.partition).await
    }

    pub async fn contains(&self, item_id: i64) -> Result<bool, MediaError> {
        Ok(self
            .relations
            .get(M::VARIANT, &self.partition, item_id)
            .await?
            .is_some())
    }

    /// Append items at the end of the collection.
    ///
    /// Items that are already related are skipped.
    ///
    /// # Returns
    /// The relation rows that were created
    ///
    /// # Errors
    /// - `DanglingReference` if an item does not exist; nothing is added
    pub async fn add(&self, item_ids: &[i64]) -> Result<Vec<MediaRelation>, MediaError> {
        let added = self
            .relations
            .append(M::VARIANT, &self.partition, item_ids)
            .await?;
        debug!(partition = %self.partition, variant = %M::VARIANT, added = added.len(), "Added related media");
        Ok(added)
    }

    /// Remove exactly these items; items that are not related are ignored
    pub async fn remove(&self, item_ids: &[i64]) -> Result<u64, MediaError> {
        self.relations
            .remove(M::VARIANT, &self.partition, item_ids)
            .await
    }

    /// Make the related set exactly `item_ids`.
    ///
    /// Items that stay keep their position. New items are appended after
    /// them in the given order; follow up with [`set_order`](Self::set_order)
    /// to reorder the whole collection.
    pub async fn replace_all(&self, item_ids: &[i64]) -> Result<ReplaceOutcome, MediaError> {
        let outcome = self
            .relations
            .replace(M::VARIANT, &self.partition, item_ids)
            .await?;
        debug!(
            partition = %self.partition,
            variant = %M::VARIANT,
            removed = outcome.removed,
            added = outcome.added.len(),
            "Replaced related media"
        );
        Ok(outcome)
    }

    /// Set the sort value of one related item.
    ///
    /// Siblings are not renumbered, so equal values are allowed; ties are
    /// ordered by relation row id.
    ///
    /// # Errors
    /// - `NotFound` if the item is not related to this owner
    pub async fn set_order(&self, item_id: i64, order: i64) -> Result<(), MediaError> {
        let updated = self
            .relations
            .set_sort(M::VARIANT, &self.partition, item_id, order)
            .await?;
        if !updated {
            return Err(MediaError::not_found(
                M::VARIANT,
                format!("item {} is not related to {}", item_id, self.partition),
            ));
        }
        Ok(())
    }

    /// Remove every relation of this owner
    pub async fn clear(&self) -> Result<u64, MediaError> {
        self.relations.clear(M::VARIANT, &self.partition).await
    }
}

/// A manager resolved from a field name, whose item kind is only known at
/// runtime
pub enum FieldManager {
    Images(RelatedMedia<Image>),
    Files(RelatedMedia<File>),
    Videos(RelatedMedia<Video>),
}

macro_rules! dispatch {
    ($manager:expr, $bound:ident => $body:expr) => {
        match $manager {
            FieldManager::Images($bound) => $body,
            FieldManager::Files($bound) => $body,
            FieldManager::Videos($bound) => $body,
        }
    };
}

impl FieldManager {
    pub fn variant(&self) -> RelationVariant {
        dispatch!(self, m => m.variant())
    }

    pub fn partition(&self) -> &Partition {
        dispatch!(self, m => m.partition())
    }

    pub async fn relations(&self) -> Result<Vec<MediaRelation>, MediaError> {
        dispatch!(self, m => m.relations().await)
    }

    pub async fn count(&self) -> Result<u64, MediaError> {
        dispatch!(self, m => m.count().await)
    }

    pub async fn add(&self, item_ids: &[i64]) -> Result<Vec<MediaRelation>, MediaError> {
        dispatch!(self, m => m.add(item_ids).await)
    }

    pub async fn remove(&self, item_ids: &[i64]) -> Result<u64, MediaError> {
        dispatch!(self, m => m.remove(item_ids).await)
    }

    pub async fn replace_all(&self, item_ids: &[i64]) -> Result<ReplaceOutcome, MediaError> {
        dispatch!(self, m => m.replace_all(item_ids).await)
    }

    pub async fn set_order(&self, item_id: i64, order: i64) -> Result<(), MediaError> {
        dispatch!(self, m => m.set_order(item_id, order).await)
    }

    pub async fn clear(&self) -> Result<u64, MediaError> {
        dispatch!(self, m => m.clear().await)
    }
}

/// Factory for relation managers
///
/// Holds the one relation repository shared by every manager, so that
/// partition locks are shared too.
pub struct MediaRelations {
    pool: DynDatabasePool,
    registry: Arc<ContentRegistry>,
    relations: Arc<dyn RelationRepository>,
}

impl MediaRelations {
    pub fn new(pool: DynDatabasePool, registry: Arc<ContentRegistry>) -> Self {
        let relations = SqlxRelationRepository::boxed(pool.clone());
        Self {
            pool,
            registry,
            relations,
        }
    }

    /// Build a factory on the installed process-wide registry
    pub fn from_global(pool: DynDatabasePool) -> Result<Self, MediaError> {
        let registry = registry::global().ok_or_else(|| {
            MediaError::InternalError(anyhow::anyhow!("No content registry has been installed"))
        })?;
        Ok(Self::new(pool, registry))
    }

    pub fn registry(&self) -> &Arc<ContentRegistry> {
        &self.registry
    }

    /// The manager for `owner`'s `M` items.
    ///
    /// # Errors
    /// - `NotRegistered` if the owner type may not hold `M` relations
    /// - `UnboundOwner` if the owner has not been persisted
    pub fn manager<M: MediaRow>(&self, owner: &OwnerRef) -> Result<RelatedMedia<M>, MediaError> {
        if !self.registry.relates_to(M::VARIANT, &owner.owner_type) {
            return Err(MediaError::NotRegistered {
                owner_type: owner.owner_type.clone(),
                variant: M::VARIANT,
            });
        }
        let partition = owner.partition(M::VARIANT)?;
        Ok(RelatedMedia::new(
            partition,
            self.relations.clone(),
            SqlxMediaRepository::<M>::boxed(self.pool.clone()),
        ))
    }

    pub fn images(&self, owner: &OwnerRef) -> Result<RelatedMedia<Image>, MediaError> {
        self.manager(owner)
    }

    pub fn files(&self, owner: &OwnerRef) -> Result<RelatedMedia<File>, MediaError> {
        self.manager(owner)
    }

    pub fn videos(&self, owner: &OwnerRef) -> Result<RelatedMedia<Video>, MediaError> {
        self.manager(owner)
    }

    /// Resolve a declared field of the owner's type to its manager
    ///
    /// # Errors
    /// - `ValidationError` if the owner type has no such field
    pub fn manager_for_field(
        &self,
        owner: &OwnerRef,
        field_name: &str,
    ) -> Result<FieldManager, MediaError> {
        let field = self
            .registry
            .field(&owner.owner_type, field_name)
            .ok_or_else(|| {
                MediaError::ValidationError(format!(
                    "{} has no related media field '{}'",
                    owner.owner_type, field_name
                ))
            })?;

        Ok(match field.variant() {
            RelationVariant::Image => FieldManager::Images(self.manager(owner)?),
            RelationVariant::File => FieldManager::Files(self.manager(owner)?),
            RelationVariant::Video => FieldManager::Videos(self.manager(owner)?),
        })
    }

    /// Drop every relation of a deleted owner, across all variants.
    ///
    /// The related items themselves are kept.
    pub async fn owner_deleted(&self, owner_type: &str, owner_id: i64) -> Result<u64, MediaError> {
        let removed = self.relations.delete_for_owner(owner_type, owner_id).await?;
        info!(owner_type, owner_id, removed, "Removed relations of deleted owner");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_test_pool, migrations};
    use crate::registry::{OwnerTypeDef, RegistryBuilder, RelatedMediaField};
    use proptest::prelude::*;

    fn test_registry() -> ContentRegistry {
        RegistryBuilder::new()
            .owner_type(
                OwnerTypeDef::new("article")
                    .field(RelatedMediaField::images("images"))
                    .field(RelatedMediaField::files("attachments")),
            )
            .owner_type(OwnerTypeDef::new("feature").extends("article"))
            .owner_type(
                OwnerTypeDef::new("content")
                    .abstract_type()
                    .field(RelatedMediaField::videos("clips")),
            )
            .owner_type(OwnerTypeDef::new("episode").extends("content"))
            .owner_type(OwnerTypeDef::new("plain"))
            .build()
            .expect("test registry is valid")
    }

    async fn setup() -> (DynDatabasePool, MediaRelations) {
        let pool = create_test_pool()
            .await
            .expect("Failed to create test pool");
        migrations::run_migrations(&pool)
            .await
            .expect("Failed to run migrations");
        let relations = MediaRelations::new(pool.clone(), Arc::new(test_registry()));
        (pool, relations)
    }

    async fn create_files(pool: &DynDatabasePool, count: usize) -> Vec<i64> {
        let repo = SqlxMediaRepository::<File>::new(pool.clone());
        let mut ids = Vec::with_capacity(count);
        for n in 0..count {
            let created = repo
                .create(&File::new(format!("File {}", n)))
                .await
                .expect("Failed to create file");
            ids.push(created.meta.id);
        }
        ids
    }

    async fn ordered_ids<M: MediaRow>(manager: &RelatedMedia<M>) -> Vec<i64> {
        manager
            .ordered_items()
            .await
            .unwrap()
            .iter()
            .map(|item| item.id())
            .collect()
    }

    async fn sorts<M: MediaRow>(manager: &RelatedMedia<M>) -> Vec<Option<i64>> {
        manager
            .relations()
            .await
            .unwrap()
            .iter()
            .map(|r| r.sort)
            .collect()
    }

    #[tokio::test]
    async fn test_add_reorder_replace_scenario() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 3).await;
        let (item1, item2, item3) = (ids[0], ids[1], ids[2]);
        let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

        manager.add(&[item1, item2]).await.unwrap();
        assert_eq!(ordered_ids(&manager).await, vec![item1, item2]);
        assert_eq!(sorts(&manager).await, vec![Some(1), Some(2)]);

        manager.set_order(item1, 5).await.unwrap();
        assert_eq!(ordered_ids(&manager).await, vec![item2, item1]);
        assert_eq!(sorts(&manager).await, vec![Some(2), Some(5)]);

        let outcome = manager.replace_all(&[item2, item3]).await.unwrap();
        assert_eq!(outcome.removed, 1);
        assert_eq!(ordered_ids(&manager).await, vec![item2, item3]);
    }

    #[tokio::test]
    async fn test_add_skips_related_items() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 3).await;
        let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

        manager.add(&[ids[0], ids[1]]).await.unwrap();
        let added = manager.add(&[ids[1], ids[2], ids[0]]).await.unwrap();

        assert_eq!(added.len(), 1);
        assert_eq!(added[0].item_id, ids[2]);
        assert_eq!(ordered_ids(&manager).await, ids);
        assert_eq!(manager.count().await.unwrap(), 3);
        assert!(manager.contains(ids[2]).await.unwrap());
    }

    #[tokio::test]
    async fn test_add_missing_item_is_dangling() {
        let (_pool, relations) = setup().await;
        let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

        let err = manager.add(&[4242]).await.unwrap_err();
        assert!(matches!(
            err,
            MediaError::DanglingReference { variant: RelationVariant::File, item_id: 4242 }
        ));
        assert_eq!(manager.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_then_add_moves_to_end() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 3).await;
        let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

        manager.add(&ids).await.unwrap();
        assert_eq!(manager.remove(&[ids[0], 9999]).await.unwrap(), 1);
        manager.add(&[ids[0]]).await.unwrap();

        assert_eq!(ordered_ids(&manager).await, vec![ids[1], ids[2], ids[0]]);
        assert_eq!(sorts(&manager).await, vec![Some(2), Some(3), Some(4)]);
    }

    #[tokio::test]
    async fn test_set_order_unknown_item() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 1).await;
        let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

        let err = manager.set_order(ids[0], 3).await.unwrap_err();
        assert!(matches!(err, MediaError::NotFound { variant: RelationVariant::File, .. }));
    }

    #[tokio::test]
    async fn test_partitions_are_independent() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 2).await;
        let first = relations.files(&OwnerRef::new("article", 1)).unwrap();
        let second = relations.files(&OwnerRef::new("feature", 1)).unwrap();

        first.add(&ids).await.unwrap();
        second.add(&[ids[1]]).await.unwrap();
        first.clear().await.unwrap();

        assert_eq!(first.count().await.unwrap(), 0);
        assert_eq!(ordered_ids(&second).await, vec![ids[1]]);
        assert_eq!(sorts(&second).await, vec![Some(1)]);
    }

    #[tokio::test]
    async fn test_owner_deleted_keeps_items() {
        let (pool, relations) = setup().await;
        let file_ids = create_files(&pool, 2).await;
        let image_repo = SqlxMediaRepository::<Image>::new(pool.clone());
        let mut image = Image::new("Cover");
        image.filename = Some("images/cover.jpg".to_string());
        let image = image_repo.create(&image).await.unwrap();

        let owner = OwnerRef::new("article", 7);
        relations.files(&owner).unwrap().add(&file_ids).await.unwrap();
        relations.images(&owner).unwrap().add(&[image.meta.id]).await.unwrap();
        let other = relations.files(&OwnerRef::new("article", 8)).unwrap();
        other.add(&file_ids).await.unwrap();

        assert_eq!(relations.owner_deleted("article", 7).await.unwrap(), 3);

        assert_eq!(relations.files(&owner).unwrap().count().await.unwrap(), 0);
        assert_eq!(relations.images(&owner).unwrap().count().await.unwrap(), 0);
        assert_eq!(other.count().await.unwrap(), 2);
        assert!(image_repo.get(image.meta.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_manager_checks_registry() {
        let (_pool, relations) = setup().await;

        assert!(relations.images(&OwnerRef::new("feature", 1)).is_ok());
        assert!(relations.videos(&OwnerRef::new("episode", 1)).is_ok());

        for (owner_type, variant) in [
            ("content", RelationVariant::Video),
            ("plain", RelationVariant::Image),
            ("article", RelationVariant::Video),
        ] {
            let owner = OwnerRef::new(owner_type, 1);
            let err = match variant {
                RelationVariant::Image => relations.images(&owner).err(),
                RelationVariant::File => relations.files(&owner).err(),
                RelationVariant::Video => relations.videos(&owner).err(),
            };
            assert!(
                matches!(err, Some(MediaError::NotRegistered { .. })),
                "{owner_type} should not hold {variant} relations"
            );
        }
    }

    #[tokio::test]
    async fn test_unsaved_owner_is_rejected() {
        let (_pool, relations) = setup().await;
        let err = relations.files(&OwnerRef::unsaved("article")).err();
        assert!(matches!(
            err,
            Some(MediaError::UnboundOwner { variant: RelationVariant::File, .. })
        ));
    }

    #[tokio::test]
    async fn test_manager_for_field() {
        let (pool, relations) = setup().await;
        let ids = create_files(&pool, 2).await;
        let owner = OwnerRef::new("feature", 3);

        let attachments = relations.manager_for_field(&owner, "attachments").unwrap();
        assert_eq!(attachments.variant(), RelationVariant::File);
        assert_eq!(attachments.partition(), &Partition::new("feature", 3));
        attachments.add(&ids).await.unwrap();
        attachments.set_order(ids[0], 10).await.unwrap();

        let relations_rows = attachments.relations().await.unwrap();
        let order: Vec<i64> = relations_rows.iter().map(|r| r.item_id).collect();
        assert_eq!(order, vec![ids[1], ids[0]]);

        let clips = relations
            .manager_for_field(&OwnerRef::new("episode", 1), "clips")
            .unwrap();
        assert!(matches!(clips, FieldManager::Videos(_)));

        assert!(matches!(
            relations.manager_for_field(&owner, "clips"),
            Err(MediaError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_from_global_registry() {
        let _guard = registry::GLOBAL_REGISTRY_MUTEX
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let pool = create_test_pool().await.expect("Failed to create test pool");

        registry::reset();
        assert!(matches!(
            MediaRelations::from_global(pool.clone()),
            Err(MediaError::InternalError(_))
        ));

        registry::install(test_registry()).unwrap();
        let relations = MediaRelations::from_global(pool).unwrap();
        assert!(relations.registry().relates_to(RelationVariant::Image, "article"));
        registry::reset();
    }

    // ========================================================================
    // Property tests
    // ========================================================================

    const ITEM_POOL: usize = 6;

    fn unique(ids: &[i64]) -> Vec<i64> {
        let mut seen = std::collections::HashSet::new();
        ids.iter().copied().filter(|id| seen.insert(*id)).collect()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(20))]

        /// Adding a batch that overlaps the current set only appends the
        /// missing items, in the order given.
        #[test]
        fn add_is_idempotent(
            first in proptest::collection::vec(0..ITEM_POOL, 0..8),
            second in proptest::collection::vec(0..ITEM_POOL, 0..8),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let (pool, relations) = setup().await;
                let ids = create_files(&pool, ITEM_POOL).await;
                let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

                let first: Vec<i64> = first.iter().map(|&i| ids[i]).collect();
                let second: Vec<i64> = second.iter().map(|&i| ids[i]).collect();
                manager.add(&first).await.unwrap();
                manager.add(&second).await.unwrap();

                let combined: Vec<i64> = first.iter().chain(second.iter()).copied().collect();
                prop_assert_eq!(ordered_ids(&manager).await, unique(&combined));
                Ok(())
            });
            result?;
        }

        /// After replace_all the set is exactly the target; survivors keep
        /// their relative order and newcomers follow in the given order.
        #[test]
        fn replace_all_contract(
            initial in proptest::collection::vec(0..ITEM_POOL, 0..8),
            target in proptest::collection::vec(0..ITEM_POOL, 0..8),
        ) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let result: Result<(), TestCaseError> = rt.block_on(async {
                let (pool, relations) = setup().await;
                let ids = create_files(&pool, ITEM_POOL).await;
                let manager = relations.files(&OwnerRef::new("article", 1)).unwrap();

                let initial = unique(&initial.iter().map(|&i| ids[i]).collect::<Vec<_>>());
                let target = unique(&target.iter().map(|&i| ids[i]).collect::<Vec<_>>());
                manager.add(&initial).await.unwrap();
                manager.replace_all(&target).await.unwrap();

                let mut expected: Vec<i64> = initial
                    .iter()
                    .copied()
                    .filter(|id| target.contains(id))
                    .collect();
                expected.extend(target.iter().copied().filter(|id| !initial.contains(id)));

                prop_assert_eq!(ordered_ids(&manager).await, expected);
                Ok(())
            });
            result?;
        }
    }
}
