//! Related-media field declarations
//!
//! A field names one relation variant on an owner type. Declaring it in a
//! [`OwnerTypeDef`](super::OwnerTypeDef) registers the owner type for that
//! variant; at runtime the field name resolves to a bound manager through
//! `MediaRelations::manager_for_field`.

use serde::{Deserialize, Serialize};

use crate::error::MediaError;
use crate::models::{OwnerRef, Partition, RelationVariant};

/// A named related-media attribute of an owner type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedMediaField {
    name: String,
    variant: RelationVariant,
}

impl RelatedMediaField {
    pub fn new(name: impl Into<String>, variant: RelationVariant) -> Self {
        Self {
            name: name.into(),
            variant,
        }
    }

    /// An image relation field
    pub fn images(name: impl Into<String>) -> Self {
        Self::new(name, RelationVariant::Image)
    }

    /// A file relation field
    pub fn files(name: impl Into<String>) -> Self {
        Self::new(name, RelationVariant::File)
    }

    /// A video relation field
    pub fn videos(name: impl Into<String>) -> Self {
        Self::new(name, RelationVariant::Video)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn variant(&self) -> RelationVariant {
        self.variant
    }

    /// Resolve the partition this field reads and writes for `owner`.
    ///
    /// # Errors
    /// - `UnboundOwner` if the owner has not been persisted
    pub fn partition(&self, owner: &OwnerRef) -> Result<Partition, MediaError> {
        owner.partition(self.variant)
    }
}
