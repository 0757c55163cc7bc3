//! Content registry
//!
//! Records which owner types may hold relations of each variant. Owner types
//! are declared up front with an optional parent and an abstract flag; a type
//! relates to a variant when it, or any of its ancestors, was registered for
//! that variant and it is concrete itself.
//!
//! The registry is assembled with [`RegistryBuilder`] during start-up and is
//! read-only afterwards. A process-wide instance can be installed once with
//! [`install`] and read with [`global`].
//!
//! ```ignore
//! let registry = RegistryBuilder::new()
//!     .owner_type(OwnerTypeDef::new("content").abstract_type().field(RelatedMediaField::images("images")))
//!     .owner_type(OwnerTypeDef::new("article").extends("content"))
//!     .build()?;
//! assert!(registry.relates_to(RelationVariant::Image, "article"));
//! assert!(!registry.relates_to(RelationVariant::Image, "content"));
//! ```

pub mod field;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::debug;

use crate::models::RelationVariant;

pub use field::RelatedMediaField;

/// Errors raised while assembling or installing a registry
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Owner type '{0}' is declared more than once")]
    DuplicateType(String),

    #[error("Owner type '{owner_type}' declares field '{field}' more than once")]
    DuplicateField { owner_type: String, field: String },

    #[error("Owner type '{owner_type}' extends unknown type '{parent}'")]
    UnknownParent { owner_type: String, parent: String },

    #[error("Cannot register unknown owner type '{owner_type}' for {variant} relations")]
    UnknownType {
        owner_type: String,
        variant: RelationVariant,
    },

    #[error("Owner type '{0}' is part of an inheritance cycle")]
    Cycle(String),

    #[error("A content registry is already installed")]
    AlreadyInstalled,
}

/// Declaration of one owner type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerTypeDef {
    name: String,
    parent: Option<String>,
    is_abstract: bool,
    fields: Vec<RelatedMediaField>,
}

impl OwnerTypeDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            is_abstract: false,
            fields: Vec::new(),
        }
    }

    /// Inherit from `parent` (fields and registrations)
    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Mark the type abstract: it never owns rows itself
    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Declare a related-media field, registering the type for its variant
    pub fn field(mut self, field: RelatedMediaField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    /// Fields declared directly on this type
    pub fn fields(&self) -> &[RelatedMediaField] {
        &self.fields
    }
}

/// Collects owner type declarations and explicit registrations
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    types: Vec<OwnerTypeDef>,
    registrations: Vec<(RelationVariant, String)>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an owner type
    pub fn owner_type(mut self, def: OwnerTypeDef) -> Self {
        self.types.push(def);
        self
    }

    /// Register an owner type for a variant without declaring a field.
    ///
    /// Registering the same pair twice has no further effect.
    pub fn register(mut self, variant: RelationVariant, owner_type: impl Into<String>) -> Self {
        self.registrations.push((variant, owner_type.into()));
        self
    }

    /// Validate the declarations and freeze them into a registry
    pub fn build(self) -> Result<ContentRegistry, RegistryError> {
        let mut types: HashMap<String, OwnerTypeDef> = HashMap::new();
        for def in self.types {
            let mut seen = HashSet::new();
            for field in &def.fields {
                if !seen.insert(field.name()) {
                    return Err(RegistryError::DuplicateField {
                        owner_type: def.name.clone(),
                        field: field.name().to_string(),
                    });
                }
            }
            if types.contains_key(&def.name) {
                return Err(RegistryError::DuplicateType(def.name));
            }
            types.insert(def.name.clone(), def);
        }

        let mut children: HashMap<String, Vec<String>> = HashMap::new();
        for def in types.values() {
            if let Some(parent) = &def.parent {
                if !types.contains_key(parent) {
                    return Err(RegistryError::UnknownParent {
                        owner_type: def.name.clone(),
                        parent: parent.clone(),
                    });
                }
                children
                    .entry(parent.clone())
                    .or_default()
                    .push(def.name.clone());
            }
        }
        for list in children.values_mut() {
            list.sort();
        }

        for name in types.keys() {
            let mut visited = HashSet::new();
            let mut current = Some(name.as_str());
            while let Some(type_name) = current {
                if !visited.insert(type_name) {
                    return Err(RegistryError::Cycle(name.clone()));
                }
                current = types.get(type_name).and_then(|d| d.parent());
            }
        }

        let field_registrations = types.values().flat_map(|def| {
            def.fields
                .iter()
                .map(move |f| (f.variant(), def.name.clone()))
        });

        let mut registered: BTreeMap<RelationVariant, BTreeSet<String>> = BTreeMap::new();
        for (variant, owner_type) in field_registrations
            .collect::<Vec<_>>()
            .into_iter()
            .chain(self.registrations)
        {
            if !types.contains_key(&owner_type) {
                return Err(RegistryError::UnknownType {
                    owner_type,
                    variant,
                });
            }
            if registered.entry(variant).or_default().insert(owner_type.clone()) {
                debug!("Registered '{}' for {} relations", owner_type, variant);
            }
        }

        Ok(ContentRegistry {
            types,
            children,
            registered,
        })
    }
}

/// Read-only map from relation variant to the owner types allowed to use it
#[derive(Debug)]
pub struct ContentRegistry {
    types: HashMap<String, OwnerTypeDef>,
    /// parent -> direct children, sorted
    children: HashMap<String, Vec<String>>,
    /// Types registered per variant, abstract ones included
    registered: BTreeMap<RelationVariant, BTreeSet<String>>,
}

impl ContentRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    /// Look up an owner type declaration
    pub fn owner_type(&self, name: &str) -> Option<&OwnerTypeDef> {
        self.types.get(name)
    }

    /// Whether `name` is declared and abstract
    pub fn is_abstract(&self, name: &str) -> bool {
        self.types.get(name).is_some_and(|d| d.is_abstract)
    }

    /// Every concrete type that may hold `variant` relations: the
    /// registered types plus all of their descendants.
    pub fn related_types(&self, variant: RelationVariant) -> BTreeSet<String> {
        let mut related = BTreeSet::new();
        let Some(roots) = self.registered.get(&variant) else {
            return related;
        };

        let mut stack: Vec<&str> = roots.iter().map(String::as_str).collect();
        let mut visited = HashSet::new();
        while let Some(name) = stack.pop() {
            if !visited.insert(name) {
                continue;
            }
            if !self.is_abstract(name) {
                related.insert(name.to_string());
            }
            if let Some(children) = self.children.get(name) {
                stack.extend(children.iter().map(String::as_str));
            }
        }
        related
    }

    /// Whether `owner_type` may hold `variant` relations
    pub fn relates_to(&self, variant: RelationVariant, owner_type: &str) -> bool {
        if !self.types.contains_key(owner_type) || self.is_abstract(owner_type) {
            return false;
        }
        let Some(registered) = self.registered.get(&variant) else {
            return false;
        };
        self.lineage(owner_type).any(|def| registered.contains(&def.name))
    }

    /// Same as [`relates_to`](Self::relates_to), argument order of the
    /// per-type flags
    pub fn has_related(&self, owner_type: &str, variant: RelationVariant) -> bool {
        self.relates_to(variant, owner_type)
    }

    /// Whether `owner_type` may hold relations of any variant
    pub fn has_related_media(&self, owner_type: &str) -> bool {
        RelationVariant::ALL
            .iter()
            .any(|variant| self.relates_to(*variant, owner_type))
    }

    /// Fields visible on `owner_type`, inherited ones included.
    ///
    /// A field redeclared on a subtype hides the inherited one.
    pub fn fields_of(&self, owner_type: &str) -> Vec<&RelatedMediaField> {
        let mut seen = HashSet::new();
        let mut fields = Vec::new();
        for def in self.lineage(owner_type) {
            for field in &def.fields {
                if seen.insert(field.name()) {
                    fields.push(field);
                }
            }
        }
        fields
    }

    /// Resolve a field by name on `owner_type` or its ancestors
    pub fn field(&self, owner_type: &str, name: &str) -> Option<&RelatedMediaField> {
        self.lineage(owner_type)
            .flat_map(|def| def.fields.iter())
            .find(|field| field.name() == name)
    }

    /// All declared owner type names, sorted
    pub fn owner_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// The type itself followed by its ancestors, nearest first
    fn lineage<'a>(&'a self, owner_type: &str) -> impl Iterator<Item = &'a OwnerTypeDef> + 'a {
        std::iter::successors(self.types.get(owner_type), move |def| {
            let def: &'a OwnerTypeDef = *def;
            def.parent().and_then(|p| self.types.get(p))
        })
    }
}

static GLOBAL_REGISTRY: RwLock<Option<Arc<ContentRegistry>>> = RwLock::new(None);

/// Install the process-wide registry.
///
/// # Errors
/// - `AlreadyInstalled` if a registry is already in place
pub fn install(registry: ContentRegistry) -> Result<Arc<ContentRegistry>, RegistryError> {
    let mut slot = GLOBAL_REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(RegistryError::AlreadyInstalled);
    }
    let registry = Arc::new(registry);
    *slot = Some(registry.clone());
    Ok(registry)
}

/// The installed process-wide registry, if any
pub fn global() -> Option<Arc<ContentRegistry>> {
    GLOBAL_REGISTRY
        .read()
        .unwrap_or_else(|e| e.into_inner())
        .clone()
}

/// Remove the process-wide registry so a test can install its own
pub fn reset() {
    *GLOBAL_REGISTRY.write().unwrap_or_else(|e| e.into_inner()) = None;
}

// Serializes tests that touch the global registry.
#[cfg(test)]
pub(crate) static GLOBAL_REGISTRY_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    /// Mirrors the shapes the relation managers have to cope with:
    /// a plain type, a subclass of it, an abstract base with a concrete
    /// child, and a field under a non-default name.
    fn sample_registry() -> ContentRegistry {
        RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("regular_set").field(RelatedMediaField::images("images")))
            .owner_type(OwnerTypeDef::new("child_set").extends("regular_set"))
            .owner_type(
                OwnerTypeDef::new("abstract_set")
                    .abstract_type()
                    .field(RelatedMediaField::images("images")),
            )
            .owner_type(OwnerTypeDef::new("abs_child_set").extends("abstract_set"))
            .owner_type(
                OwnerTypeDef::new("alt_name_model")
                    .field(RelatedMediaField::images("image_attachments")),
            )
            .owner_type(OwnerTypeDef::new("plain"))
            .build()
            .expect("sample registry is valid")
    }

    #[test]
    fn test_related_types_include_subclasses() {
        let registry = sample_registry();
        let related = registry.related_types(RelationVariant::Image);

        let expected: BTreeSet<String> = ["abs_child_set", "alt_name_model", "child_set", "regular_set"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(related, expected);
        assert!(registry.related_types(RelationVariant::Video).is_empty());
    }

    #[test]
    fn test_relates_to() {
        let registry = sample_registry();
        let image = RelationVariant::Image;

        assert!(registry.relates_to(image, "regular_set"));
        assert!(registry.relates_to(image, "child_set"));
        assert!(registry.relates_to(image, "abs_child_set"));
        assert!(!registry.relates_to(image, "abstract_set"));
        assert!(!registry.relates_to(image, "plain"));
        assert!(!registry.relates_to(image, "unknown"));
        assert!(!registry.relates_to(RelationVariant::File, "regular_set"));
    }

    #[test]
    fn test_relates_to_agrees_with_related_types() {
        let registry = sample_registry();
        for variant in RelationVariant::ALL {
            let related = registry.related_types(variant);
            for owner_type in registry.owner_types() {
                assert_eq!(
                    registry.relates_to(variant, owner_type),
                    related.contains(owner_type),
                    "{variant} / {owner_type}"
                );
            }
        }
    }

    #[test]
    fn test_has_related_flags() {
        let registry = sample_registry();
        assert!(registry.has_related_media("child_set"));
        assert!(registry.has_related("child_set", RelationVariant::Image));
        assert!(!registry.has_related("child_set", RelationVariant::File));
        assert!(!registry.has_related_media("plain"));
        assert!(!registry.has_related_media("abstract_set"));
    }

    #[test]
    fn test_fields_are_inherited() {
        let registry = sample_registry();

        let field = registry.field("abs_child_set", "images").unwrap();
        assert_eq!(field.variant(), RelationVariant::Image);
        assert!(registry.field("abs_child_set", "files").is_none());

        let alt = registry.field("alt_name_model", "image_attachments").unwrap();
        assert_eq!(alt.variant(), RelationVariant::Image);
        assert!(registry.field("alt_name_model", "images").is_none());

        assert_eq!(registry.fields_of("child_set").len(), 1);
        assert!(registry.fields_of("plain").is_empty());
    }

    #[test]
    fn test_field_lookup_outlives_owner_type_name() {
        let registry = sample_registry();

        // Names built at runtime are dropped before the results are used
        let fields = {
            let owner_type = format!("{}_set", "child");
            registry.fields_of(&owner_type)
        };
        let field = {
            let owner_type = String::from("abs_child_set");
            registry.field(&owner_type, "images")
        };

        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name(), "images");
        assert_eq!(field.map(|f| f.variant()), Some(RelationVariant::Image));
    }

    #[test]
    fn test_subtype_field_hides_inherited_one() {
        let registry = RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("base").field(RelatedMediaField::images("media")))
            .owner_type(
                OwnerTypeDef::new("derived")
                    .extends("base")
                    .field(RelatedMediaField::files("media")),
            )
            .build()
            .unwrap();

        let fields = registry.fields_of("derived");
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].variant(), RelationVariant::File);
        // Registrations still accumulate along the lineage
        assert!(registry.relates_to(RelationVariant::Image, "derived"));
        assert!(registry.relates_to(RelationVariant::File, "derived"));
        assert!(!registry.relates_to(RelationVariant::File, "base"));
    }

    #[test]
    fn test_explicit_register_is_idempotent() {
        let registry = RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("page"))
            .register(RelationVariant::Video, "page")
            .register(RelationVariant::Video, "page")
            .build()
            .unwrap();

        assert_eq!(registry.related_types(RelationVariant::Video).len(), 1);
        assert!(registry.relates_to(RelationVariant::Video, "page"));
    }

    #[test]
    fn test_build_rejects_invalid_declarations() {
        let err = RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("a"))
            .owner_type(OwnerTypeDef::new("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateType(_)));

        let err = RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("a").extends("missing"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownParent { .. }));

        let err = RegistryBuilder::new()
            .register(RelationVariant::Image, "ghost")
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownType { .. }));

        let err = RegistryBuilder::new()
            .owner_type(OwnerTypeDef::new("a").extends("b"))
            .owner_type(OwnerTypeDef::new("b").extends("a"))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Cycle(_)));

        let err = RegistryBuilder::new()
            .owner_type(
                OwnerTypeDef::new("a")
                    .field(RelatedMediaField::images("media"))
                    .field(RelatedMediaField::files("media")),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateField { .. }));
    }

    #[test]
    fn test_global_install_and_reset() {
        let _guard = GLOBAL_REGISTRY_MUTEX
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        reset();

        assert!(global().is_none());
        install(sample_registry()).unwrap();
        assert!(global().unwrap().relates_to(RelationVariant::Image, "child_set"));

        let err = install(sample_registry()).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyInstalled));

        reset();
        assert!(global().is_none());
    }
}
