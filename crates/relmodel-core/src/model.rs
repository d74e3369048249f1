//! The relationship model consumed by the change tracker.
//!
//! A [`Model`] is immutable once built (see [`crate::builder::ModelBuilder`]).
//! It describes:
//!
//! - *classes*: the runtime layout of instances (field and navigation slots)
//! - *entity types*: a mapping of a class to properties, a key and navigations
//! - *foreign keys*: principal/dependent pairs with their navigations
//!
//! Several owned entity types may share one class; instances of such a class
//! are then tracked once per owner navigation that reaches them.

use crate::error::{Error, ModelErrorKind, Result};
use crate::field::{PropertyInfo, PropertySlot};
use crate::relationship::{CollectionKind, ForeignKeyInfo, NavigationInfo};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index of a property within its entity type.
pub type PropertyIndex = usize;

/// Index of a navigation within its entity type (equal to the class
/// navigation index).
pub type NavigationIndex = usize;

/// Handle to a class in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClassId(pub usize);

/// Handle to an entity type in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityTypeId(pub usize);

/// Handle to a foreign key in a [`Model`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyId(pub usize);

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A navigation slot on a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNavigation {
    pub name: String,
    pub is_collection: bool,
    pub collection_kind: CollectionKind,
}

/// Runtime layout of instances.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub id: ClassId,
    pub name: String,
    /// Scalar field names, by field index.
    pub fields: Vec<String>,
    /// Navigation slots, by navigation index.
    pub navigations: Vec<ClassNavigation>,
}

impl ClassInfo {
    /// Field index by name.
    pub fn field(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == name)
    }

    /// Navigation index by name.
    pub fn navigation(&self, name: &str) -> Option<NavigationIndex> {
        self.navigations.iter().position(|n| n.name == name)
    }
}

/// A class mapped to properties, a key and navigations.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub name: String,
    pub class: ClassId,
    pub properties: Vec<PropertyInfo>,
    /// Primary key properties, in key order.
    pub key: Vec<PropertyIndex>,
    /// Navigations, in class navigation order.
    pub navigations: Vec<NavigationInfo>,
    /// Foreign keys where this type is the dependent.
    pub foreign_keys: Vec<ForeignKeyId>,
    /// Foreign keys where this type is the principal.
    pub referencing_keys: Vec<ForeignKeyId>,
    /// Defining foreign key when this type is owned.
    pub ownership: Option<ForeignKeyId>,
    /// Number of shadow slots an entry for this type carries.
    pub shadow_count: usize,
}

impl EntityType {
    /// Property index by name.
    pub fn property(&self, name: &str) -> Option<PropertyIndex> {
        self.properties.iter().position(|p| p.name == name)
    }

    /// Property index by name, as a model error when missing.
    pub fn find_property(&self, name: &str) -> Result<PropertyIndex> {
        self.property(name).ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownProperty,
                format!("entity type '{}' has no property '{}'", self.name, name),
            )
        })
    }

    /// Navigation index by name.
    pub fn navigation(&self, name: &str) -> Option<NavigationIndex> {
        self.navigations.iter().position(|n| n.name == name)
    }

    /// Navigation index by name, as a model error when missing.
    pub fn find_navigation(&self, name: &str) -> Result<NavigationIndex> {
        self.navigation(name).ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownNavigation,
                format!("entity type '{}' has no navigation '{}'", self.name, name),
            )
        })
    }

    /// Whether this type is owned by another.
    pub fn is_owned(&self) -> bool {
        self.ownership.is_some()
    }

    /// Whether the property is a value-generated key property.
    pub fn is_generated_key(&self, property: PropertyIndex) -> bool {
        let info = &self.properties[property];
        info.is_key && info.value_generated
    }

    /// Class field index for each field-backed property.
    pub fn field_properties(&self) -> impl Iterator<Item = (PropertyIndex, usize)> + '_ {
        self.properties
            .iter()
            .enumerate()
            .filter_map(|(i, p)| match p.slot {
                PropertySlot::Field(f) => Some((i, f)),
                PropertySlot::Shadow(_) => None,
            })
    }
}

/// The complete relationship model.
#[derive(Debug, Clone)]
pub struct Model {
    pub(crate) classes: Vec<ClassInfo>,
    pub(crate) entity_types: Vec<EntityType>,
    pub(crate) foreign_keys: Vec<ForeignKeyInfo>,
    pub(crate) types_by_name: HashMap<String, EntityTypeId>,
    pub(crate) classes_by_name: HashMap<String, ClassId>,
    pub(crate) types_by_class: Vec<Vec<EntityTypeId>>,
}

impl Model {
    pub fn class(&self, id: ClassId) -> &ClassInfo {
        &self.classes[id.0]
    }

    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.0]
    }

    pub fn foreign_key(&self, id: ForeignKeyId) -> &ForeignKeyInfo {
        &self.foreign_keys[id.0]
    }

    pub fn classes(&self) -> &[ClassInfo] {
        &self.classes
    }

    pub fn entity_types(&self) -> &[EntityType] {
        &self.entity_types
    }

    pub fn foreign_keys(&self) -> &[ForeignKeyInfo] {
        &self.foreign_keys
    }

    /// Look up an entity type by name (owned types use their derived name).
    pub fn find_entity_type(&self, name: &str) -> Result<EntityTypeId> {
        self.types_by_name.get(name).copied().ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownEntityType,
                format!("no entity type named '{name}'"),
            )
        })
    }

    /// Look up a class by name.
    pub fn find_class(&self, name: &str) -> Result<ClassId> {
        self.classes_by_name.get(name).copied().ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownClass,
                format!("no class named '{name}'"),
            )
        })
    }

    /// Every entity type mapping the class.
    pub fn entity_types_of_class(&self, class: ClassId) -> &[EntityTypeId] {
        &self.types_by_class[class.0]
    }

    /// The single non-owned entity type of a class, if the class has one.
    pub fn root_type_of_class(&self, class: ClassId) -> Option<EntityTypeId> {
        self.types_by_class[class.0]
            .iter()
            .copied()
            .find(|t| !self.entity_type(*t).is_owned())
    }

    /// Navigation on the dependent pointing at the principal.
    pub fn dependent_navigation(
        &self,
        fk: ForeignKeyId,
    ) -> Option<(EntityTypeId, NavigationIndex)> {
        let info = self.foreign_key(fk);
        info.dependent_to_principal.map(|n| (info.dependent, n))
    }

    /// Navigation on the principal pointing at the dependent(s).
    pub fn principal_navigation(
        &self,
        fk: ForeignKeyId,
    ) -> Option<(EntityTypeId, NavigationIndex)> {
        let info = self.foreign_key(fk);
        info.principal_to_dependent.map(|n| (info.principal, n))
    }

    /// Qualified property name, e.g. `Product.CategoryId`.
    pub fn property_name(&self, entity_type: EntityTypeId, property: PropertyIndex) -> String {
        let et = self.entity_type(entity_type);
        format!("{}.{}", et.name, et.properties[property].name)
    }

    /// Depth of each entity type in the principal → dependent graph
    /// (principals first). Ownership and self references are included; cycles
    /// are cut at the first revisit.
    pub fn dependency_depths(&self) -> Vec<usize> {
        fn depth(
            model: &Model,
            id: usize,
            memo: &mut Vec<Option<usize>>,
            visiting: &mut Vec<bool>,
        ) -> usize {
            if let Some(d) = memo[id] {
                return d;
            }
            if visiting[id] {
                return 0;
            }
            visiting[id] = true;
            let mut d = 0;
            for fk in &model.entity_types[id].foreign_keys {
                let principal = model.foreign_keys[fk.0].principal.0;
                if principal != id {
                    d = d.max(depth(model, principal, memo, visiting) + 1);
                }
            }
            visiting[id] = false;
            memo[id] = Some(d);
            d
        }

        let n = self.entity_types.len();
        let mut memo = vec![None; n];
        let mut visiting = vec![false; n];
        (0..n)
            .map(|id| depth(self, id, &mut memo, &mut visiting))
            .collect()
    }
}
