//! Relationship metadata: foreign keys, navigations and delete behavior.
//!
//! A relationship is a single foreign key between a principal entity type and
//! a dependent entity type, with up to two navigations (one on each side).
//! Many-to-many is modeled as two one-to-many relationships through a join
//! entity type.

use crate::model::{EntityTypeId, ForeignKeyId, NavigationIndex, PropertyIndex};
use serde::{Deserialize, Serialize};

/// The shape of a relationship as declared on the builder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationshipKind {
    /// One principal has at most one dependent (unique foreign key).
    OneToOne,
    /// One principal has many dependents.
    #[default]
    OneToMany,
}

/// What happens to dependents when their principal is deleted or the
/// relationship is severed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeleteBehavior {
    /// Dependents are deleted, in the tracker and in the store.
    Cascade,
    /// Dependents are deleted by the tracker only.
    ClientCascade,
    /// The foreign key is set to null, in the tracker and in the store.
    SetNull,
    /// The foreign key is set to null by the tracker only.
    ClientSetNull,
    /// The store rejects the delete; the tracker does nothing.
    Restrict,
    /// The store decides; the tracker does nothing.
    NoAction,
    /// Neither side does anything.
    ClientNoAction,
}

impl DeleteBehavior {
    /// Default behavior for a relationship of the given requiredness.
    pub const fn default_for(required: bool) -> Self {
        if required {
            DeleteBehavior::Cascade
        } else {
            DeleteBehavior::ClientSetNull
        }
    }

    /// Whether the tracker deletes dependents.
    pub const fn cascades(self) -> bool {
        matches!(self, DeleteBehavior::Cascade | DeleteBehavior::ClientCascade)
    }

    /// Whether the tracker nulls out dependents' foreign keys.
    pub const fn sets_null(self) -> bool {
        matches!(self, DeleteBehavior::SetNull | DeleteBehavior::ClientSetNull)
    }
}

/// Backing collection for a collection navigation.
///
/// Fixup only relies on membership, so every kind behaves the same from the
/// tracker's point of view; ordering and duplicate semantics are the
/// collection's own.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Insertion-ordered list; membership is by identity.
    #[default]
    List,
    /// Hash set of object handles.
    HashSet,
    /// Ordered set of object handles.
    SortedSet,
}

/// A foreign key between a principal and a dependent entity type.
#[derive(Debug, Clone)]
pub struct ForeignKeyInfo {
    pub id: ForeignKeyId,

    /// The entity type whose key is referenced.
    pub principal: EntityTypeId,

    /// The entity type holding the foreign key properties.
    pub dependent: EntityTypeId,

    /// Foreign key properties on the dependent, in principal key order.
    pub properties: Vec<PropertyIndex>,

    /// Referenced key properties on the principal.
    pub principal_key: Vec<PropertyIndex>,

    /// Whether a dependent must always have a principal.
    pub required: bool,

    /// One-to-one: at most one dependent per principal.
    pub unique: bool,

    pub delete_behavior: DeleteBehavior,

    /// Whether this is the defining foreign key of an owned entity type.
    pub ownership: bool,

    /// Navigation on the dependent pointing at the principal.
    pub dependent_to_principal: Option<NavigationIndex>,

    /// Navigation on the principal pointing at the dependent(s).
    pub principal_to_dependent: Option<NavigationIndex>,
}

impl ForeignKeyInfo {
    /// Whether the dependent's foreign key overlaps its primary key.
    pub fn is_identifying(&self, dependent_key: &[PropertyIndex]) -> bool {
        self.properties.iter().all(|p| dependent_key.contains(p))
    }

    /// Whether a cleared principal should delete this dependent.
    pub fn cascades_delete(&self) -> bool {
        self.ownership || self.delete_behavior.cascades()
    }
}

/// A navigation property on an entity type.
#[derive(Debug, Clone)]
pub struct NavigationInfo {
    pub name: String,

    /// Entity type at the other end.
    pub target: EntityTypeId,

    /// Foreign key this navigation belongs to.
    pub foreign_key: ForeignKeyId,

    /// True when declared on the dependent (points at the principal).
    pub on_dependent: bool,

    pub is_collection: bool,

    pub collection_kind: CollectionKind,
}

impl NavigationInfo {
    /// Whether this is the principal-side navigation of an ownership.
    pub fn is_ownership_principal(&self, fk: &ForeignKeyInfo) -> bool {
        fk.ownership && !self.on_dependent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_behavior_defaults() {
        assert_eq!(DeleteBehavior::default_for(true), DeleteBehavior::Cascade);
        assert_eq!(
            DeleteBehavior::default_for(false),
            DeleteBehavior::ClientSetNull
        );
    }

    #[test]
    fn test_delete_behavior_classification() {
        assert!(DeleteBehavior::Cascade.cascades());
        assert!(DeleteBehavior::ClientCascade.cascades());
        assert!(!DeleteBehavior::Restrict.cascades());
        assert!(DeleteBehavior::SetNull.sets_null());
        assert!(DeleteBehavior::ClientSetNull.sets_null());
        assert!(!DeleteBehavior::ClientNoAction.sets_null());
    }

    #[test]
    fn test_identifying_foreign_key() {
        let fk = ForeignKeyInfo {
            id: ForeignKeyId(0),
            principal: EntityTypeId(0),
            dependent: EntityTypeId(1),
            properties: vec![0],
            principal_key: vec![0],
            required: true,
            unique: true,
            delete_behavior: DeleteBehavior::Restrict,
            ownership: true,
            dependent_to_principal: None,
            principal_to_dependent: None,
        };
        assert!(fk.is_identifying(&[0]));
        assert!(!fk.is_identifying(&[1]));
        assert!(fk.cascades_delete());
    }
}
