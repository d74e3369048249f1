//! Core types for relmodel.
//!
//! This crate provides the foundations the change tracker builds on:
//!
//! - `Value` and `EntityKey` for dynamically typed property values
//! - `Model` describing classes, entity types, foreign keys and ownership
//! - `ModelBuilder` for declaring and validating a model
//! - `Error` taxonomy shared by every relmodel crate
//! - `Outcome` and `Cx` re-exports from asupersync for the async surface

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod builder;
pub mod error;
pub mod field;
pub mod identifiers;
pub mod model;
pub mod relationship;
pub mod value;

pub use builder::{EntityDef, ModelBuilder, OwnedDef, PropertyDef, RelationshipDef};
pub use error::{
    ConceptualNullError, ConfigError, DependentError, DuplicateDependentError, Error,
    IdentityConflictError, KeyReadOnlyError, ModelError, ModelErrorKind, NullKeyError, Result,
};
pub use field::{PropertyInfo, PropertySlot};
pub use identifiers::{is_identifier, owned_type_name};
pub use model::{
    ClassId, ClassInfo, ClassNavigation, EntityType, EntityTypeId, ForeignKeyId, Model,
    NavigationIndex, PropertyIndex,
};
pub use relationship::{
    CollectionKind, DeleteBehavior, ForeignKeyInfo, NavigationInfo, RelationshipKind,
};
pub use value::{EntityKey, Value};
