//! relmodel - change tracking and relationship fixup for object graphs.
//!
//! relmodel keeps an in-memory object graph consistent with the relational
//! keys it is mapped to:
//!
//! - A [`Model`] built with [`ModelBuilder`] describes classes, entity types,
//!   keys, foreign keys and owned types
//! - A [`Session`] tracks instances of a [`Graph`] as entries with a
//!   persistence state
//! - Fixup keeps every foreign key, reference navigation and collection
//!   navigation in step as the graph is edited
//! - [`Session::flush_plan`] reports the inserts, updates and deletes a save
//!   would issue, in dependency order
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use relmodel::prelude::*;
//!
//! let model = ModelBuilder::new()
//!     .entity(EntityDef::new("Category").property(PropertyDef::new("Id")).key(&["Id"]))
//!     .entity(
//!         EntityDef::new("Product")
//!             .property(PropertyDef::new("Id"))
//!             .property(PropertyDef::new("CategoryId").nullable())
//!             .key(&["Id"]),
//!     )
//!     .relationship(
//!         RelationshipDef::one_to_many("Category", "Product")
//!             .principal_navigation("Products")
//!             .dependent_navigation("Category")
//!             .foreign_key(&["CategoryId"]),
//!     )
//!     .build()?;
//!
//! let mut session = Session::new(Arc::new(model));
//! let category = session.create("Category")?;
//! let product = session.create("Product")?;
//! session.graph_mut().set(category, "Id", 77)?;
//! session.graph_mut().set(product, "Id", 78)?;
//! session.graph_mut().collection_add(category, "Products", product)?;
//!
//! session.attach(category)?;
//! assert_eq!(session.graph().get(product, "CategoryId")?, &Value::Int(77));
//! assert_eq!(session.graph().reference(product, "Category")?, Some(category));
//! ```
//!
//! # Async key generation
//!
//! [`Session::add_async`] fills store-generated keys from a [`KeyGenerator`]
//! under an asupersync [`Cx`], reporting the result as an [`Outcome`].

// Re-export all public types from sub-crates
pub use relmodel_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Model
    ClassId,
    ClassInfo,
    CollectionKind,
    DeleteBehavior,
    EntityDef,
    EntityKey,
    EntityType,
    EntityTypeId,
    ForeignKeyId,
    ForeignKeyInfo,
    Model,
    ModelBuilder,
    NavigationInfo,
    OwnedDef,
    PropertyDef,
    PropertyInfo,
    PropertySlot,
    RelationshipDef,
    RelationshipKind,
    Value,
    // Errors
    ConceptualNullError,
    ConfigError,
    DependentError,
    DuplicateDependentError,
    Error,
    IdentityConflictError,
    KeyReadOnlyError,
    ModelError,
    ModelErrorKind,
    NullKeyError,
    Result,
};

pub use relmodel_tracking::{
    CascadeTiming, EntityState, EntryId, EntryRef, FlushOrderer, FlushPlan, Graph, GraphNode,
    HashSetCollection, IdentityResolution, KeyGenerator, ListCollection, NavigationCollection,
    ObjectId, PendingOp, PropertyView, ResolvedValues, Session, SortedSetCollection,
    TrackerConfig, TrackingEvent, WarningBehavior, new_collection, resolve_identity,
};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use relmodel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Model building
        CollectionKind,
        DeleteBehavior,
        EntityDef,
        Model,
        ModelBuilder,
        OwnedDef,
        PropertyDef,
        RelationshipDef,
        Value,
        // Tracking
        CascadeTiming,
        EntityState,
        EntryRef,
        IdentityResolution,
        KeyGenerator,
        ObjectId,
        Session,
        TrackerConfig,
        WarningBehavior,
        // Errors
        Error,
        Result,
    };
}
