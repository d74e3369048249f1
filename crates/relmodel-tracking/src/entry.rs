//! Tracking entries.
//!
//! An entry is one instance tracked under one entity type. Entries are
//! addressed by [`EntryId`]s that are never reused, so a handle to an entry
//! that stopped tracking simply reports [`EntityState::Detached`].

use std::collections::BTreeSet;
use std::fmt;

use relmodel_core::{
    EntityKey, EntityType, EntityTypeId, Error, PropertyIndex, PropertySlot, Result, Value,
};
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, ObjectId};
use crate::state_manager::StateManager;

/// Handle to a tracking entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub(crate) u64);

impl EntryId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entry#{}", self.0)
    }
}

/// Persistence state of a tracked instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityState {
    /// Not tracked.
    Detached,
    /// Will be inserted.
    Added,
    /// Tracked and matching the store.
    Unchanged,
    /// Will be updated.
    Modified,
    /// Will be deleted.
    Deleted,
}

impl EntityState {
    /// Whether the state requires a write on flush.
    pub const fn has_changes(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }
}

impl fmt::Display for EntityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityState::Detached => "Detached",
            EntityState::Added => "Added",
            EntityState::Unchanged => "Unchanged",
            EntityState::Modified => "Modified",
            EntityState::Deleted => "Deleted",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PropertyFlags {
    pub(crate) modified: bool,
    /// Non-nullable FK property whose relationship was severed.
    pub(crate) conceptual_null: bool,
    pub(crate) temporary: bool,
}

/// Last observed value of a navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum NavigationSnapshot {
    Reference(Option<ObjectId>),
    Collection(BTreeSet<ObjectId>),
}

impl NavigationSnapshot {
    pub(crate) fn capture(
        graph: &Graph,
        obj: ObjectId,
        navigation: usize,
        collection: bool,
    ) -> Self {
        if collection {
            NavigationSnapshot::Collection(
                graph.collection_items_at(obj, navigation).into_iter().collect(),
            )
        } else {
            NavigationSnapshot::Reference(graph.reference_at(obj, navigation))
        }
    }
}

#[derive(Debug)]
pub(crate) struct InternalEntry {
    pub(crate) id: EntryId,
    pub(crate) object: ObjectId,
    pub(crate) entity_type: EntityTypeId,
    pub(crate) state: EntityState,
    /// Shadow property values, by shadow index.
    pub(crate) shadow: Vec<Value>,
    /// Temporary values of field-backed properties, by property index. The
    /// instance field stays at its default while a temporary value is set.
    pub(crate) temporary: Vec<Option<Value>>,
    /// Original values by property index; `None` for `Added` entries.
    pub(crate) original: Option<Vec<Value>>,
    pub(crate) flags: Vec<PropertyFlags>,
    pub(crate) property_snapshot: Vec<Value>,
    pub(crate) navigation_snapshot: Vec<NavigationSnapshot>,
    pub(crate) shared_identity: Option<EntryId>,
    pub(crate) key: Option<EntityKey>,
}

impl InternalEntry {
    pub(crate) fn new(id: EntryId, object: ObjectId, et: &EntityType, state: EntityState) -> Self {
        let n = et.properties.len();
        Self {
            id,
            object,
            entity_type: et.id,
            state,
            shadow: vec![Value::Null; et.shadow_count],
            temporary: vec![None; n],
            original: None,
            flags: vec![PropertyFlags::default(); n],
            property_snapshot: vec![Value::Null; n],
            navigation_snapshot: Vec::new(),
            shared_identity: None,
            key: None,
        }
    }

    pub(crate) fn current_value(
        &self,
        et: &EntityType,
        graph: &Graph,
        property: PropertyIndex,
    ) -> Value {
        match et.properties[property].slot {
            PropertySlot::Field(f) => {
                let raw = graph.field(self.object, f);
                match &self.temporary[property] {
                    Some(t) if raw.is_default() => t.clone(),
                    _ => raw.clone(),
                }
            }
            PropertySlot::Shadow(s) => self.shadow[s].clone(),
        }
    }

    pub(crate) fn has_conceptual_null(&self) -> bool {
        self.flags.iter().any(|f| f.conceptual_null)
    }
}

/// Read-only view of a tracked (or untracked) instance under one entity type.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    sm: &'a StateManager,
    id: Option<EntryId>,
    object: ObjectId,
    entity_type: EntityTypeId,
}

impl<'a> EntryRef<'a> {
    pub(crate) fn new(
        sm: &'a StateManager,
        id: Option<EntryId>,
        object: ObjectId,
        entity_type: EntityTypeId,
    ) -> Self {
        Self {
            sm,
            id,
            object,
            entity_type,
        }
    }

    fn internal(&self) -> Option<&'a InternalEntry> {
        self.id.and_then(|id| self.sm.entries.get(&id))
    }

    /// The entry handle, or `None` for an untracked instance.
    pub fn id(&self) -> Option<EntryId> {
        self.id
    }

    pub fn object(&self) -> ObjectId {
        self.object
    }

    pub fn state(&self) -> EntityState {
        self.internal().map_or(EntityState::Detached, |e| e.state)
    }

    pub fn entity_type(&self) -> &'a EntityType {
        self.sm.model.entity_type(self.entity_type)
    }

    pub fn entity_type_name(&self) -> &'a str {
        &self.entity_type().name
    }

    /// Key the entry is registered under.
    pub fn key(&self) -> Option<&'a EntityKey> {
        self.internal().and_then(|e| e.key.as_ref())
    }

    pub fn current_value(&self, property: &str) -> Result<Value> {
        let et = self.entity_type();
        let p = et.find_property(property)?;
        match self.internal() {
            Some(e) => Ok(e.current_value(et, &self.sm.graph, p)),
            None => match et.properties[p].slot {
                PropertySlot::Field(f) => Ok(self.sm.graph.field(self.object, f).clone()),
                PropertySlot::Shadow(_) => Err(Error::invalid(format!(
                    "shadow property '{}.{}' has no value on an untracked instance",
                    et.name, property
                ))),
            },
        }
    }

    /// Original value, or `None` when the entry has no originals (`Added` or
    /// untracked).
    pub fn original_value(&self, property: &str) -> Result<Option<Value>> {
        let p = self.entity_type().find_property(property)?;
        Ok(self
            .internal()
            .and_then(|e| e.original.as_ref())
            .map(|o| o[p].clone()))
    }

    pub fn is_modified(&self, property: &str) -> Result<bool> {
        self.flag(property, |f| f.modified)
    }

    pub fn is_conceptual_null(&self, property: &str) -> Result<bool> {
        self.flag(property, |f| f.conceptual_null)
    }

    pub fn is_temporary(&self, property: &str) -> Result<bool> {
        self.flag(property, |f| f.temporary)
    }

    pub fn has_conceptual_null(&self) -> bool {
        self.internal().is_some_and(InternalEntry::has_conceptual_null)
    }

    /// The entry sharing this entry's key (a `Deleted`/`Added` pair).
    pub fn shared_identity_entry(&self) -> Option<EntryRef<'a>> {
        let other = self.internal()?.shared_identity?;
        let e = self.sm.entries.get(&other)?;
        Some(EntryRef::new(self.sm, Some(other), e.object, e.entity_type))
    }

    /// Names of the properties flagged modified.
    pub fn modified_properties(&self) -> Vec<&'a str> {
        let et = self.entity_type();
        match self.internal() {
            Some(e) => e
                .flags
                .iter()
                .enumerate()
                .filter(|(_, f)| f.modified)
                .map(|(i, _)| et.properties[i].name.as_str())
                .collect(),
            None => Vec::new(),
        }
    }

    fn flag(&self, property: &str, get: impl Fn(&PropertyFlags) -> bool) -> Result<bool> {
        let p = self.entity_type().find_property(property)?;
        Ok(self.internal().is_some_and(|e| get(&e.flags[p])))
    }
}

impl fmt::Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("id", &self.id)
            .field("object", &self.object)
            .field("entity_type", &self.entity_type_name())
            .field("state", &self.state())
            .finish()
    }
}
