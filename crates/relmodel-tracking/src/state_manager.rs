//! Entry storage, indexes and state transitions.
//!
//! The [`StateManager`] owns the object arena and every tracking entry.
//! Entries are indexed three ways:
//!
//! - by object: an instance of a shared owned class may have several entries,
//!   one per owned entity type it is reached through
//! - by entity type, for FK scans
//! - by key, through the [`IdentityMap`]
//!
//! Relationship fixup lives in `fixup`, cascades in `cascade` and the snapshot
//! sweep in `change_detector`; each adds its own `impl StateManager` block.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use relmodel_core::{
    EntityKey, EntityType, EntityTypeId, Error, ForeignKeyId, IdentityConflictError, Model,
    NavigationIndex, NullKeyError, PropertyIndex, PropertySlot, Result, Value,
};
use tracing::{debug, trace};

use crate::entry::{EntityState, EntryId, InternalEntry, NavigationSnapshot};
use crate::graph::{Graph, ObjectId};
use crate::identity_map::IdentityMap;
use crate::{TrackerConfig, TrackingEvent};

/// First temporary key value handed out (`i32::MIN + 1000`). Temporary values
/// count up from here, so they stay negative and fit a 32-bit key.
const TEMPORARY_KEY_START: i64 = -2_147_482_648;

/// A navigation that pointed at an instance before the instance was tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Referrer {
    pub(crate) entry: EntryId,
    pub(crate) navigation: NavigationIndex,
}

/// Owns the arena and all tracking state of a session.
#[derive(Debug)]
pub(crate) struct StateManager {
    pub(crate) model: Arc<Model>,
    pub(crate) graph: Graph,
    pub(crate) config: TrackerConfig,
    pub(crate) entries: BTreeMap<EntryId, InternalEntry>,
    next_entry: u64,
    pub(crate) by_object: HashMap<ObjectId, Vec<EntryId>>,
    pub(crate) by_type: HashMap<EntityTypeId, BTreeSet<EntryId>>,
    pub(crate) identity_map: IdentityMap,
    /// Tracked navigations pointing at untracked instances, by target.
    pub(crate) referrers: HashMap<ObjectId, Vec<Referrer>>,
    /// Instances discarded by duplicate resolution, mapped to the winner.
    pub(crate) resolved: HashMap<(ObjectId, EntityTypeId), EntryId>,
    next_temporary: i64,
    pub(crate) events: Vec<TrackingEvent>,
    /// Set while the sweep replays deltas; orphans are handled afterwards.
    pub(crate) deferring_orphans: bool,
}

impl StateManager {
    pub(crate) fn new(graph: Graph, config: TrackerConfig) -> Self {
        Self {
            model: Arc::clone(graph.model()),
            graph,
            config,
            entries: BTreeMap::new(),
            next_entry: 1,
            by_object: HashMap::new(),
            by_type: HashMap::new(),
            identity_map: IdentityMap::new(),
            referrers: HashMap::new(),
            resolved: HashMap::new(),
            next_temporary: TEMPORARY_KEY_START,
            events: Vec::new(),
            deferring_orphans: false,
        }
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// The id the next started entry will get.
    pub(crate) fn watermark(&self) -> u64 {
        self.next_entry
    }

    pub(crate) fn is_live(&self, id: EntryId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn state_of(&self, id: EntryId) -> EntityState {
        self.entries
            .get(&id)
            .map_or(EntityState::Detached, |e| e.state)
    }

    pub(crate) fn object_of(&self, id: EntryId) -> Option<ObjectId> {
        self.entries.get(&id).map(|e| e.object)
    }

    pub(crate) fn entity_type_of(&self, id: EntryId) -> Option<EntityTypeId> {
        self.entries.get(&id).map(|e| e.entity_type)
    }

    /// Every entry tracking the object, oldest first.
    pub(crate) fn entries_for(&self, obj: ObjectId) -> Vec<EntryId> {
        self.by_object.get(&obj).cloned().unwrap_or_default()
    }

    pub(crate) fn entry_for(&self, obj: ObjectId, entity_type: EntityTypeId) -> Option<EntryId> {
        self.by_object.get(&obj).and_then(|ids| {
            ids.iter()
                .copied()
                .find(|id| self.entity_type_of(*id) == Some(entity_type))
        })
    }

    /// The entry a navigation target stands for: its own entry, or the entry
    /// that won duplicate resolution against it.
    pub(crate) fn resolve_target(
        &self,
        obj: ObjectId,
        entity_type: EntityTypeId,
    ) -> Option<EntryId> {
        self.entry_for(obj, entity_type).or_else(|| {
            self.resolved
                .get(&(obj, entity_type))
                .copied()
                .filter(|id| self.is_live(*id))
        })
    }

    pub(crate) fn current_value(&self, id: EntryId, property: PropertyIndex) -> Value {
        match self.entries.get(&id) {
            Some(e) => {
                e.current_value(self.model.entity_type(e.entity_type), &self.graph, property)
            }
            None => Value::Null,
        }
    }

    pub(crate) fn current_values(&self, id: EntryId, properties: &[PropertyIndex]) -> Vec<Value> {
        properties
            .iter()
            .map(|&p| self.current_value(id, p))
            .collect()
    }

    pub(crate) fn is_temporary(&self, id: EntryId, property: PropertyIndex) -> bool {
        self.entries
            .get(&id)
            .is_some_and(|e| e.flags[property].temporary)
    }

    pub(crate) fn current_key(&self, id: EntryId) -> Option<EntityKey> {
        let et = self.model.entity_type(self.entity_type_of(id)?);
        Some(EntityKey::new(self.current_values(id, &et.key)))
    }

    /// Key rendered for logs and errors, only with sensitive data logging.
    pub(crate) fn render_key(&self, key: Option<&EntityKey>) -> Option<String> {
        if self.config.sensitive_data_logging {
            key.map(ToString::to_string)
        } else {
            None
        }
    }

    // ------------------------------------------------------------------
    // Value writes
    // ------------------------------------------------------------------

    /// Write a property value without any fixup.
    ///
    /// A temporary value on a field-backed property is kept on the entry and
    /// the field reset to `Null`; a real value clears the temporary overlay of
    /// every entry sharing the field.
    pub(crate) fn store_value(
        &mut self,
        id: EntryId,
        property: PropertyIndex,
        value: Value,
        temporary: bool,
    ) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let et = model.entity_type(entry.entity_type);
        let obj = entry.object;
        entry.flags[property].temporary = temporary;
        match et.properties[property].slot {
            PropertySlot::Shadow(s) => {
                entry.shadow[s] = value;
                self.refresh_property_snapshot(id, property);
            }
            PropertySlot::Field(f) => {
                if temporary {
                    entry.temporary[property] = Some(value);
                    self.graph.set_field(obj, f, Value::Null);
                } else {
                    for other in self.entries_for(obj) {
                        self.clear_overlay(other, f);
                    }
                    self.graph.set_field(obj, f, value);
                }
                self.refresh_field_snapshots(obj, f);
            }
        }
    }

    /// Drop the temporary overlay for a field on one entry.
    pub(crate) fn clear_overlay(&mut self, id: EntryId, field: usize) {
        let model = Arc::clone(&self.model);
        if let Some(entry) = self.entries.get_mut(&id) {
            let et = model.entity_type(entry.entity_type);
            for (p, f) in et.field_properties() {
                if f == field {
                    entry.temporary[p] = None;
                    entry.flags[p].temporary = false;
                }
            }
        }
    }

    pub(crate) fn refresh_property_snapshot(&mut self, id: EntryId, property: PropertyIndex) {
        let value = self.current_value(id, property);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.property_snapshot[property] = value;
        }
    }

    /// Re-snapshot a field on every entry of the object that maps it.
    pub(crate) fn refresh_field_snapshots(&mut self, obj: ObjectId, field: usize) {
        let model = Arc::clone(&self.model);
        for id in self.entries_for(obj) {
            let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
                continue;
            };
            for (p, f) in et.field_properties() {
                if f == field {
                    self.refresh_property_snapshot(id, p);
                }
            }
        }
    }

    /// Re-read a reference navigation into the snapshot of every entry of `obj`.
    pub(crate) fn refresh_reference_snapshot(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
    ) {
        let target = self.graph.reference_at(obj, navigation);
        for id in self.entries_for(obj) {
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(NavigationSnapshot::Reference(r)) =
                    entry.navigation_snapshot.get_mut(navigation)
                {
                    *r = target;
                }
            }
        }
    }

    /// Re-read whether each of `items` is a member of a collection navigation.
    ///
    /// Only the named members are touched: a raw edit to another member that
    /// the sweep has not replayed yet must still show up as a delta.
    pub(crate) fn refresh_member_snapshots(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        items: &[ObjectId],
    ) {
        let present: Vec<(ObjectId, bool)> = items
            .iter()
            .map(|&item| (item, self.graph.collection_contains_at(obj, navigation, item)))
            .collect();
        for id in self.entries_for(obj) {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            if let Some(NavigationSnapshot::Collection(members)) =
                entry.navigation_snapshot.get_mut(navigation)
            {
                for &(item, member) in &present {
                    if member {
                        members.insert(item);
                    } else {
                        members.remove(&item);
                    }
                }
            }
        }
    }

    pub(crate) fn write_reference(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        target: Option<ObjectId>,
    ) {
        trace!(object = %obj, navigation, ?target, "fixup: write reference");
        self.graph.set_reference_at(obj, navigation, target);
        self.refresh_reference_snapshot(obj, navigation);
    }

    pub(crate) fn collection_add(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        item: ObjectId,
    ) {
        if !self.graph.collection_contains_at(obj, navigation, item) {
            trace!(object = %obj, navigation, item = %item, "fixup: add to collection");
            self.graph.collection_add_at(obj, navigation, item);
        }
        self.refresh_member_snapshots(obj, navigation, &[item]);
    }

    pub(crate) fn collection_remove(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        item: ObjectId,
    ) {
        while self.graph.collection_remove_at(obj, navigation, item) {
            trace!(object = %obj, navigation, item = %item, "fixup: remove from collection");
        }
        self.refresh_member_snapshots(obj, navigation, &[item]);
    }

    /// Snapshot every property and navigation of an entry.
    pub(crate) fn take_snapshots(&mut self, id: EntryId) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get(&id) else {
            return;
        };
        let et = model.entity_type(entry.entity_type);
        let obj = entry.object;
        let properties = (0..et.properties.len())
            .map(|p| self.current_value(id, p))
            .collect();
        let navigations = et
            .navigations
            .iter()
            .enumerate()
            .map(|(ni, nav)| NavigationSnapshot::capture(&self.graph, obj, ni, nav.is_collection))
            .collect();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.property_snapshot = properties;
            entry.navigation_snapshot = navigations;
        }
    }

    pub(crate) fn set_original_values(&mut self, id: EntryId) {
        let Some(et) = self.entity_type_of(id) else {
            return;
        };
        let count = self.model.entity_type(et).properties.len();
        let values = (0..count).map(|p| self.current_value(id, p)).collect();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.original = Some(values);
        }
    }

    /// Flag a non-key property modified; `Unchanged` entries become `Modified`.
    pub(crate) fn mark_modified(&mut self, id: EntryId, property: PropertyIndex) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        if !matches!(entry.state, EntityState::Unchanged | EntityState::Modified) {
            return;
        }
        if model.entity_type(entry.entity_type).properties[property].is_key {
            return;
        }
        entry.flags[property].modified = true;
        if entry.state == EntityState::Unchanged {
            self.change_state(id, EntityState::Modified);
        }
    }

    /// Mark the property modified if its current value left the original.
    pub(crate) fn note_value_change(&mut self, id: EntryId, property: PropertyIndex) {
        let current = self.current_value(id, property);
        let differs = self
            .entries
            .get(&id)
            .and_then(|e| e.original.as_ref())
            .is_some_and(|o| !o[property].same_as(&current));
        if differs {
            self.mark_modified(id, property);
        }
    }

    // ------------------------------------------------------------------
    // Temporary keys
    // ------------------------------------------------------------------

    fn next_temporary_value(&mut self, template: &Value) -> Value {
        let n = self.next_temporary;
        self.next_temporary += 1;
        match template {
            Value::Int(_) => Value::Int(i32::try_from(n).unwrap_or(i32::MIN)),
            Value::Uuid(_) => {
                let mut bytes = [0xff_u8; 16];
                bytes[8..].copy_from_slice(&n.to_be_bytes());
                Value::Uuid(bytes)
            }
            _ => Value::BigInt(n),
        }
    }

    /// Give every unset value-generated key property a temporary value.
    pub(crate) fn assign_temporary_keys(&mut self, id: EntryId) {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return;
        };
        for &p in &et.key {
            if !et.properties[p].value_generated {
                continue;
            }
            let current = self.current_value(id, p);
            if current.is_default() {
                let value = self.next_temporary_value(&current);
                trace!(
                    entity_type = %et.name,
                    property = %et.properties[p].name,
                    "assigning temporary key value"
                );
                self.store_value(id, p, value, true);
            }
        }
    }

    /// Re-register an entry under its current key.
    pub(crate) fn rekey(&mut self, id: EntryId) -> Result<()> {
        let Some(new_key) = self.current_key(id) else {
            return Ok(());
        };
        let Some(entry) = self.entries.get(&id) else {
            return Ok(());
        };
        let et = entry.entity_type;
        if entry.key.as_ref() == Some(&new_key) {
            return Ok(());
        }
        if let Some(old) = entry.key.clone() {
            self.identity_map.remove(et, &old, id);
        }
        if new_key.has_null() {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.key = None;
            }
            return Ok(());
        }
        if let Some(existing) = self.identity_map.resolve(et, &new_key) {
            let partner = self.entries.get(&existing).and_then(|e| e.shared_identity);
            if existing != id && partner != Some(id) {
                return Err(Error::IdentityConflict(IdentityConflictError {
                    entity_type: self.model.entity_type(et).name.clone(),
                    key: self.render_key(Some(&new_key)),
                }));
            }
        }
        self.identity_map.insert(et, new_key.clone(), id);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = Some(new_key);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tracking
    // ------------------------------------------------------------------

    /// Start tracking `obj` as `entity_type` in `state` and run initial fixup.
    ///
    /// `hint` names the principal entry and ownership/FK to copy key values
    /// from. Returns the entry that now stands for the instance: a new entry,
    /// the existing one, or the winner of duplicate resolution. `Detached`
    /// requests return `None`.
    pub(crate) fn start_tracking(
        &mut self,
        obj: ObjectId,
        entity_type: EntityTypeId,
        state: EntityState,
        hint: Option<(EntryId, ForeignKeyId)>,
        from_query: bool,
    ) -> Result<Option<EntryId>> {
        if let Some(existing) = self.entry_for(obj, entity_type) {
            self.set_entity_state(existing, state)?;
            return Ok(self.is_live(existing).then_some(existing));
        }
        if state == EntityState::Detached {
            return Ok(None);
        }
        let model = Arc::clone(&self.model);
        let et = model.entity_type(entity_type);
        let class = self.graph.class_of(obj)?;
        if class != et.class {
            return Err(Error::model(
                relmodel_core::ModelErrorKind::Mismatch,
                format!(
                    "instance {obj} of class '{}' cannot be tracked as '{}'",
                    model.class(class).name,
                    et.name
                ),
            ));
        }

        let id = EntryId(self.next_entry);
        self.next_entry += 1;
        self.entries.insert(id, InternalEntry::new(id, obj, et, state));
        self.by_object.entry(obj).or_default().push(id);
        self.by_type.entry(entity_type).or_default().insert(id);

        if let Some((principal, fk_id)) = hint {
            self.apply_hint(id, principal, fk_id);
        }
        if state == EntityState::Added {
            self.assign_temporary_keys(id);
        }

        let key = EntityKey::new(self.current_values(id, &et.key));
        if let Some(pos) = key.values().iter().position(Value::is_null) {
            self.discard_entry(id);
            return Err(Error::NullKey(NullKeyError {
                entity_type: et.name.clone(),
                property: et.properties[et.key[pos]].name.clone(),
            }));
        }

        if let Some(existing) = self.identity_map.resolve(entity_type, &key) {
            let existing_state = self.state_of(existing);
            match (existing_state, state) {
                (EntityState::Deleted, EntityState::Added) => {
                    self.link_shared(existing, id);
                    self.identity_map.insert(entity_type, key.clone(), id);
                }
                (EntityState::Added, EntityState::Deleted) => {
                    self.link_shared(existing, id);
                }
                _ => {
                    self.discard_entry(id);
                    return self.resolve_duplicate(existing, obj, entity_type).map(Some);
                }
            }
        } else {
            self.identity_map.insert(entity_type, key.clone(), id);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.key = Some(key);
        }

        self.take_snapshots(id);
        match state {
            EntityState::Added => {}
            EntityState::Modified => {
                self.set_original_values(id);
                if let Some(entry) = self.entries.get_mut(&id) {
                    for (p, flags) in entry.flags.iter_mut().enumerate() {
                        flags.modified = !et.properties[p].is_key;
                    }
                }
            }
            _ => self.set_original_values(id),
        }

        debug!(
            entity_type = %et.name,
            entry = %id,
            object = %obj,
            ?state,
            from_query,
            "started tracking"
        );
        self.emit(TrackingEvent::Tracked {
            entry: id,
            object: obj,
            entity_type: et.name.clone(),
            state,
            from_query,
        });

        self.check_duplicate_dependent(id)?;
        self.initial_fixup(id, from_query)?;
        Ok(Some(id))
    }

    /// Copy key values from the principal named by a traversal hint.
    ///
    /// Ownership keys always follow the owner; other FKs are only filled when
    /// still unset.
    fn apply_hint(&mut self, id: EntryId, principal: EntryId, fk_id: ForeignKeyId) {
        let model = Arc::clone(&self.model);
        let fk = model.foreign_key(fk_id);
        if self.entity_type_of(id) != Some(fk.dependent) || !self.is_live(principal) {
            return;
        }
        for (&dp, &pp) in fk.properties.iter().zip(&fk.principal_key) {
            if !fk.ownership && !self.current_value(id, dp).is_default() {
                continue;
            }
            let value = self.current_value(principal, pp);
            let temporary = self.is_temporary(principal, pp);
            self.store_value(id, dp, value, temporary);
        }
    }

    fn link_shared(&mut self, a: EntryId, b: EntryId) {
        if let Some(entry) = self.entries.get_mut(&a) {
            entry.shared_identity = Some(b);
        }
        if let Some(entry) = self.entries.get_mut(&b) {
            entry.shared_identity = Some(a);
        }
    }

    /// Remove an entry that never finished starting. No events, no fixup.
    pub(crate) fn discard_entry(&mut self, id: EntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        self.unindex(&entry);
    }

    fn unindex(&mut self, entry: &InternalEntry) {
        if let Some(ids) = self.by_object.get_mut(&entry.object) {
            ids.retain(|e| *e != entry.id);
            if ids.is_empty() {
                self.by_object.remove(&entry.object);
            }
        }
        if let Some(ids) = self.by_type.get_mut(&entry.entity_type) {
            ids.remove(&entry.id);
        }
        self.resolved.retain(|_, winner| *winner != entry.id);
        for list in self.referrers.values_mut() {
            list.retain(|r| r.entry != entry.id);
        }
    }

    /// Stop tracking an entry.
    ///
    /// A `Deleted` entry leaving tracking is removed from its principals'
    /// navigations. With `cascade_owned` and immediate cascade timing, owned
    /// dependents stop tracking too.
    pub(crate) fn stop_tracking(&mut self, id: EntryId, cascade_owned: bool) -> Result<()> {
        if !self.is_live(id) {
            return Ok(());
        }
        let owned = if cascade_owned
            && self.config.cascade_delete_timing == crate::CascadeTiming::Immediate
        {
            self.owned_dependents(id)
        } else {
            Vec::new()
        };

        let Some(mut entry) = self.entries.remove(&id) else {
            return Ok(());
        };
        self.unindex(&entry);
        if let Some(key) = &entry.key {
            let owned_slot = self.identity_map.remove(entry.entity_type, key, id);
            if let Some(partner) = entry.shared_identity.take() {
                if let Some(p) = self.entries.get_mut(&partner) {
                    p.shared_identity = None;
                    if owned_slot {
                        self.identity_map.insert(entry.entity_type, key.clone(), partner);
                    }
                }
            }
        }

        let et_name = self.model.entity_type(entry.entity_type).name.clone();
        debug!(
            entity_type = %et_name,
            entry = %id,
            from = ?entry.state,
            to = ?EntityState::Detached,
            "state changed"
        );
        self.emit(TrackingEvent::StateChanged {
            entry: id,
            object: entry.object,
            entity_type: et_name,
            from: entry.state,
            to: EntityState::Detached,
        });

        if entry.state == EntityState::Deleted {
            self.delete_fixup(&entry);
        }
        for dep in owned {
            self.stop_tracking(dep, true)?;
        }
        Ok(())
    }

    /// Dependents of an entry through its ownership FKs.
    pub(crate) fn owned_dependents(&self, id: EntryId) -> Vec<EntryId> {
        let Some(et) = self.entity_type_of(id) else {
            return Vec::new();
        };
        let model = Arc::clone(&self.model);
        model
            .entity_type(et)
            .referencing_keys
            .iter()
            .map(|fk| model.foreign_key(*fk))
            .filter(|fk| fk.ownership)
            .flat_map(|fk| self.find_dependents(id, fk))
            .filter(|dep| *dep != id)
            .collect()
    }

    /// Move an entry to a new state, applying the side effects of the move.
    pub(crate) fn set_entity_state(&mut self, id: EntryId, new: EntityState) -> Result<()> {
        let old = self.state_of(id);
        if old == EntityState::Detached || old == new {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        match new {
            EntityState::Detached => self.stop_tracking(id, true),
            EntityState::Deleted => {
                self.change_state(id, EntityState::Deleted);
                self.cascade_delete(id, false)?;
                if old == EntityState::Added {
                    self.stop_tracking(id, true)?;
                }
                Ok(())
            }
            EntityState::Modified => {
                if old == EntityState::Added {
                    self.set_original_values(id);
                }
                if let Some(entry) = self.entries.get_mut(&id) {
                    for (p, flags) in entry.flags.iter_mut().enumerate() {
                        flags.modified = !et.properties[p].is_key;
                    }
                }
                self.change_state(id, EntityState::Modified);
                Ok(())
            }
            EntityState::Unchanged => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    for flags in &mut entry.flags {
                        flags.modified = false;
                    }
                }
                self.set_original_values(id);
                self.change_state(id, EntityState::Unchanged);
                Ok(())
            }
            EntityState::Added => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.original = None;
                    for flags in &mut entry.flags {
                        flags.modified = false;
                    }
                }
                self.change_state(id, EntityState::Added);
                self.assign_temporary_keys(id);
                self.rekey(id)
            }
        }
    }

    /// Record a state change on a live entry. No other side effects.
    pub(crate) fn change_state(&mut self, id: EntryId, to: EntityState) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let from = entry.state;
        if from == to {
            return;
        }
        entry.state = to;
        let obj = entry.object;
        let et = model.entity_type(entry.entity_type);
        debug!(entity_type = %et.name, entry = %id, ?from, ?to, "state changed");
        self.emit(TrackingEvent::StateChanged {
            entry: id,
            object: obj,
            entity_type: et.name.clone(),
            from,
            to,
        });
    }

    pub(crate) fn record_referrer(
        &mut self,
        target: ObjectId,
        entry: EntryId,
        navigation: NavigationIndex,
    ) {
        let list = self.referrers.entry(target).or_default();
        let referrer = Referrer { entry, navigation };
        if !list.contains(&referrer) {
            list.push(referrer);
        }
    }

    pub(crate) fn emit(&mut self, event: TrackingEvent) {
        self.events.push(event);
    }

    /// Forget all entries without fixup.
    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.by_object.clear();
        self.by_type.clear();
        self.identity_map.clear();
        self.referrers.clear();
        self.resolved.clear();
        self.events.clear();
        debug!("state manager cleared");
    }

    /// Entry type of an entity, for error messages.
    pub(crate) fn type_name(&self, entity_type: EntityTypeId) -> &str {
        &self.model.entity_type(entity_type).name
    }

    pub(crate) fn entity_type_info(&self, id: EntryId) -> Option<&EntityType> {
        self.entity_type_of(id).map(|t| self.model.entity_type(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{EntityDef, ModelBuilder, OwnedDef, PropertyDef};

    fn manager() -> StateManager {
        let model = ModelBuilder::new()
            .entity(
                EntityDef::new("Blog")
                    .property(PropertyDef::new("Id").generated())
                    .property(PropertyDef::new("Title").nullable())
                    .key(&["Id"])
                    .owns(OwnedDef::reference("Settings", "BlogSettings")),
            )
            .build()
            .unwrap();
        StateManager::new(Graph::new(Arc::new(model)), TrackerConfig::default())
    }

    fn blog_type(sm: &StateManager) -> EntityTypeId {
        sm.model.find_entity_type("Blog").unwrap()
    }

    #[test]
    fn test_added_entry_gets_temporary_key() {
        let mut sm = manager();
        let blog = sm.graph.create("Blog").unwrap();
        let et = blog_type(&sm);
        let id = sm
            .start_tracking(blog, et, EntityState::Added, None, false)
            .unwrap()
            .unwrap();
        let key = sm.current_value(id, 0);
        assert!(matches!(key, Value::BigInt(v) if v < 0));
        assert!(sm.is_temporary(id, 0));
        // the field itself stays at its default
        assert_eq!(sm.graph.get(blog, "Id").unwrap(), &Value::Null);
        assert_eq!(sm.identity_map.len(), 1);
    }

    #[test]
    fn test_unchanged_with_null_key_fails() {
        let mut sm = manager();
        let blog = sm.graph.create("Blog").unwrap();
        let et = blog_type(&sm);
        let err = sm
            .start_tracking(blog, et, EntityState::Unchanged, None, false)
            .unwrap_err();
        assert!(matches!(err, Error::NullKey(_)));
        assert!(sm.entries.is_empty());
        assert!(sm.entries_for(blog).is_empty());
    }

    #[test]
    fn test_duplicate_key_without_policy_conflicts() {
        let mut sm = manager();
        let et = blog_type(&sm);
        let a = sm.graph.create("Blog").unwrap();
        let b = sm.graph.create("Blog").unwrap();
        sm.graph.set(a, "Id", 1).unwrap();
        sm.graph.set(b, "Id", 1).unwrap();
        sm.start_tracking(a, et, EntityState::Unchanged, None, false)
            .unwrap();
        let err = sm
            .start_tracking(b, et, EntityState::Unchanged, None, false)
            .unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(ref e) if e.key.is_none()));
        assert!(sm.entries_for(b).is_empty());
    }

    #[test]
    fn test_state_transitions_emit_events() {
        let mut sm = manager();
        let et = blog_type(&sm);
        let blog = sm.graph.create("Blog").unwrap();
        sm.graph.set(blog, "Id", 3).unwrap();
        let id = sm
            .start_tracking(blog, et, EntityState::Unchanged, None, false)
            .unwrap()
            .unwrap();
        sm.set_entity_state(id, EntityState::Modified).unwrap();
        assert!(sm.entries[&id].flags[1].modified);
        assert!(!sm.entries[&id].flags[0].modified);
        sm.set_entity_state(id, EntityState::Unchanged).unwrap();
        assert!(!sm.entries[&id].flags[1].modified);
        sm.set_entity_state(id, EntityState::Detached).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Detached);

        let changes = sm
            .events
            .iter()
            .filter(|e| matches!(e, TrackingEvent::StateChanged { .. }))
            .count();
        assert_eq!(changes, 3);
    }

    #[test]
    fn test_removing_added_entry_detaches_it() {
        let mut sm = manager();
        let et = blog_type(&sm);
        let blog = sm.graph.create("Blog").unwrap();
        let id = sm
            .start_tracking(blog, et, EntityState::Added, None, false)
            .unwrap()
            .unwrap();
        sm.set_entity_state(id, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(id), EntityState::Detached);
        assert_eq!(sm.identity_map.len(), 0);
    }
}
