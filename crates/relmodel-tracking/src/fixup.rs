//! Relationship fixup.
//!
//! Keeps foreign key values and navigations in step. Each handler receives
//! the value that was written last and brings every other side of the
//! relationship in line with it:
//!
//! - an FK that matches a tracked principal sets the dependent's navigation
//!   and puts the dependent into the principal's navigation
//! - a navigation set on either side writes the dependent's FK
//! - a cleared navigation nulls the FK (optional relationships) or flags it
//!   conceptually null (required relationships)
//!
//! Handlers only ever touch the local neighborhood of the changed entry.

use std::sync::Arc;

use relmodel_core::{
    DuplicateDependentError, EntityKey, EntityTypeId, Error, ForeignKeyInfo,
    IdentityConflictError, KeyReadOnlyError, NavigationIndex, PropertyIndex, PropertySlot, Result,
    Value,
};
use tracing::{trace, warn};

use crate::WarningBehavior;
use crate::entry::{EntityState, EntryId};
use crate::graph::ObjectId;
use crate::identity_map::{PropertyView, resolve_identity};
use crate::state_manager::StateManager;

fn values_match(a: &[Value], b: &[Value]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_as(y))
}

impl StateManager {
    // ------------------------------------------------------------------
    // Principal and dependent lookup (by FK values, never by navigation)
    // ------------------------------------------------------------------

    pub(crate) fn find_principal_by_values(
        &self,
        fk: &ForeignKeyInfo,
        values: &[Value],
    ) -> Option<EntryId> {
        if values.is_empty() || values.iter().any(Value::is_null) {
            return None;
        }
        if fk.principal_key == self.model.entity_type(fk.principal).key {
            return self
                .identity_map
                .resolve(fk.principal, &EntityKey::new(values.to_vec()));
        }
        self.by_type.get(&fk.principal)?.iter().copied().find(|p| {
            values_match(&self.current_values(*p, &fk.principal_key), values)
        })
    }

    pub(crate) fn find_principal(&self, dep: EntryId, fk: &ForeignKeyInfo) -> Option<EntryId> {
        let values = self.current_values(dep, &fk.properties);
        self.find_principal_by_values(fk, &values)
    }

    pub(crate) fn find_dependents_by_values(
        &self,
        fk: &ForeignKeyInfo,
        values: &[Value],
    ) -> Vec<EntryId> {
        if values.iter().any(Value::is_null) {
            return Vec::new();
        }
        self.by_type
            .get(&fk.dependent)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|d| values_match(&self.current_values(*d, &fk.properties), values))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub(crate) fn find_dependents(&self, principal: EntryId, fk: &ForeignKeyInfo) -> Vec<EntryId> {
        let values = self.current_values(principal, &fk.principal_key);
        self.find_dependents_by_values(fk, &values)
    }

    // ------------------------------------------------------------------
    // Initial fixup
    // ------------------------------------------------------------------

    /// Connect a newly tracked entry with everything already tracked.
    ///
    /// FK matches go first, so the entry's own FK values decide its own
    /// navigations. Navigations of the entry are followed afterwards, except
    /// for query results. Finally, tracked navigations that pointed at the
    /// instance before it was tracked are linked.
    pub(crate) fn initial_fixup(&mut self, id: EntryId, from_query: bool) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let Some(obj) = self.object_of(id) else {
            return Ok(());
        };
        let set_modified = self.state_of(id) != EntityState::Unchanged;

        // As dependent.
        for &fk_id in &et.foreign_keys {
            if !self.is_live(id) {
                return Ok(());
            }
            let fk = model.foreign_key(fk_id);
            if let Some(principal) = self.find_principal(id, fk) {
                let principal_obj = self.object_of(principal);
                self.set_dependent_navigation(id, fk, principal_obj);
                self.to_dependent_fixup(principal, fk, id)?;
            }
        }

        // As principal.
        for &fk_id in &et.referencing_keys {
            let fk = model.foreign_key(fk_id);
            let mut dependents = self.find_dependents(id, fk);
            if fk.ownership {
                // a displaced owned dependent sharing the key stays displaced
                dependents.retain(|d| self.state_of(*d) != EntityState::Deleted);
            }
            if fk.unique {
                dependents.truncate(1);
                let current = fk
                    .principal_to_dependent
                    .and_then(|pn| self.graph.reference_at(obj, pn));
                if let (Some(current), Some(dep)) = (current, dependents.first()) {
                    if self.object_of(*dep) != Some(current) {
                        dependents.clear();
                    }
                }
            }
            for dep in dependents {
                if !self.is_live(id) {
                    return Ok(());
                }
                self.set_dependent_navigation(dep, fk, Some(obj));
                self.to_dependent_fixup(id, fk, dep)?;
            }
        }

        // Navigations of the new entry.
        if !from_query {
            for (ni, nav) in et.navigations.iter().enumerate() {
                let fk = model.foreign_key(nav.foreign_key);
                for target in self.graph.targets_at(obj, ni) {
                    if !self.is_live(id) {
                        return Ok(());
                    }
                    if let Some(t) = self.resolve_target(target, nav.target) {
                        self.link_via_navigation(id, ni, t, set_modified)?;
                    } else if nav.is_ownership_principal(fk) {
                        self.record_referrer(target, id, ni);
                        let state = self.owned_start_state(id, target, nav.target);
                        self.start_tracking(target, nav.target, state, Some((id, fk.id)), false)?;
                    } else {
                        self.record_referrer(target, id, ni);
                    }
                }
            }
        }

        // Tracked navigations that were waiting for this instance.
        let waiting: Vec<_> = match self.referrers.get_mut(&obj) {
            Some(list) => {
                let mut matched = Vec::new();
                list.retain(|r| {
                    let target = self
                        .entries
                        .get(&r.entry)
                        .map(|e| model.entity_type(e.entity_type).navigations[r.navigation].target);
                    if target == Some(et.id) {
                        matched.push(*r);
                        false
                    } else {
                        true
                    }
                });
                matched
            }
            None => Vec::new(),
        };
        if self.referrers.get(&obj).is_some_and(Vec::is_empty) {
            self.referrers.remove(&obj);
        }
        for r in waiting {
            if !self.is_live(id) {
                break;
            }
            let Some(source_obj) = self.object_of(r.entry) else {
                continue;
            };
            if self.graph.targets_at(source_obj, r.navigation).contains(&obj) {
                self.link_via_navigation(r.entry, r.navigation, id, set_modified)?;
            }
        }
        Ok(())
    }

    /// State for an owned instance discovered through its owner.
    fn owned_start_state(
        &self,
        owner: EntryId,
        obj: ObjectId,
        entity_type: EntityTypeId,
    ) -> EntityState {
        let owner_state = self.state_of(owner);
        if owner_state == EntityState::Added || self.generated_key_unset(obj, entity_type) {
            EntityState::Added
        } else {
            owner_state
        }
    }

    /// Whether an untracked instance has a value-generated key still unset.
    /// Shadow keys of untracked instances count as unset.
    pub(crate) fn generated_key_unset(&self, obj: ObjectId, entity_type: EntityTypeId) -> bool {
        let et = self.model.entity_type(entity_type);
        et.key
            .iter()
            .map(|&p| &et.properties[p])
            .filter(|info| info.value_generated)
            .any(|info| match info.slot {
                PropertySlot::Field(f) => self.graph.field(obj, f).is_default(),
                PropertySlot::Shadow(_) => true,
            })
    }

    /// Link `source` to the tracked `target` its navigation points at.
    pub(crate) fn link_via_navigation(
        &mut self,
        source: EntryId,
        navigation: NavigationIndex,
        target: EntryId,
        set_modified: bool,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(source).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let (Some(source_obj), Some(target_obj)) = (self.object_of(source), self.object_of(target))
        else {
            return Ok(());
        };
        let nav = &et.navigations[navigation];
        let fk = model.foreign_key(nav.foreign_key);
        trace!(
            entity_type = %et.name,
            navigation = %nav.name,
            source = %source,
            target = %target,
            "fixup: link via navigation"
        );
        if nav.on_dependent {
            let dep = self.set_foreign_key(source, fk, target, set_modified)?;
            self.to_dependent_fixup(target, fk, dep)?;
        } else {
            self.detach_from_old_principal(target, fk, source);
            let dep = self.set_foreign_key(target, fk, source, set_modified)?;
            self.set_dependent_navigation(dep, fk, Some(source_obj));
            if fk.unique && self.graph.reference_at(source_obj, navigation) != Some(target_obj) {
                self.to_dependent_fixup(source, fk, dep)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Primitives
    // ------------------------------------------------------------------

    /// Put the dependent into the principal's navigation. For one-to-one
    /// relationships a dependent already referenced there is orphaned.
    pub(crate) fn to_dependent_fixup(
        &mut self,
        principal: EntryId,
        fk: &ForeignKeyInfo,
        dep: EntryId,
    ) -> Result<()> {
        let Some(pn) = fk.principal_to_dependent else {
            return Ok(());
        };
        let (Some(p_obj), Some(d_obj)) = (self.object_of(principal), self.object_of(dep)) else {
            return Ok(());
        };
        if fk.unique {
            let current = self.graph.reference_at(p_obj, pn);
            if current != Some(d_obj) {
                self.write_reference(p_obj, pn, Some(d_obj));
                if let Some(old) = current {
                    if let Some(old_dep) = self.resolve_target(old, fk.dependent) {
                        if old_dep != dep {
                            self.orphan_dependent(old_dep, fk, principal)?;
                        }
                    }
                }
            }
        } else if !self.graph.collection_contains_at(p_obj, pn, d_obj) {
            self.collection_add(p_obj, pn, d_obj);
        }
        Ok(())
    }

    /// Point the dependent's navigation at `principal`, taking the dependent
    /// out of whatever principal it pointed at before.
    pub(crate) fn set_dependent_navigation(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        principal: Option<ObjectId>,
    ) {
        let Some(dn) = fk.dependent_to_principal else {
            return;
        };
        let Some(d_obj) = self.object_of(dep) else {
            return;
        };
        let current = self.graph.reference_at(d_obj, dn);
        if current == principal {
            return;
        }
        self.write_reference(d_obj, dn, principal);
        if let Some(old) = current {
            if let Some(old_principal) = self.resolve_target(old, fk.principal) {
                self.remove_from_principal_navigation(old_principal, fk, d_obj);
            }
        }
    }

    pub(crate) fn remove_from_principal_navigation(
        &mut self,
        principal: EntryId,
        fk: &ForeignKeyInfo,
        dep_obj: ObjectId,
    ) {
        let Some(pn) = fk.principal_to_dependent else {
            return;
        };
        let Some(p_obj) = self.object_of(principal) else {
            return;
        };
        if fk.unique {
            if self.graph.reference_at(p_obj, pn) == Some(dep_obj) {
                self.write_reference(p_obj, pn, None);
            }
        } else if self.graph.collection_contains_at(p_obj, pn, dep_obj) {
            self.collection_remove(p_obj, pn, dep_obj);
        }
    }

    /// Take a dependent out of the navigations of the principal it belonged
    /// to, both by FK and by navigation, unless that is `keep`.
    pub(crate) fn detach_from_old_principal(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        keep: EntryId,
    ) {
        let Some(d_obj) = self.object_of(dep) else {
            return;
        };
        let mut old = Vec::with_capacity(2);
        if let Some(p) = self.find_principal(dep, fk) {
            old.push(p);
        }
        if let Some(dn) = fk.dependent_to_principal {
            if let Some(p) = self
                .graph
                .reference_at(d_obj, dn)
                .and_then(|t| self.resolve_target(t, fk.principal))
            {
                old.push(p);
            }
        }
        for p in old {
            if p != keep {
                self.remove_from_principal_navigation(p, fk, d_obj);
            }
        }
    }

    /// Sever a dependent from `principal`: clear its navigation when it still
    /// points there, then null (or flag) its FK.
    pub(crate) fn orphan_dependent(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        principal: EntryId,
    ) -> Result<()> {
        if let (Some(dn), Some(d_obj), Some(p_obj)) = (
            fk.dependent_to_principal,
            self.object_of(dep),
            self.object_of(principal),
        ) {
            if self.graph.reference_at(d_obj, dn) == Some(p_obj) {
                self.write_reference(d_obj, dn, None);
            }
        }
        self.conditionally_null_foreign_key(dep, fk, Some(principal))
    }

    /// Write the principal's key into the dependent's FK.
    ///
    /// Returns the entry now standing for the dependent: moving an `Added`
    /// owned dependent to another owner re-creates its entry.
    pub(crate) fn set_foreign_key(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        principal: EntryId,
        set_modified: bool,
    ) -> Result<EntryId> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(dep).map(|t| model.entity_type(t)) else {
            return Ok(dep);
        };

        let mut changes = Vec::new();
        for (&dp, &pp) in fk.properties.iter().zip(&fk.principal_key) {
            let value = self.current_value(principal, pp);
            let temporary = self.is_temporary(principal, pp);
            let current = self.current_value(dep, dp);
            if !current.same_as(&value) || self.is_temporary(dep, dp) != temporary {
                changes.push((dp, current, value, temporary));
            }
        }
        self.clear_conceptual_nulls(dep, fk);
        if changes.is_empty() {
            return Ok(dep);
        }

        let key_change = changes
            .iter()
            .find(|(p, old, new, _)| et.properties[*p].is_key && !old.same_as(new))
            .map(|(p, ..)| *p);
        if let Some(p) = key_change {
            if self.state_of(dep) != EntityState::Added {
                return Err(Error::KeyReadOnly(KeyReadOnlyError {
                    entity_type: et.name.clone(),
                    property: et.properties[p].name.clone(),
                }));
            }
            if fk.ownership {
                if let Some(old_owner) = self.find_principal(dep, fk) {
                    if old_owner != principal {
                        return self.reparent_owned(dep, fk, old_owner, principal);
                    }
                }
            }
        }

        trace!(
            entity_type = %et.name,
            entry = %dep,
            principal = %principal,
            "fixup: set foreign key"
        );
        for (p, _, value, temporary) in &changes {
            self.store_value(dep, *p, value.clone(), *temporary);
        }
        for (p, old, ..) in changes {
            self.after_property_write(dep, p, &old, set_modified)?;
        }
        Ok(dep)
    }

    /// Move an `Added` owned dependent to another owner. Its old entry stops
    /// tracking and a new `Added` entry is created under the new owner.
    fn reparent_owned(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        old_owner: EntryId,
        new_owner: EntryId,
    ) -> Result<EntryId> {
        let (Some(obj), Some(entity_type)) = (self.object_of(dep), self.entity_type_of(dep)) else {
            return Ok(dep);
        };
        trace!(
            entity_type = %self.type_name(entity_type),
            entry = %dep,
            old_owner = %old_owner,
            new_owner = %new_owner,
            "fixup: owned dependent moves to another owner"
        );
        self.remove_from_principal_navigation(old_owner, fk, obj);
        self.stop_tracking(dep, true)?;
        self.start_tracking(obj, entity_type, EntityState::Added, Some((new_owner, fk.id)), false)?
            .ok_or_else(|| Error::invalid(format!("owned instance {obj} could not be re-tracked")))
    }

    fn clear_conceptual_nulls(&mut self, dep: EntryId, fk: &ForeignKeyInfo) {
        if let Some(entry) = self.entries.get_mut(&dep) {
            for &p in &fk.properties {
                entry.flags[p].conceptual_null = false;
            }
        }
    }

    /// Bookkeeping after a property value was written: flags, snapshot,
    /// modified state, key registration and propagation to dependents.
    pub(crate) fn after_property_write(
        &mut self,
        id: EntryId,
        property: PropertyIndex,
        old: &Value,
        set_modified: bool,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let info = &et.properties[property];
        let new = self.current_value(id, property);
        if let Some(entry) = self.entries.get_mut(&id) {
            if !new.is_null() {
                entry.flags[property].conceptual_null = false;
            } else if info.is_foreign_key() && !info.nullable {
                entry.flags[property].conceptual_null = true;
            }
        }
        self.refresh_property_snapshot(id, property);
        if set_modified {
            self.note_value_change(id, property);
        } else if let Some(original) = self.entries.get_mut(&id).and_then(|e| e.original.as_mut()) {
            original[property] = new;
        }
        if info.is_key {
            self.rekey(id)?;
        }
        let referenced = et
            .referencing_keys
            .iter()
            .any(|fk| model.foreign_key(*fk).principal_key.contains(&property));
        if referenced {
            self.principal_key_changed(id, property, old)?;
        }
        Ok(())
    }

    /// Propagate a changed principal key value to the dependents that
    /// matched the old value.
    fn principal_key_changed(
        &mut self,
        principal: EntryId,
        property: PropertyIndex,
        old: &Value,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(principal).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        for &fk_id in &et.referencing_keys {
            let fk = model.foreign_key(fk_id);
            if !fk.principal_key.contains(&property) {
                continue;
            }
            let old_values: Vec<Value> = fk
                .principal_key
                .iter()
                .map(|&p| {
                    if p == property {
                        old.clone()
                    } else {
                        self.current_value(principal, p)
                    }
                })
                .collect();
            for dep in self.find_dependents_by_values(fk, &old_values) {
                if dep != principal {
                    self.set_foreign_key(dep, fk, principal, true)?;
                }
            }
        }
        Ok(())
    }

    /// Null the dependent's FK after its relationship with `principal` was
    /// severed. Non-nullable and required FK properties are flagged
    /// conceptually null instead; identifying FKs delete the dependent.
    pub(crate) fn conditionally_null_foreign_key(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        principal: Option<EntryId>,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let state = self.state_of(dep);
        if matches!(state, EntityState::Deleted | EntityState::Detached) {
            return Ok(());
        }
        let Some(et) = self.entity_type_of(dep).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let values = self.current_values(dep, &fk.properties);
        if values.iter().all(Value::is_null) {
            return Ok(());
        }
        if let Some(p) = principal {
            if !values_match(&values, &self.current_values(p, &fk.principal_key)) {
                return Ok(());
            }
        }

        if fk.is_identifying(&et.key) {
            let to = if state == EntityState::Added {
                EntityState::Detached
            } else {
                EntityState::Deleted
            };
            trace!(
                entity_type = %et.name,
                entry = %dep,
                ?to,
                "fixup: identifying relationship severed"
            );
            return self.set_entity_state(dep, to);
        }

        let mut conceptual = false;
        for &p in &fk.properties {
            let info = &et.properties[p];
            if info.is_key {
                continue;
            }
            if info.nullable {
                let old = self.current_value(dep, p);
                if !old.is_null() {
                    self.store_value(dep, p, Value::Null, false);
                    self.after_property_write(dep, p, &old, true)?;
                }
            }
            if !info.nullable || fk.required {
                if let Some(entry) = self.entries.get_mut(&dep) {
                    entry.flags[p].conceptual_null = true;
                }
                self.mark_modified(dep, p);
                conceptual = true;
            }
        }
        trace!(entity_type = %et.name, entry = %dep, conceptual, "fixup: foreign key nulled");
        if conceptual {
            self.handle_conceptual_nulls(dep, false)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Change handlers (notifying setters and sweep replay)
    // ------------------------------------------------------------------

    /// A property value changed from `old` to `new`.
    pub(crate) fn property_changed(
        &mut self,
        id: EntryId,
        property: PropertyIndex,
        old: Value,
        new: &Value,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let info = &et.properties[property];
        if info.is_key && self.state_of(id) != EntityState::Added {
            return Err(Error::KeyReadOnly(KeyReadOnlyError {
                entity_type: et.name.clone(),
                property: info.name.clone(),
            }));
        }
        trace!(
            entity_type = %et.name,
            property = %info.name,
            %old,
            %new,
            "property changed"
        );
        match info.slot {
            PropertySlot::Field(f) => {
                if !new.is_default() {
                    self.clear_overlay(id, f);
                }
            }
            PropertySlot::Shadow(_) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.flags[property].temporary = false;
                }
            }
        }
        self.after_property_write(id, property, &old, true)?;

        for &fk_id in &info.foreign_keys {
            let fk = model.foreign_key(fk_id);
            let old_values: Vec<Value> = fk
                .properties
                .iter()
                .map(|&p| {
                    if p == property {
                        old.clone()
                    } else {
                        self.current_value(id, p)
                    }
                })
                .collect();
            self.foreign_key_changed(id, fk, &old_values)?;
        }
        Ok(())
    }

    /// The dependent's FK moved away from `old_values`.
    fn foreign_key_changed(
        &mut self,
        dep: EntryId,
        fk: &ForeignKeyInfo,
        old_values: &[Value],
    ) -> Result<()> {
        let Some(d_obj) = self.object_of(dep) else {
            return Ok(());
        };
        let old_principal = self.find_principal_by_values(fk, old_values);
        let new_principal = self.find_principal(dep, fk);
        if let Some(old) = old_principal {
            if Some(old) != new_principal {
                self.remove_from_principal_navigation(old, fk, d_obj);
            }
        }
        match new_principal {
            Some(np) => {
                let np_obj = self.object_of(np);
                self.set_dependent_navigation(dep, fk, np_obj);
                self.to_dependent_fixup(np, fk, dep)?;
            }
            None => {
                if let Some(dn) = fk.dependent_to_principal {
                    if self.graph.reference_at(d_obj, dn).is_some() {
                        self.write_reference(d_obj, dn, None);
                    }
                }
            }
        }
        if self.entries.get(&dep).is_some_and(|e| e.has_conceptual_null()) {
            self.handle_conceptual_nulls(dep, false)?;
        }
        Ok(())
    }

    /// A reference navigation changed from `old` to `new`.
    pub(crate) fn navigation_reference_changed(
        &mut self,
        id: EntryId,
        navigation: NavigationIndex,
        old: Option<ObjectId>,
        new: Option<ObjectId>,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let Some(obj) = self.object_of(id) else {
            return Ok(());
        };
        let nav = &et.navigations[navigation];
        let fk = model.foreign_key(nav.foreign_key);
        let deleted = self.state_of(id) == EntityState::Deleted;
        trace!(
            entity_type = %et.name,
            navigation = %nav.name,
            ?old,
            ?new,
            "reference navigation changed"
        );

        if nav.on_dependent {
            let old_principal = old.and_then(|o| self.resolve_target(o, fk.principal));
            if let Some(op) = old_principal {
                self.remove_from_principal_navigation(op, fk, obj);
            }
            match new {
                None => {
                    if old_principal.is_some() {
                        self.conditionally_null_foreign_key(id, fk, old_principal)?;
                    }
                }
                Some(n) => match self.resolve_target(n, fk.principal) {
                    Some(np) => {
                        let dep = self.set_foreign_key(id, fk, np, true)?;
                        self.to_dependent_fixup(np, fk, dep)?;
                    }
                    None => {
                        self.record_referrer(n, id, navigation);
                        if !deleted {
                            self.start_tracking(n, fk.principal, EntityState::Added, None, false)?;
                        }
                    }
                },
            }
        } else {
            if let Some(o) = old.filter(|o| Some(*o) != new) {
                if let Some(old_dep) = self.resolve_target(o, fk.dependent) {
                    self.orphan_dependent(old_dep, fk, id)?;
                }
            }
            if let Some(n) = new {
                self.principal_side_added(id, navigation, n)?;
            }
        }
        self.refresh_reference_snapshot(obj, navigation);
        Ok(())
    }

    /// Items were removed from and added to a collection navigation.
    pub(crate) fn navigation_collection_changed(
        &mut self,
        id: EntryId,
        navigation: NavigationIndex,
        added: &[ObjectId],
        removed: &[ObjectId],
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let Some(obj) = self.object_of(id) else {
            return Ok(());
        };
        let nav = &et.navigations[navigation];
        let fk = model.foreign_key(nav.foreign_key);
        trace!(
            entity_type = %et.name,
            navigation = %nav.name,
            added = added.len(),
            removed = removed.len(),
            "collection navigation changed"
        );

        for &r in removed {
            let Some(dep) = self.resolve_target(r, fk.dependent) else {
                continue;
            };
            if let Some(dn) = fk.dependent_to_principal {
                if self.graph.reference_at(r, dn) == Some(obj) {
                    self.write_reference(r, dn, None);
                }
            }
            self.conditionally_null_foreign_key(dep, fk, Some(id))?;
        }
        for &a in added {
            if !self.is_live(id) {
                break;
            }
            self.principal_side_added(id, navigation, a)?;
        }
        if self.is_live(id) {
            let touched: Vec<ObjectId> = added.iter().chain(removed).copied().collect();
            self.refresh_member_snapshots(obj, navigation, &touched);
        }
        Ok(())
    }

    /// `target` now appears in a principal-side navigation of `principal`.
    fn principal_side_added(
        &mut self,
        principal: EntryId,
        navigation: NavigationIndex,
        target: ObjectId,
    ) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(principal).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let Some(obj) = self.object_of(principal) else {
            return Ok(());
        };
        let fk = model.foreign_key(et.navigations[navigation].foreign_key);
        match self.resolve_target(target, fk.dependent) {
            Some(dep) => {
                self.detach_from_old_principal(dep, fk, principal);
                let dep = self.set_foreign_key(dep, fk, principal, true)?;
                self.set_dependent_navigation(dep, fk, Some(obj));
                self.revive_deleted(dep, fk);
            }
            None => {
                self.record_referrer(target, principal, navigation);
                if self.state_of(principal) != EntityState::Deleted {
                    self.start_tracking(
                        target,
                        fk.dependent,
                        EntityState::Added,
                        Some((principal, fk.id)),
                        false,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// A `Deleted` dependent that was given a principal again is `Modified`.
    fn revive_deleted(&mut self, dep: EntryId, fk: &ForeignKeyInfo) {
        let Some(entry) = self.entries.get(&dep) else {
            return;
        };
        if entry.state != EntityState::Deleted || entry.shared_identity.is_some() {
            return;
        }
        if fk.is_identifying(&self.model.entity_type(entry.entity_type).key) {
            return;
        }
        self.change_state(dep, EntityState::Modified);
        for &p in &fk.properties {
            self.mark_modified(dep, p);
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Warn about (or reject) an instance tracked under a second owned type.
    pub(crate) fn check_duplicate_dependent(&mut self, id: EntryId) -> Result<()> {
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        if !et.is_owned() {
            return Ok(());
        }
        let Some(obj) = self.object_of(id) else {
            return Ok(());
        };
        let other = self
            .entries_for(obj)
            .into_iter()
            .filter(|o| *o != id)
            .filter_map(|o| self.entity_type_of(o))
            .find(|t| *t != et.id && model.entity_type(*t).is_owned());
        let Some(other) = other else {
            return Ok(());
        };
        let other_name = &model.entity_type(other).name;
        match self.config.duplicate_dependent {
            WarningBehavior::Ignore => Ok(()),
            WarningBehavior::Log => {
                warn!(
                    entity_type = %et.name,
                    other_entity_type = %other_name,
                    object = %obj,
                    "instance is tracked as two owned entity types"
                );
                Ok(())
            }
            WarningBehavior::Throw => {
                self.stop_tracking(id, false)?;
                Err(Error::DuplicateDependent(DuplicateDependentError {
                    entity_type: et.name.clone(),
                    other_entity_type: other_name.clone(),
                }))
            }
        }
    }

    /// An untracked instance claims the key of `existing`. Apply the
    /// configured resolution policy and return the winning entry.
    pub(crate) fn resolve_duplicate(
        &mut self,
        existing: EntryId,
        incoming: ObjectId,
        entity_type: EntityTypeId,
    ) -> Result<EntryId> {
        let model = Arc::clone(&self.model);
        let et = model.entity_type(entity_type);
        let Some(policy) = self.config.identity_resolution else {
            let key = self.entries.get(&existing).and_then(|e| e.key.clone());
            return Err(Error::IdentityConflict(IdentityConflictError {
                entity_type: et.name.clone(),
                key: self.render_key(key.as_ref()),
            }));
        };
        let Some(winner_obj) = self.object_of(existing) else {
            return Ok(existing);
        };
        trace!(
            entity_type = %et.name,
            entry = %existing,
            incoming = %incoming,
            ?policy,
            "resolving duplicate identity"
        );

        let views: Vec<PropertyView> = et
            .properties
            .iter()
            .enumerate()
            .map(|(p, info)| PropertyView {
                is_key: info.is_key,
                modified: self.entries.get(&existing).is_some_and(|e| e.flags[p].modified),
                current: self.current_value(existing, p),
                incoming: match info.slot {
                    PropertySlot::Field(f) => Some(self.graph.field(incoming, f).clone()),
                    PropertySlot::Shadow(_) => None,
                },
            })
            .collect();
        let resolved = resolve_identity(policy, self.state_of(existing), &views);

        if let Some(original) = self.entries.get_mut(&existing).and_then(|e| e.original.as_mut()) {
            for (p, value) in &resolved.original {
                original[*p] = value.clone();
            }
        }
        for (p, value) in resolved.current {
            let old = self.current_value(existing, p);
            self.store_value(existing, p, value.clone(), false);
            self.property_changed(existing, p, old, &value)?;
        }
        for p in 0..et.properties.len() {
            self.note_value_change(existing, p);
        }
        self.resolved.insert((incoming, entity_type), existing);

        // Merge the incoming instance's navigations into the winner.
        let set_modified = self.state_of(existing) != EntityState::Unchanged;
        for (ni, nav) in et.navigations.iter().enumerate() {
            for target in self.graph.targets_at(incoming, ni) {
                if target == winner_obj {
                    continue;
                }
                let merge = if nav.is_collection {
                    !self.graph.collection_contains_at(winner_obj, ni, target)
                } else {
                    self.graph.reference_at(winner_obj, ni).is_none()
                };
                if !merge {
                    continue;
                }
                if nav.is_collection {
                    self.collection_add(winner_obj, ni, target);
                } else {
                    self.write_reference(winner_obj, ni, Some(target));
                }
                match self.resolve_target(target, nav.target) {
                    Some(t) => self.link_via_navigation(existing, ni, t, set_modified)?,
                    None => self.record_referrer(target, existing, ni),
                }
            }
        }

        // Rewire tracked navigations that point at the incoming instance.
        let waiting: Vec<_> = self
            .referrers
            .get(&incoming)
            .map(|list| {
                list.iter()
                    .copied()
                    .filter(|r| {
                        self.entity_type_of(r.entry).is_some_and(|t| {
                            model.entity_type(t).navigations[r.navigation].target == entity_type
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        if let Some(list) = self.referrers.get_mut(&incoming) {
            list.retain(|r| !waiting.contains(r));
        }
        for r in waiting {
            let Some(source_obj) = self.object_of(r.entry) else {
                continue;
            };
            let collection = self
                .graph
                .class_info(source_obj)
                .map(|c| c.navigations[r.navigation].is_collection)?;
            if collection {
                while self.graph.collection_remove_at(source_obj, r.navigation, incoming) {}
                if !self.graph.collection_contains_at(source_obj, r.navigation, winner_obj) {
                    self.graph.collection_add_at(source_obj, r.navigation, winner_obj);
                }
                self.refresh_member_snapshots(source_obj, r.navigation, &[incoming, winner_obj]);
            } else {
                if self.graph.reference_at(source_obj, r.navigation) == Some(incoming) {
                    self.graph.set_reference_at(source_obj, r.navigation, Some(winner_obj));
                }
                self.refresh_reference_snapshot(source_obj, r.navigation);
            }
            self.link_via_navigation(r.entry, r.navigation, existing, set_modified)?;
        }
        Ok(existing)
    }
}
