//! Cascade delete, orphan handling and change acceptance.
//!
//! Deleting a principal flags its required dependents' FKs conceptually null
//! and deletes them when the relationship cascades. With
//! [`CascadeTiming::OnSaveChanges`] nothing happens until
//! [`StateManager::cascade_changes`] runs.

use std::sync::Arc;

use relmodel_core::{ConceptualNullError, Error, Result, Value};
use tracing::{debug, trace};

use crate::CascadeTiming;
use crate::entry::{EntityState, EntryId, InternalEntry};
use crate::state_manager::StateManager;

impl StateManager {
    /// Apply the delete of `principal` to its dependents.
    ///
    /// `force` is set by [`StateManager::cascade_changes`]: it ignores the
    /// configured timing, nulls optional `SetNull` dependents and reports
    /// required dependents that cannot cascade.
    pub(crate) fn cascade_delete(&mut self, principal: EntryId, force: bool) -> Result<()> {
        if !force && self.config.cascade_delete_timing != CascadeTiming::Immediate {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let Some(et) = self.entity_type_info(principal).map(|e| e.id) else {
            return Ok(());
        };
        for &fk_id in &model.entity_type(et).referencing_keys {
            let fk = model.foreign_key(fk_id);
            for dep in self.find_dependents(principal, fk) {
                if dep == principal {
                    continue;
                }
                let state = self.state_of(dep);
                if matches!(state, EntityState::Deleted | EntityState::Detached) {
                    continue;
                }
                let dep_type = model.entity_type(fk.dependent);
                if fk.required || fk.ownership {
                    if let Some(entry) = self.entries.get_mut(&dep) {
                        for &p in &fk.properties {
                            if !dep_type.properties[p].is_key {
                                entry.flags[p].conceptual_null = true;
                            }
                        }
                    }
                    if fk.cascades_delete() {
                        let to = if state == EntityState::Added {
                            EntityState::Detached
                        } else {
                            EntityState::Deleted
                        };
                        debug!(
                            entity_type = %dep_type.name,
                            entry = %dep,
                            principal = %principal,
                            ?to,
                            "cascade delete"
                        );
                        self.set_entity_state(dep, to)?;
                        if force && to == EntityState::Deleted {
                            self.cascade_delete(dep, true)?;
                        }
                    } else if force {
                        return Err(self.conceptual_null_error(dep, fk.principal));
                    } else {
                        for &p in &fk.properties {
                            self.mark_modified(dep, p);
                        }
                    }
                } else if force && fk.delete_behavior.sets_null() {
                    trace!(
                        entity_type = %dep_type.name,
                        entry = %dep,
                        "cascade: nulling optional foreign key"
                    );
                    self.orphan_dependent(dep, fk, principal)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve the conceptually null FKs of an entry: delete it when every
    /// severed relationship cascades, otherwise leave it flagged (or fail,
    /// when forced).
    pub(crate) fn handle_conceptual_nulls(&mut self, id: EntryId, force: bool) -> Result<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Ok(());
        };
        if !entry.has_conceptual_null() || entry.state == EntityState::Deleted {
            return Ok(());
        }
        if !force
            && (self.deferring_orphans
                || self.config.delete_orphans_timing != CascadeTiming::Immediate)
        {
            return Ok(());
        }
        let model = Arc::clone(&self.model);
        let et = model.entity_type(entry.entity_type);
        let severed: Vec<_> = et
            .foreign_keys
            .iter()
            .map(|fk| model.foreign_key(*fk))
            .filter(|fk| fk.properties.iter().any(|p| entry.flags[*p].conceptual_null))
            .collect();
        let state = entry.state;
        if !severed.is_empty() && severed.iter().all(|fk| fk.cascades_delete()) {
            let to = if state == EntityState::Added {
                EntityState::Detached
            } else {
                EntityState::Deleted
            };
            debug!(entity_type = %et.name, entry = %id, ?to, "deleting orphan");
            return self.set_entity_state(id, to);
        }
        if force {
            let principal = severed.first().map_or(et.id, |fk| fk.principal);
            return Err(self.conceptual_null_error(id, principal));
        }
        Ok(())
    }

    fn conceptual_null_error(&self, dep: EntryId, principal: relmodel_core::EntityTypeId) -> Error {
        let key = self.entries.get(&dep).and_then(|e| e.key.clone());
        Error::ConceptualNull(ConceptualNullError {
            entity_type: self
                .entity_type_info(dep)
                .map(|e| e.name.clone())
                .unwrap_or_default(),
            principal_type: self.type_name(principal).to_string(),
            key: self.render_key(key.as_ref()),
        })
    }

    /// Run every deferred cascade: deleted principals first, then
    /// conceptually null FKs, then owned entries whose owner is gone.
    pub(crate) fn cascade_changes(&mut self) -> Result<()> {
        let deleted: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state == EntityState::Deleted)
            .map(|e| e.id)
            .collect();
        for id in deleted {
            self.cascade_delete(id, true)?;
        }

        let flagged: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state != EntityState::Deleted && e.has_conceptual_null())
            .map(|e| e.id)
            .collect();
        for id in flagged {
            self.handle_conceptual_nulls(id, true)?;
        }

        let model = Arc::clone(&self.model);
        let orphaned: Vec<EntryId> = self
            .entries
            .values()
            .filter_map(|e| {
                let fk = model.entity_type(e.entity_type).ownership?;
                self.find_principal(e.id, model.foreign_key(fk))
                    .is_none()
                    .then_some(e.id)
            })
            .collect();
        for id in orphaned {
            debug!(entry = %id, "detaching owned entry without owner");
            self.stop_tracking(id, true)?;
        }
        Ok(())
    }

    /// Make every pending change the new baseline.
    pub(crate) fn accept_all_changes(&mut self) -> Result<()> {
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            match self.state_of(id) {
                EntityState::Deleted => self.stop_tracking(id, false)?,
                EntityState::Added | EntityState::Modified => {
                    self.make_temporary_values_permanent(id);
                    if let Some(entry) = self.entries.get_mut(&id) {
                        for flags in &mut entry.flags {
                            *flags = crate::entry::PropertyFlags::default();
                        }
                        entry.shared_identity = None;
                    }
                    self.set_original_values(id);
                    self.change_state(id, EntityState::Unchanged);
                }
                _ => {
                    if let Some(entry) = self.entries.get_mut(&id) {
                        entry.shared_identity = None;
                    }
                }
            }
        }
        let ids: Vec<EntryId> = self.entries.keys().copied().collect();
        for id in ids {
            self.take_snapshots(id);
            self.rekey(id)?;
        }
        debug!(entries = self.entries.len(), "changes accepted");
        Ok(())
    }

    /// Write temporary field overlays into the instance.
    fn make_temporary_values_permanent(&mut self, id: EntryId) {
        let model = Arc::clone(&self.model);
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let et = model.entity_type(entry.entity_type);
        let obj = entry.object;
        let mut writes: Vec<(usize, Value)> = Vec::new();
        for (p, f) in et.field_properties() {
            if let Some(value) = entry.temporary[p].take() {
                writes.push((f, value));
            }
        }
        for (f, value) in writes {
            self.graph.set_field(obj, f, value);
        }
    }

    /// A `Deleted` dependent left tracking: take it out of its principals'
    /// navigations.
    pub(crate) fn delete_fixup(&mut self, entry: &InternalEntry) {
        let model = Arc::clone(&self.model);
        let et = model.entity_type(entry.entity_type);
        for &fk_id in &et.foreign_keys {
            let fk = model.foreign_key(fk_id);
            let values: Vec<Value> = fk
                .properties
                .iter()
                .map(|&p| entry.current_value(et, &self.graph, p))
                .collect();
            let mut principals = Vec::with_capacity(2);
            if let Some(p) = self.find_principal_by_values(fk, &values) {
                principals.push(p);
            }
            if let Some(dn) = fk.dependent_to_principal {
                if let Some(p) = self
                    .graph
                    .reference_at(entry.object, dn)
                    .and_then(|t| self.resolve_target(t, fk.principal))
                {
                    principals.push(p);
                }
            }
            for p in principals {
                self.remove_from_principal_navigation(p, fk, entry.object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use relmodel_core::{
        DeleteBehavior, EntityDef, ModelBuilder, PropertyDef, RelationshipDef, Value,
    };

    use crate::entry::EntityState;
    use crate::graph::Graph;
    use crate::state_manager::StateManager;
    use crate::{CascadeTiming, TrackerConfig};

    fn manager(behavior: DeleteBehavior, config: TrackerConfig) -> StateManager {
        let model = ModelBuilder::new()
            .entity(EntityDef::new("Blog").property(PropertyDef::new("Id")).key(&["Id"]))
            .entity(
                EntityDef::new("Post")
                    .property(PropertyDef::new("Id"))
                    .property(PropertyDef::new("BlogId"))
                    .key(&["Id"]),
            )
            .relationship(
                RelationshipDef::one_to_many("Blog", "Post")
                    .principal_navigation("Posts")
                    .dependent_navigation("Blog")
                    .foreign_key(&["BlogId"])
                    .on_delete(behavior),
            )
            .build()
            .unwrap();
        StateManager::new(Graph::new(Arc::new(model)), config)
    }

    fn track_pair(sm: &mut StateManager) -> (crate::EntryId, crate::EntryId) {
        let blog_type = sm.model.find_entity_type("Blog").unwrap();
        let post_type = sm.model.find_entity_type("Post").unwrap();
        let blog = sm.graph.create("Blog").unwrap();
        let post = sm.graph.create("Post").unwrap();
        sm.graph.set(blog, "Id", 1).unwrap();
        sm.graph.set(post, "Id", 10).unwrap();
        sm.graph.set(post, "BlogId", 1).unwrap();
        let b = sm
            .start_tracking(blog, blog_type, EntityState::Unchanged, None, false)
            .unwrap()
            .unwrap();
        let p = sm
            .start_tracking(post, post_type, EntityState::Unchanged, None, false)
            .unwrap()
            .unwrap();
        (b, p)
    }

    #[test]
    fn test_immediate_cascade_deletes_required_dependent() {
        let mut sm = manager(DeleteBehavior::Cascade, TrackerConfig::default());
        let (blog, post) = track_pair(&mut sm);
        sm.set_entity_state(blog, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(post), EntityState::Deleted);
        assert!(sm.entries[&post].flags[1].conceptual_null);
    }

    #[test]
    fn test_restrict_leaves_dependent_flagged() {
        let mut sm = manager(DeleteBehavior::Restrict, TrackerConfig::default());
        let (blog, post) = track_pair(&mut sm);
        sm.set_entity_state(blog, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(post), EntityState::Modified);
        assert!(sm.entries[&post].has_conceptual_null());
        let err = sm.cascade_changes().unwrap_err();
        assert!(matches!(err, relmodel_core::Error::ConceptualNull(_)));
    }

    #[test]
    fn test_deferred_cascade_waits_for_cascade_changes() {
        let config = TrackerConfig::default().cascade_delete_timing(CascadeTiming::OnSaveChanges);
        let mut sm = manager(DeleteBehavior::Cascade, config);
        let (blog, post) = track_pair(&mut sm);
        sm.set_entity_state(blog, EntityState::Deleted).unwrap();
        assert_eq!(sm.state_of(post), EntityState::Unchanged);
        sm.cascade_changes().unwrap();
        assert_eq!(sm.state_of(post), EntityState::Deleted);
    }

    #[test]
    fn test_accept_detaches_deleted_and_removes_from_navigation() {
        let mut sm = manager(DeleteBehavior::Cascade, TrackerConfig::default());
        let (blog, post) = track_pair(&mut sm);
        let blog_obj = sm.object_of(blog).unwrap();
        let post_obj = sm.object_of(post).unwrap();
        assert_eq!(sm.graph.collection(blog_obj, "Posts").unwrap(), Some(vec![post_obj]));

        sm.set_entity_state(post, EntityState::Deleted).unwrap();
        sm.accept_all_changes().unwrap();
        assert_eq!(sm.state_of(post), EntityState::Detached);
        assert_eq!(sm.graph.collection(blog_obj, "Posts").unwrap(), Some(vec![]));
        assert_eq!(sm.graph.get(post_obj, "BlogId").unwrap(), &Value::Int(1));
    }
}
