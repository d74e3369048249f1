//! Flush planning.
//!
//! Turns pending entries into the writes a persistence layer would issue:
//! - DELETE dependent-first (to respect FK constraints)
//! - INSERT principal-first (to respect FK constraints)
//! - UPDATE in any order, with only the modified columns
//!
//! The plan is computed, never executed.

use std::collections::HashMap;
use std::sync::Arc;

use relmodel_core::{Model, PropertyIndex, Value};
use serde::Serialize;

use crate::entry::{EntityState, EntryId};
use crate::state_manager::StateManager;

/// A pending write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PendingOp {
    /// Insert a new row.
    Insert {
        entry: EntryId,
        entity_type: String,
        /// Columns with a value; store-generated keys holding a temporary
        /// value are left out.
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Update an existing row.
    Update {
        entry: EntryId,
        entity_type: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
        /// Modified columns only.
        set_columns: Vec<String>,
        set_values: Vec<Value>,
    },
    /// Delete an existing row.
    Delete {
        entry: EntryId,
        entity_type: String,
        key_columns: Vec<String>,
        key_values: Vec<Value>,
    },
}

impl PendingOp {
    /// Entity type the write targets.
    pub fn entity_type(&self) -> &str {
        match self {
            PendingOp::Insert { entity_type, .. }
            | PendingOp::Update { entity_type, .. }
            | PendingOp::Delete { entity_type, .. } => entity_type,
        }
    }

    pub fn entry(&self) -> EntryId {
        match self {
            PendingOp::Insert { entry, .. }
            | PendingOp::Update { entry, .. }
            | PendingOp::Delete { entry, .. } => *entry,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, PendingOp::Insert { .. })
    }

    pub fn is_update(&self) -> bool {
        matches!(self, PendingOp::Update { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, PendingOp::Delete { .. })
    }
}

/// Orders writes by the FK dependency depth of their entity types.
///
/// - Principals must be inserted before dependents
/// - Dependents must be deleted before principals
#[derive(Debug, Default)]
pub struct FlushOrderer {
    /// Entity type name -> depth below its root principals.
    depths: HashMap<String, usize>,
}

impl FlushOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every entity type of a model.
    pub fn from_model(model: &Model) -> Self {
        let mut orderer = Self::new();
        for (et, depth) in model.entity_types().iter().zip(model.dependency_depths()) {
            orderer.register_type(et.name.clone(), depth);
        }
        orderer
    }

    /// Register an entity type's depth directly.
    pub fn register_type(&mut self, entity_type: impl Into<String>, depth: usize) {
        self.depths.insert(entity_type.into(), depth);
    }

    fn depth(&self, entity_type: &str) -> usize {
        self.depths.get(entity_type).copied().unwrap_or(0)
    }

    /// Order operations into a flush plan. Sorting is stable, so writes of the
    /// same depth keep their input order.
    pub fn order(&self, ops: Vec<PendingOp>) -> FlushPlan {
        let mut deletes = Vec::new();
        let mut inserts = Vec::new();
        let mut updates = Vec::new();

        for op in ops {
            match op {
                PendingOp::Delete { .. } => deletes.push(op),
                PendingOp::Insert { .. } => inserts.push(op),
                PendingOp::Update { .. } => updates.push(op),
            }
        }

        deletes.sort_by_key(|op| std::cmp::Reverse(self.depth(op.entity_type())));
        inserts.sort_by_key(|op| self.depth(op.entity_type()));

        FlushPlan {
            deletes,
            inserts,
            updates,
        }
    }
}

/// Writes in execution order.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct FlushPlan {
    /// Ordered dependent-first.
    pub deletes: Vec<PendingOp>,
    /// Ordered principal-first.
    pub inserts: Vec<PendingOp>,
    /// Any order.
    pub updates: Vec<PendingOp>,
}

impl FlushPlan {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.deletes.is_empty() && self.inserts.is_empty() && self.updates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.deletes.len() + self.inserts.len() + self.updates.len()
    }

    /// Every operation: deletes, then inserts, then updates.
    pub fn iter(&self) -> impl Iterator<Item = &PendingOp> {
        self.deletes
            .iter()
            .chain(&self.inserts)
            .chain(&self.updates)
    }

    /// Group consecutive operations on the same entity type.
    pub fn batch_by_type(ops: &[PendingOp]) -> Vec<Vec<&PendingOp>> {
        let mut batches: Vec<Vec<&PendingOp>> = Vec::new();
        for op in ops {
            match batches.last_mut() {
                Some(batch) if batch[0].entity_type() == op.entity_type() => batch.push(op),
                _ => batches.push(vec![op]),
            }
        }
        batches
    }
}

impl StateManager {
    /// Writes for every pending entry, unordered.
    ///
    /// A `Deleted` entry whose identity was taken over by an `Added` entry is
    /// written as a single update of the row's non-key columns.
    pub(crate) fn pending_ops(&self) -> Vec<PendingOp> {
        let model = Arc::clone(&self.model);
        let mut ops = Vec::new();
        for entry in self.entries.values() {
            let et = model.entity_type(entry.entity_type);
            let partner = entry.shared_identity.and_then(|p| self.entries.get(&p));
            let names = |props: &[PropertyIndex]| -> Vec<String> {
                props.iter().map(|&p| et.properties[p].name.clone()).collect()
            };
            let non_key: Vec<PropertyIndex> = (0..et.properties.len())
                .filter(|&p| !et.properties[p].is_key)
                .collect();

            match entry.state {
                EntityState::Deleted if partner.is_some_and(|p| p.state == EntityState::Added) => {}
                EntityState::Added if partner.is_some_and(|p| p.state == EntityState::Deleted) => {
                    if non_key.is_empty() {
                        continue;
                    }
                    ops.push(PendingOp::Update {
                        entry: entry.id,
                        entity_type: et.name.clone(),
                        key_columns: names(&et.key),
                        key_values: self.current_values(entry.id, &et.key),
                        set_columns: names(&non_key),
                        set_values: self.current_values(entry.id, &non_key),
                    });
                }
                EntityState::Added => {
                    let columns: Vec<PropertyIndex> = (0..et.properties.len())
                        .filter(|&p| !(et.properties[p].is_key && self.is_temporary(entry.id, p)))
                        .collect();
                    ops.push(PendingOp::Insert {
                        entry: entry.id,
                        entity_type: et.name.clone(),
                        columns: names(&columns),
                        values: self.current_values(entry.id, &columns),
                    });
                }
                EntityState::Modified => {
                    let set: Vec<PropertyIndex> = non_key
                        .into_iter()
                        .filter(|&p| entry.flags[p].modified)
                        .collect();
                    if set.is_empty() {
                        continue;
                    }
                    ops.push(PendingOp::Update {
                        entry: entry.id,
                        entity_type: et.name.clone(),
                        key_columns: names(&et.key),
                        key_values: self.current_values(entry.id, &et.key),
                        set_columns: names(&set),
                        set_values: self.current_values(entry.id, &set),
                    });
                }
                EntityState::Deleted => ops.push(PendingOp::Delete {
                    entry: entry.id,
                    entity_type: et.name.clone(),
                    key_columns: names(&et.key),
                    key_values: self.current_values(entry.id, &et.key),
                }),
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        ops
    }
}
