//! Identity map: at most one winning entry per (entity type, key).
//!
//! Keys compare with [`Value::same_as`], so `Int(1)` and `BigInt(1)` are the
//! same identity. A `Deleted` entry and an `Added` entry may share a key;
//! the map then points at the `Added` one and the two entries are linked
//! through their shared-identity handle.
//!
//! When a second instance claims a key that is already taken, the configured
//! [`IdentityResolution`] decides what happens. The policy is applied by the
//! pure [`resolve_identity`] function; the state manager applies its result.

use std::collections::HashMap;

use relmodel_core::{EntityKey, EntityTypeId, PropertyIndex, Value};
use serde::{Deserialize, Serialize};

use crate::entry::{EntityState, EntryId};

/// Maps (entity type, key) to the winning entry.
#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    entries: HashMap<(EntityTypeId, EntityKey), EntryId>,
}

impl IdentityMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn resolve(&self, entity_type: EntityTypeId, key: &EntityKey) -> Option<EntryId> {
        self.entries.get(&(entity_type, key.clone())).copied()
    }

    /// Point the key at `entry`, returning the entry previously registered.
    pub(crate) fn insert(
        &mut self,
        entity_type: EntityTypeId,
        key: EntityKey,
        entry: EntryId,
    ) -> Option<EntryId> {
        self.entries.insert((entity_type, key), entry)
    }

    /// Remove the key if, and only if, it points at `entry`.
    pub(crate) fn remove(
        &mut self,
        entity_type: EntityTypeId,
        key: &EntityKey,
        entry: EntryId,
    ) -> bool {
        let k = (entity_type, key.clone());
        if self.entries.get(&k) == Some(&entry) {
            self.entries.remove(&k);
            true
        } else {
            false
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// How to resolve a second instance with an already-tracked identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityResolution {
    /// Keep the tracked instance; the incoming instance's values are dropped.
    Ignoring,
    /// Copy the incoming instance's values onto the tracked instance.
    Updating {
        /// Leave properties that are already modified alone.
        preserve_modified: bool,
        /// Also overwrite original values with the incoming values.
        update_original: bool,
    },
}

/// One property of the tracked entry, with the incoming instance's value
/// (`None` when the incoming instance has no value for it, e.g. a shadow
/// property).
#[derive(Debug, Clone)]
pub struct PropertyView {
    pub is_key: bool,
    pub modified: bool,
    pub current: Value,
    pub incoming: Option<Value>,
}

/// Values to write on the tracked entry, by property index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedValues {
    pub current: Vec<(PropertyIndex, Value)>,
    pub original: Vec<(PropertyIndex, Value)>,
}

impl ResolvedValues {
    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.original.is_empty()
    }
}

/// Decide which values the winning entry takes from the incoming instance.
///
/// Keys never change. An `Added` existing entry takes every incoming value,
/// whatever the policy flags say, since it has nothing to preserve.
pub fn resolve_identity(
    policy: IdentityResolution,
    existing: EntityState,
    properties: &[PropertyView],
) -> ResolvedValues {
    let mut out = ResolvedValues::default();
    let IdentityResolution::Updating {
        preserve_modified,
        update_original,
    } = policy
    else {
        return out;
    };

    for (i, view) in properties.iter().enumerate() {
        if view.is_key {
            continue;
        }
        let Some(incoming) = &view.incoming else {
            continue;
        };
        if existing == EntityState::Added {
            if !incoming.same_as(&view.current) {
                out.current.push((i, incoming.clone()));
            }
            continue;
        }
        let keep = preserve_modified && view.modified;
        if !keep && !incoming.same_as(&view.current) {
            out.current.push((i, incoming.clone()));
        }
        if update_original {
            out.original.push((i, incoming.clone()));
        }
    }
    out
}
