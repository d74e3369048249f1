//! Snapshot change detection.
//!
//! Raw writes to the [`Graph`](crate::Graph) do not notify the tracker. The
//! sweep compares every live entry against its snapshot, sorts the deltas by
//! the arena's write stamp and replays each one through the same handlers
//! the notifying setters use. Replaying in write order makes the latest
//! effective write win, whatever order the entries are visited in.
//!
//! Before a delta is replayed the raw slot is restored to the value captured
//! when the sweep started, since earlier replays may have overwritten it.
//! Deltas that earlier replays already absorbed are skipped.

use std::collections::BTreeSet;

use relmodel_core::{NavigationIndex, PropertyIndex, Result, Value};
use tracing::{debug, instrument};

use crate::entry::{EntityState, EntryId, NavigationSnapshot};
use crate::graph::ObjectId;
use crate::state_manager::StateManager;

#[derive(Debug)]
enum Delta {
    Property {
        entry: EntryId,
        property: PropertyIndex,
        field: usize,
        captured: Value,
        stamp: u64,
    },
    Reference {
        entry: EntryId,
        navigation: NavigationIndex,
        captured: Option<ObjectId>,
        stamp: u64,
    },
    Collection {
        entry: EntryId,
        navigation: NavigationIndex,
        added: Vec<ObjectId>,
        removed: Vec<ObjectId>,
        stamp: u64,
    },
}

impl Delta {
    fn stamp(&self) -> u64 {
        match self {
            Delta::Property { stamp, .. }
            | Delta::Reference { stamp, .. }
            | Delta::Collection { stamp, .. } => *stamp,
        }
    }
}

impl StateManager {
    /// Find and process every change made through raw arena writes.
    #[instrument(level = "trace", skip(self))]
    pub(crate) fn detect_changes(&mut self) -> Result<()> {
        let deltas = self.collect_deltas();
        if !deltas.is_empty() {
            debug!(deltas = deltas.len(), "replaying detected changes");
            self.deferring_orphans = true;
            let replayed = self.replay(deltas);
            self.deferring_orphans = false;
            replayed?;
        }

        let orphans: Vec<EntryId> = self
            .entries
            .values()
            .filter(|e| e.state != EntityState::Deleted && e.has_conceptual_null())
            .map(|e| e.id)
            .collect();
        for id in orphans {
            self.handle_conceptual_nulls(id, false)?;
        }
        Ok(())
    }

    fn collect_deltas(&self) -> Vec<Delta> {
        let mut deltas = Vec::new();
        for entry in self.entries.values() {
            if entry.state == EntityState::Deleted {
                continue;
            }
            let et = self.model.entity_type(entry.entity_type);
            let obj = entry.object;
            for (p, f) in et.field_properties() {
                let current = entry.current_value(et, &self.graph, p);
                if !current.same_as(&entry.property_snapshot[p]) {
                    deltas.push(Delta::Property {
                        entry: entry.id,
                        property: p,
                        field: f,
                        captured: self.graph.field(obj, f).clone(),
                        stamp: self.graph.field_stamp(obj, f),
                    });
                }
            }
            for (ni, nav) in et.navigations.iter().enumerate() {
                let current = NavigationSnapshot::capture(&self.graph, obj, ni, nav.is_collection);
                let Some(snapshot) = entry.navigation_snapshot.get(ni) else {
                    continue;
                };
                if &current == snapshot {
                    continue;
                }
                let stamp = self.graph.navigation_stamp(obj, ni);
                match (current, snapshot) {
                    (
                        NavigationSnapshot::Collection(now),
                        NavigationSnapshot::Collection(before),
                    ) => {
                        deltas.push(Delta::Collection {
                            entry: entry.id,
                            navigation: ni,
                            added: now.difference(before).copied().collect(),
                            removed: before.difference(&now).copied().collect(),
                            stamp,
                        });
                    }
                    (NavigationSnapshot::Reference(now), _) => deltas.push(Delta::Reference {
                        entry: entry.id,
                        navigation: ni,
                        captured: now,
                        stamp,
                    }),
                    (NavigationSnapshot::Collection(_), NavigationSnapshot::Reference(_)) => {}
                }
            }
        }
        deltas.sort_by_key(Delta::stamp);
        deltas
    }

    fn replay(&mut self, deltas: Vec<Delta>) -> Result<()> {
        for delta in deltas {
            match delta {
                Delta::Property {
                    entry,
                    property,
                    field,
                    captured,
                    ..
                } => {
                    let Some(obj) = self.replayable(entry) else {
                        continue;
                    };
                    self.graph.set_field(obj, field, captured);
                    let Some(old) = self
                        .entries
                        .get(&entry)
                        .map(|e| e.property_snapshot[property].clone())
                    else {
                        continue;
                    };
                    let new = self.current_value(entry, property);
                    if old.same_as(&new) {
                        continue;
                    }
                    self.property_changed(entry, property, old, &new)?;
                }
                Delta::Reference {
                    entry,
                    navigation,
                    captured,
                    ..
                } => {
                    let Some(obj) = self.replayable(entry) else {
                        continue;
                    };
                    self.graph.set_reference_at(obj, navigation, captured);
                    let old = match self
                        .entries
                        .get(&entry)
                        .map(|e| &e.navigation_snapshot[navigation])
                    {
                        Some(NavigationSnapshot::Reference(old)) => *old,
                        _ => continue,
                    };
                    if old == captured {
                        continue;
                    }
                    self.navigation_reference_changed(entry, navigation, old, captured)?;
                }
                Delta::Collection {
                    entry,
                    navigation,
                    added,
                    removed,
                    ..
                } => {
                    let Some(obj) = self.replayable(entry) else {
                        continue;
                    };
                    for &item in &added {
                        if !self.graph.collection_contains_at(obj, navigation, item) {
                            self.graph.collection_add_at(obj, navigation, item);
                        }
                    }
                    for &item in &removed {
                        while self.graph.collection_remove_at(obj, navigation, item) {}
                    }
                    let before: BTreeSet<ObjectId> = match self
                        .entries
                        .get(&entry)
                        .map(|e| &e.navigation_snapshot[navigation])
                    {
                        Some(NavigationSnapshot::Collection(items)) => items.clone(),
                        _ => continue,
                    };
                    let added: Vec<ObjectId> =
                        added.into_iter().filter(|i| !before.contains(i)).collect();
                    let removed: Vec<ObjectId> =
                        removed.into_iter().filter(|i| before.contains(i)).collect();
                    if added.is_empty() && removed.is_empty() {
                        continue;
                    }
                    self.navigation_collection_changed(entry, navigation, &added, &removed)?;
                }
            }
        }
        Ok(())
    }

    /// The object of an entry whose deltas should still be replayed.
    fn replayable(&self, entry: EntryId) -> Option<ObjectId> {
        self.entries
            .get(&entry)
            .filter(|e| e.state != EntityState::Deleted)
            .map(|e| e.object)
    }
}
