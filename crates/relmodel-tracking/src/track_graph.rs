//! Graph traversal.
//!
//! Walks every instance reachable from a root through navigations and lets a
//! callback pick the state of each instance that is not tracked yet. Entries
//! created during the walk are descended into; entries that were tracked
//! before the walk started stop it, except the root.

use std::collections::HashSet;
use std::sync::Arc;

use relmodel_core::{EntityTypeId, NavigationIndex, Result};
use serde::Serialize;
use tracing::trace;

use crate::entry::{EntityState, EntryId};
use crate::graph::ObjectId;
use crate::state_manager::StateManager;

/// An instance reached by [`Session::track_graph`](crate::Session::track_graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    pub object: ObjectId,
    pub entity_type: EntityTypeId,
    /// Name of the entity type the instance will be tracked as.
    pub entity_type_name: String,
    /// Tracked entry whose navigation led here.
    pub source: Option<EntryId>,
    /// Name of the navigation that led here; `None` for the root.
    pub navigation: Option<String>,
    /// Whether every value-generated key property already has a value.
    pub key_set: bool,
}

impl GraphNode {
    pub fn is_root(&self) -> bool {
        self.navigation.is_none()
    }
}

#[derive(Debug, Clone, Copy)]
struct Via {
    entry: Option<EntryId>,
    entity_type: EntityTypeId,
    navigation: NavigationIndex,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    object: ObjectId,
    entity_type: EntityTypeId,
    via: Option<Via>,
}

impl Frame {
    fn root(object: ObjectId, entity_type: EntityTypeId) -> Self {
        Self {
            object,
            entity_type,
            via: None,
        }
    }
}

impl StateManager {
    /// Track everything reachable from `root` that the callback accepts.
    ///
    /// With `force_root` the root's state is set from the callback even when
    /// the root is already tracked. Returns the root's entry, if any.
    pub(crate) fn track_graph<F>(
        &mut self,
        root: ObjectId,
        entity_type: EntityTypeId,
        force_root: bool,
        mut callback: F,
    ) -> Result<Option<EntryId>>
    where
        F: FnMut(&GraphNode) -> Option<EntityState>,
    {
        let model = Arc::clone(&self.model);
        let watermark = self.watermark();
        let mut visited = HashSet::new();
        let mut stack = vec![Frame::root(root, entity_type)];
        let mut root_entry = None;

        while let Some(frame) = stack.pop() {
            if !visited.insert((frame.object, frame.entity_type)) {
                continue;
            }
            let is_root = frame.via.is_none();
            let forced = is_root && force_root;
            // a node resolved onto an earlier entry still walks its own navigations
            let mut walk_incoming = false;
            let id = match self.resolve_target(frame.object, frame.entity_type) {
                Some(existing) if forced => {
                    let Some(state) = callback(&self.node(&frame)) else {
                        continue;
                    };
                    self.set_entity_state(existing, state)?;
                    if !self.is_live(existing) {
                        continue;
                    }
                    existing
                }
                Some(existing) => existing,
                None => {
                    let Some(state) = callback(&self.node(&frame)) else {
                        trace!(object = %frame.object, "traversal skipped node");
                        continue;
                    };
                    let hint = frame.via.and_then(|via| {
                        let nav = &model.entity_type(via.entity_type).navigations[via.navigation];
                        via.entry
                            .filter(|_| !nav.on_dependent)
                            .map(|entry| (entry, nav.foreign_key))
                    });
                    let started =
                        self.start_tracking(frame.object, frame.entity_type, state, hint, false)?;
                    match started {
                        Some(id) => {
                            walk_incoming = id.0 < watermark;
                            id
                        }
                        None => continue,
                    }
                }
            };
            if is_root {
                root_entry = Some(id);
            }
            // entries tracked before the walk end it
            if id.0 < watermark && !forced && !walk_incoming {
                continue;
            }

            let obj = if walk_incoming {
                frame.object
            } else {
                let Some(obj) = self.object_of(id) else {
                    continue;
                };
                obj
            };
            let Some(et) = self.entity_type_of(id).map(|t| model.entity_type(t)) else {
                continue;
            };
            for (ni, nav) in et.navigations.iter().enumerate().rev() {
                for target in self.graph.targets_at(obj, ni).into_iter().rev() {
                    stack.push(Frame {
                        object: target,
                        entity_type: nav.target,
                        via: Some(Via {
                            entry: Some(id),
                            entity_type: et.id,
                            navigation: ni,
                        }),
                    });
                }
            }
        }
        Ok(root_entry)
    }

    /// Untracked instances a traversal from `root` would offer to its
    /// callback, in visiting order. The root is included even when tracked.
    pub(crate) fn untracked_nodes(
        &self,
        root: ObjectId,
        entity_type: EntityTypeId,
    ) -> Vec<GraphNode> {
        let mut visited = HashSet::new();
        let mut stack = vec![Frame::root(root, entity_type)];
        let mut nodes = Vec::new();
        while let Some(frame) = stack.pop() {
            if !visited.insert((frame.object, frame.entity_type)) {
                continue;
            }
            let tracked = self.resolve_target(frame.object, frame.entity_type);
            if frame.via.is_some() && tracked.is_some() {
                continue;
            }
            nodes.push(self.node(&frame));
            let et = self.model.entity_type(frame.entity_type);
            for (ni, nav) in et.navigations.iter().enumerate().rev() {
                for target in self.graph.targets_at(frame.object, ni).into_iter().rev() {
                    stack.push(Frame {
                        object: target,
                        entity_type: nav.target,
                        via: Some(Via {
                            entry: tracked,
                            entity_type: et.id,
                            navigation: ni,
                        }),
                    });
                }
            }
        }
        nodes
    }

    fn node(&self, frame: &Frame) -> GraphNode {
        let et = self.model.entity_type(frame.entity_type);
        GraphNode {
            object: frame.object,
            entity_type: frame.entity_type,
            entity_type_name: et.name.clone(),
            source: frame.via.and_then(|via| via.entry),
            navigation: frame.via.map(|via| {
                self.model.entity_type(via.entity_type).navigations[via.navigation]
                    .name
                    .clone()
            }),
            key_set: !self.generated_key_unset(frame.object, frame.entity_type),
        }
    }
}

/// State picked by `add` for a new node.
pub(crate) fn added(_: &GraphNode) -> Option<EntityState> {
    Some(EntityState::Added)
}

/// State picked by `attach`: `Unchanged` unless the generated key is unset.
pub(crate) fn attached(node: &GraphNode) -> Option<EntityState> {
    Some(if node.key_set {
        EntityState::Unchanged
    } else {
        EntityState::Added
    })
}

/// State picked by `update`: `Modified` unless the generated key is unset.
pub(crate) fn updated(node: &GraphNode) -> Option<EntityState> {
    Some(if node.key_set {
        EntityState::Modified
    } else {
        EntityState::Added
    })
}
