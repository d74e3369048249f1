//! Change tracking and relationship fixup for relmodel.
//!
//! `relmodel-tracking` is the **unit-of-work layer**. A [`Session`] owns an
//! object arena ([`Graph`]) shaped by a [`Model`], tracks instances as
//! entries with a persistence state, and keeps foreign keys and navigations
//! consistent while the graph is edited.
//!
//! # Two ways to edit
//!
//! - **Notifying setters** (`Session::set_value`, `Session::set_reference`,
//!   `Session::add_to_collection`, ...) run fixup immediately.
//! - **Raw writes** through [`Session::graph_mut`] are picked up by
//!   [`Session::detect_changes`], which replays them in write order. With
//!   `auto_detect_changes` the sweep runs before every query of tracking
//!   state.
//!
//! Either way the central invariant holds once an operation returns: for
//! every tracked relationship, the dependent's FK equals the principal's key,
//! the dependent navigation points at the principal and the principal
//! navigation contains the dependent.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::new(model));
//! let category = session.create("Category")?;
//! let product = session.create("Product")?;
//! session.graph_mut().set(category, "Id", 77)?;
//! session.graph_mut().set(product, "Id", 78)?;
//! session.graph_mut().set_reference(product, "Category", Some(category))?;
//!
//! session.attach(category)?;
//! assert_eq!(session.graph().get(product, "CategoryId")?, &Value::Int(77));
//! ```

pub mod collection;
pub mod entry;
pub mod flush;
pub mod graph;
pub mod identity_map;
pub mod track_graph;

mod cascade;
mod change_detector;
mod fixup;
mod state_manager;

pub use collection::{
    HashSetCollection, ListCollection, NavigationCollection, SortedSetCollection, new_collection,
};
pub use entry::{EntityState, EntryId, EntryRef};
pub use flush::{FlushOrderer, FlushPlan, PendingOp};
pub use graph::{Graph, ObjectId};
pub use identity_map::{IdentityResolution, PropertyView, ResolvedValues, resolve_identity};
pub use track_graph::GraphNode;

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use relmodel_core::{
    ConfigError, Cx, DependentError, EntityTypeId, Error, KeyReadOnlyError, Model, Outcome,
    PropertySlot, Result, Value,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::state_manager::StateManager;

// ============================================================================
// Configuration
// ============================================================================

/// When cascade deletes and orphan deletes happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CascadeTiming {
    /// As soon as the principal is deleted or the orphan is created.
    Immediate,
    /// Only in [`Session::cascade_changes`] (and [`Session::flush_plan`]).
    OnSaveChanges,
}

/// What to do about a recoverable model misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningBehavior {
    /// Log a warning and carry on.
    Log,
    /// Fail the operation.
    Throw,
    /// Carry on silently.
    Ignore,
}

/// Configuration for tracker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Run the change detection sweep before queries of tracking state.
    pub auto_detect_changes: bool,
    /// When deleting a principal deletes its cascading dependents.
    pub cascade_delete_timing: CascadeTiming,
    /// When severed required dependents are deleted.
    pub delete_orphans_timing: CascadeTiming,
    /// Policy for a second instance with an already-tracked identity;
    /// `None` makes it an [`Error::IdentityConflict`].
    pub identity_resolution: Option<IdentityResolution>,
    /// An instance tracked under two owned entity types.
    pub duplicate_dependent: WarningBehavior,
    /// Include key values in log fields and error messages.
    pub sensitive_data_logging: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            auto_detect_changes: true,
            cascade_delete_timing: CascadeTiming::Immediate,
            delete_orphans_timing: CascadeTiming::Immediate,
            identity_resolution: None,
            duplicate_dependent: WarningBehavior::Log,
            sensitive_data_logging: false,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            Error::Config(ConfigError {
                message: format!("invalid tracker configuration: {e}"),
                source: Some(Box::new(e)),
            })
        })
    }

    #[must_use]
    pub fn auto_detect_changes(mut self, value: bool) -> Self {
        self.auto_detect_changes = value;
        self
    }

    #[must_use]
    pub fn cascade_delete_timing(mut self, value: CascadeTiming) -> Self {
        self.cascade_delete_timing = value;
        self
    }

    #[must_use]
    pub fn delete_orphans_timing(mut self, value: CascadeTiming) -> Self {
        self.delete_orphans_timing = value;
        self
    }

    #[must_use]
    pub fn identity_resolution(mut self, value: IdentityResolution) -> Self {
        self.identity_resolution = Some(value);
        self
    }

    #[must_use]
    pub fn duplicate_dependent(mut self, value: WarningBehavior) -> Self {
        self.duplicate_dependent = value;
        self
    }

    #[must_use]
    pub fn sensitive_data_logging(mut self, value: bool) -> Self {
        self.sensitive_data_logging = value;
        self
    }
}

// ============================================================================
// Tracking Events
// ============================================================================

/// Something the tracker did, delivered after the public operation that
/// caused it has completed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TrackingEvent {
    /// An instance started tracking.
    Tracked {
        entry: EntryId,
        object: ObjectId,
        entity_type: String,
        state: EntityState,
        /// Tracked by [`Session::materialize`].
        from_query: bool,
    },
    /// A tracked entry changed state. Leaving tracking is a change to
    /// [`EntityState::Detached`].
    StateChanged {
        entry: EntryId,
        object: ObjectId,
        entity_type: String,
        from: EntityState,
        to: EntityState,
    },
}

type TrackingEventFn = Box<dyn FnMut(&TrackingEvent) + Send>;

/// Registered event callbacks.
#[derive(Default)]
struct TrackingCallbacks {
    tracked: Vec<TrackingEventFn>,
    state_changed: Vec<TrackingEventFn>,
}

impl std::fmt::Debug for TrackingCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackingCallbacks")
            .field("tracked", &self.tracked.len())
            .field("state_changed", &self.state_changed.len())
            .finish()
    }
}

impl TrackingCallbacks {
    fn fire(&mut self, event: &TrackingEvent) {
        let callbacks = match event {
            TrackingEvent::Tracked { .. } => &mut self.tracked,
            TrackingEvent::StateChanged { .. } => &mut self.state_changed,
        };
        for cb in callbacks.iter_mut() {
            cb(event);
        }
    }
}

// ============================================================================
// Key Generation
// ============================================================================

/// Source of store-generated key values for [`Session::add_async`].
pub trait KeyGenerator {
    /// Produce a value for a value-generated key property.
    fn generate(
        &mut self,
        cx: &Cx,
        entity_type: &str,
        property: &str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one object graph.
///
/// Every public operation either completes (and then delivers its events)
/// or fails with the first error; there is no rollback, so a session that
/// returned an error should be cleared or dropped.
#[derive(Debug)]
pub struct Session {
    sm: StateManager,
    callbacks: TrackingCallbacks,
}

impl Session {
    /// Create a session with an empty graph and the default configuration.
    pub fn new(model: Arc<Model>) -> Self {
        Self::with_config(model, TrackerConfig::default())
    }

    pub fn with_config(model: Arc<Model>, config: TrackerConfig) -> Self {
        Self {
            sm: StateManager::new(Graph::new(model), config),
            callbacks: TrackingCallbacks::default(),
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.sm.model
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.sm.config
    }

    pub fn graph(&self) -> &Graph {
        &self.sm.graph
    }

    /// Raw access to the graph. Writes made here are not seen by the tracker
    /// until the next [`Session::detect_changes`].
    pub fn graph_mut(&mut self) -> &mut Graph {
        &mut self.sm.graph
    }

    /// Create an untracked instance of a class.
    pub fn create(&mut self, class: &str) -> Result<ObjectId> {
        self.sm.graph.create(class)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a callback for instances starting to be tracked.
    pub fn on_tracked(&mut self, f: impl FnMut(&TrackingEvent) + Send + 'static) {
        self.callbacks.tracked.push(Box::new(f));
    }

    /// Register a callback for state changes of tracked entries.
    pub fn on_state_changed(&mut self, f: impl FnMut(&TrackingEvent) + Send + 'static) {
        self.callbacks.state_changed.push(Box::new(f));
    }

    /// Deliver the events of a completed operation; drop them on failure.
    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        let events = std::mem::take(&mut self.sm.events);
        if result.is_ok() {
            for event in &events {
                self.callbacks.fire(event);
            }
        }
        result
    }

    // ========================================================================
    // Tracking a graph
    // ========================================================================

    /// Track `root` and everything reachable from it as `Added`.
    #[instrument(level = "debug", skip(self))]
    pub fn add(&mut self, root: ObjectId) -> Result<Option<EntryId>> {
        let result = self.track_root(root, track_graph::added);
        self.finish(result)
    }

    /// Track `root` and everything reachable from it as `Unchanged`; nodes
    /// with an unset generated key are `Added`.
    #[instrument(level = "debug", skip(self))]
    pub fn attach(&mut self, root: ObjectId) -> Result<Option<EntryId>> {
        let result = self.track_root(root, track_graph::attached);
        self.finish(result)
    }

    /// Track `root` and everything reachable from it as `Modified`; nodes
    /// with an unset generated key are `Added`.
    #[instrument(level = "debug", skip(self))]
    pub fn update(&mut self, root: ObjectId) -> Result<Option<EntryId>> {
        let result = self.track_root(root, track_graph::updated);
        self.finish(result)
    }

    #[instrument(level = "debug", skip(self, roots))]
    pub fn add_range(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Result<()> {
        let result = roots
            .into_iter()
            .try_for_each(|root| self.track_root(root, track_graph::added).map(|_| ()));
        self.finish(result)
    }

    #[instrument(level = "debug", skip(self, roots))]
    pub fn attach_range(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Result<()> {
        let result = roots
            .into_iter()
            .try_for_each(|root| self.track_root(root, track_graph::attached).map(|_| ()));
        self.finish(result)
    }

    #[instrument(level = "debug", skip(self, roots))]
    pub fn update_range(&mut self, roots: impl IntoIterator<Item = ObjectId>) -> Result<()> {
        let result = roots
            .into_iter()
            .try_for_each(|root| self.track_root(root, track_graph::updated).map(|_| ()));
        self.finish(result)
    }

    fn track_root(
        &mut self,
        root: ObjectId,
        callback: fn(&GraphNode) -> Option<EntityState>,
    ) -> Result<Option<EntryId>> {
        let entity_type = self.root_type(root)?;
        self.sm.track_graph(root, entity_type, true, callback)
    }

    /// Walk everything reachable from `root` and let `callback` choose the
    /// state of each untracked instance. Returning `None` skips the instance
    /// and everything only reachable through it. Tracked instances are left
    /// as they are.
    #[instrument(level = "debug", skip(self, callback))]
    pub fn track_graph<F>(&mut self, root: ObjectId, callback: F) -> Result<Option<EntryId>>
    where
        F: FnMut(&GraphNode) -> Option<EntityState>,
    {
        let result = self
            .root_type(root)
            .and_then(|entity_type| self.sm.track_graph(root, entity_type, false, callback));
        self.finish(result)
    }

    /// Fill unset store-generated keys from `generator`, then [`Session::add`].
    ///
    /// Keys are generated for every untracked instance the traversal would
    /// reach. A cancelled or failed generator stops before anything is
    /// tracked.
    #[instrument(level = "debug", skip(self, cx, generator))]
    pub async fn add_async<G: KeyGenerator>(
        &mut self,
        cx: &Cx,
        root: ObjectId,
        generator: &mut G,
    ) -> Outcome<Option<EntryId>, Error> {
        let entity_type = match self.root_type(root) {
            Ok(t) => t,
            Err(e) => return Outcome::Err(e),
        };
        let model = Arc::clone(&self.sm.model);
        let nodes = self.sm.untracked_nodes(root, entity_type);
        for node in nodes.iter().filter(|n| !n.key_set) {
            if self.sm.resolve_target(node.object, node.entity_type).is_some() {
                continue;
            }
            let et = model.entity_type(node.entity_type);
            for &p in &et.key {
                let info = &et.properties[p];
                let PropertySlot::Field(f) = info.slot else {
                    continue;
                };
                if !info.value_generated || !self.sm.graph.field(node.object, f).is_default() {
                    continue;
                }
                match generator.generate(cx, &et.name, &info.name).await {
                    Outcome::Ok(value) => {
                        debug!(
                            entity_type = %et.name,
                            property = %info.name,
                            "generated key value"
                        );
                        self.sm.graph.set_field(node.object, f, value);
                    }
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            }
        }
        match self.add(root) {
            Ok(id) => Outcome::Ok(id),
            Err(e) => Outcome::Err(e),
        }
    }

    // ========================================================================
    // Single instances
    // ========================================================================

    /// Mark an instance `Deleted` (an `Added` instance is detached). An
    /// untracked instance is attached first.
    #[instrument(level = "debug", skip(self))]
    pub fn remove(&mut self, obj: ObjectId) -> Result<()> {
        let result = self.remove_inner(obj);
        self.finish(result)
    }

    fn remove_inner(&mut self, obj: ObjectId) -> Result<()> {
        let id = match self.single_entry(obj)? {
            Some(id) => id,
            None => match self.track_root(obj, track_graph::attached)? {
                Some(id) => id,
                None => return Ok(()),
            },
        };
        self.sm.set_entity_state(id, EntityState::Deleted)
    }

    /// Stop tracking an instance. Owned dependents are detached with it.
    #[instrument(level = "debug", skip(self))]
    pub fn detach(&mut self, obj: ObjectId) -> Result<()> {
        let result = match self.single_entry(obj) {
            Ok(Some(id)) => self.sm.set_entity_state(id, EntityState::Detached),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    /// Move an instance to `state`. An untracked instance starts tracking
    /// in that state, without following its navigations to other untracked
    /// instances.
    #[instrument(level = "debug", skip(self))]
    pub fn set_state(&mut self, obj: ObjectId, state: EntityState) -> Result<Option<EntryId>> {
        let result = self.set_state_inner(obj, state);
        self.finish(result)
    }

    fn set_state_inner(&mut self, obj: ObjectId, state: EntityState) -> Result<Option<EntryId>> {
        if let Some(id) = self.single_entry(obj)? {
            self.sm.set_entity_state(id, state)?;
            return Ok(self.sm.is_live(id).then_some(id));
        }
        let entity_type = self.root_type(obj)?;
        self.sm.start_tracking(obj, entity_type, state, None, false)
    }

    /// Track an instance loaded by a query as `Unchanged`. Only FK values
    /// connect it to tracked instances; its navigations are not followed.
    #[instrument(level = "debug", skip(self))]
    pub fn materialize(&mut self, obj: ObjectId) -> Result<Option<EntryId>> {
        let result = self.root_type(obj).and_then(|entity_type| {
            self.sm
                .start_tracking(obj, entity_type, EntityState::Unchanged, None, true)
        });
        self.finish(result)
    }

    // ========================================================================
    // Entries
    // ========================================================================

    /// The entry of an instance. An untracked instance of a class with a
    /// root entity type yields a `Detached` entry.
    #[instrument(level = "debug", skip(self))]
    pub fn entry(&mut self, obj: ObjectId) -> Result<EntryRef<'_>> {
        self.auto_detect()?;
        self.check_object(obj)?;
        match self.single_entry(obj)? {
            Some(id) => {
                let entity_type = self.sm.entity_type_of(id).ok_or_else(|| {
                    Error::invalid(format!("{id} is not tracked"))
                })?;
                Ok(EntryRef::new(&self.sm, Some(id), obj, entity_type))
            }
            None => {
                let class = self.sm.graph.class_of(obj)?;
                match self.sm.model.root_type_of_class(class) {
                    Some(entity_type) => Ok(EntryRef::new(&self.sm, None, obj, entity_type)),
                    None => Err(self.untracked_dependent(obj)),
                }
            }
        }
    }

    /// The entry of the instance a reference navigation points at, resolved
    /// as the navigation's target type.
    pub fn reference_entry(
        &mut self,
        owner: ObjectId,
        navigation: &str,
    ) -> Result<Option<EntryRef<'_>>> {
        self.auto_detect()?;
        let target_type = self.navigation_target(owner, navigation, false)?;
        let Some(target) = self.sm.graph.reference(owner, navigation)? else {
            return Ok(None);
        };
        let id = self.sm.resolve_target(target, target_type);
        Ok(Some(EntryRef::new(&self.sm, id, target, target_type)))
    }

    /// Entries of the members of a collection navigation, resolved as the
    /// navigation's target type.
    pub fn collection_entries(
        &mut self,
        owner: ObjectId,
        navigation: &str,
    ) -> Result<Vec<EntryRef<'_>>> {
        self.auto_detect()?;
        let target_type = self.navigation_target(owner, navigation, true)?;
        let items = self.sm.graph.collection(owner, navigation)?.unwrap_or_default();
        Ok(items
            .into_iter()
            .map(|item| {
                let id = self.sm.resolve_target(item, target_type);
                EntryRef::new(&self.sm, id, item, target_type)
            })
            .collect())
    }

    /// Every tracked entry, oldest first.
    ///
    /// A `Deleted` entry whose identity was taken over by an `Added` entry is
    /// not listed; it is reachable through
    /// [`EntryRef::shared_identity_entry`].
    #[instrument(level = "debug", skip(self))]
    pub fn entries(&mut self) -> Result<Vec<EntryRef<'_>>> {
        self.auto_detect()?;
        let sm = &self.sm;
        Ok(sm
            .entries
            .values()
            .filter(|e| {
                let displaced = e.state == EntityState::Deleted
                    && e.shared_identity
                        .is_some_and(|p| sm.state_of(p) == EntityState::Added);
                !displaced
            })
            .map(|e| EntryRef::new(sm, Some(e.id), e.object, e.entity_type))
            .collect())
    }

    /// Whether any entry is `Added`, `Modified` or `Deleted`.
    #[instrument(level = "debug", skip(self))]
    pub fn has_changes(&mut self) -> Result<bool> {
        self.auto_detect()?;
        Ok(self.sm.entries.values().any(|e| e.state.has_changes()))
    }

    // ========================================================================
    // Change processing
    // ========================================================================

    /// Find raw graph writes and run fixup for them.
    #[instrument(level = "debug", skip(self))]
    pub fn detect_changes(&mut self) -> Result<()> {
        let result = self.sm.detect_changes();
        self.finish(result)
    }

    fn auto_detect(&mut self) -> Result<()> {
        if self.sm.config.auto_detect_changes {
            self.detect_changes()?;
        }
        Ok(())
    }

    /// Apply deferred cascades and orphan deletes.
    #[instrument(level = "debug", skip(self))]
    pub fn cascade_changes(&mut self) -> Result<()> {
        self.auto_detect()?;
        let result = self.sm.cascade_changes();
        self.finish(result)
    }

    /// Treat the current state as persisted: `Deleted` entries detach,
    /// `Added`/`Modified` entries become `Unchanged`, temporary key values
    /// become permanent.
    #[instrument(level = "debug", skip(self))]
    pub fn accept_all_changes(&mut self) -> Result<()> {
        self.auto_detect()?;
        let result = self.sm.accept_all_changes();
        self.finish(result)
    }

    /// The writes a save would issue, after deferred cascades.
    #[instrument(level = "debug", skip(self))]
    pub fn flush_plan(&mut self) -> Result<FlushPlan> {
        self.cascade_changes()?;
        let plan = FlushOrderer::from_model(&self.sm.model).order(self.sm.pending_ops());
        debug!(
            deletes = plan.deletes.len(),
            inserts = plan.inserts.len(),
            updates = plan.updates.len(),
            "flush plan built"
        );
        Ok(plan)
    }

    /// Stop tracking everything, without fixup. The graph is left as is.
    #[instrument(level = "debug", skip(self))]
    pub fn clear(&mut self) {
        self.sm.clear();
    }

    // ========================================================================
    // Notifying setters
    // ========================================================================

    /// Write a property and run fixup. Shadow properties can only be written
    /// on tracked instances.
    #[instrument(level = "debug", skip(self, value))]
    pub fn set_value(
        &mut self,
        obj: ObjectId,
        property: &str,
        value: impl Into<Value>,
    ) -> Result<()> {
        let result = self.set_value_inner(obj, property, value.into());
        self.finish(result)
    }

    fn set_value_inner(&mut self, obj: ObjectId, property: &str, value: Value) -> Result<()> {
        let Some(id) = self.single_entry(obj)? else {
            let class = self.sm.graph.class_of(obj)?;
            if self.sm.model.class(class).field(property).is_none() {
                let shadow = self
                    .sm
                    .model
                    .entity_types_of_class(class)
                    .iter()
                    .any(|t| self.sm.model.entity_type(*t).property(property).is_some());
                if shadow {
                    return Err(Error::invalid(format!(
                        "shadow property '{property}' of {obj} cannot be set while it is not tracked"
                    )));
                }
            }
            return self.sm.graph.set(obj, property, value);
        };
        let model = Arc::clone(&self.sm.model);
        let Some(et) = self.sm.entity_type_of(id).map(|t| model.entity_type(t)) else {
            return Ok(());
        };
        let p = et.find_property(property)?;
        let old = self.sm.current_value(id, p);
        if old.same_as(&value) && !self.sm.is_temporary(id, p) {
            return Ok(());
        }
        if et.properties[p].is_key
            && self.sm.state_of(id) != EntityState::Added
            && !old.same_as(&value)
        {
            return Err(Error::KeyReadOnly(KeyReadOnlyError {
                entity_type: et.name.clone(),
                property: et.properties[p].name.clone(),
            }));
        }
        self.sm.store_value(id, p, value.clone(), false);
        self.sm.property_changed(id, p, old, &value)
    }

    /// Set a reference navigation and run fixup.
    #[instrument(level = "debug", skip(self))]
    pub fn set_reference(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let result = self.set_reference_inner(obj, navigation, target);
        self.finish(result)
    }

    fn set_reference_inner(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let ni = self.sm.graph.navigation_index(obj, navigation, false)?;
        let entry = self.single_entry(obj)?;
        let old = self.sm.graph.reference_at(obj, ni);
        self.sm.graph.set_reference(obj, navigation, target)?;
        let Some(id) = entry else {
            return Ok(());
        };
        self.sm.refresh_reference_snapshot(obj, ni);
        if old == target {
            return Ok(());
        }
        self.sm.navigation_reference_changed(id, ni, old, target)
    }

    /// Add to a collection navigation and run fixup. Adding a member that is
    /// already present does nothing.
    #[instrument(level = "debug", skip(self))]
    pub fn add_to_collection(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        item: ObjectId,
    ) -> Result<()> {
        let result = self.change_collection(obj, navigation, |graph, ni| {
            if graph.collection_contains_at(obj, ni, item) {
                return Ok(None);
            }
            graph.collection_add(obj, navigation, item)?;
            Ok(Some((vec![item], Vec::new())))
        });
        self.finish(result)
    }

    /// Remove from a collection navigation and run fixup.
    #[instrument(level = "debug", skip(self))]
    pub fn remove_from_collection(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        item: ObjectId,
    ) -> Result<()> {
        let result = self.change_collection(obj, navigation, |graph, ni| {
            if !graph.collection_contains_at(obj, ni, item) {
                return Ok(None);
            }
            while graph.collection_remove(obj, navigation, item)? {}
            Ok(Some((Vec::new(), vec![item])))
        });
        self.finish(result)
    }

    /// Replace a collection navigation (`None` makes it null) and run fixup
    /// for the members that came and went.
    #[instrument(level = "debug", skip(self, items))]
    pub fn replace_collection(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        items: Option<Vec<ObjectId>>,
    ) -> Result<()> {
        let result = self.change_collection(obj, navigation, |graph, ni| {
            let before: BTreeSet<ObjectId> =
                graph.collection_items_at(obj, ni).into_iter().collect();
            let after: BTreeSet<ObjectId> = items.iter().flatten().copied().collect();
            graph.set_collection(obj, navigation, items)?;
            let added = after.difference(&before).copied().collect();
            let removed = before.difference(&after).copied().collect();
            Ok(Some((added, removed)))
        });
        self.finish(result)
    }

    /// Apply a raw collection edit, then run fixup for the reported
    /// `(added, removed)` members when the owner is tracked.
    fn change_collection<F>(&mut self, obj: ObjectId, navigation: &str, edit: F) -> Result<()>
    where
        F: FnOnce(&mut Graph, usize) -> Result<Option<(Vec<ObjectId>, Vec<ObjectId>)>>,
    {
        let ni = self.sm.graph.navigation_index(obj, navigation, true)?;
        let entry = self.single_entry(obj)?;
        let Some((added, removed)) = edit(&mut self.sm.graph, ni)? else {
            return Ok(());
        };
        let Some(id) = entry else {
            return Ok(());
        };
        let touched: Vec<ObjectId> = added.iter().chain(&removed).copied().collect();
        self.sm.refresh_member_snapshots(obj, ni, &touched);
        if added.is_empty() && removed.is_empty() {
            return Ok(());
        }
        self.sm.navigation_collection_changed(id, ni, &added, &removed)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn check_object(&self, obj: ObjectId) -> Result<()> {
        if self.sm.graph.contains(obj) {
            Ok(())
        } else {
            Err(Error::invalid(format!("unknown object handle {obj}")))
        }
    }

    /// The only entry tracking `obj`, `None` when untracked.
    fn single_entry(&self, obj: ObjectId) -> Result<Option<EntryId>> {
        self.check_object(obj)?;
        let ids = self.sm.entries_for(obj);
        match ids.as_slice() {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => {
                let class = self.sm.graph.class_info(obj)?.name.clone();
                Err(Error::AmbiguousDependent(DependentError {
                    class,
                    entity_types: ids
                        .iter()
                        .filter_map(|id| self.sm.entity_type_info(*id))
                        .map(|et| et.name.clone())
                        .collect(),
                }))
            }
        }
    }

    /// The entity type an instance is tracked as when it is a graph root.
    fn root_type(&self, obj: ObjectId) -> Result<EntityTypeId> {
        self.check_object(obj)?;
        let class = self.sm.graph.class_of(obj)?;
        self.sm
            .model
            .root_type_of_class(class)
            .ok_or_else(|| self.untracked_dependent(obj))
    }

    fn untracked_dependent(&self, obj: ObjectId) -> Error {
        let Ok(class) = self.sm.graph.class_of(obj) else {
            return Error::invalid(format!("unknown object handle {obj}"));
        };
        Error::UntrackedDependent(DependentError {
            class: self.sm.model.class(class).name.clone(),
            entity_types: self
                .sm
                .model
                .entity_types_of_class(class)
                .iter()
                .map(|t| self.sm.model.entity_type(*t).name.clone())
                .collect(),
        })
    }

    /// Target entity type of a navigation of `owner`, through its entry or
    /// its root type.
    fn navigation_target(
        &self,
        owner: ObjectId,
        navigation: &str,
        collection: bool,
    ) -> Result<EntityTypeId> {
        let ni = self.sm.graph.navigation_index(owner, navigation, collection)?;
        let owner_type = match self.single_entry(owner)? {
            Some(id) => self
                .sm
                .entity_type_of(id)
                .ok_or_else(|| Error::invalid(format!("{id} is not tracked")))?,
            None => self.root_type(owner)?,
        };
        Ok(self.sm.model.entity_type(owner_type).navigations[ni].target)
    }
}
