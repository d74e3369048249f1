//! The object arena.
//!
//! Instances are dynamically shaped by their class: one [`Value`] per field
//! and one slot per navigation. Writes made through the by-name API below do
//! not notify the change tracker; they are picked up by
//! [`crate::Session::detect_changes`]. Every effective write is stamped with
//! a monotonically increasing clock so the sweep can replay deltas in the
//! order they happened.

use std::fmt;
use std::sync::Arc;

use relmodel_core::{
    ClassId, ClassInfo, CollectionKind, Error, Model, ModelErrorKind, NavigationIndex, Result,
    Value,
};
use serde::{Deserialize, Serialize};

use crate::collection::{NavigationCollection, new_collection};

/// Handle to an instance in a [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(usize);

impl ObjectId {
    #[cfg(test)]
    pub(crate) const fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

#[derive(Debug)]
enum NavigationSlot {
    Reference(Option<ObjectId>),
    /// `None` is a null collection; it is created on first add.
    Collection(Option<Box<dyn NavigationCollection>>),
}

#[derive(Debug)]
struct Instance {
    class: ClassId,
    fields: Vec<Value>,
    field_stamps: Vec<u64>,
    navigations: Vec<NavigationSlot>,
    navigation_stamps: Vec<u64>,
}

/// Arena of instances shaped by a [`Model`]'s classes.
#[derive(Debug)]
pub struct Graph {
    model: Arc<Model>,
    instances: Vec<Instance>,
    clock: u64,
}

impl Graph {
    pub fn new(model: Arc<Model>) -> Self {
        Self {
            model,
            instances: Vec::new(),
            clock: 0,
        }
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    /// Number of instances ever created.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Create an instance with every field `Null`, every reference unset and
    /// every collection null.
    pub fn create(&mut self, class: &str) -> Result<ObjectId> {
        let class_id = self.model.find_class(class)?;
        Ok(self.create_instance(class_id))
    }

    pub(crate) fn create_instance(&mut self, class: ClassId) -> ObjectId {
        let info = self.model.class(class);
        let navigations = info
            .navigations
            .iter()
            .map(|n| {
                if n.is_collection {
                    NavigationSlot::Collection(None)
                } else {
                    NavigationSlot::Reference(None)
                }
            })
            .collect();
        let instance = Instance {
            class,
            fields: vec![Value::Null; info.fields.len()],
            field_stamps: vec![0; info.fields.len()],
            navigations,
            navigation_stamps: vec![0; info.navigations.len()],
        };
        self.instances.push(instance);
        ObjectId(self.instances.len() - 1)
    }

    pub fn contains(&self, obj: ObjectId) -> bool {
        obj.0 < self.instances.len()
    }

    pub fn class_of(&self, obj: ObjectId) -> Result<ClassId> {
        self.instance(obj).map(|i| i.class)
    }

    /// Class metadata of an instance.
    pub fn class_info(&self, obj: ObjectId) -> Result<&ClassInfo> {
        let class = self.class_of(obj)?;
        Ok(self.model.class(class))
    }

    pub fn get(&self, obj: ObjectId, field: &str) -> Result<&Value> {
        let f = self.field_index(obj, field)?;
        Ok(&self.instances[obj.0].fields[f])
    }

    pub fn set(&mut self, obj: ObjectId, field: &str, value: impl Into<Value>) -> Result<()> {
        let f = self.field_index(obj, field)?;
        self.set_field(obj, f, value.into());
        Ok(())
    }

    pub fn reference(&self, obj: ObjectId, navigation: &str) -> Result<Option<ObjectId>> {
        let n = self.navigation_index(obj, navigation, false)?;
        Ok(self.reference_at(obj, n))
    }

    pub fn set_reference(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let n = self.navigation_index(obj, navigation, false)?;
        self.check_target(target)?;
        self.set_reference_at(obj, n, target);
        Ok(())
    }

    /// Members of a collection navigation, or `None` for a null collection.
    pub fn collection(&self, obj: ObjectId, navigation: &str) -> Result<Option<Vec<ObjectId>>> {
        let n = self.navigation_index(obj, navigation, true)?;
        Ok(self.collection_at(obj, n).map(|c| c.items()))
    }

    pub fn collection_contains(
        &self,
        obj: ObjectId,
        navigation: &str,
        item: ObjectId,
    ) -> Result<bool> {
        let n = self.navigation_index(obj, navigation, true)?;
        Ok(self.collection_contains_at(obj, n, item))
    }

    pub fn collection_add(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        item: ObjectId,
    ) -> Result<bool> {
        let n = self.navigation_index(obj, navigation, true)?;
        self.check_target(Some(item))?;
        Ok(self.collection_add_at(obj, n, item))
    }

    pub fn collection_remove(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        item: ObjectId,
    ) -> Result<bool> {
        let n = self.navigation_index(obj, navigation, true)?;
        Ok(self.collection_remove_at(obj, n, item))
    }

    pub fn collection_clear(&mut self, obj: ObjectId, navigation: &str) -> Result<()> {
        let n = self.navigation_index(obj, navigation, true)?;
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        if let NavigationSlot::Collection(Some(c)) = &mut instance.navigations[n] {
            if !c.is_empty() {
                c.clear();
                instance.navigation_stamps[n] = stamp;
            }
        }
        Ok(())
    }

    /// Replace a collection wholesale (`None` makes it null).
    pub fn set_collection(
        &mut self,
        obj: ObjectId,
        navigation: &str,
        items: Option<Vec<ObjectId>>,
    ) -> Result<()> {
        let n = self.navigation_index(obj, navigation, true)?;
        if let Some(items) = &items {
            for item in items {
                self.check_target(Some(*item))?;
            }
        }
        self.set_collection_at(obj, n, items);
        Ok(())
    }

    // Index-based access used by the tracker. Handles are validated at the
    // tracking boundary, so these index directly.

    pub(crate) fn field(&self, obj: ObjectId, field: usize) -> &Value {
        &self.instances[obj.0].fields[field]
    }

    pub(crate) fn field_stamp(&self, obj: ObjectId, field: usize) -> u64 {
        self.instances[obj.0].field_stamps[field]
    }

    /// Returns whether the stored value changed.
    pub(crate) fn set_field(&mut self, obj: ObjectId, field: usize, value: Value) -> bool {
        if self.instances[obj.0].fields[field].same_as(&value) {
            return false;
        }
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        instance.fields[field] = value;
        instance.field_stamps[field] = stamp;
        true
    }

    pub(crate) fn navigation_stamp(&self, obj: ObjectId, navigation: NavigationIndex) -> u64 {
        self.instances[obj.0].navigation_stamps[navigation]
    }

    pub(crate) fn reference_at(
        &self,
        obj: ObjectId,
        navigation: NavigationIndex,
    ) -> Option<ObjectId> {
        match &self.instances[obj.0].navigations[navigation] {
            NavigationSlot::Reference(r) => *r,
            NavigationSlot::Collection(_) => None,
        }
    }

    pub(crate) fn set_reference_at(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        target: Option<ObjectId>,
    ) -> bool {
        if self.reference_at(obj, navigation) == target {
            return false;
        }
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        if let NavigationSlot::Reference(r) = &mut instance.navigations[navigation] {
            *r = target;
            instance.navigation_stamps[navigation] = stamp;
            return true;
        }
        false
    }

    pub(crate) fn collection_at(
        &self,
        obj: ObjectId,
        navigation: NavigationIndex,
    ) -> Option<&dyn NavigationCollection> {
        match &self.instances[obj.0].navigations[navigation] {
            NavigationSlot::Collection(Some(c)) => Some(c.as_ref()),
            _ => None,
        }
    }

    pub(crate) fn collection_items_at(
        &self,
        obj: ObjectId,
        navigation: NavigationIndex,
    ) -> Vec<ObjectId> {
        self.collection_at(obj, navigation)
            .map(|c| c.items())
            .unwrap_or_default()
    }

    pub(crate) fn collection_contains_at(
        &self,
        obj: ObjectId,
        navigation: NavigationIndex,
        item: ObjectId,
    ) -> bool {
        self.collection_at(obj, navigation)
            .is_some_and(|c| c.contains(item))
    }

    pub(crate) fn collection_add_at(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        item: ObjectId,
    ) -> bool {
        let kind = self.collection_kind(obj, navigation);
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        let NavigationSlot::Collection(slot) = &mut instance.navigations[navigation] else {
            return false;
        };
        let added = slot.get_or_insert_with(|| new_collection(kind)).add(item);
        if added {
            instance.navigation_stamps[navigation] = stamp;
        }
        added
    }

    pub(crate) fn collection_remove_at(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        item: ObjectId,
    ) -> bool {
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        let NavigationSlot::Collection(Some(c)) = &mut instance.navigations[navigation] else {
            return false;
        };
        let removed = c.remove(item);
        if removed {
            instance.navigation_stamps[navigation] = stamp;
        }
        removed
    }

    pub(crate) fn set_collection_at(
        &mut self,
        obj: ObjectId,
        navigation: NavigationIndex,
        items: Option<Vec<ObjectId>>,
    ) {
        let kind = self.collection_kind(obj, navigation);
        let stamp = self.tick();
        let instance = &mut self.instances[obj.0];
        if let NavigationSlot::Collection(slot) = &mut instance.navigations[navigation] {
            *slot = items.map(|items| {
                let mut c = new_collection(kind);
                for item in items {
                    c.add(item);
                }
                c
            });
            instance.navigation_stamps[navigation] = stamp;
        }
    }

    /// Current targets of a navigation, reference or collection.
    pub(crate) fn targets_at(&self, obj: ObjectId, navigation: NavigationIndex) -> Vec<ObjectId> {
        match &self.instances[obj.0].navigations[navigation] {
            NavigationSlot::Reference(r) => r.iter().copied().collect(),
            NavigationSlot::Collection(c) => c.as_ref().map(|c| c.items()).unwrap_or_default(),
        }
    }

    fn collection_kind(&self, obj: ObjectId, navigation: NavigationIndex) -> CollectionKind {
        let class = self.instances[obj.0].class;
        self.model.class(class).navigations[navigation].collection_kind
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn instance(&self, obj: ObjectId) -> Result<&Instance> {
        self.instances
            .get(obj.0)
            .ok_or_else(|| Error::invalid(format!("unknown object handle {obj}")))
    }

    fn check_target(&self, target: Option<ObjectId>) -> Result<()> {
        match target {
            Some(t) => self.instance(t).map(|_| ()),
            None => Ok(()),
        }
    }

    fn field_index(&self, obj: ObjectId, field: &str) -> Result<usize> {
        let instance = self.instance(obj)?;
        let class = self.model.class(instance.class);
        class.field(field).ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownProperty,
                format!("class '{}' has no field '{}'", class.name, field),
            )
        })
    }

    pub(crate) fn navigation_index(
        &self,
        obj: ObjectId,
        navigation: &str,
        collection: bool,
    ) -> Result<NavigationIndex> {
        let instance = self.instance(obj)?;
        let class = self.model.class(instance.class);
        let n = class.navigation(navigation).ok_or_else(|| {
            Error::model(
                ModelErrorKind::UnknownNavigation,
                format!("class '{}' has no navigation '{}'", class.name, navigation),
            )
        })?;
        if class.navigations[n].is_collection != collection {
            return Err(Error::model(
                ModelErrorKind::Mismatch,
                format!(
                    "navigation '{}.{}' is {}",
                    class.name,
                    navigation,
                    if collection { "a reference" } else { "a collection" }
                ),
            ));
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmodel_core::{EntityDef, ModelBuilder, PropertyDef, RelationshipDef};

    fn graph() -> Graph {
        let model = ModelBuilder::new()
            .entity(EntityDef::new("Category").property(PropertyDef::new("Id")).key(&["Id"]))
            .entity(
                EntityDef::new("Product")
                    .property(PropertyDef::new("Id"))
                    .property(PropertyDef::new("CategoryId"))
                    .key(&["Id"]),
            )
            .relationship(
                RelationshipDef::one_to_many("Category", "Product")
                    .principal_navigation("Products")
                    .dependent_navigation("Category")
                    .foreign_key(&["CategoryId"]),
            )
            .build()
            .unwrap();
        Graph::new(Arc::new(model))
    }

    #[test]
    fn test_create_and_fields() {
        let mut g = graph();
        let c = g.create("Category").unwrap();
        assert_eq!(g.get(c, "Id").unwrap(), &Value::Null);
        g.set(c, "Id", 77).unwrap();
        assert_eq!(g.get(c, "Id").unwrap(), &Value::Int(77));
        assert!(g.get(c, "Nope").is_err());
        assert!(g.create("Nope").is_err());
    }

    #[test]
    fn test_null_collection_created_on_add() {
        let mut g = graph();
        let c = g.create("Category").unwrap();
        let p = g.create("Product").unwrap();
        assert_eq!(g.collection(c, "Products").unwrap(), None);
        assert!(g.collection_add(c, "Products", p).unwrap());
        assert_eq!(g.collection(c, "Products").unwrap(), Some(vec![p]));
        g.collection_clear(c, "Products").unwrap();
        assert_eq!(g.collection(c, "Products").unwrap(), Some(vec![]));
        g.set_collection(c, "Products", None).unwrap();
        assert_eq!(g.collection(c, "Products").unwrap(), None);
    }

    #[test]
    fn test_reference_vs_collection_mismatch() {
        let mut g = graph();
        let c = g.create("Category").unwrap();
        let p = g.create("Product").unwrap();
        assert!(g.set_reference(c, "Products", Some(p)).is_err());
        assert!(g.collection_add(p, "Category", c).is_err());
        g.set_reference(p, "Category", Some(c)).unwrap();
        assert_eq!(g.reference(p, "Category").unwrap(), Some(c));
    }

    #[test]
    fn test_stamps_only_move_on_effective_writes() {
        let mut g = graph();
        let p = g.create("Product").unwrap();
        g.set(p, "CategoryId", 1).unwrap();
        let first = g.field_stamp(p, 1);
        g.set(p, "CategoryId", 1).unwrap();
        assert_eq!(g.field_stamp(p, 1), first);
        g.set(p, "CategoryId", 2).unwrap();
        assert!(g.field_stamp(p, 1) > first);
    }
}
