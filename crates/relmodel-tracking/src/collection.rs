//! Collection navigation backing stores.
//!
//! Fixup only ever asks a collection about membership, so any container that
//! can answer `contains`/`add`/`remove` by [`ObjectId`] works. Membership is
//! always by object handle: two distinct instances with equal keys are two
//! members, whatever their field values say.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use relmodel_core::CollectionKind;

use crate::graph::ObjectId;

/// A collection navigation value.
pub trait NavigationCollection: fmt::Debug + Send {
    /// Which backing store this is.
    fn kind(&self) -> CollectionKind;

    fn contains(&self, item: ObjectId) -> bool;

    /// Add an item. Returns `false` when the store rejected it (sets only).
    fn add(&mut self, item: ObjectId) -> bool;

    /// Remove one occurrence of an item. Returns `false` if it was absent.
    fn remove(&mut self, item: ObjectId) -> bool;

    fn clear(&mut self);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Members in the collection's own iteration order.
    fn items(&self) -> Vec<ObjectId>;
}

/// Insertion-ordered list. Allows the same handle twice.
#[derive(Debug, Default, Clone)]
pub struct ListCollection {
    items: Vec<ObjectId>,
}

impl NavigationCollection for ListCollection {
    fn kind(&self) -> CollectionKind {
        CollectionKind::List
    }

    fn contains(&self, item: ObjectId) -> bool {
        self.items.contains(&item)
    }

    fn add(&mut self, item: ObjectId) -> bool {
        self.items.push(item);
        true
    }

    fn remove(&mut self, item: ObjectId) -> bool {
        match self.items.iter().position(|i| *i == item) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Vec<ObjectId> {
        self.items.clone()
    }
}

#[derive(Debug, Default, Clone)]
pub struct HashSetCollection {
    items: HashSet<ObjectId>,
}

impl NavigationCollection for HashSetCollection {
    fn kind(&self) -> CollectionKind {
        CollectionKind::HashSet
    }

    fn contains(&self, item: ObjectId) -> bool {
        self.items.contains(&item)
    }

    fn add(&mut self, item: ObjectId) -> bool {
        self.items.insert(item)
    }

    fn remove(&mut self, item: ObjectId) -> bool {
        self.items.remove(&item)
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Vec<ObjectId> {
        self.items.iter().copied().collect()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SortedSetCollection {
    items: BTreeSet<ObjectId>,
}

impl NavigationCollection for SortedSetCollection {
    fn kind(&self) -> CollectionKind {
        CollectionKind::SortedSet
    }

    fn contains(&self, item: ObjectId) -> bool {
        self.items.contains(&item)
    }

    fn add(&mut self, item: ObjectId) -> bool {
        self.items.insert(item)
    }

    fn remove(&mut self, item: ObjectId) -> bool {
        self.items.remove(&item)
    }

    fn clear(&mut self) {
        self.items.clear();
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn items(&self) -> Vec<ObjectId> {
        self.items.iter().copied().collect()
    }
}

/// Create an empty collection of the given kind.
pub fn new_collection(kind: CollectionKind) -> Box<dyn NavigationCollection> {
    match kind {
        CollectionKind::List => Box::new(ListCollection::default()),
        CollectionKind::HashSet => Box::new(HashSetCollection::default()),
        CollectionKind::SortedSet => Box::new(SortedSetCollection::default()),
    }
}
