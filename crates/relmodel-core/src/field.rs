//! Property metadata.

use crate::model::ForeignKeyId;

/// Where a property's current value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySlot {
    /// A field of the instance, by class field index.
    Field(usize),
    /// A slot stored on the tracking entry, by shadow index.
    Shadow(usize),
}

impl PropertySlot {
    /// Whether the value lives on the instance.
    pub const fn is_field(self) -> bool {
        matches!(self, PropertySlot::Field(_))
    }

    /// Whether the value lives on the tracking entry.
    pub const fn is_shadow(self) -> bool {
        matches!(self, PropertySlot::Shadow(_))
    }
}

/// A scalar property of an entity type.
#[derive(Debug, Clone)]
pub struct PropertyInfo {
    pub name: String,

    pub slot: PropertySlot,

    /// Whether `Null` is a legal value.
    pub nullable: bool,

    /// Whether the store generates the value (keys get temporary values).
    pub value_generated: bool,

    /// Part of the primary key.
    pub is_key: bool,

    /// Foreign keys (on this entity type as dependent) containing this property.
    pub foreign_keys: Vec<ForeignKeyId>,
}

impl PropertyInfo {
    /// Create a non-key property.
    pub fn new(name: impl Into<String>, slot: PropertySlot) -> Self {
        Self {
            name: name.into(),
            slot,
            nullable: false,
            value_generated: false,
            is_key: false,
            foreign_keys: Vec::new(),
        }
    }

    /// Whether this property takes part in any foreign key.
    pub fn is_foreign_key(&self) -> bool {
        !self.foreign_keys.is_empty()
    }
}
