//! Fluent construction of a [`Model`].
//!
//! ```ignore
//! let model = ModelBuilder::new()
//!     .entity(EntityDef::new("Category").property(PropertyDef::new("Id")).key(&["Id"]))
//!     .entity(
//!         EntityDef::new("Product")
//!             .property(PropertyDef::new("Id"))
//!             .property(PropertyDef::new("CategoryId"))
//!             .key(&["Id"]),
//!     )
//!     .relationship(
//!         RelationshipDef::one_to_many("Category", "Product")
//!             .principal_navigation("Products")
//!             .dependent_navigation("Category")
//!             .foreign_key(&["CategoryId"]),
//!     )
//!     .build()?;
//! ```
//!
//! Owned types are declared inline with [`EntityDef::owns`]; their names,
//! keys and defining foreign keys are derived.

use std::collections::HashMap;

use crate::error::{Error, ModelErrorKind, Result};
use crate::field::{PropertyInfo, PropertySlot};
use crate::identifiers::{owned_type_name, validate_identifier};
use crate::model::{
    ClassId, ClassInfo, ClassNavigation, EntityType, EntityTypeId, ForeignKeyId, Model,
    NavigationIndex, PropertyIndex,
};
use crate::relationship::{
    CollectionKind, DeleteBehavior, ForeignKeyInfo, NavigationInfo, RelationshipKind,
};

/// Declaration of a scalar property.
#[derive(Debug, Clone)]
pub struct PropertyDef {
    name: String,
    nullable: bool,
    generated: bool,
    shadow: bool,
}

impl PropertyDef {
    /// A non-nullable, field-backed property.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: false,
            generated: false,
            shadow: false,
        }
    }

    /// Allow `Null`.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Store-generated value (key properties get temporary values).
    #[must_use]
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    /// Keep the value on the tracking entry instead of the instance.
    #[must_use]
    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }
}

/// Declaration of a (non-owned) entity type. The class has the same name.
#[derive(Debug, Clone)]
pub struct EntityDef {
    name: String,
    properties: Vec<PropertyDef>,
    key: Vec<String>,
    owned: Vec<OwnedDef>,
}

impl EntityDef {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
            key: Vec::new(),
            owned: Vec::new(),
        }
    }

    #[must_use]
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn key(mut self, properties: &[&str]) -> Self {
        self.key = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Declare an owned navigation.
    #[must_use]
    pub fn owns(mut self, owned: OwnedDef) -> Self {
        self.owned.push(owned);
        self
    }
}

/// Declaration of an owned entity type reached through a navigation.
///
/// The owned type is named `"{Owner}.{navigation}#{Class}"`. Its defining
/// foreign key mirrors the owner's key; for references it is also the key,
/// for collections the key is the foreign key plus [`OwnedDef::key`].
#[derive(Debug, Clone)]
pub struct OwnedDef {
    navigation: String,
    class: String,
    is_collection: bool,
    collection_kind: CollectionKind,
    inverse: Option<String>,
    properties: Vec<PropertyDef>,
    key: Vec<String>,
    owned: Vec<OwnedDef>,
}

impl OwnedDef {
    /// An owned reference navigation.
    #[must_use]
    pub fn reference(navigation: impl Into<String>, class: impl Into<String>) -> Self {
        Self::new(navigation.into(), class.into(), false)
    }

    /// An owned collection navigation.
    #[must_use]
    pub fn collection(navigation: impl Into<String>, class: impl Into<String>) -> Self {
        Self::new(navigation.into(), class.into(), true)
    }

    fn new(navigation: String, class: String, is_collection: bool) -> Self {
        Self {
            navigation,
            class,
            is_collection,
            collection_kind: CollectionKind::List,
            inverse: None,
            properties: Vec::new(),
            key: Vec::new(),
            owned: Vec::new(),
        }
    }

    /// Navigation on the owned class pointing back at the owner.
    #[must_use]
    pub fn inverse(mut self, navigation: impl Into<String>) -> Self {
        self.inverse = Some(navigation.into());
        self
    }

    #[must_use]
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Additional key properties (owned collections). Undeclared names become
    /// generated shadow properties.
    #[must_use]
    pub fn key(mut self, properties: &[&str]) -> Self {
        self.key = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    #[must_use]
    pub fn collection_kind(mut self, kind: CollectionKind) -> Self {
        self.collection_kind = kind;
        self
    }

    /// Declare a nested owned navigation.
    #[must_use]
    pub fn owns(mut self, owned: OwnedDef) -> Self {
        self.owned.push(owned);
        self
    }
}

/// Declaration of a foreign key between two entity types.
#[derive(Debug, Clone)]
pub struct RelationshipDef {
    kind: RelationshipKind,
    principal: String,
    dependent: String,
    principal_navigation: Option<String>,
    dependent_navigation: Option<String>,
    foreign_key: Vec<String>,
    principal_key: Option<Vec<String>>,
    required: Option<bool>,
    on_delete: Option<DeleteBehavior>,
    collection_kind: CollectionKind,
}

impl RelationshipDef {
    #[must_use]
    pub fn one_to_many(principal: impl Into<String>, dependent: impl Into<String>) -> Self {
        Self::new(RelationshipKind::OneToMany, principal.into(), dependent.into())
    }

    #[must_use]
    pub fn one_to_one(principal: impl Into<String>, dependent: impl Into<String>) -> Self {
        Self::new(RelationshipKind::OneToOne, principal.into(), dependent.into())
    }

    fn new(kind: RelationshipKind, principal: String, dependent: String) -> Self {
        Self {
            kind,
            principal,
            dependent,
            principal_navigation: None,
            dependent_navigation: None,
            foreign_key: Vec::new(),
            principal_key: None,
            required: None,
            on_delete: None,
            collection_kind: CollectionKind::List,
        }
    }

    /// Navigation on the principal (a collection for one-to-many).
    #[must_use]
    pub fn principal_navigation(mut self, name: impl Into<String>) -> Self {
        self.principal_navigation = Some(name.into());
        self
    }

    /// Navigation on the dependent pointing at the principal.
    #[must_use]
    pub fn dependent_navigation(mut self, name: impl Into<String>) -> Self {
        self.dependent_navigation = Some(name.into());
        self
    }

    /// Foreign key properties on the dependent. Undeclared names become
    /// shadow properties.
    #[must_use]
    pub fn foreign_key(mut self, properties: &[&str]) -> Self {
        self.foreign_key = properties.iter().map(|p| (*p).to_string()).collect();
        self
    }

    /// Referenced principal properties (defaults to the primary key).
    #[must_use]
    pub fn principal_key(mut self, properties: &[&str]) -> Self {
        self.principal_key = Some(properties.iter().map(|p| (*p).to_string()).collect());
        self
    }

    /// Override requiredness (defaults to "no foreign key property is nullable").
    #[must_use]
    pub fn required(mut self, required: bool) -> Self {
        self.required = Some(required);
        self
    }

    #[must_use]
    pub fn on_delete(mut self, behavior: DeleteBehavior) -> Self {
        self.on_delete = Some(behavior);
        self
    }

    /// Backing collection of the principal navigation.
    #[must_use]
    pub fn collection_kind(mut self, kind: CollectionKind) -> Self {
        self.collection_kind = kind;
        self
    }
}

/// Collects declarations and validates them into a [`Model`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityDef>,
    relationships: Vec<RelationshipDef>,
}

struct PendingOwnership {
    owner: usize,
    navigation: String,
    inverse: Option<String>,
    is_collection: bool,
    collection_kind: CollectionKind,
}

struct PendingType {
    name: String,
    class: String,
    properties: Vec<PropertyDef>,
    key: Vec<String>,
    ownership: Option<PendingOwnership>,
}

type NavigationMap = HashMap<(usize, String), NavigationInfo>;

impl ModelBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipDef) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Validate the declarations and produce the model.
    pub fn build(self) -> Result<Model> {
        let pending = self.flatten()?;
        let (classes, classes_by_name) = Self::build_classes(&pending, &self.relationships)?;

        let mut types_by_name = HashMap::new();
        let mut entity_types: Vec<EntityType> = Vec::with_capacity(pending.len());
        for (i, p) in pending.iter().enumerate() {
            let class_id = classes_by_name[&p.class];
            let et = Self::build_entity_type(i, &pending, class_id, &classes, &entity_types)?;
            if types_by_name.insert(et.name.clone(), et.id).is_some() {
                return Err(Error::model(
                    ModelErrorKind::Duplicate,
                    format!("entity type '{}' declared twice", et.name),
                ));
            }
            entity_types.push(et);
        }

        let mut foreign_keys = Vec::new();
        let mut navs: NavigationMap = HashMap::new();

        for (i, p) in pending.iter().enumerate() {
            if let Some(own) = &p.ownership {
                let fk_id = ForeignKeyId(foreign_keys.len());
                let owner_class = &classes[entity_types[own.owner].class.0];
                let owned_class = &classes[entity_types[i].class.0];
                let principal_nav = owner_class.navigation(&own.navigation);
                let dependent_nav = own.inverse.as_deref().and_then(|n| owned_class.navigation(n));
                let fk = ForeignKeyInfo {
                    id: fk_id,
                    principal: EntityTypeId(own.owner),
                    dependent: EntityTypeId(i),
                    properties: Self::ownership_properties(
                        &entity_types[i],
                        own.owner,
                        &entity_types,
                    )?,
                    principal_key: entity_types[own.owner].key.clone(),
                    required: true,
                    unique: !own.is_collection,
                    delete_behavior: DeleteBehavior::Cascade,
                    ownership: true,
                    dependent_to_principal: dependent_nav,
                    principal_to_dependent: principal_nav,
                };
                Self::register_navigations(
                    &fk,
                    &own.navigation,
                    own.inverse.as_deref(),
                    own.collection_kind,
                    own.is_collection,
                    &mut navs,
                )?;
                entity_types[i].ownership = Some(fk_id);
                foreign_keys.push(fk);
            }
        }

        for rel in &self.relationships {
            let fk = Self::build_foreign_key(
                ForeignKeyId(foreign_keys.len()),
                rel,
                &types_by_name,
                &classes,
                &mut entity_types,
            )?;
            Self::register_navigations(
                &fk,
                rel.principal_navigation.as_deref().unwrap_or_default(),
                rel.dependent_navigation.as_deref(),
                rel.collection_kind,
                rel.kind == RelationshipKind::OneToMany,
                &mut navs,
            )?;
            foreign_keys.push(fk);
        }

        for fk in &foreign_keys {
            entity_types[fk.dependent.0].foreign_keys.push(fk.id);
            entity_types[fk.principal.0].referencing_keys.push(fk.id);
            for &p in &fk.properties {
                entity_types[fk.dependent.0].properties[p].foreign_keys.push(fk.id);
            }
        }

        let mut types_by_class = vec![Vec::new(); classes.len()];
        for et in &mut entity_types {
            let class = &classes[et.class.0];
            for cn in &class.navigations {
                let nav = navs.remove(&(et.id.0, cn.name.clone())).ok_or_else(|| {
                    Error::model(
                        ModelErrorKind::UnknownNavigation,
                        format!(
                            "entity type '{}' does not map navigation '{}' of class '{}'",
                            et.name, cn.name, class.name
                        ),
                    )
                })?;
                et.navigations.push(nav);
            }
            types_by_class[et.class.0].push(et.id);
        }

        for (class_id, types) in types_by_class.iter().enumerate() {
            let roots = types
                .iter()
                .filter(|t| entity_types[t.0].ownership.is_none())
                .count();
            if roots > 0 && types.len() > 1 {
                return Err(Error::model(
                    ModelErrorKind::Duplicate,
                    format!(
                        "class '{}' is mapped both as an owned and a non-owned entity type",
                        classes[class_id].name
                    ),
                ));
            }
        }

        tracing::debug!(
            classes = classes.len(),
            entity_types = entity_types.len(),
            foreign_keys = foreign_keys.len(),
            "model built"
        );

        Ok(Model {
            classes,
            entity_types,
            foreign_keys,
            types_by_name,
            classes_by_name,
            types_by_class,
        })
    }

    fn flatten(&self) -> Result<Vec<PendingType>> {
        fn push_owned(
            owner: usize,
            owned: &OwnedDef,
            out: &mut Vec<PendingType>,
        ) -> Result<()> {
            validate_identifier("navigation", &owned.navigation)?;
            validate_identifier("class", &owned.class)?;
            if let Some(inv) = &owned.inverse {
                validate_identifier("navigation", inv)?;
            }
            for p in &owned.properties {
                validate_identifier("property", &p.name)?;
            }
            let name = owned_type_name(&out[owner].name, &owned.navigation, &owned.class);
            let index = out.len();
            out.push(PendingType {
                name,
                class: owned.class.clone(),
                properties: owned.properties.clone(),
                key: owned.key.clone(),
                ownership: Some(PendingOwnership {
                    owner,
                    navigation: owned.navigation.clone(),
                    inverse: owned.inverse.clone(),
                    is_collection: owned.is_collection,
                    collection_kind: owned.collection_kind,
                }),
            });
            for nested in &owned.owned {
                push_owned(index, nested, out)?;
            }
            Ok(())
        }

        let mut out = Vec::new();
        for entity in &self.entities {
            validate_identifier("entity type", &entity.name)?;
            for p in &entity.properties {
                validate_identifier("property", &p.name)?;
            }
            let index = out.len();
            out.push(PendingType {
                name: entity.name.clone(),
                class: entity.name.clone(),
                properties: entity.properties.clone(),
                key: entity.key.clone(),
                ownership: None,
            });
            for owned in &entity.owned {
                push_owned(index, owned, &mut out)?;
            }
        }
        for rel in &self.relationships {
            for nav in rel.principal_navigation.iter().chain(&rel.dependent_navigation) {
                validate_identifier("navigation", nav)?;
            }
            for p in rel.foreign_key.iter().chain(rel.principal_key.iter().flatten()) {
                validate_identifier("property", p)?;
            }
        }
        Ok(out)
    }

    fn build_classes(
        pending: &[PendingType],
        relationships: &[RelationshipDef],
    ) -> Result<(Vec<ClassInfo>, HashMap<String, ClassId>)> {
        let mut classes: Vec<ClassInfo> = Vec::new();
        let mut by_name: HashMap<String, ClassId> = HashMap::new();
        let mut class_of_type: HashMap<&str, ClassId> = HashMap::new();

        for p in pending {
            let id = *by_name.entry(p.class.clone()).or_insert_with(|| {
                classes.push(ClassInfo {
                    id: ClassId(classes.len()),
                    name: p.class.clone(),
                    fields: Vec::new(),
                    navigations: Vec::new(),
                });
                ClassId(classes.len() - 1)
            });
            let class = &mut classes[id.0];
            for prop in p.properties.iter().filter(|d| !d.shadow) {
                if class.field(&prop.name).is_none() {
                    class.fields.push(prop.name.clone());
                }
            }
            class_of_type.insert(p.name.as_str(), id);
        }

        fn add_nav(
            class: &mut ClassInfo,
            name: &str,
            is_collection: bool,
            kind: CollectionKind,
        ) -> Result<()> {
            match class.navigation(name) {
                Some(i) if class.navigations[i].is_collection != is_collection => Err(Error::model(
                    ModelErrorKind::Duplicate,
                    format!(
                        "navigation '{}.{}' is declared both as a reference and a collection",
                        class.name, name
                    ),
                )),
                Some(_) => Ok(()),
                None => {
                    if class.field(name).is_some() {
                        return Err(Error::model(
                            ModelErrorKind::Duplicate,
                            format!("'{}.{}' is both a field and a navigation", class.name, name),
                        ));
                    }
                    class.navigations.push(ClassNavigation {
                        name: name.to_string(),
                        is_collection,
                        collection_kind: kind,
                    });
                    Ok(())
                }
            }
        }

        for p in pending {
            if let Some(own) = &p.ownership {
                let owner_class = class_of_type[pending[own.owner].name.as_str()];
                add_nav(
                    &mut classes[owner_class.0],
                    &own.navigation,
                    own.is_collection,
                    own.collection_kind,
                )?;
                if let Some(inv) = &own.inverse {
                    let class = class_of_type[p.name.as_str()];
                    add_nav(&mut classes[class.0], inv, false, CollectionKind::List)?;
                }
            }
        }

        for rel in relationships {
            let lookup = |name: &str| {
                class_of_type.get(name).copied().ok_or_else(|| {
                    Error::model(
                        ModelErrorKind::UnknownEntityType,
                        format!("relationship references unknown entity type '{name}'"),
                    )
                })
            };
            let principal = lookup(&rel.principal)?;
            let dependent = lookup(&rel.dependent)?;
            if let Some(nav) = &rel.principal_navigation {
                add_nav(
                    &mut classes[principal.0],
                    nav,
                    rel.kind == RelationshipKind::OneToMany,
                    rel.collection_kind,
                )?;
            }
            if let Some(nav) = &rel.dependent_navigation {
                add_nav(&mut classes[dependent.0], nav, false, CollectionKind::List)?;
            }
        }

        Ok((classes, by_name))
    }

    fn build_entity_type(
        index: usize,
        all: &[PendingType],
        class: ClassId,
        classes: &[ClassInfo],
        built: &[EntityType],
    ) -> Result<EntityType> {
        let class = &classes[class.0];
        let pending = &all[index];
        let mut properties = Vec::new();
        for (fi, field) in class.fields.iter().enumerate() {
            let mut info = PropertyInfo::new(field.clone(), PropertySlot::Field(fi));
            match pending.properties.iter().find(|d| !d.shadow && &d.name == field) {
                Some(def) => {
                    info.nullable = def.nullable;
                    info.value_generated = def.generated;
                }
                None => info.nullable = true,
            }
            properties.push(info);
        }
        let mut shadow_count = 0;
        for def in pending.properties.iter().filter(|d| d.shadow) {
            if properties.iter().any(|p: &PropertyInfo| p.name == def.name) {
                return Err(Error::model(
                    ModelErrorKind::Duplicate,
                    format!("property '{}.{}' declared twice", pending.name, def.name),
                ));
            }
            let mut info = PropertyInfo::new(def.name.clone(), PropertySlot::Shadow(shadow_count));
            info.nullable = def.nullable;
            info.value_generated = def.generated;
            properties.push(info);
            shadow_count += 1;
        }

        let mut key = Vec::new();
        if let Some(own) = &pending.ownership {
            let owner = &built[own.owner];
            for &k in &owner.key {
                let name = if all[own.owner].ownership.is_some() {
                    owner.properties[k].name.clone()
                } else {
                    format!("{}{}", classes[owner.class.0].name, owner.properties[k].name)
                };
                let idx = match properties.iter().position(|p| p.name == name) {
                    Some(idx) => idx,
                    None => {
                        properties
                            .push(PropertyInfo::new(name, PropertySlot::Shadow(shadow_count)));
                        shadow_count += 1;
                        properties.len() - 1
                    }
                };
                key.push(idx);
            }
            if own.is_collection && pending.key.is_empty() {
                return Err(Error::model(
                    ModelErrorKind::MissingKey,
                    format!("owned collection type '{}' needs an additional key", pending.name),
                ));
            }
            for name in &pending.key {
                let idx = match properties.iter().position(|p| &p.name == name) {
                    Some(idx) => idx,
                    None => {
                        let mut info =
                            PropertyInfo::new(name.clone(), PropertySlot::Shadow(shadow_count));
                        info.value_generated = true;
                        properties.push(info);
                        shadow_count += 1;
                        properties.len() - 1
                    }
                };
                key.push(idx);
            }
        } else {
            if pending.key.is_empty() {
                return Err(Error::model(
                    ModelErrorKind::MissingKey,
                    format!("entity type '{}' declares no key", pending.name),
                ));
            }
            for name in &pending.key {
                let idx = properties.iter().position(|p| &p.name == name).ok_or_else(|| {
                    Error::model(
                        ModelErrorKind::UnknownProperty,
                        format!("key property '{}.{}' is not declared", pending.name, name),
                    )
                })?;
                key.push(idx);
            }
        }
        for &k in &key {
            properties[k].is_key = true;
            properties[k].nullable = false;
        }

        Ok(EntityType {
            id: EntityTypeId(index),
            name: pending.name.clone(),
            class: class.id,
            properties,
            key,
            navigations: Vec::new(),
            foreign_keys: Vec::new(),
            referencing_keys: Vec::new(),
            ownership: None,
            shadow_count,
        })
    }

    fn ownership_properties(
        owned: &EntityType,
        owner: usize,
        built: &[EntityType],
    ) -> Result<Vec<PropertyIndex>> {
        let arity = built[owner].key.len();
        if owned.key.len() < arity {
            return Err(Error::model(
                ModelErrorKind::ForeignKeyMismatch,
                format!("owned type '{}' cannot mirror its owner's key", owned.name),
            ));
        }
        Ok(owned.key[..arity].to_vec())
    }

    fn build_foreign_key(
        id: ForeignKeyId,
        rel: &RelationshipDef,
        types_by_name: &HashMap<String, EntityTypeId>,
        classes: &[ClassInfo],
        entity_types: &mut [EntityType],
    ) -> Result<ForeignKeyInfo> {
        let find = |name: &str| {
            types_by_name.get(name).copied().ok_or_else(|| {
                Error::model(
                    ModelErrorKind::UnknownEntityType,
                    format!("relationship references unknown entity type '{name}'"),
                )
            })
        };
        let principal = find(&rel.principal)?;
        let dependent = find(&rel.dependent)?;

        let principal_key = match &rel.principal_key {
            Some(names) => names
                .iter()
                .map(|n| entity_types[principal.0].find_property(n))
                .collect::<Result<Vec<_>>>()?,
            None => entity_types[principal.0].key.clone(),
        };
        if rel.foreign_key.len() != principal_key.len() {
            return Err(Error::model(
                ModelErrorKind::ForeignKeyMismatch,
                format!(
                    "foreign key {}.({}) has {} properties but the principal key of '{}' has {}",
                    rel.dependent,
                    rel.foreign_key.join(", "),
                    rel.foreign_key.len(),
                    rel.principal,
                    principal_key.len()
                ),
            ));
        }

        let dep = &mut entity_types[dependent.0];
        let existing: Vec<&PropertyInfo> = rel
            .foreign_key
            .iter()
            .filter_map(|n| dep.property(n).map(|i| &dep.properties[i]))
            .collect();
        let required = rel.required.unwrap_or_else(|| {
            !existing.is_empty() && existing.iter().all(|p| !p.nullable)
        });

        let mut properties = Vec::with_capacity(rel.foreign_key.len());
        for name in &rel.foreign_key {
            let idx = match dep.property(name) {
                Some(idx) => idx,
                None => {
                    let mut info =
                        PropertyInfo::new(name.clone(), PropertySlot::Shadow(dep.shadow_count));
                    info.nullable = !required;
                    dep.properties.push(info);
                    dep.shadow_count += 1;
                    dep.properties.len() - 1
                }
            };
            properties.push(idx);
        }

        let principal_class = &classes[entity_types[principal.0].class.0];
        let dependent_class = &classes[entity_types[dependent.0].class.0];
        let principal_to_dependent: Option<NavigationIndex> = rel
            .principal_navigation
            .as_deref()
            .and_then(|n| principal_class.navigation(n));
        let dependent_to_principal: Option<NavigationIndex> = rel
            .dependent_navigation
            .as_deref()
            .and_then(|n| dependent_class.navigation(n));

        Ok(ForeignKeyInfo {
            id,
            principal,
            dependent,
            properties,
            principal_key,
            required,
            unique: rel.kind == RelationshipKind::OneToOne,
            delete_behavior: rel.on_delete.unwrap_or(DeleteBehavior::default_for(required)),
            ownership: false,
            dependent_to_principal,
            principal_to_dependent,
        })
    }

    fn register_navigations(
        fk: &ForeignKeyInfo,
        principal_navigation: &str,
        dependent_navigation: Option<&str>,
        collection_kind: CollectionKind,
        is_collection: bool,
        navs: &mut NavigationMap,
    ) -> Result<()> {
        let mut insert = |owner: EntityTypeId, name: &str, info: NavigationInfo| {
            if navs.insert((owner.0, name.to_string()), info).is_some() {
                return Err(Error::model(
                    ModelErrorKind::Duplicate,
                    format!("navigation '{name}' is used by two relationships on the same entity type"),
                ));
            }
            Ok(())
        };
        if fk.principal_to_dependent.is_some() {
            insert(
                fk.principal,
                principal_navigation,
                NavigationInfo {
                    name: principal_navigation.to_string(),
                    target: fk.dependent,
                    foreign_key: fk.id,
                    on_dependent: false,
                    is_collection,
                    collection_kind,
                },
            )?;
        }
        if let (Some(_), Some(name)) = (fk.dependent_to_principal, dependent_navigation) {
            insert(
                fk.dependent,
                name,
                NavigationInfo {
                    name: name.to_string(),
                    target: fk.principal,
                    foreign_key: fk.id,
                    on_dependent: true,
                    is_collection: false,
                    collection_kind: CollectionKind::List,
                },
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn category_product() -> ModelBuilder {
        ModelBuilder::new()
            .entity(
                EntityDef::new("Category")
                    .property(PropertyDef::new("Id"))
                    .key(&["Id"]),
            )
            .entity(
                EntityDef::new("Product")
                    .property(PropertyDef::new("Id"))
                    .property(PropertyDef::new("CategoryId"))
                    .key(&["Id"]),
            )
    }

    #[test]
    fn test_one_to_many_with_both_navigations() {
        let model = category_product()
            .relationship(
                RelationshipDef::one_to_many("Category", "Product")
                    .principal_navigation("Products")
                    .dependent_navigation("Category")
                    .foreign_key(&["CategoryId"]),
            )
            .build()
            .unwrap();

        let cat = model.entity_type(model.find_entity_type("Category").unwrap());
        let prod = model.entity_type(model.find_entity_type("Product").unwrap());
        assert_eq!(cat.navigations.len(), 1);
        assert!(cat.navigations[0].is_collection);
        assert!(!cat.navigations[0].on_dependent);
        assert!(prod.navigations[0].on_dependent);

        let fk = model.foreign_key(prod.foreign_keys[0]);
        assert!(fk.required);
        assert!(!fk.unique);
        assert_eq!(fk.delete_behavior, DeleteBehavior::Cascade);
        assert_eq!(fk.principal_to_dependent, Some(0));
        assert_eq!(fk.dependent_to_principal, Some(0));
        assert_eq!(cat.referencing_keys, vec![fk.id]);

        let fk_prop = prod.property("CategoryId").unwrap();
        assert_eq!(prod.properties[fk_prop].foreign_keys, vec![fk.id]);
        assert!(prod.properties[fk_prop].slot.is_field());
    }

    #[test]
    fn test_shadow_foreign_key_is_optional_by_default() {
        let model = ModelBuilder::new()
            .entity(EntityDef::new("Blog").property(PropertyDef::new("Id")).key(&["Id"]))
            .entity(EntityDef::new("Post").property(PropertyDef::new("Id")).key(&["Id"]))
            .relationship(
                RelationshipDef::one_to_many("Blog", "Post")
                    .principal_navigation("Posts")
                    .foreign_key(&["BlogId"]),
            )
            .build()
            .unwrap();
        let post = model.entity_type(model.find_entity_type("Post").unwrap());
        let idx = post.property("BlogId").unwrap();
        assert_eq!(post.properties[idx].slot, PropertySlot::Shadow(0));
        assert!(post.properties[idx].nullable);
        assert_eq!(post.shadow_count, 1);
        let fk = model.foreign_key(post.foreign_keys[0]);
        assert!(!fk.required);
        assert_eq!(fk.delete_behavior, DeleteBehavior::ClientSetNull);
        assert_eq!(fk.dependent_to_principal, None);
    }

    #[test]
    fn test_owned_types_share_a_class() {
        let model = ModelBuilder::new()
            .entity(
                EntityDef::new("Parent")
                    .property(PropertyDef::new("Id"))
                    .key(&["Id"])
                    .owns(
                        OwnedDef::reference("Child1", "Child")
                            .inverse("Parent")
                            .property(PropertyDef::new("Name").nullable())
                            .owns(OwnedDef::reference("SubChild", "SubChild").inverse("Parent")),
                    )
                    .owns(
                        OwnedDef::reference("Child2", "Child")
                            .inverse("Parent")
                            .property(PropertyDef::new("Name").nullable())
                            .owns(OwnedDef::reference("SubChild", "SubChild").inverse("Parent")),
                    ),
            )
            .build()
            .unwrap();

        let child_class = model.find_class("Child").unwrap();
        assert_eq!(model.entity_types_of_class(child_class).len(), 2);
        assert_eq!(model.root_type_of_class(child_class), None);

        let child1 = model.entity_type(model.find_entity_type("Parent.Child1#Child").unwrap());
        let key = &child1.properties[child1.key[0]];
        assert_eq!(key.name, "ParentId");
        assert!(key.slot.is_shadow());

        let sub = model.entity_type(
            model
                .find_entity_type("Parent.Child1#Child.SubChild#SubChild")
                .unwrap(),
        );
        assert_eq!(sub.properties[sub.key[0]].name, "ParentId");
        let fk = model.foreign_key(sub.ownership.unwrap());
        assert!(fk.ownership && fk.unique && fk.required);
    }

    #[test]
    fn test_owned_collection_key() {
        let model = ModelBuilder::new()
            .entity(
                EntityDef::new("Order")
                    .property(PropertyDef::new("Id"))
                    .key(&["Id"])
                    .owns(OwnedDef::collection("Lines", "OrderLine").key(&["Id"])),
            )
            .build()
            .unwrap();
        let lines = model.entity_type(model.find_entity_type("Order.Lines#OrderLine").unwrap());
        assert_eq!(lines.key.len(), 2);
        assert_eq!(lines.properties[lines.key[0]].name, "OrderId");
        assert!(lines.properties[lines.key[1]].value_generated);
        let fk = model.foreign_key(lines.ownership.unwrap());
        assert!(!fk.unique);
    }

    #[test]
    fn test_foreign_key_arity_mismatch() {
        let err = category_product()
            .relationship(
                RelationshipDef::one_to_many("Category", "Product")
                    .foreign_key(&["CategoryId", "Other"]),
            )
            .build()
            .unwrap_err();
        assert_eq!(err.model_kind(), Some(ModelErrorKind::ForeignKeyMismatch));
    }

    #[test]
    fn test_missing_key_and_bad_names() {
        let err = ModelBuilder::new()
            .entity(EntityDef::new("Keyless").property(PropertyDef::new("Name")))
            .build()
            .unwrap_err();
        assert_eq!(err.model_kind(), Some(ModelErrorKind::MissingKey));

        let err = ModelBuilder::new()
            .entity(EntityDef::new("Bad-Name").property(PropertyDef::new("Id")).key(&["Id"]))
            .build()
            .unwrap_err();
        assert_eq!(err.model_kind(), Some(ModelErrorKind::InvalidName));
    }

    #[test]
    fn test_unknown_entity_in_relationship() {
        let err = category_product()
            .relationship(RelationshipDef::one_to_many("Category", "Nope").foreign_key(&["X"]))
            .build()
            .unwrap_err();
        assert_eq!(err.model_kind(), Some(ModelErrorKind::UnknownEntityType));
    }

    #[test]
    fn test_shared_class_must_map_every_navigation() {
        let err = ModelBuilder::new()
            .entity(
                EntityDef::new("Parent")
                    .property(PropertyDef::new("Id"))
                    .key(&["Id"])
                    .owns(
                        OwnedDef::reference("Child1", "Child")
                            .owns(OwnedDef::reference("SubChild", "SubChild")),
                    )
                    .owns(OwnedDef::reference("Child2", "Child")),
            )
            .build()
            .unwrap_err();
        assert_eq!(err.model_kind(), Some(ModelErrorKind::UnknownNavigation));
    }

    #[test]
    fn test_one_to_one_is_unique() {
        let model = ModelBuilder::new()
            .entity(EntityDef::new("Parent").property(PropertyDef::new("Id")).key(&["Id"]))
            .entity(
                EntityDef::new("Child")
                    .property(PropertyDef::new("Id"))
                    .property(PropertyDef::new("ParentId").nullable())
                    .key(&["Id"]),
            )
            .relationship(
                RelationshipDef::one_to_one("Parent", "Child")
                    .principal_navigation("Child")
                    .dependent_navigation("Parent")
                    .foreign_key(&["ParentId"])
                    .on_delete(DeleteBehavior::SetNull),
            )
            .build()
            .unwrap();
        let parent = model.entity_type(model.find_entity_type("Parent").unwrap());
        assert!(!parent.navigations[0].is_collection);
        let fk = model.foreign_key(parent.referencing_keys[0]);
        assert!(fk.unique);
        assert!(!fk.required);
        assert_eq!(fk.delete_behavior, DeleteBehavior::SetNull);
    }
}
