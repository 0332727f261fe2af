//! Entity records.
//!
//! An [`Entity`] is a dynamically-typed record: the entity type name plus a
//! map of property values. Relations never own the entities they point to;
//! they hold [`EntityId`]s handed out by the identity map, and they are
//! tri-state so an unloaded relation is never mistaken for an empty one.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Stable arena id of a managed entity, valid for the lifetime of one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Load state of a relation value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Relation<T> {
    /// Never fetched; contents unknown.
    #[default]
    Unloaded,
    /// A fetch is in flight.
    Loading,
    /// Fetched or assigned by the caller.
    Loaded(T),
}

impl<T> Relation<T> {
    pub const fn is_loaded(&self) -> bool {
        matches!(self, Relation::Loaded(_))
    }

    /// The loaded value, if any.
    pub fn loaded(&self) -> Option<&T> {
        match self {
            Relation::Loaded(v) => Some(v),
            _ => None,
        }
    }

    pub fn loaded_mut(&mut self) -> Option<&mut T> {
        match self {
            Relation::Loaded(v) => Some(v),
            _ => None,
        }
    }
}

/// Value held by one property of an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// Scalar or embedded value.
    Scalar(Value),
    /// Single-valued relation (many-to-one).
    Reference(Relation<Option<EntityId>>),
    /// Collection relation (one-to-many, many-to-many).
    Collection(Relation<Vec<EntityId>>),
}

impl PropertyValue {
    /// Entities referenced by a loaded relation value.
    pub fn referenced_ids(&self) -> Vec<EntityId> {
        match self {
            PropertyValue::Reference(Relation::Loaded(Some(id))) => vec![*id],
            PropertyValue::Collection(Relation::Loaded(ids)) => ids.clone(),
            _ => Vec::new(),
        }
    }

    /// Forget `target` in a loaded relation value.
    ///
    /// A reference to it becomes unloaded; a collection drops it. Returns
    /// whether anything changed.
    pub fn drop_target(&mut self, target: EntityId) -> bool {
        match self {
            PropertyValue::Reference(relation) if *relation == Relation::Loaded(Some(target)) => {
                *relation = Relation::Unloaded;
                true
            }
            PropertyValue::Collection(Relation::Loaded(ids)) => {
                let before = ids.len();
                ids.retain(|id| *id != target);
                ids.len() != before
            }
            _ => false,
        }
    }

    /// Is this an unloaded or loading relation?
    pub fn is_unloaded(&self) -> bool {
        match self {
            PropertyValue::Scalar(_) => false,
            PropertyValue::Reference(r) => !r.is_loaded(),
            PropertyValue::Collection(r) => !r.is_loaded(),
        }
    }
}

/// A dynamically-typed entity record.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    entity_type: &'static str,
    values: BTreeMap<&'static str, PropertyValue>,
}

impl Entity {
    pub fn new(entity_type: &'static str) -> Self {
        Self {
            entity_type,
            values: BTreeMap::new(),
        }
    }

    pub fn entity_type(&self) -> &'static str {
        self.entity_type
    }

    /// Builder form of [`Entity::set`].
    #[must_use]
    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Builder form of [`Entity::set_reference`].
    #[must_use]
    pub fn with_reference(mut self, name: &'static str, target: Option<EntityId>) -> Self {
        self.set_reference(name, target);
        self
    }

    /// Builder form of [`Entity::set_collection`].
    #[must_use]
    pub fn with_collection(mut self, name: &'static str, targets: Vec<EntityId>) -> Self {
        self.set_collection(name, targets);
        self
    }

    pub fn set(&mut self, name: &'static str, value: impl Into<Value>) {
        self.values
            .insert(name, PropertyValue::Scalar(value.into()));
    }

    pub fn set_reference(&mut self, name: &'static str, target: Option<EntityId>) {
        self.values
            .insert(name, PropertyValue::Reference(Relation::Loaded(target)));
    }

    pub fn set_collection(&mut self, name: &'static str, targets: Vec<EntityId>) {
        self.values
            .insert(name, PropertyValue::Collection(Relation::Loaded(targets)));
    }

    /// Append to a loaded collection. Returns false if the collection is not loaded.
    pub fn add_to_collection(&mut self, name: &'static str, target: EntityId) -> bool {
        let slot = self
            .values
            .entry(name)
            .or_insert_with(|| PropertyValue::Collection(Relation::Loaded(Vec::new())));
        match slot {
            PropertyValue::Collection(Relation::Loaded(ids)) => {
                if !ids.contains(&target) {
                    ids.push(target);
                }
                true
            }
            _ => false,
        }
    }

    pub fn set_property(&mut self, name: &'static str, value: PropertyValue) {
        self.values.insert(name, value);
    }

    pub fn unset(&mut self, name: &str) -> Option<PropertyValue> {
        self.values.remove(name)
    }

    /// Scalar value of `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(PropertyValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    /// Target of a loaded single relation. `None` when absent or unloaded.
    pub fn reference(&self, name: &str) -> Option<Option<EntityId>> {
        match self.values.get(name) {
            Some(PropertyValue::Reference(Relation::Loaded(target))) => Some(*target),
            _ => None,
        }
    }

    /// Members of a loaded collection relation.
    pub fn collection(&self, name: &str) -> Option<&[EntityId]> {
        match self.values.get(name) {
            Some(PropertyValue::Collection(Relation::Loaded(ids))) => Some(ids),
            _ => None,
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    pub fn property_mut(&mut self, name: &str) -> Option<&mut PropertyValue> {
        self.values.get_mut(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&'static str, &PropertyValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    /// Forget `target` in every loaded relation of this entity.
    pub fn drop_target(&mut self, target: EntityId) -> bool {
        let mut changed = false;
        for value in self.values.values_mut() {
            changed |= value.drop_target(target);
        }
        changed
    }

    /// Copy of all property values, used for snapshots.
    pub fn clone_values(&self) -> BTreeMap<&'static str, PropertyValue> {
        self.values.clone()
    }
}

/// Externally-sourced value of one field, as handed to `merge`.
///
/// Relations are described by the target's primary key values since the
/// source (a store row, a loader) knows keys, not arena ids.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldData {
    Value(Value),
    /// Many-to-one target key, or `None` for a null foreign key.
    Reference(Option<Vec<Value>>),
    /// Collection member keys.
    Collection(Vec<Vec<Value>>),
    /// Relation present in the model but not fetched.
    Unloaded,
}

/// A row of externally-sourced entity data.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityData {
    pub entity_type: &'static str,
    pub key: Vec<Value>,
    pub fields: Vec<(&'static str, FieldData)>,
}

impl EntityData {
    pub fn new(entity_type: &'static str, key: Vec<Value>) -> Self {
        Self {
            entity_type,
            key,
            fields: Vec::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.fields.push((name, FieldData::Value(value.into())));
        self
    }

    #[must_use]
    pub fn reference(mut self, name: &'static str, key: Option<Vec<Value>>) -> Self {
        self.fields.push((name, FieldData::Reference(key)));
        self
    }

    #[must_use]
    pub fn collection(mut self, name: &'static str, keys: Vec<Vec<Value>>) -> Self {
        self.fields.push((name, FieldData::Collection(keys)));
        self
    }

    #[must_use]
    pub fn unloaded(mut self, name: &'static str) -> Self {
        self.fields.push((name, FieldData::Unloaded));
        self
    }
}
