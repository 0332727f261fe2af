//! Change-set computation and dirty detection.
//!
//! A managed entity's current values are diffed against its last-known
//! persisted [`Snapshot`](crate::identity_map::Snapshot):
//!
//! - no snapshot: CREATE with every persisted property that is set
//! - snapshot and marked for removal: DELETE
//! - snapshot with differences: UPDATE with only the changed properties
//!
//! Computing a change set never mutates the snapshot, so calling it twice
//! without touching the entity yields the same answer.

use std::collections::{BTreeMap, BTreeSet};

use persistgraph_core::{
    Entity, EntityId, EntityMetadata, EntityProperty, Error, MetadataRegistry, Operation,
    PropertyValue, ReferenceKind, Relation, Result, ValidationError, ValidationErrorKind, Value,
};

use crate::identity_map::{ManagedEntity, Snapshot, key_values};

/// New value of one changed property.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeValue {
    Value(Value),
    Reference(Option<EntityId>),
    Collection(Vec<EntityId>),
}

impl ChangeValue {
    /// Entities this value points at.
    pub fn referenced_ids(&self) -> &[EntityId] {
        match self {
            ChangeValue::Value(_) => &[],
            ChangeValue::Reference(target) => target.as_slice(),
            ChangeValue::Collection(ids) => ids,
        }
    }

    fn from_property(value: &PropertyValue) -> Option<Self> {
        match value {
            PropertyValue::Scalar(v) => Some(ChangeValue::Value(v.clone())),
            PropertyValue::Reference(Relation::Loaded(t)) => Some(ChangeValue::Reference(*t)),
            PropertyValue::Collection(Relation::Loaded(ids)) => {
                Some(ChangeValue::Collection(ids.clone()))
            }
            _ => None,
        }
    }

    /// Equivalent property value, used to refresh snapshots after a commit.
    pub fn to_property(&self) -> PropertyValue {
        match self {
            ChangeValue::Value(v) => PropertyValue::Scalar(v.clone()),
            ChangeValue::Reference(t) => PropertyValue::Reference(Relation::Loaded(*t)),
            ChangeValue::Collection(ids) => {
                PropertyValue::Collection(Relation::Loaded(ids.clone()))
            }
        }
    }
}

/// The write one entity needs in this flush.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub entity: EntityId,
    pub entity_type: &'static str,
    pub operation: Operation,
    /// Changed property -> new value. Empty for DELETE.
    pub changes: BTreeMap<&'static str, ChangeValue>,
    /// Known primary key; absent for creates awaiting a generated key.
    pub primary_key: Option<Vec<Value>>,
    /// Version last read from the store.
    pub original_version: Option<Value>,
}

impl ChangeSet {
    pub fn get(&self, property: &str) -> Option<&ChangeValue> {
        self.changes.get(property)
    }

    /// `(property, target)` pairs for every relation value in the change set.
    pub fn references(&self) -> impl Iterator<Item = (&'static str, EntityId)> + '_ {
        self.changes
            .iter()
            .flat_map(|(name, value)| value.referenced_ids().iter().map(move |id| (*name, *id)))
    }
}

/// Computes [`ChangeSet`]s for managed entities.
#[derive(Debug, Clone, Copy)]
pub struct ChangeSetComputer<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> ChangeSetComputer<'a> {
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Compute the change set for `managed`, or `None` when nothing needs writing.
    #[tracing::instrument(level = "trace", skip(self, managed), fields(id = %managed.id()))]
    pub fn compute(&self, managed: &ManagedEntity, removal: bool) -> Result<Option<ChangeSet>> {
        let meta = self.registry.get_metadata(managed.entity_type)?;
        let entity = managed.entity.read();

        let change_set = match (&managed.snapshot, removal) {
            (None, true) => None,
            (Some(snapshot), true) => Some(Self::delete(meta, managed, snapshot)?),
            (None, false) => Some(Self::create(meta, managed, &entity)?),
            (Some(snapshot), false) => Self::update(meta, managed, &entity, snapshot)?,
        };

        if let Some(cs) = &change_set {
            tracing::trace!(
                entity_type = cs.entity_type,
                operation = %cs.operation,
                changed = cs.changes.len(),
                "Computed change set"
            );
        }
        Ok(change_set)
    }

    /// Does `managed` differ from its snapshot (or is it new)?
    pub fn is_dirty(&self, managed: &ManagedEntity) -> Result<bool> {
        Ok(self.compute(managed, false)?.is_some())
    }

    fn create(meta: &EntityMetadata, managed: &ManagedEntity, entity: &Entity) -> Result<ChangeSet> {
        check_shapes(meta, entity)?;

        let mut changes = BTreeMap::new();
        for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
            if let Some(value) = entity.property(prop.name).and_then(ChangeValue::from_property) {
                changes.insert(prop.name, value);
            }
        }

        for pk in &meta.primary_key {
            let generated = meta.get_property(pk).is_some_and(|p| p.generated);
            let present = matches!(changes.get(pk), Some(ChangeValue::Value(v)) if !v.is_null());
            if !present && !generated {
                return Err(ValidationError::new(
                    ValidationErrorKind::MissingPrimaryKey,
                    "primary key is not set",
                )
                .for_entity(meta.name)
                .for_property(*pk)
                .into());
            }
            if !present {
                changes.remove(pk);
            }
        }

        for prop in required_references(meta) {
            if !matches!(changes.get(prop.name), Some(ChangeValue::Reference(Some(_)))) {
                return Err(missing_relation(meta, prop));
            }
        }

        if let Some(version) = meta.version_property {
            let unset = entity.get(version).is_none_or(Value::is_null);
            if unset {
                changes.insert(version, ChangeValue::Value(Value::Int(1)));
            }
        }

        Ok(ChangeSet {
            entity: managed.id(),
            entity_type: meta.name,
            operation: Operation::Create,
            changes,
            primary_key: key_values(meta, entity),
            original_version: None,
        })
    }

    fn update(
        meta: &EntityMetadata,
        managed: &ManagedEntity,
        entity: &Entity,
        snapshot: &Snapshot,
    ) -> Result<Option<ChangeSet>> {
        check_shapes(meta, entity)?;

        let mut changes = BTreeMap::new();
        for prop in meta.properties.iter().filter(|p| p.is_persisted()) {
            if meta.version_property == Some(prop.name) {
                continue;
            }
            let Some(current) = entity.property(prop.name) else {
                continue;
            };
            if current.is_unloaded() || !differs(prop, current, snapshot.get(prop.name)) {
                continue;
            }
            if meta.is_primary_key(prop.name) {
                return Err(ValidationError::new(
                    ValidationErrorKind::PrimaryKeyChanged,
                    "primary key of a persisted entity cannot change",
                )
                .for_entity(meta.name)
                .for_property(prop.name)
                .into());
            }
            if let Some(value) = ChangeValue::from_property(current) {
                changes.insert(prop.name, value);
            }
        }

        for prop in required_references(meta) {
            if entity.reference(prop.name) == Some(None) {
                return Err(missing_relation(meta, prop));
            }
        }

        if changes.is_empty() {
            return Ok(None);
        }

        let original_version = meta
            .version_property
            .and_then(|v| snapshot.scalar(v))
            .cloned();
        if let (Some(version), Some(next)) = (
            meta.version_property,
            original_version.as_ref().and_then(Value::next_version),
        ) {
            changes.insert(version, ChangeValue::Value(next));
        }

        Ok(Some(ChangeSet {
            entity: managed.id(),
            entity_type: meta.name,
            operation: Operation::Update,
            changes,
            primary_key: Some(require_key(meta, managed)?),
            original_version,
        }))
    }

    fn delete(
        meta: &EntityMetadata,
        managed: &ManagedEntity,
        snapshot: &Snapshot,
    ) -> Result<ChangeSet> {
        Ok(ChangeSet {
            entity: managed.id(),
            entity_type: meta.name,
            operation: Operation::Delete,
            changes: BTreeMap::new(),
            primary_key: Some(require_key(meta, managed)?),
            original_version: meta
                .version_property
                .and_then(|v| snapshot.scalar(v))
                .cloned(),
        })
    }
}

fn require_key(meta: &EntityMetadata, managed: &ManagedEntity) -> Result<Vec<Value>> {
    managed.key_values.clone().ok_or_else(|| {
        ValidationError::new(
            ValidationErrorKind::MissingPrimaryKey,
            "persisted entity has no primary key",
        )
        .for_entity(meta.name)
        .into()
    })
}

fn required_references(meta: &EntityMetadata) -> impl Iterator<Item = &EntityProperty> {
    meta.properties
        .iter()
        .filter(|p| p.kind == ReferenceKind::ManyToOne && p.owner && !p.nullable)
}

fn missing_relation(meta: &EntityMetadata, prop: &EntityProperty) -> Error {
    ValidationError::new(
        ValidationErrorKind::MissingRequiredRelation,
        format!(
            "required relation to {} is not set",
            prop.target.unwrap_or("?")
        ),
    )
    .for_entity(meta.name)
    .for_property(prop.name)
    .into()
}

/// Every property value must be declared and match its declared kind.
fn check_shapes(meta: &EntityMetadata, entity: &Entity) -> Result<()> {
    for (name, value) in entity.properties() {
        let prop = meta.require_property(name)?;
        let ok = match prop.kind {
            ReferenceKind::Scalar | ReferenceKind::Embedded => {
                matches!(value, PropertyValue::Scalar(_))
            }
            ReferenceKind::ManyToOne => matches!(value, PropertyValue::Reference(_)),
            ReferenceKind::OneToMany | ReferenceKind::ManyToMany => {
                matches!(value, PropertyValue::Collection(_))
            }
        };
        if !ok {
            return Err(ValidationError::new(
                ValidationErrorKind::PropertyShape,
                format!("value does not match a {:?} property", prop.kind),
            )
            .for_entity(meta.name)
            .for_property(prop.name)
            .into());
        }
    }
    Ok(())
}

/// Has a loaded property value moved away from its snapshot?
fn differs(prop: &EntityProperty, current: &PropertyValue, previous: Option<&PropertyValue>) -> bool {
    match (current, previous) {
        (PropertyValue::Scalar(a), Some(PropertyValue::Scalar(b))) => a != b,
        (
            PropertyValue::Reference(Relation::Loaded(a)),
            Some(PropertyValue::Reference(Relation::Loaded(b))),
        ) => a != b,
        (
            PropertyValue::Collection(Relation::Loaded(a)),
            Some(PropertyValue::Collection(Relation::Loaded(b))),
        ) => {
            if prop.ordered {
                a != b
            } else {
                a.iter().collect::<BTreeSet<_>>() != b.iter().collect::<BTreeSet<_>>()
            }
        }
        _ => true,
    }
}
