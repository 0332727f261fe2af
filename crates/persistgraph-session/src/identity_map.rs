//! Identity Map pattern for tracking unique entity instances per primary key.
//!
//! The Identity Map ensures that each stored row corresponds to exactly one
//! entity instance within a unit of work. This provides:
//!
//! - **Uniqueness**: Same (type, key) always returns the same instance
//! - **Consistency**: Changes to an entity are visible everywhere it's used
//! - **Stable ids**: Every registered entity gets an [`EntityId`] that survives
//!   key assignment, so relations can point at entities that have no key yet
//!
//! # Design
//!
//! Storage is an arena keyed by `EntityId`, plus a `(type, IdentityKey)` index
//! for entities whose full primary key is known. Each instance lives behind an
//! `Arc<RwLock<Entity>>`; two lookups of the same key hand out clones of the
//! same `Arc`.
//!
//! # Example
//!
//! ```ignore
//! let mut map = IdentityMap::new(registry);
//! let author = map.merge("Author", &[Value::BigInt(1)], fields)?;
//! let again = map.lookup("Author", &[Value::BigInt(1)])?.unwrap();
//! assert!(EntityRef::ptr_eq(&author, &again));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use persistgraph_core::{
    Entity, EntityId, EntityMetadata, Error, FieldData, KEY_SEPARATOR, MetadataRegistry,
    NotFoundError, PropertyValue, ReferenceKind, Relation, Result, ValidationError,
    ValidationErrorKind, Value,
};

// ============================================================================
// Entity references
// ============================================================================

/// Shared handle to a managed entity instance.
#[derive(Clone)]
pub struct EntityRef {
    id: EntityId,
    inner: Arc<RwLock<Entity>>,
}

impl EntityRef {
    fn new(id: EntityId, entity: Entity) -> Self {
        Self {
            id,
            inner: Arc::new(RwLock::new(entity)),
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Read access; a poisoned lock is recovered.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Do both handles point at the same instance?
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn entity_type(&self) -> &'static str {
        self.read().entity_type()
    }

    /// Scalar value of `name`, cloned out of the lock.
    pub fn get(&self, name: &str) -> Option<Value> {
        self.read().get(name).cloned()
    }

    pub fn set(&self, name: &'static str, value: impl Into<Value>) {
        self.write().set(name, value);
    }

    pub fn reference(&self, name: &str) -> Option<Option<EntityId>> {
        self.read().reference(name)
    }

    pub fn set_reference(&self, name: &'static str, target: Option<EntityId>) {
        self.write().set_reference(name, target);
    }

    pub fn collection(&self, name: &str) -> Option<Vec<EntityId>> {
        self.read().collection(name).map(<[EntityId]>::to_vec)
    }

    pub fn set_collection(&self, name: &'static str, targets: Vec<EntityId>) {
        self.write().set_collection(name, targets);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRef")
            .field("id", &self.id)
            .field("entity", &*self.read())
            .finish()
    }
}

// ============================================================================
// Identity keys
// ============================================================================

/// Serialized primary key of one entity, unique per type within a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Join the ordered key parts with [`KEY_SEPARATOR`].
    pub fn from_values(parts: &[Value]) -> Result<Self> {
        if parts.is_empty() {
            return Err(Error::validation(
                ValidationErrorKind::KeyEncoding,
                "identity key needs at least one part",
            ));
        }
        let texts = parts
            .iter()
            .map(Value::key_text)
            .collect::<Result<Vec<_>>>()?;
        // A part touching the separator with its own '~' would blur the
        // boundary: ["a~", "b"] and ["a", "~b"] both join to "a~~~~b".
        if texts.len() > 1 {
            if let Some(text) = texts.iter().find(|t| t.starts_with('~') || t.ends_with('~')) {
                return Err(Error::validation(
                    ValidationErrorKind::KeyEncoding,
                    format!("composite key part '{text}' cannot start or end with '~'"),
                ));
            }
        }
        Ok(Self(texts.join(KEY_SEPARATOR)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Primary key values of `entity`, or `None` while any part is missing or NULL.
pub fn key_values(meta: &EntityMetadata, entity: &Entity) -> Option<Vec<Value>> {
    meta.primary_key
        .iter()
        .map(|name| match entity.get(name) {
            Some(v) if !v.is_null() => Some(v.clone()),
            _ => None,
        })
        .collect()
}

// ============================================================================
// Managed entities and snapshots
// ============================================================================

/// Last-known persisted property values of an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub values: BTreeMap<&'static str, PropertyValue>,
    pub taken_at: Instant,
}

impl Snapshot {
    pub fn of(entity: &Entity) -> Self {
        Self {
            values: entity.clone_values(),
            taken_at: Instant::now(),
        }
    }

    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
            taken_at: Instant::now(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.values.get(name)
    }

    /// Scalar value recorded for `name`.
    pub fn scalar(&self, name: &str) -> Option<&Value> {
        match self.values.get(name) {
            Some(PropertyValue::Scalar(v)) => Some(v),
            _ => None,
        }
    }
}

/// Bookkeeping for one entity instance.
#[derive(Debug, Clone)]
pub struct ManagedEntity {
    pub entity: EntityRef,
    pub entity_type: &'static str,
    /// Known once every primary key part is set.
    pub key: Option<IdentityKey>,
    pub key_values: Option<Vec<Value>>,
    /// Absent for entities that were never written.
    pub snapshot: Option<Snapshot>,
    /// False for reference stubs carrying only a key.
    pub initialized: bool,
}

impl ManagedEntity {
    pub fn id(&self) -> EntityId {
        self.entity.id()
    }

    /// Was this entity never written to the store?
    pub fn is_new(&self) -> bool {
        self.snapshot.is_none()
    }
}

// ============================================================================
// Identity map
// ============================================================================

/// Deduplicating arena of managed entities.
#[derive(Debug)]
pub struct IdentityMap {
    registry: Arc<MetadataRegistry>,
    next_id: u64,
    entries: BTreeMap<EntityId, ManagedEntity>,
    index: HashMap<(&'static str, IdentityKey), EntityId>,
}

impl IdentityMap {
    pub fn new(registry: Arc<MetadataRegistry>) -> Self {
        Self {
            registry,
            next_id: 1,
            entries: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<MetadataRegistry> {
        &self.registry
    }

    fn allocate(&mut self) -> EntityId {
        let id = EntityId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Register an entity instance.
    ///
    /// If the entity's full key is already managed, the existing instance is
    /// returned and `entity` is dropped.
    pub fn register(&mut self, entity: Entity) -> Result<EntityRef> {
        let meta = self.registry.get_metadata(entity.entity_type())?;
        let entity_type = meta.name;
        let key_values = key_values(meta, &entity);
        let key = key_values
            .as_deref()
            .map(IdentityKey::from_values)
            .transpose()?;

        if let Some(key) = &key {
            if let Some(&existing) = self.index.get(&(entity_type, key.clone())) {
                tracing::trace!(entity_type, key = %key, "Entity already managed");
                if let Some(managed) = self.entries.get(&existing) {
                    return Ok(managed.entity.clone());
                }
            }
        }

        let id = self.allocate();
        let entity = EntityRef::new(id, entity);
        if let Some(key) = &key {
            self.index.insert((entity_type, key.clone()), id);
        }
        self.entries.insert(
            id,
            ManagedEntity {
                entity: entity.clone(),
                entity_type,
                key,
                key_values,
                snapshot: None,
                initialized: true,
            },
        );
        tracing::trace!(entity_type, id = %id, "Registered entity");
        Ok(entity)
    }

    /// Find the managed instance for `(entity_type, key)`.
    pub fn lookup(&self, entity_type: &str, key: &[Value]) -> Result<Option<EntityRef>> {
        let meta = self.registry.get_metadata(entity_type)?;
        let key = IdentityKey::from_values(key)?;
        Ok(self
            .index
            .get(&(meta.name, key))
            .and_then(|id| self.entries.get(id))
            .map(|m| m.entity.clone()))
    }

    pub fn get(&self, id: EntityId) -> Option<EntityRef> {
        self.entries.get(&id).map(|m| m.entity.clone())
    }

    /// Like [`IdentityMap::get`], failing with `NotFoundError`.
    pub fn require(&self, id: EntityId) -> Result<&ManagedEntity> {
        self.entries
            .get(&id)
            .ok_or_else(|| NotFoundError::entity(id).into())
    }

    pub fn managed(&self, id: EntityId) -> Option<&ManagedEntity> {
        self.entries.get(&id)
    }

    pub fn managed_mut(&mut self, id: EntityId) -> Option<&mut ManagedEntity> {
        self.entries.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Stop managing an entity.
    pub fn remove(&mut self, id: EntityId) -> Option<ManagedEntity> {
        let managed = self.entries.remove(&id)?;
        if let Some(key) = &managed.key {
            self.index.remove(&(managed.entity_type, key.clone()));
        }
        tracing::trace!(entity_type = managed.entity_type, id = %id, "Removed entity");
        Some(managed)
    }

    /// Stop managing an entity and drop it from every loaded relation that
    /// still points at it.
    ///
    /// Live values and snapshots are cleaned alike, so the cleanup never
    /// shows up as a change. References to it become unloaded.
    pub fn forget(&mut self, id: EntityId) -> Option<ManagedEntity> {
        let removed = self.remove(id)?;
        for managed in self.entries.values_mut() {
            let live = managed.entity.write().drop_target(id);
            let recorded = managed.snapshot.as_mut().is_some_and(|snapshot| {
                snapshot
                    .values
                    .values_mut()
                    .fold(false, |changed, value| value.drop_target(id) | changed)
            });
            if live || recorded {
                tracing::trace!(from = %managed.id(), to = %id, "Dropped relation to forgotten entity");
            }
        }
        Some(removed)
    }

    /// Return the managed instance for a key, or an uninitialized stub.
    pub fn reference(&mut self, entity_type: &str, key: &[Value]) -> Result<EntityRef> {
        if let Some(existing) = self.lookup(entity_type, key)? {
            return Ok(existing);
        }
        let meta = self.registry.get_metadata(entity_type)?;
        let entity = stub_entity(meta, key)?;
        let entity_type = meta.name;
        let identity = IdentityKey::from_values(key)?;

        let id = self.allocate();
        let snapshot = Snapshot::of(&entity);
        let entity = EntityRef::new(id, entity);
        self.index.insert((entity_type, identity.clone()), id);
        self.entries.insert(
            id,
            ManagedEntity {
                entity: entity.clone(),
                entity_type,
                key: Some(identity),
                key_values: Some(key.to_vec()),
                snapshot: Some(snapshot),
                initialized: false,
            },
        );
        tracing::trace!(entity_type, id = %id, "Created reference stub");
        Ok(entity)
    }

    /// Apply externally-sourced field values to the instance for `key`.
    ///
    /// Creates the instance when absent and refreshes its snapshot for the
    /// merged fields, so merged values never show up as changes.
    #[tracing::instrument(level = "trace", skip(self, key, fields))]
    pub fn merge(
        &mut self,
        entity_type: &str,
        key: &[Value],
        fields: Vec<(&'static str, FieldData)>,
    ) -> Result<EntityRef> {
        let registry = Arc::clone(&self.registry);
        let meta = registry.get_metadata(entity_type)?;
        if key.len() != meta.primary_key.len() {
            return Err(ValidationError::new(
                ValidationErrorKind::KeyEncoding,
                format!(
                    "expected {} primary key part(s), got {}",
                    meta.primary_key.len(),
                    key.len()
                ),
            )
            .for_entity(meta.name)
            .into());
        }

        let mut resolved = Vec::with_capacity(fields.len() + key.len());
        for (name, pk) in meta.primary_key.iter().zip(key) {
            resolved.push((*name, PropertyValue::Scalar(pk.clone())));
        }
        for (name, data) in fields {
            let value = self.resolve_field(meta, name, data)?;
            resolved.push((name, value));
        }

        let entity = self.reference(meta.name, key)?;
        {
            let mut guard = entity.write();
            for (name, value) in &resolved {
                guard.set_property(name, value.clone());
            }
        }

        if let Some(managed) = self.entries.get_mut(&entity.id()) {
            let snapshot = managed.snapshot.get_or_insert_with(Snapshot::empty);
            for (name, value) in resolved {
                snapshot.values.insert(name, value);
            }
            snapshot.taken_at = Instant::now();
            managed.initialized = true;
            if managed.key.is_none() {
                managed.key = Some(IdentityKey::from_values(key)?);
                managed.key_values = Some(key.to_vec());
            }
        }
        Ok(entity)
    }

    fn resolve_field(
        &mut self,
        meta: &EntityMetadata,
        name: &'static str,
        data: FieldData,
    ) -> Result<PropertyValue> {
        let prop = *meta.require_property(name)?;
        let shape_error = |expected: &str| -> Error {
            ValidationError::new(
                ValidationErrorKind::PropertyShape,
                format!("expected {expected} data"),
            )
            .for_entity(meta.name)
            .for_property(name)
            .into()
        };
        let target = prop.target.unwrap_or_default();

        match (prop.kind, data) {
            (ReferenceKind::Scalar | ReferenceKind::Embedded, FieldData::Value(v)) => {
                Ok(PropertyValue::Scalar(v))
            }
            (ReferenceKind::Scalar | ReferenceKind::Embedded, _) => Err(shape_error("scalar")),
            (ReferenceKind::ManyToOne, FieldData::Reference(None)) => {
                Ok(PropertyValue::Reference(Relation::Loaded(None)))
            }
            (ReferenceKind::ManyToOne, FieldData::Reference(Some(target_key))) => {
                let target = self.reference(target, &target_key)?;
                Ok(PropertyValue::Reference(Relation::Loaded(Some(target.id()))))
            }
            (ReferenceKind::ManyToOne, FieldData::Unloaded) => {
                Ok(PropertyValue::Reference(Relation::Unloaded))
            }
            (ReferenceKind::ManyToOne, _) => Err(shape_error("reference")),
            (ReferenceKind::OneToMany | ReferenceKind::ManyToMany, FieldData::Collection(keys)) => {
                let ids = keys
                    .iter()
                    .map(|k| self.reference(target, k).map(|e| e.id()))
                    .collect::<Result<Vec<_>>>()?;
                Ok(PropertyValue::Collection(Relation::Loaded(ids)))
            }
            (ReferenceKind::OneToMany | ReferenceKind::ManyToMany, FieldData::Unloaded) => {
                Ok(PropertyValue::Collection(Relation::Unloaded))
            }
            (ReferenceKind::OneToMany | ReferenceKind::ManyToMany, _) => {
                Err(shape_error("collection"))
            }
        }
    }

    /// Re-index an entity under the key it now carries.
    pub fn rekey(&mut self, id: EntityId, key_values: Vec<Value>) -> Result<()> {
        let key = IdentityKey::from_values(&key_values)?;
        let managed = self.entries.get(&id).ok_or(NotFoundError::entity(id))?;
        let entity_type = managed.entity_type;

        if let Some(&other) = self.index.get(&(entity_type, key.clone())) {
            if other != id {
                return Err(ValidationError::new(
                    ValidationErrorKind::DuplicateIdentity,
                    format!("key '{key}' is already managed by entity {other}"),
                )
                .for_entity(entity_type)
                .into());
            }
        }

        if let Some(old) = managed.key.clone() {
            self.index.remove(&(entity_type, old));
        }
        self.index.insert((entity_type, key.clone()), id);
        if let Some(managed) = self.entries.get_mut(&id) {
            managed.key = Some(key);
            managed.key_values = Some(key_values);
        }
        Ok(())
    }

    pub fn set_snapshot(&mut self, id: EntityId, snapshot: Snapshot) -> Result<()> {
        let managed = self
            .entries
            .get_mut(&id)
            .ok_or(NotFoundError::entity(id))?;
        managed.snapshot = Some(snapshot);
        managed.initialized = true;
        Ok(())
    }

    /// Managed entities in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &ManagedEntity> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.keys().copied().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn stub_entity(meta: &EntityMetadata, key: &[Value]) -> Result<Entity> {
    if key.len() != meta.primary_key.len() {
        return Err(ValidationError::new(
            ValidationErrorKind::KeyEncoding,
            format!(
                "expected {} primary key part(s), got {}",
                meta.primary_key.len(),
                key.len()
            ),
        )
        .for_entity(meta.name)
        .into());
    }
    let mut entity = Entity::new(meta.name);
    for (name, value) in meta.primary_key.iter().zip(key) {
        entity.set(name, value.clone());
    }
    Ok(entity)
}

// ============================================================================
// Unit Tests
// ============================================================================
