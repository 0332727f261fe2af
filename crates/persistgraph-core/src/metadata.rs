//! Entity metadata and the metadata registry.
//!
//! Metadata is described explicitly with const builders and collected into a
//! [`MetadataRegistry`], which validates the whole schema once and is then
//! shared read-only (usually behind an `Arc`) by every unit of work.

use std::collections::HashMap;

use crate::error::{Error, Result, ValidationError, ValidationErrorKind};

/// How a property relates its entity to others.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReferenceKind {
    /// Plain column value.
    #[default]
    Scalar,
    /// Many `Book`s point at one `Author`; the `Book` row holds the foreign key.
    ManyToOne,
    /// One `Author` has many `Book`s; inverse side, holds nothing.
    OneToMany,
    /// Link-table relation; the owning side writes the links.
    ManyToMany,
    /// Value object stored inline with its owner.
    Embedded,
}

impl ReferenceKind {
    /// Does this kind point at other entities?
    pub const fn is_relation(self) -> bool {
        matches!(
            self,
            ReferenceKind::ManyToOne | ReferenceKind::OneToMany | ReferenceKind::ManyToMany
        )
    }

    /// Does this kind hold a collection of entities?
    pub const fn is_collection(self) -> bool {
        matches!(self, ReferenceKind::OneToMany | ReferenceKind::ManyToMany)
    }
}

/// A cascading action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cascade {
    Persist,
    Remove,
}

/// Set of cascading actions enabled on a relation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeSet {
    pub persist: bool,
    pub remove: bool,
}

impl CascadeSet {
    pub const NONE: Self = Self {
        persist: false,
        remove: false,
    };
    pub const PERSIST: Self = Self {
        persist: true,
        remove: false,
    };
    pub const REMOVE: Self = Self {
        persist: false,
        remove: true,
    };
    pub const ALL: Self = Self {
        persist: true,
        remove: true,
    };

    #[must_use]
    pub const fn contains(self, action: Cascade) -> bool {
        match action {
            Cascade::Persist => self.persist,
            Cascade::Remove => self.remove,
        }
    }
}

/// Metadata for a single entity property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityProperty {
    /// Property name as used on entity records.
    pub name: &'static str,
    pub kind: ReferenceKind,
    /// Target entity type for relations.
    pub target: Option<&'static str>,
    pub nullable: bool,
    /// Whether this side holds the foreign key (or writes the link rows).
    pub owner: bool,
    pub cascade: CascadeSet,
    /// Store-assigned primary key part.
    pub generated: bool,
    /// Collection compared as a sequence instead of a set.
    pub ordered: bool,
    /// Property on the target that owns an inverse relation.
    pub mapped_by: Option<&'static str>,
}

impl EntityProperty {
    /// A scalar column.
    #[must_use]
    pub const fn scalar(name: &'static str) -> Self {
        Self {
            name,
            kind: ReferenceKind::Scalar,
            target: None,
            nullable: true,
            owner: true,
            cascade: CascadeSet::NONE,
            generated: false,
            ordered: false,
            mapped_by: None,
        }
    }

    /// An embedded value object.
    #[must_use]
    pub const fn embedded(name: &'static str) -> Self {
        Self {
            kind: ReferenceKind::Embedded,
            ..Self::scalar(name)
        }
    }

    /// Owning many-to-one. Required and persist-cascading unless changed.
    #[must_use]
    pub const fn many_to_one(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: ReferenceKind::ManyToOne,
            target: Some(target),
            nullable: false,
            owner: true,
            cascade: CascadeSet::PERSIST,
            generated: false,
            ordered: false,
            mapped_by: None,
        }
    }

    /// Inverse one-to-many, mapped by a many-to-one on the target.
    #[must_use]
    pub const fn one_to_many(
        name: &'static str,
        target: &'static str,
        mapped_by: &'static str,
    ) -> Self {
        Self {
            name,
            kind: ReferenceKind::OneToMany,
            target: Some(target),
            nullable: true,
            owner: false,
            cascade: CascadeSet::PERSIST,
            generated: false,
            ordered: false,
            mapped_by: Some(mapped_by),
        }
    }

    /// Owning many-to-many. Link rows can always be written later, so the
    /// edge is nullable.
    #[must_use]
    pub const fn many_to_many(name: &'static str, target: &'static str) -> Self {
        Self {
            name,
            kind: ReferenceKind::ManyToMany,
            target: Some(target),
            nullable: true,
            owner: true,
            cascade: CascadeSet::PERSIST,
            generated: false,
            ordered: false,
            mapped_by: None,
        }
    }

    #[must_use]
    pub const fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub const fn owner(mut self, value: bool) -> Self {
        self.owner = value;
        self
    }

    /// Mark a many-to-many as the inverse side of `mapped_by`.
    #[must_use]
    pub const fn inverse_of(mut self, mapped_by: &'static str) -> Self {
        self.owner = false;
        self.mapped_by = Some(mapped_by);
        self
    }

    #[must_use]
    pub const fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub const fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    #[must_use]
    pub const fn ordered(mut self, value: bool) -> Self {
        self.ordered = value;
        self
    }

    #[must_use]
    pub const fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// Is this property written to the owning row (and therefore diffed)?
    #[must_use]
    pub const fn is_persisted(&self) -> bool {
        match self.kind {
            ReferenceKind::Scalar | ReferenceKind::Embedded => true,
            ReferenceKind::ManyToOne | ReferenceKind::ManyToMany => self.owner,
            ReferenceKind::OneToMany => false,
        }
    }

    /// Does this property induce a commit-order dependency on its target?
    #[must_use]
    pub const fn is_owning_reference(&self) -> bool {
        matches!(
            self.kind,
            ReferenceKind::ManyToOne | ReferenceKind::ManyToMany
        ) && self.owner
    }
}

/// Metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: &'static str,
    /// Ordered primary key property names.
    pub primary_key: Vec<&'static str>,
    pub properties: Vec<EntityProperty>,
    /// Optimistic-lock version property.
    pub version_property: Option<&'static str>,
}

impl EntityMetadata {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            primary_key: Vec::new(),
            properties: Vec::new(),
            version_property: None,
        }
    }

    #[must_use]
    pub fn primary_key(mut self, columns: &[&'static str]) -> Self {
        self.primary_key = columns.to_vec();
        self
    }

    #[must_use]
    pub fn property(mut self, property: EntityProperty) -> Self {
        self.properties.push(property);
        self
    }

    #[must_use]
    pub fn version(mut self, property: &'static str) -> Self {
        self.version_property = Some(property);
        self
    }

    /// Look up a property by name.
    pub fn get_property(&self, name: &str) -> Option<&EntityProperty> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Look up a property, failing with `UnknownProperty`.
    pub fn require_property(&self, name: &str) -> Result<&EntityProperty> {
        self.get_property(name).ok_or_else(|| {
            ValidationError::new(
                ValidationErrorKind::UnknownProperty,
                format!("unknown property '{name}'"),
            )
            .for_entity(self.name)
            .into()
        })
    }

    /// Relation properties, in declaration order.
    pub fn relations(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| p.kind.is_relation())
    }

    /// Owning foreign-key properties, in declaration order.
    pub fn owning_references(&self) -> impl Iterator<Item = &EntityProperty> {
        self.properties.iter().filter(|p| p.is_owning_reference())
    }

    /// Is `name` part of the primary key?
    pub fn is_primary_key(&self, name: &str) -> bool {
        self.primary_key.contains(&name)
    }

    fn validate(&self, registry: &HashMap<&'static str, &EntityMetadata>) -> Result<()> {
        let invalid = |message: String| -> Error {
            ValidationError::new(ValidationErrorKind::InvalidSchema, message)
                .for_entity(self.name)
                .into()
        };

        if self.primary_key.is_empty() {
            return Err(invalid("entity has no primary key".to_string()));
        }

        for (i, prop) in self.properties.iter().enumerate() {
            if self.properties[..i].iter().any(|p| p.name == prop.name) {
                return Err(invalid(format!("duplicate property '{}'", prop.name)));
            }
        }

        for pk in &self.primary_key {
            let prop = self
                .get_property(pk)
                .ok_or_else(|| invalid(format!("primary key property '{pk}' is not declared")))?;
            if prop.kind != ReferenceKind::Scalar {
                return Err(invalid(format!("primary key property '{pk}' must be scalar")));
            }
        }

        if let Some(version) = self.version_property {
            match self.get_property(version) {
                Some(p) if p.kind == ReferenceKind::Scalar => {}
                _ => {
                    return Err(invalid(format!(
                        "version property '{version}' must be a declared scalar"
                    )));
                }
            }
        }

        for prop in &self.properties {
            if prop.generated && !self.is_primary_key(prop.name) {
                return Err(invalid(format!(
                    "generated property '{}' is not part of the primary key",
                    prop.name
                )));
            }
            if !prop.kind.is_relation() {
                continue;
            }
            let Some(target) = prop.target else {
                return Err(invalid(format!("relation '{}' has no target", prop.name)));
            };
            let Some(target_meta) = registry.get(target) else {
                return Err(invalid(format!(
                    "relation '{}' targets unknown entity '{target}'",
                    prop.name
                )));
            };
            if let Some(mapped_by) = prop.mapped_by {
                if target_meta.get_property(mapped_by).is_none() {
                    return Err(invalid(format!(
                        "relation '{}' is mapped by '{target}.{mapped_by}', which is not declared",
                        prop.name
                    )));
                }
            } else if !prop.owner {
                return Err(invalid(format!(
                    "inverse relation '{}' needs mapped_by",
                    prop.name
                )));
            }
        }
        Ok(())
    }
}

/// Resolved, validated, read-only set of entity metadata.
///
/// Registration order is significant: it is the order in which the commit
/// scheduler visits types, which keeps batch ordering deterministic.
#[derive(Debug, Clone, Default)]
pub struct MetadataRegistry {
    entities: Vec<EntityMetadata>,
    index: HashMap<&'static str, usize>,
}

impl MetadataRegistry {
    pub fn builder() -> MetadataRegistryBuilder {
        MetadataRegistryBuilder::default()
    }

    /// Metadata for `entity_type`, failing with `UnknownEntityType`.
    pub fn get_metadata(&self, entity_type: &str) -> Result<&EntityMetadata> {
        self.index
            .get(entity_type)
            .map(|&i| &self.entities[i])
            .ok_or_else(|| {
                Error::validation(
                    ValidationErrorKind::UnknownEntityType,
                    format!("unknown entity type '{entity_type}'"),
                )
            })
    }

    /// Registration position of `entity_type`.
    pub fn position(&self, entity_type: &str) -> Option<usize> {
        self.index.get(entity_type).copied()
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.index.contains_key(entity_type)
    }

    /// All metadata in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.iter()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

/// Collects entity metadata and validates it into a [`MetadataRegistry`].
#[derive(Debug, Default)]
pub struct MetadataRegistryBuilder {
    entities: Vec<EntityMetadata>,
}

impl MetadataRegistryBuilder {
    #[must_use]
    pub fn entity(mut self, metadata: EntityMetadata) -> Self {
        self.entities.push(metadata);
        self
    }

    /// Validate every entity and freeze the registry.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.entities.len()))]
    pub fn build(self) -> Result<MetadataRegistry> {
        let mut index = HashMap::with_capacity(self.entities.len());
        for (i, meta) in self.entities.iter().enumerate() {
            if index.insert(meta.name, i).is_some() {
                return Err(ValidationError::new(
                    ValidationErrorKind::InvalidSchema,
                    format!("entity type '{}' registered twice", meta.name),
                )
                .into());
            }
        }

        let by_name: HashMap<&'static str, &EntityMetadata> =
            self.entities.iter().map(|m| (m.name, m)).collect();
        for meta in &self.entities {
            meta.validate(&by_name)?;
        }

        tracing::debug!(count = self.entities.len(), "Metadata registry built");
        Ok(MetadataRegistry {
            entities: self.entities,
            index,
        })
    }
}
