//! Cascade expansion over relation edges.
//!
//! Starting from explicitly persisted or removed entities, follow loaded
//! relations whose cascade set contains the action and collect every entity
//! reached. Traversal is iterative and keyed by [`EntityId`], so cyclic
//! graphs terminate and entities without keys are handled like any other.

use std::collections::HashSet;

use persistgraph_core::{Cascade, EntityId, NotFoundError, Result};

use crate::identity_map::IdentityMap;

/// Expands persist/remove cascades for one flush.
///
/// The visited set lives as long as the resolver, so each entity is expanded
/// at most once per action no matter how many roots reach it.
#[derive(Debug)]
pub struct CascadeResolver<'a> {
    map: &'a IdentityMap,
    visited: HashSet<(EntityId, Cascade)>,
}

impl<'a> CascadeResolver<'a> {
    pub fn new(map: &'a IdentityMap) -> Self {
        Self {
            map,
            visited: HashSet::new(),
        }
    }

    /// Entities reachable from `root` through relations cascading `action`,
    /// excluding `root` and anything already expanded.
    #[tracing::instrument(level = "trace", skip(self), fields(root = %root))]
    pub fn expand(&mut self, root: EntityId, action: Cascade) -> Result<Vec<EntityId>> {
        if !self.map.contains(root) {
            return Err(NotFoundError::entity(root).into());
        }
        if !self.visited.insert((root, action)) {
            return Ok(Vec::new());
        }

        let registry = self.map.registry();
        let mut discovered = Vec::new();
        let mut stack = vec![root];

        while let Some(id) = stack.pop() {
            let managed = self.map.require(id)?;
            let meta = registry.get_metadata(managed.entity_type)?;

            let mut targets = Vec::new();
            {
                let entity = managed.entity.read();
                for prop in meta.relations().filter(|p| p.cascade.contains(action)) {
                    let Some(value) = entity.property(prop.name) else {
                        continue;
                    };
                    if value.is_unloaded() {
                        match action {
                            Cascade::Remove => tracing::warn!(
                                entity_type = meta.name,
                                property = prop.name,
                                "Skipping unloaded relation during remove cascade"
                            ),
                            Cascade::Persist => tracing::trace!(
                                entity_type = meta.name,
                                property = prop.name,
                                "Skipping unloaded relation"
                            ),
                        }
                        continue;
                    }
                    targets.extend(value.referenced_ids());
                }
            }

            for target in targets {
                if !self.map.contains(target) {
                    return Err(NotFoundError::entity(target).into());
                }
                if self.visited.insert((target, action)) {
                    tracing::trace!(from = %id, to = %target, ?action, "Cascade discovered entity");
                    discovered.push(target);
                    stack.push(target);
                }
            }
        }

        Ok(discovered)
    }

    /// Expand every root, returning all newly reached entities in discovery order.
    pub fn expand_all(
        &mut self,
        roots: impl IntoIterator<Item = EntityId>,
        action: Cascade,
    ) -> Result<Vec<EntityId>> {
        let mut all = Vec::new();
        for root in roots {
            all.extend(self.expand(root, action)?);
        }
        Ok(all)
    }

    /// Number of (entity, action) pairs expanded so far.
    pub fn visited_count(&self) -> usize {
        self.visited.len()
    }
}
