//! Commit ordering and batching for the unit of work.
//!
//! This module turns a set of change sets into an ordered list of batches:
//! - INSERT referenced types first (to respect FK constraints)
//! - Deferred FK fills once every insert is done
//! - UPDATE in the same order as inserts
//! - Deferred FK null-outs for rows deleted across a broken cycle
//! - DELETE referencing types first (reverse order)
//!
//! The dependency graph is built over entity *types* present in the pending
//! set. Cycles are broken by deferring a nullable foreign key: rows are
//! inserted with that property unset and a follow-up UPDATE fills it in.

use std::collections::{BTreeSet, HashMap, HashSet};

use persistgraph_core::{
    EntityId, MetadataRegistry, Operation, Result, ValidationError,
};

use crate::change_tracker::ChangeSet;

/// "Rows of `from` must be inserted after rows of `to`" (and deleted before).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    pub from: &'static str,
    pub to: &'static str,
    pub property: &'static str,
    pub nullable: bool,
}

/// One change set inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Index into the change sets handed to the scheduler.
    pub change_set: usize,
    /// Properties written as unset on insert and filled in afterwards.
    pub deferred_properties: Vec<&'static str>,
}

/// Change sets of one type and one operation, dispatched in one persister call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    pub entity_type: &'static str,
    pub operation: Operation,
    /// Follow-up UPDATE filling deferred foreign keys.
    pub deferred: bool,
    pub entries: Vec<BatchEntry>,
}

impl CommitBatch {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered batches plus the graph facts that produced them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPlan {
    pub batches: Vec<CommitBatch>,
    /// Types in dependency order, referenced before referencing.
    pub order: Vec<&'static str>,
    pub edges: Vec<DependencyEdge>,
    /// Edges broken to resolve cycles.
    pub deferred_edges: Vec<DependencyEdge>,
}

impl CommitPlan {
    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    /// Number of batches.
    pub fn len(&self) -> usize {
        self.batches.len()
    }

    /// Number of rows across all batches.
    pub fn row_count(&self) -> usize {
        self.batches.iter().map(CommitBatch::len).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Builds the dependency graph and orders change sets into batches.
#[derive(Debug, Clone, Copy)]
pub struct CommitOrderScheduler<'a> {
    registry: &'a MetadataRegistry,
    batch_size: usize,
}

impl<'a> CommitOrderScheduler<'a> {
    pub fn new(registry: &'a MetadataRegistry, batch_size: usize) -> Self {
        Self {
            registry,
            batch_size: batch_size.max(1),
        }
    }

    /// Order `change_sets` into batches.
    ///
    /// # Errors
    ///
    /// Returns a `DependencyCycle` validation error when a cycle contains no
    /// nullable edge.
    #[tracing::instrument(level = "debug", skip(self, change_sets), fields(count = change_sets.len()))]
    pub fn schedule(&self, change_sets: &[ChangeSet]) -> Result<CommitPlan> {
        let types = self.pending_types(change_sets);
        let edges = self.dependency_edges(&types);
        let deferred_edges = Self::break_cycles(&types, &edges)?;
        let order = Self::topological_order(&types, &edges, &deferred_edges);

        for edge in &deferred_edges {
            tracing::debug!(
                from = edge.from,
                to = edge.to,
                property = edge.property,
                "Deferring foreign key to break cycle"
            );
        }

        let batches = self.build_batches(change_sets, &order, &deferred_edges);
        tracing::debug!(
            types = order.len(),
            batches = batches.len(),
            deferred = deferred_edges.len(),
            "Commit plan ready"
        );

        Ok(CommitPlan {
            batches,
            order,
            edges,
            deferred_edges,
        })
    }

    /// Types with pending work, in registry order.
    fn pending_types(&self, change_sets: &[ChangeSet]) -> Vec<&'static str> {
        let present: HashSet<&str> = change_sets.iter().map(|cs| cs.entity_type).collect();
        self.registry
            .iter()
            .map(|m| m.name)
            .filter(|name| present.contains(name))
            .collect()
    }

    /// Owning foreign keys between pending types.
    fn dependency_edges(&self, types: &[&'static str]) -> Vec<DependencyEdge> {
        let present: HashSet<&str> = types.iter().copied().collect();
        let mut edges = Vec::new();
        for ty in types {
            let Ok(meta) = self.registry.get_metadata(ty) else {
                continue;
            };
            for prop in meta.owning_references() {
                let Some(target) = prop.target else {
                    continue;
                };
                if present.contains(target) {
                    edges.push(DependencyEdge {
                        from: meta.name,
                        to: target,
                        property: prop.name,
                        nullable: prop.nullable,
                    });
                }
            }
        }
        edges
    }

    /// Repeatedly find a cycle and defer its smallest nullable edge.
    fn break_cycles(
        types: &[&'static str],
        edges: &[DependencyEdge],
    ) -> Result<Vec<DependencyEdge>> {
        let mut active = vec![true; edges.len()];
        let mut deferred = Vec::new();

        while let Some(cycle) = Self::find_cycle(types, edges, &active) {
            let breakable = cycle
                .iter()
                .copied()
                .filter(|&i| edges[i].nullable)
                .min_by_key(|&i| (edges[i].from, edges[i].property));

            let Some(i) = breakable else {
                let mut names: Vec<&'static str> = cycle.iter().map(|&i| edges[i].from).collect();
                if let Some(&first) = names.first() {
                    names.push(first);
                }
                return Err(ValidationError::cycle(names).into());
            };
            active[i] = false;
            deferred.push(edges[i]);
        }

        Ok(deferred)
    }

    /// Edge indices of one cycle among active edges, if any.
    fn find_cycle(
        types: &[&'static str],
        edges: &[DependencyEdge],
        active: &[bool],
    ) -> Option<Vec<usize>> {
        let adjacency = adjacency(types, edges, |i| active[i]);
        let mut marks: HashMap<&'static str, Mark> = HashMap::new();
        let mut path_nodes = Vec::new();
        let mut path_edges = Vec::new();

        for ty in types {
            if marks.contains_key(ty) {
                continue;
            }
            if let Some(cycle) = cycle_dfs(
                ty,
                edges,
                &adjacency,
                &mut marks,
                &mut path_nodes,
                &mut path_edges,
            ) {
                return Some(cycle);
            }
        }
        None
    }

    /// Depth-first post-order: every type after the types it references.
    fn topological_order(
        types: &[&'static str],
        edges: &[DependencyEdge],
        deferred: &[DependencyEdge],
    ) -> Vec<&'static str> {
        let adjacency = adjacency(types, edges, |i| {
            edges[i].from != edges[i].to && !deferred.contains(&edges[i])
        });
        let mut visited = HashSet::new();
        let mut order = Vec::with_capacity(types.len());

        fn visit(
            ty: &'static str,
            edges: &[DependencyEdge],
            adjacency: &HashMap<&'static str, Vec<usize>>,
            visited: &mut HashSet<&'static str>,
            order: &mut Vec<&'static str>,
        ) {
            if !visited.insert(ty) {
                return;
            }
            for &i in adjacency.get(ty).map_or(&[][..], Vec::as_slice) {
                visit(edges[i].to, edges, adjacency, visited, order);
            }
            order.push(ty);
        }

        for ty in types {
            visit(ty, edges, &adjacency, &mut visited, &mut order);
        }
        order
    }

    fn build_batches(
        &self,
        change_sets: &[ChangeSet],
        order: &[&'static str],
        deferred_edges: &[DependencyEdge],
    ) -> Vec<CommitBatch> {
        let created: HashSet<EntityId> = change_sets
            .iter()
            .filter(|cs| cs.operation == Operation::Create)
            .map(|cs| cs.entity)
            .collect();
        let deferrable: BTreeSet<(&'static str, &'static str)> =
            deferred_edges.iter().map(|e| (e.from, e.property)).collect();

        let mut creates = Vec::new();
        let mut fills = Vec::new();
        let mut updates = Vec::new();
        for ty in order {
            let mut insert_entries = Vec::new();
            let mut fill_entries = Vec::new();
            let mut update_entries = Vec::new();

            for (index, cs) in change_sets.iter().enumerate() {
                if cs.entity_type != *ty {
                    continue;
                }
                match cs.operation {
                    Operation::Create => {
                        let deferred_properties: Vec<&'static str> = cs
                            .changes
                            .iter()
                            .filter(|(name, value)| {
                                deferrable.contains(&(*ty, **name))
                                    && value.referenced_ids().iter().any(|t| created.contains(t))
                            })
                            .map(|(name, _)| *name)
                            .collect();
                        if !deferred_properties.is_empty() {
                            fill_entries.push(BatchEntry {
                                change_set: index,
                                deferred_properties: deferred_properties.clone(),
                            });
                        }
                        insert_entries.push(BatchEntry {
                            change_set: index,
                            deferred_properties,
                        });
                    }
                    Operation::Update => update_entries.push(BatchEntry {
                        change_set: index,
                        deferred_properties: Vec::new(),
                    }),
                    Operation::Delete => {}
                }
            }

            creates.extend(self.chunk(ty, Operation::Create, false, insert_entries));
            fills.extend(self.chunk(ty, Operation::Update, true, fill_entries));
            updates.extend(self.chunk(ty, Operation::Update, false, update_entries));
        }

        // Deferred keys on deleted rows are nulled before any delete runs.
        let deleted_types: BTreeSet<&'static str> = change_sets
            .iter()
            .filter(|cs| cs.operation == Operation::Delete)
            .map(|cs| cs.entity_type)
            .collect();
        let mut unlinks = Vec::new();
        let mut deletes = Vec::new();
        for ty in order.iter().rev() {
            let unlinked: Vec<&'static str> = deferred_edges
                .iter()
                .filter(|e| e.from == *ty && deleted_types.contains(e.to))
                .map(|e| e.property)
                .collect();
            let indices: Vec<usize> = change_sets
                .iter()
                .enumerate()
                .filter(|(_, cs)| cs.entity_type == *ty && cs.operation == Operation::Delete)
                .map(|(index, _)| index)
                .collect();
            if !unlinked.is_empty() {
                let entries = indices
                    .iter()
                    .map(|&index| BatchEntry {
                        change_set: index,
                        deferred_properties: unlinked.clone(),
                    })
                    .collect();
                unlinks.extend(self.chunk(ty, Operation::Update, true, entries));
            }
            let entries = indices
                .into_iter()
                .map(|index| BatchEntry {
                    change_set: index,
                    deferred_properties: Vec::new(),
                })
                .collect();
            deletes.extend(self.chunk(ty, Operation::Delete, false, entries));
        }

        let mut batches = creates;
        batches.extend(fills);
        batches.extend(updates);
        batches.extend(unlinks);
        batches.extend(deletes);
        batches
    }

    fn chunk(
        &self,
        entity_type: &'static str,
        operation: Operation,
        deferred: bool,
        entries: Vec<BatchEntry>,
    ) -> Vec<CommitBatch> {
        entries
            .chunks(self.batch_size)
            .map(|chunk| CommitBatch {
                entity_type,
                operation,
                deferred,
                entries: chunk.to_vec(),
            })
            .collect()
    }
}

/// Outgoing edge indices per type, keeping edge order.
fn adjacency(
    types: &[&'static str],
    edges: &[DependencyEdge],
    keep: impl Fn(usize) -> bool,
) -> HashMap<&'static str, Vec<usize>> {
    let mut adjacency: HashMap<&'static str, Vec<usize>> =
        types.iter().map(|ty| (*ty, Vec::new())).collect();
    for (i, edge) in edges.iter().enumerate() {
        if keep(i) {
            adjacency.entry(edge.from).or_default().push(i);
        }
    }
    adjacency
}

/// DFS helper for cycle detection.
///
/// `path_edges[i]` leads from `path_nodes[i]` to `path_nodes[i + 1]`.
fn cycle_dfs(
    ty: &'static str,
    edges: &[DependencyEdge],
    adjacency: &HashMap<&'static str, Vec<usize>>,
    marks: &mut HashMap<&'static str, Mark>,
    path_nodes: &mut Vec<&'static str>,
    path_edges: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    marks.insert(ty, Mark::InProgress);
    path_nodes.push(ty);

    for &i in adjacency.get(ty).map_or(&[][..], Vec::as_slice) {
        let next = edges[i].to;
        match marks.get(next) {
            Some(Mark::InProgress) => {
                let start = path_nodes.iter().position(|n| *n == next).unwrap_or(0);
                let mut cycle = path_edges[start..].to_vec();
                cycle.push(i);
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                path_edges.push(i);
                if let Some(cycle) = cycle_dfs(next, edges, adjacency, marks, path_nodes, path_edges)
                {
                    return Some(cycle);
                }
                path_edges.pop();
            }
        }
    }

    marks.insert(ty, Mark::Done);
    path_nodes.pop();
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_tracker::ChangeValue;
    use persistgraph_core::{EntityMetadata, EntityProperty, Error, ValidationErrorKind, Value};
    use std::collections::BTreeMap;

    fn registry() -> MetadataRegistry {
        MetadataRegistry::builder()
            .entity(
                EntityMetadata::new("Book")
                    .primary_key(&["id"])
                    .property(EntityProperty::scalar("id").generated(true))
                    .property(EntityProperty::many_to_one("author", "Author")),
            )
            .entity(
                EntityMetadata::new("Author")
                    .primary_key(&["id"])
                    .property(EntityProperty::scalar("id").generated(true)),
            )
            .entity(
                EntityMetadata::new("Employee")
                    .primary_key(&["id"])
                    .property(EntityProperty::scalar("id").generated(true))
                    .property(EntityProperty::many_to_one("manager", "Employee").nullable(true))
                    .property(EntityProperty::many_to_one("department", "Department")),
            )
            .entity(
                EntityMetadata::new("Department")
                    .primary_key(&["id"])
                    .property(EntityProperty::scalar("id").generated(true))
                    .property(EntityProperty::many_to_one("head", "Employee").nullable(true)),
            )
            .entity(
                EntityMetadata::new("Node")
                    .primary_key(&["id"])
                    .property(EntityProperty::scalar("id").generated(true))
                    .property(EntityProperty::many_to_one("parent", "Node")),
            )
            .build()
            .unwrap()
    }

    fn change_set(
        entity: u64,
        entity_type: &'static str,
        operation: Operation,
        refs: &[(&'static str, u64)],
    ) -> ChangeSet {
        let mut changes = BTreeMap::new();
        for (name, target) in refs {
            changes.insert(*name, ChangeValue::Reference(Some(EntityId(*target))));
        }
        ChangeSet {
            entity: EntityId(entity),
            entity_type,
            operation,
            changes,
            primary_key: (operation != Operation::Create).then(|| vec![Value::BigInt(entity as i64)]),
            original_version: None,
        }
    }

    fn shape(plan: &CommitPlan) -> Vec<(&'static str, Operation, bool, usize)> {
        plan.batches
            .iter()
            .map(|b| (b.entity_type, b.operation, b.deferred, b.len()))
            .collect()
    }

    #[test]
    fn test_referenced_types_insert_first_and_delete_last() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        let sets = vec![
            change_set(1, "Book", Operation::Create, &[("author", 2)]),
            change_set(2, "Author", Operation::Create, &[]),
            change_set(3, "Book", Operation::Delete, &[]),
            change_set(4, "Author", Operation::Delete, &[]),
            change_set(5, "Author", Operation::Update, &[]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();
        assert_eq!(plan.order, vec!["Author", "Book"]);
        assert_eq!(
            shape(&plan),
            vec![
                ("Author", Operation::Create, false, 1),
                ("Book", Operation::Create, false, 1),
                ("Author", Operation::Update, false, 1),
                ("Book", Operation::Delete, false, 1),
                ("Author", Operation::Delete, false, 1),
            ]
        );
        assert!(plan.deferred_edges.is_empty());
        assert_eq!(plan.row_count(), 5);
    }

    #[test]
    fn test_batches_split_by_size() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 2);
        let sets: Vec<_> = (1..=5)
            .map(|i| change_set(i, "Author", Operation::Create, &[]))
            .collect();
        let plan = scheduler.schedule(&sets).unwrap();
        let sizes: Vec<_> = plan.batches.iter().map(CommitBatch::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(plan.batches[2].entries[0].change_set, 4);
    }

    #[test]
    fn test_nullable_self_reference_defers_one_fill_batch() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        let sets = vec![
            change_set(1, "Department", Operation::Create, &[]),
            change_set(2, "Employee", Operation::Create, &[("department", 1)]),
            change_set(3, "Employee", Operation::Create, &[("department", 1), ("manager", 2)]),
            change_set(4, "Employee", Operation::Create, &[("department", 1), ("manager", 3)]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();

        assert!(
            plan.deferred_edges
                .iter()
                .any(|e| e.from == "Employee" && e.property == "manager")
        );
        assert_eq!(plan.order, vec!["Department", "Employee"]);
        assert_eq!(
            shape(&plan),
            vec![
                ("Department", Operation::Create, false, 1),
                ("Employee", Operation::Create, false, 3),
                ("Employee", Operation::Update, true, 2),
            ]
        );
        let fill = &plan.batches[2];
        assert_eq!(fill.entries[0].change_set, 2);
        assert_eq!(fill.entries[0].deferred_properties, vec!["manager"]);
    }

    #[test]
    fn test_two_type_cycle_defers_smallest_nullable_edge() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        let sets = vec![
            change_set(1, "Employee", Operation::Create, &[("department", 2)]),
            change_set(2, "Department", Operation::Create, &[("head", 1)]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();

        let deferred: Vec<_> = plan
            .deferred_edges
            .iter()
            .map(|e| (e.from, e.property))
            .collect();
        assert_eq!(deferred, vec![("Employee", "manager"), ("Department", "head")]);
        assert_eq!(plan.order, vec!["Department", "Employee"]);
        assert_eq!(
            shape(&plan),
            vec![
                ("Department", Operation::Create, false, 1),
                ("Employee", Operation::Create, false, 1),
                ("Department", Operation::Update, true, 1),
            ]
        );
    }

    #[test]
    fn test_deleting_both_sides_of_a_cycle_unlinks_first() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        let sets = vec![
            change_set(1, "Employee", Operation::Delete, &[]),
            change_set(2, "Department", Operation::Delete, &[]),
            change_set(3, "Department", Operation::Update, &[]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();

        assert_eq!(
            shape(&plan),
            vec![
                ("Department", Operation::Update, false, 1),
                ("Employee", Operation::Update, true, 1),
                ("Department", Operation::Update, true, 1),
                ("Employee", Operation::Delete, false, 1),
                ("Department", Operation::Delete, false, 1),
            ]
        );
        let unlink = &plan.batches[2];
        assert_eq!(unlink.entries[0].change_set, 1);
        assert_eq!(unlink.entries[0].deferred_properties, vec!["head"]);
        assert_eq!(plan.batches[1].entries[0].deferred_properties, vec!["manager"]);
    }

    #[test]
    fn test_no_unlink_when_deferred_target_is_kept() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        // Department.head is deferred, but no Employee is deleted.
        let sets = vec![
            change_set(1, "Employee", Operation::Update, &[]),
            change_set(2, "Department", Operation::Delete, &[]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();
        assert!(plan.batches.iter().all(|b| !b.deferred));
        assert_eq!(
            plan.batches.last().map(|b| (b.entity_type, b.operation)),
            Some(("Department", Operation::Delete))
        );
    }

    #[test]
    fn test_non_nullable_cycle_is_rejected() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        let sets = vec![
            change_set(1, "Node", Operation::Create, &[]),
            change_set(2, "Node", Operation::Create, &[("parent", 1)]),
        ];
        let err = scheduler.schedule(&sets).unwrap_err();
        match err {
            Error::Validation(v) => {
                assert_eq!(v.kind, ValidationErrorKind::DependencyCycle);
                assert_eq!(v.cycle, vec!["Node", "Node"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_deferral_only_when_target_is_created() {
        let registry = registry();
        let scheduler = CommitOrderScheduler::new(&registry, 300);
        // Manager 9 already exists: the reference can be written on insert.
        let sets = vec![
            change_set(1, "Department", Operation::Update, &[]),
            change_set(2, "Employee", Operation::Create, &[("department", 1), ("manager", 9)]),
        ];
        let plan = scheduler.schedule(&sets).unwrap();
        assert!(plan.batches.iter().all(|b| !b.deferred));
        assert!(plan.batches[0].entries[0].deferred_properties.is_empty());
    }

    #[test]
    fn test_empty_input_gives_empty_plan() {
        let registry = registry();
        let plan = CommitOrderScheduler::new(&registry, 300).schedule(&[]).unwrap();
        assert!(plan.is_empty());
        assert_eq!(plan.len(), 0);
    }
}
