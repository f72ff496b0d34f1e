//! Dependency ordering of queued operations.
//!
//! Operations that reference an entity created in the same batch must be
//! pushed after that create. Each operation gets a depth, one more than the
//! deepest operation it depends on, and the batch is sorted by depth, then
//! entity type precedence, then time.

use crate::queue::{OperationKind, SyncOperation};
use crate::{temp_id, EntityId, EntityType, OperationId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// A dependency that closed a cycle and was ignored for ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyCycle {
    /// Operation whose dependency was ignored
    pub operation_id: OperationId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Entity the ignored dependency pointed at
    pub depends_on_type: EntityType,
    pub depends_on_id: EntityId,
}

/// Operations in push order, plus any cycles found on the way.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderedBatch {
    pub operations: Vec<SyncOperation>,
    pub cycles: Vec<DependencyCycle>,
}

impl OrderedBatch {
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done(usize),
}

struct Graph<'a> {
    ops: &'a [SyncOperation],
    /// Indices of the operations each operation depends on
    edges: Vec<Vec<usize>>,
    marks: Vec<Mark>,
    cycles: Vec<DependencyCycle>,
}

impl<'a> Graph<'a> {
    fn build(ops: &'a [SyncOperation]) -> Self {
        let mut creates: HashMap<(EntityType, &str), usize> = HashMap::new();
        for (i, op) in ops.iter().enumerate() {
            if op.operation == OperationKind::Create && temp_id::is_temp_id(&op.entity_id) {
                creates.entry((op.entity_type, op.entity_id.as_str())).or_insert(i);
            }
        }

        let edges = ops
            .iter()
            .enumerate()
            .map(|(i, op)| {
                let mut deps = Vec::new();
                if op.operation != OperationKind::Create {
                    if let Some(&create) = creates.get(&(op.entity_type, op.entity_id.as_str())) {
                        if create != i {
                            deps.push(create);
                        }
                    }
                }
                for reference in &op.relationships {
                    if !temp_id::is_temp_id(&reference.id) {
                        continue;
                    }
                    if let Some(&create) = creates.get(&(reference.entity_type, reference.id.as_str())) {
                        if !deps.contains(&create) {
                            deps.push(create);
                        }
                    }
                }
                deps
            })
            .collect();

        Self {
            ops,
            edges,
            marks: vec![Mark::Unvisited; ops.len()],
            cycles: Vec::new(),
        }
    }

    fn depth(&mut self, i: usize) -> usize {
        match self.marks[i] {
            Mark::Done(depth) => return depth,
            Mark::Visiting => return 0,
            Mark::Unvisited => {}
        }
        self.marks[i] = Mark::Visiting;

        let mut depth = 0;
        for dep in self.edges[i].clone() {
            let dep_depth = if dep == i || self.marks[dep] == Mark::Visiting {
                self.record_cycle(i, dep);
                0
            } else {
                self.depth(dep)
            };
            depth = depth.max(dep_depth + 1);
        }

        self.marks[i] = Mark::Done(depth);
        depth
    }

    fn record_cycle(&mut self, from: usize, to: usize) {
        let op = &self.ops[from];
        let target = &self.ops[to];
        warn!(
            op_id = %op.id,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            depends_on = %target.entity_id,
            "dependency cycle detected, ignoring dependency"
        );
        self.cycles.push(DependencyCycle {
            operation_id: op.id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            depends_on_type: target.entity_type,
            depends_on_id: target.entity_id.clone(),
        });
    }
}

/// Order operations so that every create precedes the operations that
/// depend on it.
pub fn order_operations(operations: Vec<SyncOperation>) -> OrderedBatch {
    let (depths, cycles) = {
        let mut graph = Graph::build(&operations);
        let depths: Vec<usize> = (0..operations.len()).map(|i| graph.depth(i)).collect();
        (depths, graph.cycles)
    };

    let mut keyed: Vec<(usize, SyncOperation)> = depths.into_iter().zip(operations).collect();
    keyed.sort_by(|(da, a), (db, b)| {
        da.cmp(db)
            .then(a.entity_type.precedence().cmp(&b.entity_type.precedence()))
            .then(a.timestamp.cmp(&b.timestamp))
            .then(a.sequence.cmp(&b.sequence))
    });

    OrderedBatch {
        operations: keyed.into_iter().map(|(_, op)| op).collect(),
        cycles,
    }
}
