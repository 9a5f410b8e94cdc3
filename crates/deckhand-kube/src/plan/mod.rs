//! Deploy plans
//!
//! A `Plan` is a directed acyclic graph of operations. Edges point from a
//! prerequisite to the operation that depends on it. A plan is built once
//! per deploy attempt, executed once and then only read for reporting.

pub mod operation;
pub mod stage;

pub use operation::{
    DeleteResourceOp, Operation, OperationCategory, OperationId, OperationStatus, PlanNode,
    ReleaseOp, ResourceOp, StageMarkerOp, TrackReadinessOp, TrackedResource, WaitCreationOp,
};
pub use stage::{Boundary, MarkerPosition, Stage, SubGroup};

use petgraph::Direction;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::dot::{Config, Dot};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::Bfs;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;

use crate::error::{KubeError, Result};

/// Edge weight: the target depends on the source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DependsOn;

impl fmt::Display for DependsOn {
    fn fmt(&self, _f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Ok(())
    }
}

/// Dependency graph of operations
#[derive(Debug, Clone, Default)]
pub struct Plan {
    graph: StableDiGraph<PlanNode, DependsOn>,
    index: HashMap<OperationId, NodeIndex>,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operation; its id must be new to the plan
    pub fn add_operation(&mut self, operation: Operation) -> Result<OperationId> {
        let id = operation.id();
        if self.index.contains_key(&id) {
            return Err(KubeError::DuplicateOperation(id.to_string()));
        }

        let node = self.graph.add_node(PlanNode::new(operation));
        self.index.insert(id.clone(), node);
        Ok(id)
    }

    /// Make `dependent` wait for `prerequisite`
    ///
    /// Adding an existing edge is a no-op. An edge that would close a cycle
    /// is rejected.
    pub fn add_dependency(
        &mut self,
        prerequisite: &OperationId,
        dependent: &OperationId,
    ) -> Result<()> {
        let from = self.node(prerequisite)?;
        let to = self.node(dependent)?;

        if self.graph.find_edge(from, to).is_some() {
            return Ok(());
        }
        if from == to || has_path_connecting(&self.graph, to, from, None) {
            return Err(KubeError::Cycle {
                from: prerequisite.to_string(),
                to: dependent.to_string(),
            });
        }

        self.graph.add_edge(from, to, DependsOn);
        Ok(())
    }

    /// Add an operation that runs after `after` and before `before`
    pub fn insert_between(
        &mut self,
        operation: Operation,
        after: &OperationId,
        before: &OperationId,
    ) -> Result<OperationId> {
        let id = self.add_operation(operation)?;
        self.add_dependency(after, &id)?;
        self.add_dependency(&id, before)?;
        Ok(id)
    }

    /// Add an operation that runs after `anchor`
    pub fn insert_after(&mut self, operation: Operation, anchor: &OperationId) -> Result<OperationId> {
        let id = self.add_operation(operation)?;
        self.add_dependency(anchor, &id)?;
        Ok(id)
    }

    pub fn get(&self, id: &OperationId) -> Option<&PlanNode> {
        self.index.get(id).and_then(|&n| self.graph.node_weight(n))
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.index.contains_key(id)
    }

    /// Operations whose id matches a pattern
    pub fn find_by_regex(&self, pattern: &Regex) -> Vec<&PlanNode> {
        let mut found: Vec<&PlanNode> = self
            .graph
            .node_weights()
            .filter(|n| pattern.is_match(n.id().as_str()))
            .collect();
        found.sort_by_key(|n| n.id());
        found
    }

    /// Direct prerequisites of an operation
    pub fn dependencies(&self, id: &OperationId) -> Result<Vec<OperationId>> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Operations that directly depend on an operation
    pub fn dependents(&self, id: &OperationId) -> Result<Vec<OperationId>> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Every operation reachable from `id`, excluding itself
    pub fn descendants(&self, id: &OperationId) -> Result<Vec<OperationId>> {
        let start = self.node(id)?;
        let mut bfs = Bfs::new(&self.graph, start);
        let mut found = Vec::new();

        while let Some(n) = bfs.next(&self.graph) {
            if n != start {
                found.push(self.graph[n].id());
            }
        }
        Ok(found)
    }

    /// Check for a direct edge
    pub fn has_dependency(&self, prerequisite: &OperationId, dependent: &OperationId) -> bool {
        match (self.index.get(prerequisite), self.index.get(dependent)) {
            (Some(&a), Some(&b)) => self.graph.find_edge(a, b).is_some(),
            _ => false,
        }
    }

    /// Check whether `dependent` transitively waits for `prerequisite`
    pub fn depends_on(&self, dependent: &OperationId, prerequisite: &OperationId) -> bool {
        match (self.index.get(prerequisite), self.index.get(dependent)) {
            (Some(&a), Some(&b)) => a != b && has_path_connecting(&self.graph, a, b, None),
            _ => false,
        }
    }

    /// Move an operation to a new status
    pub fn set_status(&mut self, id: &OperationId, status: OperationStatus) -> Result<()> {
        let n = self.node(id)?;
        self.graph[n].transition(status)
    }

    /// Mark a running operation failed with its error
    pub fn set_failed(&mut self, id: &OperationId, error: String) -> Result<()> {
        let n = self.node(id)?;
        self.graph[n].transition(OperationStatus::Failed)?;
        self.graph[n].error = Some(error);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &PlanNode> {
        self.graph.node_weights()
    }

    /// Operation ids in an order that respects every dependency
    pub fn topological_order(&self) -> Result<Vec<OperationId>> {
        toposort(&self.graph, None)
            .map(|order| order.into_iter().map(|n| self.graph[n].id()).collect())
            .map_err(|cycle| {
                let id = self.graph[cycle.node_id()].id().to_string();
                KubeError::Cycle {
                    from: id.clone(),
                    to: id,
                }
            })
    }

    /// Completed operations that did real work
    pub fn worthy_completed(&self) -> Vec<&PlanNode> {
        self.worthy_with(OperationStatus::Completed)
    }

    /// Failed operations that did real work
    pub fn worthy_failed(&self) -> Vec<&PlanNode> {
        self.worthy_with(OperationStatus::Failed)
    }

    /// Canceled operations that would have done real work
    pub fn worthy_canceled(&self) -> Vec<&PlanNode> {
        self.worthy_with(OperationStatus::Canceled)
    }

    fn worthy_with(&self, status: OperationStatus) -> Vec<&PlanNode> {
        let mut nodes: Vec<&PlanNode> = self
            .graph
            .node_weights()
            .filter(|n| n.status == status)
            .filter(|n| {
                matches!(
                    n.category(),
                    OperationCategory::Resource | OperationCategory::Track
                )
            })
            .collect();
        nodes.sort_by_key(|n| n.id());
        nodes
    }

    /// True when the plan touches no resources
    pub fn is_useless(&self) -> bool {
        !self.graph.node_weights().any(|n| {
            matches!(
                n.category(),
                OperationCategory::Resource | OperationCategory::Track
            )
        })
    }

    /// Graphviz rendering of the plan
    pub fn to_dot(&self) -> String {
        Dot::with_config(&self.graph, &[Config::EdgeNoLabel]).to_string()
    }

    /// Drop every edge implied by another path (transitive reduction)
    pub fn optimize(&mut self) {
        let edges: Vec<(NodeIndex, NodeIndex)> = self
            .graph
            .edge_indices()
            .filter_map(|e| self.graph.edge_endpoints(e))
            .collect();

        for (from, to) in edges {
            let Some(edge) = self.graph.find_edge(from, to) else {
                continue;
            };
            self.graph.remove_edge(edge);
            if !has_path_connecting(&self.graph, from, to, None) {
                self.graph.add_edge(from, to, DependsOn);
            }
        }
    }

    fn node(&self, id: &OperationId) -> Result<NodeIndex> {
        self.index
            .get(id)
            .copied()
            .ok_or_else(|| KubeError::OperationNotFound(id.to_string()))
    }

    fn neighbors(&self, id: &OperationId, dir: Direction) -> Result<Vec<OperationId>> {
        let n = self.node(id)?;
        let mut ids: Vec<OperationId> = self
            .graph
            .neighbors_directed(n, dir)
            .map(|m| self.graph[m].id())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(stage: Stage, position: MarkerPosition) -> Operation {
        Operation::marker(stage, position)
    }

    fn three_markers() -> (Plan, OperationId, OperationId, OperationId) {
        let mut plan = Plan::new();
        let a = plan.add_operation(marker(Stage::Init, MarkerPosition::StageStart)).unwrap();
        let b = plan.add_operation(marker(Stage::Init, MarkerPosition::StageEnd)).unwrap();
        let c = plan.add_operation(marker(Stage::Final, MarkerPosition::StageStart)).unwrap();
        (plan, a, b, c)
    }

    #[test]
    fn test_duplicate_operation() {
        let (mut plan, ..) = three_markers();
        let err = plan
            .add_operation(marker(Stage::Init, MarkerPosition::StageStart))
            .unwrap_err();
        assert!(matches!(err, KubeError::DuplicateOperation(_)));
    }

    #[test]
    fn test_cycle_rejected() {
        let (mut plan, a, b, c) = three_markers();
        plan.add_dependency(&a, &b).unwrap();
        plan.add_dependency(&b, &c).unwrap();

        let err = plan.add_dependency(&c, &a).unwrap_err();
        assert!(matches!(err, KubeError::Cycle { .. }));
        assert!(plan.add_dependency(&a, &a).is_err());
        assert_eq!(plan.edge_count(), 2);
    }

    #[test]
    fn test_unknown_operation() {
        let (mut plan, a, ..) = three_markers();
        let err = plan.add_dependency(&a, &OperationId::from("nope")).unwrap_err();
        assert!(matches!(err, KubeError::OperationNotFound(_)));
    }

    #[test]
    fn test_optimize_removes_transitive_edges() {
        let (mut plan, a, b, c) = three_markers();
        plan.add_dependency(&a, &b).unwrap();
        plan.add_dependency(&b, &c).unwrap();
        plan.add_dependency(&a, &c).unwrap();

        plan.optimize();
        assert_eq!(plan.edge_count(), 2);
        assert!(!plan.has_dependency(&a, &c));
        assert!(plan.depends_on(&c, &a));
    }

    #[test]
    fn test_insert_between_and_descendants() {
        let (mut plan, a, b, _) = three_markers();
        let mid = plan
            .insert_between(
                marker(Stage::Install, MarkerPosition::StageStart),
                &a,
                &b,
            )
            .unwrap();

        assert_eq!(plan.dependencies(&mid).unwrap(), vec![a.clone()]);
        assert_eq!(plan.dependents(&mid).unwrap(), vec![b.clone()]);

        let mut descendants = plan.descendants(&a).unwrap();
        descendants.sort();
        assert_eq!(descendants, vec![b, mid]);
    }

    #[test]
    fn test_find_by_regex_and_dot() {
        let (plan, ..) = three_markers();
        let found = plan.find_by_regex(&Regex::new("^stage/init/").unwrap());
        assert_eq!(found.len(), 2);

        let dot = plan.to_dot();
        assert!(dot.starts_with("digraph"));
        for node in plan.nodes() {
            assert!(dot.contains(node.id().as_str()));
        }
    }

    #[test]
    fn test_markers_only_plan_is_useless() {
        let (plan, ..) = three_markers();
        assert!(plan.is_useless());
        assert!(plan.worthy_completed().is_empty());
    }

    #[test]
    fn test_topological_order() {
        let (mut plan, a, b, c) = three_markers();
        plan.add_dependency(&c, &b).unwrap();
        plan.add_dependency(&b, &a).unwrap();

        assert_eq!(plan.topological_order().unwrap(), vec![c, b, a]);
    }
}
