use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use strata_core::error::{Result, StrataError};
use strata_core::traits::Navigator;
use strata_core::types::{IoNames, Location, NodeKind, Routine, StepInfo, VarMap};

use crate::condition::evaluate_condition;

pub const NATIVE_GRAPH_TYPE: &str = "native";

/// A node in a native routine graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeNode {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub tool: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Static step input.
    #[serde(default)]
    pub config: Value,
}

/// A directed edge. Edges without a condition are always traversable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeGraph {
    pub nodes: Vec<NativeNode>,
    #[serde(default)]
    pub edges: Vec<NativeEdge>,
}

impl NativeGraph {
    pub fn parse(routine: &Routine) -> Result<Self> {
        serde_json::from_value(routine.definition.clone()).map_err(|e| {
            StrataError::Validation(format!("routine {} is not a native graph: {}", routine.id, e))
        })
    }

    fn node(&self, id: &str) -> Result<&NativeNode> {
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| StrataError::not_found("Node", id))
    }

    fn outgoing<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a NativeEdge> + 'a {
        self.edges.iter().filter(move |e| e.from == id)
    }

    /// Structural checks: unique ids, a start node, edges between known nodes.
    fn validate(&self) -> std::result::Result<(), String> {
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if !ids.insert(node.id.as_str()) {
                return Err(format!("duplicate node id {}", node.id));
            }
        }
        if !self.nodes.iter().any(|n| n.kind == NodeKind::Start) {
            return Err("no start node".into());
        }
        for edge in &self.edges {
            if !ids.contains(edge.from.as_str()) || !ids.contains(edge.to.as_str()) {
                return Err(format!("edge {} -> {} references unknown node", edge.from, edge.to));
            }
        }
        Ok(())
    }

    /// Task nodes from `from` up to the next join or end along the default
    /// path: unconditioned edges first, nested gateways listed in full.
    /// Used for planning; execution walks branches with
    /// `get_next_locations` against the branch's variables.
    fn branch_steps(&self, from: &str) -> Vec<String> {
        let mut steps = Vec::new();
        self.collect_branch_steps(from, &mut HashSet::new(), &mut steps);
        steps
    }

    fn collect_branch_steps(&self, from: &str, seen: &mut HashSet<String>, steps: &mut Vec<String>) {
        let mut current = Some(from.to_string());
        while let Some(id) = current.take() {
            if !seen.insert(id.clone()) {
                break;
            }
            let Ok(node) = self.node(&id) else { break };
            match node.kind {
                NodeKind::Join | NodeKind::End => break,
                NodeKind::ParallelGateway => {
                    for edge in self.outgoing(&id) {
                        self.collect_branch_steps(&edge.to, seen, steps);
                    }
                    current = self.join_for(&id);
                    continue;
                }
                kind if kind.is_executable() => steps.push(id.clone()),
                _ => {}
            }
            current = self
                .outgoing(&id)
                .find(|e| e.condition.is_none())
                .or_else(|| self.outgoing(&id).next())
                .map(|e| e.to.clone());
        }
    }

    /// The join closing a parallel gateway. Joins of nested gateways are
    /// passed over.
    fn join_for(&self, gateway: &str) -> Option<String> {
        let mut queue: VecDeque<(String, usize)> =
            self.outgoing(gateway).map(|e| (e.to.clone(), 0)).collect();
        let mut seen = HashSet::new();
        while let Some((id, depth)) = queue.pop_front() {
            if depth > self.nodes.len() || !seen.insert((id.clone(), depth)) {
                continue;
            }
            let node = self.node(&id).ok()?;
            let depth = match node.kind {
                NodeKind::Join if depth == 0 => return Some(id),
                NodeKind::Join => depth - 1,
                NodeKind::ParallelGateway => depth + 1,
                _ => depth,
            };
            queue.extend(self.outgoing(&id).map(|e| (e.to.clone(), depth)));
        }
        None
    }
}

/// Navigator for the BPMN-like `native` graph format.
///
/// ```json
/// {
///   "nodes": [
///     {"id": "start", "kind": "start"},
///     {"id": "fetch", "kind": "task", "strategy": "deterministic", "tool": "json_query"},
///     {"id": "end", "kind": "end"}
///   ],
///   "edges": [{"from": "start", "to": "fetch"}, {"from": "fetch", "to": "end"}]
/// }
/// ```
#[derive(Debug, Default)]
pub struct NativeNavigator;

impl NativeNavigator {
    pub fn new() -> Self {
        Self
    }

    fn location(routine: &Routine, node_id: &str) -> Location {
        Location::new(routine.id.clone(), node_id)
    }
}

impl Navigator for NativeNavigator {
    fn graph_type(&self) -> &str {
        NATIVE_GRAPH_TYPE
    }

    fn can_navigate(&self, routine: &Routine) -> bool {
        if routine.graph_type != NATIVE_GRAPH_TYPE {
            return false;
        }
        match NativeGraph::parse(routine).map(|g| g.validate()) {
            Ok(Ok(())) => true,
            Ok(Err(reason)) => {
                debug!(routine_id = %routine.id, %reason, "Native graph rejected");
                false
            }
            Err(e) => {
                debug!(routine_id = %routine.id, error = %e, "Native graph rejected");
                false
            }
        }
    }

    fn get_all_start_locations(&self, routine: &Routine) -> Result<Vec<Location>> {
        let graph = NativeGraph::parse(routine)?;
        Ok(graph
            .nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Start)
            .map(|n| Self::location(routine, &n.id))
            .collect())
    }

    fn get_next_locations(
        &self,
        routine: &Routine,
        location: &Location,
        variables: &VarMap,
    ) -> Result<Vec<Location>> {
        let graph = NativeGraph::parse(routine)?;
        let node = graph.node(location.node_id())?;

        let targets: Vec<String> = match node.kind {
            NodeKind::End => Vec::new(),
            NodeKind::ParallelGateway => graph.join_for(&node.id).into_iter().collect(),
            NodeKind::ExclusiveGateway => {
                let edges: Vec<_> = graph.outgoing(&node.id).collect();
                match edges.iter().find(|e| {
                    e.condition
                        .as_deref()
                        .is_some_and(|c| evaluate_condition(c, variables))
                }) {
                    Some(edge) => vec![edge.to.clone()],
                    None => edges
                        .iter()
                        .filter(|e| e.condition.is_none())
                        .map(|e| e.to.clone())
                        .collect(),
                }
            }
            _ => graph
                .outgoing(&node.id)
                .filter(|e| {
                    e.condition
                        .as_deref()
                        .map_or(true, |c| evaluate_condition(c, variables))
                })
                .map(|e| e.to.clone())
                .collect(),
        };

        Ok(targets
            .iter()
            .map(|id| Self::location(routine, id))
            .collect())
    }

    fn get_successors(&self, routine: &Routine, location: &Location) -> Result<Vec<Location>> {
        let graph = NativeGraph::parse(routine)?;
        graph.node(location.node_id())?;
        Ok(graph
            .outgoing(location.node_id())
            .map(|e| Self::location(routine, &e.to))
            .collect())
    }

    fn get_io_names_passed_into_node(
        &self,
        routine: &Routine,
        location: &Location,
    ) -> Result<IoNames> {
        let graph = NativeGraph::parse(routine)?;
        let node = graph.node(location.node_id())?;
        Ok(IoNames {
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
        })
    }

    fn get_parallel_branches(
        &self,
        routine: &Routine,
        location: &Location,
    ) -> Result<Vec<Vec<Location>>> {
        let graph = NativeGraph::parse(routine)?;
        let node = graph.node(location.node_id())?;
        if node.kind != NodeKind::ParallelGateway {
            return Ok(Vec::new());
        }
        Ok(graph
            .outgoing(&node.id)
            .map(|edge| {
                graph
                    .branch_steps(&edge.to)
                    .iter()
                    .map(|id| Self::location(routine, id))
                    .collect()
            })
            .collect())
    }

    fn get_step_info(&self, routine: &Routine, location: &Location) -> Result<StepInfo> {
        let graph = NativeGraph::parse(routine)?;
        let node = graph.node(location.node_id())?;
        Ok(StepInfo {
            node_id: node.id.clone(),
            kind: node.kind,
            name: node.name.clone().unwrap_or_else(|| node.id.clone()),
            strategy: node.strategy.clone(),
            tool: node.tool.clone(),
            inputs: node.inputs.clone(),
            outputs: node.outputs.clone(),
            config: node.config.clone(),
        })
    }

    fn is_end_location(&self, routine: &Routine, location: &Location) -> bool {
        let Ok(graph) = NativeGraph::parse(routine) else {
            return true;
        };
        match graph.node(location.node_id()) {
            Ok(node) => {
                node.kind == NodeKind::End || graph.outgoing(&node.id).next().is_none()
            }
            Err(_) => true,
        }
    }
}
