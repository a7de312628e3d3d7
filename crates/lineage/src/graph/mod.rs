//! Lineage graph: derived nodes and their depends-on edges.
//!
//! Edges point from a node to its inputs (`depends_on`). Inputs are either
//! other nodes or source IDs; an input that is not a declared node is treated
//! as a source. The graph is kept acyclic at all times: [`LineageGraph::add_node`]
//! refuses any edge that would close a cycle and leaves the graph untouched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use tipoff_core::{LineageNode, NodeId, NodeKind};

use crate::error::{LineageError, StorageError};
use crate::registry::ContentRegistry;

type NodeMap = IndexMap<NodeId, LineageNode>;

/// Serializable graph state for the lineage store. Nodes are kept in
/// insertion order, which is also the topological tie-break order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub nodes: Vec<LineageNode>,
}

#[derive(Default)]
pub struct LineageGraph {
    nodes: RwLock<NodeMap>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a graph from a snapshot, re-validating acyclicity.
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Result<Self, LineageError> {
        let nodes: NodeMap = snapshot
            .nodes
            .into_iter()
            .map(|n| (n.node_id.clone(), n))
            .collect();
        let all: HashSet<&str> = nodes.keys().map(String::as_str).collect();
        order_subset(&nodes, &all)?;
        Ok(Self {
            nodes: RwLock::new(nodes),
        })
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, NodeMap>, LineageError> {
        self.nodes
            .read()
            .map_err(|e| StorageError::LockPoisoned(format!("lineage graph: {e}")).into())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, NodeMap>, LineageError> {
        self.nodes
            .write()
            .map_err(|e| StorageError::LockPoisoned(format!("lineage graph: {e}")).into())
    }

    // ── Mutation ────────────────────────────────────────────────

    /// Insert a node or update an existing node's kind and inputs.
    ///
    /// An existing node keeps its generator version and insertion position.
    pub fn add_node(
        &self,
        node_id: &str,
        kind: NodeKind,
        depends_on: Vec<String>,
    ) -> Result<(), LineageError> {
        let version = self
            .read()?
            .get(node_id)
            .map(|n| n.generator_version)
            .unwrap_or(1);
        self.upsert(LineageNode::new(node_id, kind, depends_on).with_generator_version(version))
    }

    /// Insert or update a node, taking its generator version from `node`.
    ///
    /// Rejects with [`LineageError::CycleDetected`] when an input is the node
    /// itself or reaches it through existing edges.
    pub fn upsert(&self, node: LineageNode) -> Result<(), LineageError> {
        let mut nodes = self.write()?;

        if let Some(cycle) = find_cycle(&nodes, &node.node_id, &node.depends_on) {
            return Err(LineageError::CycleDetected(cycle));
        }

        match nodes.get_mut(&node.node_id) {
            Some(existing) => {
                if existing.depends_on != node.depends_on {
                    // New inputs invalidate whatever was computed before.
                    existing.last_computed_at = None;
                    existing.computed_version = None;
                    existing.depends_on = node.depends_on;
                }
                existing.node_kind = node.node_kind;
                existing.generator_version = node.generator_version;
                debug!(node_id = %existing.node_id, "lineage node updated");
            }
            None => {
                debug!(node_id = %node.node_id, kind = %node.node_kind, deps = node.depends_on.len(), "lineage node added");
                nodes.insert(node.node_id.clone(), node);
            }
        }
        Ok(())
    }

    /// Record a successful computation of `node_id` at `at`.
    pub fn mark_computed(&self, node_id: &str, at: DateTime<Utc>) -> Result<(), LineageError> {
        let mut nodes = self.write()?;
        let node = nodes
            .get_mut(node_id)
            .ok_or_else(|| LineageError::UnknownNode(node_id.to_string()))?;
        node.last_computed_at = Some(at);
        node.computed_version = Some(node.generator_version);
        Ok(())
    }

    // ── Queries ─────────────────────────────────────────────────

    /// Nodes reachable downstream from `roots` (roots that are nodes included),
    /// in dependency order. Ties are broken by insertion order.
    pub fn topological_order<S: AsRef<str>>(&self, roots: &[S]) -> Result<Vec<NodeId>, LineageError> {
        let nodes = self.read()?;
        let mut reach = downstream(&nodes, roots.iter().map(AsRef::as_ref));
        for root in roots {
            if let Some((key, _)) = nodes.get_key_value(root.as_ref()) {
                reach.insert(key.as_str());
            }
        }
        order_subset(&nodes, &reach)
    }

    /// Every node in the graph, in dependency order.
    pub fn full_order(&self) -> Result<Vec<NodeId>, LineageError> {
        let nodes = self.read()?;
        let all: HashSet<&str> = nodes.keys().map(String::as_str).collect();
        order_subset(&nodes, &all)
    }

    /// Nodes transitively depending on any of `changed_ids`, in dependency
    /// order. The changed IDs themselves are included only when another
    /// changed ID reaches them.
    pub fn downstream_closure<S: AsRef<str>>(
        &self,
        changed_ids: &[S],
    ) -> Result<Vec<NodeId>, LineageError> {
        let nodes = self.read()?;
        let reach = downstream(&nodes, changed_ids.iter().map(AsRef::as_ref));
        let ordered = order_subset(&nodes, &reach)?;
        info!(changed = changed_ids.len(), affected = ordered.len(), "downstream closure computed");
        Ok(ordered)
    }

    /// Derived nodes that need recomputation: never computed, computed with an
    /// older generator version, or older than any of their inputs. Staleness
    /// propagates downstream. Returned in dependency order.
    pub fn stale_nodes(&self, registry: &ContentRegistry) -> Result<Vec<NodeId>, LineageError> {
        let nodes = self.read()?;
        let all: HashSet<&str> = nodes.keys().map(String::as_str).collect();
        let order = order_subset(&nodes, &all)?;

        let mut stale: HashSet<&str> = HashSet::new();
        for id in &order {
            let Some(node) = nodes.get(id) else { continue };
            let Some(computed_at) = node.last_computed_at else {
                stale.insert(node.node_id.as_str());
                continue;
            };
            let mut is_stale = node.computed_version != Some(node.generator_version);
            for dep in &node.depends_on {
                if is_stale {
                    break;
                }
                is_stale = match nodes.get(dep) {
                    Some(upstream) => {
                        stale.contains(dep.as_str())
                            || upstream.last_computed_at.map_or(true, |t| t > computed_at)
                    }
                    None => registry
                        .get(dep)?
                        .map_or(false, |source| source.ingested_at > computed_at),
                };
            }
            if is_stale {
                stale.insert(node.node_id.as_str());
            }
        }

        Ok(order.into_iter().filter(|id| stale.contains(id.as_str())).collect())
    }

    /// Inputs referenced by some node that are not themselves nodes (sources).
    pub fn external_inputs(&self) -> Result<Vec<String>, LineageError> {
        let nodes = self.read()?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for node in nodes.values() {
            for dep in &node.depends_on {
                if !nodes.contains_key(dep) && seen.insert(dep.as_str()) {
                    out.push(dep.clone());
                }
            }
        }
        Ok(out)
    }

    /// Direct dependents of `id`, in insertion order.
    pub fn dependents(&self, id: &str) -> Result<Vec<NodeId>, LineageError> {
        let nodes = self.read()?;
        Ok(nodes
            .values()
            .filter(|n| n.depends_on.iter().any(|d| d == id))
            .map(|n| n.node_id.clone())
            .collect())
    }

    pub fn node(&self, node_id: &str) -> Result<Option<LineageNode>, LineageError> {
        Ok(self.read()?.get(node_id).cloned())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes
            .read()
            .map(|n| n.contains_key(node_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.nodes.read().map(|n| n.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Result<GraphSnapshot, LineageError> {
        Ok(GraphSnapshot {
            nodes: self.read()?.values().cloned().collect(),
        })
    }
}

// ── Helpers ─────────────────────────────────────────────────────

/// Look for a path from any of `inputs` back to `node_id` along existing
/// depends-on edges. Returns the cycle rendered as `a -> b -> a`.
fn find_cycle(nodes: &NodeMap, node_id: &str, inputs: &[String]) -> Option<String> {
    let mut visited: HashSet<&str> = HashSet::new();
    for input in inputs {
        let mut path: Vec<&str> = Vec::new();
        if reaches(nodes, node_id, input, &mut visited, &mut path) {
            let mut cycle = vec![node_id];
            cycle.extend(path);
            return Some(cycle.join(" -> "));
        }
    }
    None
}

fn reaches<'a>(
    nodes: &'a NodeMap,
    target: &str,
    from: &'a str,
    visited: &mut HashSet<&'a str>,
    path: &mut Vec<&'a str>,
) -> bool {
    path.push(from);
    if from == target {
        return true;
    }
    if visited.insert(from) {
        if let Some(node) = nodes.get(from) {
            for dep in &node.depends_on {
                if reaches(nodes, target, dep, visited, path) {
                    return true;
                }
            }
        }
    }
    path.pop();
    false
}

/// Map each input ID to the nodes that depend on it, in insertion order.
fn dependents_index(nodes: &NodeMap) -> HashMap<&str, Vec<&str>> {
    let mut index: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes.values() {
        for dep in &node.depends_on {
            index.entry(dep.as_str()).or_default().push(node.node_id.as_str());
        }
    }
    index
}

/// Breadth-first walk along dependent edges. Seeds are not included unless
/// reached from another seed.
fn downstream<'a, 'b>(
    nodes: &'a NodeMap,
    seeds: impl Iterator<Item = &'b str>,
) -> HashSet<&'a str> {
    let index = dependents_index(nodes);
    let mut reached: HashSet<&'a str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::new();
    for seed in seeds {
        if let Some(children) = index.get(seed) {
            queue.extend(children.iter().copied());
        }
    }
    while let Some(id) = queue.pop_front() {
        if !reached.insert(id) {
            continue;
        }
        if let Some(children) = index.get(id) {
            queue.extend(children.iter().copied().filter(|c| !reached.contains(c)));
        }
    }
    reached
}

/// Kahn's algorithm over `subset`, considering only edges inside it.
/// Ready nodes are emitted lowest insertion index first.
fn order_subset(nodes: &NodeMap, subset: &HashSet<&str>) -> Result<Vec<NodeId>, LineageError> {
    if subset.is_empty() {
        return Ok(Vec::new());
    }

    let index = dependents_index(nodes);
    let mut in_degree: HashMap<&str, usize> = HashMap::with_capacity(subset.len());
    let mut ready: BinaryHeap<Reverse<usize>> = BinaryHeap::new();

    for &id in subset {
        let Some((pos, _, node)) = nodes.get_full(id) else {
            continue;
        };
        let degree = node
            .depends_on
            .iter()
            .filter(|d| subset.contains(d.as_str()))
            .count();
        in_degree.insert(id, degree);
        if degree == 0 {
            ready.push(Reverse(pos));
        }
    }

    let mut sorted = Vec::with_capacity(in_degree.len());
    while let Some(Reverse(pos)) = ready.pop() {
        let Some((id, _)) = nodes.get_index(pos) else {
            continue;
        };
        sorted.push(id.clone());
        for &child in index.get(id.as_str()).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(child) {
                *degree -= 1;
                if *degree == 0 {
                    if let Some(child_pos) = nodes.get_index_of(child) {
                        ready.push(Reverse(child_pos));
                    }
                }
            }
        }
    }

    if sorted.len() != in_degree.len() {
        let stuck: Vec<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d > 0)
            .map(|(&id, _)| id)
            .collect();
        return Err(LineageError::CycleDetected(format!(
            "unresolvable ordering among: {}",
            stuck.join(", ")
        )));
    }

    Ok(sorted)
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
