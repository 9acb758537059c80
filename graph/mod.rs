/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Page dependency graph.
//!
//! Core structures:
//! - `DependencyGraph`: arena of nodes backed by petgraph::StableGraph
//! - `Node`: a network request or a main-thread CPU task
//!
//! An edge `a -> b` means `b` depends on `a`: `a` must finish before `b` can
//! start. A well-formed graph is acyclic with exactly one root.

use std::collections::{HashMap, HashSet, VecDeque};

use petgraph::stable_graph::{NodeIndex, StableGraph};
use petgraph::{Directed, Direction};

pub mod cpu_node;
pub mod network_node;
pub mod node;

pub use cpu_node::CpuNode;
pub use network_node::NetworkNode;
pub use node::{Node, NodeKind, NodeType};

/// Stable node handle (petgraph NodeIndex, survives other deletions)
pub type NodeKey = NodeIndex;

/// Which edges a cycle check follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleDirection {
    Dependents,
    Dependencies,
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    SelfDependency { id: String },
    CycleDetected,
    MissingRoot,
    MissingNode(NodeKey),
    /// `clone_with_relationships` was asked to clone a subgraph that leaves
    /// out the node it was invoked on.
    ClonedNodeExcluded { id: String },
    NoNetworkRecords,
    MainDocumentNotFound,
    RootNotInRedirectChain,
}

impl std::fmt::Display for GraphError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphError::SelfDependency { id } => write!(f, "node {id} cannot depend on itself"),
            GraphError::CycleDetected => write!(f, "dependency graph contains a cycle"),
            GraphError::MissingRoot => write!(f, "dependency graph has no root node"),
            GraphError::MissingNode(key) => write!(f, "node {} is not in the graph", key.index()),
            GraphError::ClonedNodeExcluded { id } => {
                write!(f, "cloned graph is missing node {id}")
            }
            GraphError::NoNetworkRecords => write!(f, "no network records to build a graph from"),
            GraphError::MainDocumentNotFound => write!(f, "could not find the main document"),
            GraphError::RootNotInRedirectChain => {
                write!(f, "root request is not part of the main document redirect chain")
            }
        }
    }
}

impl std::error::Error for GraphError {}

/// Dependency graph of a single page load.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    pub(crate) inner: StableGraph<Node, (), Directed>,

    /// Node id to key.
    id_to_node: HashMap<String, NodeKey>,

    /// Request URL to network nodes (duplicate URLs keep separate nodes).
    url_to_nodes: HashMap<String, Vec<NodeKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> NodeKey {
        let id = node.id.clone();
        let url = node.record().map(|record| record.url.clone());
        let key = self.inner.add_node(node);
        self.id_to_node.insert(id, key);
        if let Some(url) = url {
            self.url_to_nodes.entry(url).or_default().push(key);
        }
        key
    }

    /// Remove a node and every edge touching it.
    pub fn remove_node(&mut self, key: NodeKey) -> Option<Node> {
        let node = self.inner.remove_node(key)?;
        self.id_to_node.remove(&node.id);
        if let Some(record) = node.record()
            && let Some(keys) = self.url_to_nodes.get_mut(&record.url)
        {
            keys.retain(|&k| k != key);
            if keys.is_empty() {
                self.url_to_nodes.remove(&record.url);
            }
        }
        Some(node)
    }

    pub fn get_node(&self, key: NodeKey) -> Option<&Node> {
        self.inner.node_weight(key)
    }

    pub fn get_node_mut(&mut self, key: NodeKey) -> Option<&mut Node> {
        self.inner.node_weight_mut(key)
    }

    pub fn node(&self, key: NodeKey) -> Result<&Node, GraphError> {
        self.get_node(key).ok_or(GraphError::MissingNode(key))
    }

    pub fn get_node_key_by_id(&self, id: &str) -> Option<NodeKey> {
        self.id_to_node.get(id).copied()
    }

    pub fn get_nodes_by_url(&self, url: &str) -> &[NodeKey] {
        self.url_to_nodes.get(url).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes as (key, node) pairs, in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeKey, &Node)> {
        self.inner
            .node_indices()
            .map(move |idx| (idx, &self.inner[idx]))
    }

    pub fn node_count(&self) -> usize {
        self.inner.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.node_count() == 0
    }

    /// Record that `node` cannot start until `dependency` finishes.
    /// Adding an existing edge is a no-op.
    pub fn add_dependency(&mut self, node: NodeKey, dependency: NodeKey) -> Result<(), GraphError> {
        let id = &self.node(node)?.id;
        if node == dependency {
            return Err(GraphError::SelfDependency { id: id.clone() });
        }
        self.node(dependency)?;
        if self.inner.find_edge(dependency, node).is_none() {
            self.inner.add_edge(dependency, node, ());
        }
        Ok(())
    }

    pub fn add_dependent(&mut self, node: NodeKey, dependent: NodeKey) -> Result<(), GraphError> {
        self.add_dependency(dependent, node)
    }

    /// Returns whether an edge was removed.
    pub fn remove_dependency(&mut self, node: NodeKey, dependency: NodeKey) -> bool {
        match self.inner.find_edge(dependency, node) {
            Some(edge) => self.inner.remove_edge(edge).is_some(),
            None => false,
        }
    }

    pub fn remove_dependent(&mut self, node: NodeKey, dependent: NodeKey) -> bool {
        self.remove_dependency(dependent, node)
    }

    pub fn remove_all_dependencies(&mut self, node: NodeKey) {
        for dependency in self.dependencies(node) {
            self.remove_dependency(node, dependency);
        }
    }

    /// Upstream nodes, in the order the edges were added.
    pub fn dependencies(&self, key: NodeKey) -> Vec<NodeKey> {
        self.neighbors_in_insertion_order(key, Direction::Incoming)
    }

    /// Downstream nodes, in the order the edges were added.
    pub fn dependents(&self, key: NodeKey) -> Vec<NodeKey> {
        self.neighbors_in_insertion_order(key, Direction::Outgoing)
    }

    fn neighbors_in_insertion_order(&self, key: NodeKey, direction: Direction) -> Vec<NodeKey> {
        // petgraph yields the most recently added edge first.
        let mut keys: Vec<NodeKey> = self.inner.neighbors_directed(key, direction).collect();
        keys.reverse();
        keys
    }

    /// Follow first dependencies from `from` until a node with none.
    pub fn root_node(&self, from: NodeKey) -> NodeKey {
        let mut current = from;
        let mut seen = HashSet::new();
        while let Some(&next) = self.dependencies(current).first() {
            if !seen.insert(current) {
                break;
            }
            current = next;
        }
        current
    }

    /// The first node, in insertion order, without dependencies.
    pub fn root(&self) -> Result<NodeKey, GraphError> {
        self.inner
            .node_indices()
            .find(|&key| {
                self.inner
                    .neighbors_directed(key, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .ok_or(GraphError::MissingRoot)
    }

    pub fn main_document(&self) -> Option<NodeKey> {
        self.nodes()
            .find(|(_, node)| node.is_main_document)
            .map(|(key, _)| key)
    }

    /// Breadth-first walk from `start`, visiting each reachable node once.
    /// `next` picks the edges to follow; `visit` receives the node and its
    /// traversal path (the node first, `start` last).
    pub fn traverse_by<N, V>(&self, start: NodeKey, mut next: N, mut visit: V)
    where
        N: FnMut(&Self, NodeKey) -> Vec<NodeKey>,
        V: FnMut(NodeKey, &[NodeKey]),
    {
        let mut visited = HashSet::from([start]);
        let mut queue: VecDeque<Vec<NodeKey>> = VecDeque::from([vec![start]]);

        while let Some(path) = queue.pop_front() {
            let current = path[0];
            visit(current, &path);

            for key in next(self, current) {
                if !visited.insert(key) {
                    continue;
                }
                let mut child_path = Vec::with_capacity(path.len() + 1);
                child_path.push(key);
                child_path.extend_from_slice(&path);
                queue.push_back(child_path);
            }
        }
    }

    /// Walk dependents from `start`.
    pub fn traverse<V>(&self, start: NodeKey, visit: V)
    where
        V: FnMut(NodeKey, &[NodeKey]),
    {
        self.traverse_by(start, |graph, key| graph.dependents(key), visit);
    }

    /// Keys reachable from `start` through dependents, in traversal order.
    pub fn reachable_from(&self, start: NodeKey) -> Vec<NodeKey> {
        let mut keys = Vec::new();
        self.traverse(start, |key, _| keys.push(key));
        keys
    }

    /// True when `node` transitively depends on `target`. With
    /// `bidirectional`, also true when `target` depends on `node`.
    pub fn is_dependent_on(&self, node: NodeKey, target: NodeKey, bidirectional: bool) -> bool {
        let mut found = false;
        self.traverse_by(
            node,
            |graph, key| graph.dependencies(key),
            |key, _| found |= key == target,
        );
        if found || !bidirectional {
            return found;
        }
        self.traverse(node, |key, _| found |= key == target);
        found
    }

    /// Copy the graph reachable from the root of `key`.
    ///
    /// With a predicate, only nodes it selects are kept, together with every
    /// node on their dependency paths back to the root. Returns the clone and
    /// the clone's key for `key`; fails if the predicate dropped `key` itself.
    pub fn clone_with_relationships(
        &self,
        key: NodeKey,
        predicate: Option<&dyn Fn(&Node) -> bool>,
    ) -> Result<(DependencyGraph, NodeKey), GraphError> {
        let invoking_id = self.node(key)?.id.clone();
        let root = self.root_node(key);

        let mut included: HashSet<NodeKey> = HashSet::new();
        self.traverse(root, |original, _| {
            if included.contains(&original) {
                return;
            }
            let selected = match predicate {
                None => true,
                Some(predicate) => predicate(&self.inner[original]),
            };
            if !selected {
                return;
            }
            if predicate.is_none() {
                included.insert(original);
                return;
            }
            let mut lineage = Vec::new();
            self.traverse_by(
                original,
                |graph, k| {
                    graph
                        .dependencies(k)
                        .into_iter()
                        .filter(|dep| !included.contains(dep))
                        .collect()
                },
                |k, _| lineage.push(k),
            );
            included.extend(lineage);
        });

        let mut cloned = DependencyGraph::new();
        let mut key_map: HashMap<NodeKey, NodeKey> = HashMap::new();
        let order = self.reachable_from(root);
        for &original in order.iter().filter(|k| included.contains(k)) {
            let new_key = cloned.add_node(self.inner[original].clone_without_relationships());
            key_map.insert(original, new_key);
        }

        for &original in order.iter().filter(|k| included.contains(k)) {
            let cloned_node = key_map[&original];
            for dependency in self.dependencies(original) {
                let cloned_dependency = key_map
                    .get(&dependency)
                    .copied()
                    .ok_or(GraphError::MissingNode(dependency))?;
                cloned.add_dependency(cloned_node, cloned_dependency)?;
            }
        }

        let cloned_key = key_map
            .get(&key)
            .copied()
            .ok_or(GraphError::ClonedNodeExcluded { id: invoking_id })?;
        Ok((cloned, cloned_key))
    }

    /// Iterative depth-first cycle check from `start`.
    ///
    /// Tracks the current path rather than just visited nodes, so a node
    /// reached again through a different branch after backtracking is not
    /// mistaken for a cycle.
    pub fn has_cycle(&self, start: NodeKey, direction: CycleDirection) -> bool {
        let next = |key: NodeKey| match direction {
            CycleDirection::Dependents => self.dependents(key),
            _ => self.dependencies(key),
        };
        if direction == CycleDirection::Both {
            return self.has_cycle(start, CycleDirection::Dependents)
                || self.has_cycle(start, CycleDirection::Dependencies);
        }

        let mut visited: HashSet<NodeKey> = HashSet::new();
        let mut current_path: Vec<NodeKey> = Vec::new();
        // Each entry carries the path length at the time it was reached.
        let mut to_visit: Vec<(NodeKey, usize)> = vec![(start, 0)];

        while let Some((current, depth)) = to_visit.pop() {
            current_path.truncate(depth);
            if current_path.contains(&current) {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            current_path.push(current);

            let depth = current_path.len();
            for neighbor in next(current) {
                to_visit.push((neighbor, depth));
            }
        }
        false
    }

    /// Drop `key`, wiring each of its dependencies to each of its dependents.
    pub fn prune_node(&mut self, key: NodeKey) -> Result<(), GraphError> {
        let dependencies = self.dependencies(key);
        let dependents = self.dependents(key);
        for &dependent in &dependents {
            for &dependency in &dependencies {
                if dependency != dependent {
                    self.add_dependency(dependent, dependency)?;
                }
            }
        }
        self.remove_node(key);
        Ok(())
    }
}
