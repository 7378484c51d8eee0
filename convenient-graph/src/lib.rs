//! Owned, keyed directed graph for build dependency resolution.
//!
//! Vertices are stored under a caller-chosen key (a task id, a configuration
//! id, ...). An edge `(from, to)` means "`from` depends on `to`": `to` has to
//! finish before `from` may start.
//!
//! Unlike a DAG that refuses cyclic edges up front, this graph accepts any
//! edge between existing vertices and leaves acyclicity to the caller, so a
//! validator can report *which* cycle a request contains instead of failing
//! at construction time.
//!
//! # Features
//!
//! - Keyed vertices with deterministic (ordered) iteration
//! - Edges restricted to vertices present in the graph
//! - DFS cycle detection returning the offending path
//! - Reverse (dependant) lookups for failure propagation
//! - Optional serde support
//!
//! # Example
//!
//! ```
//! use convenient_graph::Graph;
//!
//! let mut graph = Graph::<&str, u32>::new();
//! graph.add_vertex("app", 1);
//! graph.add_vertex("lib", 2);
//! graph.add_vertex("core", 3);
//!
//! graph.add_edge("app", "lib").unwrap(); // app depends on lib
//! graph.add_edge("lib", "core").unwrap(); // lib depends on core
//!
//! assert!(graph.find_cycle().is_none());
//! assert!(graph.dependants(&"core").unwrap().contains("lib"));
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(unused_results)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Error types for graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// Vertex not found
    #[error("Vertex {0} not found in graph")]
    VertexNotFound(String),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// A directed edge. `from` depends on `to`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Edge<K> {
    /// Dependent vertex
    pub from: K,
    /// Dependency vertex
    pub to: K,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
struct Vertex<K, N> {
    data: N,
    // Vertices this one depends on
    dependencies: BTreeSet<K>,
    // Vertices depending on this one
    dependants: BTreeSet<K>,
}

/// Keyed directed graph.
///
/// Lookups are O(log V); cycle detection is O(V + E).
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Graph<K: Ord, N> {
    vertices: BTreeMap<K, Vertex<K, N>>,
    edge_count: usize,
}

impl<K: Ord, N> Default for Graph<K, N> {
    fn default() -> Self {
        Self {
            vertices: BTreeMap::new(),
            edge_count: 0,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    OnPath,
    Done,
}

impl<K, N> Graph<K, N>
where
    K: Ord + Clone + fmt::Display,
{
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a vertex. Returns `false` and leaves the graph untouched if the
    /// key is already present.
    pub fn add_vertex(&mut self, key: K, data: N) -> bool {
        if self.vertices.contains_key(&key) {
            return false;
        }
        let _ = self.vertices.insert(
            key,
            Vertex {
                data,
                dependencies: BTreeSet::new(),
                dependants: BTreeSet::new(),
            },
        );
        true
    }

    /// Record that `from` depends on `to`.
    ///
    /// Adding an existing edge again is a no-op. Cycles are accepted; use
    /// [`Graph::find_cycle`] to detect them.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::VertexNotFound` if either endpoint is missing.
    pub fn add_edge(&mut self, from: K, to: K) -> GraphResult<()> {
        if !self.vertices.contains_key(&from) {
            return Err(GraphError::VertexNotFound(from.to_string()));
        }
        if !self.vertices.contains_key(&to) {
            return Err(GraphError::VertexNotFound(to.to_string()));
        }

        let mut inserted = false;
        if let Some(vertex) = self.vertices.get_mut(&from) {
            inserted = vertex.dependencies.insert(to.clone());
        }
        if inserted {
            if let Some(vertex) = self.vertices.get_mut(&to) {
                let _ = vertex.dependants.insert(from);
            }
            self.edge_count += 1;
        }
        Ok(())
    }

    /// Whether a vertex with this key exists.
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.vertices.contains_key(key)
    }

    /// Vertex data.
    #[must_use]
    pub fn vertex(&self, key: &K) -> Option<&N> {
        self.vertices.get(key).map(|v| &v.data)
    }

    /// Mutable vertex data.
    pub fn vertex_mut(&mut self, key: &K) -> Option<&mut N> {
        self.vertices.get_mut(key).map(|v| &mut v.data)
    }

    /// All vertices with their data, in key order.
    pub fn vertices(&self) -> impl Iterator<Item = (&K, &N)> {
        self.vertices.iter().map(|(k, v)| (k, &v.data))
    }

    /// All edges, ordered by `(from, to)`.
    #[must_use]
    pub fn edges(&self) -> Vec<Edge<K>> {
        self.vertices
            .iter()
            .flat_map(|(from, v)| {
                v.dependencies.iter().map(move |to| Edge {
                    from: from.clone(),
                    to: to.clone(),
                })
            })
            .collect()
    }

    /// Number of vertices.
    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Whether the graph has no vertices.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    /// Direct dependencies of a vertex.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::VertexNotFound` if the vertex doesn't exist.
    pub fn dependencies(&self, key: &K) -> GraphResult<&BTreeSet<K>> {
        self.vertices
            .get(key)
            .map(|v| &v.dependencies)
            .ok_or_else(|| GraphError::VertexNotFound(key.to_string()))
    }

    /// Direct dependants of a vertex.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::VertexNotFound` if the vertex doesn't exist.
    pub fn dependants(&self, key: &K) -> GraphResult<&BTreeSet<K>> {
        self.vertices
            .get(key)
            .map(|v| &v.dependants)
            .ok_or_else(|| GraphError::VertexNotFound(key.to_string()))
    }

    /// Find a cycle using depth-first search.
    ///
    /// Returns the vertices of the first cycle found, starting and ending at
    /// the same vertex (e.g. `[a, b, c, a]`), or `None` for an acyclic graph.
    /// The search is iterative so deep chains don't exhaust the stack.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<K>> {
        let mut marks: BTreeMap<&K, Mark> = BTreeMap::new();

        for start in self.vertices.keys() {
            if marks.contains_key(start) {
                continue;
            }

            // (vertex, iterator position into its dependencies)
            let mut path: Vec<(&K, std::collections::btree_set::Iter<'_, K>)> = Vec::new();
            let _ = marks.insert(start, Mark::OnPath);
            path.push((start, self.vertices[start].dependencies.iter()));

            while let Some((current, deps)) = path.last_mut() {
                let current = *current;
                match deps.next() {
                    Some(next) => match marks.get(next) {
                        Some(Mark::OnPath) => {
                            let begin = path
                                .iter()
                                .position(|(k, _)| *k == next)
                                .unwrap_or(0);
                            let mut cycle: Vec<K> =
                                path[begin..].iter().map(|(k, _)| (*k).clone()).collect();
                            cycle.push(next.clone());
                            return Some(cycle);
                        }
                        Some(Mark::Done) => {}
                        None => {
                            let _ = marks.insert(next, Mark::OnPath);
                            path.push((next, self.vertices[next].dependencies.iter()));
                        }
                    },
                    None => {
                        let _ = marks.insert(current, Mark::Done);
                        let _ = path.pop();
                    }
                }
            }
        }

        None
    }
}
