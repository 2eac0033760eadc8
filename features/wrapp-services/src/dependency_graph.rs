use std::{
    collections::{HashMap, HashSet},
    fmt::Display,
    hash::Hash,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use indexmap::IndexMap;

use crate::{
    errors::GraphError,
    types::{DependencyType, Selection},
};

/// Any type usable as a vertex of a [DependencyGraph]
pub trait Vertex: Clone + Eq + Hash + Display + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Display + Send + Sync + 'static> Vertex for T {}

/// Edge from a dependant to one of its dependencies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceEdge {
    pub kind: DependencyType,
}

/// Directed acyclic graph of dependencies between services
///
/// Used both for the declared relationships between service keys and for the
/// wiring between live service instances.
///
/// Vertices are created whenever they are referenced, querying an unknown vertex
/// simply returns no relations. The graph never holds a cycle and never more than
/// one edge between the same dependant and dependency.
pub struct DependencyGraph<V: Vertex> {
    inner: RwLock<GraphInner<V>>,
}

struct GraphInner<V: Vertex> {
    nodes: IndexMap<V, GraphNode<V>>,
    edge_count: usize,
}

struct GraphNode<V: Vertex> {
    /// Outgoing edges - what this vertex depends on
    dependencies: IndexMap<V, ServiceEdge>,
    /// Incoming edges - what depends on this vertex
    dependants: IndexMap<V, ServiceEdge>,
}
impl<V: Vertex> Default for GraphNode<V> {
    fn default() -> Self {
        GraphNode {
            dependencies: IndexMap::new(),
            dependants: IndexMap::new(),
        }
    }
}

impl<V: Vertex> Default for DependencyGraph<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Vertex> DependencyGraph<V> {
    pub fn new() -> Self {
        DependencyGraph {
            inner: RwLock::new(GraphInner {
                nodes: IndexMap::new(),
                edge_count: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphInner<V>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphInner<V>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a vertex
    ///
    /// Returns true if the vertex was not known before
    pub fn add_vertex(&self, vertex: V) -> bool {
        let mut inner = self.write();
        if inner.nodes.contains_key(&vertex) {
            return false;
        }
        inner.nodes.insert(vertex, GraphNode::default());
        true
    }

    pub fn contains(&self, vertex: &V) -> bool {
        self.read().nodes.contains_key(vertex)
    }

    /// Adds an edge from `dependant` to `dependency`
    ///
    /// Both vertices are added if missing. Fails if the pair already has an edge,
    /// or if the edge would close a cycle - in both cases the graph keeps its edges.
    pub fn create_dependency(
        &self,
        dependant: V,
        dependency: V,
        kind: DependencyType,
    ) -> Result<(), GraphError> {
        let mut inner = self.write();
        inner.nodes.entry(dependant.clone()).or_default();
        inner.nodes.entry(dependency.clone()).or_default();

        if let Some(existing) = inner.edge(&dependant, &dependency) {
            return Err(GraphError::DuplicateDependency {
                dependant: dependant.to_string(),
                dependency: dependency.to_string(),
                existing: existing.kind,
            });
        }

        if let Some(path) = inner.ancestor_path(&dependant, &dependency) {
            tracing::debug!(
                "Rejected dependency '{dependant}' -> '{dependency}', it would close a cycle"
            );
            return Err(GraphError::CycleDetected {
                dependant: dependant.to_string(),
                dependency: dependency.to_string(),
                path: path.iter().map(ToString::to_string).collect(),
            });
        }

        let edge = ServiceEdge { kind };
        if let Some(node) = inner.nodes.get_mut(&dependant) {
            node.dependencies.insert(dependency.clone(), edge);
        }
        if let Some(node) = inner.nodes.get_mut(&dependency) {
            node.dependants.insert(dependant, edge);
        }
        inner.edge_count += 1;

        Ok(())
    }

    /// Dependencies of `vertex` whose edge matches the selection
    pub fn find_dependencies(&self, vertex: &V, selection: Selection) -> Vec<V> {
        self.find_dependencies_with_kind(vertex, selection)
            .into_iter()
            .map(|(vertex, _)| vertex)
            .collect()
    }

    /// Dependants of `vertex` whose edge matches the selection
    pub fn find_dependants(&self, vertex: &V, selection: Selection) -> Vec<V> {
        self.find_dependants_with_kind(vertex, selection)
            .into_iter()
            .map(|(vertex, _)| vertex)
            .collect()
    }

    pub fn find_dependencies_with_kind(
        &self,
        vertex: &V,
        selection: Selection,
    ) -> Vec<(V, DependencyType)> {
        self.select(vertex, selection, |node| &node.dependencies)
    }

    pub fn find_dependants_with_kind(
        &self,
        vertex: &V,
        selection: Selection,
    ) -> Vec<(V, DependencyType)> {
        self.select(vertex, selection, |node| &node.dependants)
    }

    fn select(
        &self,
        vertex: &V,
        selection: Selection,
        edges: impl Fn(&GraphNode<V>) -> &IndexMap<V, ServiceEdge>,
    ) -> Vec<(V, DependencyType)> {
        {
            let inner = self.read();
            if let Some(node) = inner.nodes.get(vertex) {
                return edges(node)
                    .iter()
                    .filter(|(_, edge)| selection.matches(edge.kind))
                    .map(|(vertex, edge)| (vertex.clone(), edge.kind))
                    .collect();
            }
        }

        // Unknown vertices are added so they show up in the graph from now on
        self.add_vertex(vertex.clone());
        Vec::new()
    }

    /// True if `dependant` has an edge to `dependency`
    pub fn has_dependency(&self, dependant: &V, dependency: &V) -> bool {
        self.get_edge(dependant, dependency).is_some()
    }

    /// True if `dependant` has an edge to `dependency`, queried from the dependency side
    pub fn has_dependant(&self, dependency: &V, dependant: &V) -> bool {
        self.read()
            .nodes
            .get(dependency)
            .is_some_and(|node| node.dependants.contains_key(dependant))
    }

    pub fn get_edge(&self, dependant: &V, dependency: &V) -> Option<ServiceEdge> {
        self.read().edge(dependant, dependency)
    }

    /// True if the edge from `dependant` to `dependency` exists and is optional
    pub fn is_optional_dependency(&self, dependency: &V, dependant: &V) -> bool {
        self.get_edge(dependant, dependency)
            .is_some_and(|edge| edge.kind.is_optional())
    }

    /// Every vertex reachable from `vertex` through dependency edges
    pub fn transitive_dependencies(&self, vertex: &V) -> Vec<V> {
        let inner = self.read();
        let mut seen = HashSet::new();
        let mut result = Vec::new();
        let mut stack = vec![vertex];

        while let Some(current) = stack.pop() {
            let Some(node) = inner.nodes.get(current) else {
                continue;
            };
            for next in node.dependencies.keys() {
                if seen.insert(next) {
                    result.push(next.clone());
                    stack.push(next);
                }
            }
        }

        result
    }

    /// Number of vertices
    pub fn size(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.read().edge_count
    }

    pub fn vertices(&self) -> Vec<V> {
        self.read().nodes.keys().cloned().collect()
    }
}

impl<V: Vertex> GraphInner<V> {
    fn edge(&self, dependant: &V, dependency: &V) -> Option<ServiceEdge> {
        self.nodes
            .get(dependant)
            .and_then(|node| node.dependencies.get(dependency))
            .copied()
    }

    /// Walks the predecessors of `dependant` looking for `dependency`
    ///
    /// Returns the dependency chain from `dependency` down to `dependant` if found,
    /// which is the cycle a new edge `dependant -> dependency` would close.
    fn ancestor_path<'a>(&'a self, dependant: &'a V, dependency: &V) -> Option<Vec<&'a V>> {
        if dependant == dependency {
            return Some(vec![dependant]);
        }

        // child of each visited ancestor, to rebuild the path
        let mut reached_from: HashMap<&V, &V> = HashMap::new();
        let mut stack = vec![dependant];

        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };

            for ancestor in node.dependants.keys() {
                if ancestor == dependant || reached_from.contains_key(ancestor) {
                    continue;
                }
                reached_from.insert(ancestor, current);

                if ancestor == dependency {
                    let mut path = vec![ancestor];
                    let mut step = ancestor;
                    while let Some(&next) = reached_from.get(step) {
                        path.push(next);
                        step = next;
                    }
                    return Some(path);
                }

                stack.push(ancestor);
            }
        }

        None
    }
}
