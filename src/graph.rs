use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::fmt::{self, Debug, Formatter};
use std::ops::Index;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use slab::Slab;

use crate::error::{Error, Result};
use crate::hash::Identity;
use crate::task::{Const, Task};

/// Identifies a node within one graph.
///
/// Ids are assigned in insertion order and stay valid for the graph's
/// lifetime; they index the rewritten plan as well.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    /// The position of the node in insertion order.
    pub fn index(self) -> usize {
        self.0
    }
}

/// A node: a task and the keys of its dependencies, in argument order.
pub struct Node<V> {
    key: String,
    task: Arc<dyn Task<V>>,
    deps: Vec<String>,
}

impl<V> Node<V> {
    /// The node's unique key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The node's task.
    pub fn task(&self) -> &Arc<dyn Task<V>> {
        &self.task
    }

    /// The keys of the node's dependencies in declared order.
    pub fn deps(&self) -> &[String] {
        &self.deps
    }
}

impl<V> Debug for Node<V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("key", &self.key)
            .field("task", &self.task.label())
            .field("deps", &self.deps)
            .finish()
    }
}

/// A task graph keyed by node names.
///
/// Dependencies are referenced by key and may name nodes that are inserted
/// later. They are resolved, and the graph validated, by
/// [`resolve`](Self::resolve). Nodes cannot be changed after insertion.
pub struct Graph<V> {
    /// Nodes in insertion order.
    nodes: Slab<Node<V>>,
    /// Maps from keys to slab indices.
    index: FxHashMap<String, usize>,
    /// The keys of the requested outputs.
    outputs: Vec<String>,
}

impl<V> Graph<V> {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self { nodes: Slab::new(), index: FxHashMap::default(), outputs: Vec::new() }
    }

    /// Insert a node computing `task` from the nodes named in `deps`.
    pub fn insert<I, S>(
        &mut self,
        key: impl Into<String>,
        task: impl Task<V> + 'static,
        deps: I,
    ) -> Result<NodeId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.insert_arc(key, Arc::new(task), deps)
    }

    /// Insert a node with a shared task.
    pub fn insert_arc<I, S>(
        &mut self,
        key: impl Into<String>,
        task: Arc<dyn Task<V>>,
        deps: I,
    ) -> Result<NodeId>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let key = key.into();
        if self.index.contains_key(&key) {
            return Err(Error::DuplicateKey { key });
        }

        let deps = deps.into_iter().map(Into::into).collect();
        let id = self.nodes.insert(Node { key: key.clone(), task, deps });
        self.index.insert(key, id);
        Ok(NodeId(id))
    }

    /// Insert a constant node.
    pub fn constant(&mut self, key: impl Into<String>, value: V) -> Result<NodeId>
    where
        V: Identity + Clone + Send + Sync + 'static,
    {
        self.insert(key, Const(value), std::iter::empty::<String>())
    }

    /// Mark a node as an output of the graph.
    pub fn output(&mut self, key: impl Into<String>) -> &mut Self {
        self.outputs.push(key.into());
        self
    }

    /// The keys of the requested outputs.
    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    /// Look up a node's id by key.
    pub fn id(&self, key: &str) -> Option<NodeId> {
        self.index.get(key).copied().map(NodeId)
    }

    /// Access a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Node<V>> {
        self.nodes.get(id.0)
    }

    /// The number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over all nodes in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node<V>)> {
        self.nodes.iter().map(|(i, node)| (NodeId(i), node))
    }

    /// Validate the graph and order the ancestors of its outputs.
    pub fn resolve(&self) -> Result<Topology> {
        if self.outputs.is_empty() {
            return Err(Error::NoOutputs);
        }

        let outputs = self
            .outputs
            .iter()
            .map(|key| self.id(key).ok_or_else(|| Error::UnknownOutput { key: key.clone() }))
            .collect::<Result<Vec<_>>>()?;

        self.order(&outputs)
    }

    /// Validate the whole graph and order all of its nodes, regardless of
    /// which ones are outputs.
    pub fn resolve_all(&self) -> Result<Topology> {
        let all = self.iter().map(|(id, _)| id).collect::<Vec<_>>();
        let mut topology = self.order(&all)?;
        topology.outputs = self
            .outputs
            .iter()
            .filter_map(|key| self.id(key))
            .collect();
        Ok(topology)
    }

    /// Resolve dependency keys and compute a topological order over the
    /// ancestors of `roots`.
    ///
    /// Ties are broken by insertion order so that the order, and with it
    /// every report derived from it, is deterministic.
    fn order(&self, roots: &[NodeId]) -> Result<Topology> {
        let n = self.nodes.capacity();
        let mut deps = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        let mut included = vec![false; n];

        // Collect the ancestor closure and resolve its edges.
        let mut stack = roots.iter().map(|id| id.0).collect::<Vec<_>>();
        while let Some(i) = stack.pop() {
            if std::mem::replace(&mut included[i], true) {
                continue;
            }
            let node = &self.nodes[i];
            for dep in &node.deps {
                let Some(&j) = self.index.get(dep) else {
                    return Err(Error::UnknownDependency {
                        key: node.key.clone(),
                        dependency: dep.clone(),
                    });
                };
                deps[i].push(NodeId(j));
                stack.push(j);
            }
        }

        // Kahn's algorithm with a min-heap for the tie break.
        let mut pending = vec![0usize; n];
        let mut ready = BinaryHeap::new();
        for i in (0..n).filter(|&i| included[i]) {
            pending[i] = deps[i].len();
            for dep in &deps[i] {
                dependents[dep.0].push(i);
            }
            if deps[i].is_empty() {
                ready.push(Reverse(i));
            }
        }

        let mut order = Vec::new();
        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeId(i));
            for &k in &dependents[i] {
                // A node that depends on the same node twice has two edges.
                pending[k] -= 1;
                if pending[k] == 0 {
                    ready.push(Reverse(k));
                }
            }
        }

        let total = included.iter().filter(|&&inc| inc).count();
        if order.len() != total {
            let stuck = (0..n).filter(|&i| included[i] && pending[i] > 0);
            let key = self.cycle_member(stuck, &deps, &pending);
            return Err(Error::Cycle { key });
        }

        Ok(Topology { order, deps, outputs: roots.to_vec() })
    }

    /// Find a node that lies on a cycle among the nodes Kahn's algorithm
    /// could not order.
    ///
    /// Some stuck nodes only sit downstream of a cycle. Walking backwards
    /// along unresolved dependencies must eventually revisit a node that is
    /// still awaiting its own result, and that node is on the cycle.
    fn cycle_member(
        &self,
        mut stuck: impl Iterator<Item = usize>,
        deps: &[Vec<NodeId>],
        pending: &[usize],
    ) -> String {
        let Some(mut cursor) = stuck.next() else {
            return String::new();
        };
        let mut seen = vec![false; deps.len()];
        loop {
            if std::mem::replace(&mut seen[cursor], true) {
                return self.nodes[cursor].key.clone();
            }
            match deps[cursor].iter().find(|dep| pending[dep.0] > 0) {
                Some(dep) => cursor = dep.0,
                None => return self.nodes[cursor].key.clone(),
            }
        }
    }
}

impl<V> Index<NodeId> for Graph<V> {
    type Output = Node<V>;

    fn index(&self, id: NodeId) -> &Node<V> {
        &self.nodes[id.0]
    }
}

impl<V> Default for Graph<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Debug for Graph<V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.nodes.iter().map(|(_, n)| n).collect::<Vec<_>>())
            .field("outputs", &self.outputs)
            .finish()
    }
}

/// A validated, topologically ordered view of (part of) a graph.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Nodes in dependency order.
    order: Vec<NodeId>,
    /// Resolved dependencies per node index. Empty for excluded nodes.
    deps: Vec<Vec<NodeId>>,
    /// The requested outputs.
    outputs: Vec<NodeId>,
}

impl Topology {
    /// Nodes in dependency order: every node comes after all of its
    /// dependencies.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// The resolved dependencies of a node in declared order.
    pub fn deps(&self, id: NodeId) -> &[NodeId] {
        self.deps.get(id.0).map_or(&[], Vec::as_slice)
    }

    /// The requested outputs.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// The size of the id space, i.e. one past the largest node index.
    pub(crate) fn capacity(&self) -> usize {
        self.deps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_fn;

    fn sum() -> crate::FnTask<i64> {
        task_fn!("sum", |xs: &[&i64]| Ok(xs.iter().copied().sum()))
    }

    fn keys<V>(graph: &Graph<V>, ids: &[NodeId]) -> Vec<String> {
        ids.iter().map(|&id| graph.node(id).unwrap().key().to_string()).collect()
    }

    #[test]
    fn test_forward_references() {
        let mut graph = Graph::new();
        graph.insert("c", sum(), ["a", "b"]).unwrap();
        graph.insert("b", sum(), ["a"]).unwrap();
        graph.constant("a", 1).unwrap();
        graph.output("c");

        let topology = graph.resolve().unwrap();
        assert_eq!(keys(&graph, topology.order()), ["a", "b", "c"]);
        let c = graph.id("c").unwrap();
        assert_eq!(keys(&graph, topology.deps(c)), ["a", "b"]);
    }

    #[test]
    fn test_ties_follow_insertion_order() {
        let mut graph = Graph::new();
        graph.constant("z", 1).unwrap();
        graph.constant("y", 2).unwrap();
        graph.constant("x", 3).unwrap();
        graph.insert("out", sum(), ["x", "y", "z"]).unwrap();
        graph.output("out");

        let topology = graph.resolve().unwrap();
        assert_eq!(keys(&graph, topology.order()), ["z", "y", "x", "out"]);
    }

    #[test]
    fn test_only_ancestors_of_outputs() {
        let mut graph = Graph::new();
        graph.constant("a", 1).unwrap();
        graph.constant("unused", 2).unwrap();
        graph.insert("b", sum(), ["a"]).unwrap();
        graph.output("b");

        let topology = graph.resolve().unwrap();
        assert_eq!(keys(&graph, topology.order()), ["a", "b"]);
        assert_eq!(graph.resolve_all().unwrap().order().len(), 3);
    }

    #[test]
    fn test_repeated_dependency() {
        let mut graph = Graph::new();
        graph.constant("a", 1).unwrap();
        graph.insert("double", sum(), ["a", "a"]).unwrap();
        graph.output("double");

        let topology = graph.resolve().unwrap();
        assert_eq!(topology.order().len(), 2);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = Graph::new();
        graph.constant("root", 1).unwrap();
        graph.insert("a", sum(), ["root", "c"]).unwrap();
        graph.insert("b", sum(), ["a"]).unwrap();
        graph.insert("c", sum(), ["b"]).unwrap();
        graph.insert("tail", sum(), ["c"]).unwrap();
        graph.output("tail");

        match graph.resolve() {
            Err(Error::Cycle { key }) => assert!(["a", "b", "c"].contains(&key.as_str())),
            other => panic!("expected a cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_loop() {
        let mut graph = Graph::<i64>::new();
        graph.insert("me", sum(), ["me"]).unwrap();
        graph.output("me");
        assert!(matches!(graph.resolve(), Err(Error::Cycle { key }) if key == "me"));
    }

    #[test]
    fn test_invalid_graphs() {
        let mut graph = Graph::new();
        graph.constant("a", 1).unwrap();
        assert!(matches!(graph.constant("a", 2), Err(Error::DuplicateKey { .. })));
        assert!(matches!(graph.resolve(), Err(Error::NoOutputs)));

        graph.output("missing");
        assert!(matches!(graph.resolve(), Err(Error::UnknownOutput { .. })));

        let mut graph = Graph::new();
        graph.insert("b", sum(), ["nowhere"]).unwrap();
        graph.output("b");
        match graph.resolve() {
            Err(Error::UnknownDependency { key, dependency }) => {
                assert_eq!(key, "b");
                assert_eq!(dependency, "nowhere");
            }
            other => panic!("expected unknown dependency, got {other:?}"),
        }
    }
}
