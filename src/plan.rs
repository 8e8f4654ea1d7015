use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::Cancel;
use crate::chain::NodeHashes;
use crate::error::{Error, Result, StoreError};
use crate::graph::NodeId;
use crate::hash::ChainHash;
use crate::rewrite::{OnStoreError, Options};
use crate::store::{Put, Store};
use crate::task::Task;

/// What an evaluator does for a node of a rewritten graph.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Read the cached result. The node's dependencies are not needed.
    Load,
    /// Run the node's task and store its result.
    Execute,
}

/// How a node was classified during the rewrite.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The chain hash was present in the store.
    Hit,
    /// The chain hash was absent.
    Miss,
    /// The store reported an anomaly for the chain hash and the node is
    /// recomputed instead.
    Degraded,
}

/// A node of a rewritten graph.
pub struct PlanNode<V> {
    key: String,
    hashes: NodeHashes,
    step: Step,
    task: Arc<dyn Task<V>>,
    deps: Vec<NodeId>,
    /// Set by the first store write so that the write happens at most once.
    stored: AtomicBool,
}

impl<V> PlanNode<V> {
    pub(crate) fn new(
        key: String,
        hashes: NodeHashes,
        step: Step,
        task: Arc<dyn Task<V>>,
        deps: Vec<NodeId>,
    ) -> Self {
        Self { key, hashes, step, task, deps, stored: AtomicBool::new(false) }
    }

    /// The node's key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The node's chain hash.
    pub fn hash(&self) -> ChainHash {
        self.hashes.chain
    }

    /// The identity and chain hash of the node.
    pub fn hashes(&self) -> NodeHashes {
        self.hashes
    }

    /// What to do for this node.
    pub fn step(&self) -> Step {
        self.step
    }

    /// The node's dependencies in argument order.
    ///
    /// For a [`Step::Load`] they are only needed if the load fails and the
    /// plan falls back to running the task.
    pub fn deps(&self) -> &[NodeId] {
        &self.deps
    }
}

impl<V> Debug for PlanNode<V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("PlanNode")
            .field("key", &self.key)
            .field("hash", &self.hashes.chain)
            .field("step", &self.step)
            .field("deps", &self.deps)
            .finish()
    }
}

/// A rewritten graph, ready to be evaluated by an
/// [`Executor`](crate::Executor).
///
/// Nodes keep the ids they had in the source graph. Nodes that no requested
/// output depends on are absent. Loading and executing go through the plan so
/// that store traffic is accounted for in its [`Report`].
pub struct Plan<'a, V> {
    nodes: Vec<Option<PlanNode<V>>>,
    order: Vec<NodeId>,
    outputs: Vec<NodeId>,
    store: &'a dyn Store,
    options: Options,
    outcomes: Vec<NodeOutcome>,
    traffic: Traffic,
}

/// Counters updated while the plan is evaluated.
#[derive(Default)]
struct Traffic {
    degraded: AtomicUsize,
    loads: AtomicUsize,
    executions: AtomicUsize,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
}

impl<'a, V> Plan<'a, V> {
    pub(crate) fn new(
        nodes: Vec<Option<PlanNode<V>>>,
        order: Vec<NodeId>,
        outputs: Vec<NodeId>,
        store: &'a dyn Store,
        options: Options,
        outcomes: Vec<NodeOutcome>,
    ) -> Self {
        let degraded = outcomes.iter().filter(|o| o.status == Status::Degraded).count();
        let traffic = Traffic { degraded: AtomicUsize::new(degraded), ..Traffic::default() };
        Self { nodes, order, outputs, store, options, outcomes, traffic }
    }

    /// Access a node by id. Returns `None` for nodes outside the plan.
    pub fn node(&self, id: NodeId) -> Option<&PlanNode<V>> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    /// Look up a node by key.
    pub fn find(&self, key: &str) -> Option<(NodeId, &PlanNode<V>)> {
        self.iter().find(|(_, node)| node.key == key)
    }

    /// The nodes of the plan in topological order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PlanNode<V>)> {
        self.order.iter().filter_map(|&id| self.node(id).map(|node| (id, node)))
    }

    /// The planned nodes in topological order.
    pub fn order(&self) -> &[NodeId] {
        &self.order
    }

    /// The requested outputs.
    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// The number of planned nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the plan has no nodes.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// An upper bound on node ids, for sizing per-node tables.
    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    /// The options the plan was built with.
    pub fn options(&self) -> &Options {
        &self.options
    }

    /// A snapshot of the plan's report.
    ///
    /// Hit and miss counts are fixed by the rewrite, while the traffic
    /// counters grow as the plan is evaluated.
    pub fn report(&self) -> Report {
        let count = |status| self.outcomes.iter().filter(|o| o.status == status).count();
        Report {
            hits: count(Status::Hit),
            misses: count(Status::Miss),
            degraded: self.traffic.degraded.load(Ordering::SeqCst),
            loads: self.traffic.loads.load(Ordering::SeqCst),
            executions: self.traffic.executions.load(Ordering::SeqCst),
            bytes_read: self.traffic.bytes_read.load(Ordering::SeqCst),
            bytes_written: self.traffic.bytes_written.load(Ordering::SeqCst),
            nodes: self.outcomes.clone(),
        }
    }

    fn get(&self, id: NodeId) -> Result<&PlanNode<V>> {
        self.node(id).ok_or_else(|| Error::UnknownOutput { key: format!("#{}", id.0) })
    }
}

impl<V> Plan<'_, V>
where
    V: Serialize + DeserializeOwned,
{
    /// Read the cached result of a node.
    ///
    /// Returns `Ok(None)` if the entry vanished or turned out to be corrupt
    /// and the plan was built with [`OnStoreError::Recompute`]. The caller
    /// must then [`execute`](Self::execute) the node instead, which requires
    /// its dependencies.
    pub fn load(&self, id: NodeId, cancel: &Cancel) -> Result<Option<V>> {
        let node = self.get(id)?;
        let hash = node.hashes.chain;
        let token = self.options.token(cancel);

        let loaded = self.store.get(&hash, &token).and_then(|blob| {
            let value = bincode::deserialize(&blob)
                .map_err(|err| StoreError::Corrupt { hash, reason: err.to_string() })?;
            Ok((value, blob.len() as u64))
        });

        match loaded {
            Ok((value, len)) => {
                debug!(node = %node.key, %hash, bytes = len, "LOAD");
                self.traffic.loads.fetch_add(1, Ordering::SeqCst);
                self.traffic.bytes_read.fetch_add(len, Ordering::SeqCst);
                Ok(Some(value))
            }
            Err(source @ (StoreError::Miss { .. } | StoreError::Corrupt { .. }))
                if self.options.on_store_error == OnStoreError::Recompute =>
            {
                warn!(node = %node.key, %hash, error = %source, "cached result unusable, recomputing");
                if matches!(source, StoreError::Corrupt { .. }) {
                    self.store
                        .remove(&hash, &token)
                        .map_err(|source| Error::Store { key: node.key.clone(), source })?;
                }
                self.traffic.degraded.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
            Err(source) => Err(Error::Store { key: node.key.clone(), source }),
        }
    }

    /// Run a node's task on the results of its dependencies and store the
    /// result.
    ///
    /// Works for both kinds of steps: a load step runs its original task,
    /// which is the fallback for an unusable cache entry. The result is
    /// written to the store at most once per plan, however often the node
    /// is executed.
    pub fn execute(&self, id: NodeId, inputs: &[&V], cancel: &Cancel) -> Result<V> {
        let node = self.get(id)?;
        let value = node
            .task
            .run(inputs)
            .map_err(|source| Error::Task { key: node.key.clone(), source })?;
        self.traffic.executions.fetch_add(1, Ordering::SeqCst);

        if !self.options.persist {
            debug!(node = %node.key, hash = %node.hashes.chain, "EXEC ONLY");
        } else if !node.stored.swap(true, Ordering::SeqCst) {
            debug!(node = %node.key, hash = %node.hashes.chain, "EXEC-STORE");
            self.write(node, &value, cancel)?;
        } else {
            debug!(node = %node.key, hash = %node.hashes.chain, "EXEC");
        }

        Ok(value)
    }

    fn write(&self, node: &PlanNode<V>, value: &V, cancel: &Cancel) -> Result<()> {
        let hash = node.hashes.chain;
        let blob = bincode::serialize(value)
            .map_err(|source| Error::Encode { key: node.key.clone(), source })?;

        match self.store.put(&hash, &blob, &self.options.token(cancel)) {
            Ok(Put::Written) => {
                self.traffic.bytes_written.fetch_add(blob.len() as u64, Ordering::SeqCst);
                Ok(())
            }
            Ok(Put::Unchanged) => Ok(()),
            Err(source @ StoreError::Collision { .. })
                if self.options.on_store_error == OnStoreError::Recompute =>
            {
                warn!(node = %node.key, %hash, error = %source, "result not stored");
                self.traffic.degraded.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(source) => Err(Error::Store { key: node.key.clone(), source }),
        }
    }
}

impl<V> Debug for Plan<'_, V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_list().entries(self.iter().map(|(_, node)| node)).finish()
    }
}

/// What happened to a node during the rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeOutcome {
    /// The node's key.
    pub key: String,
    /// The digest of the task's source fingerprint.
    pub source: ChainHash,
    /// The digest of the task's static parameters.
    pub arguments: ChainHash,
    /// The identity of the node's definition.
    pub identity: ChainHash,
    /// The node's chain hash.
    pub chain: ChainHash,
    /// How the node was classified.
    pub status: Status,
}

/// Counts of cache hits, misses and store traffic of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Nodes planned as loads.
    pub hits: usize,
    /// Nodes planned as executions because their hash was absent.
    pub misses: usize,
    /// Nodes recomputed or left unstored because of a store anomaly.
    pub degraded: usize,
    /// Successful loads so far.
    pub loads: usize,
    /// Task executions so far.
    pub executions: usize,
    /// Bytes read from the store.
    pub bytes_read: u64,
    /// Bytes written to the store.
    pub bytes_written: u64,
    /// Per-node outcomes in topological order.
    pub nodes: Vec<NodeOutcome>,
}

/// Why a node missed the cache, relative to an earlier report.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissReason {
    /// The earlier report has no node with this key.
    New,
    /// The task's code changed.
    Source,
    /// The code is the same but the task's static parameters changed.
    Arguments,
    /// The definition is the same but something upstream changed.
    Upstream,
    /// The chain hash is unchanged, so the entry was evicted or never
    /// stored.
    Evicted,
    /// The entry exists but was unusable.
    Corrupt,
}

impl Report {
    /// Explain every miss of this report by comparing it to the report of an
    /// earlier run.
    ///
    /// Nodes are matched by key. The result follows the node order of this
    /// report.
    pub fn explain(&self, previous: &Report) -> Vec<(String, MissReason)> {
        let before = previous
            .nodes
            .iter()
            .map(|node| (node.key.as_str(), node))
            .collect::<HashMap<_, _>>();

        self.nodes
            .iter()
            .filter(|node| node.status != Status::Hit)
            .map(|node| {
                let reason = match before.get(node.key.as_str()) {
                    _ if node.status == Status::Degraded => MissReason::Corrupt,
                    None => MissReason::New,
                    Some(prev) if prev.source != node.source => MissReason::Source,
                    Some(prev) if prev.arguments != node.arguments => MissReason::Arguments,
                    Some(prev) if prev.chain != node.chain => MissReason::Upstream,
                    Some(_) => MissReason::Evicted,
                };
                (node.key.clone(), reason)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::identity;

    fn outcome(key: &str, def: &str, chain: &str, status: Status) -> NodeOutcome {
        // `def` is "<source>/<arguments>" or just the source.
        let (source, arguments) = def.split_once('/').unwrap_or((def, ""));
        NodeOutcome {
            key: key.into(),
            source: identity(source).unwrap(),
            arguments: identity(arguments).unwrap(),
            identity: identity(def).unwrap(),
            chain: identity(chain).unwrap(),
            status,
        }
    }

    #[test]
    fn test_explain_misses() {
        let previous = Report {
            nodes: vec![
                outcome("a", "a1", "ca1", Status::Miss),
                outcome("b", "b1", "cb1", Status::Miss),
                outcome("c", "c1", "cc1", Status::Miss),
                outcome("d", "d1", "cd1", Status::Miss),
                outcome("g", "g/1", "cg1", Status::Miss),
            ],
            ..Report::default()
        };

        let current = Report {
            nodes: vec![
                outcome("a", "a2", "ca2", Status::Miss),
                outcome("b", "b1", "cb2", Status::Miss),
                outcome("c", "c1", "cc1", Status::Miss),
                outcome("d", "d1", "cd1", Status::Hit),
                outcome("e", "e1", "ce1", Status::Miss),
                outcome("f", "f1", "cf1", Status::Degraded),
                outcome("g", "g/2", "cg2", Status::Miss),
            ],
            ..Report::default()
        };

        assert_eq!(
            current.explain(&previous),
            vec![
                ("a".to_string(), MissReason::Source),
                ("b".to_string(), MissReason::Upstream),
                ("c".to_string(), MissReason::Evicted),
                ("e".to_string(), MissReason::New),
                ("f".to_string(), MissReason::Corrupt),
                ("g".to_string(), MissReason::Arguments),
            ]
        );
    }

    #[test]
    fn test_report_is_serializable() {
        let report = Report {
            hits: 1,
            nodes: vec![outcome("a", "a", "a", Status::Hit)],
            ..Report::default()
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"status\":\"hit\""));
        assert_eq!(serde_json::from_str::<Report>(&json).unwrap(), report);
    }
}
