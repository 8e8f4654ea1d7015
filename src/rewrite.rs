use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::cancel::Cancel;
use crate::chain::{hash_node, hash_topology, NodeHashes, Slots};
use crate::error::{Error, Result};
use crate::exec::Executor;
use crate::graph::{Graph, Topology};
use crate::plan::{NodeOutcome, Plan, PlanNode, Report, Status, Step};
use crate::store::Store;

/// What to do when the store reports an anomaly for a node.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnStoreError {
    /// Abort with the store's error.
    #[default]
    Fail,
    /// Log a warning and recompute the node.
    Recompute,
}

/// Configuration of a [`Rewriter`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// How to handle corrupt entries and hash collisions.
    pub on_store_error: OnStoreError,
    /// Whether executed nodes write their results to the store.
    pub persist: bool,
    /// How many threads compute chain hashes. Zero and one both hash on the
    /// calling thread.
    pub threads: usize,
    /// A deadline for every individual store call.
    pub timeout: Option<Duration>,
}

impl Options {
    /// Set the store error policy.
    pub fn on_store_error(mut self, policy: OnStoreError) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Enable or disable storing results.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Set the number of hashing threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Set the store call timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Derive the token for one store call.
    pub(crate) fn token(&self, cancel: &Cancel) -> Cancel {
        match self.timeout {
            Some(timeout) => cancel.clone().deadline(Instant::now() + timeout),
            None => cancel.clone(),
        }
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            on_store_error: OnStoreError::Fail,
            persist: true,
            threads: 1,
            timeout: None,
        }
    }
}

/// Rewrites task graphs against a cache store.
///
/// Each node reachable from a requested output is hashed and looked up in
/// the store. Hits become [`Step::Load`], misses stay [`Step::Execute`].
/// Since a chain hash covers everything upstream, a change anywhere turns
/// the changed node and all of its descendants into misses.
pub struct Rewriter<S> {
    store: S,
    options: Options,
}

impl<S: Store> Rewriter<S> {
    /// Create a rewriter with default options.
    pub fn new(store: S) -> Self {
        Self { store, options: Options::default() }
    }

    /// Replace the options.
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// The store the rewriter consults.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Rewrite a graph.
    ///
    /// Either every node reachable from the outputs is planned or an error
    /// identifying the offending node is returned. The graph itself is left
    /// untouched.
    pub fn rewrite<V>(&self, graph: &Graph<V>, cancel: &Cancel) -> Result<Plan<'_, V>> {
        let span = info_span!("rewrite", nodes = graph.len());
        let _guard = span.enter();

        let topology = graph.resolve()?;
        let hashes = if self.options.threads > 1 {
            hash_parallel(graph, &topology, self.options.threads, cancel)?
        } else {
            hash_topology(graph, &topology)?
        };

        let mut nodes = (0..topology.capacity()).map(|_| None).collect::<Vec<_>>();
        let mut outcomes = Vec::with_capacity(topology.order().len());
        for &id in topology.order() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let node = &graph[id];
            let hashes = hashes[id.0];
            let status = self.classify(node.key(), &hashes, cancel)?;
            let step = if status == Status::Hit { Step::Load } else { Step::Execute };
            debug!(node = node.key(), hash = %hashes.chain, ?status, "planned");

            outcomes.push(NodeOutcome {
                key: node.key().to_string(),
                source: hashes.source,
                arguments: hashes.arguments,
                identity: hashes.identity,
                chain: hashes.chain,
                status,
            });
            nodes[id.0] = Some(PlanNode::new(
                node.key().to_string(),
                hashes,
                step,
                node.task().clone(),
                topology.deps(id).to_vec(),
            ));
        }

        let plan = Plan::new(
            nodes,
            topology.order().to_vec(),
            topology.outputs().to_vec(),
            &self.store,
            self.options.clone(),
            outcomes,
        );

        let report = plan.report();
        info!(
            hits = report.hits,
            misses = report.misses,
            degraded = report.degraded,
            "rewrote graph"
        );

        Ok(plan)
    }

    /// Rewrite a graph and evaluate its outputs.
    ///
    /// Returns the values of the outputs in the order they were requested,
    /// together with the plan's final report.
    pub fn compute<V, E>(
        &self,
        graph: &Graph<V>,
        executor: &E,
        cancel: &Cancel,
    ) -> Result<(Vec<V>, Report)>
    where
        E: Executor<V> + ?Sized,
    {
        let plan = self.rewrite(graph, cancel)?;
        let values = executor.execute(&plan, plan.outputs(), cancel)?;
        Ok((values, plan.report()))
    }

    /// Look a node's chain hash up in the store.
    fn classify(&self, key: &str, hashes: &NodeHashes, cancel: &Cancel) -> Result<Status> {
        let token = self.options.token(cancel);
        match self.store.contains(&hashes.chain, &token) {
            Ok(true) => Ok(Status::Hit),
            Ok(false) => Ok(Status::Miss),
            Err(source)
                if source.is_anomaly()
                    && self.options.on_store_error == OnStoreError::Recompute =>
            {
                warn!(node = key, hash = %hashes.chain, error = %source, "degrading to recomputation");
                self.store
                    .remove(&hashes.chain, &token)
                    .map_err(|source| Error::Store { key: key.to_string(), source })?;
                Ok(Status::Degraded)
            }
            Err(source) => Err(Error::Store { key: key.to_string(), source }),
        }
    }
}

/// Hash a topology on several threads.
///
/// Workers claim nodes in topological order, so every dependency has been
/// claimed before its dependents and a worker only ever waits on nodes that
/// are already being hashed. Each node's hashes are published to its own
/// slot exactly once.
fn hash_parallel<V>(
    graph: &Graph<V>,
    topology: &Topology,
    threads: usize,
    cancel: &Cancel,
) -> Result<Vec<NodeHashes>> {
    let order = topology.order();
    let slots = Slots::<NodeHashes>::new(topology.capacity());
    let next = AtomicUsize::new(0);
    let failure = Mutex::new(None::<(usize, Error)>);

    thread::scope(|scope| {
        for _ in 0..threads.min(order.len()) {
            scope.spawn(|| {
                loop {
                    let position = next.fetch_add(1, Ordering::SeqCst);
                    let Some(&id) = order.get(position) else { break };

                    let deps = topology
                        .deps(id)
                        .iter()
                        .map(|&dep| slots.wait(dep, cancel).map(|hashes| hashes.chain))
                        .collect::<Option<Vec<_>>>();

                    match deps.map(|deps| hash_node(graph, id, &deps)) {
                        Some(Ok(hashes)) => slots.set(id, hashes),
                        Some(Err(err)) => {
                            let mut failure = failure.lock();
                            if failure.as_ref().is_none_or(|(first, _)| position < *first) {
                                *failure = Some((position, err));
                            }
                            drop(failure);
                            slots.fail(id);
                        }
                        None => slots.fail(id),
                    }
                }
            });
        }
    });

    if let Some((_, err)) = failure.into_inner() {
        return Err(err);
    }

    let mut hashes = vec![NodeHashes::default(); topology.capacity()];
    let values = slots.into_values();
    for &id in order {
        hashes[id.0] = values[id.0].ok_or(Error::Cancelled)?;
    }

    Ok(hashes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::hash_graph;
    use crate::store::MemoryStore;
    use crate::task_fn;

    fn add() -> crate::FnTask<i64> {
        task_fn!("add", |xs: &[&i64]| Ok(xs.iter().copied().sum()))
    }

    fn wide(n: i64) -> Graph<i64> {
        let mut graph = Graph::new();
        for i in 0..n {
            graph.constant(format!("c{i}"), i).unwrap();
            let mut deps = vec![format!("c{i}")];
            if i > 0 {
                deps.push(format!("s{}", i - 1));
            }
            graph.insert(format!("s{i}"), add(), deps).unwrap();
        }
        graph.output(format!("s{}", n - 1));
        graph
    }

    #[test]
    fn test_parallel_hashing_matches_sequential() {
        let graph = wide(50);
        let store = MemoryStore::new();
        let expected = hash_graph(&graph).unwrap();
        for threads in [1, 2, 8] {
            let rewriter = Rewriter::new(&store).options(Options::default().threads(threads));
            let plan = rewriter.rewrite(&graph, &Cancel::never()).unwrap();
            for (_, node) in plan.iter() {
                assert_eq!(expected[node.key()], node.hashes());
            }
        }
    }

    #[test]
    fn test_only_ancestors_of_outputs_are_planned() {
        let mut graph = wide(3);
        graph.constant("unrelated", 7).unwrap();
        let store = MemoryStore::new();
        let rewriter = Rewriter::new(&store);
        let plan = rewriter.rewrite(&graph, &Cancel::never()).unwrap();
        assert_eq!(plan.len(), 6);
        assert!(plan.find("unrelated").is_none());
    }

    #[test]
    fn test_cancelled_rewrite_returns_no_plan() {
        let graph = wide(3);
        let store = MemoryStore::new();
        let token = Cancel::new();
        token.cancel();
        for threads in [1, 4] {
            let rewriter = Rewriter::new(&store).options(Options::default().threads(threads));
            assert!(rewriter.rewrite(&graph, &token).is_err());
        }
    }

    #[test]
    fn test_options_from_json() {
        let options: Options =
            serde_json::from_str(r#"{ "on_store_error": "recompute", "threads": 4 }"#).unwrap();
        assert_eq!(options.on_store_error, OnStoreError::Recompute);
        assert_eq!(options.threads, 4);
        assert!(options.persist);
        assert_eq!(options.timeout, None);
    }
}
