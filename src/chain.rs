use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use crate::cancel::Cancel;
use crate::error::{Error, Result};
use crate::graph::{Graph, NodeId, Topology};
use crate::hash::{chain_hash, ChainHash};
use crate::task::describe;

/// How often blocked readers of a slot look at their cancellation token.
const POLL: Duration = Duration::from_millis(20);

/// The hashes derived for one node.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHashes {
    /// The digest of the task's source fingerprint.
    pub source: ChainHash,
    /// The digest of the task's static parameters.
    pub arguments: ChainHash,
    /// The identity of the node's own definition, combining source and
    /// arguments.
    pub identity: ChainHash,
    /// The identity composed with the chain hashes of all dependencies.
    pub chain: ChainHash,
}

/// Compute the hashes of a node from the chain hashes of its dependencies.
pub(crate) fn hash_node<V>(
    graph: &Graph<V>,
    id: NodeId,
    deps: &[ChainHash],
) -> Result<NodeHashes> {
    let node = &graph[id];
    let def = describe(&**node.task())
        .map_err(|source| Error::Identity { key: node.key().to_string(), source })?;
    Ok(NodeHashes {
        source: def.source,
        arguments: def.arguments,
        identity: def.identity,
        chain: chain_hash(&def.identity, deps),
    })
}

/// Compute the hashes of every node in the graph, keyed by node key.
///
/// This ignores the cache store entirely. Rewriting the same graph always
/// yields these chain hashes.
pub fn hash_graph<V>(graph: &Graph<V>) -> Result<BTreeMap<String, NodeHashes>> {
    let topology = graph.resolve_all()?;
    let hashes = hash_topology(graph, &topology)?;
    Ok(topology
        .order()
        .iter()
        .map(|&id| (graph[id].key().to_string(), hashes[id.0]))
        .collect())
}

/// Hash the nodes of a topology sequentially, indexed by node id.
///
/// Entries for nodes outside the topology are left at their default.
pub(crate) fn hash_topology<V>(graph: &Graph<V>, topology: &Topology) -> Result<Vec<NodeHashes>> {
    let mut hashes = vec![NodeHashes::default(); topology.capacity()];
    for &id in topology.order() {
        let deps = topology.deps(id).iter().map(|dep| hashes[dep.0].chain).collect::<Vec<_>>();
        hashes[id.0] = hash_node(graph, id, &deps)?;
    }
    Ok(hashes)
}

/// An arena of single-assignment slots, one per node.
///
/// Each slot is written exactly once and read by any number of threads
/// afterwards. Readers block on the slot's own condition variable until the
/// value or a failure is published, so unrelated nodes never contend on a
/// shared lock.
pub(crate) struct Slots<T> {
    slots: Box<[Slot<T>]>,
}

struct Slot<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

enum State<T> {
    Pending,
    Ready(T),
    Failed,
}

impl<T: Clone> Slots<T> {
    /// Create `len` pending slots.
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len)
                .map(|_| Slot { state: Mutex::new(State::Pending), ready: Condvar::new() })
                .collect(),
        }
    }

    /// Publish the value of a slot.
    pub fn set(&self, id: NodeId, value: T) {
        self.publish(id, State::Ready(value));
    }

    /// Mark a slot as failed. Its readers give up.
    pub fn fail(&self, id: NodeId) {
        self.publish(id, State::Failed);
    }

    fn publish(&self, id: NodeId, state: State<T>) {
        let slot = &self.slots[id.0];
        let mut guard = slot.state.lock();
        debug_assert!(matches!(*guard, State::Pending), "slot assigned twice");
        *guard = state;
        slot.ready.notify_all();
    }

    /// Wait for a slot's value.
    ///
    /// Returns `None` if the slot failed or the token fired first.
    pub fn wait(&self, id: NodeId, cancel: &Cancel) -> Option<T> {
        let slot = &self.slots[id.0];
        let mut guard = slot.state.lock();
        loop {
            match &*guard {
                State::Ready(value) => return Some(value.clone()),
                State::Failed => return None,
                State::Pending => {}
            }
            if cancel.is_cancelled() {
                return None;
            }
            slot.ready.wait_for(&mut guard, POLL);
        }
    }

    /// Take all values out, in slot order. Pending and failed slots yield
    /// `None`.
    pub fn into_values(self) -> Vec<Option<T>> {
        self.slots
            .into_vec()
            .into_iter()
            .map(|slot| match slot.state.into_inner() {
                State::Ready(value) => Some(value),
                State::Pending | State::Failed => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::task_fn;

    fn add() -> crate::FnTask<i64> {
        task_fn!("add", |xs: &[&i64]| Ok(xs.iter().copied().sum()))
    }

    fn diamond(c: i64) -> Graph<i64> {
        let mut graph = Graph::new();
        graph.constant("a", 1).unwrap();
        graph.insert("b", add(), ["a"]).unwrap();
        graph.constant("k", c).unwrap();
        graph.insert("c", add(), ["a", "k"]).unwrap();
        graph.insert("d", add(), ["b", "c"]).unwrap();
        graph.output("d");
        graph
    }

    #[test]
    fn test_hash_graph_is_deterministic() {
        assert_eq!(hash_graph(&diamond(1)).unwrap(), hash_graph(&diamond(1)).unwrap());
    }

    #[test]
    fn test_change_propagates_downstream_only() {
        let before = hash_graph(&diamond(1)).unwrap();
        let after = hash_graph(&diamond(2)).unwrap();
        for key in ["a", "b"] {
            assert_eq!(before[key], after[key]);
        }
        for key in ["k", "c", "d"] {
            assert_ne!(before[key].chain, after[key].chain);
        }
        // `c` runs the same code on different inputs.
        assert_eq!(before["c"].identity, after["c"].identity);
    }

    #[test]
    fn test_same_definition_different_position() {
        let hashes = hash_graph(&diamond(1)).unwrap();
        assert_eq!(hashes["b"].identity, hashes["d"].identity);
        assert_ne!(hashes["b"].chain, hashes["d"].chain);
    }

    #[test]
    fn test_slots_block_until_set() {
        let slots = Arc::new(Slots::<u32>::new(2));
        let reader = {
            let slots = slots.clone();
            std::thread::spawn(move || slots.wait(NodeId(1), &Cancel::never()))
        };
        std::thread::sleep(Duration::from_millis(30));
        slots.set(NodeId(1), 7);
        assert_eq!(reader.join().unwrap(), Some(7));

        slots.fail(NodeId(0));
        assert_eq!(slots.wait(NodeId(0), &Cancel::never()), None);
    }

    #[test]
    fn test_slots_respect_cancellation() {
        let slots = Slots::<u32>::new(1);
        let token = Cancel::with_timeout(Duration::from_millis(10));
        assert_eq!(slots.wait(NodeId(0), &token), None);
        assert_eq!(slots.into_values(), vec![None]);
    }
}
