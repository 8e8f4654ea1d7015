/*!
Hash-chain memoization for task graphs.

A task graph is a DAG of nodes, each a [`Task`] applied to the results of
its dependencies. Before a graph is evaluated, every node receives a _chain
hash_ covering its own definition and the chain hashes of everything
upstream. The [`Rewriter`] looks these hashes up in a [`Store`]: nodes whose
result is cached become loads, all others execute and store their result.
Changing a single node therefore recomputes exactly that node and its
descendants.

# Example
```ignore
use graphchain::{Cancel, Graph, LocalExecutor, MemoryStore, Rewriter, task_fn};

let mut graph = Graph::new();
graph.constant("a", 1)?;
graph.constant("b", 2)?;
graph.insert("sum", task_fn!("sum", |xs: &[&i64]| Ok(xs.iter().copied().sum())), ["a", "b"])?;
graph.output("sum");

let rewriter = Rewriter::new(MemoryStore::new());
let (values, report) = rewriter.compute(&graph, &LocalExecutor, &Cancel::never())?;
assert_eq!(values, [3]);
assert_eq!(report.misses, 3);

// The second run only loads the output.
let (_, report) = rewriter.compute(&graph, &LocalExecutor, &Cancel::never())?;
assert_eq!(report.loads, 1);
```

# Identity
What a node computes is declared through the [`Identity`] trait, an
explicit and deterministic serialization of the node's static parameters,
and its task's [`source`](Task::source), a fingerprint of its code. Both
are derived for you by `#[derive(Identity)]` and `#[task]`. State that
cannot be serialized deterministically is wrapped in [`Opaque`] and fails
loudly instead of producing false cache hits.

Two nodes with equal chain hashes are treated as interchangeable. Two
syntactically different but equivalent tasks hash differently and simply
miss the cache.
*/

extern crate self as graphchain;

mod cancel;
mod chain;
mod error;
mod exec;
mod graph;
mod hash;
mod plan;
mod prehashed;
mod rewrite;
mod store;
mod task;

pub use crate::cancel::Cancel;
pub use crate::chain::{hash_graph, NodeHashes};
pub use crate::error::{Error, IdentityError, Result, StoreError, TaskError};
pub use crate::exec::{Executor, LocalExecutor};
pub use crate::graph::{Graph, Node, NodeId, Topology};
pub use crate::hash::{chain_hash, identity, ChainHash, Identity, IdentityHasher, Opaque};
pub use crate::plan::{MissReason, NodeOutcome, Plan, PlanNode, Report, Status, Step};
pub use crate::prehashed::Prehashed;
pub use crate::rewrite::{OnStoreError, Options, Rewriter};
pub use crate::store::{
    Blob, EntryMeta, EvictPolicy, Evicted, FsConfig, FsStore, MemoryStore, Put, Store,
    CACHE_DIR_VAR, DEFAULT_CACHE_DIR,
};
pub use crate::task::{definition, describe, Const, Definition, FnTask, Task};

#[cfg(feature = "macros")]
pub use graphchain_macros::{task, Identity};
