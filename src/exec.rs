use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::cancel::Cancel;
use crate::error::{Error, Result, TaskError};
use crate::graph::NodeId;
use crate::plan::{Plan, Step};

/// Evaluates rewritten graphs.
///
/// An executor decides the schedule. It must go through [`Plan::load`] and
/// [`Plan::execute`] so that results are stored and traffic is reported.
pub trait Executor<V> {
    /// Evaluate the given nodes of the plan and return their values in the
    /// same order.
    fn execute(&self, plan: &Plan<'_, V>, outputs: &[NodeId], cancel: &Cancel) -> Result<Vec<V>>;
}

/// Evaluates a plan on the calling thread.
///
/// Only what the requested nodes need is evaluated: the dependencies of a
/// load step are skipped unless its cached result turns out to be unusable
/// and the plan falls back to running the task.
#[derive(Debug, Copy, Clone, Default)]
pub struct LocalExecutor;

impl<V> Executor<V> for LocalExecutor
where
    V: Serialize + DeserializeOwned + Clone,
{
    fn execute(&self, plan: &Plan<'_, V>, outputs: &[NodeId], cancel: &Cancel) -> Result<Vec<V>> {
        let mut values: Vec<Option<V>> = (0..plan.capacity()).map(|_| None).collect();
        let mut fallback = vec![false; plan.capacity()];

        // Each entry is a node and whether its dependencies were scheduled.
        let mut stack = outputs.iter().rev().map(|&id| (id, false)).collect::<Vec<_>>();
        while let Some((id, expanded)) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let Some(node) = plan.node(id) else {
                return Err(Error::UnknownOutput { key: format!("#{}", id.index()) });
            };

            if values[id.index()].is_some() {
                continue;
            }

            if node.step() == Step::Load && !fallback[id.index()] {
                match plan.load(id, cancel)? {
                    Some(value) => {
                        values[id.index()] = Some(value);
                        continue;
                    }
                    None => fallback[id.index()] = true,
                }
            }

            if !expanded {
                stack.push((id, true));
                stack.extend(
                    node.deps()
                        .iter()
                        .rev()
                        .filter(|dep| values[dep.index()].is_none())
                        .map(|&dep| (dep, false)),
                );
                continue;
            }

            let value = {
                let inputs = node
                    .deps()
                    .iter()
                    .map(|dep| values[dep.index()].as_ref())
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| Error::Task {
                        key: node.key().to_string(),
                        source: TaskError::new("a dependency was not evaluated"),
                    })?;
                plan.execute(id, &inputs, cancel)?
            };
            values[id.index()] = Some(value);
        }

        outputs
            .iter()
            .map(|id| {
                values[id.index()]
                    .clone()
                    .ok_or_else(|| Error::UnknownOutput { key: format!("#{}", id.index()) })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::rewrite::Rewriter;
    use crate::store::MemoryStore;
    use crate::task_fn;

    fn chain(len: usize) -> Graph<i64> {
        let mut graph = Graph::new();
        graph.constant("n0", 1).unwrap();
        for i in 1..len {
            let inc = task_fn!("inc", |xs: &[&i64]| Ok(*xs[0] + 1));
            graph.insert(format!("n{i}"), inc, [format!("n{}", i - 1)]).unwrap();
        }
        graph.output(format!("n{}", len - 1));
        graph
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let graph = chain(50_000);
        let store = MemoryStore::new();
        let rewriter = Rewriter::new(&store);
        let (values, report) = rewriter.compute(&graph, &LocalExecutor, &Cancel::never()).unwrap();
        assert_eq!(values, vec![50_000]);
        assert_eq!(report.misses, 50_000);

        // Only the output is loaded on the second run.
        let (values, report) = rewriter.compute(&graph, &LocalExecutor, &Cancel::never()).unwrap();
        assert_eq!(values, vec![50_000]);
        assert_eq!(report.loads, 1);
        assert_eq!(report.executions, 0);
    }

    #[test]
    fn test_requested_outputs_in_order() {
        let mut graph = chain(3);
        graph.output("n0");
        let store = MemoryStore::new();
        let (values, _) =
            Rewriter::new(&store).compute(&graph, &LocalExecutor, &Cancel::never()).unwrap();
        assert_eq!(values, vec![3, 1]);
    }
}
