use std::borrow::Cow;
use std::fmt::{self, Debug, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::{IdentityError, TaskError};
use crate::hash::{ChainHash, Identity, IdentityHasher};

/// A unit of deferred computation producing values of type `V`.
///
/// The task's identity is made of two parts: its [`source`](Task::source),
/// which fingerprints the code that runs, and its [`Identity`], which declares
/// the static parameters bound at construction. Inputs produced by upstream
/// nodes are not part of either; they enter through the chain hash.
///
/// Implement this trait on a struct holding the static parameters, derive
/// `Identity` for it and put `#[task]` on the impl block to have `source`
/// generated from the block's tokens:
///
/// ```ignore
/// #[derive(Identity)]
/// struct Scale {
///     factor: i64,
/// }
///
/// #[task]
/// impl Task<i64> for Scale {
///     fn run(&self, inputs: &[&i64]) -> Result<i64, TaskError> {
///         Ok(inputs.iter().copied().sum::<i64>() * self.factor)
///     }
/// }
/// ```
pub trait Task<V>: Identity + Send + Sync {
    /// A fingerprint of the code this task executes.
    ///
    /// Must change whenever the computation changes. An empty source is
    /// rejected with an [`IdentityError`].
    fn source(&self) -> &'static str;

    /// A human-readable name for logs.
    fn label(&self) -> Cow<'_, str> {
        let name = std::any::type_name::<Self>();
        Cow::Borrowed(name.rsplit("::").next().unwrap_or(name))
    }

    /// Run the computation on the results of the node's dependencies, in
    /// their declared order.
    fn run(&self, inputs: &[&V]) -> Result<V, TaskError>;
}

/// The digests that make up a task's definition.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Definition {
    /// The digest of the task's source fingerprint.
    pub source: ChainHash,
    /// The digest of the task's static parameters.
    pub arguments: ChainHash,
    /// Both of the above combined.
    pub identity: ChainHash,
}

/// Compute the definition identity of a task, independent of its position in
/// a graph.
pub fn definition<V>(task: &dyn Task<V>) -> Result<ChainHash, IdentityError> {
    Ok(describe(task)?.identity)
}

/// Compute the source and argument digests of a task along with the
/// definition identity they combine into.
pub fn describe<V>(task: &dyn Task<V>) -> Result<Definition, IdentityError> {
    let code = task.source();
    if code.is_empty() {
        return Err(IdentityError::new(format!(
            "task `{}` declares no source fingerprint",
            task.label()
        )));
    }

    let mut state = IdentityHasher::new();
    state.write_str("source");
    state.write_str(code);
    let source = state.finish();

    let mut state = IdentityHasher::new();
    state.write_str("arguments");
    task.identify(&mut state)?;
    let arguments = state.finish();

    let mut state = IdentityHasher::new();
    state.write_str("node");
    state.write_digest(&source);
    state.write_digest(&arguments);
    Ok(Definition { source, arguments, identity: state.finish() })
}

/// A task backed by a plain function pointer.
///
/// Only non-capturing closures coerce to function pointers, so a task built
/// this way cannot close over state that escapes its identity. Created with
/// the [`task_fn!`](crate::task_fn!) macro, which fingerprints the closure's tokens.
pub struct FnTask<V> {
    label: &'static str,
    source: &'static str,
    func: fn(&[&V]) -> Result<V, TaskError>,
}

impl<V> FnTask<V> {
    /// Create a task from a label, a source fingerprint and a function.
    pub const fn new(
        label: &'static str,
        source: &'static str,
        func: fn(&[&V]) -> Result<V, TaskError>,
    ) -> Self {
        Self { label, source, func }
    }
}

impl<V> Identity for FnTask<V> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        state.write_str(self.label);
        Ok(())
    }
}

impl<V> Task<V> for FnTask<V> {
    fn source(&self) -> &'static str {
        self.source
    }

    fn label(&self) -> Cow<'_, str> {
        Cow::Borrowed(self.label)
    }

    fn run(&self, inputs: &[&V]) -> Result<V, TaskError> {
        (self.func)(inputs)
    }
}

impl<V> Debug for FnTask<V> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("FnTask").field("label", &self.label).finish()
    }
}

/// Build an [`FnTask`] from a non-capturing closure.
///
/// The closure's tokens serve as its source fingerprint, so editing the
/// closure invalidates cached results. Passing a function path instead of a
/// closure only fingerprints the path.
///
/// ```ignore
/// let add = task_fn!("add", |inputs: &[&i64]| Ok(inputs.iter().copied().sum()));
/// ```
#[macro_export]
macro_rules! task_fn {
    ($label:literal, $func:expr $(,)?) => {
        $crate::FnTask::new($label, stringify!($func), $func)
    };
}

/// A constant node, identified by its value.
#[derive(Debug, Clone)]
pub struct Const<V>(pub V);

impl<V: Identity> Identity for Const<V> {
    fn identify(&self, state: &mut IdentityHasher) -> Result<(), IdentityError> {
        self.0.identify(state)
    }
}

impl<V> Task<V> for Const<V>
where
    V: Identity + Clone + Send + Sync,
{
    fn source(&self) -> &'static str {
        "const"
    }

    fn label(&self) -> Cow<'_, str> {
        Cow::Borrowed("const")
    }

    fn run(&self, _: &[&V]) -> Result<V, TaskError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nameless;

    impl Identity for Nameless {
        fn identify(&self, _: &mut IdentityHasher) -> Result<(), IdentityError> {
            Ok(())
        }
    }

    impl Task<u8> for Nameless {
        fn source(&self) -> &'static str {
            ""
        }

        fn run(&self, _: &[&u8]) -> Result<u8, TaskError> {
            Ok(0)
        }
    }

    #[test]
    fn test_source_is_required() {
        let err = definition::<u8>(&Nameless).unwrap_err();
        assert!(err.to_string().contains("Nameless"));
    }

    #[test]
    fn test_closure_source_changes_identity() {
        let a: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 1));
        let b: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 2));
        let c: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 1));
        assert_ne!(definition::<i64>(&a).unwrap(), definition::<i64>(&b).unwrap());
        assert_eq!(definition::<i64>(&a).unwrap(), definition::<i64>(&c).unwrap());
        assert_eq!(a.run(&[&41]).unwrap(), 42);
    }

    #[test]
    fn test_constants() {
        assert_ne!(
            definition::<i64>(&Const(1i64)).unwrap(),
            definition::<i64>(&Const(2i64)).unwrap()
        );
        assert_eq!(Const(7i64).run(&[]).unwrap(), 7);
    }

    #[test]
    fn test_describe_separates_source_and_arguments() {
        let one = describe::<i64>(&Const(1i64)).unwrap();
        let two = describe::<i64>(&Const(2i64)).unwrap();
        assert_eq!(one.source, two.source);
        assert_ne!(one.arguments, two.arguments);
        assert_ne!(one.identity, two.identity);

        let a: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 1));
        let b: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 2));
        let (a, b) = (describe::<i64>(&a).unwrap(), describe::<i64>(&b).unwrap());
        assert_ne!(a.source, b.source);
        assert_eq!(a.arguments, b.arguments);
        let c: FnTask<i64> = crate::task_fn!("f", |xs: &[&i64]| Ok(*xs[0] + 1));
        assert_eq!(a.identity, definition::<i64>(&c).unwrap());
    }
}
