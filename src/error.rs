use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};

use crate::hash::ChainHash;

/// The result type of graph-level operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A failure of a rewrite or of the evaluation of a rewritten graph.
///
/// Variants that concern a single node carry the node's key.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The graph contains a cycle through the named node.
    #[error("cycle detected at node `{key}`")]
    Cycle { key: String },
    /// A node names a dependency that does not exist in the graph.
    #[error("node `{key}` depends on unknown node `{dependency}`")]
    UnknownDependency { key: String, dependency: String },
    /// Two nodes were inserted under the same key.
    #[error("duplicate node `{key}`")]
    DuplicateKey { key: String },
    /// No output node was requested.
    #[error("no output nodes were requested")]
    NoOutputs,
    /// An output names a node that does not exist.
    #[error("unknown output node `{key}`")]
    UnknownOutput { key: String },
    /// The node's definition cannot be hashed deterministically.
    #[error("cannot derive the identity of node `{key}`")]
    Identity {
        key: String,
        #[source]
        source: IdentityError,
    },
    /// The cache store reported a failure for the node.
    #[error("store failure at node `{key}`")]
    Store {
        key: String,
        #[source]
        source: StoreError,
    },
    /// The node's task returned an error.
    #[error("task `{key}` failed")]
    Task {
        key: String,
        #[source]
        source: TaskError,
    },
    /// The node's result could not be serialized for the store.
    #[error("cannot encode the result of node `{key}`")]
    Encode {
        key: String,
        #[source]
        source: bincode::Error,
    },
    /// The operation was cancelled outside of a store call.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    /// The key of the offending node, if the error concerns a single node.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Cycle { key }
            | Self::UnknownDependency { key, .. }
            | Self::DuplicateKey { key }
            | Self::UnknownOutput { key }
            | Self::Identity { key, .. }
            | Self::Store { key, .. }
            | Self::Task { key, .. }
            | Self::Encode { key, .. } => Some(key),
            Self::NoOutputs | Self::Cancelled => None,
        }
    }
}

/// A node definition that cannot be serialized deterministically.
///
/// Hashing a non-deterministic representation would produce false cache
/// hits, so this is always fatal for the node and everything downstream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct IdentityError {
    message: String,
}

impl IdentityError {
    /// Create an identity error with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

/// An error reported by a cache store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No entry exists for the hash.
    #[error("no entry for {hash}")]
    Miss { hash: ChainHash },
    /// An entry exists but cannot be read back.
    #[error("entry {hash} is corrupt: {reason}")]
    Corrupt { hash: ChainHash, reason: String },
    /// An entry exists with different content than the one being written.
    #[error("hash collision: entry {hash} already holds different content")]
    Collision { hash: ChainHash },
    /// The call was cancelled or exceeded its deadline.
    #[error("store {op} timed out")]
    Timeout { op: &'static str },
    /// The backing medium failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether this is one of the anomalies that may degrade to recomputation.
    pub fn is_anomaly(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::Collision { .. })
    }
}

/// An error returned by a task's computation.
pub struct TaskError(Box<dyn StdError + Send + Sync>);

impl TaskError {
    /// Wrap an error or a message.
    pub fn new(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

impl Debug for TaskError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Debug::fmt(&self.0, f)
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl StdError for TaskError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}
