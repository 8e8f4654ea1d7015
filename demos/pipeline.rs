//! This example counts words across a few documents, then edits one document
//! and counts again. Only the tokenization of the edited document and the
//! nodes downstream of it run a second time.
//!
//! Run with `RUST_LOG=graphchain=debug` to see every LOAD and EXEC-STORE.

use std::error::Error;

use graphchain::{
    task, task_fn, Cancel, FsStore, Graph, Identity, LocalExecutor, Rewriter, Task, TaskError,
};
use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("graphchain=info")),
        )
        .init();

    // Results survive the process in `$GRAPHCHAIN_CACHE_DIR` or
    // `./__graphchain_cache__`.
    let rewriter = Rewriter::new(FsStore::open_default()?);

    let never = Cancel::never();
    let (values, first) = rewriter.compute(&pipeline("the cat sat")?, &LocalExecutor, &never)?;
    println!("{values:?}: {} hits, {} misses", first.hits, first.misses);

    let (values, second) = rewriter.compute(&pipeline("the dog sat")?, &LocalExecutor, &never)?;
    println!("{values:?}: {} hits, {} misses", second.hits, second.misses);

    for (key, reason) in second.explain(&first) {
        println!("  {key}: {reason:?}");
    }

    Ok(())
}

/// Build the word-count graph.
fn pipeline(third: &str) -> graphchain::Result<Graph<Value>> {
    let mut graph = Graph::new();
    let docs = ["a rat and a cat", "The Cat in the hat", third];
    for (i, doc) in docs.iter().enumerate() {
        graph.constant(format!("doc{i}"), Value::Text(doc.to_string()))?;
        graph.insert(format!("words{i}"), Tokenize { lowercase: true }, [format!("doc{i}")])?;
    }

    let merge = task_fn!("merge", |inputs: &[&Value]| {
        let mut all = Vec::new();
        for input in inputs {
            all.extend(input.words()?.iter().cloned());
        }
        Ok(Value::Words(all))
    });

    graph.insert("all", merge, ["words0", "words1", "words2"])?;
    for word in ["cat", "the", "dog"] {
        graph.insert(format!("count:{word}"), Count { word: word.into() }, ["all"])?;
        graph.output(format!("count:{word}"));
    }

    Ok(graph)
}

/// The values flowing through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, Identity)]
enum Value {
    Text(String),
    Words(Vec<String>),
    Count(u64),
}

impl Value {
    fn text(&self) -> Result<&str, TaskError> {
        match self {
            Self::Text(text) => Ok(text),
            other => Err(TaskError::new(format!("expected text, found {other:?}"))),
        }
    }

    fn words(&self) -> Result<&[String], TaskError> {
        match self {
            Self::Words(words) => Ok(words),
            other => Err(TaskError::new(format!("expected words, found {other:?}"))),
        }
    }
}

/// Split a text into words.
#[derive(Identity)]
struct Tokenize {
    lowercase: bool,
}

#[task]
impl Task<Value> for Tokenize {
    fn run(&self, inputs: &[&Value]) -> Result<Value, TaskError> {
        let words = inputs[0]
            .text()?
            .split_whitespace()
            .map(|word| if self.lowercase { word.to_lowercase() } else { word.to_string() })
            .collect();
        Ok(Value::Words(words))
    }
}

/// Count the occurrences of a word.
#[derive(Identity)]
struct Count {
    word: String,
}

#[task(label = "count")]
impl Task<Value> for Count {
    fn run(&self, inputs: &[&Value]) -> Result<Value, TaskError> {
        let count = inputs[0].words()?.iter().filter(|word| **word == self.word).count();
        Ok(Value::Count(count as u64))
    }
}
