//! # tessera-jit
//!
//! Trace IR recorded while tessera functions execute under a tracer.
//!
//! A [`Graph`] is an arena of [`Node`]s plus the order in which they were
//! appended. Multi-output operations are consumed through `Select` nodes,
//! one per output position, so positional arity is preserved in the IR.

pub mod ir;

pub use ir::{Graph, Node, NodeId, NodeKind, TraceType};

/// Errors reported by graph validation.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// A node consumes a value that is not appended before it.
    #[error("node %{node} uses %{input} before it is defined")]
    UseBeforeDef { node: usize, input: usize },

    /// Lookup of a node id that does not belong to this graph.
    #[error("unknown node %{0}")]
    UnknownNode(usize),
}

pub type Result<T> = std::result::Result<T, JitError>;
