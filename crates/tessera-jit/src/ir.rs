//! Trace graph data structures.

use std::collections::HashSet;
use std::fmt;

use smallvec::SmallVec;
use tessera_core::{DType, Tensor};

use crate::{JitError, Result};

/// Index of a node inside its owning [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// Get the arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Type attached to a trace value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TraceType {
    /// A concrete tensor value.
    Tensor {
        dtype: DType,
        dims: SmallVec<[usize; 4]>,
    },
    /// Opaque context handle passed from a forward node to its backward.
    Handle,
    /// Not inferred (yet).
    #[default]
    Unknown,
}

impl TraceType {
    /// Infer the type of a concrete tensor.
    pub fn of(tensor: &Tensor) -> Self {
        TraceType::Tensor {
            dtype: tensor.dtype(),
            dims: SmallVec::from_slice(tensor.shape().dims()),
        }
    }

    pub fn is_handle(&self) -> bool {
        matches!(self, TraceType::Handle)
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceType::Tensor { dtype, dims } => {
                write!(f, "{dtype}(")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, ")")
            }
            TraceType::Handle => write!(f, "Handle"),
            TraceType::Unknown => write!(f, "Unknown"),
        }
    }
}

/// What a node computes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Graph input.
    Param,
    /// A value that was not traced when first used; captured by value.
    Constant,
    /// Placeholder for an undefined (hole) value.
    Undefined,
    /// One invocation of an autograd function.
    Op { name: String, function_id: usize },
    /// Output `offset` of the node feeding input 0.
    Select { offset: usize },
}

/// A single node of the trace graph.
#[derive(Debug, Clone)]
pub struct Node {
    id: NodeId,
    kind: NodeKind,
    inputs: Vec<NodeId>,
    ty: TraceType,
    backward_nontraceable: bool,
    appended: bool,
}

impl Node {
    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn ty(&self) -> &TraceType {
        &self.ty
    }

    /// Whether the backward of this node must be replayed opaquely.
    pub fn is_backward_nontraceable(&self) -> bool {
        self.backward_nontraceable
    }

    /// For `Select` nodes: the selected node and output offset.
    pub fn selected(&self) -> Option<(NodeId, usize)> {
        match self.kind {
            NodeKind::Select { offset } => self.inputs.first().map(|&of| (of, offset)),
            _ => None,
        }
    }
}

/// An append-only trace graph.
///
/// Nodes are created into an arena and become part of the program once
/// appended; the append order is the execution order.
///
/// Methods taking a [`NodeId`] panic if the id was not produced by this graph.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    order: Vec<NodeId>,
    params: Vec<NodeId>,
    outputs: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a detached node. It joins the program once [`Graph::append`]ed.
    pub fn create(&mut self, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            id,
            kind,
            inputs: Vec::new(),
            ty: TraceType::Unknown,
            backward_nontraceable: false,
            appended: false,
        });
        id
    }

    /// Append a created node to the end of the program.
    pub fn append(&mut self, id: NodeId) -> NodeId {
        let node = &mut self.nodes[id.0];
        if !node.appended {
            node.appended = true;
            self.order.push(id);
        }
        id
    }

    /// Add a graph input.
    pub fn add_param(&mut self) -> NodeId {
        let id = self.create(NodeKind::Param);
        self.append(id);
        self.params.push(id);
        id
    }

    /// Create (but do not append) a node selecting output `offset` of `of`.
    pub fn create_select(&mut self, of: NodeId, offset: usize) -> NodeId {
        let id = self.create(NodeKind::Select { offset });
        self.add_input(id, of);
        id
    }

    /// Create and append a constant typed after `value`.
    pub fn create_constant(&mut self, value: &Tensor) -> NodeId {
        let id = self.create(NodeKind::Constant);
        self.infer_type_from(id, value);
        self.append(id)
    }

    /// Create and append a placeholder for an undefined value.
    pub fn create_undefined(&mut self) -> NodeId {
        let id = self.create(NodeKind::Undefined);
        self.append(id)
    }

    /// Wire `value` as the next input of `node`.
    pub fn add_input(&mut self, node: NodeId, value: NodeId) {
        self.nodes[node.0].inputs.push(value);
    }

    /// Overwrite the type of `node`.
    pub fn set_type(&mut self, node: NodeId, ty: TraceType) {
        self.nodes[node.0].ty = ty;
    }

    /// Set the node's type from a concrete value.
    pub fn infer_type_from(&mut self, node: NodeId, value: &Tensor) {
        self.set_type(node, TraceType::of(value));
    }

    pub fn mark_backward_nontraceable(&mut self, node: NodeId) {
        self.nodes[node.0].backward_nontraceable = true;
    }

    /// Mark `value` as a graph output.
    pub fn register_output(&mut self, value: NodeId) {
        self.outputs.push(value);
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or(JitError::UnknownNode(id.0))
    }

    /// Appended nodes in program order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> + '_ {
        self.order.iter().map(move |id| &self.nodes[id.0])
    }

    /// Appended `Select` nodes reading from `node`, in append order.
    pub fn selects_of(&self, node: NodeId) -> Vec<NodeId> {
        self.nodes()
            .filter(|n| n.selected().map(|(of, _)| of) == Some(node))
            .map(|n| n.id)
            .collect()
    }

    /// Number of appended nodes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn params(&self) -> &[NodeId] {
        &self.params
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    /// Check that every input and output refers to a node appended earlier.
    pub fn lint(&self) -> Result<()> {
        let mut defined = HashSet::new();
        for node in self.nodes() {
            for input in &node.inputs {
                if !defined.contains(input) {
                    return Err(JitError::UseBeforeDef {
                        node: node.id.0,
                        input: input.0,
                    });
                }
            }
            defined.insert(node.id);
        }
        for out in &self.outputs {
            if !defined.contains(out) {
                return Err(JitError::UnknownNode(out.0));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "graph(")?;
        for (i, p) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} : {}", p, self.node(*p).ty)?;
        }
        writeln!(f, ") {{")?;
        for node in self.nodes() {
            let label = match &node.kind {
                NodeKind::Param => continue,
                NodeKind::Constant => "Constant".to_string(),
                NodeKind::Undefined => "Undefined".to_string(),
                NodeKind::Op { name, .. } => name.clone(),
                NodeKind::Select { offset } => format!("select[{offset}]"),
            };
            write!(f, "  {} : {} = {}(", node.id, node.ty, label)?;
            for (i, input) in node.inputs.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{input}")?;
            }
            write!(f, ")")?;
            if node.backward_nontraceable {
                write!(f, " # backward: opaque")?;
            }
            writeln!(f)?;
        }
        write!(f, "  return (")?;
        for (i, out) in self.outputs.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{out}")?;
        }
        writeln!(f, ");")?;
        write!(f, "}}")
    }
}
