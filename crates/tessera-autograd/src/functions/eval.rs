//! Opaque replay of a backward subgraph.
//!
//! When a step whose backward cannot be traced is recorded, the part of the
//! backward graph between the step's outputs and its inputs (plus saved
//! values) is cut out and replaced by a single [`Eval`]. Running the `Eval`
//! runs the cut-out subgraph and returns the gradients that reach its
//! boundary.

use std::collections::HashSet;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tessera_jit::NodeId;
use tracing::trace;

use crate::engine;
use crate::error::Result;
use crate::function::{Edge, Function, FunctionBase, FunctionFlags, FunctionKind};
use crate::saved::SavedVariable;
use crate::tracer::TracingState;
use crate::variable::Variable;

/// Context handle of the forward node whose backward this `Eval` replays.
struct ForwardContext {
    state: Weak<TracingState>,
    node: NodeId,
    select: NodeId,
}

impl ForwardContext {
    fn belongs_to(&self, state: &Arc<TracingState>) -> bool {
        self.state.upgrade().is_some_and(|s| Arc::ptr_eq(&s, state))
    }
}

/// Gradient function standing in for a wrapped backward subgraph.
pub struct Eval {
    base: FunctionBase,
    /// Entry edge of the wrapped subgraph per output position.
    roots: Vec<Option<Edge>>,
    forward_ctx: Mutex<Vec<ForwardContext>>,
}

impl Eval {
    /// Cut the backward subgraph from `outputs` down to `inputs` out of the
    /// graph and route the outputs through a new `Eval` instead.
    ///
    /// Every function inside the subgraph is marked as wrapped. Returns
    /// `None` when no output has a producer.
    pub fn replace_subgraph(inputs: &[Variable], outputs: &[Variable]) -> Option<Arc<Eval>> {
        let roots: Vec<Option<Edge>> = outputs
            .iter()
            .map(|o| if o.is_leaf() { None } else { o.gradient_edge() })
            .collect();
        if roots.iter().all(Option::is_none) {
            return None;
        }

        let eval = Arc::new(Eval {
            base: FunctionBase::new(FunctionFlags::from_inputs(inputs)),
            roots,
            forward_ctx: Mutex::new(Vec::new()),
        });
        let marked = eval.mark_subgraph();

        let as_fn: Arc<dyn Function> = eval.clone();
        for (i, output) in outputs.iter().enumerate() {
            if eval.roots[i].is_some() {
                output.set_grad_fn(Edge::new(Arc::clone(&as_fn), i));
            }
        }
        trace!(eval = eval.id(), functions = marked, "replaced backward subgraph");
        Some(eval)
    }

    /// The `Eval` that replays the backward of a step with these `inputs`
    /// and `outputs`, if one was installed by [`Eval::replace_subgraph`].
    ///
    /// Leaf outputs are not routed through the `Eval` and are ignored.
    pub fn get_backward_eval(
        inputs: &[Variable],
        outputs: &[Variable],
    ) -> Option<Arc<dyn Function>> {
        let mut found: Option<Arc<dyn Function>> = None;
        for output in outputs.iter().filter(|o| o.defined() && !o.is_leaf()) {
            let grad_fn = output.grad_fn()?;
            grad_fn.as_eval()?;
            match &found {
                Some(f) if f.id() != grad_fn.id() => return None,
                Some(_) => {}
                None => found = Some(grad_fn),
            }
        }
        let eval = found?;
        let boundary = eval.next_functions();
        for (i, input) in inputs.iter().enumerate() {
            let expected = boundary.get(i)?;
            let matches = match (input.gradient_edge(), expected) {
                (Some(a), Some(b)) => a.same_as(b),
                (None, None) => true,
                _ => false,
            };
            if !matches {
                return None;
            }
        }
        Some(eval)
    }

    /// Context handle of the first forward node linked in `state`.
    pub fn forward_ctx_select(&self, state: &Arc<TracingState>) -> Option<NodeId> {
        self.forward_ctx
            .lock()
            .iter()
            .find(|c| c.belongs_to(state))
            .map(|c| c.select)
    }

    /// Context handle already linked for `node` in `state`.
    pub fn forward_ctx_of(&self, state: &Arc<TracingState>, node: NodeId) -> Option<NodeId> {
        self.forward_ctx
            .lock()
            .iter()
            .find(|c| c.node == node && c.belongs_to(state))
            .map(|c| c.select)
    }

    /// Link the context handle `select` of `node` in `state`. Keeps the
    /// first handle when the pair is already linked.
    pub fn set_forward_ctx(&self, state: &Arc<TracingState>, node: NodeId, select: NodeId) {
        let mut ctx = self.forward_ctx.lock();
        if ctx.iter().any(|c| c.node == node && c.belongs_to(state)) {
            return;
        }
        ctx.push(ForwardContext {
            state: Arc::downgrade(state),
            node,
            select,
        });
    }

    /// Entry edges of the wrapped subgraph.
    pub fn roots(&self) -> &[Option<Edge>] {
        &self.roots
    }

    fn is_boundary(&self, edge: &Edge) -> bool {
        self.next_functions().iter().flatten().any(|b| b.same_as(edge))
    }

    fn mark_subgraph(&self) -> usize {
        let mut seen = HashSet::new();
        let mut stack: Vec<Arc<dyn Function>> = self
            .roots
            .iter()
            .flatten()
            .filter(|e| !self.is_boundary(e))
            .map(|e| Arc::clone(&e.function))
            .collect();
        while let Some(function) = stack.pop() {
            if !seen.insert(function.id()) {
                continue;
            }
            function.tracing_state().set_in_eval_subgraph(true);
            for edge in function.next_functions().iter().flatten() {
                if !self.is_boundary(edge) && !seen.contains(&edge.function.id()) {
                    stack.push(Arc::clone(&edge.function));
                }
            }
        }
        seen.len()
    }
}

impl Function for Eval {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Eval
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let roots: Vec<(Edge, Variable)> = self
            .roots
            .iter()
            .enumerate()
            .filter_map(|(i, root)| {
                let grad = inputs.get(i).filter(|g| g.defined())?;
                Some((root.clone()?, grad.clone()))
            })
            .collect();
        engine::run_subgraph(roots, self.next_functions())
    }

    fn saved_variables(&self) -> Option<Vec<SavedVariable>> {
        Some(Vec::new())
    }

    fn as_eval(&self) -> Option<&Eval> {
        Some(self)
    }
}
