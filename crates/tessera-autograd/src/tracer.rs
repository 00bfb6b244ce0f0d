//! Tracing sessions.
//!
//! A [`TracingState`] owns the trace graph of one session. Variables remember
//! which node of which session they are bound to, so the state of a step is
//! found from its inputs. The graph is guarded by a mutex that
//! [`traced_apply`](crate::traced::traced_apply) releases while the traced
//! function runs, so nested traced steps can lock it again.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};
use tessera_jit::{Graph, NodeId};
use tracing::debug;

use crate::error::{AutogradError, Result};
use crate::functions::Eval;
use crate::variable::Variable;

static NEXT_STATE_ID: AtomicUsize = AtomicUsize::new(0);

/// Binding of a variable to a node of a trace graph.
pub(crate) struct ValueTrace {
    state: Weak<TracingState>,
    node: NodeId,
}

/// Everything mutated under the trace lock.
#[derive(Debug, Default)]
pub struct TraceData {
    pub graph: Graph,
}

/// One tracing session.
#[derive(Debug)]
pub struct TracingState {
    id: usize,
    data: Mutex<TraceData>,
    active: AtomicBool,
}

impl TracingState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            data: Mutex::new(TraceData::default()),
            active: AtomicBool::new(true),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// False once [`exit`] has been called.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Lock the trace graph.
    pub fn lock(self: &Arc<Self>) -> StateLock<'_> {
        StateLock {
            state: self,
            guard: Some(self.data.lock()),
        }
    }

    /// Copy of the graph recorded so far.
    pub fn graph_snapshot(&self) -> Graph {
        self.data.lock().graph.clone()
    }
}

/// Scoped lock over a tracing state that can be released and reacquired
/// in the middle of its scope.
///
/// Accessing the graph while released is a bug and panics.
pub struct StateLock<'a> {
    state: &'a Arc<TracingState>,
    guard: Option<MutexGuard<'a, TraceData>>,
}

impl<'a> StateLock<'a> {
    /// Unlock so that nested code can trace into the same state.
    pub fn release(&mut self) {
        self.guard = None;
    }

    /// Lock again after [`StateLock::release`]. No-op while held.
    pub fn reacquire(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.state.data.lock());
        }
    }

    pub fn is_held(&self) -> bool {
        self.guard.is_some()
    }

    pub fn state(&self) -> &'a Arc<TracingState> {
        self.state
    }

    /// The locked trace graph.
    ///
    /// # Panics
    /// Panics if called between [`StateLock::release`] and
    /// [`StateLock::reacquire`].
    pub fn graph(&mut self) -> &mut Graph {
        &mut self
            .guard
            .as_deref_mut()
            .expect("trace graph accessed while the state lock is released")
            .graph
    }
}

// ============================================================================
// Session lifecycle
// ============================================================================

/// Start tracing: every input becomes a graph parameter.
pub fn enter(inputs: &[Variable]) -> Arc<TracingState> {
    let state = TracingState::new();
    {
        let mut lock = state.lock();
        for input in inputs {
            let param = lock.graph().add_param();
            if let Some(data) = input.data() {
                lock.graph().infer_type_from(param, data);
                set_value_trace(&state, input, param);
            }
        }
    }
    debug!(state = state.id, params = inputs.len(), "tracing started");
    state
}

/// Stop tracing, register `outputs` and hand back the recorded graph.
pub fn exit(state: &Arc<TracingState>, outputs: &[Variable]) -> Result<Graph> {
    let mut lock = state.lock();
    for output in outputs {
        let node = get_value_trace(&mut lock, output);
        lock.graph().register_output(node);
    }
    state.active.store(false, Ordering::Release);
    let graph = std::mem::take(lock.graph());
    graph.lint()?;
    debug!(state = state.id, nodes = graph.len(), "tracing finished");
    Ok(graph)
}

// ============================================================================
// Value traces
// ============================================================================

fn state_of(var: &Variable) -> Option<Arc<TracingState>> {
    let inner = var.inner()?;
    let trace = inner.trace.lock();
    trace
        .as_ref()
        .and_then(|t| t.state.upgrade())
        .filter(|s| s.is_active())
}

/// Whether any of `vars` is bound to an active trace.
pub fn is_tracing(vars: &[Variable]) -> bool {
    vars.iter().any(|v| state_of(v).is_some())
}

/// The single active tracing state the given values belong to.
pub fn get_tracing_state(vars: &[Variable]) -> Result<Arc<TracingState>> {
    let mut found: Option<Arc<TracingState>> = None;
    for var in vars {
        let Some(state) = state_of(var) else {
            continue;
        };
        match &found {
            Some(f) if f.id != state.id => return Err(AutogradError::MixedTraces),
            Some(_) => {}
            None => found = Some(state),
        }
    }
    found.ok_or(AutogradError::NotTracing)
}

/// Bind `var` to `node` in `state`, replacing any previous binding.
pub fn set_value_trace(state: &Arc<TracingState>, var: &Variable, node: NodeId) {
    if let Some(inner) = var.inner() {
        *inner.trace.lock() = Some(ValueTrace {
            state: Arc::downgrade(state),
            node,
        });
    }
}

/// Node bound to `var` in the locked state. Values that were never traced
/// are captured as constants; undefined values get a placeholder node.
pub fn get_value_trace(lock: &mut StateLock<'_>, var: &Variable) -> NodeId {
    let state = lock.state();
    if let Some(inner) = var.inner() {
        let bound = inner.trace.lock().as_ref().and_then(|t| {
            let same = t.state.upgrade().is_some_and(|s| Arc::ptr_eq(&s, state));
            same.then_some(t.node)
        });
        if let Some(node) = bound {
            return node;
        }
    }
    match var.data() {
        Some(data) => {
            let node = lock.graph().create_constant(data);
            set_value_trace(state, var, node);
            node
        }
        None => lock.graph().create_undefined(),
    }
}

/// Record that the backward of `node` cannot be traced through and wrap the
/// backward subgraph between `inputs` and `outputs` into an [`Eval`].
pub fn nontraceable_backward_subgraph(
    lock: &mut StateLock<'_>,
    node: NodeId,
    inputs: &[Variable],
    outputs: &[Variable],
) -> Option<Arc<Eval>> {
    lock.graph().mark_backward_nontraceable(node);
    Eval::replace_subgraph(inputs, outputs)
}
