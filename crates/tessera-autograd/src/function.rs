//! The `Function` trait and the flags every function is built from.

use std::borrow::Borrow;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tessera_core::Tensor;

use crate::error::{AutogradError, Result};
use crate::functions::Eval;
use crate::saved::SavedVariable;
use crate::variable::Variable;
use crate::{scope, traced, tracer};

static NEXT_FUNCTION_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed)
}

// ============================================================================
// Edges and flags
// ============================================================================

/// Input slot `input_nr` of `function`: where a gradient is routed next.
#[derive(Clone)]
pub struct Edge {
    pub function: Arc<dyn Function>,
    pub input_nr: usize,
}

impl Edge {
    /// Edge into slot `input_nr` of `function`.
    pub fn new(function: Arc<dyn Function>, input_nr: usize) -> Self {
        Self { function, input_nr }
    }

    /// Same function (by identity) and same slot.
    pub fn same_as(&self, other: &Edge) -> bool {
        self.function.id() == other.function.id() && self.input_nr == other.input_nr
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}:{}", self.function.name(), self.function.id(), self.input_nr)
    }
}

/// Differentiability metadata derived from a function's inputs.
#[derive(Debug, Clone, Default)]
pub struct FunctionFlags {
    /// At least one input requires grad and none is volatile.
    pub is_executable: bool,
    /// Some input is volatile.
    pub is_volatile: bool,
    /// One slot per input; `None` for undefined inputs.
    pub next_functions: Vec<Option<Edge>>,
}

impl FunctionFlags {
    /// Flags for an owned input list.
    pub fn from_inputs(inputs: &[Variable]) -> Self {
        make_flags(inputs)
    }

    /// Flags for a borrowed list view.
    pub fn from_refs(inputs: &[&Variable]) -> Self {
        make_flags(inputs.iter().copied())
    }

    /// Flags for any sequence of variables.
    pub fn collect<I>(inputs: I) -> Self
    where
        I: IntoIterator,
        I::Item: Borrow<Variable>,
    {
        make_flags(inputs)
    }
}

fn make_flags<I>(inputs: I) -> FunctionFlags
where
    I: IntoIterator,
    I::Item: Borrow<Variable>,
{
    let mut flags = FunctionFlags::default();
    for input in inputs {
        let var = input.borrow();
        if !var.defined() {
            flags.next_functions.push(None);
            continue;
        }
        flags.is_executable |= var.requires_grad();
        flags.is_volatile |= var.is_volatile();
        // producer edge for interior values, accumulator for leaves
        flags.next_functions.push(var.gradient_edge());
    }
    flags.is_executable &= !flags.is_volatile;
    flags
}

// ============================================================================
// Function identity and per-function state
// ============================================================================

/// Identity tag of a function implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionKind {
    AccumulateGrad,
    Eval,
    Add,
    AddBackward,
    Mul,
    MulBackward,
    Error,
    /// Functions defined outside this crate.
    Custom(&'static str),
}

impl FunctionKind {
    pub fn name(&self) -> &'static str {
        match self {
            FunctionKind::AccumulateGrad => "AccumulateGrad",
            FunctionKind::Eval => "Eval",
            FunctionKind::Add => "Add",
            FunctionKind::AddBackward => "AddBackward",
            FunctionKind::Mul => "Mul",
            FunctionKind::MulBackward => "MulBackward",
            FunctionKind::Error => "Error",
            FunctionKind::Custom(name) => *name,
        }
    }
}

impl fmt::Display for FunctionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Tracing bookkeeping attached to each function.
#[derive(Debug, Default)]
pub struct FunctionTracingState {
    in_eval_subgraph: AtomicBool,
}

impl FunctionTracingState {
    /// Whether an `Eval` already wraps this function's backward.
    pub fn in_eval_subgraph(&self) -> bool {
        self.in_eval_subgraph.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_eval_subgraph(&self, value: bool) {
        self.in_eval_subgraph.store(value, Ordering::Release);
    }
}

/// State shared by every function: identity, flags and tracing bookkeeping.
#[derive(Debug)]
pub struct FunctionBase {
    id: usize,
    flags: FunctionFlags,
    tracing_state: FunctionTracingState,
}

impl FunctionBase {
    /// Fresh identity with the given flags.
    pub fn new(flags: FunctionFlags) -> Self {
        Self {
            id: next_id(),
            flags,
            tracing_state: FunctionTracingState::default(),
        }
    }
}

impl Default for FunctionBase {
    fn default() -> Self {
        Self::new(FunctionFlags::default())
    }
}

// ============================================================================
// Function trait
// ============================================================================

/// A differentiable step in the computation graph.
///
/// Gradient functions are `Function`s whose `apply` maps output gradients to
/// input gradients; forward primitives are `Function`s too, so both can be
/// recorded by the tracer.
pub trait Function: Send + Sync {
    /// Shared identity, flags and tracing state.
    fn base(&self) -> &FunctionBase;

    /// Identity tag used for diagnostics.
    fn kind(&self) -> FunctionKind;

    /// Run the step.
    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>>;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Whether the function is built from traced primitives, so recording it
    /// again would duplicate nodes.
    fn is_traceable(&self) -> bool {
        false
    }

    /// Whether context flows through without a backward-context edge.
    fn passes_state_transparently(&self) -> bool {
        false
    }

    /// Values kept for backward; `None` means not implemented.
    fn saved_variables(&self) -> Option<Vec<SavedVariable>> {
        None
    }

    /// Downcast for the context-management function.
    fn as_eval(&self) -> Option<&Eval> {
        None
    }

    fn id(&self) -> usize {
        self.base().id
    }

    fn flags(&self) -> &FunctionFlags {
        &self.base().flags
    }

    fn is_executable(&self) -> bool {
        self.base().flags.is_executable
    }

    fn next_functions(&self) -> &[Option<Edge>] {
        &self.base().flags.next_functions
    }

    /// Number of values `apply` returns when run as a gradient function.
    fn num_outputs(&self) -> usize {
        self.base().flags.next_functions.len()
    }

    fn tracing_state(&self) -> &FunctionTracingState {
        &self.base().tracing_state
    }
}

/// Apply `function`, recording it when any input is being traced.
pub fn call(function: &Arc<dyn Function>, inputs: &[Variable]) -> Result<Vec<Variable>> {
    if tracer::is_tracing(inputs) {
        return traced::traced_apply(function, inputs.to_vec());
    }
    function.apply(inputs)
}

/// Attach freshly computed tensors to the backward graph.
///
/// When the inputs make the step executable (and grad mode is on) `ctor`
/// builds the gradient function from the derived flags and output `i` becomes
/// its `i`-th output. Otherwise outputs are leaves that inherit volatility.
pub fn wrap_outputs<F>(inputs: &[Variable], outputs: Vec<Tensor>, ctor: F) -> Vec<Variable>
where
    F: FnOnce(FunctionFlags) -> Arc<dyn Function>,
{
    let flags = FunctionFlags::from_inputs(inputs);
    if !flags.is_executable || !scope::is_grad_enabled() {
        let volatile = flags.is_volatile;
        return outputs
            .into_iter()
            .map(|t| {
                if volatile {
                    Variable::volatile(t)
                } else {
                    Variable::leaf(t, false)
                }
            })
            .collect();
    }
    let grad_fn = ctor(flags);
    outputs
        .into_iter()
        .enumerate()
        .map(|(i, t)| Variable::with_grad_fn(t, Edge::new(Arc::clone(&grad_fn), i)))
        .collect()
}

/// Check arity and definedness of a forward primitive's inputs.
pub(crate) fn check_inputs(
    function: &dyn Function,
    inputs: &[Variable],
    expected: usize,
) -> Result<()> {
    if inputs.len() != expected {
        return Err(AutogradError::InputCount {
            name: function.name(),
            expected,
            got: inputs.len(),
        });
    }
    if let Some(index) = inputs.iter().position(|v| !v.defined()) {
        return Err(AutogradError::UndefinedInput {
            name: function.name(),
            index,
        });
    }
    Ok(())
}
