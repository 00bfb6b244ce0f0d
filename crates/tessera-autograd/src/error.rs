//! Error type shared by the autograd crate.

use tessera_core::CoreError;
use tessera_jit::JitError;

/// Everything that can go wrong while building or running the backward graph.
#[derive(Debug, thiserror::Error)]
pub enum AutogradError {
    /// An untraceable function had to expose its saved variables while being
    /// traced and does not implement `saved_variables()`. Not recoverable.
    #[error("saved_variables() needed but not implemented in {name}")]
    SavedVariablesNotImplemented { name: String },

    /// A saved leaf that requires grad lost its accumulator.
    #[error("no grad accumulator for a saved leaf")]
    NoGradAccumulator,

    /// A saved output was unpacked without the function that produced it.
    #[error("saved output unpacked without its producing function")]
    MissingSavedFor,

    #[error("{name} expected {expected} inputs, got {got}")]
    InputCount {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("{name} got an undefined input at position {index}")]
    UndefinedInput { name: &'static str, index: usize },

    /// Inputs of one step are bound to different tracing states.
    #[error("values from different traces were mixed in one operation")]
    MixedTraces,

    /// None of the inputs belongs to an active trace.
    #[error("no active trace for the given values")]
    NotTracing,

    #[error("backward: {outputs} outputs but {grads} gradients")]
    GradCount { outputs: usize, grads: usize },

    #[error("backward: output {index} does not require grad")]
    DoesNotRequireGrad { index: usize },

    /// Raised by the `Error` function when it is applied.
    #[error("{0}")]
    Msg(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Jit(#[from] JitError),
}

pub type Result<T> = std::result::Result<T, AutogradError>;
