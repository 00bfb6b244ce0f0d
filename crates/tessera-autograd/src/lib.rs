//! # tessera-autograd
//!
//! Bookkeeping layer of the tessera reverse-mode autograd engine.
//!
//! Provides:
//! - `Variable` handles that know their producer or their gradient sink
//! - `FunctionFlags` derivation (executability, volatility, next functions)
//! - The `Function` trait implemented by every differentiable step
//! - Trace capture: `traced_apply` records steps into a `tessera_jit::Graph`
//!   and links each forward node to the `Eval` that replays its backward
//! - A dependency-counting backward engine and a grad-mode scope

pub mod engine;
pub mod error;
pub mod function;
pub mod functions;
pub mod saved;
pub mod scope;
pub mod traced;
pub mod tracer;
pub mod variable;

pub use engine::backward;
pub use error::{AutogradError, Result};
pub use function::{call, wrap_outputs, Edge, Function, FunctionBase, FunctionFlags, FunctionKind};
pub use functions::{AccumulateGrad, Eval};
pub use saved::SavedVariable;
pub use scope::{is_grad_enabled, NoGradGuard};
pub use traced::{set_up_context_edge, traced_apply};
pub use tracer::{StateLock, TracingState};
pub use variable::Variable;
