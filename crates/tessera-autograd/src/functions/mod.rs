//! Built-in functions.
//!
//! - [`AccumulateGrad`]: gradient sink of a leaf variable
//! - [`Eval`]: opaque replay of a wrapped backward subgraph
//! - [`basic_ops`]: `Add`/`Mul` primitives and their gradient functions

pub mod accumulate_grad;
pub mod basic_ops;
pub mod eval;

pub use accumulate_grad::AccumulateGrad;
pub use basic_ops::{add, mul, Add, AddBackward, Error, Mul, MulBackward};
pub use eval::Eval;
