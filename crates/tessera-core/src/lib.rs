//! # tessera-core
//!
//! Tensor values for the tessera autograd core.
//!
//! Provides the `Tensor` type consumed by the autograd and tracing layers:
//! - F32 and F64 element types
//! - Shared, reference-counted storage (clones never copy data)
//! - The handful of elementwise ops the gradient functions need

pub mod dtype;
pub mod error;
pub mod shape;
pub mod tensor;

pub use dtype::DType;
pub use error::CoreError;
pub use shape::Shape;
pub use tensor::Tensor;

pub type Result<T> = std::result::Result<T, CoreError>;
