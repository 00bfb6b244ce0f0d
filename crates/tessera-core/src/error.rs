use crate::dtype::DType;
use crate::shape::Shape;

/// Errors raised by tensor operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Elementwise op on tensors of different shapes.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// Elementwise op on tensors of different element types.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch { expected: DType, got: DType },

    /// Element count does not match the requested shape.
    #[error("shape {shape} requires {expected} elements, got {got}")]
    ElementCount {
        shape: Shape,
        expected: usize,
        got: usize,
    },
}
