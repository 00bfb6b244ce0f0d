use std::fmt;
use std::sync::Arc;

use crate::dtype::DType;
use crate::error::CoreError;
use crate::shape::Shape;
use crate::Result;

/// Shared element buffer. Cloning a tensor only bumps the reference count.
#[derive(Clone)]
enum Storage {
    F32(Arc<Vec<f32>>),
    F64(Arc<Vec<f64>>),
}

/// A dense, contiguous, immutable multi-dimensional array.
///
/// Tensors are plain values: gradient tracking lives in `tessera-autograd`,
/// which wraps a `Tensor` in a `Variable`.
///
/// # Examples
///
/// ```
/// use tessera_core::Tensor;
///
/// let t = Tensor::from_f32(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
/// assert_eq!(t.shape().dims(), &[2, 2]);
/// assert_eq!(t.numel(), 4);
/// ```
#[derive(Clone)]
pub struct Tensor {
    storage: Storage,
    shape: Shape,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Create a tensor from f32 data with the given shape.
    ///
    /// # Panics
    /// Panics if the element count does not match the shape; use
    /// [`Tensor::try_from_f32`] for a fallible version.
    pub fn from_f32(data: &[f32], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(
            s.numel(),
            data.len(),
            "Shape {:?} requires {} elements, got {}",
            shape,
            s.numel(),
            data.len()
        );
        Self {
            storage: Storage::F32(Arc::new(data.to_vec())),
            shape: s,
        }
    }

    /// Fallible variant of [`Tensor::from_f32`].
    pub fn try_from_f32(data: Vec<f32>, shape: &[usize]) -> Result<Self> {
        let s = Shape::new(shape);
        if s.numel() != data.len() {
            return Err(CoreError::ElementCount {
                expected: s.numel(),
                got: data.len(),
                shape: s,
            });
        }
        Ok(Self {
            storage: Storage::F32(Arc::new(data)),
            shape: s,
        })
    }

    /// Create a tensor from f64 data with the given shape.
    pub fn from_f64(data: &[f64], shape: &[usize]) -> Self {
        let s = Shape::new(shape);
        assert_eq!(s.numel(), data.len());
        Self {
            storage: Storage::F64(Arc::new(data.to_vec())),
            shape: s,
        }
    }

    /// Create a scalar tensor from a single f32 value.
    pub fn scalar(value: f32) -> Self {
        Self {
            storage: Storage::F32(Arc::new(vec![value])),
            shape: Shape::scalar(),
        }
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], value: f64, dtype: DType) -> Self {
        let s = Shape::new(shape);
        let numel = s.numel();
        let storage = match dtype {
            DType::F32 => Storage::F32(Arc::new(vec![value as f32; numel])),
            DType::F64 => Storage::F64(Arc::new(vec![value; numel])),
        };
        Self { storage, shape: s }
    }

    /// Create a tensor of zeros with the given shape and dtype.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    /// Create a tensor of ones (f32).
    pub fn ones(shape: &[usize]) -> Self {
        Self::full(shape, 1.0, DType::F32)
    }

    /// Zeros with the same shape and dtype as `self`.
    pub fn zeros_like(&self) -> Self {
        Self::full(self.shape.dims(), 0.0, self.dtype())
    }

    /// Ones with the same shape and dtype as `self`.
    pub fn ones_like(&self) -> Self {
        Self::full(self.shape.dims(), 1.0, self.dtype())
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Shape of the tensor.
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        match self.storage {
            Storage::F32(_) => DType::F32,
            Storage::F64(_) => DType::F64,
        }
    }

    /// Whether two tensors are views of the same buffer.
    pub fn shares_storage(&self, other: &Tensor) -> bool {
        match (&self.storage, &other.storage) {
            (Storage::F32(a), Storage::F32(b)) => Arc::ptr_eq(a, b),
            (Storage::F64(a), Storage::F64(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    // =========================================================================
    // Data access
    // =========================================================================

    /// Get the underlying f32 data, if this is an F32 tensor.
    pub fn as_f32_slice(&self) -> Option<&[f32]> {
        match &self.storage {
            Storage::F32(v) => Some(v.as_slice()),
            Storage::F64(_) => None,
        }
    }

    /// Get a single f32 element by flat index.
    pub fn get_f32(&self, flat_index: usize) -> Option<f32> {
        self.as_f32_slice()?.get(flat_index).copied()
    }

    /// Copy all elements out as f64, whatever the dtype.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match &self.storage {
            Storage::F32(v) => v.iter().map(|&x| x as f64).collect(),
            Storage::F64(v) => v.as_ref().clone(),
        }
    }

    // =========================================================================
    // Elementwise ops
    // =========================================================================

    /// Elementwise addition.
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a + b, |a, b| a + b)
    }

    /// Elementwise multiplication.
    pub fn mul(&self, other: &Tensor) -> Result<Tensor> {
        self.zip_with(other, |a, b| a * b, |a, b| a * b)
    }

    /// Elementwise negation.
    pub fn neg(&self) -> Tensor {
        let storage = match &self.storage {
            Storage::F32(v) => Storage::F32(Arc::new(v.iter().map(|x| -x).collect())),
            Storage::F64(v) => Storage::F64(Arc::new(v.iter().map(|x| -x).collect())),
        };
        Self {
            storage,
            shape: self.shape.clone(),
        }
    }

    fn zip_with(
        &self,
        other: &Tensor,
        f32_op: impl Fn(f32, f32) -> f32,
        f64_op: impl Fn(f64, f64) -> f64,
    ) -> Result<Tensor> {
        if self.shape != other.shape {
            return Err(CoreError::ShapeMismatch {
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        let storage = match (&self.storage, &other.storage) {
            (Storage::F32(a), Storage::F32(b)) => Storage::F32(Arc::new(
                a.iter().zip(b.iter()).map(|(&x, &y)| f32_op(x, y)).collect(),
            )),
            (Storage::F64(a), Storage::F64(b)) => Storage::F64(Arc::new(
                a.iter().zip(b.iter()).map(|(&x, &y)| f64_op(x, y)).collect(),
            )),
            _ => {
                return Err(CoreError::DTypeMismatch {
                    expected: self.dtype(),
                    got: other.dtype(),
                })
            }
        };
        Ok(Self {
            storage,
            shape: self.shape.clone(),
        })
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor({}, {}, {:?})", self.dtype(), self.shape, self.to_f64_vec())
    }
}
