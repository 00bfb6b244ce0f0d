//! Gradient-tracking handles around tensor values.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use tessera_core::Tensor;

use crate::error::Result;
use crate::function::{Edge, Function};
use crate::functions::AccumulateGrad;
use crate::tracer::ValueTrace;

static NEXT_VARIABLE_ID: AtomicUsize = AtomicUsize::new(0);

fn next_id() -> usize {
    NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct VariableImpl {
    id: usize,
    data: Tensor,
    requires_grad: bool,
    is_volatile: bool,
    /// Producer and output index. Only `Eval` re-points it after creation.
    grad_fn: RwLock<Option<Edge>>,
    grad_accumulator: OnceLock<Arc<AccumulateGrad>>,
    grad: RwLock<Option<Tensor>>,
    pub(crate) trace: Mutex<Option<ValueTrace>>,
}

/// A value flowing through differentiable computation.
///
/// `Variable` is a cheap, clonable handle. A default-constructed variable is
/// *undefined*: a hole that carries no data and never contributes to flags.
///
/// A defined variable is either produced by a function (`grad_fn` is set,
/// gradients are routed back to that function) or a leaf, in which case
/// gradients are collected by its [`AccumulateGrad`] sink.
#[derive(Clone, Default)]
pub struct Variable {
    inner: Option<Arc<VariableImpl>>,
}

impl Variable {
    fn from_impl(
        data: Tensor,
        requires_grad: bool,
        is_volatile: bool,
        grad_fn: Option<Edge>,
        accumulator: Option<Arc<AccumulateGrad>>,
    ) -> Self {
        let grad_accumulator = OnceLock::new();
        if let Some(acc) = accumulator {
            let _ = grad_accumulator.set(acc);
        }
        Self {
            inner: Some(Arc::new(VariableImpl {
                id: next_id(),
                data,
                requires_grad,
                is_volatile,
                grad_fn: RwLock::new(grad_fn),
                grad_accumulator,
                grad: RwLock::new(None),
                trace: Mutex::new(None),
            })),
        }
    }

    /// An undefined placeholder.
    pub fn undefined() -> Self {
        Self::default()
    }

    /// A graph input.
    pub fn leaf(data: Tensor, requires_grad: bool) -> Self {
        Self::from_impl(data, requires_grad, false, None, None)
    }

    /// A leaf that poisons differentiability of every step consuming it.
    pub fn volatile(data: Tensor) -> Self {
        Self::from_impl(data, false, true, None, None)
    }

    /// Output `edge.input_nr` of `edge.function`.
    pub(crate) fn with_grad_fn(data: Tensor, edge: Edge) -> Self {
        Self::from_impl(data, true, false, Some(edge), None)
    }

    /// Rebuild a variable from saved state, reusing an existing accumulator.
    pub(crate) fn from_parts(
        data: Tensor,
        requires_grad: bool,
        is_volatile: bool,
        grad_fn: Option<Edge>,
        accumulator: Option<Arc<AccumulateGrad>>,
    ) -> Self {
        Self::from_impl(data, requires_grad, is_volatile, grad_fn, accumulator)
    }

    pub(crate) fn from_arc(inner: Arc<VariableImpl>) -> Self {
        Self { inner: Some(inner) }
    }

    pub(crate) fn inner(&self) -> Option<&Arc<VariableImpl>> {
        self.inner.as_ref()
    }

    // =========================================================================
    // Properties
    // =========================================================================

    /// Whether this holds a real value.
    pub fn defined(&self) -> bool {
        self.inner.is_some()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.as_ref().is_some_and(|v| v.requires_grad)
    }

    pub fn is_volatile(&self) -> bool {
        self.inner.as_ref().is_some_and(|v| v.is_volatile)
    }

    /// Unique id, `None` for undefined variables.
    pub fn id(&self) -> Option<usize> {
        self.inner.as_ref().map(|v| v.id)
    }

    /// The underlying tensor.
    pub fn data(&self) -> Option<&Tensor> {
        self.inner.as_ref().map(|v| &v.data)
    }

    /// Whether both handles point to the same defined variable.
    pub fn same_as(&self, other: &Variable) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// The function that produced this variable.
    pub fn grad_fn(&self) -> Option<Arc<dyn Function>> {
        let inner = self.inner.as_ref()?;
        inner.grad_fn.read().as_ref().map(|e| Arc::clone(&e.function))
    }

    /// Which output of `grad_fn` this variable is. Leaves report 0.
    pub fn output_nr(&self) -> usize {
        self.inner
            .as_ref()
            .and_then(|v| v.grad_fn.read().as_ref().map(|e| e.input_nr))
            .unwrap_or(0)
    }

    /// Leaves have no producer.
    pub fn is_leaf(&self) -> bool {
        self.inner
            .as_ref()
            .map_or(true, |v| v.grad_fn.read().is_none())
    }

    /// Gradient sink of a leaf, created on first use and reused afterwards.
    ///
    /// Returns `None` for undefined and non-leaf variables.
    pub fn grad_accumulator(&self) -> Option<Arc<AccumulateGrad>> {
        let inner = self.inner.as_ref()?;
        if inner.grad_fn.read().is_some() {
            return None;
        }
        let acc = inner
            .grad_accumulator
            .get_or_init(|| AccumulateGrad::new(Arc::downgrade(inner), inner.requires_grad));
        Some(Arc::clone(acc))
    }

    /// Where a gradient for this variable has to be sent.
    pub fn gradient_edge(&self) -> Option<Edge> {
        let inner = self.inner.as_ref()?;
        if let Some(edge) = inner.grad_fn.read().as_ref() {
            return Some(edge.clone());
        }
        let acc: Arc<dyn Function> = self.grad_accumulator()?;
        Some(Edge::new(acc, 0))
    }

    pub(crate) fn set_grad_fn(&self, edge: Edge) {
        if let Some(inner) = &self.inner {
            *inner.grad_fn.write() = Some(edge);
        }
    }

    // =========================================================================
    // Gradients
    // =========================================================================

    /// Gradient accumulated into this leaf by backward passes.
    pub fn grad(&self) -> Option<Tensor> {
        self.inner.as_ref().and_then(|v| v.grad.read().clone())
    }

    pub fn zero_grad(&self) {
        if let Some(inner) = &self.inner {
            *inner.grad.write() = None;
        }
    }

    pub(crate) fn accumulate_grad(&self, grad: &Tensor) -> Result<()> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let mut lock = inner.grad.write();
        let next = match lock.as_ref() {
            Some(existing) => existing.add(grad)?,
            None => grad.clone(),
        };
        *lock = Some(next);
        Ok(())
    }

    /// Run a backward pass from this variable.
    ///
    /// `grad` defaults to ones shaped like the value.
    pub fn backward(&self, grad: Option<Tensor>) -> Result<()> {
        let grad = match (grad, self.data()) {
            (Some(g), _) => g,
            (None, Some(data)) => data.ones_like(),
            (None, None) => return Ok(()),
        };
        crate::engine::backward(std::slice::from_ref(self), vec![Variable::leaf(grad, false)])
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(inner) = &self.inner else {
            return write!(f, "Variable(undefined)");
        };
        let mut s = f.debug_struct("Variable");
        s.field("id", &inner.id)
            .field("shape", inner.data.shape())
            .field("requires_grad", &inner.requires_grad);
        if inner.is_volatile {
            s.field("volatile", &true);
        }
        if let Some(edge) = inner.grad_fn.read().as_ref() {
            s.field("grad_fn", edge);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_undefined() {
        let v = Variable::undefined();
        assert!(!v.defined());
        assert!(!v.requires_grad());
        assert!(!v.is_volatile());
        assert!(v.grad_accumulator().is_none());
        assert!(v.gradient_edge().is_none());
    }

    #[test]
    fn test_leaf_accumulator_is_reused() {
        let v = Variable::leaf(Tensor::scalar(1.0), true);
        assert!(v.is_leaf());
        let a = v.grad_accumulator().unwrap();
        let b = v.grad_accumulator().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(v.gradient_edge().unwrap().function.id(), a.id());
    }

    #[test]
    fn test_volatile_leaf() {
        let v = Variable::volatile(Tensor::scalar(1.0));
        assert!(v.is_volatile());
        assert!(!v.requires_grad());
    }

    #[test]
    fn test_accumulate_grad_sums() {
        let v = Variable::leaf(Tensor::from_f32(&[1.0, 1.0], &[2]), true);
        v.accumulate_grad(&Tensor::from_f32(&[1.0, 2.0], &[2])).unwrap();
        v.accumulate_grad(&Tensor::from_f32(&[3.0, 4.0], &[2])).unwrap();
        assert_eq!(v.grad().unwrap().as_f32_slice().unwrap(), &[4.0, 6.0]);
        v.zero_grad();
        assert!(v.grad().is_none());
    }

    #[test]
    fn test_clone_is_same_variable() {
        let v = Variable::leaf(Tensor::scalar(2.0), false);
        let w = v.clone();
        assert!(v.same_as(&w));
        assert!(!v.same_as(&Variable::leaf(Tensor::scalar(2.0), false)));
        assert!(!Variable::undefined().same_as(&Variable::undefined()));
    }
}
