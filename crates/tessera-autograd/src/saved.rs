//! Variables kept alive by a function for its backward computation.

use std::sync::{Arc, Weak};

use tessera_core::Tensor;

use crate::error::{AutogradError, Result};
use crate::function::{Edge, Function};
use crate::functions::AccumulateGrad;
use crate::variable::Variable;

/// Snapshot of a variable taken when a function saves it for backward.
///
/// If the variable is an output of the saving function, its producer is not
/// stored (that would be a reference cycle); `unpack` re-binds it to the
/// function passed as `saved_for`.
#[derive(Clone, Default)]
pub struct SavedVariable {
    data: Option<Tensor>,
    requires_grad: bool,
    is_volatile: bool,
    output_nr: usize,
    grad_fn: Option<Arc<dyn Function>>,
    grad_accumulator: Weak<AccumulateGrad>,
    was_output: bool,
    had_grad_fn: bool,
}

impl SavedVariable {
    pub fn new(variable: &Variable, is_output: bool) -> Self {
        let Some(data) = variable.data() else {
            return Self::default();
        };
        let grad_fn = variable.grad_fn();
        let grad_accumulator = if grad_fn.is_none() && variable.requires_grad() {
            variable
                .grad_accumulator()
                .map(|acc| Arc::downgrade(&acc))
                .unwrap_or_default()
        } else {
            Weak::new()
        };
        Self {
            data: Some(data.clone()),
            requires_grad: variable.requires_grad(),
            is_volatile: variable.is_volatile(),
            output_nr: variable.output_nr(),
            had_grad_fn: grad_fn.is_some(),
            grad_fn: if is_output { None } else { grad_fn },
            grad_accumulator,
            was_output: is_output,
        }
    }

    pub fn defined(&self) -> bool {
        self.data.is_some()
    }

    /// Rebuild a variable that routes gradients where the original did.
    pub fn unpack(&self, saved_for: Option<&Arc<dyn Function>>) -> Result<Variable> {
        let Some(data) = &self.data else {
            return Ok(Variable::undefined());
        };
        if self.had_grad_fn {
            let function = if self.was_output {
                saved_for.cloned().ok_or(AutogradError::MissingSavedFor)?
            } else {
                self.grad_fn.clone().ok_or(AutogradError::MissingSavedFor)?
            };
            return Ok(Variable::from_parts(
                data.clone(),
                self.requires_grad,
                self.is_volatile,
                Some(Edge::new(function, self.output_nr)),
                None,
            ));
        }
        let accumulator = if self.requires_grad {
            Some(
                self.grad_accumulator
                    .upgrade()
                    .ok_or(AutogradError::NoGradAccumulator)?,
            )
        } else {
            None
        };
        Ok(Variable::from_parts(
            data.clone(),
            self.requires_grad,
            self.is_volatile,
            None,
            accumulator,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::basic_ops::mul;

    #[test]
    fn test_unpack_leaf_reuses_accumulator() {
        let x = Variable::leaf(Tensor::scalar(3.0), true);
        let saved = SavedVariable::new(&x, false);
        let y = saved.unpack(None).unwrap();
        assert!(!y.same_as(&x));
        assert!(y.data().unwrap().shares_storage(x.data().unwrap()));
        let a = x.grad_accumulator().unwrap();
        let b = y.grad_accumulator().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_unpack_interior_keeps_producer() {
        let a = Variable::leaf(Tensor::scalar(2.0), true);
        let c = mul(&a, &a).unwrap();
        let saved = SavedVariable::new(&c, false);
        let d = saved.unpack(None).unwrap();
        assert_eq!(d.grad_fn().unwrap().id(), c.grad_fn().unwrap().id());
        assert_eq!(d.output_nr(), c.output_nr());
    }

    #[test]
    fn test_unpack_output_needs_saved_for() {
        let a = Variable::leaf(Tensor::scalar(2.0), true);
        let c = mul(&a, &a).unwrap();
        let saved = SavedVariable::new(&c, true);
        assert!(matches!(
            saved.unpack(None),
            Err(AutogradError::MissingSavedFor)
        ));
        let producer = c.grad_fn().unwrap();
        let d = saved.unpack(Some(&producer)).unwrap();
        assert_eq!(d.grad_fn().unwrap().id(), producer.id());
    }

    #[test]
    fn test_dead_accumulator_is_an_error() {
        let saved = {
            let x = Variable::leaf(Tensor::scalar(1.0), true);
            SavedVariable::new(&x, false)
        };
        assert!(matches!(
            saved.unpack(None),
            Err(AutogradError::NoGradAccumulator)
        ));
    }

    #[test]
    fn test_undefined_round_trips() {
        let saved = SavedVariable::new(&Variable::undefined(), false);
        assert!(!saved.defined());
        assert!(!saved.unpack(None).unwrap().defined());
    }
}
