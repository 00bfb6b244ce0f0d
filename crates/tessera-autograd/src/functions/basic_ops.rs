//! Elementwise primitives and their gradient functions.

use std::sync::Arc;

use crate::error::{AutogradError, Result};
use crate::function::{
    call, check_inputs, wrap_outputs, Function, FunctionBase, FunctionFlags, FunctionKind,
};
use crate::saved::SavedVariable;
use crate::variable::Variable;

fn first_output(outputs: Vec<Variable>) -> Variable {
    outputs.into_iter().next().unwrap_or_default()
}

fn tensors<'a>(inputs: &'a [Variable]) -> impl Iterator<Item = &'a tessera_core::Tensor> + 'a {
    inputs.iter().filter_map(Variable::data)
}

/// Elementwise sum, recorded through [`call`].
pub fn add(a: &Variable, b: &Variable) -> Result<Variable> {
    let function: Arc<dyn Function> = Add::new();
    Ok(first_output(call(&function, &[a.clone(), b.clone()])?))
}

/// Elementwise product, recorded through [`call`].
pub fn mul(a: &Variable, b: &Variable) -> Result<Variable> {
    let function: Arc<dyn Function> = Mul::new();
    Ok(first_output(call(&function, &[a.clone(), b.clone()])?))
}

// ============================================================================
// Add
// ============================================================================

/// Forward `a + b`.
#[derive(Default)]
pub struct Add {
    base: FunctionBase,
}

impl Add {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Function for Add {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Add
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_inputs(self, inputs, 2)?;
        let mut data = tensors(inputs);
        let (Some(a), Some(b)) = (data.next(), data.next()) else {
            return Ok(vec![Variable::undefined()]);
        };
        let out = a.add(b)?;
        Ok(wrap_outputs(inputs, vec![out], |flags| {
            Arc::new(AddBackward::new(flags))
        }))
    }

    fn passes_state_transparently(&self) -> bool {
        true
    }
}

/// Gradient of `a + b`: the output gradient goes to both inputs unchanged.
pub struct AddBackward {
    base: FunctionBase,
}

impl AddBackward {
    pub fn new(flags: FunctionFlags) -> Self {
        Self {
            base: FunctionBase::new(flags),
        }
    }
}

impl Function for AddBackward {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::AddBackward
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let grad = inputs.first().cloned().unwrap_or_default();
        Ok(vec![grad.clone(), grad])
    }

    fn is_traceable(&self) -> bool {
        true
    }
}

// ============================================================================
// Mul
// ============================================================================

/// Forward `a * b`.
#[derive(Default)]
pub struct Mul {
    base: FunctionBase,
}

impl Mul {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Function for Mul {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Mul
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        check_inputs(self, inputs, 2)?;
        let mut data = tensors(inputs);
        let (Some(a), Some(b)) = (data.next(), data.next()) else {
            return Ok(vec![Variable::undefined()]);
        };
        let out = a.mul(b)?;
        Ok(wrap_outputs(inputs, vec![out], |flags| {
            Arc::new(MulBackward::new(
                flags,
                SavedVariable::new(&inputs[0], false),
                SavedVariable::new(&inputs[1], false),
            ))
        }))
    }

    fn passes_state_transparently(&self) -> bool {
        true
    }
}

/// Gradient of `a * b`: `(grad * b, grad * a)`.
///
/// Computed with [`mul`], so the gradients are differentiable again; when
/// traced, its own backward is replayed through an `Eval`.
pub struct MulBackward {
    base: FunctionBase,
    self_: SavedVariable,
    other: SavedVariable,
}

impl MulBackward {
    pub fn new(flags: FunctionFlags, self_: SavedVariable, other: SavedVariable) -> Self {
        Self {
            base: FunctionBase::new(flags),
            self_,
            other,
        }
    }
}

impl Function for MulBackward {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::MulBackward
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let grad = inputs.first().cloned().unwrap_or_default();
        if !grad.defined() {
            return Ok(vec![Variable::undefined(), Variable::undefined()]);
        }
        let a = self.self_.unpack(None)?;
        let b = self.other.unpack(None)?;
        Ok(vec![mul(&grad, &b)?, mul(&grad, &a)?])
    }

    fn saved_variables(&self) -> Option<Vec<SavedVariable>> {
        Some(vec![self.self_.clone(), self.other.clone()])
    }
}

// ============================================================================
// Error
// ============================================================================

/// Gradient function of non-differentiable outputs: fails when reached.
pub struct Error {
    base: FunctionBase,
    msg: String,
}

impl Error {
    pub fn new(msg: impl Into<String>, flags: FunctionFlags) -> Self {
        Self {
            base: FunctionBase::new(flags),
            msg: msg.into(),
        }
    }
}

impl Function for Error {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Error
    }

    fn apply(&self, _inputs: &[Variable]) -> Result<Vec<Variable>> {
        Err(AutogradError::Msg(self.msg.clone()))
    }

    fn passes_state_transparently(&self) -> bool {
        true
    }
}
