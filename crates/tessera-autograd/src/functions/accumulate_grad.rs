use std::sync::{Arc, Weak};

use crate::error::Result;
use crate::function::{Function, FunctionBase, FunctionFlags, FunctionKind};
use crate::variable::{Variable, VariableImpl};

/// Terminal function that sums incoming gradients into a leaf's `grad`.
///
/// Holds the leaf weakly; the leaf owns its accumulator. Executable only when
/// the leaf requires grad, so the engine never writes into other leaves.
pub struct AccumulateGrad {
    base: FunctionBase,
    variable: Weak<VariableImpl>,
}

impl AccumulateGrad {
    pub(crate) fn new(variable: Weak<VariableImpl>, requires_grad: bool) -> Arc<Self> {
        let flags = FunctionFlags {
            is_executable: requires_grad,
            ..FunctionFlags::default()
        };
        Arc::new(Self {
            base: FunctionBase::new(flags),
            variable,
        })
    }

    /// The leaf, if it is still alive.
    pub fn variable(&self) -> Option<Variable> {
        self.variable.upgrade().map(Variable::from_arc)
    }
}

impl Function for AccumulateGrad {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::AccumulateGrad
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let (Some(variable), Some(grad)) = (self.variable(), inputs.first()) else {
            return Ok(Vec::new());
        };
        if let Some(data) = grad.data() {
            variable.accumulate_grad(data)?;
        }
        Ok(Vec::new())
    }

    fn is_traceable(&self) -> bool {
        true
    }
}
