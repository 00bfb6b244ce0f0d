//! Backward pass execution.
//!
//! Gradients flow from root edges through executable functions in dependency
//! order: a function runs once every edge that can reach it has delivered its
//! gradient. Gradients for the same input slot are summed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::error::{AutogradError, Result};
use crate::function::{call, Edge, Function};
use crate::functions::basic_ops;
use crate::variable::Variable;

/// Run a backward pass from `outputs`, seeding each with the matching entry
/// of `grad_outputs`. Leaf gradients end up in [`Variable::grad`].
///
/// # Errors
/// Fails if the counts differ, if an output does not require grad, or if a
/// gradient function fails.
pub fn backward(outputs: &[Variable], grad_outputs: Vec<Variable>) -> Result<()> {
    if outputs.len() != grad_outputs.len() {
        return Err(AutogradError::GradCount {
            outputs: outputs.len(),
            grads: grad_outputs.len(),
        });
    }
    let mut roots = Vec::with_capacity(outputs.len());
    for (index, (output, grad)) in outputs.iter().zip(grad_outputs).enumerate() {
        if !output.requires_grad() {
            return Err(AutogradError::DoesNotRequireGrad { index });
        }
        if let Some(edge) = output.gradient_edge() {
            roots.push((edge, grad));
        }
    }
    run_subgraph(roots, &[])?;
    Ok(())
}

/// Propagate `roots` through the graph, stopping at `boundary`.
///
/// Gradients that arrive at a boundary edge are not delivered; they are
/// returned instead, at the position of the first matching boundary slot.
pub(crate) fn run_subgraph(
    roots: Vec<(Edge, Variable)>,
    boundary: &[Option<Edge>],
) -> Result<Vec<Variable>> {
    let mut captured = vec![Variable::undefined(); boundary.len()];
    let mut dependencies = compute_dependencies(roots.iter().map(|(e, _)| e), boundary);
    let mut pending: HashMap<usize, (Arc<dyn Function>, InputBuffer)> = HashMap::new();
    let mut ready: VecDeque<(Arc<dyn Function>, InputBuffer)> = VecDeque::new();

    debug!(
        roots = roots.len(),
        functions = dependencies.len(),
        boundary = boundary.len(),
        "backward started"
    );

    let mut root_fns = Vec::new();
    for (edge, grad) in roots {
        if let Some(slot) = boundary_slot(boundary, &edge) {
            capture(&mut captured[slot], grad)?;
            continue;
        }
        if !edge.function.is_executable() {
            continue;
        }
        let id = edge.function.id();
        pending
            .entry(id)
            .or_insert_with(|| (Arc::clone(&edge.function), InputBuffer::default()))
            .1
            .add(edge.input_nr, grad)?;
        root_fns.push(id);
    }
    for id in root_fns {
        if dependencies.get(&id).copied().unwrap_or(0) == 0 {
            if let Some(entry) = pending.remove(&id) {
                ready.push_back(entry);
            }
        }
    }

    while let Some((function, buffer)) = ready.pop_front() {
        let outputs = if buffer.has_grad() {
            trace!(function = function.name(), id = function.id(), "running");
            call(&function, &buffer.into_inputs())?
        } else {
            Vec::new()
        };

        for (i, next) in function.next_functions().iter().enumerate() {
            let Some(edge) = next else {
                continue;
            };
            let grad = outputs.get(i).cloned().unwrap_or_default();
            if let Some(slot) = boundary_slot(boundary, edge) {
                capture(&mut captured[slot], grad)?;
                continue;
            }
            if !edge.function.is_executable() {
                continue;
            }
            let id = edge.function.id();
            let entry = pending
                .entry(id)
                .or_insert_with(|| (Arc::clone(&edge.function), InputBuffer::default()));
            entry.1.add(edge.input_nr, grad)?;

            let deps = dependencies.entry(id).or_insert(1);
            *deps = deps.saturating_sub(1);
            if *deps == 0 {
                if let Some(entry) = pending.remove(&id) {
                    ready.push_back(entry);
                }
            }
        }
    }
    Ok(captured)
}

/// Count, per executable function, the edges that lead into it from the
/// part of the graph reachable from `roots`.
fn compute_dependencies<'a>(
    roots: impl Iterator<Item = &'a Edge>,
    boundary: &[Option<Edge>],
) -> HashMap<usize, usize> {
    let mut dependencies = HashMap::new();
    let mut seen = HashSet::new();
    let mut stack: Vec<Arc<dyn Function>> = roots
        .filter(|e| e.function.is_executable() && boundary_slot(boundary, e).is_none())
        .map(|e| Arc::clone(&e.function))
        .collect();
    while let Some(function) = stack.pop() {
        if !seen.insert(function.id()) {
            continue;
        }
        for edge in function.next_functions().iter().flatten() {
            if !edge.function.is_executable() || boundary_slot(boundary, edge).is_some() {
                continue;
            }
            *dependencies.entry(edge.function.id()).or_insert(0) += 1;
            if !seen.contains(&edge.function.id()) {
                stack.push(Arc::clone(&edge.function));
            }
        }
    }
    dependencies
}

fn boundary_slot(boundary: &[Option<Edge>], edge: &Edge) -> Option<usize> {
    boundary
        .iter()
        .position(|b| b.as_ref().is_some_and(|b| b.same_as(edge)))
}

fn capture(slot: &mut Variable, grad: Variable) -> Result<()> {
    if !grad.defined() {
        return Ok(());
    }
    *slot = if slot.defined() {
        basic_ops::add(slot, &grad)?
    } else {
        grad
    };
    Ok(())
}

/// Gradients collected for the input slots of one function.
#[derive(Default)]
struct InputBuffer {
    grads: SmallVec<[Variable; 2]>,
}

impl InputBuffer {
    fn add(&mut self, pos: usize, grad: Variable) -> Result<()> {
        if !grad.defined() {
            return Ok(());
        }
        if self.grads.len() <= pos {
            self.grads.resize(pos + 1, Variable::undefined());
        }
        capture(&mut self.grads[pos], grad)
    }

    fn has_grad(&self) -> bool {
        self.grads.iter().any(Variable::defined)
    }

    fn into_inputs(self) -> Vec<Variable> {
        self.grads.into_vec()
    }
}
