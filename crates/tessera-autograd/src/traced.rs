//! Recording function applications into the trace graph.

use std::sync::Arc;

use tessera_jit::{NodeId, NodeKind, TraceType};
use tracing::{debug, trace, warn};

use crate::error::{AutogradError, Result};
use crate::function::Function;
use crate::functions::Eval;
use crate::tracer::{self, StateLock};
use crate::variable::Variable;

/// Apply `function` and record the step into the trace its inputs belong to.
///
/// Traceable functions are applied directly: they are made of traced
/// primitives already. Otherwise one `Op` node is appended with an input edge
/// per input, the function runs with the trace lock released, and one
/// `Select` node is appended per output. Functions that do not pass state
/// transparently then get their backward wrapped into an [`Eval`] and a
/// context handle appended after the real outputs.
///
/// # Errors
/// [`AutogradError::SavedVariablesNotImplemented`] when the backward has to
/// be wrapped and the function does not expose its saved variables. The
/// graph keeps the nodes recorded up to that point.
pub fn traced_apply(function: &Arc<dyn Function>, inputs: Vec<Variable>) -> Result<Vec<Variable>> {
    if function.is_traceable() {
        trace!(function = function.name(), "traceable, applying directly");
        return function.apply(&inputs);
    }

    let state = tracer::get_tracing_state(&inputs)?;
    let mut lock = state.lock();

    let this_node = lock.graph().create(NodeKind::Op {
        name: function.name().to_string(),
        function_id: function.id(),
    });
    for input in &inputs {
        let value = tracer::get_value_trace(&mut lock, input);
        lock.graph().add_input(this_node, value);
    }
    lock.graph().append(this_node);
    trace!(function = function.name(), node = %this_node, "recorded inputs");

    // the function may trace nested steps into the same state
    lock.release();
    let outputs = function.apply(&inputs)?;
    lock.reacquire();

    let num_outputs = outputs.len();
    for (i, output) in outputs.iter().enumerate() {
        let sel = lock.graph().create_select(this_node, i);
        lock.graph().append(sel);
        if let Some(data) = output.data() {
            lock.graph().infer_type_from(sel, data);
            tracer::set_value_trace(&state, output, sel);
        }
    }

    if !function.passes_state_transparently() {
        let this_eval = function.as_eval();
        if let Some(eval) = this_eval {
            match eval.forward_ctx_select(&state) {
                Some(ctx) => lock.graph().add_input(this_node, ctx),
                None => warn!(node = %this_node, "Eval traced without a forward context"),
            }
        }
        // nodes already wrapped by an Eval don't need their own
        let in_eval_subgraph = function.tracing_state().in_eval_subgraph();
        if !in_eval_subgraph {
            let saved = function.saved_variables().ok_or_else(|| {
                AutogradError::SavedVariablesNotImplemented {
                    name: function.name().to_string(),
                }
            })?;
            let mut bw_subgraph_inputs = inputs.clone();
            for saved_var in &saved {
                bw_subgraph_inputs.push(saved_var.unpack(Some(function))?);
            }
            tracer::nontraceable_backward_subgraph(
                &mut lock,
                this_node,
                &bw_subgraph_inputs,
                &outputs,
            );
        }
        if !in_eval_subgraph || this_eval.is_some() {
            set_up_context_edge(&mut lock, this_node, num_outputs, &inputs, &outputs);
        }
    }
    debug!(function = function.name(), node = %this_node, outputs = num_outputs, "traced");
    Ok(outputs)
}

/// Append the context handle of `node` at output position `ctx_output_nr` and
/// hand it to the [`Eval`] replaying this step's backward, if there is one.
///
/// Linking is idempotent: when the Eval already holds a handle of `node`, that
/// handle is returned and nothing is appended.
pub fn set_up_context_edge(
    lock: &mut StateLock<'_>,
    node: NodeId,
    ctx_output_nr: usize,
    inputs: &[Variable],
    outputs: &[Variable],
) -> NodeId {
    let state = lock.state();
    let backward_eval = Eval::get_backward_eval(inputs, outputs);
    let eval = backward_eval.as_ref().and_then(|f| f.as_eval());

    if let Some(existing) = eval.and_then(|e| e.forward_ctx_of(state, node)) {
        return existing;
    }

    let graph = lock.graph();
    let ctx_select = graph.create_select(node, ctx_output_nr);
    graph.append(ctx_select);
    graph.set_type(ctx_select, TraceType::Handle);

    match eval {
        Some(eval) => eval.set_forward_ctx(state, node, ctx_select),
        // the backward will be built lazily; leave the handle unattached
        None => trace!(node = %node, "no backward Eval, context edge unattached"),
    }
    ctx_select
}
