//! Integration tests for trace capture and backward-context linking.
//! Run with: cargo test -p tessera-autograd --test tracing

use std::collections::HashSet;
use std::sync::Arc;

use tessera_autograd::functions::{mul, Eval};
use tessera_autograd::{
    call, set_up_context_edge, traced_apply, tracer, AutogradError, Function, FunctionBase,
    FunctionFlags, FunctionKind, Result, Variable,
};
use tessera_core::Tensor;
use tessera_jit::{Graph, Node, NodeId, NodeKind, TraceType};

fn var(data: &[f32], requires_grad: bool) -> Variable {
    Variable::leaf(Tensor::from_f32(data, &[data.len()]), requires_grad)
}

fn values(v: &Variable) -> Vec<f32> {
    v.data().unwrap().as_f32_slice().unwrap().to_vec()
}

fn ops_named<'g>(graph: &'g Graph, name: &str) -> Vec<&'g Node> {
    graph
        .nodes()
        .filter(|n| matches!(n.kind(), NodeKind::Op { name: op, .. } if op == name))
        .collect()
}

fn select_at(graph: &Graph, node: NodeId, offset: usize) -> &Node {
    graph
        .selects_of(node)
        .into_iter()
        .map(|id| graph.node(id))
        .find(|n| n.selected() == Some((node, offset)))
        .unwrap()
}

/// Fails if a gradient function can reach itself through `next_functions`.
fn assert_acyclic(root: &Arc<dyn Function>) {
    fn visit(f: &Arc<dyn Function>, path: &mut HashSet<usize>, done: &mut HashSet<usize>) {
        if done.contains(&f.id()) {
            return;
        }
        assert!(path.insert(f.id()), "cycle through {}#{}", f.name(), f.id());
        for edge in f.next_functions().iter().flatten() {
            visit(&edge.function, path, done);
        }
        path.remove(&f.id());
        done.insert(f.id());
    }
    visit(root, &mut HashSet::new(), &mut HashSet::new());
}

// ============================================================================
// Custom functions
// ============================================================================

/// Three outputs, the middle one undefined.
#[derive(Default)]
struct Split {
    base: FunctionBase,
}

impl Function for Split {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Custom("Split")
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let data = inputs[0].data().unwrap().clone();
        Ok(vec![
            Variable::leaf(data.clone(), false),
            Variable::undefined(),
            Variable::leaf(data, false),
        ])
    }

    fn passes_state_transparently(&self) -> bool {
        true
    }
}

/// Needs a backward context but does not expose its saved values.
#[derive(Default)]
struct Opaque {
    base: FunctionBase,
}

impl Function for Opaque {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Custom("Opaque")
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        Ok(inputs.to_vec())
    }
}

/// One differentiable output and one plain leaf output.
#[derive(Default)]
struct SquareAndCount {
    base: FunctionBase,
}

impl Function for SquareAndCount {
    fn base(&self) -> &FunctionBase {
        &self.base
    }

    fn kind(&self) -> FunctionKind {
        FunctionKind::Custom("SquareAndCount")
    }

    fn apply(&self, inputs: &[Variable]) -> Result<Vec<Variable>> {
        let count = inputs[0].data().unwrap().numel() as f32;
        Ok(vec![
            mul(&inputs[0], &inputs[0])?,
            Variable::leaf(Tensor::scalar(count), false),
        ])
    }

    fn saved_variables(&self) -> Option<Vec<tessera_autograd::SavedVariable>> {
        Some(Vec::new())
    }
}

// ============================================================================
// Flags
// ============================================================================

#[test]
fn test_flags_grad_and_no_grad_leaves() {
    let a = var(&[1.0], true);
    let b = var(&[2.0], false);
    let flags = FunctionFlags::from_inputs(&[a.clone(), b.clone()]);
    assert!(flags.is_executable);
    assert!(!flags.is_volatile);

    let acc_a: Arc<dyn Function> = a.grad_accumulator().unwrap();
    let acc_b: Arc<dyn Function> = b.grad_accumulator().unwrap();
    let next: Vec<_> = flags.next_functions.iter().flatten().collect();
    assert_eq!((next[0].function.id(), next[0].input_nr), (acc_a.id(), 0));
    assert_eq!((next[1].function.id(), next[1].input_nr), (acc_b.id(), 0));
}

#[test]
fn test_flags_volatile_wins() {
    let x = var(&[1.0], true);
    let y = Variable::volatile(Tensor::scalar(1.0));
    let flags = FunctionFlags::from_refs(&[&x, &y]);
    assert!(!flags.is_executable);
    assert!(flags.is_volatile);
}

// ============================================================================
// Forward tracing
// ============================================================================

#[test]
fn test_forward_trace_records_op_and_select() {
    let a = var(&[1.0, 2.0], true);
    let b = var(&[3.0, 4.0], true);
    let state = tracer::enter(&[a.clone(), b.clone()]);
    let c = mul(&a, &b).unwrap();
    let graph = tracer::exit(&state, &[c]).unwrap();

    assert_eq!(graph.len(), 4);
    let op = ops_named(&graph, "Mul")[0];
    assert_eq!(op.inputs(), graph.params());
    assert!(!op.is_backward_nontraceable());

    let out = select_at(&graph, op.id(), 0);
    assert_eq!(out.ty().to_string(), "Float(2)");
    assert_eq!(graph.outputs(), &[out.id()]);
    // transparent step: no context handle
    assert_eq!(graph.selects_of(op.id()).len(), 1);
}

#[test]
fn test_traceable_function_applied_directly() {
    let a = var(&[1.0], true);
    let b = var(&[2.0], true);
    let add_bw = tessera_autograd::functions::add(&a, &b)
        .unwrap()
        .grad_fn()
        .unwrap();
    let g = var(&[1.0], false);
    let state = tracer::enter(&[g.clone()]);
    let before = state.graph_snapshot().len();

    let outputs = traced_apply(&add_bw, vec![g.clone()]).unwrap();
    assert!(outputs[0].same_as(&g));
    assert!(outputs[1].same_as(&g));
    assert_eq!(state.graph_snapshot().len(), before);
}

#[test]
fn test_one_select_per_output() {
    let x = var(&[5.0, 6.0], false);
    let state = tracer::enter(&[x.clone()]);
    let split: Arc<dyn Function> = Arc::new(Split::default());
    let outputs = call(&split, &[x]).unwrap();
    assert_eq!(outputs.len(), 3);

    let graph = state.graph_snapshot();
    let op = ops_named(&graph, "Split")[0];
    assert_eq!(graph.selects_of(op.id()).len(), 3);
    assert_eq!(select_at(&graph, op.id(), 1).ty(), &TraceType::Unknown);
    assert_eq!(select_at(&graph, op.id(), 2).ty().to_string(), "Float(2)");
}

#[test]
fn test_missing_saved_variables_is_fatal() {
    let x = var(&[1.0], true);
    let state = tracer::enter(&[x.clone()]);
    let opaque: Arc<dyn Function> = Arc::new(Opaque::default());

    let err = traced_apply(&opaque, vec![x]).unwrap_err();
    assert!(matches!(
        &err,
        AutogradError::SavedVariablesNotImplemented { name } if name == "Opaque"
    ));
    assert_eq!(
        err.to_string(),
        "saved_variables() needed but not implemented in Opaque"
    );
    // outputs are recorded before failing and the graph stays valid
    let graph = state.graph_snapshot();
    graph.lint().unwrap();
    let op = ops_named(&graph, "Opaque")[0];
    assert!(!op.is_backward_nontraceable());
    let selects = graph.selects_of(op.id());
    assert_eq!(selects.len(), 1);
    assert!(selects.iter().all(|&s| !graph.node(s).ty().is_handle()));
}

// ============================================================================
// Backward tracing
// ============================================================================

#[test]
fn test_traced_backward_links_eval() {
    let x = var(&[1.0, 2.0], true);
    let y = var(&[3.0, 4.0], true);
    let z = mul(&x, &y).unwrap();
    let mul_bw = z.grad_fn().unwrap();

    let gz = var(&[1.0, 1.0], true);
    let state = tracer::enter(&[gz.clone()]);
    let grads = call(&mul_bw, &[gz.clone()]).unwrap();
    let (gx, gy) = (grads[0].clone(), grads[1].clone());
    assert_eq!(values(&gx), vec![3.0, 4.0]);
    assert_eq!(values(&gy), vec![1.0, 2.0]);

    let graph = state.graph_snapshot();
    let node = ops_named(&graph, "MulBackward")[0];
    assert!(node.is_backward_nontraceable());
    assert_eq!(ops_named(&graph, "Mul").len(), 2);
    assert_eq!(graph.selects_of(node.id()).len(), 3);
    let ctx = select_at(&graph, node.id(), 2);
    assert!(ctx.ty().is_handle());

    let eval_fn = gx.grad_fn().unwrap();
    let eval = eval_fn.as_eval().unwrap();
    assert_eq!(gy.grad_fn().unwrap().id(), eval_fn.id());
    assert_eq!((gx.output_nr(), gy.output_nr()), (0, 1));
    assert_eq!(eval.forward_ctx_select(&state), Some(ctx.id()));
    for root in eval.roots().iter().flatten() {
        assert!(root.function.tracing_state().in_eval_subgraph());
    }
    assert!(!mul_bw.tracing_state().in_eval_subgraph());

    assert_acyclic(&eval_fn);
    tracer::exit(&state, &[gx.clone(), gy]).unwrap();

    gx.backward(None).unwrap();
    assert_eq!(gz.grad().unwrap().as_f32_slice().unwrap(), &[3.0, 4.0]);
    assert_eq!(y.grad().unwrap().as_f32_slice().unwrap(), &[1.0, 1.0]);
    assert!(x.grad().is_none());
}

#[test]
fn test_eval_consumes_context_handle() {
    let x = var(&[2.0], true);
    let y = var(&[5.0], true);
    let z = mul(&x, &y).unwrap();

    let gz = var(&[1.0], true);
    let gg = var(&[1.0], true);
    let state = tracer::enter(&[gz.clone(), gg.clone()]);
    let grads = call(&z.grad_fn().unwrap(), &[gz.clone()]).unwrap();
    let eval_fn = grads[0].grad_fn().unwrap();

    let second = call(&eval_fn, &[gg.clone(), Variable::undefined()]).unwrap();
    assert_eq!(second.len(), 3);
    assert_eq!(values(&second[0]), vec![5.0]);
    assert!(!second[1].defined());
    assert_eq!(values(&second[2]), vec![1.0]);

    let graph = tracer::exit(&state, &second[..1]).unwrap();
    let mul_bw = ops_named(&graph, "MulBackward")[0];
    let ctx = select_at(&graph, mul_bw.id(), 2).id();
    let eval_node = ops_named(&graph, "Eval")[0];
    assert_eq!(eval_node.inputs().last(), Some(&ctx));
    assert!(eval_node.is_backward_nontraceable());

    // the wrapped backward ran traced too, without a context of its own
    let nested = ops_named(&graph, "MulBackward");
    assert_eq!(nested.len(), 2);
    assert!(!nested[1].is_backward_nontraceable());
    assert_eq!(graph.selects_of(nested[1].id()).len(), 2);
    assert_eq!(graph.selects_of(eval_node.id()).len(), 4);
}

#[test]
fn test_context_edge_linked_with_leaf_output() {
    let x = var(&[2.0, 3.0], true);
    let gg = var(&[1.0, 1.0], true);
    let state = tracer::enter(&[x.clone(), gg.clone()]);
    let f: Arc<dyn Function> = Arc::new(SquareAndCount::default());
    let outputs = call(&f, &[x.clone()]).unwrap();
    assert!(outputs[1].is_leaf());

    let eval_fn = outputs[0].grad_fn().unwrap();
    let eval = eval_fn.as_eval().unwrap();
    let graph = state.graph_snapshot();
    let node = ops_named(&graph, "SquareAndCount")[0];
    let ctx = select_at(&graph, node.id(), 2);
    assert!(ctx.ty().is_handle());
    assert_eq!(eval.forward_ctx_select(&state), Some(ctx.id()));

    // re-tracing the Eval consumes that handle
    let grads = call(&eval_fn, &[gg, Variable::undefined()]).unwrap();
    assert_eq!(values(&grads[0]), vec![4.0, 6.0]);
    let graph = tracer::exit(&state, &grads[..1]).unwrap();
    let eval_node = ops_named(&graph, "Eval")[0];
    assert_eq!(eval_node.inputs().last(), Some(&ctx.id()));
}

#[test]
fn test_context_edge_linked_once() {
    let a = var(&[2.0], true);
    let b = var(&[3.0], true);
    let c = mul(&a, &b).unwrap();
    let eval = Eval::replace_subgraph(&[a.clone(), b.clone()], &[c.clone()]).unwrap();

    let state = tracer::enter(&[a.clone(), b.clone()]);
    let mut lock = state.lock();
    let node = lock.graph().create(NodeKind::Op {
        name: "Mul".to_string(),
        function_id: 0,
    });
    lock.graph().append(node);
    let len = lock.graph().len();

    let first = set_up_context_edge(&mut lock, node, 1, &[a.clone(), b.clone()], &[c.clone()]);
    assert_eq!(lock.graph().len(), len + 1);
    let second = set_up_context_edge(&mut lock, node, 1, &[a, b], &[c]);
    assert_eq!(first, second);
    assert_eq!(lock.graph().len(), len + 1);
    assert_eq!(eval.forward_ctx_of(&state, node), Some(first));
}

#[test]
fn test_context_edge_without_eval_is_unattached() {
    let a = var(&[2.0], true);
    let b = var(&[3.0], true);
    let c = mul(&a, &b).unwrap();

    let state = tracer::enter(&[a.clone(), b.clone()]);
    let mut lock = state.lock();
    let node = lock.graph().create(NodeKind::Op {
        name: "Mul".to_string(),
        function_id: 0,
    });
    lock.graph().append(node);
    let first = set_up_context_edge(&mut lock, node, 1, &[a.clone(), b.clone()], &[c.clone()]);
    let second = set_up_context_edge(&mut lock, node, 1, &[a, b], &[c]);
    // nothing to reuse, so each call appends a fresh handle
    assert_ne!(first, second);
    assert!(lock.graph().node(first).ty().is_handle());
}

#[test]
fn test_backward_graph_is_acyclic() {
    let a = var(&[1.0, 2.0], true);
    let b = var(&[3.0, 4.0], true);
    let c = mul(&a, &b).unwrap();
    let d = tessera_autograd::functions::add(&c, &a).unwrap();
    let e = mul(&d, &c).unwrap();
    assert_acyclic(&e.grad_fn().unwrap());
}
