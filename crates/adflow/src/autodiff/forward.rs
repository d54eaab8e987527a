//! Forward execution of a graph with retention for backward.

use std::sync::Arc;

use super::backprop::Backpropagator;
use crate::error::AdError;
use crate::exec::{CancelToken, Engine, ExecOptions, Execution, ROOT_SCOPE, RequestId, ScopeId};
use crate::graph::{Graph, Region, Variable};
use crate::ops::Op;
use crate::tensor::Tensor;

/// Result of a transformed call.
pub(crate) struct Forward {
    pub outputs: Vec<Arc<Tensor>>,
    pub backprop: Backpropagator,
    pub request: RequestId,
}

/// Run `graph` on `args`, optionally keeping what backward needs.
pub(crate) fn call(
    engine: &Engine,
    graph: &Arc<Graph>,
    args: &[Arc<Tensor>],
    retain_for_backward: bool,
    cancel: Option<CancelToken>,
) -> Result<(Execution, Vec<Arc<Tensor>>), AdError> {
    if args.len() != graph.params().len() {
        return Err(AdError::Arity {
            op: format!("call {}", graph.name()),
            expected: graph.params().len(),
            actual: args.len(),
        });
    }
    let mut bindings: Vec<(Variable, Arc<Tensor>)> = graph
        .params()
        .iter()
        .cloned()
        .zip(args.iter().cloned())
        .collect();
    for capture in graph.captures() {
        let value = capture.outer.value().ok_or_else(|| {
            AdError::InvalidOperation(format!(
                "captured {} of {} has no value; evaluate it before calling",
                capture.outer.id(),
                graph.name()
            ))
        })?;
        bindings.push((capture.inner.clone(), value.clone()));
    }

    let region = Region::from_ordered(graph.nodes().to_vec());
    let options = ExecOptions {
        requested: graph.outputs().to_vec(),
        retain_for_backward,
        cancel,
        bindings,
    };
    let exec = Execution::start(engine, &region, options)?;
    exec.join()?;
    let outputs = graph
        .outputs()
        .iter()
        .map(|o| exec.wait(o))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((exec, outputs))
}

/// `J(f)` applied to `args`: the outputs and the graph's backpropagator.
pub(crate) fn run(
    engine: &Engine,
    graph: &Arc<Graph>,
    args: &[Arc<Tensor>],
    cancel: Option<CancelToken>,
) -> Result<Forward, AdError> {
    let (exec, outputs) = call(engine, graph, args, true, cancel)?;
    let backprop = harvest(&exec, ROOT_SCOPE, graph)?;
    tracing::debug!(
        graph = graph.name(),
        request = %exec.request_id(),
        retained = backprop.retained_values(),
        "forward finished"
    );
    Ok(Forward {
        outputs,
        backprop,
        request: exec.request_id(),
    })
}

/// Build the backpropagator tree from the values the execution retained.
fn harvest(exec: &Execution, scope: ScopeId, graph: &Arc<Graph>) -> Result<Backpropagator, AdError> {
    let children = graph
        .nodes()
        .iter()
        .map(|node| match node.op() {
            Op::Call(callee) => {
                let child = exec.call_scope(scope, node.id()).ok_or_else(|| {
                    AdError::InternalConsistency(format!("{} was not lowered", node.id()))
                })?;
                harvest(exec, child, callee)
            }
            _ => {
                let saved_inputs = node
                    .inputs()
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        node.needs_input_for_backward(i)
                            .then(|| exec.retained(scope, v))
                            .transpose()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                let saved_outputs = node
                    .outputs()
                    .iter()
                    .enumerate()
                    .map(|(i, v)| {
                        node.needs_output_for_backward(i)
                            .then(|| exec.retained(scope, v))
                            .transpose()
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Backpropagator::primitive(
                    node.clone(),
                    saved_inputs,
                    saved_outputs,
                ))
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Backpropagator::graph(graph.clone(), children))
}
