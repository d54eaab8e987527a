//! Backpropagators and backward graph generation.
//!
//! ```text
//! Backpropagator
//! ├── Primitive  node + values it flagged for backward
//! └── Graph      one child per body node, in body order
//!                (a call node's child is the callee's Graph backpropagator)
//! ```
//!
//! Recording a graph backpropagator walks the body in reverse, feeding each
//! node's output sensitivities to its child and accumulating the results
//! into the scope's [`SensitivityMap`]. For a call site the callee returns
//! argument gradients and environment gradients; the latter are unpacked in
//! capture order onto the captured outer variables.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

use super::rules::GradContext;
use super::sensitivity::{GradCounters, SensitivityMap};
use crate::dispatch::PlanInput;
use crate::error::AdError;
use crate::graph::{Graph, Node, Tape, Variable};
use crate::ops::Op;
use crate::tensor::Tensor;

/// Gradients produced by a graph backpropagator.
#[derive(Debug, Clone, Default)]
pub(crate) struct Pullback {
    /// One per captured variable, in capture order.
    pub env: Vec<Option<Variable>>,
    /// One per parameter.
    pub inputs: Vec<Option<Variable>>,
}

struct PrimitiveBackprop {
    node: Arc<Node>,
    saved_inputs: Vec<Option<Arc<Tensor>>>,
    saved_outputs: Vec<Option<Arc<Tensor>>>,
}

struct GraphBackprop {
    graph: Arc<Graph>,
    children: Vec<Backpropagator>,
}

#[derive(Clone)]
enum Kind {
    Primitive(Arc<PrimitiveBackprop>),
    Graph(Arc<GraphBackprop>),
}

/// Reverse-mode closure of one executed node or graph.
///
/// Holds the forward values its rules need; they are released when the
/// last clone is dropped.
#[derive(Clone)]
pub struct Backpropagator(Kind);

impl Backpropagator {
    pub(crate) fn primitive(
        node: Arc<Node>,
        saved_inputs: Vec<Option<Arc<Tensor>>>,
        saved_outputs: Vec<Option<Arc<Tensor>>>,
    ) -> Self {
        Self(Kind::Primitive(Arc::new(PrimitiveBackprop {
            node,
            saved_inputs,
            saved_outputs,
        })))
    }

    pub(crate) fn graph(graph: Arc<Graph>, children: Vec<Backpropagator>) -> Self {
        Self(Kind::Graph(Arc::new(GraphBackprop { graph, children })))
    }

    /// Whether this backpropagator covers a whole graph.
    pub fn is_graph(&self) -> bool {
        matches!(self.0, Kind::Graph(_))
    }

    /// Number of forward values kept alive, including nested graphs.
    pub fn retained_values(&self) -> usize {
        match &self.0 {
            Kind::Primitive(p) => p
                .saved_inputs
                .iter()
                .chain(&p.saved_outputs)
                .filter(|t| t.is_some())
                .count(),
            Kind::Graph(g) => g.children.iter().map(Backpropagator::retained_values).sum(),
        }
    }

    /// Record the backward pass of a graph backpropagator onto `tape`.
    ///
    /// `out_sens` holds one optional sensitivity per graph output.
    pub(crate) fn record_graph(
        &self,
        tape: &mut Tape,
        counters: &GradCounters,
        out_sens: &[Option<Variable>],
    ) -> Result<Pullback, AdError> {
        match &self.0 {
            Kind::Graph(g) => g.record(tape, counters, out_sens),
            Kind::Primitive(p) => Err(AdError::InvalidOperation(format!(
                "backpropagator of {} is not a graph",
                p.node.id()
            ))),
        }
    }

    /// Gradients for each input of the node this backpropagator belongs to.
    fn record_node(
        &self,
        tape: &mut Tape,
        counters: &GradCounters,
        out_sens: &[Option<Variable>],
    ) -> Result<Vec<Option<Variable>>, AdError> {
        match &self.0 {
            Kind::Primitive(p) => p.record(tape, out_sens.first().and_then(Option::as_ref)),
            Kind::Graph(g) => {
                let pullback = g.record(tape, counters, out_sens)?;
                // Call inputs are the arguments followed by the captures.
                Ok(pullback.inputs.into_iter().chain(pullback.env).collect())
            }
        }
    }
}

impl fmt::Debug for Backpropagator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Kind::Primitive(p) => f
                .debug_struct("Primitive")
                .field("node", &p.node.id())
                .field("op", &p.node.op().name())
                .finish(),
            Kind::Graph(g) => f
                .debug_struct("Graph")
                .field("graph", &g.graph.name())
                .field("children", &g.children)
                .finish(),
        }
    }
}

impl GraphBackprop {
    fn record(
        &self,
        tape: &mut Tape,
        counters: &GradCounters,
        out_sens: &[Option<Variable>],
    ) -> Result<Pullback, AdError> {
        let graph = &self.graph;
        if out_sens.len() != graph.outputs().len() {
            return Err(AdError::Arity {
                op: format!("backprop {}", graph.name()),
                expected: graph.outputs().len(),
                actual: out_sens.len(),
            });
        }
        if self.children.len() != graph.nodes().len() {
            return Err(AdError::InternalConsistency(format!(
                "backpropagator of {} covers {} of {} nodes",
                graph.name(),
                self.children.len(),
                graph.nodes().len()
            )));
        }

        let sens = SensitivityMap::new(counters);
        for (out, s) in graph.outputs().iter().zip(out_sens) {
            if let Some(s) = s {
                sens.accumulate(tape, out, s.clone())?;
            }
        }

        for (node, child) in graph.nodes().iter().zip(&self.children).rev() {
            if !node.outputs().iter().any(Variable::requires_grad) {
                continue;
            }
            let grads: Vec<Option<Variable>> =
                node.outputs().iter().map(|o| sens.get(o)).collect();
            if grads.iter().all(Option::is_none) {
                continue;
            }
            let input_grads = child.record_node(tape, counters, &grads)?;
            for (input, grad) in node.inputs().iter().zip(input_grads) {
                if let Some(grad) = grad.filter(|_| input.requires_grad()) {
                    sens.accumulate(tape, input, grad)?;
                }
            }
        }

        tracing::trace!(graph = graph.name(), "backward recorded");
        Ok(Pullback {
            env: graph.captures().iter().map(|c| sens.take(&c.inner)).collect(),
            inputs: graph.params().iter().map(|p| sens.take(p)).collect(),
        })
    }
}

impl PrimitiveBackprop {
    fn record(
        &self,
        tape: &mut Tape,
        grad: Option<&Variable>,
    ) -> Result<Vec<Option<Variable>>, AdError> {
        let node = &self.node;
        let Some(grad) = grad else {
            return Ok(vec![None; node.inputs().len()]);
        };
        let wants: SmallVec<[bool; 2]> =
            node.inputs().iter().map(Variable::requires_grad).collect();
        let saved: Vec<Option<Variable>> = self
            .saved_inputs
            .iter()
            .zip(node.inputs())
            .map(|(t, v)| {
                t.as_ref()
                    .map(|t| Variable::from_shared(t.clone(), false, v.backend()))
            })
            .collect();
        let output = self
            .saved_outputs
            .first()
            .and_then(Option::as_ref)
            .zip(node.outputs().first())
            .map(|(t, v)| Variable::from_shared(t.clone(), false, v.backend()));

        if let Some(rule) = node.op().gradient_rule() {
            let ctx = GradContext {
                op: node.op(),
                operands: node.inputs(),
                saved: &saved,
                output: output.as_ref(),
                grad,
                wants: &wants,
            };
            return Ok(rule.backward(tape, &ctx)?.into_vec());
        }
        if node.op().is_composite() {
            return composite_backward(tape, node.op(), &saved, grad, &wants);
        }
        Err(AdError::InvalidOperation(format!(
            "{} has no gradient",
            node.op()
        )))
    }
}

/// Differentiate a composite op through its dispatch expansion: replay the
/// primitives on the saved operands, then apply their rules in reverse.
fn composite_backward(
    tape: &mut Tape,
    op: &Op,
    saved: &[Option<Variable>],
    grad: &Variable,
    wants: &[bool],
) -> Result<Vec<Option<Variable>>, AdError> {
    let steps = op
        .expand()
        .ok_or_else(|| AdError::InternalConsistency(format!("{} has no expansion", op)))?;
    let operands = saved
        .iter()
        .enumerate()
        .map(|(i, v)| {
            v.clone().ok_or_else(|| {
                AdError::InternalConsistency(format!("{} operand {} was not retained", op, i))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut values: Vec<Variable> = Vec::with_capacity(steps.len());
    let mut step_operands: Vec<Vec<Variable>> = Vec::with_capacity(steps.len());
    for step in &steps {
        let inputs = step
            .inputs
            .iter()
            .map(|input| match *input {
                PlanInput::Operand(i) => operands.get(i).cloned(),
                PlanInput::Step(j) => values.get(j).cloned(),
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| AdError::InternalConsistency(format!("dangling operand in {}", op)))?;
        values.push(tape.record(step.op.clone(), &inputs)?);
        step_operands.push(inputs);
    }

    let mut step_grads: Vec<Option<Variable>> = vec![None; steps.len()];
    if let Some(last) = step_grads.last_mut() {
        *last = Some(grad.clone());
    }
    let mut operand_grads: Vec<Option<Variable>> = vec![None; operands.len()];
    for k in (0..steps.len()).rev() {
        let Some(g) = step_grads[k].take() else {
            continue;
        };
        let step = &steps[k];
        let rule = step.op.gradient_rule().ok_or_else(|| {
            AdError::InternalConsistency(format!("{} expands to {} without a rule", op, step.op))
        })?;
        let inputs = &step_operands[k];
        let saved: Vec<Option<Variable>> = inputs.iter().cloned().map(Some).collect();
        let step_wants = vec![true; inputs.len()];
        let ctx = GradContext {
            op: &step.op,
            operands: inputs,
            saved: &saved,
            output: values.get(k),
            grad: &g,
            wants: &step_wants,
        };
        let grads = rule.backward(tape, &ctx)?;
        for (input, g) in step.inputs.iter().zip(grads) {
            let Some(g) = g else { continue };
            let slot = match *input {
                PlanInput::Operand(i) => &mut operand_grads[i],
                PlanInput::Step(j) => &mut step_grads[j],
            };
            *slot = Some(match slot.take() {
                Some(prev) => tape.add(&prev, &g)?,
                None => g,
            });
        }
    }

    Ok(operand_grads
        .into_iter()
        .zip(wants)
        .map(|(g, &w)| g.filter(|_| w))
        .collect())
}
