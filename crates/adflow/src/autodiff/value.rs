//! Caller-facing values and the `J` / `Jinv` transforms.
//!
//! ```text
//! J(f)(args)          = (f(args), bprop)
//! bprop(sens)         = (env_grads, grad_1, ..., grad_n)
//! J(J(f))(args)       = ((f(args), bprop), bprop')
//! bprop'((sens, 0))   = bprop(sens)
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::backprop::Backpropagator;
use super::forward;
use super::sensitivity::GradCounters;
use crate::error::AdError;
use crate::graph::{Graph, VarId, Variable};
use crate::runtime::Runtime;
use crate::tensor::Tensor;

/// A first-class value.
#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Arc<Tensor>),
    Tuple(Vec<Value>),
    Function(Function),
    Backprop(BackpropFn),
    /// Symbolic zero: a sensitivity or gradient with no contribution.
    Zero,
}

impl Value {
    pub fn tensor(tensor: Tensor) -> Self {
        Value::Tensor(Arc::new(tensor))
    }

    pub fn function(graph: Arc<Graph>) -> Self {
        Value::Function(Function::Graph(graph))
    }

    pub fn as_tensor(&self) -> Option<&Arc<Tensor>> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[Value]> {
        match self {
            Value::Tuple(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_backprop(&self) -> Option<&BackpropFn> {
        match self {
            Value::Backprop(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Value::Zero)
    }

    /// Apply a function or backpropagator.
    ///
    /// # Errors
    ///
    /// - `AdError::InvalidOperation` if the value is not callable or an
    ///   argument has the wrong kind.
    /// - `AdError::Arity` for a wrong argument count.
    /// - Any error of the forward or backward execution.
    pub fn call(&self, runtime: &Runtime, args: &[Value]) -> Result<Value, AdError> {
        match self {
            Value::Function(f) => f.call(runtime, args),
            Value::Backprop(b) => match args {
                [sens] => b.apply(runtime, sens),
                _ => Err(AdError::Arity {
                    op: "backprop".into(),
                    expected: 1,
                    actual: args.len(),
                }),
            },
            _ => Err(AdError::InvalidOperation("value is not callable".into())),
        }
    }
}

/// A graph, possibly under one or more applications of `J`.
#[derive(Debug, Clone)]
pub enum Function {
    Graph(Arc<Graph>),
    Transformed(Box<Function>),
}

impl Function {
    /// The untransformed graph.
    pub fn graph(&self) -> &Arc<Graph> {
        match self {
            Function::Graph(g) => g,
            Function::Transformed(inner) => inner.graph(),
        }
    }

    /// How many times `J` was applied.
    pub fn order(&self) -> usize {
        match self {
            Function::Graph(_) => 0,
            Function::Transformed(inner) => inner.order() + 1,
        }
    }

    fn call(&self, runtime: &Runtime, args: &[Value]) -> Result<Value, AdError> {
        match self {
            Function::Graph(graph) => {
                let args = tensor_args(graph, args)?;
                let (_, outputs) = forward::call(runtime.engine(), graph, &args, false, None)?;
                Ok(pack(outputs))
            }
            Function::Transformed(inner) => match &**inner {
                Function::Graph(graph) => {
                    let args = tensor_args(graph, args)?;
                    let fwd = forward::run(runtime.engine(), graph, &args, None)?;
                    let bprop = BackpropFn::root(graph.clone(), fwd.backprop);
                    Ok(Value::Tuple(vec![pack(fwd.outputs), Value::Backprop(bprop)]))
                }
                Function::Transformed(_) => {
                    let result = inner.call(runtime, args)?;
                    let bprop = result
                        .as_tuple()
                        .and_then(|parts| parts.get(1))
                        .and_then(Value::as_backprop)
                        .ok_or_else(|| {
                            AdError::InternalConsistency(
                                "transformed call did not return a backpropagator".into(),
                            )
                        })?
                        .lifted();
                    Ok(Value::Tuple(vec![result, Value::Backprop(bprop)]))
                }
            },
        }
    }
}

fn tensor_args(graph: &Graph, args: &[Value]) -> Result<Vec<Arc<Tensor>>, AdError> {
    if args.len() != graph.params().len() {
        return Err(AdError::Arity {
            op: format!("call {}", graph.name()),
            expected: graph.params().len(),
            actual: args.len(),
        });
    }
    args.iter()
        .zip(graph.params())
        .enumerate()
        .map(|(i, (arg, param))| {
            let t = arg.as_tensor().ok_or_else(|| {
                AdError::InvalidOperation(format!(
                    "argument {} of {} must be a tensor",
                    i,
                    graph.name()
                ))
            })?;
            if t.shape() != param.shape() || t.dtype() != param.dtype() {
                return Err(AdError::shape(
                    format!("call {}", graph.name()),
                    format!(
                        "argument {} is {:?} {}, parameter expects {:?} {}",
                        i,
                        t.shape(),
                        t.dtype(),
                        param.shape(),
                        param.dtype()
                    ),
                ));
            }
            Ok(t.clone())
        })
        .collect()
}

fn pack(mut outputs: Vec<Arc<Tensor>>) -> Value {
    if outputs.len() == 1 {
        if let Some(t) = outputs.pop() {
            return Value::Tensor(t);
        }
    }
    Value::Tuple(outputs.into_iter().map(Value::Tensor).collect())
}

enum BackpropKind {
    Root {
        graph: Arc<Graph>,
        backprop: Backpropagator,
    },
    /// Backpropagator of `J(J(f))`. Only first-order composition is
    /// supported: it takes `(sens, 0)` and behaves as the inner
    /// backpropagator; the transformed graph itself is not differentiated.
    Lifted(BackpropFn),
}

/// Callable backpropagator returned by a transformed call.
#[derive(Clone)]
pub struct BackpropFn(Arc<BackpropKind>);

impl BackpropFn {
    fn root(graph: Arc<Graph>, backprop: Backpropagator) -> Self {
        Self(Arc::new(BackpropKind::Root { graph, backprop }))
    }

    fn lifted(&self) -> Self {
        Self(Arc::new(BackpropKind::Lifted(self.clone())))
    }

    /// Backpropagator tree of the underlying call.
    pub fn backpropagator(&self) -> &Backpropagator {
        match self.0.as_ref() {
            BackpropKind::Root { backprop, .. } => backprop,
            BackpropKind::Lifted(inner) => inner.backpropagator(),
        }
    }

    /// Propagate `sens` back through the call.
    ///
    /// Returns `n + 1` values for `n` arguments: first a tuple with one
    /// gradient per captured variable, then one gradient per argument.
    /// Inputs that received no contribution get [`Value::Zero`].
    pub fn apply(&self, runtime: &Runtime, sens: &Value) -> Result<Value, AdError> {
        match self.0.as_ref() {
            BackpropKind::Lifted(inner) => match sens.as_tuple() {
                Some([s, Value::Zero]) => inner.apply(runtime, s),
                _ => Err(AdError::InvalidOperation(
                    "only first-order differentiation is supported: the backpropagator \
                     of J(J(f)) takes (sensitivity, 0) and cannot propagate a \
                     sensitivity for the inner backpropagator"
                        .into(),
                )),
            },
            BackpropKind::Root { graph, backprop } => {
                let seeds = seed_tensors(graph, sens)?;
                let mut tape = runtime.tape();
                let seeds: Vec<Option<Variable>> = graph
                    .outputs()
                    .iter()
                    .zip(seeds)
                    .map(|(out, s)| s.map(|t| Variable::from_shared(t, false, out.backend())))
                    .collect();
                let counters = GradCounters::default();
                let pullback = backprop.record_graph(&mut tape, &counters, &seeds)?;

                let wanted: Vec<Variable> = pullback
                    .env
                    .iter()
                    .chain(&pullback.inputs)
                    .flatten()
                    .cloned()
                    .collect();
                let values = runtime.evaluate(&mut tape, &wanted)?;
                let by_id: HashMap<VarId, Arc<Tensor>> =
                    wanted.iter().map(Variable::id).zip(values).collect();
                let lookup = |g: &Option<Variable>| {
                    g.as_ref()
                        .and_then(|v| by_id.get(&v.id()))
                        .map_or(Value::Zero, |t| Value::Tensor(t.clone()))
                };

                let mut result = Vec::with_capacity(pullback.inputs.len() + 1);
                result.push(Value::Tuple(pullback.env.iter().map(lookup).collect()));
                result.extend(pullback.inputs.iter().map(lookup));
                Ok(Value::Tuple(result))
            }
        }
    }
}

fn seed_tensors(graph: &Graph, sens: &Value) -> Result<Vec<Option<Arc<Tensor>>>, AdError> {
    let outputs = graph.outputs();
    let items: Vec<&Value> = match (outputs.len(), sens) {
        (1, _) => vec![sens],
        (n, Value::Zero) => vec![sens; n],
        (n, Value::Tuple(items)) if items.len() == n => items.iter().collect(),
        (n, _) => {
            return Err(AdError::Arity {
                op: format!("backprop {}", graph.name()),
                expected: n,
                actual: sens.as_tuple().map_or(1, <[Value]>::len),
            });
        }
    };
    items
        .into_iter()
        .zip(outputs)
        .map(|(item, out)| match item {
            Value::Zero => Ok(None),
            Value::Tensor(t) if t.shape() == out.shape() && t.dtype() == out.dtype() => {
                Ok(Some(t.clone()))
            }
            Value::Tensor(t) => Err(AdError::shape(
                format!("backprop {}", graph.name()),
                format!(
                    "sensitivity is {:?} {}, output is {:?} {}",
                    t.shape(),
                    t.dtype(),
                    out.shape(),
                    out.dtype()
                ),
            )),
            _ => Err(AdError::InvalidOperation(
                "sensitivities must be tensors or zero".into(),
            )),
        })
        .collect()
}

impl fmt::Debug for BackpropFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_ref() {
            BackpropKind::Root { graph, backprop } => f
                .debug_struct("BackpropFn")
                .field("graph", &graph.name())
                .field("backprop", backprop)
                .finish(),
            BackpropKind::Lifted(inner) => f.debug_tuple("Lifted").field(inner).finish(),
        }
    }
}

/// `J`: the identity on data, the transformed form on functions.
///
/// `J` may be applied more than once, but derivatives are first order only:
/// the backpropagator of `J(J(f))` accepts `(sens, 0)` and rejects a
/// sensitivity for the inner backpropagator.
pub fn j(value: &Value) -> Value {
    match value {
        Value::Function(f) => Value::Function(Function::Transformed(Box::new(f.clone()))),
        Value::Tuple(items) => Value::Tuple(items.iter().map(j).collect()),
        other => other.clone(),
    }
}

/// `Jinv`: undo one application of [`j`].
///
/// # Errors
///
/// Returns `AdError::InvalidOperation` for a function that was never
/// transformed.
pub fn jinv(value: &Value) -> Result<Value, AdError> {
    match value {
        Value::Function(Function::Transformed(inner)) => Ok(Value::Function((**inner).clone())),
        Value::Function(Function::Graph(g)) => Err(AdError::InvalidOperation(format!(
            "{} is not a transformed function",
            g.name()
        ))),
        Value::Tuple(items) => items.iter().map(jinv).collect::<Result<_, _>>().map(Value::Tuple),
        other => Ok(other.clone()),
    }
}
