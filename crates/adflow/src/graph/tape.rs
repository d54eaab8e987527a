//! Lazy recording tape.
//!
//! ```text
//! record(op, inputs)
//!     → infer shape / dtype      (ShapeError, ArityError)
//!     → Dispatch::select         (UnsupportedOperationError)
//!     → append Node, return fresh output Variables
//! close() / close_region(from, to)
//!     → Region handed to the scheduler
//! ```
//!
//! Nothing executes while recording. Errors are reported synchronously to
//! the caller that recorded the offending op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use smallvec::SmallVec;

use super::function::{Capture, Graph, GraphKind};
use super::node::{Node, NodeId};
use super::variable::{Origin, VarId, VarType, Variable};
use crate::dispatch::{BackendId, Dispatch};
use crate::dtype::DType;
use crate::error::AdError;
use crate::ops::{Op, SaveFlags};
use crate::shape::{self, Meta};
use crate::tensor::Tensor;

/// A closed, topologically ordered list of nodes ready for execution.
#[derive(Debug, Clone, Default)]
pub struct Region {
    nodes: Vec<Arc<Node>>,
}

impl Region {
    /// Accept an externally produced node list (e.g. the output of a
    /// rewriting pass) in any order.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InternalConsistency` if the nodes form a cycle.
    pub fn from_nodes(nodes: Vec<Arc<Node>>) -> Result<Region, AdError> {
        let mut seen = HashSet::new();
        let nodes: Vec<Arc<Node>> = nodes.into_iter().filter(|n| seen.insert(n.id())).collect();

        let mut graph: DiGraph<usize, ()> = DiGraph::new();
        let indices: Vec<NodeIndex> = (0..nodes.len()).map(|i| graph.add_node(i)).collect();
        let mut producer: HashMap<VarId, NodeIndex> = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            for out in node.outputs() {
                producer.insert(out.id(), indices[i]);
            }
        }
        for (i, node) in nodes.iter().enumerate() {
            for input in node.inputs() {
                if let Some(&from) = producer.get(&input.id()) {
                    graph.add_edge(from, indices[i], ());
                }
            }
        }

        let order = toposort(&graph, None).map_err(|cycle| {
            let node = &nodes[graph[cycle.node_id()]];
            tracing::error!(node = %node.id(), "cycle in rewritten region");
            AdError::InternalConsistency(format!("region has a cycle through {}", node.id()))
        })?;
        Ok(Region {
            nodes: order.into_iter().map(|ix| nodes[graph[ix]].clone()).collect(),
        })
    }

    pub(crate) fn from_ordered(nodes: Vec<Arc<Node>>) -> Region {
        Region { nodes }
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Append-only record of operations.
///
/// Recording is single-writer (`&mut self`); the tape may be moved between
/// threads but not recorded into concurrently.
#[derive(Debug)]
pub struct Tape {
    dispatch: Arc<Dispatch>,
    default_backend: BackendId,
    nodes: Vec<Arc<Node>>,
    position: HashMap<VarId, usize>,
    boundary: usize,
    /// Parameter and capture placeholders of the graph being built.
    placeholders: HashSet<VarId>,
    /// Body tapes only: explicit capture count and the outer variables
    /// captured on first read.
    body: Option<BodyCaptures>,
    scope: String,
}

#[derive(Debug, Default)]
struct BodyCaptures {
    explicit: usize,
    implicit: Vec<Capture>,
}

impl Tape {
    pub fn new(dispatch: Arc<Dispatch>) -> Self {
        Self::scoped(dispatch.clone(), dispatch.default_backend(), "tape")
    }

    fn scoped(dispatch: Arc<Dispatch>, default_backend: BackendId, scope: &str) -> Self {
        Self {
            dispatch,
            default_backend,
            nodes: Vec::new(),
            position: HashMap::new(),
            boundary: 0,
            placeholders: HashSet::new(),
            body: None,
            scope: scope.to_string(),
        }
    }

    pub fn dispatch(&self) -> &Arc<Dispatch> {
        &self.dispatch
    }

    /// Backend for new leaves and fills.
    pub fn default_backend(&self) -> BackendId {
        self.default_backend
    }

    pub fn set_default_backend(&mut self, backend: BackendId) -> Result<(), AdError> {
        self.dispatch.backend(backend)?;
        self.default_backend = backend;
        Ok(())
    }

    /// Number of recorded nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Recorded nodes in order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Index of the first node not yet closed into a region.
    pub fn boundary(&self) -> usize {
        self.boundary
    }

    /// Node producing `var` on this tape.
    pub fn producer_of(&self, var: &Variable) -> Option<&Arc<Node>> {
        self.position.get(&var.id()).map(|&i| &self.nodes[i])
    }

    /// Find a node by id.
    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.id() == id)
    }

    /// Create a leaf on the default backend.
    pub fn leaf(&self, tensor: Tensor, requires_grad: bool) -> Variable {
        Variable::leaf(tensor, requires_grad, self.default_backend)
    }

    /// Create a leaf that does not require a gradient.
    pub fn constant(&self, tensor: Tensor) -> Variable {
        self.leaf(tensor, false)
    }

    /// Close `[from, to)` into a region. Regions are closed in tape order:
    /// `from` must be the current boundary.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InvalidOperation` if the range is out of bounds or
    /// does not start at the boundary.
    pub fn close_region(&mut self, from: usize, to: usize) -> Result<Region, AdError> {
        if from > to || to > self.nodes.len() {
            return Err(AdError::InvalidOperation(format!(
                "region [{}, {}) is out of bounds for a tape of {} nodes",
                from,
                to,
                self.nodes.len()
            )));
        }
        if from != self.boundary {
            return Err(AdError::InvalidOperation(format!(
                "region [{}, {}) does not start at the boundary {}",
                from, to, self.boundary
            )));
        }
        self.boundary = to;
        Ok(Region::from_ordered(self.nodes[from..to].to_vec()))
    }

    /// Close everything recorded since the last boundary.
    pub fn close(&mut self) -> Region {
        let from = self.boundary.min(self.nodes.len());
        let to = self.nodes.len();
        self.boundary = to;
        Region::from_ordered(self.nodes[from..to].to_vec())
    }

    /// Nodes on this tape that `outputs` transitively depend on, in tape
    /// order. The walk does not continue past variables for which `stop`
    /// returns true.
    pub fn ancestors(
        &self,
        outputs: &[Variable],
        stop: impl Fn(&Variable) -> bool,
    ) -> Vec<Arc<Node>> {
        let mut marked = vec![false; self.nodes.len()];
        let mut stack: Vec<&Variable> = outputs.iter().collect();
        while let Some(var) = stack.pop() {
            if stop(var) {
                continue;
            }
            let Some(&pos) = self.position.get(&var.id()) else {
                continue;
            };
            if marked[pos] {
                continue;
            }
            marked[pos] = true;
            stack.extend(self.nodes[pos].inputs().iter());
        }
        self.nodes
            .iter()
            .zip(marked)
            .filter_map(|(n, m)| m.then(|| n.clone()))
            .collect()
    }

    fn check_readable(&self, var: &Variable) -> Result<(), AdError> {
        if self.position.contains_key(&var.id())
            || self.placeholders.contains(&var.id())
            || var.has_value()
        {
            return Ok(());
        }
        let hint = match var.origin() {
            Origin::Param { .. } | Origin::Capture { .. } => "it belongs to another graph",
            _ => "capture it or evaluate it first",
        };
        Err(AdError::InvalidOperation(format!(
            "{} is not visible in {}: {}",
            var.id(),
            self.scope,
            hint
        )))
    }

    /// `var` as read by a node on this tape. In a graph body, an outer
    /// variable that requires a gradient is captured on first read so that
    /// its gradient reaches the enclosing graph; constants are read as is.
    fn bind(&mut self, var: &Variable) -> Variable {
        let local = self.position.contains_key(&var.id()) || self.placeholders.contains(&var.id());
        let Some(body) = self.body.as_mut().filter(|_| !local && var.requires_grad()) else {
            return var.clone();
        };
        if let Some(capture) = body.implicit.iter().find(|c| c.outer.id() == var.id()) {
            return capture.inner.clone();
        }
        let slot = body.explicit + body.implicit.len();
        let inner = Variable::placeholder(&var.var_type(), var.backend(), Origin::Capture { slot });
        tracing::trace!(outer = %var.id(), slot, scope = %self.scope, "implicit capture");
        body.implicit.push(Capture {
            outer: var.clone(),
            inner: inner.clone(),
        });
        self.placeholders.insert(inner.id());
        inner
    }

    fn operand_backend(&self, op: &Op, inputs: &[Variable]) -> Result<BackendId, AdError> {
        match op {
            Op::Transfer(dst) => {
                self.dispatch.backend(*dst)?;
                Ok(*dst)
            }
            Op::Fill { .. } => Ok(self.default_backend),
            _ => {
                let first = inputs.first().map_or(self.default_backend, Variable::backend);
                if inputs.iter().any(|v| v.backend() != first) {
                    let names: Vec<&str> = inputs
                        .iter()
                        .filter_map(|v| self.dispatch.backend(v.backend()).ok())
                        .map(|b| b.name())
                        .collect();
                    return Err(AdError::UnsupportedOperation {
                        op: op.name().into(),
                        dtypes: inputs.iter().map(Variable::dtype).collect(),
                        backend: names.join("+"),
                    });
                }
                Ok(first)
            }
        }
    }

    fn push(&mut self, node: Node) -> Arc<Node> {
        let node = Arc::new(node);
        let pos = self.nodes.len();
        for out in node.outputs() {
            self.position.insert(out.id(), pos);
        }
        tracing::trace!(node = %node.id(), op = %node.op(), scope = %self.scope, "recorded");
        self.nodes.push(node.clone());
        node
    }

    /// Record `op` applied to `inputs` without executing it.
    ///
    /// # Errors
    ///
    /// - `AdError::Arity` / `AdError::Shape` for malformed operands.
    /// - `AdError::UnsupportedOperation` if no backend plan exists.
    /// - `AdError::InvalidOperation` for calls (use [`Tape::call`]) and for
    ///   operands not visible on this tape.
    pub fn record(&mut self, op: Op, inputs: &[Variable]) -> Result<Variable, AdError> {
        if matches!(op, Op::Call(_)) {
            return Err(AdError::InvalidOperation(
                "graph calls are recorded with Tape::call".into(),
            ));
        }
        for var in inputs {
            self.check_readable(var)?;
        }
        let metas: Vec<Meta<'_>> = inputs.iter().map(|v| (v.shape(), v.dtype())).collect();
        let (shape, dtype) = shape::infer(&op, &metas)?;
        let backend = self.operand_backend(&op, inputs)?;
        let dtypes: Vec<DType> = inputs.iter().map(Variable::dtype).collect();
        self.dispatch.select(&op, &dtypes, backend)?;
        let inputs: SmallVec<[Variable; 2]> = inputs.iter().map(|v| self.bind(v)).collect();

        let requires: SmallVec<[bool; 2]> = inputs.iter().map(Variable::requires_grad).collect();
        let requires_grad = op.gradient_rule().is_some() || op.is_composite();
        let requires_grad = requires_grad && requires.iter().any(|&r| r);
        let flags = op.saves(&requires);

        let id = NodeId::fresh();
        let output = Variable::output(shape, dtype, requires_grad, backend, id, 0);
        self.push(Node::new(
            id,
            op,
            inputs,
            SmallVec::from_elem(output.clone(), 1),
            flags,
            backend,
        ));
        Ok(output)
    }

    /// Record a call to `graph`. The node reads `args` followed by the
    /// graph's captured outer variables in capture order.
    pub fn call(&mut self, graph: &Arc<Graph>, args: &[Variable]) -> Result<Vec<Variable>, AdError> {
        let params = graph.params();
        if args.len() != params.len() {
            return Err(AdError::Arity {
                op: format!("call {}", graph.name()),
                expected: params.len(),
                actual: args.len(),
            });
        }
        for (i, (arg, param)) in args.iter().zip(params).enumerate() {
            if arg.shape() != param.shape() || arg.dtype() != param.dtype() {
                return Err(AdError::shape(
                    format!("call {}", graph.name()),
                    format!(
                        "argument {} is {:?} {}, parameter expects {:?} {}",
                        i,
                        arg.shape(),
                        arg.dtype(),
                        param.shape(),
                        param.dtype()
                    ),
                ));
            }
        }
        let inputs: SmallVec<[Variable; 2]> = args
            .iter()
            .cloned()
            .chain(graph.captures().iter().map(|c| c.outer.clone()))
            .collect();
        for var in &inputs {
            self.check_readable(var)?;
        }
        let inputs: SmallVec<[Variable; 2]> = inputs.iter().map(|v| self.bind(v)).collect();

        let requires_grad = inputs.iter().any(Variable::requires_grad);
        let id = NodeId::fresh();
        let outputs: SmallVec<[Variable; 1]> = graph
            .outputs()
            .iter()
            .enumerate()
            .map(|(j, o)| {
                Variable::output(o.shape().to_vec(), o.dtype(), requires_grad, o.backend(), id, j)
            })
            .collect();
        let flags = SaveFlags::none(inputs.len(), outputs.len());
        let backend = outputs.first().map_or(self.default_backend, Variable::backend);
        self.push(Node::new(
            id,
            Op::Call(graph.clone()),
            inputs,
            outputs.clone(),
            flags,
            backend,
        ));
        Ok(outputs.into_vec())
    }

    /// Build a function graph. `builder` records the body against a fresh
    /// tape and returns the outputs.
    ///
    /// Outer variables that require a gradient and are read by the body
    /// become captures, which makes the graph a closure. Constants stay
    /// inline.
    pub fn function(
        &self,
        name: &str,
        params: &[VarType],
        builder: impl FnOnce(&mut Tape, &[Variable]) -> Result<Vec<Variable>, AdError>,
    ) -> Result<Arc<Graph>, AdError> {
        let (mut body, params) = self.body_tape(name, params);
        let outputs = builder(&mut body, &params)?;
        body.finish(name, params, GraphKind::Function, outputs)
    }

    /// Build a closure over `captures`. `builder` receives the parameter
    /// placeholders and the capture placeholders, in the order given.
    /// Variables the body captures implicitly take the slots after them.
    pub fn closure(
        &self,
        name: &str,
        params: &[VarType],
        captures: &[Variable],
        builder: impl FnOnce(&mut Tape, &[Variable], &[Variable]) -> Result<Vec<Variable>, AdError>,
    ) -> Result<Arc<Graph>, AdError> {
        for outer in captures {
            self.check_readable(outer)?;
        }
        let (mut body, params) = self.body_tape(name, params);
        let captures: Vec<Capture> = captures
            .iter()
            .enumerate()
            .map(|(slot, outer)| Capture {
                outer: outer.clone(),
                inner: Variable::placeholder(
                    &outer.var_type(),
                    outer.backend(),
                    Origin::Capture { slot },
                ),
            })
            .collect();
        body.placeholders.extend(captures.iter().map(|c| c.inner.id()));
        if let Some(body_captures) = body.body.as_mut() {
            body_captures.explicit = captures.len();
        }
        let inner: Vec<Variable> = captures.iter().map(|c| c.inner.clone()).collect();
        let outputs = builder(&mut body, &params, &inner)?;
        body.finish(name, params, GraphKind::Closure { captures }, outputs)
    }

    fn body_tape(&self, name: &str, params: &[VarType]) -> (Tape, Vec<Variable>) {
        let mut body = Tape::scoped(self.dispatch.clone(), self.default_backend, name);
        let params: Vec<Variable> = params
            .iter()
            .enumerate()
            .map(|(index, ty)| {
                Variable::placeholder(ty, self.default_backend, Origin::Param { index })
            })
            .collect();
        body.placeholders.extend(params.iter().map(Variable::id));
        body.body = Some(BodyCaptures::default());
        (body, params)
    }

    fn finish(
        mut self,
        name: &str,
        params: Vec<Variable>,
        kind: GraphKind,
        outputs: Vec<Variable>,
    ) -> Result<Arc<Graph>, AdError> {
        if outputs.is_empty() {
            return Err(AdError::InvalidOperation(format!(
                "graph {} has no outputs",
                name
            )));
        }
        for out in &outputs {
            self.check_readable(out)?;
        }
        let outputs: Vec<Variable> = outputs.iter().map(|o| self.bind(o)).collect();
        let implicit = self.body.take().map(|b| b.implicit).unwrap_or_default();
        let kind = match kind {
            GraphKind::Function if implicit.is_empty() => GraphKind::Function,
            GraphKind::Function => GraphKind::Closure { captures: implicit },
            GraphKind::Closure { mut captures } => {
                captures.extend(implicit);
                GraphKind::Closure { captures }
            }
        };
        tracing::debug!(
            graph = name,
            nodes = self.nodes.len(),
            captures = kind_captures(&kind),
            "graph built"
        );
        Ok(Arc::new(Graph::new(name, params, kind, self.nodes, outputs)))
    }
}

fn kind_captures(kind: &GraphKind) -> usize {
    match kind {
        GraphKind::Function => 0,
        GraphKind::Closure { captures } => captures.len(),
    }
}

/// Convenience recorders, one per op.
impl Tape {
    pub fn add(&mut self, a: &Variable, b: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Add, &[a.clone(), b.clone()])
    }

    pub fn sub(&mut self, a: &Variable, b: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Sub, &[a.clone(), b.clone()])
    }

    pub fn mul(&mut self, a: &Variable, b: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Mul, &[a.clone(), b.clone()])
    }

    pub fn div(&mut self, a: &Variable, b: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Div, &[a.clone(), b.clone()])
    }

    pub fn neg(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Neg, &[x.clone()])
    }

    pub fn exp(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Exp, &[x.clone()])
    }

    pub fn log(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Log, &[x.clone()])
    }

    pub fn scale(&mut self, x: &Variable, alpha: f64) -> Result<Variable, AdError> {
        self.record(Op::Scale(alpha), &[x.clone()])
    }

    pub fn square(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Square, &[x.clone()])
    }

    /// `alpha * x + y`.
    pub fn axpy(&mut self, alpha: f64, x: &Variable, y: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Axpy(alpha), &[x.clone(), y.clone()])
    }

    pub fn matmul(&mut self, a: &Variable, b: &Variable) -> Result<Variable, AdError> {
        self.record(Op::MatMul, &[a.clone(), b.clone()])
    }

    pub fn transpose(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.record(Op::Transpose, &[x.clone()])
    }

    pub fn reshape(&mut self, x: &Variable, shape: &[usize]) -> Result<Variable, AdError> {
        self.record(Op::Reshape(shape.to_vec()), &[x.clone()])
    }

    pub fn broadcast(&mut self, x: &Variable, shape: &[usize]) -> Result<Variable, AdError> {
        self.record(Op::Broadcast(shape.to_vec()), &[x.clone()])
    }

    pub fn sum_to(&mut self, x: &Variable, shape: &[usize]) -> Result<Variable, AdError> {
        self.record(Op::SumTo(shape.to_vec()), &[x.clone()])
    }

    /// Sum of all elements, as a rank-0 tensor.
    pub fn sum(&mut self, x: &Variable) -> Result<Variable, AdError> {
        self.sum_to(x, &[])
    }

    pub fn cast(&mut self, x: &Variable, dtype: DType) -> Result<Variable, AdError> {
        self.record(Op::Cast(dtype), &[x.clone()])
    }

    /// Copy `x` into another backend's pool.
    pub fn transfer(&mut self, x: &Variable, backend: BackendId) -> Result<Variable, AdError> {
        self.record(Op::Transfer(backend), &[x.clone()])
    }

    pub fn fill(&mut self, shape: &[usize], dtype: DType, value: f64) -> Result<Variable, AdError> {
        self.record(
            Op::Fill {
                shape: shape.to_vec(),
                dtype,
                value,
            },
            &[],
        )
    }
}
