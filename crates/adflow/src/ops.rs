//! Generic operations.
//!
//! An [`Op`] names what a node computes, independently of any backend.
//! Primitive ops carry a [`GradRule`]; composite ops (`Sub`, `Square`,
//! `Axpy`) have none and are expanded into primitives by dispatch, and
//! differentiated through that expansion.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use smallvec::{SmallVec, smallvec};

use crate::dispatch::{BackendId, PlanInput, PlanStep};
use crate::dtype::DType;
use crate::graph::Graph;

/// Operator tag of a node.
#[derive(Debug, Clone)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    /// Multiply by a constant.
    Scale(f64),
    Square,
    /// `alpha * x + y`.
    Axpy(f64),
    /// Matrix product of two rank-2 tensors.
    MatMul,
    /// Reverse all axes.
    Transpose,
    Reshape(Vec<usize>),
    /// Repeat along new leading axes and size-1 axes (trailing alignment).
    Broadcast(Vec<usize>),
    /// Sum over the axes a `Broadcast` to the input shape would repeat.
    SumTo(Vec<usize>),
    Cast(DType),
    /// Copy into another backend's pool.
    Transfer(BackendId),
    /// Constant tensor.
    Fill {
        shape: Vec<usize>,
        dtype: DType,
        value: f64,
    },
    /// Call a nested graph. Inputs are the arguments followed by the
    /// graph's captured variables in capture order.
    Call(Arc<Graph>),
}

impl Op {
    /// Short lowercase name, used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Neg => "neg",
            Op::Exp => "exp",
            Op::Log => "log",
            Op::Scale(_) => "scale",
            Op::Square => "square",
            Op::Axpy(_) => "axpy",
            Op::MatMul => "matmul",
            Op::Transpose => "transpose",
            Op::Reshape(_) => "reshape",
            Op::Broadcast(_) => "broadcast",
            Op::SumTo(_) => "sum_to",
            Op::Cast(_) => "cast",
            Op::Transfer(_) => "transfer",
            Op::Fill { .. } => "fill",
            Op::Call(_) => "call",
        }
    }

    /// Number of operands, or `None` for calls (which depend on the graph).
    pub fn arity(&self) -> Option<usize> {
        match self {
            Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Axpy(_) | Op::MatMul => Some(2),
            Op::Neg
            | Op::Exp
            | Op::Log
            | Op::Scale(_)
            | Op::Square
            | Op::Transpose
            | Op::Reshape(_)
            | Op::Broadcast(_)
            | Op::SumTo(_)
            | Op::Cast(_)
            | Op::Transfer(_) => Some(1),
            Op::Fill { .. } => Some(0),
            Op::Call(_) => None,
        }
    }

    /// Whether dispatch expands this op into several primitives.
    pub fn is_composite(&self) -> bool {
        matches!(self, Op::Sub | Op::Square | Op::Axpy(_))
    }

    /// Whether the output has the shape and dtype of every operand and each
    /// element depends only on the matching operand elements.
    pub fn is_elementwise(&self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Neg
                | Op::Exp
                | Op::Log
                | Op::Scale(_)
                | Op::Square
                | Op::Axpy(_)
        )
    }

    /// Gradient rule of a primitive op.
    pub fn gradient_rule(&self) -> Option<GradRule> {
        match self {
            Op::Add => Some(GradRule::Add),
            Op::Mul => Some(GradRule::Mul),
            Op::Div => Some(GradRule::Div),
            Op::Neg => Some(GradRule::Neg),
            Op::Exp => Some(GradRule::Exp),
            Op::Log => Some(GradRule::Log),
            Op::Scale(_) => Some(GradRule::Scale),
            Op::MatMul => Some(GradRule::MatMul),
            Op::Transpose => Some(GradRule::Transpose),
            Op::Reshape(_) => Some(GradRule::Reshape),
            Op::Broadcast(_) => Some(GradRule::Broadcast),
            Op::SumTo(_) => Some(GradRule::SumTo),
            Op::Cast(_) => Some(GradRule::Cast),
            Op::Transfer(_) => Some(GradRule::Transfer),
            Op::Sub | Op::Square | Op::Axpy(_) | Op::Fill { .. } | Op::Call(_) => None,
        }
    }

    /// Values a backward pass will need, given which inputs require a
    /// gradient.
    ///
    /// Composite ops keep all their inputs and recompute intermediates.
    pub fn saves(&self, requires_grad: &[bool]) -> SaveFlags {
        let any = requires_grad.iter().any(|&r| r);
        if let Some(rule) = self.gradient_rule() {
            return rule.saves(requires_grad);
        }
        if self.is_composite() && any {
            return SaveFlags {
                inputs: smallvec![true; requires_grad.len()],
                outputs: smallvec![false],
            };
        }
        SaveFlags::none(requires_grad.len(), 1)
    }

    /// Scalar parameter of `scale`, `axpy` and `fill`.
    pub fn scalar(&self) -> Option<f64> {
        match self {
            Op::Scale(a) | Op::Axpy(a) => Some(*a),
            Op::Fill { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// The same op with its scalar parameter replaced. Ops without one are
    /// returned unchanged.
    pub fn with_scalar(&self, value: f64) -> Op {
        match self {
            Op::Scale(_) => Op::Scale(value),
            Op::Axpy(_) => Op::Axpy(value),
            Op::Fill { shape, dtype, .. } => Op::Fill {
                shape: shape.clone(),
                dtype: *dtype,
                value,
            },
            other => other.clone(),
        }
    }

    /// The op with its scalar erased. Ops with equal signatures share a
    /// backend plan.
    pub fn signature(&self) -> Op {
        self.with_scalar(0.0)
    }

    /// Expansion of a composite op into primitive steps.
    ///
    /// The last step produces the result. A step that carries a scalar takes
    /// the composite's scalar.
    pub fn expand(&self) -> Option<Vec<PlanStep>> {
        use PlanInput::{Operand, Step};
        match self {
            Op::Sub => Some(vec![
                PlanStep::new(Op::Neg, [Operand(1)]),
                PlanStep::new(Op::Add, [Operand(0), Step(0)]),
            ]),
            Op::Square => Some(vec![PlanStep::new(Op::Mul, [Operand(0), Operand(0)])]),
            Op::Axpy(alpha) => Some(vec![
                PlanStep::new(Op::Scale(*alpha), [Operand(0)]),
                PlanStep::new(Op::Add, [Step(0), Operand(1)]),
            ]),
            _ => None,
        }
    }
}

impl PartialEq for Op {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Op::Scale(a), Op::Scale(b)) | (Op::Axpy(a), Op::Axpy(b)) => a.to_bits() == b.to_bits(),
            (Op::Reshape(a), Op::Reshape(b))
            | (Op::Broadcast(a), Op::Broadcast(b))
            | (Op::SumTo(a), Op::SumTo(b)) => a == b,
            (Op::Cast(a), Op::Cast(b)) => a == b,
            (Op::Transfer(a), Op::Transfer(b)) => a == b,
            (
                Op::Fill {
                    shape: s1,
                    dtype: d1,
                    value: v1,
                },
                Op::Fill {
                    shape: s2,
                    dtype: d2,
                    value: v2,
                },
            ) => s1 == s2 && d1 == d2 && v1.to_bits() == v2.to_bits(),
            (Op::Call(a), Op::Call(b)) => Arc::ptr_eq(a, b),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Eq for Op {}

impl Hash for Op {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Op::Scale(a) | Op::Axpy(a) => a.to_bits().hash(state),
            Op::Reshape(s) | Op::Broadcast(s) | Op::SumTo(s) => s.hash(state),
            Op::Cast(d) => d.hash(state),
            Op::Transfer(b) => b.hash(state),
            Op::Fill {
                shape,
                dtype,
                value,
            } => {
                shape.hash(state);
                dtype.hash(state);
                value.to_bits().hash(state);
            }
            Op::Call(g) => g.id().hash(state),
            _ => {}
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Scale(a) => write!(f, "scale({a})"),
            Op::Axpy(a) => write!(f, "axpy({a})"),
            Op::Reshape(s) => write!(f, "reshape({s:?})"),
            Op::Broadcast(s) => write!(f, "broadcast({s:?})"),
            Op::SumTo(s) => write!(f, "sum_to({s:?})"),
            Op::Cast(d) => write!(f, "cast({d})"),
            Op::Transfer(b) => write!(f, "transfer({})", b.index()),
            Op::Call(g) => write!(f, "call({})", g.name()),
            other => f.write_str(other.name()),
        }
    }
}

/// Per-slot retention flags of a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveFlags {
    /// `needs_input_for_backward`, one per input.
    pub inputs: SmallVec<[bool; 2]>,
    /// `needs_output_for_backward`, one per output.
    pub outputs: SmallVec<[bool; 1]>,
}

impl SaveFlags {
    pub fn none(num_inputs: usize, num_outputs: usize) -> Self {
        Self {
            inputs: smallvec![false; num_inputs],
            outputs: smallvec![false; num_outputs],
        }
    }

    /// Whether anything is retained.
    pub fn any(&self) -> bool {
        self.inputs.iter().chain(self.outputs.iter()).any(|&f| f)
    }
}

/// Backend-agnostic gradient rule of a primitive op.
///
/// The backward computation itself lives in `autodiff::rules`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GradRule {
    Add,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Scale,
    MatMul,
    Transpose,
    Reshape,
    Broadcast,
    SumTo,
    Cast,
    Transfer,
}

impl GradRule {
    /// Which inputs/outputs the rule reads, given which inputs need a
    /// gradient.
    pub fn saves(self, requires_grad: &[bool]) -> SaveFlags {
        let mut flags = SaveFlags::none(requires_grad.len(), 1);
        let req = |i: usize| requires_grad.get(i).copied().unwrap_or(false);
        match self {
            // d(x*y) = g*y, g*x: each input is needed for the other's gradient.
            GradRule::Mul | GradRule::MatMul => {
                flags.inputs[0] = req(1);
                flags.inputs[1] = req(0);
            }
            // d(a/b) = g/b, -g*a/b^2.
            GradRule::Div => {
                flags.inputs[0] = req(1);
                flags.inputs[1] = req(0) || req(1);
            }
            GradRule::Exp => flags.outputs[0] = req(0),
            GradRule::Log => flags.inputs[0] = req(0),
            GradRule::Add
            | GradRule::Neg
            | GradRule::Scale
            | GradRule::Transpose
            | GradRule::Reshape
            | GradRule::Broadcast
            | GradRule::SumTo
            | GradRule::Cast
            | GradRule::Transfer => {}
        }
        flags
    }
}
