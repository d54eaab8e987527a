//! Backward formulas of the primitive gradient rules.
//!
//! Each rule records its gradient computation onto a tape; nothing runs
//! until the backward region is evaluated.

use smallvec::{SmallVec, smallvec};

use crate::error::AdError;
use crate::graph::{Tape, Variable};
use crate::ops::{GradRule, Op};

pub(crate) type InputGrads = SmallVec<[Option<Variable>; 2]>;

/// Everything a rule may read.
pub(crate) struct GradContext<'a> {
    pub op: &'a Op,
    /// Forward operands, for shape, dtype and backend.
    pub operands: &'a [Variable],
    /// Retained operand values, as readable variables on the backward tape.
    pub saved: &'a [Option<Variable>],
    pub output: Option<&'a Variable>,
    /// Sensitivity of the output.
    pub grad: &'a Variable,
    /// Which operands need a gradient.
    pub wants: &'a [bool],
}

impl GradContext<'_> {
    fn saved(&self, i: usize) -> Result<&Variable, AdError> {
        self.saved.get(i).and_then(Option::as_ref).ok_or_else(|| {
            AdError::InternalConsistency(format!("{} operand {} was not retained", self.op, i))
        })
    }

    fn output(&self) -> Result<&Variable, AdError> {
        self.output.ok_or_else(|| {
            AdError::InternalConsistency(format!("{} output was not retained", self.op))
        })
    }

    fn wants(&self, i: usize) -> bool {
        self.wants.get(i).copied().unwrap_or(false)
    }

    fn operand(&self, i: usize) -> Result<&Variable, AdError> {
        self.operands.get(i).ok_or_else(|| AdError::Arity {
            op: self.op.name().into(),
            expected: i + 1,
            actual: self.operands.len(),
        })
    }
}

impl GradRule {
    /// Record the gradient of every wanted operand.
    pub(crate) fn backward(
        self,
        tape: &mut Tape,
        ctx: &GradContext<'_>,
    ) -> Result<InputGrads, AdError> {
        let g = ctx.grad;
        let unary = |grad: Option<Variable>| -> InputGrads { smallvec![grad] };
        match self {
            GradRule::Add => Ok(smallvec![
                ctx.wants(0).then(|| g.clone()),
                ctx.wants(1).then(|| g.clone()),
            ]),
            GradRule::Mul => {
                let da = if ctx.wants(0) {
                    Some(tape.mul(g, ctx.saved(1)?)?)
                } else {
                    None
                };
                let db = if ctx.wants(1) {
                    Some(tape.mul(g, ctx.saved(0)?)?)
                } else {
                    None
                };
                Ok(smallvec![da, db])
            }
            GradRule::Div => {
                // d(a/b) = g/b, -(g/b) * (a/b)
                let t = tape.div(g, ctx.saved(1)?)?;
                let db = if ctx.wants(1) {
                    let q = tape.div(ctx.saved(0)?, ctx.saved(1)?)?;
                    let p = tape.mul(&t, &q)?;
                    Some(tape.neg(&p)?)
                } else {
                    None
                };
                Ok(smallvec![ctx.wants(0).then_some(t), db])
            }
            GradRule::Neg => Ok(unary(Some(tape.neg(g)?))),
            GradRule::Exp => Ok(unary(Some(tape.mul(g, ctx.output()?)?))),
            GradRule::Log => Ok(unary(Some(tape.div(g, ctx.saved(0)?)?))),
            GradRule::Scale => match ctx.op {
                Op::Scale(alpha) => Ok(unary(Some(tape.scale(g, *alpha)?))),
                other => Err(mismatch(self, other)),
            },
            GradRule::MatMul => {
                let da = if ctx.wants(0) {
                    let bt = tape.transpose(ctx.saved(1)?)?;
                    Some(tape.matmul(g, &bt)?)
                } else {
                    None
                };
                let db = if ctx.wants(1) {
                    let at = tape.transpose(ctx.saved(0)?)?;
                    Some(tape.matmul(&at, g)?)
                } else {
                    None
                };
                Ok(smallvec![da, db])
            }
            GradRule::Transpose => Ok(unary(Some(tape.transpose(g)?))),
            GradRule::Reshape => {
                let shape = ctx.operand(0)?.shape().to_vec();
                Ok(unary(Some(tape.reshape(g, &shape)?)))
            }
            GradRule::Broadcast => {
                let shape = ctx.operand(0)?.shape().to_vec();
                Ok(unary(Some(tape.sum_to(g, &shape)?)))
            }
            GradRule::SumTo => {
                let shape = ctx.operand(0)?.shape().to_vec();
                Ok(unary(Some(tape.broadcast(g, &shape)?)))
            }
            GradRule::Cast => {
                let dtype = ctx.operand(0)?.dtype();
                Ok(unary(Some(tape.cast(g, dtype)?)))
            }
            GradRule::Transfer => {
                let backend = ctx.operand(0)?.backend();
                Ok(unary(Some(tape.transfer(g, backend)?)))
            }
        }
    }
}

fn mismatch(rule: GradRule, op: &Op) -> AdError {
    AdError::InternalConsistency(format!("rule {:?} applied to {}", rule, op))
}
