//! Record-time shape and dtype inference.

use crate::dtype::DType;
use crate::error::AdError;
use crate::ops::Op;
use crate::strides::numel;

/// Shape and dtype of one operand or result.
pub type Meta<'a> = (&'a [usize], DType);

/// Infer the result shape and dtype of `op` applied to `inputs`.
///
/// # Errors
///
/// - `AdError::Arity` if the operand count is wrong.
/// - `AdError::Shape` if the operand shapes are incompatible.
/// - `AdError::InvalidOperation` for calls, whose results come from the
///   called graph.
pub fn infer(op: &Op, inputs: &[Meta<'_>]) -> Result<(Vec<usize>, DType), AdError> {
    let Some(expected) = op.arity() else {
        return Err(untyped_call());
    };
    if inputs.len() != expected {
        return Err(AdError::Arity {
            op: op.name().into(),
            expected,
            actual: inputs.len(),
        });
    }

    match op {
        Op::Fill { shape, dtype, .. } => Ok((shape.clone(), *dtype)),
        Op::Add | Op::Sub | Op::Mul | Op::Div | Op::Axpy(_) => {
            let (a, da) = inputs[0];
            let (b, _) = inputs[1];
            if a != b {
                return Err(AdError::shape(
                    op.name(),
                    format!("Shapes differ: {:?} and {:?}", a, b),
                ));
            }
            Ok((a.to_vec(), da))
        }
        Op::Neg | Op::Exp | Op::Log | Op::Scale(_) | Op::Square | Op::Transfer(_) => {
            let (a, da) = inputs[0];
            Ok((a.to_vec(), da))
        }
        Op::Cast(to) => Ok((inputs[0].0.to_vec(), *to)),
        Op::MatMul => {
            let (a, da) = inputs[0];
            let (b, _) = inputs[1];
            if a.len() != 2 || b.len() != 2 {
                return Err(AdError::shape(op.name(), "dot needs matrix inputs"));
            }
            if a[1] != b[0] {
                return Err(AdError::shape(
                    op.name(),
                    format!("Incompatible shapes in dot: {:?} and {:?}", a, b),
                ));
            }
            Ok((vec![a[0], b[1]], da))
        }
        Op::Transpose => {
            let (a, da) = inputs[0];
            Ok((a.iter().rev().copied().collect(), da))
        }
        Op::Reshape(shape) => {
            let (a, da) = inputs[0];
            if numel(a) != numel(shape) {
                return Err(AdError::shape(
                    op.name(),
                    format!(
                        "Cannot change the total number of elements in reshape: {:?} to {:?}",
                        a, shape
                    ),
                ));
            }
            Ok((shape.clone(), da))
        }
        Op::Broadcast(shape) => {
            let (a, da) = inputs[0];
            check_broadcast(op, a, shape)?;
            Ok((shape.clone(), da))
        }
        Op::SumTo(shape) => {
            let (a, da) = inputs[0];
            check_broadcast(op, shape, a)?;
            Ok((shape.clone(), da))
        }
        Op::Call(_) => Err(untyped_call()),
    }
}

fn untyped_call() -> AdError {
    AdError::InvalidOperation("call results are typed by the called graph".into())
}

/// Check that `from` broadcasts to `to` under trailing alignment.
pub fn check_broadcast(op: &Op, from: &[usize], to: &[usize]) -> Result<(), AdError> {
    if from.len() > to.len() {
        return Err(AdError::shape(
            op.name(),
            format!("Cannot distribute to smaller shape: {:?} to {:?}", from, to),
        ));
    }
    let offset = to.len() - from.len();
    for (d, &dim) in from.iter().enumerate() {
        if dim != 1 && dim != to[offset + d] {
            return Err(AdError::shape(
                op.name(),
                format!("Cannot change shape when distributing: {:?} to {:?}", from, to),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: DType = DType::F64;

    fn m(shape: &[usize]) -> Meta<'_> {
        (shape, F)
    }

    #[test]
    fn test_elementwise_requires_equal_shapes() {
        assert_eq!(infer(&Op::Add, &[m(&[3]), m(&[3])]).unwrap(), (vec![3], F));
        let err = infer(&Op::Mul, &[m(&[3]), m(&[4])]).unwrap_err();
        assert!(matches!(err, AdError::Shape { .. }));
    }

    #[test]
    fn test_arity() {
        let err = infer(&Op::Add, &[m(&[3])]).unwrap_err();
        assert_eq!(
            err,
            AdError::Arity {
                op: "add".into(),
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_matmul() {
        assert_eq!(
            infer(&Op::MatMul, &[m(&[2, 3]), m(&[3, 4])]).unwrap().0,
            vec![2, 4]
        );
        let err = infer(&Op::MatMul, &[m(&[2, 3]), m(&[4, 4])]).unwrap_err();
        assert!(err.to_string().contains("Incompatible shapes in dot"));
        let err = infer(&Op::MatMul, &[m(&[6]), m(&[6, 1])]).unwrap_err();
        assert!(err.to_string().contains("dot needs matrix inputs"));
    }

    #[test]
    fn test_reshape_preserves_count() {
        assert!(infer(&Op::Reshape(vec![3, 2]), &[m(&[2, 3])]).is_ok());
        let err = infer(&Op::Reshape(vec![5]), &[m(&[2, 3])]).unwrap_err();
        assert!(err.to_string().contains("total number of elements"));
    }

    #[test]
    fn test_broadcast_rules() {
        assert!(infer(&Op::Broadcast(vec![2, 3]), &[m(&[3])]).is_ok());
        assert!(infer(&Op::Broadcast(vec![2, 3]), &[m(&[1, 3])]).is_ok());
        assert!(infer(&Op::Broadcast(vec![4]), &[m(&[])]).is_ok());

        let err = infer(&Op::Broadcast(vec![3]), &[m(&[2, 3])]).unwrap_err();
        assert!(err.to_string().contains("smaller shape"));
        let err = infer(&Op::Broadcast(vec![2, 3]), &[m(&[2])]).unwrap_err();
        assert!(err.to_string().contains("Cannot change shape"));
    }

    #[test]
    fn test_sum_to_is_inverse_of_broadcast() {
        assert_eq!(
            infer(&Op::SumTo(vec![3]), &[m(&[2, 3])]).unwrap().0,
            vec![3]
        );
        assert_eq!(infer(&Op::SumTo(vec![]), &[m(&[2, 3])]).unwrap().0, Vec::<usize>::new());
        assert!(infer(&Op::SumTo(vec![2, 3]), &[m(&[3])]).is_err());
    }

    #[test]
    fn test_cast_and_transpose() {
        assert_eq!(
            infer(&Op::Cast(DType::F32), &[m(&[2])]).unwrap(),
            (vec![2], DType::F32)
        );
        assert_eq!(
            infer(&Op::Transpose, &[m(&[2, 3, 4])]).unwrap().0,
            vec![4, 3, 2]
        );
    }
}
