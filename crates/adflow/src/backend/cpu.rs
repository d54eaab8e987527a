//! Reference CPU backend.

use faer::linalg::matmul::matmul;
use faer::{Accum, MatMut, MatRef, Par};

use super::Backend;
use crate::dtype::DType;
use crate::error::AdError;
use crate::ops::Op;
use crate::scalar::Scalar;
use crate::storage::MemoryPool;
use crate::strides::{broadcast_source_index, cartesian_to_linear, compute_strides, linear_to_cartesian};
use crate::tensor::Tensor;

/// Loop kernels over host memory.
///
/// All tensors are column-major, matching faer's layout, so matrix
/// products hand the buffers to faer without copying.
#[derive(Debug)]
pub struct CpuBackend {
    name: String,
    dtypes: Vec<DType>,
    pool: MemoryPool,
}

impl CpuBackend {
    /// Backend for every dtype with an unbounded pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_dtypes(name, DType::all())
    }

    /// Backend restricted to `dtypes`.
    pub fn with_dtypes(name: impl Into<String>, dtypes: &[DType]) -> Self {
        let name = name.into();
        Self {
            pool: MemoryPool::new(name.clone()),
            name,
            dtypes: dtypes.to_vec(),
        }
    }

    /// Replace the pool with one bounded to `limit` bytes.
    pub fn with_pool_limit(mut self, limit: Option<usize>) -> Self {
        self.pool = MemoryPool::with_limit(self.name.clone(), limit);
        self
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn supports(&self, op: &Op, dtype: DType) -> bool {
        if !self.dtypes.contains(&dtype) {
            return false;
        }
        match op {
            Op::Cast(to) => self.dtypes.contains(to),
            Op::Call(_) => false,
            _ => true,
        }
    }

    fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    fn apply(&self, op: &Op, inputs: &[&Tensor], out: &mut Tensor) -> Result<(), AdError> {
        match op {
            Op::Cast(_) => {
                let src = operand(op, inputs, 0)?;
                let values = src.to_f64_vec();
                check_len(op, values.len(), out.len())?;
                out.buffer_mut().fill_from_f64(&values);
                Ok(())
            }
            Op::Transfer(_) => {
                let src = operand(op, inputs, 0)?;
                if src.dtype() != out.dtype() || src.len() != out.len() {
                    return Err(AdError::kernel(op.name(), "transfer between mismatched buffers"));
                }
                out.buffer_mut().clone_from(src.buffer());
                Ok(())
            }
            _ => match out.dtype() {
                DType::F32 => apply_typed::<f32>(op, inputs, out),
                DType::F64 => apply_typed::<f64>(op, inputs, out),
            },
        }
    }

    fn apply_in_place(
        &self,
        op: &Op,
        target_index: usize,
        target: &mut Tensor,
        rest: &[&Tensor],
    ) -> Result<bool, AdError> {
        match target.dtype() {
            DType::F32 => in_place_typed::<f32>(op, target_index, target, rest),
            DType::F64 => in_place_typed::<f64>(op, target_index, target, rest),
        }
    }
}

fn operand<'a>(op: &Op, inputs: &[&'a Tensor], i: usize) -> Result<&'a Tensor, AdError> {
    inputs
        .get(i)
        .copied()
        .ok_or_else(|| AdError::kernel(op.name(), format!("missing operand {}", i)))
}

fn typed<'a, T: Scalar>(op: &Op, inputs: &[&'a Tensor], i: usize) -> Result<&'a [T], AdError> {
    operand(op, inputs, i)?
        .as_slice::<T>()
        .map_err(|e| AdError::kernel(op.name(), e.to_string()))
}

fn check_len(op: &Op, actual: usize, expected: usize) -> Result<(), AdError> {
    if actual != expected {
        return Err(AdError::kernel(
            op.name(),
            format!("operand has {} elements, output has {}", actual, expected),
        ));
    }
    Ok(())
}

fn unary<T: Scalar>(src: &[T], dst: &mut [T], f: impl Fn(T) -> T) {
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = f(s);
    }
}

fn binary<T: Scalar>(a: &[T], b: &[T], dst: &mut [T], f: impl Fn(T, T) -> T) {
    for ((d, &x), &y) in dst.iter_mut().zip(a).zip(b) {
        *d = f(x, y);
    }
}

fn unary_fn<T: Scalar>(op: &Op) -> Option<Box<dyn Fn(T) -> T>> {
    match op {
        Op::Neg => Some(Box::new(|a: T| -a)),
        Op::Exp => Some(Box::new(T::exponential)),
        Op::Log => Some(Box::new(T::logarithm)),
        Op::Scale(alpha) => {
            let k = T::from_f64(*alpha);
            Some(Box::new(move |a: T| a * k))
        }
        _ => None,
    }
}

fn binary_fn<T: Scalar>(op: &Op) -> Option<fn(T, T) -> T> {
    match op {
        Op::Add => Some(|a: T, b: T| a + b),
        Op::Mul => Some(|a: T, b: T| a * b),
        Op::Div => Some(|a: T, b: T| a / b),
        _ => None,
    }
}

fn apply_typed<T: Scalar>(op: &Op, inputs: &[&Tensor], out: &mut Tensor) -> Result<(), AdError> {
    let out_shape = out.shape().to_vec();
    let dst = out
        .as_mut_slice::<T>()
        .map_err(|e| AdError::kernel(op.name(), e.to_string()))?;

    if let Some(f) = binary_fn::<T>(op) {
        let a = typed::<T>(op, inputs, 0)?;
        let b = typed::<T>(op, inputs, 1)?;
        check_len(op, a.len(), dst.len())?;
        check_len(op, b.len(), dst.len())?;
        binary(a, b, dst, f);
        return Ok(());
    }
    if let Some(f) = unary_fn::<T>(op) {
        let a = typed::<T>(op, inputs, 0)?;
        check_len(op, a.len(), dst.len())?;
        unary(a, dst, f);
        return Ok(());
    }

    match op {
        Op::MatMul => {
            let a = operand(op, inputs, 0)?;
            let b = operand(op, inputs, 1)?;
            let (m, k, n) = match (a.shape(), b.shape()) {
                ([m, k], [k2, n]) if k == k2 => (*m, *k, *n),
                _ => return Err(AdError::kernel(op.name(), "operands are not conformable matrices")),
            };
            check_len(op, m * n, dst.len())?;
            let a_mat = MatRef::from_column_major_slice(typed::<T>(op, inputs, 0)?, m, k);
            let b_mat = MatRef::from_column_major_slice(typed::<T>(op, inputs, 1)?, k, n);
            let mut c_mat = MatMut::from_column_major_slice_mut(dst, m, n);
            // C = A * B, overwriting stale contents.
            matmul(c_mat.as_mut(), Accum::Replace, a_mat, b_mat, T::one(), Par::Seq);
            Ok(())
        }
        Op::Transpose => {
            let src_tensor = operand(op, inputs, 0)?;
            let src = typed::<T>(op, inputs, 0)?;
            check_len(op, src.len(), dst.len())?;
            let old_shape = src_tensor.shape();
            let new_strides = compute_strides(&out_shape);
            for (linear_old, &value) in src.iter().enumerate() {
                let old_indices = linear_to_cartesian(linear_old, old_shape);
                let new_indices: Vec<usize> = old_indices.iter().rev().copied().collect();
                dst[cartesian_to_linear(&new_indices, &new_strides)] = value;
            }
            Ok(())
        }
        Op::Reshape(_) => {
            // Column-major reshape keeps the linear order.
            let src = typed::<T>(op, inputs, 0)?;
            check_len(op, src.len(), dst.len())?;
            dst.copy_from_slice(src);
            Ok(())
        }
        Op::Broadcast(_) => {
            let src_tensor = operand(op, inputs, 0)?;
            let src = typed::<T>(op, inputs, 0)?;
            let src_strides = compute_strides(src_tensor.shape());
            for (linear, d) in dst.iter_mut().enumerate() {
                let index = linear_to_cartesian(linear, &out_shape);
                *d = src[broadcast_source_index(&index, src_tensor.shape(), &src_strides)];
            }
            Ok(())
        }
        Op::SumTo(_) => {
            let src_tensor = operand(op, inputs, 0)?;
            let src = typed::<T>(op, inputs, 0)?;
            let dst_strides = compute_strides(&out_shape);
            dst.fill(T::zero());
            for (linear, &value) in src.iter().enumerate() {
                let index = linear_to_cartesian(linear, src_tensor.shape());
                let target = broadcast_source_index(&index, &out_shape, &dst_strides);
                dst[target] = dst[target] + value;
            }
            Ok(())
        }
        Op::Fill { value, .. } => {
            dst.fill(T::from_f64(*value));
            Ok(())
        }
        other => Err(AdError::kernel(
            other.name(),
            "not a primitive of the cpu backend",
        )),
    }
}

fn in_place_typed<T: Scalar>(
    op: &Op,
    target_index: usize,
    target: &mut Tensor,
    rest: &[&Tensor],
) -> Result<bool, AdError> {
    if let Some(f) = binary_fn::<T>(op) {
        let other = typed::<T>(op, rest, 0)?;
        let dst = target
            .as_mut_slice::<T>()
            .map_err(|e| AdError::kernel(op.name(), e.to_string()))?;
        check_len(op, other.len(), dst.len())?;
        for (d, &o) in dst.iter_mut().zip(other) {
            *d = if target_index == 0 { f(*d, o) } else { f(o, *d) };
        }
        return Ok(true);
    }
    if let Some(f) = unary_fn::<T>(op) {
        let dst = target
            .as_mut_slice::<T>()
            .map_err(|e| AdError::kernel(op.name(), e.to_string()))?;
        for d in dst.iter_mut() {
            *d = f(*d);
        }
        return Ok(true);
    }
    Ok(false)
}
