//! Backend abstraction for tensor kernels.
//!
//! A backend owns a [`MemoryPool`] and executes primitive ops on tensors
//! drawn from it. Dispatch decides which primitives a generic op lowers to;
//! the backend only has to run them.
//!
//! # Backends
//!
//! - `CpuBackend`: loop kernels over host memory, matmul through faer.

mod cpu;

use std::fmt::Debug;

use crate::dtype::DType;
use crate::error::AdError;
use crate::ops::Op;
use crate::storage::MemoryPool;
use crate::tensor::Tensor;

pub use cpu::CpuBackend;

/// Kernel library for one device.
///
/// Implementations must be callable from any worker thread.
pub trait Backend: Send + Sync + Debug {
    /// Registry name, used in errors and logs.
    fn name(&self) -> &str;

    /// Whether the backend implements primitive `op` for operands of `dtype`.
    fn supports(&self, op: &Op, dtype: DType) -> bool;

    /// Pool that lends this backend's buffers.
    fn pool(&self) -> &MemoryPool;

    /// Compute `op(inputs)` into `out`.
    ///
    /// `out` already has the result shape and dtype; its contents are stale.
    fn apply(&self, op: &Op, inputs: &[&Tensor], out: &mut Tensor) -> Result<(), AdError>;

    /// Compute an elementwise `op` into the buffer of operand
    /// `target_index`, which the caller owns exclusively.
    ///
    /// `rest` holds the remaining operands in order. Returns `Ok(false)`,
    /// leaving `target` untouched, if the op cannot run in place.
    fn apply_in_place(
        &self,
        op: &Op,
        target_index: usize,
        target: &mut Tensor,
        rest: &[&Tensor],
    ) -> Result<bool, AdError> {
        let _ = (op, target_index, target, rest);
        Ok(false)
    }
}
