//! Typed host buffers.
//!
//! `Buffer` is the storage a backend hands out for one tensor. The CPU
//! backend keeps elements in a `Vec`; other backends are expected to stage
//! through the same representation when they exchange data with the host.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::dtype::DType;
use crate::error::AdError;
use crate::scalar::Scalar;

/// Identity of one storage block. Stable across reuse through the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

/// Element storage for one tensor.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    F32(Vec<f32>),
    F64(Vec<f64>),
}

impl Buffer {
    /// Create a zero-initialized buffer.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype {
            DType::F32 => Buffer::F32(vec![0.0; len]),
            DType::F64 => Buffer::F64(vec![0.0; len]),
        }
    }

    /// Allocate a buffer, reporting allocator failure instead of aborting.
    pub fn try_alloc(dtype: DType, len: usize) -> Result<Self, AdError> {
        fn alloc<T: Scalar>(len: usize) -> Result<Buffer, AdError> {
            let mut data: Vec<T> = Vec::new();
            data.try_reserve_exact(len)
                .map_err(|_| AdError::PoolExhaustion {
                    requested: len * T::DTYPE.size_of(),
                    limit: None,
                })?;
            data.resize(len, T::zero());
            Ok(T::into_buffer(data))
        }
        match dtype {
            DType::F32 => alloc::<f32>(len),
            DType::F64 => alloc::<f64>(len),
        }
    }

    /// Element type of the buffer.
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
        }
    }

    /// Length of buffer (number of elements).
    pub fn len(&self) -> usize {
        match self {
            Buffer::F32(data) => data.len(),
            Buffer::F64(data) => data.len(),
        }
    }

    /// Check if buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size of the buffer in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    /// Copy the elements out as `f64`, converting if needed.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        match self {
            Buffer::F32(data) => data.iter().map(|&x| x as f64).collect(),
            Buffer::F64(data) => data.clone(),
        }
    }

    /// Overwrite the elements from `f64` values, converting if needed.
    ///
    /// Lengths must match; the caller checks shapes beforehand.
    pub fn fill_from_f64(&mut self, values: &[f64]) {
        match self {
            Buffer::F32(data) => {
                for (dst, &src) in data.iter_mut().zip(values) {
                    *dst = src as f32;
                }
            }
            Buffer::F64(data) => data.copy_from_slice(values),
        }
    }
}
