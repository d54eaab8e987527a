//! Backend-agnostic tensor handle.
//!
//! ```text
//! Tensor
//! ├── shape / strides   (column-major)
//! └── PooledBuffer ──► Buffer (F32 | F64)
//! ```
//!
//! A tensor owns exactly one storage block. When the storage was lent by a
//! [`MemoryPool`](crate::storage::MemoryPool), dropping the tensor returns it.

use crate::dtype::DType;
use crate::error::AdError;
use crate::scalar::Scalar;
use crate::storage::{Buffer, BufferId, MemoryPool, PooledBuffer};
use crate::strides::{compute_strides, numel};

/// Dense column-major tensor with runtime element type.
#[derive(Debug)]
pub struct Tensor {
    shape: Vec<usize>,
    strides: Vec<usize>,
    storage: PooledBuffer,
}

impl Tensor {
    /// Create a tensor from column-major data.
    ///
    /// The storage is not pooled.
    ///
    /// # Errors
    ///
    /// Returns `AdError::Shape` if data length doesn't match shape.
    ///
    /// # Examples
    ///
    /// ```
    /// use adflow::Tensor;
    ///
    /// let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert_eq!(t.get::<f64>(&[1, 0]), Some(2.0)); // column-major
    /// ```
    pub fn from_vec<T: Scalar>(data: Vec<T>, shape: &[usize]) -> Result<Self, AdError> {
        let expected = numel(shape);
        if data.len() != expected {
            return Err(AdError::shape(
                "from_vec",
                format!("data has {} elements, shape {:?} needs {}", data.len(), shape, expected),
            ));
        }
        Ok(Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            storage: PooledBuffer::standalone(T::into_buffer(data), shape),
        })
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: &[usize], dtype: DType, value: f64) -> Self {
        let mut buffer = Buffer::zeros(dtype, numel(shape));
        if value != 0.0 {
            buffer.fill_from_f64(&vec![value; numel(shape)]);
        }
        Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            storage: PooledBuffer::standalone(buffer, shape),
        }
    }

    /// Create a zero-initialized tensor.
    pub fn zeros(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, dtype, 0.0)
    }

    /// Create a tensor of ones.
    pub fn ones(shape: &[usize], dtype: DType) -> Self {
        Self::full(shape, dtype, 1.0)
    }

    /// Create a tensor whose storage is drawn from `pool`.
    ///
    /// Contents are unspecified until written.
    pub fn uninit_in(pool: &MemoryPool, shape: &[usize], dtype: DType) -> Result<Self, AdError> {
        let storage = pool.acquire(shape, dtype)?;
        Ok(Self {
            shape: shape.to_vec(),
            strides: compute_strides(shape),
            storage,
        })
    }

    /// Get the shape of the tensor.
    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Get strides.
    #[inline]
    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Get the rank (number of dimensions).
    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Get total number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.storage.buffer().len()
    }

    /// Check if tensor is empty (has zero elements).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element type.
    #[inline]
    pub fn dtype(&self) -> DType {
        self.storage.buffer().dtype()
    }

    /// Identity of the storage block.
    #[inline]
    pub fn buffer_id(&self) -> BufferId {
        self.storage.id()
    }

    /// Whether the storage returns to a pool when the tensor is dropped.
    pub fn is_pooled(&self) -> bool {
        self.storage.is_pooled()
    }

    /// Borrow the raw buffer.
    pub fn buffer(&self) -> &Buffer {
        self.storage.buffer()
    }

    /// Mutably borrow the raw buffer.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        self.storage.buffer_mut()
    }

    /// Borrow the elements as `T`.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InvalidOperation` if the tensor holds another dtype.
    pub fn as_slice<T: Scalar>(&self) -> Result<&[T], AdError> {
        let dtype = self.dtype();
        T::view(self.storage.buffer()).ok_or_else(|| dtype_mismatch::<T>(dtype))
    }

    /// Mutably borrow the elements as `T`.
    pub fn as_mut_slice<T: Scalar>(&mut self) -> Result<&mut [T], AdError> {
        let dtype = self.dtype();
        T::view_mut(self.storage.buffer_mut()).ok_or_else(|| dtype_mismatch::<T>(dtype))
    }

    /// Copy the elements out as `T`.
    pub fn to_vec<T: Scalar>(&self) -> Result<Vec<T>, AdError> {
        self.as_slice::<T>().map(<[T]>::to_vec)
    }

    /// Copy the elements out as `f64`, converting if needed.
    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.storage.buffer().to_f64_vec()
    }

    /// Get element by cartesian index.
    pub fn get<T: Scalar>(&self, indices: &[usize]) -> Option<T> {
        if indices.len() != self.shape.len()
            || indices.iter().zip(&self.shape).any(|(&i, &d)| i >= d)
        {
            return None;
        }
        let linear = crate::strides::cartesian_to_linear(indices, &self.strides);
        self.as_slice::<T>().ok()?.get(linear).copied()
    }

    /// Whether both tensors hold bit-identical data with the same shape and dtype.
    pub fn bit_eq(&self, other: &Tensor) -> bool {
        if self.shape != other.shape {
            return false;
        }
        match (self.buffer(), other.buffer()) {
            (Buffer::F32(a), Buffer::F32(b)) => {
                a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Buffer::F64(a), Buffer::F64(b)) => {
                a.iter().zip(b).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            _ => false,
        }
    }
}

fn dtype_mismatch<T: Scalar>(actual: DType) -> AdError {
    AdError::InvalidOperation(format!(
        "tensor holds {} elements, requested {}",
        actual,
        T::DTYPE
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_shape_mismatch() {
        let err = Tensor::from_vec(vec![1.0f64, 2.0], &[3]).unwrap_err();
        assert!(matches!(err, AdError::Shape { .. }));
    }

    #[test]
    fn test_scalar_tensor() {
        let t = Tensor::from_vec(vec![5.0f64], &[]).unwrap();
        assert_eq!(t.len(), 1);
        assert_eq!(t.ndim(), 0);
        assert_eq!(t.get::<f64>(&[]), Some(5.0));
    }

    #[test]
    fn test_column_major_get() {
        let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        assert_eq!(t.get::<f64>(&[0, 1]), Some(3.0));
        assert_eq!(t.get::<f64>(&[1, 2]), Some(6.0));
        assert_eq!(t.get::<f64>(&[2, 0]), None);
    }

    #[test]
    fn test_dtype_checked_access() {
        let t = Tensor::ones(&[2], DType::F32);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 1.0]);
        assert!(t.as_slice::<f64>().is_err());
        assert_eq!(t.to_f64_vec(), vec![1.0, 1.0]);
    }

    #[test]
    fn test_uninit_in_pool_returns_on_drop() {
        let pool = MemoryPool::new("test");
        let t = Tensor::uninit_in(&pool, &[4], DType::F64).unwrap();
        assert!(t.is_pooled());
        let id = t.buffer_id();
        drop(t);

        let again = Tensor::uninit_in(&pool, &[4], DType::F64).unwrap();
        assert_eq!(again.buffer_id(), id);
    }

    #[test]
    fn test_bit_eq() {
        let a = Tensor::from_vec(vec![0.1f64, 0.2], &[2]).unwrap();
        let b = Tensor::from_vec(vec![0.1f64, 0.2], &[2]).unwrap();
        let c = Tensor::from_vec(vec![0.1f64, 0.2], &[1, 2]).unwrap();
        assert!(a.bit_eq(&b));
        assert!(!a.bit_eq(&c));
    }
}
