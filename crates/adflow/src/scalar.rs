//! Scalar trait for tensor element types.

use faer_traits::ComplexField;
use std::fmt::Debug;
use std::ops::{Add, Div, Mul, Neg, Sub};

use crate::dtype::DType;
use crate::storage::Buffer;

/// Trait for scalar types supported by adflow.
///
/// This wraps faer's `ComplexField` (so kernels can hand slices to faer)
/// with the arithmetic and buffer access the CPU kernels need.
pub trait Scalar:
    ComplexField
    + Copy
    + Debug
    + Default
    + PartialEq
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + 'static
{
    /// Runtime tag of this element type.
    const DTYPE: DType;

    /// Returns the additive identity (zero).
    fn zero() -> Self {
        Self::default()
    }

    /// Returns the multiplicative identity (one).
    fn one() -> Self;

    /// Lossy conversion from `f64`.
    fn from_f64(value: f64) -> Self;

    /// Lossy conversion to `f64`.
    fn to_f64(self) -> f64;

    /// Natural exponential.
    fn exponential(self) -> Self;

    /// Natural logarithm.
    fn logarithm(self) -> Self;

    /// View a buffer's elements if it holds this element type.
    fn view(buffer: &Buffer) -> Option<&[Self]>;

    /// Mutable view of a buffer's elements if it holds this element type.
    fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]>;

    /// Wrap a vector into a typed buffer.
    fn into_buffer(data: Vec<Self>) -> Buffer;
}

impl Scalar for f64 {
    const DTYPE: DType = DType::F64;

    fn one() -> Self {
        1.0
    }

    fn from_f64(value: f64) -> Self {
        value
    }

    fn to_f64(self) -> f64 {
        self
    }

    fn exponential(self) -> Self {
        self.exp()
    }

    fn logarithm(self) -> Self {
        self.ln()
    }

    fn view(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F64(data) => Some(data),
            _ => None,
        }
    }

    fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
        match buffer {
            Buffer::F64(data) => Some(data),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> Buffer {
        Buffer::F64(data)
    }
}

impl Scalar for f32 {
    const DTYPE: DType = DType::F32;

    fn one() -> Self {
        1.0
    }

    fn from_f64(value: f64) -> Self {
        value as f32
    }

    fn to_f64(self) -> f64 {
        self as f64
    }

    fn exponential(self) -> Self {
        self.exp()
    }

    fn logarithm(self) -> Self {
        self.ln()
    }

    fn view(buffer: &Buffer) -> Option<&[Self]> {
        match buffer {
            Buffer::F32(data) => Some(data),
            _ => None,
        }
    }

    fn view_mut(buffer: &mut Buffer) -> Option<&mut [Self]> {
        match buffer {
            Buffer::F32(data) => Some(data),
            _ => None,
        }
    }

    fn into_buffer(data: Vec<Self>) -> Buffer {
        Buffer::F32(data)
    }
}
