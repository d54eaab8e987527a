//! Error types for adflow.

use thiserror::Error;

use crate::dtype::DType;

/// Errors that can occur while recording, dispatching or executing a graph.
///
/// Errors are `Clone` so that a single failure can be delivered to every
/// waiter of an evaluation request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AdError {
    /// Operand shapes are incompatible with the operation.
    #[error("shape error in {op}: {message}")]
    Shape { op: String, message: String },

    /// Wrong number of operands for the operation.
    #[error("{op} expects {expected} operands, got {actual}")]
    Arity {
        op: String,
        expected: usize,
        actual: usize,
    },

    /// No backend plan exists for the operand dtypes.
    #[error("unsupported operation {op} for dtypes {dtypes:?} on backend {backend}")]
    UnsupportedOperation {
        op: String,
        dtypes: Vec<DType>,
        backend: String,
    },

    /// The evaluation request was cancelled while waiting.
    #[error("evaluation cancelled")]
    Cancelled,

    /// An engine invariant was violated (double publication, use after reclaim).
    #[error("internal consistency violation: {0}")]
    InternalConsistency(String),

    /// The backend allocator could not provide a buffer.
    #[error("pool exhausted: requested {requested} bytes with limit {limit:?}")]
    PoolExhaustion {
        requested: usize,
        limit: Option<usize>,
    },

    /// A backend kernel failed while running.
    #[error("kernel {op} failed: {message}")]
    Kernel { op: String, message: String },

    /// API misuse.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl AdError {
    pub(crate) fn shape(op: impl Into<String>, message: impl Into<String>) -> Self {
        AdError::Shape {
            op: op.into(),
            message: message.into(),
        }
    }

    pub(crate) fn kernel(op: impl Into<String>, message: impl Into<String>) -> Self {
        AdError::Kernel {
            op: op.into(),
            message: message.into(),
        }
    }

    /// Whether this error is an engine invariant violation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AdError::InternalConsistency(_))
    }
}
