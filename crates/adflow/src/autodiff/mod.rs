//! Reverse-mode differentiation of recorded graphs.
//!
//! # Architecture
//!
//! ```text
//! J(f)(args)
//!   → forward execution, retaining values flagged for backward
//!   → Backpropagator tree (Primitive per node, Graph per call)
//! bprop(sens)
//!   → backward nodes recorded onto a fresh tape
//!       per-scope SensitivityMap, lazily materialized
//!       closure environment gradients unpacked in capture order
//!   → evaluated by the same scheduler
//! ```
//!
//! # Key Types
//!
//! - [`Value`]: tensors, tuples, functions, backpropagators and zero
//! - [`j`] / [`jinv`]: the transform and its inverse
//! - [`Backpropagator`]: reverse-mode closure of an executed graph
//! - [`GradStats`]: accumulators and zero fills of one backward pass

mod backprop;
pub(crate) mod forward;
mod rules;
mod sensitivity;
mod value;

pub use backprop::Backpropagator;
pub use sensitivity::GradStats;
pub use value::{BackpropFn, Function, Value, j, jinv};

pub(crate) use sensitivity::GradCounters;
