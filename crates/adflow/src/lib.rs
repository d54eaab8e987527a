//! adflow - lazy tensor tape with a dataflow scheduler and reverse-mode AD
//!
//! Operations on [`Variable`]s are recorded on a [`Tape`] without running.
//! Closing a region hands it to the scheduler, which runs every node as soon
//! as its operands are published and returns buffers to their pool when the
//! last consumer is done. Differentiation is a transform over function
//! graphs: `J(f)` returns outputs together with a backpropagator, and the
//! backward pass is itself recorded lazily and scheduled like any region.
//!
//! # Architecture
//!
//! ```text
//! Level 1: Recording (graph module)
//!     → Tape, Variable, Node, Graph (functions and closures), Region
//!
//! Level 2: Scheduling (exec module)
//!     → lowering to slots/tasks, Execution, CancelToken
//!
//! Level 3: Dispatch and kernels (dispatch, backend, storage modules)
//!     → plan cache, CpuBackend, MemoryPool
//!
//! Level 4: Differentiation (autodiff module)
//!     → gradient rules, Backpropagator, Value, J / Jinv
//! ```
//!
//! # Example
//!
//! ```
//! use adflow::{DType, Runtime, RuntimeConfig, Tensor};
//!
//! let rt = Runtime::new(RuntimeConfig::default().with_num_threads(2)).unwrap();
//! let mut tape = rt.tape();
//!
//! let x = tape.leaf(Tensor::full(&[3], DType::F64, 2.0), true);
//! let y = tape.mul(&x, &x).unwrap();
//!
//! // Nothing has run yet.
//! assert!(!y.has_value());
//!
//! let grads = rt.grad(&mut tape, &y, &[x], None).unwrap();
//! assert_eq!(grads.values()[0].to_f64_vec(), vec![4.0, 4.0, 4.0]);
//! ```

pub mod autodiff;
pub mod backend;
pub mod config;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod events;
pub mod exec;
pub mod graph;
pub mod ops;
pub mod random;
pub mod runtime;
pub mod scalar;
pub mod shape;
pub mod storage;
pub mod strides;
pub mod tensor;

pub use autodiff::{Backpropagator, BackpropFn, Function, GradStats, Value, j, jinv};
pub use backend::{Backend, CpuBackend};
pub use config::RuntimeConfig;
pub use dispatch::{BackendId, BackendPlan, Dispatch};
pub use dtype::DType;
pub use error::AdError;
pub use events::{Event, EventLog};
pub use exec::{CancelToken, ExecOptions, ExecStats, Execution, NodeState, RequestId};
pub use graph::{Graph, Node, NodeId, Region, Tape, VarType, Variable};
pub use ops::Op;
pub use runtime::{Gradients, Runtime};
pub use scalar::Scalar;
pub use storage::{MemoryPool, PoolStats};
pub use tensor::Tensor;
