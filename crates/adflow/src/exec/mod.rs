//! Dataflow execution of closed regions.
//!
//! ```text
//! Region ──lower──► Program (tasks + slots, calls inlined per scope)
//!        ──start──► tasks with every operand published are spawned
//!                   run plan → publish output once → wake waiters
//!                   → spawn consumers that became ready
//!                   → reclaim operands whose last consumer ran
//! ```
//!
//! Workers never block on each other: a task is only handed to the pool
//! once all of its operands exist. Only callers of [`Execution::wait`] and
//! [`Execution::join`] suspend.

mod cancel;
mod execution;
mod lower;

use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use rayon::ThreadPool;

use crate::dispatch::Dispatch;
use crate::events::EventLog;
use crate::graph::Variable;
use crate::tensor::Tensor;

pub use cancel::CancelToken;
pub use execution::{ExecStats, Execution, NodeState};
pub(crate) use lower::{ROOT_SCOPE, ScopeId};

/// Identifier of one evaluation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(u64);

impl RequestId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// What an execution should keep and how it can be stopped.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Values the caller will read; never reclaimed by the request.
    pub requested: Vec<Variable>,
    /// Keep every value some node flagged as needed for backward.
    pub retain_for_backward: bool,
    pub cancel: Option<CancelToken>,
    /// Values for graph parameters and capture placeholders.
    pub bindings: Vec<(Variable, Arc<Tensor>)>,
}

impl ExecOptions {
    pub fn requesting(vars: &[Variable]) -> Self {
        Self {
            requested: vars.to_vec(),
            ..Self::default()
        }
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Shared machinery an execution runs on.
#[derive(Clone)]
pub(crate) struct Engine {
    pub pool: Arc<ThreadPool>,
    pub dispatch: Arc<Dispatch>,
    pub events: Option<Arc<EventLog>>,
    pub inplace: bool,
    /// Requests started on this engine, drained at shutdown.
    pub live: Arc<Mutex<Vec<Weak<execution::ExecShared>>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("threads", &self.pool.current_num_threads())
            .field("dispatch", &self.dispatch)
            .field("events", &self.events.is_some())
            .field("inplace", &self.inplace)
            .finish()
    }
}
