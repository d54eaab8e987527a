//! Recorded nodes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

use super::variable::Variable;
use crate::dispatch::BackendId;
use crate::error::AdError;
use crate::ops::{Op, SaveFlags};
use crate::shape::{self, Meta};

/// Unique identifier for a recorded node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    pub(crate) fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// One recorded operation. Immutable once recorded.
#[derive(Debug)]
pub struct Node {
    id: NodeId,
    op: Op,
    inputs: SmallVec<[Variable; 2]>,
    outputs: SmallVec<[Variable; 1]>,
    flags: SaveFlags,
    backend: BackendId,
}

impl Node {
    pub(crate) fn new(
        id: NodeId,
        op: Op,
        inputs: SmallVec<[Variable; 2]>,
        outputs: SmallVec<[Variable; 1]>,
        flags: SaveFlags,
        backend: BackendId,
    ) -> Self {
        Self {
            id,
            op,
            inputs,
            outputs,
            flags,
            backend,
        }
    }

    /// Build a replacement node for a rewritten region.
    ///
    /// The outputs are kept as given so that consumers outside the region
    /// still see them; their shapes and dtypes must match what `op` produces
    /// from `inputs`. Retention flags are recomputed.
    pub fn rewrite(op: Op, inputs: Vec<Variable>, output: Variable) -> Result<Node, AdError> {
        let metas: Vec<Meta<'_>> = inputs.iter().map(|v| (v.shape(), v.dtype())).collect();
        let (shape, dtype) = shape::infer(&op, &metas)?;
        if shape != output.shape() || dtype != output.dtype() {
            return Err(AdError::shape(
                op.name(),
                format!(
                    "rewritten node yields {:?} {} but its output is {:?} {}",
                    shape,
                    dtype,
                    output.shape(),
                    output.dtype()
                ),
            ));
        }
        let requires: Vec<bool> = inputs.iter().map(|v| v.requires_grad()).collect();
        let flags = op.saves(&requires);
        let backend = output.backend();
        Ok(Node {
            id: NodeId::fresh(),
            op,
            inputs: inputs.into(),
            outputs: SmallVec::from_elem(output, 1),
            flags,
            backend,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn op(&self) -> &Op {
        &self.op
    }

    pub fn inputs(&self) -> &[Variable] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }

    /// Backend that executes the node.
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn flags(&self) -> &SaveFlags {
        &self.flags
    }

    /// `needs_input_for_backward` of input `i`.
    pub fn needs_input_for_backward(&self, i: usize) -> bool {
        self.flags.inputs.get(i).copied().unwrap_or(false)
    }

    /// `needs_output_for_backward` of output `i`.
    pub fn needs_output_for_backward(&self, i: usize) -> bool {
        self.flags.outputs.get(i).copied().unwrap_or(false)
    }
}
