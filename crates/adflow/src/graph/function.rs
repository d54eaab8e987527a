//! Function graphs.
//!
//! A [`Graph`] is a recorded function body. Leaf functions read only their
//! parameters and constants; closures additionally read captured outer
//! variables through placeholders, in a fixed slot order that the gradient
//! transform uses to unpack free-variable gradients.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::node::Node;
use super::tape::Tape;
use super::variable::{VarId, Variable};
use crate::error::AdError;

/// Unique identifier for a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphId(u64);

impl GraphId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

/// One captured free variable of a closure.
#[derive(Debug, Clone)]
pub struct Capture {
    /// Variable of the enclosing scope.
    pub outer: Variable,
    /// Placeholder read by the closure body.
    pub inner: Variable,
}

/// What kind of function a graph is.
#[derive(Debug, Clone, Default)]
pub enum GraphKind {
    /// No free variables.
    #[default]
    Function,
    /// Free variables in capture order.
    Closure { captures: Vec<Capture> },
}

/// A recorded function body.
pub struct Graph {
    id: GraphId,
    name: String,
    params: Vec<Variable>,
    kind: GraphKind,
    nodes: Vec<Arc<Node>>,
    outputs: Vec<Variable>,
}

impl Graph {
    pub(crate) fn new(
        name: impl Into<String>,
        params: Vec<Variable>,
        kind: GraphKind,
        nodes: Vec<Arc<Node>>,
        outputs: Vec<Variable>,
    ) -> Self {
        Self {
            id: GraphId::fresh(),
            name: name.into(),
            params,
            kind,
            nodes,
            outputs,
        }
    }

    /// Extract the computation of `outputs` from an eager tape as a function
    /// of `wrt`.
    ///
    /// Every node between `wrt` and `outputs` is included; other leaves and
    /// evaluated values the computation reads become constants.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InvalidOperation` if `wrt` contains duplicates, or if
    /// the computation reads a variable that is neither produced on `tape`,
    /// listed in `wrt`, nor has a value.
    pub fn from_tape(
        tape: &Tape,
        outputs: &[Variable],
        wrt: &[Variable],
    ) -> Result<Arc<Graph>, AdError> {
        let params: HashSet<VarId> = wrt.iter().map(Variable::id).collect();
        if params.len() != wrt.len() {
            return Err(AdError::InvalidOperation(
                "differentiation variables must be distinct".into(),
            ));
        }
        let nodes = tape.ancestors(outputs, |v| params.contains(&v.id()));

        let produced: HashSet<VarId> = nodes
            .iter()
            .flat_map(|n| n.outputs().iter().map(Variable::id))
            .collect();
        let readable = |v: &Variable| {
            produced.contains(&v.id()) || params.contains(&v.id()) || v.has_value()
        };
        for var in nodes.iter().flat_map(|n| n.inputs().iter()).chain(outputs) {
            if !readable(var) {
                return Err(AdError::InvalidOperation(format!(
                    "{} has no value and is not produced on this tape",
                    var.id()
                )));
            }
        }

        Ok(Arc::new(Graph::new(
            "tape",
            wrt.to_vec(),
            GraphKind::Function,
            nodes,
            outputs.to_vec(),
        )))
    }

    pub fn id(&self) -> GraphId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Variable] {
        &self.params
    }

    pub fn kind(&self) -> &GraphKind {
        &self.kind
    }

    /// Captured free variables in slot order (empty for leaf functions).
    pub fn captures(&self) -> &[Capture] {
        match &self.kind {
            GraphKind::Function => &[],
            GraphKind::Closure { captures } => captures,
        }
    }

    pub fn is_closure(&self) -> bool {
        matches!(self.kind, GraphKind::Closure { .. })
    }

    /// Body nodes in recording order.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn outputs(&self) -> &[Variable] {
        &self.outputs
    }
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("params", &self.params.len())
            .field("captures", &self.captures().len())
            .field("nodes", &self.nodes.len())
            .field("outputs", &self.outputs.len())
            .finish()
    }
}
