//! Variable handles.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use super::node::NodeId;
use crate::dispatch::BackendId;
use crate::dtype::DType;
use crate::tensor::Tensor;

/// Process-unique identifier of a logical value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the internal index.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Shape and dtype of a graph parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VarType {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl VarType {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }
}

/// Where a variable's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Supplied by the caller with a concrete value.
    Leaf,
    /// Result `index` of a recorded node.
    Output { node: NodeId, index: usize },
    /// Parameter `index` of a graph.
    Param { index: usize },
    /// Capture slot of a closure.
    Capture { slot: usize },
}

struct VariableInner {
    id: VarId,
    shape: Vec<usize>,
    dtype: DType,
    requires_grad: bool,
    backend: BackendId,
    origin: Origin,
    value: OnceLock<Arc<Tensor>>,
}

/// Handle to one logical value.
///
/// Cloning is cheap and yields the same variable; every node consuming the
/// value shares it. A variable either has a concrete value (leaves, and
/// outputs that were demanded by an evaluation) or is produced by a node.
#[derive(Clone)]
pub struct Variable(Arc<VariableInner>);

impl Variable {
    fn build(
        shape: Vec<usize>,
        dtype: DType,
        requires_grad: bool,
        backend: BackendId,
        origin: Origin,
    ) -> Self {
        Self(Arc::new(VariableInner {
            id: VarId::fresh(),
            shape,
            dtype,
            requires_grad,
            backend,
            origin,
            value: OnceLock::new(),
        }))
    }

    /// Create a leaf holding `tensor`, bound to `backend`.
    pub fn leaf(tensor: Tensor, requires_grad: bool, backend: BackendId) -> Self {
        Self::from_shared(Arc::new(tensor), requires_grad, backend)
    }

    /// Create a leaf around an already shared tensor.
    pub fn from_shared(tensor: Arc<Tensor>, requires_grad: bool, backend: BackendId) -> Self {
        let var = Self::build(
            tensor.shape().to_vec(),
            tensor.dtype(),
            requires_grad,
            backend,
            Origin::Leaf,
        );
        let _ = var.0.value.set(tensor);
        var
    }

    pub(crate) fn output(
        shape: Vec<usize>,
        dtype: DType,
        requires_grad: bool,
        backend: BackendId,
        node: NodeId,
        index: usize,
    ) -> Self {
        Self::build(shape, dtype, requires_grad, backend, Origin::Output { node, index })
    }

    pub(crate) fn placeholder(ty: &VarType, backend: BackendId, origin: Origin) -> Self {
        Self::build(ty.shape.clone(), ty.dtype, true, backend, origin)
    }

    pub fn id(&self) -> VarId {
        self.0.id
    }

    pub fn shape(&self) -> &[usize] {
        &self.0.shape
    }

    pub fn dtype(&self) -> DType {
        self.0.dtype
    }

    pub fn var_type(&self) -> VarType {
        VarType::new(&self.0.shape, self.0.dtype)
    }

    pub fn requires_grad(&self) -> bool {
        self.0.requires_grad
    }

    pub fn backend(&self) -> BackendId {
        self.0.backend
    }

    pub fn origin(&self) -> Origin {
        self.0.origin
    }

    /// Producing node and result index, for node outputs.
    pub fn producer(&self) -> Option<(NodeId, usize)> {
        match self.0.origin {
            Origin::Output { node, index } => Some((node, index)),
            _ => None,
        }
    }

    /// Concrete value, if known.
    pub fn value(&self) -> Option<&Arc<Tensor>> {
        self.0.value.get()
    }

    pub fn has_value(&self) -> bool {
        self.0.value.get().is_some()
    }

    /// Cache an evaluated value. The first cached value wins.
    pub(crate) fn cache(&self, value: Arc<Tensor>) {
        let _ = self.0.value.set(value);
    }

    /// Whether both handles refer to the same variable.
    pub fn same(&self, other: &Variable) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Variable {}

impl Hash for Variable {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.0.id)
            .field("shape", &self.0.shape)
            .field("dtype", &self.0.dtype)
            .field("requires_grad", &self.0.requires_grad)
            .field("origin", &self.0.origin)
            .field("has_value", &self.has_value())
            .finish()
    }
}
