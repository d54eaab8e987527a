//! Backend plan selection.
//!
//! ```text
//! select(op, dtypes, backend)
//!     → cache hit?  return the same Arc<BackendPlan>
//!     → composite?  expand into primitive steps (Op::expand)
//!     → check every step against Backend::supports
//! ```
//!
//! Selection is pure given the registry, so plans are cached and identical
//! keys always yield the identical plan. Keys use the op's signature:
//! `scale(2)` and `scale(3)` share one plan and the scalar is bound when the
//! plan runs.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::backend::Backend;
use crate::dtype::DType;
use crate::error::AdError;
use crate::ops::Op;
use crate::tensor::Tensor;

/// Index of a backend in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct BackendId(usize);

impl BackendId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    /// Get the internal index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Where a plan step reads an operand from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanInput {
    /// The i-th operand of the generic op.
    Operand(usize),
    /// The result of an earlier step.
    Step(usize),
}

/// One backend primitive invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanStep {
    pub op: Op,
    pub inputs: SmallVec<[PlanInput; 2]>,
}

impl PlanStep {
    pub fn new(op: Op, inputs: impl IntoIterator<Item = PlanInput>) -> Self {
        Self {
            op,
            inputs: inputs.into_iter().collect(),
        }
    }
}

/// Lowered form of one generic op on one backend.
#[derive(Debug, PartialEq, Eq)]
pub struct BackendPlan {
    backend: BackendId,
    steps: Vec<PlanStep>,
}

impl BackendPlan {
    pub fn backend(&self) -> BackendId {
        self.backend
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// The single primitive of a one-step plan.
    pub fn single(&self) -> Option<&PlanStep> {
        match self.steps.as_slice() {
            [step] => Some(step),
            _ => None,
        }
    }

    /// Run every step for `op`, drawing each result buffer from the
    /// backend's pool. Steps that carry a scalar take `op`'s.
    ///
    /// `metas` holds the result shape and dtype of each step.
    pub fn execute(
        &self,
        backend: &dyn Backend,
        op: &Op,
        operands: &[&Tensor],
        metas: &[(Vec<usize>, DType)],
    ) -> Result<Tensor, AdError> {
        if metas.len() != self.steps.len() || self.steps.is_empty() {
            return Err(AdError::InternalConsistency(format!(
                "plan with {} steps lowered with {} result types",
                self.steps.len(),
                metas.len()
            )));
        }
        let mut results: Vec<Tensor> = Vec::with_capacity(self.steps.len());
        for (step, (shape, dtype)) in self.steps.iter().zip(metas) {
            let inputs = step
                .inputs
                .iter()
                .map(|input| match *input {
                    PlanInput::Operand(i) => operands.get(i).copied(),
                    PlanInput::Step(j) => results.get(j),
                })
                .collect::<Option<Vec<&Tensor>>>()
                .ok_or_else(|| {
                    AdError::InternalConsistency(format!("dangling operand in {} plan", step.op))
                })?;
            let step_op = match (step.op.scalar(), op.scalar()) {
                (Some(_), Some(value)) => Cow::Owned(step.op.with_scalar(value)),
                _ => Cow::Borrowed(&step.op),
            };
            let mut out = Tensor::uninit_in(backend.pool(), shape, *dtype)?;
            backend.apply(&step_op, &inputs, &mut out)?;
            results.push(out);
        }
        results.pop().ok_or_else(|| {
            AdError::InternalConsistency("plan produced no result".into())
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PlanKey {
    op: Op,
    dtypes: SmallVec<[DType; 2]>,
    backend: BackendId,
}

/// Backend registry and plan cache.
pub struct Dispatch {
    backends: Vec<Arc<dyn Backend>>,
    cache: Mutex<HashMap<PlanKey, Arc<BackendPlan>>>,
}

impl Dispatch {
    /// Create a registry. The first backend is the default binding.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InvalidOperation` if `backends` is empty.
    pub fn new(backends: Vec<Arc<dyn Backend>>) -> Result<Self, AdError> {
        if backends.is_empty() {
            return Err(AdError::InvalidOperation(
                "dispatch needs at least one backend".into(),
            ));
        }
        Ok(Self {
            backends,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Backend used for new leaves unless another is chosen.
    pub fn default_backend(&self) -> BackendId {
        BackendId(0)
    }

    pub fn backends(&self) -> &[Arc<dyn Backend>] {
        &self.backends
    }

    /// Look up a backend by id.
    pub fn backend(&self, id: BackendId) -> Result<&Arc<dyn Backend>, AdError> {
        self.backends
            .get(id.0)
            .ok_or_else(|| AdError::InvalidOperation(format!("no backend with id {}", id.0)))
    }

    /// Look up a backend id by name.
    pub fn find(&self, name: &str) -> Option<BackendId> {
        self.backends
            .iter()
            .position(|b| b.name() == name)
            .map(BackendId)
    }

    /// Number of distinct plans selected so far.
    pub fn cached_plans(&self) -> usize {
        self.cache.lock().len()
    }

    /// Select the plan for `op` on `backend` with the given operand dtypes.
    ///
    /// # Errors
    ///
    /// - `AdError::UnsupportedOperation` for mixed operand dtypes (other than
    ///   `cast`) or dtypes the backend does not implement.
    /// - `AdError::InvalidOperation` for calls (which are inlined, not
    ///   dispatched) and unknown backends.
    pub fn select(
        &self,
        op: &Op,
        dtypes: &[DType],
        backend: BackendId,
    ) -> Result<Arc<BackendPlan>, AdError> {
        if matches!(op, Op::Call(_)) {
            return Err(AdError::InvalidOperation(
                "graph calls are inlined by the scheduler, not dispatched".into(),
            ));
        }
        let signature = op.signature();
        let key = PlanKey {
            op: signature.clone(),
            dtypes: dtypes.iter().copied().collect(),
            backend,
        };
        if let Some(plan) = self.cache.lock().get(&key) {
            return Ok(plan.clone());
        }

        let target = self.backend(backend)?;
        let unsupported = || AdError::UnsupportedOperation {
            op: op.name().into(),
            dtypes: dtypes.to_vec(),
            backend: target.name().into(),
        };

        let element = match op {
            Op::Fill { dtype, .. } => *dtype,
            _ => *dtypes.first().ok_or_else(unsupported)?,
        };
        if dtypes.iter().any(|&d| d != element) {
            return Err(unsupported());
        }

        let steps = signature.expand().unwrap_or_else(|| {
            vec![PlanStep::new(
                signature.clone(),
                (0..dtypes.len()).map(PlanInput::Operand),
            )]
        });
        if !steps.iter().all(|step| target.supports(&step.op, element)) {
            tracing::debug!(op = %op, backend = target.name(), ?dtypes, "no plan");
            return Err(unsupported());
        }

        let plan = Arc::new(BackendPlan { backend, steps });
        tracing::debug!(
            op = %op,
            backend = target.name(),
            steps = plan.steps.len(),
            "plan selected"
        );
        // Another thread may have raced us; keep whichever plan landed first.
        Ok(self.cache.lock().entry(key).or_insert(plan).clone())
    }
}

impl fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatch")
            .field(
                "backends",
                &self.backends.iter().map(|b| b.name()).collect::<Vec<_>>(),
            )
            .field("cached_plans", &self.cached_plans())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;

    fn dispatch() -> Dispatch {
        Dispatch::new(vec![
            Arc::new(CpuBackend::new("cpu")),
            Arc::new(CpuBackend::with_dtypes("cpu-f64", &[DType::F64])),
        ])
        .unwrap()
    }

    #[test]
    fn test_identical_keys_share_plan() {
        let d = dispatch();
        let a = d.select(&Op::Add, &[DType::F64, DType::F64], BackendId(0)).unwrap();
        let b = d.select(&Op::Add, &[DType::F64, DType::F64], BackendId(0)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(d.cached_plans(), 1);
    }

    #[test]
    fn test_composite_expands() {
        let d = dispatch();
        let plan = d.select(&Op::Sub, &[DType::F32, DType::F32], BackendId(0)).unwrap();
        assert_eq!(plan.steps().len(), 2);
        assert_eq!(plan.steps()[0].op, Op::Neg);
        assert_eq!(plan.steps()[1].op, Op::Add);
        assert!(plan.single().is_none());
    }

    #[test]
    fn test_mixed_dtypes_unsupported() {
        let d = dispatch();
        let err = d
            .select(&Op::Mul, &[DType::F32, DType::F64], BackendId(0))
            .unwrap_err();
        assert!(matches!(err, AdError::UnsupportedOperation { .. }));
    }

    #[test]
    fn test_cast_allows_dtype_change() {
        let d = dispatch();
        assert!(d.select(&Op::Cast(DType::F32), &[DType::F64], BackendId(0)).is_ok());
    }

    #[test]
    fn test_restricted_backend() {
        let d = dispatch();
        let id = d.find("cpu-f64").unwrap();
        assert!(d.select(&Op::Exp, &[DType::F64], id).is_ok());
        let err = d.select(&Op::Exp, &[DType::F32], id).unwrap_err();
        assert_eq!(
            err,
            AdError::UnsupportedOperation {
                op: "exp".into(),
                dtypes: vec![DType::F32],
                backend: "cpu-f64".into(),
            }
        );
    }

    #[test]
    fn test_fill_has_no_operands() {
        let d = dispatch();
        let op = Op::Fill {
            shape: vec![2],
            dtype: DType::F64,
            value: 1.0,
        };
        let plan = d.select(&op, &[], BackendId(0)).unwrap();
        assert!(plan.single().unwrap().inputs.is_empty());
    }

    #[test]
    fn test_execute_multi_step_plan() {
        let d = dispatch();
        let plan = d.select(&Op::Axpy(2.0), &[DType::F64, DType::F64], BackendId(0)).unwrap();
        let x = Tensor::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
        let y = Tensor::from_vec(vec![10.0f64, 20.0], &[2]).unwrap();
        let metas = vec![(vec![2], DType::F64), (vec![2], DType::F64)];
        let backend = d.backend(BackendId(0)).unwrap();
        let out = plan
            .execute(backend.as_ref(), &Op::Axpy(2.0), &[&x, &y], &metas)
            .unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![12.0, 24.0]);
    }

    #[test]
    fn test_scalar_ops_share_plan() {
        let d = dispatch();
        let plans: Vec<_> = (0..100)
            .map(|k| d.select(&Op::Scale(k as f64), &[DType::F64], BackendId(0)).unwrap())
            .collect();
        assert!(plans.iter().all(|p| Arc::ptr_eq(p, &plans[0])));
        for value in [0.5, 1.5] {
            let fill = Op::Fill {
                shape: vec![3],
                dtype: DType::F64,
                value,
            };
            d.select(&fill, &[], BackendId(0)).unwrap();
        }
        assert_eq!(d.cached_plans(), 2);

        // The scalar comes from the op the plan runs for.
        let x = Tensor::from_vec(vec![1.0f64, -2.0], &[2]).unwrap();
        let backend = d.backend(BackendId(0)).unwrap();
        let metas = vec![(vec![2], DType::F64)];
        let out = plans[0]
            .execute(backend.as_ref(), &Op::Scale(3.0), &[&x], &metas)
            .unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![3.0, -6.0]);
        let out = plans[0]
            .execute(backend.as_ref(), &Op::Scale(-1.0), &[&x], &metas)
            .unwrap();
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![-1.0, 2.0]);
    }

    #[test]
    fn test_unknown_backend() {
        let d = dispatch();
        assert!(matches!(
            d.select(&Op::Neg, &[DType::F64], BackendId(9)),
            Err(AdError::InvalidOperation(_))
        ));
    }
}
