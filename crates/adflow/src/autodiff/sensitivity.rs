//! Per-scope sensitivity accumulators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::AdError;
use crate::graph::{Tape, VarId, Variable};

/// Counters shared by every sensitivity map of one backward pass.
#[derive(Debug, Default)]
pub(crate) struct GradCounters {
    accumulators: AtomicUsize,
    zero_fills: AtomicUsize,
}

impl GradCounters {
    pub fn zero_filled(&self) {
        self.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GradStats {
        GradStats {
            accumulators: self.accumulators.load(Ordering::Relaxed),
            zero_fills: self.zero_fills.load(Ordering::Relaxed),
        }
    }
}

/// What a backward pass materialized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GradStats {
    /// Sensitivity accumulators created (one per variable that received a
    /// contribution, per graph scope).
    pub accumulators: usize,
    /// Zero tensors recorded for requested gradients with no contribution.
    pub zero_fills: usize,
}

/// Sensitivities of the variables of one graph scope.
///
/// An accumulator exists only once its variable received a contribution;
/// the first contribution is stored as is.
pub(crate) struct SensitivityMap<'c> {
    entries: Mutex<HashMap<VarId, Variable>>,
    counters: &'c GradCounters,
}

impl<'c> SensitivityMap<'c> {
    pub fn new(counters: &'c GradCounters) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            counters,
        }
    }

    /// Add `grad` into the sensitivity of `var`.
    pub fn accumulate(
        &self,
        tape: &mut Tape,
        var: &Variable,
        grad: Variable,
    ) -> Result<(), AdError> {
        if grad.shape() != var.shape() {
            return Err(AdError::shape(
                "accumulate",
                format!(
                    "sensitivity of {} is {:?}, expected {:?}",
                    var.id(),
                    grad.shape(),
                    var.shape()
                ),
            ));
        }
        let mut entries = self.entries.lock();
        match entries.remove(&var.id()) {
            Some(prev) => {
                let sum = tape.add(&prev, &grad)?;
                entries.insert(var.id(), sum);
            }
            None => {
                self.counters.accumulators.fetch_add(1, Ordering::Relaxed);
                entries.insert(var.id(), grad);
            }
        }
        Ok(())
    }

    pub fn get(&self, var: &Variable) -> Option<Variable> {
        self.entries.lock().get(&var.id()).cloned()
    }

    pub fn take(&self, var: &Variable) -> Option<Variable> {
        self.entries.lock().remove(&var.id())
    }

    pub fn contains(&self, var: &Variable) -> bool {
        self.entries.lock().contains_key(&var.id())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::CpuBackend;
    use crate::dispatch::Dispatch;
    use crate::dtype::DType;
    use crate::tensor::Tensor;

    #[test]
    fn test_first_write_is_stored_directly() {
        let dispatch = Dispatch::new(vec![Arc::new(CpuBackend::new("cpu"))]).unwrap();
        let mut tape = Tape::new(Arc::new(dispatch));
        let x = tape.leaf(Tensor::zeros(&[2], DType::F64), true);
        let unused = tape.leaf(Tensor::zeros(&[2], DType::F64), true);
        let g = tape.leaf(Tensor::ones(&[2], DType::F64), false);

        let counters = GradCounters::default();
        let map = SensitivityMap::new(&counters);
        map.accumulate(&mut tape, &x, g.clone()).unwrap();
        assert_eq!(map.get(&x), Some(g.clone()));
        assert!(tape.is_empty());

        map.accumulate(&mut tape, &x, g.clone()).unwrap();
        assert_eq!(tape.len(), 1);
        assert!(!map.contains(&unused));
        assert_eq!(counters.snapshot().accumulators, 1);
    }

    #[test]
    fn test_shape_mismatch() {
        let dispatch = Dispatch::new(vec![Arc::new(CpuBackend::new("cpu"))]).unwrap();
        let mut tape = Tape::new(Arc::new(dispatch));
        let x = tape.leaf(Tensor::zeros(&[2], DType::F64), true);
        let g = tape.leaf(Tensor::ones(&[3], DType::F64), false);
        let counters = GradCounters::default();
        let map = SensitivityMap::new(&counters);
        assert!(map.accumulate(&mut tape, &x, g).is_err());
    }
}
