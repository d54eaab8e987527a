//! Process-scoped engine state.
//!
//! A [`Runtime`] owns the worker pool, the backend registry (and through it
//! the memory pools) and the optional event log. Tapes and executions are
//! created from it; nothing is global.

use std::sync::Arc;

use crate::autodiff::forward;
use crate::autodiff::{GradCounters, GradStats};
use crate::backend::{Backend, CpuBackend};
use crate::config::RuntimeConfig;
use crate::dispatch::Dispatch;
use crate::error::AdError;
use crate::events::EventLog;
use crate::exec::{Engine, ExecOptions, Execution, RequestId};
use crate::graph::{Graph, Region, Tape, Variable};
use crate::tensor::Tensor;

/// Gradients returned by [`Runtime::grad`].
#[derive(Debug)]
pub struct Gradients {
    values: Vec<Arc<Tensor>>,
    stats: GradStats,
    forward_request: RequestId,
    backward_request: Option<RequestId>,
}

impl Gradients {
    /// Gradient of the `i`-th differentiation variable.
    pub fn get(&self, i: usize) -> Option<&Arc<Tensor>> {
        self.values.get(i)
    }

    pub fn values(&self) -> &[Arc<Tensor>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Arc<Tensor>> {
        self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn stats(&self) -> GradStats {
        self.stats
    }

    /// Request that ran the forward pass.
    pub fn forward_request(&self) -> RequestId {
        self.forward_request
    }

    /// Request that ran the backward pass, if anything had to run.
    pub fn backward_request(&self) -> Option<RequestId> {
        self.backward_request
    }
}

/// Worker pool, backends and event log shared by all tapes built from it.
#[derive(Debug)]
pub struct Runtime {
    engine: Engine,
    config: RuntimeConfig,
}

impl Runtime {
    /// Runtime with a single CPU backend named `cpu`.
    pub fn new(config: RuntimeConfig) -> Result<Self, AdError> {
        let cpu = CpuBackend::new("cpu").with_pool_limit(config.pool_limit);
        Self::with_backends(config, vec![Arc::new(cpu)])
    }

    /// Runtime over an explicit backend registry. The first backend is the
    /// default binding of new leaves.
    ///
    /// # Errors
    ///
    /// Returns `AdError::InvalidOperation` if `backends` is empty or the
    /// worker pool cannot be started.
    pub fn with_backends(
        config: RuntimeConfig,
        backends: Vec<Arc<dyn Backend>>,
    ) -> Result<Self, AdError> {
        let dispatch = Dispatch::new(backends)?;
        let events = config.record_events.then(|| Arc::new(EventLog::new()));
        if let Some(log) = &events {
            for backend in dispatch.backends() {
                backend.pool().attach_event_log(log.clone());
            }
        }

        let mut builder =
            rayon::ThreadPoolBuilder::new().thread_name(|i| format!("adflow-worker-{}", i));
        if let Some(n) = config.num_threads {
            builder = builder.num_threads(n);
        }
        let pool = builder
            .build()
            .map_err(|e| AdError::InvalidOperation(format!("cannot start worker pool: {}", e)))?;
        tracing::debug!(
            threads = pool.current_num_threads(),
            backends = dispatch.backends().len(),
            inplace = config.inplace,
            "runtime started"
        );

        Ok(Self {
            engine: Engine {
                pool: Arc::new(pool),
                dispatch: Arc::new(dispatch),
                events,
                inplace: config.inplace,
                live: Arc::default(),
            },
            config,
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn dispatch(&self) -> &Arc<Dispatch> {
        &self.engine.dispatch
    }

    /// Event log, if enabled.
    pub fn events(&self) -> Option<&Arc<EventLog>> {
        self.engine.events.as_ref()
    }

    pub fn num_threads(&self) -> usize {
        self.engine.pool.current_num_threads()
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Fresh tape recording against this runtime's backends.
    pub fn tape(&self) -> Tape {
        Tape::new(self.engine.dispatch.clone())
    }

    /// Start executing `region`. Returns immediately.
    pub fn execute(&self, region: &Region, options: ExecOptions) -> Result<Execution, AdError> {
        Execution::start(&self.engine, region, options)
    }

    /// Close the pending region of `tape`, run it together with whatever
    /// `outputs` still need, and return the values of `outputs`.
    ///
    /// Demanded values are cached on their variables. Intermediates are
    /// reclaimed; evaluating one later recomputes it from its producers.
    pub fn evaluate(
        &self,
        tape: &mut Tape,
        outputs: &[Variable],
    ) -> Result<Vec<Arc<Tensor>>, AdError> {
        self.evaluate_request(tape, outputs).map(|(values, _)| values)
    }

    fn evaluate_request(
        &self,
        tape: &mut Tape,
        outputs: &[Variable],
    ) -> Result<(Vec<Arc<Tensor>>, Option<RequestId>), AdError> {
        let pending = tape.close();
        let roots: Vec<Variable> = outputs
            .iter()
            .cloned()
            .chain(pending.nodes().iter().flat_map(|n| n.outputs().iter().cloned()))
            .collect();
        let nodes = tape.ancestors(&roots, Variable::has_value);
        let cached = |v: &Variable| {
            v.value().cloned().ok_or_else(|| {
                AdError::InvalidOperation(format!("{} is not produced on this tape", v.id()))
            })
        };
        if nodes.is_empty() {
            let values = outputs.iter().map(cached).collect::<Result<Vec<_>, _>>()?;
            return Ok((values, None));
        }

        let missing: Vec<Variable> = outputs.iter().filter(|v| !v.has_value()).cloned().collect();
        let region = Region::from_nodes(nodes)?;
        let exec = self.execute(&region, ExecOptions::requesting(&missing))?;
        exec.join()?;
        let values = outputs
            .iter()
            .map(|v| {
                if v.has_value() {
                    return cached(v);
                }
                let value = exec.wait(v)?;
                v.cache(value.clone());
                Ok(value)
            })
            .collect::<Result<Vec<_>, AdError>>()?;
        tracing::debug!(
            request = %exec.request_id(),
            tasks = region.len(),
            stats = ?exec.stats(),
            "evaluated"
        );
        Ok((values, Some(exec.request_id())))
    }

    /// Gradient of `output` with respect to each of `wrt`.
    ///
    /// `sens` is the output sensitivity (ones when `None`). Variables that
    /// `output` does not depend on get a zero gradient.
    ///
    /// # Errors
    ///
    /// - `AdError::InvalidOperation` if a variable of `wrt` does not require
    ///   a gradient or has no value.
    /// - `AdError::Shape` if `sens` does not match `output`.
    pub fn grad(
        &self,
        tape: &mut Tape,
        output: &Variable,
        wrt: &[Variable],
        sens: Option<Tensor>,
    ) -> Result<Gradients, AdError> {
        let args = wrt
            .iter()
            .map(|v| {
                if !v.requires_grad() {
                    return Err(AdError::InvalidOperation(format!(
                        "{} does not require a gradient",
                        v.id()
                    )));
                }
                v.value().cloned().ok_or_else(|| {
                    AdError::InvalidOperation(format!(
                        "{} needs a value to differentiate against",
                        v.id()
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let seed = match sens {
            Some(t) if t.shape() != output.shape() || t.dtype() != output.dtype() => {
                return Err(AdError::shape(
                    "grad",
                    format!(
                        "sensitivity is {:?} {}, output is {:?} {}",
                        t.shape(),
                        t.dtype(),
                        output.shape(),
                        output.dtype()
                    ),
                ));
            }
            Some(t) => t,
            None => Tensor::ones(output.shape(), output.dtype()),
        };

        let graph = Graph::from_tape(tape, std::slice::from_ref(output), wrt)?;
        let fwd = forward::run(&self.engine, &graph, &args, None)?;
        if let Some(value) = fwd.outputs.first() {
            output.cache(value.clone());
        }

        let mut backward = self.tape();
        let seed = Variable::leaf(seed, false, output.backend());
        let counters = GradCounters::default();
        let pullback = fwd.backprop.record_graph(&mut backward, &counters, &[Some(seed)])?;
        let grads = pullback
            .inputs
            .into_iter()
            .zip(wrt)
            .map(|(g, v)| match g {
                Some(g) => Ok(g),
                None => {
                    counters.zero_filled();
                    let zero = backward.fill(v.shape(), v.dtype(), 0.0)?;
                    if zero.backend() == v.backend() {
                        Ok(zero)
                    } else {
                        backward.transfer(&zero, v.backend())
                    }
                }
            })
            .collect::<Result<Vec<_>, _>>()?;

        let (values, backward_request) = self.evaluate_request(&mut backward, &grads)?;
        // Forward values retained for backward go back to their pools here.
        drop(fwd.backprop);
        Ok(Gradients {
            values,
            stats: counters.snapshot(),
            forward_request: fwd.request,
            backward_request,
        })
    }

    /// Wait for every request started on this runtime to finish, then drop
    /// the runtime's handle to the worker pool. Failed and cancelled
    /// requests count as finished.
    ///
    /// [`Execution`] handles still held by the caller keep the pool alive
    /// until they are dropped.
    pub fn shutdown(self) {
        let drained = self.engine.drain();
        tracing::debug!(drained, "runtime shut down");
    }
}
