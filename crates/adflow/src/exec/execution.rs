//! Running a lowered program on the worker pool.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Condvar, Mutex};

use super::lower::{Program, ScopeId, TaskInfo};
use super::{Engine, ExecOptions, ROOT_SCOPE, RequestId};
use crate::backend::Backend;
use crate::dispatch::PlanInput;
use crate::error::AdError;
use crate::events::Event;
use crate::graph::{NodeId, Region, Variable};
use crate::tensor::Tensor;

/// Lifecycle of one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Waiting for operands.
    Pending,
    /// Handed to the worker pool.
    Ready,
    Running,
    /// Output published.
    Published,
    /// Output dropped by the request after its last consumer ran.
    Reclaimable,
}

enum SlotState {
    Empty,
    Published(Arc<Tensor>),
    Reclaimed,
    Failed(AdError),
}

struct Slot {
    state: Mutex<SlotState>,
    published: Condvar,
    /// Consumers that have not run yet.
    remaining: AtomicUsize,
}

struct Task {
    state: Mutex<NodeState>,
    /// Distinct operand slots not yet published.
    pending: AtomicUsize,
}

#[derive(Default)]
struct Progress {
    /// Tasks that published and released their operands.
    finished: usize,
    /// Spawned tasks whose worker still holds the request.
    in_flight: usize,
}

/// Completion tracking, shared separately so that a worker can drop its
/// handle to the request before waking joiners.
#[derive(Default)]
struct Completion {
    progress: Mutex<Progress>,
    done: Condvar,
}

/// Counters of one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStats {
    pub tasks: usize,
    /// Tasks that ran a kernel.
    pub tasks_run: usize,
    /// Tasks that wrote into an operand's buffer.
    pub inplace_reuses: usize,
    /// Slots dropped after their last consumer.
    pub reclaimed: usize,
}

pub(crate) struct ExecShared {
    request: RequestId,
    program: Program,
    slots: Vec<Slot>,
    tasks: Vec<Task>,
    engine: Engine,
    abort: OnceLock<AdError>,
    completion: Arc<Completion>,
    tasks_run: AtomicUsize,
    inplace_reuses: AtomicUsize,
    reclaimed: AtomicUsize,
}

impl ExecShared {
    fn new(engine: &Engine, program: Program) -> Self {
        let slots = program
            .slots
            .iter()
            .map(|info| Slot {
                state: Mutex::new(match &info.external {
                    Some(value) => SlotState::Published(value.clone()),
                    None => SlotState::Empty,
                }),
                published: Condvar::new(),
                remaining: AtomicUsize::new(info.consumers.len()),
            })
            .collect();
        let tasks = program
            .tasks
            .iter()
            .map(|info| Task {
                state: Mutex::new(NodeState::Pending),
                pending: AtomicUsize::new(
                    info.distinct_inputs()
                        .into_iter()
                        .filter(|&s| program.slots[s].external.is_none())
                        .count(),
                ),
            })
            .collect();
        Self {
            request: RequestId::fresh(),
            program,
            slots,
            tasks,
            engine: engine.clone(),
            abort: OnceLock::new(),
            completion: Arc::default(),
            tasks_run: AtomicUsize::new(0),
            inplace_reuses: AtomicUsize::new(0),
            reclaimed: AtomicUsize::new(0),
        }
    }

    fn record(&self, event: Event) {
        if let Some(log) = &self.engine.events {
            log.record(event);
        }
    }

    fn set_state(&self, task: usize, state: NodeState) {
        *self.tasks[task].state.lock() = state;
    }

    fn spawn(self: &Arc<Self>, task: usize) {
        self.completion.progress.lock().in_flight += 1;
        self.set_state(task, NodeState::Ready);
        let this = Arc::clone(self);
        self.engine.pool.spawn(move || this.run(task));
    }

    fn run(self: Arc<Self>, task: usize) {
        if self.begin(task) {
            match self.execute(task) {
                Ok((value, consumed)) => self.complete(task, value, consumed),
                Err(err) => {
                    let node = &self.program.tasks[task].node;
                    if err.is_fatal() {
                        tracing::error!(request = %self.request, node = %node.id(), %err, "task failed");
                    } else {
                        tracing::warn!(request = %self.request, node = %node.id(), %err, "task failed");
                    }
                    self.abort(err);
                }
            }
        }
        // Values the request still owns are freed with the last handle, which
        // must not outlive join().
        let completion = Arc::clone(&self.completion);
        drop(self);
        let mut progress = completion.progress.lock();
        progress.in_flight -= 1;
        completion.done.notify_all();
    }

    /// Move a ready task to Running unless the request was aborted.
    fn begin(&self, task: usize) -> bool {
        let mut state = self.tasks[task].state.lock();
        if self.abort.get().is_some() {
            return false;
        }
        *state = NodeState::Running;
        true
    }

    fn read(&self, slot: usize) -> Result<Arc<Tensor>, AdError> {
        let var = &self.program.slots[slot].var;
        match &*self.slots[slot].state.lock() {
            SlotState::Published(value) => Ok(value.clone()),
            SlotState::Failed(err) => Err(err.clone()),
            SlotState::Reclaimed => Err(AdError::InternalConsistency(format!(
                "{} was read after it was reclaimed",
                var.id()
            ))),
            SlotState::Empty => Err(AdError::InternalConsistency(format!(
                "{} was read before it was published",
                var.id()
            ))),
        }
    }

    fn execute(&self, task: usize) -> Result<(Tensor, Option<usize>), AdError> {
        let info = &self.program.tasks[task];
        let backend = self.engine.dispatch.backend(info.plan.backend())?.as_ref();
        self.tasks_run.fetch_add(1, Ordering::Relaxed);

        if let Some((index, slot)) = self.reuse_candidate(info) {
            let target = self.take_for_reuse(slot)?;
            let rest = info
                .inputs
                .iter()
                .enumerate()
                .filter(|&(i, _)| i != index)
                .map(|(_, &s)| self.read(s))
                .collect::<Result<Vec<_>, _>>()?;
            let out = self.run_in_place(info, backend, index, target, &rest)?;
            return Ok((out, Some(slot)));
        }

        let operands = info
            .inputs
            .iter()
            .map(|&s| self.read(s))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&Tensor> = operands.iter().map(AsRef::as_ref).collect();
        let out = info.plan.execute(backend, info.node.op(), &refs, &info.metas)?;
        Ok((out, None))
    }

    fn run_in_place(
        &self,
        info: &TaskInfo,
        backend: &dyn Backend,
        index: usize,
        target: Arc<Tensor>,
        rest: &[Arc<Tensor>],
    ) -> Result<Tensor, AdError> {
        let rest: Vec<&Tensor> = rest.iter().map(AsRef::as_ref).collect();
        match Arc::try_unwrap(target) {
            Ok(mut target) => {
                if backend.apply_in_place(info.node.op(), index, &mut target, &rest)? {
                    self.inplace_reuses.fetch_add(1, Ordering::Relaxed);
                    tracing::trace!(request = %self.request, node = %info.node.id(), "ran in place");
                    return Ok(target);
                }
                let mut operands = rest;
                operands.insert(index, &target);
                info.plan.execute(backend, info.node.op(), &operands, &info.metas)
            }
            // Someone outside the request still holds the value.
            Err(shared) => {
                let mut operands = rest;
                operands.insert(index, &shared);
                info.plan.execute(backend, info.node.op(), &operands, &info.metas)
            }
        }
    }

    /// Operand whose buffer the task may overwrite: the task is its last
    /// consumer, the request does not keep it, and it has the output's shape
    /// and dtype. Claims the slot on success.
    fn reuse_candidate(&self, info: &TaskInfo) -> Option<(usize, usize)> {
        if !self.engine.inplace {
            return None;
        }
        let step = info.plan.single()?;
        let direct = step.inputs.len() == info.inputs.len()
            && step
                .inputs
                .iter()
                .enumerate()
                .all(|(k, input)| *input == PlanInput::Operand(k));
        if !step.op.is_elementwise() || !direct {
            return None;
        }
        let (shape, dtype) = info.metas.first()?;
        info.inputs.iter().enumerate().find_map(|(index, &slot)| {
            let meta = &self.program.slots[slot];
            let repeated = info.inputs.iter().filter(|&&s| s == slot).count() > 1;
            if repeated
                || meta.pinned
                || meta.external.is_some()
                || meta.var.shape() != shape.as_slice()
                || meta.var.dtype() != *dtype
            {
                return None;
            }
            self.slots[slot]
                .remaining
                .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| (index, slot))
        })
    }

    fn take_for_reuse(&self, slot: usize) -> Result<Arc<Tensor>, AdError> {
        let value = {
            let mut state = self.slots[slot].state.lock();
            match std::mem::replace(&mut *state, SlotState::Reclaimed) {
                SlotState::Published(value) => value,
                other => {
                    *state = other;
                    drop(state);
                    return self.read(slot);
                }
            }
        };
        self.note_reclaimed(slot);
        Ok(value)
    }

    fn note_reclaimed(&self, slot: usize) {
        let info = &self.program.slots[slot];
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
        self.record(Event::Reclaimed {
            request: self.request,
            var: info.var.id(),
        });
        if let Some(producer) = info.producer {
            self.set_state(producer, NodeState::Reclaimable);
        }
        tracing::trace!(request = %self.request, var = %info.var.id(), "reclaimed");
    }

    /// Drop the request's reference to a slot's value.
    fn reclaim(&self, slot: usize) {
        let value = {
            let mut state = self.slots[slot].state.lock();
            match std::mem::replace(&mut *state, SlotState::Reclaimed) {
                SlotState::Published(value) => value,
                other => {
                    *state = other;
                    return;
                }
            }
        };
        self.note_reclaimed(slot);
        // Returns the buffer to its pool unless someone else holds it.
        drop(value);
    }

    /// Publish a task's output. Returns `false` if the value was discarded.
    pub(crate) fn publish(self: &Arc<Self>, task: usize, value: Tensor) -> bool {
        let info = &self.program.tasks[task];
        let slot = &self.slots[info.output];
        let buffer = value.buffer_id();
        {
            let mut state = slot.state.lock();
            match &*state {
                SlotState::Empty => *state = SlotState::Published(Arc::new(value)),
                SlotState::Failed(_) => return false,
                SlotState::Published(_) | SlotState::Reclaimed => {
                    drop(state);
                    let var = &self.program.slots[info.output].var;
                    tracing::error!(request = %self.request, var = %var.id(), "published twice");
                    self.abort(AdError::InternalConsistency(format!(
                        "{} was published twice",
                        var.id()
                    )));
                    return false;
                }
            }
        }
        slot.published.notify_all();

        self.set_state(task, NodeState::Published);
        self.record(Event::SlotBound {
            request: self.request,
            var: self.program.slots[info.output].var.id(),
            buffer,
        });
        self.record(Event::NodeFinished {
            request: self.request,
            node: info.node.id(),
        });
        tracing::trace!(request = %self.request, node = %info.node.id(), op = %info.node.op(), "published");
        let meta = &self.program.slots[info.output];
        if meta.consumers.is_empty() && !meta.pinned {
            self.reclaim(info.output);
        }
        for &consumer in &meta.consumers {
            let ready = self.tasks[consumer].pending.fetch_sub(1, Ordering::AcqRel) == 1;
            if ready && self.abort.get().is_none() {
                self.spawn(consumer);
            }
        }
        true
    }

    fn complete(self: &Arc<Self>, task: usize, value: Tensor, consumed: Option<usize>) {
        if !self.publish(task, value) {
            return;
        }
        for slot in self.program.tasks[task].distinct_inputs() {
            if Some(slot) == consumed {
                continue;
            }
            let last = self.slots[slot].remaining.fetch_sub(1, Ordering::AcqRel) == 1;
            if last && !self.program.slots[slot].pinned {
                self.reclaim(slot);
            }
        }
        self.completion.progress.lock().finished += 1;
    }

    /// Fail the request. The first error wins.
    pub(crate) fn abort(&self, err: AdError) {
        if self.abort.set(err.clone()).is_err() {
            return;
        }
        match &err {
            AdError::Cancelled => tracing::warn!(request = %self.request, "request cancelled"),
            _ => tracing::debug!(request = %self.request, %err, "request aborted"),
        }
        for slot in &self.slots {
            let mut state = slot.state.lock();
            if matches!(*state, SlotState::Empty) {
                *state = SlotState::Failed(err.clone());
                drop(state);
                slot.published.notify_all();
            }
        }
        let _progress = self.completion.progress.lock();
        self.completion.done.notify_all();
    }

    fn wait_slot(&self, slot: usize) -> Result<Arc<Tensor>, AdError> {
        let var = &self.program.slots[slot].var;
        let slot = &self.slots[slot];
        let mut state = slot.state.lock();
        loop {
            match &*state {
                SlotState::Published(value) => return Ok(value.clone()),
                SlotState::Failed(err) => return Err(err.clone()),
                SlotState::Reclaimed => {
                    return Err(AdError::InternalConsistency(format!(
                        "{} was read after it was reclaimed",
                        var.id()
                    )));
                }
                SlotState::Empty => slot.published.wait(&mut state),
            }
        }
    }
}

impl Engine {
    fn track(&self, shared: &Arc<ExecShared>) {
        let mut live = self.live.lock();
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(shared));
    }

    /// Join every request still alive on this engine. Returns how many
    /// were waited on.
    pub(crate) fn drain(&self) -> usize {
        let live: Vec<Arc<ExecShared>> = self
            .live
            .lock()
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        for shared in &live {
            let exec = Execution {
                shared: Arc::clone(shared),
            };
            if let Err(err) = exec.join() {
                tracing::debug!(request = %shared.request, %err, "drained a failed request");
            }
        }
        live.len()
    }
}

/// Handle to a running evaluation request.
///
/// Dropping the handle does not stop the request; use a [`CancelToken`]
/// for that.
///
/// [`CancelToken`]: super::CancelToken
#[derive(Clone)]
pub struct Execution {
    shared: Arc<ExecShared>,
}

impl Execution {
    /// Lower `region` and start running it. Returns without waiting.
    ///
    /// # Errors
    ///
    /// Lowering errors (unbound variables, missing plans) are returned
    /// before anything runs.
    pub(crate) fn start(
        engine: &Engine,
        region: &Region,
        options: ExecOptions,
    ) -> Result<Execution, AdError> {
        let program = Program::lower(
            &engine.dispatch,
            region.nodes(),
            &options.bindings,
            &options.requested,
            options.retain_for_backward,
        )?;
        let shared = Arc::new(ExecShared::new(engine, program));
        engine.track(&shared);
        tracing::debug!(
            request = %shared.request,
            tasks = shared.tasks.len(),
            slots = shared.slots.len(),
            "execution started"
        );

        if let Some(token) = &options.cancel {
            if !token.register(&shared) {
                shared.abort(AdError::Cancelled);
                return Ok(Execution { shared });
            }
        }
        let ready: Vec<usize> = (0..shared.tasks.len())
            .filter(|&t| shared.tasks[t].pending.load(Ordering::Acquire) == 0)
            .collect();
        for task in ready {
            shared.spawn(task);
        }
        Ok(Execution { shared })
    }

    pub fn request_id(&self) -> RequestId {
        self.shared.request
    }

    /// Block until `var` is published and return its value.
    ///
    /// # Errors
    ///
    /// - The request's failure (`Cancelled`, `Kernel`, ...) if it aborted
    ///   before `var` was published.
    /// - `AdError::InternalConsistency` if `var` was already reclaimed.
    /// - `AdError::InvalidOperation` if `var` is not part of the request.
    pub fn wait(&self, var: &Variable) -> Result<Arc<Tensor>, AdError> {
        let slot = self.slot(ROOT_SCOPE, var).ok_or_else(|| {
            AdError::InvalidOperation(format!(
                "{} is not part of request {}",
                var.id(),
                self.shared.request
            ))
        })?;
        self.shared.wait_slot(slot)
    }

    /// Block until no task is running and either every task has published
    /// and released its operands or the request failed.
    pub fn join(&self) -> Result<(), AdError> {
        let shared = &self.shared;
        let completion = &shared.completion;
        let mut progress = completion.progress.lock();
        loop {
            if progress.in_flight == 0 {
                if progress.finished == shared.tasks.len() {
                    return Ok(());
                }
                if let Some(err) = shared.abort.get() {
                    return Err(err.clone());
                }
            }
            completion.done.wait(&mut progress);
        }
    }

    /// State of the task running `node` in the region itself.
    pub fn node_state(&self, node: NodeId) -> Option<NodeState> {
        let task = self.shared.program.task_of(ROOT_SCOPE, node)?;
        Some(*self.shared.tasks[task].state.lock())
    }

    pub fn stats(&self) -> ExecStats {
        ExecStats {
            tasks: self.shared.tasks.len(),
            tasks_run: self.shared.tasks_run.load(Ordering::Relaxed),
            inplace_reuses: self.shared.inplace_reuses.load(Ordering::Relaxed),
            reclaimed: self.shared.reclaimed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn slot(&self, scope: ScopeId, var: &Variable) -> Option<usize> {
        self.shared.program.slot_of(scope, var)
    }

    pub(crate) fn call_scope(&self, scope: ScopeId, node: NodeId) -> Option<ScopeId> {
        self.shared.program.call_scope(scope, node)
    }

    /// Value of `var` in `scope` after the request completed.
    pub(crate) fn retained(&self, scope: ScopeId, var: &Variable) -> Result<Arc<Tensor>, AdError> {
        let slot = self.slot(scope, var).ok_or_else(|| {
            AdError::InternalConsistency(format!("{} was not lowered", var.id()))
        })?;
        self.shared.read(slot)
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("request", &self.shared.request)
            .field("stats", &self.stats())
            .field("aborted", &self.shared.abort.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuBackend;
    use crate::dispatch::Dispatch;
    use crate::dtype::DType;
    use crate::events::EventLog;
    use crate::graph::Tape;

    fn engine(inplace: bool) -> Engine {
        let dispatch = Dispatch::new(vec![Arc::new(CpuBackend::new("cpu"))]).unwrap();
        Engine {
            pool: Arc::new(rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap()),
            dispatch: Arc::new(dispatch),
            events: Some(Arc::new(EventLog::new())),
            inplace,
            live: Arc::default(),
        }
    }

    fn vector(tape: &Tape, values: &[f64]) -> Variable {
        tape.leaf(Tensor::from_vec(values.to_vec(), &[values.len()]).unwrap(), false)
    }

    #[test]
    fn test_chain_publishes_and_reclaims() {
        let engine = engine(false);
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[0.0, 1.0]);
        let a = tape.exp(&x).unwrap();
        let b = tape.neg(&a).unwrap();
        let region = tape.close();

        let exec = Execution::start(&engine, &region, ExecOptions::requesting(&[b.clone()])).unwrap();
        exec.join().unwrap();
        let out = exec.wait(&b).unwrap();
        assert_eq!(out.to_f64_vec(), vec![-1.0, -(1.0f64.exp())]);

        let exp_node = a.producer().unwrap().0;
        let neg_node = b.producer().unwrap().0;
        assert_eq!(exec.node_state(exp_node), Some(NodeState::Reclaimable));
        assert_eq!(exec.node_state(neg_node), Some(NodeState::Published));
        assert!(matches!(exec.wait(&a), Err(AdError::InternalConsistency(_))));
    }

    #[test]
    fn test_inplace_reuses_last_consumer_operand() {
        let engine = engine(true);
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[1.0, 2.0]);
        let a = tape.scale(&x, 2.0).unwrap();
        let b = tape.neg(&a).unwrap();
        let region = tape.close();

        let exec = Execution::start(&engine, &region, ExecOptions::requesting(&[b.clone()])).unwrap();
        exec.join().unwrap();
        assert_eq!(exec.wait(&b).unwrap().to_f64_vec(), vec![-2.0, -4.0]);
        // x is a leaf and a is requested by nobody: only a can be reused.
        assert_eq!(exec.stats().inplace_reuses, 1);
    }

    #[test]
    fn test_requested_values_are_not_reused() {
        let engine = engine(true);
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[1.0]);
        let a = tape.exp(&x).unwrap();
        let b = tape.neg(&a).unwrap();
        let region = tape.close();

        let exec =
            Execution::start(&engine, &region, ExecOptions::requesting(&[a.clone(), b.clone()]))
                .unwrap();
        exec.join().unwrap();
        assert_eq!(exec.stats().inplace_reuses, 0);
        assert_eq!(exec.wait(&a).unwrap().to_f64_vec(), vec![1.0f64.exp()]);
    }

    #[test]
    fn test_double_publish_fails_request() {
        let engine = engine(false);
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[1.0]);
        let a = tape.neg(&x).unwrap();
        let region = tape.close();

        let exec = Execution::start(&engine, &region, ExecOptions::requesting(&[a.clone()])).unwrap();
        exec.join().unwrap();
        assert!(!exec.shared.publish(0, Tensor::zeros(&[1], DType::F64)));
        assert!(matches!(
            exec.shared.abort.get(),
            Some(AdError::InternalConsistency(_))
        ));
        // The value published first is kept.
        assert_eq!(exec.wait(&a).unwrap().to_f64_vec(), vec![-1.0]);
    }

    #[test]
    fn test_events_order_bound_before_reclaimed() {
        let engine = engine(false);
        let log = engine.events.clone().unwrap();
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[3.0]);
        let a = tape.neg(&x).unwrap();
        let b = tape.neg(&a).unwrap();
        let region = tape.close();

        let exec = Execution::start(&engine, &region, ExecOptions::requesting(&[b.clone()])).unwrap();
        exec.join().unwrap();
        let request = exec.request_id();
        let bound = log
            .position(|e| matches!(e, Event::SlotBound { request: r, var, .. } if *r == request && *var == a.id()))
            .unwrap();
        let consumer = log
            .position(|e| matches!(e, Event::NodeFinished { request: r, node } if *r == request && Some(*node) == b.producer().map(|p| p.0)))
            .unwrap();
        let reclaimed = log
            .position(|e| matches!(e, Event::Reclaimed { request: r, var } if *r == request && *var == a.id()))
            .unwrap();
        assert!(bound < consumer);
        assert!(consumer < reclaimed);
    }

    #[test]
    fn test_wait_unknown_variable() {
        let engine = engine(false);
        let mut tape = Tape::new(engine.dispatch.clone());
        let x = vector(&tape, &[1.0]);
        let region = tape.close();
        let exec = Execution::start(&engine, &region, ExecOptions::default()).unwrap();
        exec.join().unwrap();
        assert!(matches!(exec.wait(&x), Err(AdError::InvalidOperation(_))));
    }
}
