//! Integration tests for the dataflow scheduler: determinism, cancellation,
//! failure isolation and reclamation.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender, channel};
use std::thread;
use std::time::Duration;

use adflow::{
    AdError, Backend, CancelToken, CpuBackend, DType, ExecOptions, MemoryPool, NodeState, Op,
    Runtime, RuntimeConfig, Tensor, Variable,
};
use parking_lot::Mutex;

fn runtime(threads: usize) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_num_threads(threads)).unwrap()
}

fn ramp(n: usize, scale: f64) -> Tensor {
    Tensor::from_vec((0..n).map(|i| i as f64 * scale).collect::<Vec<_>>(), &[n]).unwrap()
}

/// CPU backend whose `exp` kernel waits for a signal.
#[derive(Debug)]
struct GateBackend {
    inner: CpuBackend,
    entered: Mutex<Sender<()>>,
    release: Mutex<Receiver<()>>,
}

impl GateBackend {
    fn new() -> (Self, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = channel();
        let (release_tx, release_rx) = channel();
        let backend = Self {
            inner: CpuBackend::new("gate"),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        (backend, entered_rx, release_tx)
    }
}

impl Backend for GateBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports(&self, op: &Op, dtype: DType) -> bool {
        self.inner.supports(op, dtype)
    }

    fn pool(&self) -> &MemoryPool {
        self.inner.pool()
    }

    fn apply(&self, op: &Op, inputs: &[&Tensor], out: &mut Tensor) -> Result<(), AdError> {
        if matches!(op, Op::Exp) {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
        }
        self.inner.apply(op, inputs, out)
    }
}

/// CPU backend whose `log` kernel always fails.
#[derive(Debug)]
struct FaultyBackend {
    inner: CpuBackend,
}

impl Backend for FaultyBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn supports(&self, op: &Op, dtype: DType) -> bool {
        self.inner.supports(op, dtype)
    }

    fn pool(&self) -> &MemoryPool {
        self.inner.pool()
    }

    fn apply(&self, op: &Op, inputs: &[&Tensor], out: &mut Tensor) -> Result<(), AdError> {
        if matches!(op, Op::Log) {
            return Err(AdError::Kernel {
                op: "log".into(),
                message: "device fault".into(),
            });
        }
        self.inner.apply(op, inputs, out)
    }
}

#[test]
fn test_repeated_execution_is_bitwise_identical() {
    let rt = runtime(8);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(64, 0.01), false);
    let y = tape.leaf(ramp(64, -0.02), false);
    // A wide diamond so that many tasks are ready at once.
    let mut branches: Vec<Variable> = Vec::new();
    for k in 0..8 {
        let a = tape.scale(&x, 1.0 + k as f64).unwrap();
        let b = tape.exp(&a).unwrap();
        let c = tape.mul(&b, &y).unwrap();
        branches.push(c);
    }
    let mut acc = branches[0].clone();
    for b in &branches[1..] {
        acc = tape.add(&acc, b).unwrap();
    }
    let total = tape.sum(&acc).unwrap();
    let region = tape.close();

    let run = || {
        let exec = rt
            .execute(&region, ExecOptions::requesting(&[acc.clone(), total.clone()]))
            .unwrap();
        exec.join().unwrap();
        (exec.wait(&acc).unwrap(), exec.wait(&total).unwrap())
    };
    let (acc1, total1) = run();
    let (acc2, total2) = run();
    assert!(acc1.bit_eq(&acc2));
    assert!(total1.bit_eq(&total2));
}

#[test]
fn test_inplace_does_not_change_results() {
    let build = |inplace: bool| {
        let rt = Runtime::new(
            RuntimeConfig::default()
                .with_num_threads(4)
                .with_inplace(inplace),
        )
        .unwrap();
        let mut tape = rt.tape();
        let x = tape.leaf(ramp(16, 0.1), false);
        let a = tape.exp(&x).unwrap();
        let b = tape.scale(&a, 2.0).unwrap();
        let c = tape.neg(&b).unwrap();
        let d = tape.add(&c, &x).unwrap();
        let region = tape.close();
        let exec = rt.execute(&region, ExecOptions::requesting(&[d.clone()])).unwrap();
        exec.join().unwrap();
        (exec.wait(&d).unwrap(), exec.stats())
    };
    let (with, with_stats) = build(true);
    let (without, without_stats) = build(false);
    assert!(with.bit_eq(&without));
    assert!(with_stats.inplace_reuses > 0);
    assert_eq!(without_stats.inplace_reuses, 0);
}

#[test]
fn test_cancel_before_start() {
    let rt = runtime(2);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(4, 1.0), false);
    let y = tape.exp(&x).unwrap();
    let region = tape.close();

    let token = CancelToken::new();
    token.cancel();
    let exec = rt
        .execute(
            &region,
            ExecOptions::requesting(&[y.clone()]).with_cancel(token),
        )
        .unwrap();
    assert_eq!(exec.join(), Err(AdError::Cancelled));
    assert!(matches!(exec.wait(&y), Err(AdError::Cancelled)));
    assert_eq!(exec.stats().tasks_run, 0);
}

#[test]
fn test_cancel_while_running() {
    let (gate, entered, release) = GateBackend::new();
    let rt = Runtime::with_backends(
        RuntimeConfig::default().with_num_threads(2),
        vec![Arc::new(gate)],
    )
    .unwrap();
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(4, 1.0), false);
    let a = tape.exp(&x).unwrap();
    let b = tape.neg(&a).unwrap();
    let region = tape.close();

    let token = CancelToken::new();
    let exec = rt
        .execute(
            &region,
            ExecOptions::requesting(&[b.clone()]).with_cancel(token.clone()),
        )
        .unwrap();

    entered.recv().unwrap();
    let waiter = {
        let exec = exec.clone();
        let b = b.clone();
        thread::spawn(move || exec.wait(&b))
    };
    token.cancel();
    assert!(matches!(waiter.join().unwrap(), Err(AdError::Cancelled)));

    release.send(()).unwrap();
    assert_eq!(exec.join(), Err(AdError::Cancelled));
    let (neg_node, _) = b.producer().unwrap();
    assert_eq!(exec.node_state(neg_node), Some(NodeState::Pending));
    assert!(token.is_cancelled());
}

#[test]
fn test_shutdown_waits_for_running_requests() {
    let (gate, entered, release) = GateBackend::new();
    let rt = Runtime::with_backends(
        RuntimeConfig::default().with_num_threads(2),
        vec![Arc::new(gate)],
    )
    .unwrap();
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(4, 1.0), false);
    let a = tape.exp(&x).unwrap();
    let b = tape.neg(&a).unwrap();
    let region = tape.close();
    let exec = rt.execute(&region, ExecOptions::requesting(&[b.clone()])).unwrap();

    entered.recv().unwrap();
    let opener = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        release.send(()).unwrap();
    });
    rt.shutdown();

    // Both tasks ran before shutdown returned.
    assert_eq!(exec.stats().tasks_run, 2);
    let (neg_node, _) = b.producer().unwrap();
    assert_eq!(exec.node_state(neg_node), Some(NodeState::Published));
    opener.join().unwrap();
}

#[test]
fn test_kernel_failure_is_isolated() {
    let faulty = Arc::new(FaultyBackend {
        inner: CpuBackend::new("faulty"),
    });
    let rt = Runtime::with_backends(
        RuntimeConfig::default().with_num_threads(4),
        vec![Arc::new(CpuBackend::new("cpu")), faulty],
    )
    .unwrap();
    let faulty_id = rt.dispatch().find("faulty").unwrap();

    let mut tape = rt.tape();
    let bad_in = Variable::leaf(ramp(8, 1.0), false, faulty_id);
    let bad = tape.log(&bad_in).unwrap();
    let bad_next = tape.neg(&bad).unwrap();
    let bad_region = tape.close();

    let good_in = tape.leaf(ramp(8, 1.0), false);
    let good = tape.scale(&good_in, 2.0).unwrap();
    let good_region = tape.close();

    let failing = rt
        .execute(&bad_region, ExecOptions::requesting(&[bad_next.clone()]))
        .unwrap();
    let healthy = rt
        .execute(&good_region, ExecOptions::requesting(&[good.clone()]))
        .unwrap();

    assert!(matches!(failing.join(), Err(AdError::Kernel { .. })));
    assert!(matches!(failing.wait(&bad_next), Err(AdError::Kernel { .. })));
    healthy.join().unwrap();
    assert_eq!(
        healthy.wait(&good).unwrap().to_f64_vec(),
        (0..8).map(|i| i as f64 * 2.0).collect::<Vec<_>>()
    );
}

#[test]
fn test_reading_reclaimed_value_fails() {
    let rt = runtime(2);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(4, 1.0), false);
    let a = tape.exp(&x).unwrap();
    let b = tape.neg(&a).unwrap();
    let region = tape.close();

    let exec = rt.execute(&region, ExecOptions::requesting(&[b.clone()])).unwrap();
    exec.join().unwrap();
    assert!(matches!(exec.wait(&a), Err(AdError::InternalConsistency(_))));
    let (exp_node, _) = a.producer().unwrap();
    assert_eq!(exec.node_state(exp_node), Some(NodeState::Reclaimable));
    let (neg_node, _) = b.producer().unwrap();
    assert_eq!(exec.node_state(neg_node), Some(NodeState::Published));
}

#[test]
fn test_evaluate_rematerializes_reclaimed_intermediates() {
    let rt = runtime(2);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(3, 1.0), false);
    let a = tape.scale(&x, 3.0).unwrap();
    let b = tape.neg(&a).unwrap();

    let out = rt.evaluate(&mut tape, &[b.clone()]).unwrap();
    assert_eq!(out[0].to_f64_vec(), vec![0.0, -3.0, -6.0]);
    assert!(!a.has_value());

    // `a` was reclaimed; asking for it reruns its producer.
    let again = rt.evaluate(&mut tape, &[a.clone()]).unwrap();
    assert_eq!(again[0].to_f64_vec(), vec![0.0, 3.0, 6.0]);
    assert!(a.has_value());
}

#[test]
fn test_lazy_until_evaluated() {
    let rt = runtime(2);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(3, 1.0), false);
    let y = tape.exp(&x).unwrap();
    let z = tape.matmul(&x, &x);
    // Shape errors surface at record time.
    assert!(matches!(z, Err(AdError::Shape { .. })));
    assert!(!y.has_value());
    assert_eq!(tape.len(), 1);

    let values = rt.evaluate(&mut tape, &[y.clone()]).unwrap();
    assert_eq!(values[0].to_f64_vec()[0], 1.0);
}

#[test]
fn test_concurrent_requests_share_runtime() {
    let rt = Arc::new(runtime(4));
    let handles: Vec<_> = (0..4)
        .map(|k| {
            let rt = rt.clone();
            thread::spawn(move || {
                let mut tape = rt.tape();
                let x = tape.leaf(ramp(32, 0.5), false);
                let y = tape.scale(&x, k as f64).unwrap();
                let s = tape.sum(&y).unwrap();
                rt.evaluate(&mut tape, &[s]).unwrap()[0].to_f64_vec()[0]
            })
        })
        .collect();
    let base: f64 = (0..32).map(|i| i as f64 * 0.5).sum();
    for (k, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), base * k as f64);
    }
}

#[test]
fn test_varying_scalars_reuse_plans() {
    let rt = runtime(2);
    let mut tape = rt.tape();
    let x = tape.leaf(ramp(3, 1.0), false);
    let mut outputs = Vec::new();
    for k in 0..50 {
        let s = tape.scale(&x, k as f64).unwrap();
        outputs.push(tape.axpy(0.5 * k as f64, &x, &s).unwrap());
    }
    let plans = rt.dispatch().cached_plans();
    assert!(plans <= 2, "{plans} plans cached");

    let values = rt.evaluate(&mut tape, &outputs).unwrap();
    for (k, value) in values.iter().enumerate() {
        let factor = 1.5 * k as f64;
        assert_eq!(value.to_f64_vec(), vec![0.0, factor, 2.0 * factor]);
    }
}
