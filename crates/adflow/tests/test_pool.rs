//! Stress tests for the memory pool.

use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use adflow::storage::{BufferId, PooledBuffer};
use adflow::{DType, MemoryPool, Runtime, RuntimeConfig, Tensor};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SHAPES: [&[usize]; 4] = [&[4], &[2, 2], &[16], &[3, 5]];

#[test]
fn test_no_buffer_is_lent_twice() {
    let pool = MemoryPool::new("stress");
    let live: Arc<Mutex<HashSet<BufferId>>> = Arc::new(Mutex::new(HashSet::new()));

    let handles: Vec<_> = (0..8u64)
        .map(|seed| {
            let pool = pool.clone();
            let live = live.clone();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                let mut held: Vec<PooledBuffer> = Vec::new();
                for _ in 0..500 {
                    if held.is_empty() || rng.random_bool(0.6) {
                        let shape = SHAPES[rng.random_range(0..SHAPES.len())];
                        let dtype = if rng.random_bool(0.5) {
                            DType::F32
                        } else {
                            DType::F64
                        };
                        let buf = pool.acquire(shape, dtype).unwrap();
                        assert_eq!(buf.key().shape, shape);
                        assert!(live.lock().insert(buf.id()), "buffer lent twice");
                        held.push(buf);
                    } else {
                        let buf = held.swap_remove(rng.random_range(0..held.len()));
                        assert!(live.lock().remove(&buf.id()));
                        if rng.random_bool(0.5) {
                            pool.release(buf);
                        } else {
                            drop(buf);
                        }
                    }
                }
                for buf in held {
                    assert!(live.lock().remove(&buf.id()));
                    drop(buf);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.bytes_in_use, 0);
    assert!(stats.reuses > 0);
    assert_eq!(stats.allocations + stats.reuses, stats.releases);
}

#[test]
fn test_bounded_pool_reports_exhaustion() {
    let rt = Runtime::new(
        RuntimeConfig::default()
            .with_num_threads(1)
            .with_pool_limit(64),
    )
    .unwrap();
    let mut tape = rt.tape();
    let x = tape.leaf(Tensor::ones(&[32], DType::F64), false);
    let y = tape.exp(&x).unwrap();
    let err = rt.evaluate(&mut tape, &[y]).unwrap_err();
    assert!(matches!(err, adflow::AdError::PoolExhaustion { .. }));
}

#[test]
fn test_concurrent_acquires_respect_limit() {
    // Room for exactly four [8] f64 buffers.
    let pool = MemoryPool::with_limit("bounded", Some(4 * 8 * 8));
    let threads = 16;
    let barrier = Arc::new(Barrier::new(threads));

    for _ in 0..20 {
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let pool = pool.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let held = pool.acquire(&[8], DType::F64).ok();
                    // Hold until every thread has tried.
                    barrier.wait();
                    let in_use = pool.stats().bytes_in_use;
                    (held.is_some(), in_use)
                })
            })
            .collect();
        let results: Vec<(bool, usize)> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|(ok, _)| *ok).count(), 4);
        assert!(results.iter().all(|&(_, in_use)| in_use <= 4 * 8 * 8));
    }
}

#[test]
fn test_execution_returns_buffers() {
    let rt = Runtime::new(RuntimeConfig::default().with_num_threads(4)).unwrap();
    let pool = rt.dispatch().backends()[0].pool().clone();
    for _ in 0..3 {
        let mut tape = rt.tape();
        let x = tape.leaf(Tensor::ones(&[64], DType::F64), false);
        let mut acc = tape.exp(&x).unwrap();
        for _ in 0..10 {
            let e = tape.scale(&acc, 0.5).unwrap();
            acc = tape.add(&acc, &e).unwrap();
        }
        let s = tape.sum(&acc).unwrap();
        rt.evaluate(&mut tape, &[s]).unwrap();
    }
    let stats = pool.stats();
    assert_eq!(stats.bytes_in_use, 0);
    assert!(stats.reuses > 0);
}
