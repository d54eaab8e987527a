//! Buffer reuse pool.
//!
//! One pool exists per backend. Idle buffers are kept in free-lists keyed by
//! `(shape, dtype)`; `acquire` pops a matching block or allocates a new one
//! and `release` pushes it back. Both are safe to call from any worker.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use super::buffer::{Buffer, BufferId};
use crate::dtype::DType;
use crate::error::AdError;
use crate::events::{Event, EventLog};
use crate::strides::numel;

/// Free-list key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub shape: Vec<usize>,
    pub dtype: DType,
}

impl PoolKey {
    pub fn new(shape: &[usize], dtype: DType) -> Self {
        Self {
            shape: shape.to_vec(),
            dtype,
        }
    }

    /// Bytes needed by a buffer with this key.
    pub fn nbytes(&self) -> usize {
        numel(&self.shape) * self.dtype.size_of()
    }
}

/// Pool statistics snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers created by the allocator.
    pub allocations: u64,
    /// Acquisitions served from an idle free-list.
    pub reuses: u64,
    /// Buffers returned to the pool.
    pub releases: u64,
    /// Buffers currently idle.
    pub idle_buffers: usize,
    /// Bytes currently lent out.
    pub bytes_in_use: usize,
    /// Bytes currently idle.
    pub bytes_idle: usize,
}

struct PoolShared {
    name: String,
    limit: Option<usize>,
    free: Mutex<HashMap<PoolKey, Vec<(BufferId, Buffer)>>>,
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    bytes_in_use: AtomicUsize,
    bytes_idle: AtomicUsize,
    events: OnceLock<Arc<EventLog>>,
}

impl PoolShared {
    fn put_back(&self, id: BufferId, key: PoolKey, buffer: Buffer) {
        let nbytes = buffer.nbytes();
        {
            let mut free = self.free.lock();
            free.entry(key).or_default().push((id, buffer));
            self.bytes_in_use.fetch_sub(nbytes, Ordering::AcqRel);
            self.bytes_idle.fetch_add(nbytes, Ordering::AcqRel);
        }
        self.releases.fetch_add(1, Ordering::Relaxed);
        if let Some(log) = self.events.get() {
            log.record(Event::BufferReleased { buffer: id });
        }
        tracing::trace!(pool = %self.name, buffer = id.index(), "buffer released");
    }

    /// Drop every idle buffer. The caller holds the free-list lock.
    fn drop_idle(&self, free: &mut HashMap<PoolKey, Vec<(BufferId, Buffer)>>) -> usize {
        let dropped: usize = free
            .values()
            .flat_map(|list| list.iter())
            .map(|(_, buffer)| buffer.nbytes())
            .sum();
        free.clear();
        self.bytes_idle.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    fn held_bytes(&self) -> usize {
        self.bytes_in_use.load(Ordering::Acquire) + self.bytes_idle.load(Ordering::Acquire)
    }
}

/// Per-backend memory pool.
///
/// Cloning a `MemoryPool` yields another handle to the same free-lists.
#[derive(Clone)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create an unbounded pool.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_limit(name, None)
    }

    /// Create a pool that refuses to hold more than `limit` bytes.
    pub fn with_limit(name: impl Into<String>, limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                name: name.into(),
                limit,
                free: Mutex::new(HashMap::new()),
                allocations: AtomicU64::new(0),
                reuses: AtomicU64::new(0),
                releases: AtomicU64::new(0),
                bytes_in_use: AtomicUsize::new(0),
                bytes_idle: AtomicUsize::new(0),
                events: OnceLock::new(),
            }),
        }
    }

    /// Pool name (the owning backend's name).
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Byte limit, if any.
    pub fn limit(&self) -> Option<usize> {
        self.shared.limit
    }

    /// Attach an event log. Only the first attached log is kept.
    pub fn attach_event_log(&self, log: Arc<EventLog>) {
        let _ = self.shared.events.set(log);
    }

    /// Lend a buffer for `(shape, dtype)`.
    ///
    /// A reused buffer keeps whatever its previous owner wrote; callers must
    /// not assume zero-initialized contents.
    ///
    /// # Errors
    ///
    /// Returns `AdError::PoolExhaustion` if the byte limit would be exceeded
    /// even after dropping idle buffers, or if the allocator fails.
    pub fn acquire(&self, shape: &[usize], dtype: DType) -> Result<PooledBuffer, AdError> {
        let key = PoolKey::new(shape, dtype);
        let nbytes = key.nbytes();

        // Counters change under the free-list lock so that the limit check
        // and the reservation are one step.
        let mut free = self.shared.free.lock();
        if let Some((id, buffer)) = free.get_mut(&key).and_then(Vec::pop) {
            self.shared.bytes_idle.fetch_sub(nbytes, Ordering::AcqRel);
            self.shared.bytes_in_use.fetch_add(nbytes, Ordering::AcqRel);
            drop(free);
            self.shared.reuses.fetch_add(1, Ordering::Relaxed);
            self.record_acquire(id, true);
            return Ok(PooledBuffer::lent(id, key, buffer, &self.shared));
        }

        if let Some(limit) = self.shared.limit {
            if self.shared.held_bytes() + nbytes > limit {
                let dropped = self.shared.drop_idle(&mut free);
                tracing::debug!(pool = %self.shared.name, bytes = dropped, "pool trimmed");
            }
            if self.shared.held_bytes() + nbytes > limit {
                return Err(AdError::PoolExhaustion {
                    requested: nbytes,
                    limit: Some(limit),
                });
            }
        }
        self.shared.bytes_in_use.fetch_add(nbytes, Ordering::AcqRel);
        drop(free);

        let buffer = match Buffer::try_alloc(dtype, numel(shape)) {
            Ok(buffer) => buffer,
            Err(err) => {
                self.shared.bytes_in_use.fetch_sub(nbytes, Ordering::AcqRel);
                return Err(err);
            }
        };
        let id = BufferId::fresh();
        self.shared.allocations.fetch_add(1, Ordering::Relaxed);
        self.record_acquire(id, false);
        Ok(PooledBuffer::lent(id, key, buffer, &self.shared))
    }

    /// Return a buffer to this pool's idle list.
    ///
    /// Buffers that were not lent by this pool are adopted.
    pub fn release(&self, mut buffer: PooledBuffer) {
        let home = std::mem::take(&mut buffer.home);
        let data = buffer.take_data();
        let nbytes = data.nbytes();
        match home.upgrade() {
            Some(home) if Arc::ptr_eq(&home, &self.shared) => {}
            Some(home) => {
                home.bytes_in_use.fetch_sub(nbytes, Ordering::AcqRel);
                self.shared.bytes_in_use.fetch_add(nbytes, Ordering::AcqRel);
            }
            None => {
                self.shared.bytes_in_use.fetch_add(nbytes, Ordering::AcqRel);
            }
        }
        self.shared.put_back(buffer.id, buffer.key.clone(), data);
    }

    /// Drop every idle buffer.
    pub fn trim(&self) {
        let dropped = self.shared.drop_idle(&mut self.shared.free.lock());
        tracing::debug!(pool = %self.shared.name, bytes = dropped, "pool trimmed");
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PoolStats {
        let idle_buffers = self.shared.free.lock().values().map(Vec::len).sum();
        PoolStats {
            allocations: self.shared.allocations.load(Ordering::Relaxed),
            reuses: self.shared.reuses.load(Ordering::Relaxed),
            releases: self.shared.releases.load(Ordering::Relaxed),
            idle_buffers,
            bytes_in_use: self.shared.bytes_in_use.load(Ordering::Acquire),
            bytes_idle: self.shared.bytes_idle.load(Ordering::Acquire),
        }
    }


    fn record_acquire(&self, id: BufferId, reused: bool) {
        if let Some(log) = self.shared.events.get() {
            log.record(Event::BufferAcquired { buffer: id, reused });
        }
        tracing::trace!(pool = %self.shared.name, buffer = id.index(), reused, "buffer acquired");
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.shared.name)
            .field("limit", &self.shared.limit)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A storage block lent by a pool, or a standalone block owned by the caller.
///
/// Dropping a lent buffer returns it to its pool.
pub struct PooledBuffer {
    id: BufferId,
    key: PoolKey,
    data: Buffer,
    home: Weak<PoolShared>,
}

impl PooledBuffer {
    fn lent(id: BufferId, key: PoolKey, buffer: Buffer, home: &Arc<PoolShared>) -> Self {
        Self {
            id,
            key,
            data: buffer,
            home: Arc::downgrade(home),
        }
    }

    /// Wrap a caller-owned buffer that does not belong to any pool.
    pub fn standalone(buffer: Buffer, shape: &[usize]) -> Self {
        Self {
            id: BufferId::fresh(),
            key: PoolKey::new(shape, buffer.dtype()),
            data: buffer,
            home: Weak::new(),
        }
    }

    /// Identity of the storage block.
    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Free-list key of the block.
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Whether the block returns to a pool when dropped.
    pub fn is_pooled(&self) -> bool {
        self.home.strong_count() > 0
    }

    /// Borrow the elements.
    pub fn buffer(&self) -> &Buffer {
        &self.data
    }

    /// Mutably borrow the elements.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.data
    }

    fn take_data(&mut self) -> Buffer {
        std::mem::replace(&mut self.data, Buffer::zeros(self.key.dtype, 0))
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(home) = self.home.upgrade() {
            let data = self.take_data();
            home.put_back(self.id, self.key.clone(), data);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("pooled", &self.is_pooled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_then_reuses() {
        let pool = MemoryPool::new("test");
        let first = pool.acquire(&[2, 3], DType::F64).unwrap();
        let id = first.id();
        pool.release(first);

        let second = pool.acquire(&[2, 3], DType::F64).unwrap();
        assert_eq!(second.id(), id);

        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.releases, 1);
    }

    #[test]
    fn test_key_includes_dtype_and_shape() {
        let pool = MemoryPool::new("test");
        let a = pool.acquire(&[4], DType::F64).unwrap();
        let a_id = a.id();
        drop(a);

        let b = pool.acquire(&[4], DType::F32).unwrap();
        let c = pool.acquire(&[2, 2], DType::F64).unwrap();
        assert_ne!(b.id(), a_id);
        assert_ne!(c.id(), a_id);
        assert_eq!(pool.stats().allocations, 3);
    }

    #[test]
    fn test_drop_returns_to_pool() {
        let pool = MemoryPool::new("test");
        {
            let _buf = pool.acquire(&[8], DType::F32).unwrap();
            assert_eq!(pool.stats().bytes_in_use, 32);
        }
        let stats = pool.stats();
        assert_eq!(stats.bytes_in_use, 0);
        assert_eq!(stats.bytes_idle, 32);
        assert_eq!(stats.idle_buffers, 1);
    }

    #[test]
    fn test_reuse_keeps_stale_contents() {
        let pool = MemoryPool::new("test");
        let mut buf = pool.acquire(&[2], DType::F64).unwrap();
        buf.buffer_mut().fill_from_f64(&[7.0, 8.0]);
        pool.release(buf);

        let again = pool.acquire(&[2], DType::F64).unwrap();
        assert_eq!(again.buffer().to_f64_vec(), vec![7.0, 8.0]);
    }

    #[test]
    fn test_limit_exhaustion() {
        let pool = MemoryPool::with_limit("small", Some(64));
        let _held = pool.acquire(&[8], DType::F64).unwrap();
        let err = pool.acquire(&[1], DType::F64).unwrap_err();
        assert_eq!(
            err,
            AdError::PoolExhaustion {
                requested: 8,
                limit: Some(64)
            }
        );
    }

    #[test]
    fn test_limit_trims_idle_before_failing() {
        let pool = MemoryPool::with_limit("small", Some(64));
        drop(pool.acquire(&[8], DType::F64).unwrap());
        assert_eq!(pool.stats().bytes_idle, 64);

        let other = pool.acquire(&[16], DType::F32).unwrap();
        assert_eq!(other.buffer().len(), 16);
        assert_eq!(pool.stats().bytes_idle, 0);
    }

    #[test]
    fn test_release_adopts_standalone() {
        let pool = MemoryPool::new("test");
        let standalone = PooledBuffer::standalone(Buffer::zeros(DType::F64, 3), &[3]);
        assert!(!standalone.is_pooled());
        let id = standalone.id();
        pool.release(standalone);

        let adopted = pool.acquire(&[3], DType::F64).unwrap();
        assert_eq!(adopted.id(), id);
        assert!(adopted.is_pooled());
    }

    #[test]
    fn test_events_recorded() {
        let pool = MemoryPool::new("test");
        let log = Arc::new(EventLog::new());
        pool.attach_event_log(log.clone());

        let buf = pool.acquire(&[1], DType::F64).unwrap();
        let id = buf.id();
        drop(buf);

        let events: Vec<Event> = log.snapshot().into_iter().map(|r| r.event).collect();
        assert_eq!(
            events,
            vec![
                Event::BufferAcquired {
                    buffer: id,
                    reused: false
                },
                Event::BufferReleased { buffer: id },
            ]
        );
    }
}
