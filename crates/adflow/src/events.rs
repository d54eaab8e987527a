//! Ordered record of scheduler and pool events.
//!
//! The log is optional; when enabled, every pool and every execution of a
//! runtime writes into the same log so that the relative order of buffer
//! reclamation and node completion can be inspected afterwards.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::exec::RequestId;
use crate::graph::{NodeId, VarId};
use crate::storage::BufferId;

/// Something the engine did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A pool lent a buffer.
    BufferAcquired { buffer: BufferId, reused: bool },
    /// A buffer went back to its pool's idle list.
    BufferReleased { buffer: BufferId },
    /// A value was published into a slot of a request.
    SlotBound {
        request: RequestId,
        var: VarId,
        buffer: BufferId,
    },
    /// A task finished running and published its output.
    NodeFinished { request: RequestId, node: NodeId },
    /// A request dropped its reference to a value after its last consumer ran.
    Reclaimed { request: RequestId, var: VarId },
}

/// An event with its global sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub seq: u64,
    pub event: Event,
}

/// Append-only event log shared by pools and executions.
#[derive(Debug, Default)]
pub struct EventLog {
    next: AtomicU64,
    records: Mutex<Vec<EventRecord>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event.
    pub fn record(&self, event: Event) {
        // Sequence numbers are taken under the lock so that the stored order
        // matches the numbering.
        let mut records = self.records.lock();
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        records.push(EventRecord { seq, event });
    }

    /// Copy of all records so far, in sequence order.
    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.lock().clone()
    }

    /// Sequence number of the first record matching `pred`.
    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<u64> {
        self.records
            .lock()
            .iter()
            .find(|r| pred(&r.event))
            .map(|r| r.seq)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all records. Sequence numbers keep increasing.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}
