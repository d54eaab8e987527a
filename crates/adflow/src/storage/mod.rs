//! Storage for tensor data.
//!
//! ```text
//! MemoryPool (per backend)
//! ├── idle free-lists keyed by (shape, dtype)
//! └── lends PooledBuffer ──owns──► Buffer (F32 | F64)
//! ```
//!
//! A `PooledBuffer` is owned by exactly one tensor while lent out. Dropping
//! it (or calling [`MemoryPool::release`]) returns the block to the idle list
//! of the pool it came from; contents are not cleared.

mod buffer;
mod pool;

pub use buffer::{Buffer, BufferId};
pub use pool::{MemoryPool, PoolKey, PoolStats, PooledBuffer};
