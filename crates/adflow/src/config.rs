//! Runtime configuration.

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads (None = rayon's default, one per core)
    pub num_threads: Option<usize>,
    /// Let elementwise tasks overwrite an operand whose last consumer they are
    pub inplace: bool,
    /// Byte limit of the default CPU backend's pool (None = unbounded)
    pub pool_limit: Option<usize>,
    /// Record pool and scheduler events into an [`EventLog`](crate::EventLog)
    pub record_events: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_threads: None,
            inplace: true,
            pool_limit: None,
            record_events: false,
        }
    }
}

impl RuntimeConfig {
    /// Set the number of worker threads.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    /// Enable or disable in-place reuse of operand buffers.
    pub fn with_inplace(mut self, inplace: bool) -> Self {
        self.inplace = inplace;
        self
    }

    /// Bound the default pool.
    pub fn with_pool_limit(mut self, bytes: usize) -> Self {
        self.pool_limit = Some(bytes);
        self
    }

    pub fn with_record_events(mut self, record: bool) -> Self {
        self.record_events = record;
        self
    }
}
