#![forbid(unsafe_code)]

//! Runtime configuration.

/// Configuration for a [`Runtime`](crate::Runtime).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Upper bound on tasks run by one `run_microtasks` call. The scheduler
    /// itself never bounds re-entrant requests; this only guards the drain
    /// loop against hooks that always re-request.
    /// Default: `None` (unbounded).
    pub max_drain_tasks: Option<usize>,

    /// Treat a detector-approved pending record with no callback chain as an
    /// error. When false, such records are skipped.
    /// Default: true.
    pub strict_callback_chains: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_drain_tasks: None,
            strict_callback_chains: true,
        }
    }
}

impl RuntimeConfig {
    #[must_use]
    pub fn with_max_drain_tasks(mut self, limit: usize) -> Self {
        self.max_drain_tasks = Some(limit);
        self
    }

    #[must_use]
    pub fn with_strict_callback_chains(mut self, strict: bool) -> Self {
        self.strict_callback_chains = strict;
        self
    }
}
