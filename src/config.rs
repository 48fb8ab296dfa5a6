/// Configuration for the event loop backend.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct Config {
    /// Number of SQ entries.
    pub sq_entries: u32,
    /// Count of prepared-but-unsubmitted SQEs above which new entries are
    /// flagged for kernel worker-thread execution (IOSQE_ASYNC), so a long
    /// synchronous run cannot stall other work.
    pub sync_limit: u32,
    /// Block SIGPROF for the duration of the wait syscall. Used when a
    /// sampling profiler must not interrupt the blocking wait.
    pub block_sigprof: bool,
    /// Track how long the loop spends blocked waiting for completions.
    /// When enabled, the first wait of each poll is non-blocking so the
    /// idle clock only measures genuine blocking time.
    pub idle_time: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 4096,
            sync_limit: 40,
            block_sigprof: false,
            idle_time: false,
        }
    }
}
