use std::time::{Duration, Instant};

/// Idle-time accounting for the loop.
///
/// Tracks the time the loop spends blocked in the wait syscall. The poll
/// tick records a provider-entry timestamp right before a blocking wait;
/// the first callback dispatched after waking folds the elapsed span into
/// the accumulator.
#[derive(Debug, Default)]
pub(crate) struct IdleMetrics {
    enabled: bool,
    idle: Duration,
    provider_entry: Option<Instant>,
}

impl IdleMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            idle: Duration::ZERO,
            provider_entry: None,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Record the instant the loop is about to block.
    pub fn set_provider_entry_time(&mut self) {
        if self.enabled {
            self.provider_entry = Some(Instant::now());
        }
    }

    /// Fold the blocked span into the idle accumulator. Called before each
    /// callback; a no-op unless a provider entry is outstanding.
    pub fn update_idle_time(&mut self) {
        if let Some(entry) = self.provider_entry.take() {
            self.idle += entry.elapsed();
        }
    }

    pub fn idle_time(&self) -> Duration {
        self.idle
    }
}
