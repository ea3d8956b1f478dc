use std::time::Duration;

use tokio::time::Instant;

/// The single wall-clock budget of one job execution.
///
/// Cloning shares the same start instant, so every retry loop, governor wait
/// and poll sleep inside the execution measures against one clock.
#[derive(Debug, Clone, Copy)]
pub struct RunBudget {
    started: Instant,
    max_runtime: Duration,
}

impl RunBudget {
    /// Start the clock now.
    pub fn start(max_runtime: Duration) -> Self {
        Self {
            started: Instant::now(),
            max_runtime,
        }
    }

    /// A budget that effectively never runs out.
    pub fn unbounded() -> Self {
        Self::start(Duration::from_secs(100 * 365 * 24 * 3600))
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime
    }

    pub fn remaining(&self) -> Duration {
        self.max_runtime.saturating_sub(self.elapsed())
    }

    pub fn is_exhausted(&self) -> bool {
        self.elapsed() >= self.max_runtime
    }

    /// Whether waiting `delay` from now would cross the deadline.
    pub fn would_exceed(&self, delay: Duration) -> bool {
        self.elapsed().saturating_add(delay) > self.max_runtime
    }
}
