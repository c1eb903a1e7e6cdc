//! Scheduler Configuration

use std::time::Duration;

/// Scheduler configuration options
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Longest idle period granted while no frames are expected
    pub max_idle_period: Duration,

    /// How long the run loop sleeps before re-checking for idle time
    pub idle_wait_bound: Duration,

    /// Quiet window after an input event during which no long idle period starts
    pub input_quiescence: Duration,

    /// Grant long idle periods when no frame is expected soon
    pub long_idle_periods: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_idle_period: Duration::from_millis(50),
            idle_wait_bound: Duration::from_millis(100),
            input_quiescence: Duration::from_millis(100),
            long_idle_periods: true,
        }
    }
}

impl SchedulerConfig {
    /// Set the long idle period cap
    pub fn with_max_idle_period(mut self, period: Duration) -> Self {
        self.max_idle_period = period;
        self
    }

    /// Set the run loop's idle re-check interval
    pub fn with_idle_wait_bound(mut self, bound: Duration) -> Self {
        self.idle_wait_bound = bound;
        self
    }

    /// Set the post-input quiet window
    pub fn with_input_quiescence(mut self, window: Duration) -> Self {
        self.input_quiescence = window;
        self
    }

    /// Enable or disable long idle periods
    pub fn with_long_idle_periods(mut self, enabled: bool) -> Self {
        self.long_idle_periods = enabled;
        self
    }
}
