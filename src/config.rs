//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the agent runtime.
//!
//! Config is consumed once at agent construction:
//! `AgentBuilder::new("name").config(cfg).build()`.
//!
//! ## Sentinel values
//! - `bus_capacity = 0` → clamped to 1 by the event bus

use std::time::Duration;

/// Global configuration for the agent runtime.
///
/// Defines:
/// - **Supervisor behavior**: backoff delay before rerunning a failed module loop
/// - **Event system**: bus capacity for lifecycle event delivery
///
/// ## Field semantics
/// - `rerun_backoff`: Delay before a run loop restarts under a rerun policy
/// - `bus_capacity`: Event bus ring buffer size (min 1; clamped)
#[derive(Clone, Debug)]
pub struct Config {
    /// Delay before restarting a module's run loop under
    /// [`RunExceptionPolicy::LogAndRerunModule`](crate::RunExceptionPolicy::LogAndRerunModule)
    /// or [`RunExceptionPolicy::LogAndRerunAll`](crate::RunExceptionPolicy::LogAndRerunAll).
    pub rerun_backoff: Duration,

    /// Capacity of the lifecycle event bus broadcast channel ring buffer.
    ///
    /// Slow subscribers that lag behind more than `bus_capacity` messages will
    /// receive `Lagged` and skip older items. Minimum value is 1 (enforced by
    /// the bus).
    pub bus_capacity: usize,
}

impl Config {
    /// Returns a bus capacity clamped to a minimum of 1.
    ///
    /// The event bus uses this value to avoid constructing an invalid channel.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `rerun_backoff = 10ms` (fast restart, cancellable)
    /// - `bus_capacity = 1024` (good baseline)
    fn default() -> Self {
        Self {
            rerun_backoff: Duration::from_millis(10),
            bus_capacity: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.rerun_backoff, Duration::from_millis(10));
        assert_eq!(cfg.bus_capacity, 1024);
    }

    #[test]
    fn bus_capacity_is_clamped() {
        let cfg = Config {
            bus_capacity: 0,
            ..Config::default()
        };
        assert_eq!(cfg.bus_capacity_clamped(), 1);
    }
}
