//! # Exception policies for the run supervisor.
//!
//! [`RunExceptionPolicy`] determines how the supervisor reacts when a
//! module's `run_loop` fails.
//!
//! - [`RunExceptionPolicy::LogAndStopModule`] log and stop that loop (default).
//! - [`RunExceptionPolicy::LogAndRemoveModule`] log and remove the module from the agent.
//! - [`RunExceptionPolicy::LogAndRerunModule`] log and restart the loop after a backoff.
//! - [`RunExceptionPolicy::LogAndRerunAll`] log, cancel everything, restart all loops.
//! - [`RunExceptionPolicy::LogAndStopAll`] log, cancel everything, return.
//! - [`RunExceptionPolicy::RethrowAndStopAll`] cancel everything, propagate the error.
//!
//! A run loop returning [`ModuleError::Canceled`](crate::ModuleError::Canceled)
//! is a graceful exit; no policy is applied.

/// Policy controlling how the run supervisor reacts to a failing run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunExceptionPolicy {
    /// Log the error and stop supervising the offending loop; others continue (default).
    LogAndStopModule,
    /// Log the error and remove the offending module from the agent; others continue.
    LogAndRemoveModule,
    /// Log the error and restart the offending loop after the configured backoff;
    /// others continue.
    LogAndRerunModule,
    /// Log the error, cancel every loop, and restart the whole supervisor pass
    /// after the configured backoff.
    LogAndRerunAll,
    /// Log the error, cancel every loop, and return.
    LogAndStopAll,
    /// Cancel every loop and propagate the error to the `run` caller.
    RethrowAndStopAll,
}

impl Default for RunExceptionPolicy {
    /// Returns [`RunExceptionPolicy::LogAndStopModule`].
    fn default() -> Self {
        RunExceptionPolicy::LogAndStopModule
    }
}

impl RunExceptionPolicy {
    /// True if the policy cancels every loop when one fails.
    pub fn stops_all(&self) -> bool {
        matches!(
            self,
            RunExceptionPolicy::LogAndRerunAll
                | RunExceptionPolicy::LogAndStopAll
                | RunExceptionPolicy::RethrowAndStopAll
        )
    }
}
