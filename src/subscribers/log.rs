//! # TraceSubscriber — forwards runtime events to `tracing`.
//!
//! A built-in subscriber that maps [`Event`]s to [`tracing`] records:
//! failures at error level, vetoes and overflow at warn, lifecycle at debug.
//!
//! ## Example output
//! ```text
//! DEBUG modvisor: module added module="Worker"
//! ERROR modvisor: run loop failed module="Worker" err="execution failed: boom" attempt=1
//! DEBUG modvisor: rerun scheduled module="Worker" delay=10ms
//! ```

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Event subscriber that logs through `tracing`.
#[derive(Default)]
pub struct TraceSubscriber;

impl TraceSubscriber {
    /// Construct a new [`TraceSubscriber`].
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for TraceSubscriber {
    async fn on_event(&self, e: &Event) {
        match e.kind {
            EventKind::StateChanged => {
                debug!(state = ?e.state, "agent state changed");
            }
            EventKind::ModuleAdded => {
                debug!(module = ?e.module, "module added");
            }
            EventKind::ModuleRemoved => {
                debug!(module = ?e.module, "module removed");
            }
            EventKind::RemovalVetoed => {
                warn!(module = ?e.module, err = ?e.error, "module removal vetoed");
            }
            EventKind::ModuleInitialized => {
                debug!(module = ?e.module, "module initialized");
            }
            EventKind::ModuleInitFailed => {
                error!(module = ?e.module, err = ?e.error, "module initialization failed");
            }
            EventKind::RunLoopStarting => {
                debug!(module = ?e.module, attempt = ?e.attempt, "run loop starting");
            }
            EventKind::RunLoopStopped => {
                debug!(module = ?e.module, "run loop stopped");
            }
            EventKind::RunLoopFailed => {
                error!(module = ?e.module, err = ?e.error, attempt = ?e.attempt, "run loop failed");
            }
            EventKind::RerunScheduled => {
                debug!(module = ?e.module, delay = ?e.delay, "rerun scheduled");
            }
            EventKind::SupervisorStopped => {
                debug!(err = ?e.error, "supervisor stopped");
            }
            EventKind::ProcessorPanicked => {
                error!(module = ?e.module, err = ?e.error, "signal processor panicked");
            }
            EventKind::SubscriberOverflow => {
                warn!(err = ?e.error, "subscriber overflow");
            }
            EventKind::SubscriberPanicked => {
                error!(module = ?e.module, err = ?e.error, "subscriber panicked");
            }
        }
    }

    fn name(&self) -> &'static str {
        "trace"
    }
}
