//! # Runtime events emitted by the agent, supervisor, and signalers.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Lifecycle events**: agent state transitions, module membership
//! - **Initialization events**: module init scheduling and outcomes
//! - **Supervisor events**: run loop flow (starting, stopped, failed, rerun)
//! - **Diagnostics**: processor panics, subscriber overflow/panics
//!
//! The [`Event`] struct carries additional metadata such as timestamps,
//! module names, error messages, and backoff delays.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases
//! monotonically. This guarantees that events can be ordered correctly even
//! when delivered out-of-order through async channels.
//!
//! ## Event flow examples
//!
//! ### Module addition after `initialize`
//! ```text
//! Agent::add()
//!   → ModuleAdded
//!   → [spawned initialize]
//!   → ModuleInitialized | ModuleInitFailed
//! ```
//!
//! ### Run loop failure under `LogAndRerunModule`
//! ```text
//! RunLoopStarting
//!   → RunLoopFailed
//!   → RerunScheduled (with delay)
//!   → RunLoopStarting (next attempt, new seq)
//! ```

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, SystemTime};

use crate::agent::AgentState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Agent lifecycle ===
    /// The agent transitioned to a new lifecycle state.
    StateChanged,
    /// A module was appended to the agent's sequence.
    ModuleAdded,
    /// A module was removed from the agent.
    ModuleRemoved,
    /// A removal batch was refused or shrunk by a dispose-time veto.
    RemovalVetoed,

    // === Initialization ===
    /// A module's `initialize` completed successfully.
    ModuleInitialized,
    /// A module's `initialize` failed.
    ModuleInitFailed,

    // === Run supervisor ===
    /// A module's run loop is starting.
    RunLoopStarting,
    /// A module's run loop exited (completion or graceful cancel).
    RunLoopStopped,
    /// A module's run loop failed with an error.
    RunLoopFailed,
    /// A failed run loop is scheduled to restart after a backoff delay.
    RerunScheduled,
    /// The supervisor pass ended (all loops done, stop-all policy, or cancel).
    SupervisorStopped,

    // === Diagnostics ===
    /// A signal processor panicked during dispatch; the chain continued.
    ProcessorPanicked,
    /// Subscriber dropped an event (queue full or worker closed).
    SubscriberOverflow,
    /// Subscriber panicked during event processing.
    SubscriberPanicked,
}

/// Runtime event with optional metadata.
///
/// Carries information about lifecycle transitions, module membership,
/// run loop attempts, errors, and backoff delays.
///
/// ## Fields
///
/// - `seq`: Unique sequence number for ordering (monotonically increasing)
/// - `at`: Wall-clock timestamp (may go backwards due to NTP, use for logging only)
/// - `kind`: Event classification
/// - `module`, `error`, `attempt`, `delay`, `state`: Optional metadata
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    /// Used to determine event ordering across async boundaries.
    pub seq: u64,
    /// Wall-clock timestamp (may go backwards, use for logging only).
    pub at: SystemTime,
    /// The kind of event.
    pub kind: EventKind,
    /// Display name of the module, if applicable.
    pub module: Option<String>,
    /// Error message, if the event represents a failure.
    pub error: Option<String>,
    /// Run loop attempt count (starting from 1).
    pub attempt: Option<u64>,
    /// Backoff delay before a rerun (if relevant).
    pub delay: Option<Duration>,
    /// New lifecycle state (for `StateChanged`).
    pub state: Option<AgentState>,
}

impl Event {
    /// Creates a new event of the given kind with the current timestamp and
    /// next sequence number.
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            module: None,
            error: None,
            attempt: None,
            delay: None,
            state: None,
        }
    }

    /// Attaches a module display name.
    pub fn with_module(mut self, name: impl Into<String>) -> Self {
        self.module = Some(name.into());
        self
    }

    /// Attaches an error message.
    pub fn with_error(mut self, msg: impl Into<String>) -> Self {
        self.error = Some(msg.into());
        self
    }

    /// Attaches an attempt count.
    pub fn with_attempt(mut self, n: u64) -> Self {
        self.attempt = Some(n);
        self
    }

    /// Attaches a backoff delay.
    pub fn with_delay(mut self, d: Duration) -> Self {
        self.delay = Some(d);
        self
    }

    /// Attaches a lifecycle state.
    pub fn with_state(mut self, state: AgentState) -> Self {
        self.state = Some(state);
        self
    }

    /// Creates a subscriber overflow event.
    ///
    /// Emitted when a subscriber's queue is full and an event is dropped.
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::now(EventKind::SubscriberOverflow)
            .with_error(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    ///
    /// Emitted when a subscriber panics during event processing.
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::now(EventKind::SubscriberPanicked)
            .with_module(subscriber)
            .with_error(info)
    }

    /// True for events the fan-out layer must not re-report on failure,
    /// to avoid overflow/panic storms.
    pub(crate) fn is_internal_diagnostic(&self) -> bool {
        matches!(
            self.kind,
            EventKind::SubscriberOverflow | EventKind::SubscriberPanicked
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seq_is_monotonic() {
        let a = Event::now(EventKind::ModuleAdded);
        let b = Event::now(EventKind::ModuleRemoved);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn builder_attaches_metadata() {
        let ev = Event::now(EventKind::RunLoopFailed)
            .with_module("worker")
            .with_error("boom")
            .with_attempt(3)
            .with_delay(Duration::from_millis(10));

        assert_eq!(ev.kind, EventKind::RunLoopFailed);
        assert_eq!(ev.module.as_deref(), Some("worker"));
        assert_eq!(ev.error.as_deref(), Some("boom"));
        assert_eq!(ev.attempt, Some(3));
        assert_eq!(ev.delay, Some(Duration::from_millis(10)));
    }

    #[test]
    fn diagnostics_are_flagged() {
        assert!(Event::subscriber_overflow("s", "full").is_internal_diagnostic());
        assert!(!Event::now(EventKind::ModuleAdded).is_internal_diagnostic());
    }
}
