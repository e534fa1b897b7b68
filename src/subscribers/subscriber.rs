//! # Event subscriber trait.
//!
//! Provides [`Subscribe`] — the extension point for plugging custom event
//! handlers into the runtime.
//!
//! Each subscriber gets:
//! - **Dedicated worker task** (runs independently)
//! - **Bounded queue** (configurable capacity via [`Subscribe::queue_capacity`])
//! - **Panic isolation** (panics caught, reported as `SubscriberPanicked`)
//!
//! ## Architecture
//! ```text
//! SubscriberSet ──► [queue] ──► worker task ──► subscriber.on_event()
//!                  (bounded)             └────► panic caught & isolated
//! ```
//!
//! ## Rules
//! - Slow subscribers only affect themselves (queue overflow → event drop)
//! - Panics are **isolated** (do not crash the runtime or other subscribers)
//! - Subscribers **do not block** publishers or other subscribers
//! - Queue capacity is **per-subscriber** (not global)

use async_trait::async_trait;

use crate::events::Event;

/// Event subscriber for runtime observability.
///
/// Receives events from the runtime via a dedicated worker task with a
/// bounded queue.
///
/// ### Implementation requirements
/// - **Async-friendly**: avoid blocking operations, use async I/O
/// - **Error handling**: handle errors internally, do not panic
/// - Slow processing only affects this subscriber's queue
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    /// Processes a single event.
    ///
    /// Called from a dedicated worker task (not the publisher); events are
    /// processed sequentially in FIFO order. Panics are caught and reported
    /// as `SubscriberPanicked`.
    async fn on_event(&self, event: &Event);

    /// Returns subscriber name for logging and diagnostics.
    ///
    /// Used in `SubscriberOverflow` and `SubscriberPanicked` events.
    /// Keep short and descriptive (e.g., "metrics", "audit").
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Returns preferred queue capacity for this subscriber.
    ///
    /// When the queue is full, new events are dropped for this subscriber
    /// only and a `SubscriberOverflow` event is published.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
