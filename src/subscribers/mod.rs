//! # Event subscribers: fan-out of runtime events to user code.
//!
//! - [`Subscribe`]: the extension point for plugging custom event handlers
//!   into the runtime.
//! - [`SubscriberSet`]: non-blocking fan-out with per-subscriber bounded
//!   queues and panic isolation.
//! - [`TraceSubscriber`]: built-in subscriber that forwards events to
//!   [`tracing`].

mod log;
mod set;
mod subscriber;

pub use log::TraceSubscriber;
pub use set::SubscriberSet;
pub use subscriber::Subscribe;
