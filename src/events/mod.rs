//! # Lifecycle events emitted by the agent runtime.
//!
//! - [`Event`] / [`EventKind`]: structured runtime events with global
//!   sequence numbers and builder-style metadata.
//! - [`Bus`]: broadcast channel the agent, supervisor, and signalers publish to.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
