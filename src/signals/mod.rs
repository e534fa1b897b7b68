//! # Typed signal pipeline: signalers, processors, contexts, subscriptions.
//!
//! A signal is a value of some type `T` dispatched through the agent's
//! pipeline for that type. Each type has one [`Signaler<T>`] holding an
//! ordered chain of processors; dispatch walks the chain lazily, letting
//! interceptors transform or suppress the value and receivers yield typed
//! responses back to the sender.
//!
//! ## Architecture
//! ```text
//! Agent::send_for::<T, R>(value)
//!        │
//!        ▼
//! Signaler<T> ── snapshot processor array (copy-on-write, lock-free read)
//!        │
//!        ▼
//! chain(0, value) ──► P[0] ──► P[1] ──► … ──► P[n-1] ──► end
//!                      │ interceptor: SignalContext{value, next}
//!                      │   - next(v') resumes the rest of the chain
//!                      │   - no next() call ⇒ suppression
//!                      └ receivers/observers: observe v, maybe yield responses
//!        │
//!        ▼
//! responses (dyn-typed) ── downcast filter ──► SignalStream<R>
//! ```
//!
//! ## Rules
//! - Dispatch is **lazy**: nothing runs until the returned stream is polled.
//! - Each dispatch observes the processor array **snapshot** taken at send
//!   time; membership changes never affect an in-flight dispatch.
//! - Processor panics are caught, logged, published as `ProcessorPanicked`,
//!   and the chain continues with the unchanged value.
//! - Responses of the wrong dynamic type are silently dropped.

mod context;
mod processor;
mod signaler;
mod stream;
mod subscription;

pub use context::{RawSignalContext, SignalContext};
pub use processor::BoxAny;
pub use signaler::Signaler;
pub use stream::{Observation, SignalStream};
pub use subscription::SubscriptionHandle;

pub(crate) use processor::{panic_message, Continuation, ProcessorEntry, ProcessorKind, ResponseStream};
pub(crate) use signaler::AnySignaler;

/// Marker for types that can travel the signal pipeline.
///
/// Blanket-implemented: any `Clone + Send + Sync + 'static` type is a signal.
/// Values are cloned once per processor step, so keep signal types cheap to
/// clone (or wrap them in `Arc`).
pub trait Signal: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Signal for T {}
