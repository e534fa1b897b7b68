//! # Processor: one element of a signaler's dispatch chain.
//!
//! A processor is a tagged variant wrapping user callbacks:
//!
//! - **Observer**: push-style observer; sees the value, cannot respond.
//! - **ReceiverVoid / ReceiverReturning**: synchronous receivers, the latter
//!   yields one dyn-typed response per signal.
//! - **AsyncReceiverVoid / AsyncReceiverReturning**: awaited before any
//!   downstream item is produced.
//! - **Interceptor**: receives the value plus a continuation; controls
//!   whether and with what value the rest of the chain runs.
//!
//! Each entry carries an optional owning-module back-reference used for
//! preferred ordering and for back-removal when the module leaves the agent.
//!
//! ## Rules
//! - Callbacks are `Arc`-wrapped so a dispatch snapshot stays valid after the
//!   processor is unsubscribed.
//! - Responses travel as `Box<dyn Any + Send>`; the send side downcasts to
//!   the requested response type and drops mismatches.
//! - Panics inside callbacks are caught at the invocation boundary
//!   ([`catch_invoke`]); dispatch continues.

use std::any::Any;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::module::ModuleId;

/// A dynamically typed response item flowing back to the sender.
pub type BoxAny = Box<dyn Any + Send>;

/// The dyn-typed remainder of a dispatch chain.
pub(crate) type ResponseStream = BoxStream<'static, BoxAny>;

/// Continuation invoking the rest of the chain with a (possibly replaced) value.
pub(crate) type Continuation<T> = Arc<dyn Fn(T) -> ResponseStream + Send + Sync>;

/// Tagged processor variants. See the module docs for per-kind semantics.
pub(crate) enum ProcessorKind<T> {
    Observer(Arc<dyn Fn(&T) + Send + Sync>),
    ReceiverVoid(Arc<dyn Fn(T) + Send + Sync>),
    ReceiverReturning(Arc<dyn Fn(T) -> BoxAny + Send + Sync>),
    AsyncReceiverVoid(Arc<dyn Fn(T) -> BoxFuture<'static, ()> + Send + Sync>),
    AsyncReceiverReturning(Arc<dyn Fn(T) -> BoxFuture<'static, BoxAny> + Send + Sync>),
    Interceptor(Arc<dyn Fn(T, Continuation<T>) -> ResponseStream + Send + Sync>),
}

impl<T> ProcessorKind<T> {
    /// Short label for diagnostics.
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ProcessorKind::Observer(_) => "observer",
            ProcessorKind::ReceiverVoid(_) => "receiver",
            ProcessorKind::ReceiverReturning(_) => "receiver_returning",
            ProcessorKind::AsyncReceiverVoid(_) => "async_receiver",
            ProcessorKind::AsyncReceiverReturning(_) => "async_receiver_returning",
            ProcessorKind::Interceptor(_) => "interceptor",
        }
    }
}

impl<T> Clone for ProcessorKind<T> {
    fn clone(&self) -> Self {
        match self {
            ProcessorKind::Observer(f) => ProcessorKind::Observer(Arc::clone(f)),
            ProcessorKind::ReceiverVoid(f) => ProcessorKind::ReceiverVoid(Arc::clone(f)),
            ProcessorKind::ReceiverReturning(f) => ProcessorKind::ReceiverReturning(Arc::clone(f)),
            ProcessorKind::AsyncReceiverVoid(f) => ProcessorKind::AsyncReceiverVoid(Arc::clone(f)),
            ProcessorKind::AsyncReceiverReturning(f) => {
                ProcessorKind::AsyncReceiverReturning(Arc::clone(f))
            }
            ProcessorKind::Interceptor(f) => ProcessorKind::Interceptor(Arc::clone(f)),
        }
    }
}

/// One subscribed processor inside a signaler's copy-on-write array.
pub(crate) struct ProcessorEntry<T> {
    /// Subscription-insertion order within the owning signaler.
    pub(crate) id: u64,
    /// Owning module, if subscribed through a module façade.
    pub(crate) owner: Option<ModuleId>,
    /// Owner display name, for diagnostics.
    pub(crate) owner_name: Option<Arc<str>>,
    /// The wrapped callback.
    pub(crate) kind: ProcessorKind<T>,
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Invokes a sync callback, converting a panic into its message.
pub(crate) fn catch_invoke<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .map_err(|payload| panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_invoke_passes_values_through() {
        assert_eq!(catch_invoke(|| 7).unwrap(), 7);
    }

    #[test]
    fn catch_invoke_captures_panic_message() {
        let err = catch_invoke(|| -> i32 { panic!("kaboom") }).unwrap_err();
        assert_eq!(err, "kaboom");
    }

    #[test]
    fn panic_message_handles_string_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static".to_string());
        assert_eq!(panic_message(payload.as_ref()), "static");
    }
}
