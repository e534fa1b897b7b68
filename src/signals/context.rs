//! # SignalContext: the argument handed to an interceptor.
//!
//! Carries the current signal value and a continuation that invokes the
//! remainder of the dispatch chain.
//!
//! ## Rules
//! - `next()` resumes the chain with the **original** value; `next_with(v)`
//!   resumes it with a replacement.
//! - Invoking the continuation multiple times is permitted and yields
//!   concatenated sequences.
//! - Not invoking it suppresses the remainder of the chain entirely — no
//!   later processor (observers included) sees the value.
//! - Continuation items are downcast to the interceptor's declared response
//!   type; mismatches are silently dropped.

use std::marker::PhantomData;

use futures::stream::BoxStream;
use futures::StreamExt;

use super::processor::{BoxAny, Continuation};
use super::Signal;

/// Context passed to an interceptor of signals of type `T` declaring
/// responses of type `R`.
///
/// The continuation is pure with respect to the interceptor: calling it
/// builds a fresh lazy stream over the rest of the chain and mutates no
/// shared state.
pub struct SignalContext<T, R> {
    value: T,
    next: Continuation<T>,
    _response: PhantomData<fn() -> R>,
}

impl<T: Signal, R: Send + 'static> SignalContext<T, R> {
    pub(crate) fn new(value: T, next: Continuation<T>) -> Self {
        Self {
            value,
            next,
            _response: PhantomData,
        }
    }

    /// The signal value as it arrived at this interceptor.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Resumes the remainder of the chain with the original value.
    pub fn next(&self) -> BoxStream<'static, R> {
        self.next_with(self.value.clone())
    }

    /// Resumes the remainder of the chain with a replacement value.
    ///
    /// Items produced downstream are downcast to `R`; mismatches are
    /// silently dropped.
    pub fn next_with(&self, value: T) -> BoxStream<'static, R> {
        (self.next)(value)
            .filter_map(|item| futures::future::ready(item.downcast::<R>().ok().map(|b| *b)))
            .boxed()
    }
}

/// Dynamically typed interceptor context: downstream responses stay as
/// `Box<dyn Any + Send>` instead of being downcast to a declared type.
///
/// Used by the `intercept_any` façade variant, for interceptors that relay
/// responses of arbitrary types.
pub struct RawSignalContext<T> {
    value: T,
    next: Continuation<T>,
}

impl<T: Signal> RawSignalContext<T> {
    pub(crate) fn new(value: T, next: Continuation<T>) -> Self {
        Self { value, next }
    }

    /// The signal value as it arrived at this interceptor.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// Resumes the remainder of the chain with the original value.
    pub fn next(&self) -> BoxStream<'static, BoxAny> {
        self.next_with(self.value.clone())
    }

    /// Resumes the remainder of the chain with a replacement value.
    pub fn next_with(&self, value: T) -> BoxStream<'static, BoxAny> {
        (self.next)(value)
    }
}
