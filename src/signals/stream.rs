//! # Response and observation streams.
//!
//! - [`SignalStream<R>`]: the lazy asynchronous sequence of responses
//!   returned by `send_for`. Nothing in the chain runs until it is polled;
//!   dropping it early abandons the rest of the chain.
//! - [`Observation<T>`]: a push-observer subscription exposed as a stream;
//!   dropping it unsubscribes the underlying observer.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

use super::subscription::SubscriptionHandle;

/// Lazy asynchronous sequence of typed responses from one dispatch.
///
/// Consumers pull values; each processor boundary in the chain is a
/// suspension point. The sequence ends when the chain is exhausted.
pub struct SignalStream<R> {
    inner: BoxStream<'static, R>,
}

impl<R: Send + 'static> SignalStream<R> {
    pub(crate) fn new(inner: BoxStream<'static, R>) -> Self {
        Self { inner }
    }

    /// Drives the chain to completion, collecting every response in order.
    pub async fn collect_all(mut self) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(item) = self.inner.next().await {
            out.push(item);
        }
        out
    }

    /// Drives the chain to completion, discarding responses.
    pub async fn drain(mut self) {
        while self.inner.next().await.is_some() {}
    }
}

impl<R> Stream for SignalStream<R> {
    type Item = R;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Live observer subscription for signals of type `T`.
///
/// Every signal dispatched after the subscription reaches the observation in
/// dispatch order. Dropping the observation unsubscribes the observer.
pub struct Observation<T> {
    rx: mpsc::UnboundedReceiver<T>,
    handle: SubscriptionHandle,
}

impl<T> Observation<T> {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>, handle: SubscriptionHandle) -> Self {
        Self { rx, handle }
    }

    /// Receives the next observed signal, or `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Receives an already-delivered signal without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Observation<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl<T> Drop for Observation<T> {
    fn drop(&mut self) {
        self.handle.dispose();
    }
}
