//! # Signaler: per-type dispatcher holding the ordered processor chain.
//!
//! One [`Signaler<T>`] exists per signal type per agent. It owns two
//! copy-on-write arrays — the processor chain and the preferred module
//! order — guarded by a single mutex held only across swaps. Dispatch reads
//! a local snapshot and never takes the lock while user code runs.
//!
//! ## Dispatch semantics
//! Let `chain(i, v)` be the sequence produced by processor `i` observing `v`
//! with continuation `λv'. chain(i+1, v')`, and `chain(n, _)` the empty
//! sequence. With **zero** processors and matching signal/response types, the
//! value passes through as its own single response.
//!
//! Per-processor:
//! ```text
//! Observer                 see v            → chain(i+1, v)
//! ReceiverVoid             call f(v)        → chain(i+1, v)
//! ReceiverReturning        r = f(v)         → r, chain(i+1, v)
//! AsyncReceiver*           await f(v) first → as above
//! Interceptor              f(ctx{v, next})  → whatever f yields; calling
//!                                            next(v') splices chain(i+1, v')
//! ```
//!
//! ## Rules
//! - Preferred-order processors first (declared order), then the rest in
//!   subscription-insertion order; ties within one module keep insertion order.
//! - An interceptor that never calls `next` suppresses the remainder of the
//!   chain — observers included.
//! - A panicking processor is caught, logged, reported on the bus, and the
//!   chain continues with the unchanged value.
//! - Responses are downcast to the requested type; mismatches drop silently.

use std::any::{Any, TypeId};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use futures::stream;
use futures::{FutureExt, StreamExt};

use crate::events::{Bus, Event, EventKind};
use crate::module::ModuleId;

use super::context::{RawSignalContext, SignalContext};
use super::processor::{
    catch_invoke, BoxAny, Continuation, ProcessorEntry, ProcessorKind, ResponseStream,
};
use super::stream::SignalStream;
use super::Signal;

/// Identity of a module subscribing a processor: id plus display name.
pub(crate) type OwnerRef = Option<(ModuleId, Arc<str>)>;

/// The two copy-on-write arrays, swapped together under the signaler mutex.
struct Arrays<T> {
    entries: Arc<[Arc<ProcessorEntry<T>>]>,
    preferred: Arc<[ModuleId]>,
}

/// Per-type dispatcher with an ordered, interceptable processor chain.
pub struct Signaler<T: Signal> {
    arrays: Mutex<Arrays<T>>,
    next_id: AtomicU64,
    bus: Bus,
    signal_name: &'static str,
}

impl<T: Signal> Signaler<T> {
    pub(crate) fn new(bus: Bus) -> Arc<Self> {
        Arc::new(Self {
            arrays: Mutex::new(Arrays {
                entries: Arc::from(Vec::new()),
                preferred: Arc::from(Vec::new()),
            }),
            next_id: AtomicU64::new(0),
            bus,
            signal_name: std::any::type_name::<T>(),
        })
    }

    // ---------------------------
    // Subscription
    // ---------------------------

    pub(crate) fn subscribe_observer(
        &self,
        owner: OwnerRef,
        f: impl Fn(&T) + Send + Sync + 'static,
    ) -> u64 {
        self.push(owner, ProcessorKind::Observer(Arc::new(f)))
    }

    pub(crate) fn subscribe_receiver(
        &self,
        owner: OwnerRef,
        f: impl Fn(T) + Send + Sync + 'static,
    ) -> u64 {
        self.push(owner, ProcessorKind::ReceiverVoid(Arc::new(f)))
    }

    pub(crate) fn subscribe_receiver_returning<R: Send + 'static>(
        &self,
        owner: OwnerRef,
        f: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> u64 {
        let call = move |value: T| Box::new(f(value)) as BoxAny;
        self.push(owner, ProcessorKind::ReceiverReturning(Arc::new(call)))
    }

    pub(crate) fn subscribe_async_receiver<Fut>(
        &self,
        owner: OwnerRef,
        f: impl Fn(T) -> Fut + Send + Sync + 'static,
    ) -> u64
    where
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let call = move |value: T| f(value).boxed();
        self.push(owner, ProcessorKind::AsyncReceiverVoid(Arc::new(call)))
    }

    pub(crate) fn subscribe_async_receiver_returning<R, Fut>(
        &self,
        owner: OwnerRef,
        f: impl Fn(T) -> Fut + Send + Sync + 'static,
    ) -> u64
    where
        R: Send + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
    {
        let call = move |value: T| f(value).map(|r| Box::new(r) as BoxAny).boxed();
        self.push(owner, ProcessorKind::AsyncReceiverReturning(Arc::new(call)))
    }

    pub(crate) fn subscribe_interceptor<R, S, F>(&self, owner: OwnerRef, f: F) -> u64
    where
        R: Send + 'static,
        S: futures::Stream<Item = R> + Send + 'static,
        F: Fn(SignalContext<T, R>) -> S + Send + Sync + 'static,
    {
        let call = move |value: T, next: Continuation<T>| -> ResponseStream {
            let ctx = SignalContext::new(value, next);
            f(ctx).map(|r| Box::new(r) as BoxAny).boxed()
        };
        self.push(owner, ProcessorKind::Interceptor(Arc::new(call)))
    }

    pub(crate) fn subscribe_interceptor_any<S, F>(&self, owner: OwnerRef, f: F) -> u64
    where
        S: futures::Stream<Item = BoxAny> + Send + 'static,
        F: Fn(RawSignalContext<T>) -> S + Send + Sync + 'static,
    {
        let call = move |value: T, next: Continuation<T>| -> ResponseStream {
            let ctx = RawSignalContext::new(value, next);
            f(ctx).boxed()
        };
        self.push(owner, ProcessorKind::Interceptor(Arc::new(call)))
    }

    fn push(&self, owner: OwnerRef, kind: ProcessorKind<T>) -> u64 {
        let id = self.next_id.fetch_add(1, AtomicOrdering::Relaxed);
        let (owner_id, owner_name) = match owner {
            Some((m, name)) => (Some(m), Some(name)),
            None => (None, None),
        };
        let entry = Arc::new(ProcessorEntry {
            id,
            owner: owner_id,
            owner_name,
            kind,
        });

        let mut arrays = self.arrays.lock().unwrap_or_else(|p| p.into_inner());
        let mut next: Vec<Arc<ProcessorEntry<T>>> = arrays.entries.iter().cloned().collect();
        next.push(entry);
        arrays.entries = sorted(next, &arrays.preferred);
        id
    }

    // ---------------------------
    // Removal & ordering
    // ---------------------------

    /// Removes one processor by subscription id (no-op if already gone).
    pub(crate) fn remove(&self, id: u64) {
        self.retain(|e| e.id != id);
    }

    /// Removes every processor owned by the given module.
    pub(crate) fn remove_owner_entries(&self, owner: ModuleId) {
        self.retain(|e| e.owner != Some(owner));
    }

    fn retain(&self, keep: impl Fn(&ProcessorEntry<T>) -> bool) {
        let mut arrays = self.arrays.lock().unwrap_or_else(|p| p.into_inner());
        let next: Vec<Arc<ProcessorEntry<T>>> = arrays
            .entries
            .iter()
            .filter(|e| keep(e))
            .cloned()
            .collect();
        arrays.entries = Arc::from(next);
    }

    /// Replaces the preferred module order and recomputes the chain.
    pub(crate) fn set_preferred_order(&self, order: Vec<ModuleId>) {
        let mut arrays = self.arrays.lock().unwrap_or_else(|p| p.into_inner());
        arrays.preferred = Arc::from(order);
        let current: Vec<Arc<ProcessorEntry<T>>> = arrays.entries.iter().cloned().collect();
        arrays.entries = sorted(current, &arrays.preferred);
    }

    fn snapshot(&self) -> Arc<[Arc<ProcessorEntry<T>>]> {
        let arrays = self.arrays.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(&arrays.entries)
    }

    // ---------------------------
    // Dispatch
    // ---------------------------

    /// Dispatches `value`, returning the lazy response stream downcast to `R`.
    ///
    /// With zero processors the value passes through as its own response when
    /// `R` and `T` are the same type; otherwise the stream is empty.
    pub(crate) fn dispatch_for<R: Send + 'static>(&self, value: T) -> SignalStream<R> {
        let entries = self.snapshot();
        let raw: ResponseStream = if entries.is_empty() {
            if TypeId::of::<R>() == TypeId::of::<T>() {
                stream::once(futures::future::ready(Box::new(value) as BoxAny)).boxed()
            } else {
                stream::empty().boxed()
            }
        } else {
            let env = Arc::new(ChainEnv {
                entries,
                bus: self.bus.clone(),
                signal_name: self.signal_name,
            });
            chain(env, 0, value)
        };

        SignalStream::new(
            raw.filter_map(|item| futures::future::ready(item.downcast::<R>().ok().map(|b| *b)))
                .boxed(),
        )
    }

    /// Dispatches `value` and drives the whole chain, discarding responses.
    pub(crate) async fn dispatch_drain(&self, value: T) {
        let entries = self.snapshot();
        if entries.is_empty() {
            return;
        }
        let env = Arc::new(ChainEnv {
            entries,
            bus: self.bus.clone(),
            signal_name: self.signal_name,
        });
        let mut responses = chain(env, 0, value);
        while responses.next().await.is_some() {}
    }
}

/// Stable chain order: preferred modules first in declared order, then the
/// rest; subscription-insertion order breaks all ties.
fn sorted<T>(
    mut entries: Vec<Arc<ProcessorEntry<T>>>,
    preferred: &Arc<[ModuleId]>,
) -> Arc<[Arc<ProcessorEntry<T>>]> {
    entries.sort_by_key(|e| {
        let rank = e
            .owner
            .and_then(|owner| preferred.iter().position(|m| *m == owner));
        match rank {
            Some(pos) => (0usize, pos, e.id),
            None => (1usize, 0, e.id),
        }
    });
    Arc::from(entries)
}

/// Everything a running dispatch needs, bundled so continuations stay `'static`.
struct ChainEnv<T> {
    entries: Arc<[Arc<ProcessorEntry<T>>]>,
    bus: Bus,
    signal_name: &'static str,
}

impl<T> ChainEnv<T> {
    fn report_panic(&self, entry: &ProcessorEntry<T>, info: String) {
        tracing::error!(
            signal = self.signal_name,
            processor = entry.kind.label(),
            owner = entry.owner_name.as_deref(),
            err = %info,
            "signal processor panicked; chain continues",
        );
        let mut ev = Event::now(EventKind::ProcessorPanicked).with_error(info);
        if let Some(name) = &entry.owner_name {
            ev = ev.with_module(name.as_ref());
        }
        self.bus.publish(ev);
    }
}

/// Builds the lazy tail of the chain starting at processor `idx`.
///
/// Nothing executes until the returned stream is polled; every processor
/// boundary is a suspension point.
fn chain<T: Signal>(env: Arc<ChainEnv<T>>, idx: usize, value: T) -> ResponseStream {
    if idx >= env.entries.len() {
        return stream::empty().boxed();
    }
    let entry = Arc::clone(&env.entries[idx]);

    match entry.kind.clone() {
        ProcessorKind::Observer(f) => stream::once(async move {
            if let Err(info) = catch_invoke(|| f(&value)) {
                env.report_panic(&entry, info);
            }
            chain(env, idx + 1, value)
        })
        .flatten()
        .boxed(),

        ProcessorKind::ReceiverVoid(f) => stream::once(async move {
            if let Err(info) = catch_invoke(|| f(value.clone())) {
                env.report_panic(&entry, info);
            }
            chain(env, idx + 1, value)
        })
        .flatten()
        .boxed(),

        ProcessorKind::ReceiverReturning(f) => stream::once(async move {
            let head = match catch_invoke(|| f(value.clone())) {
                Ok(response) => Some(response),
                Err(info) => {
                    env.report_panic(&entry, info);
                    None
                }
            };
            stream::iter(head).chain(chain(env, idx + 1, value))
        })
        .flatten()
        .boxed(),

        ProcessorKind::AsyncReceiverVoid(f) => stream::once(async move {
            match catch_invoke(|| f(value.clone())) {
                Ok(fut) => {
                    if let Err(payload) = std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                        env.report_panic(&entry, super::processor::panic_message(payload.as_ref()));
                    }
                }
                Err(info) => env.report_panic(&entry, info),
            }
            chain(env, idx + 1, value)
        })
        .flatten()
        .boxed(),

        ProcessorKind::AsyncReceiverReturning(f) => stream::once(async move {
            let head = match catch_invoke(|| f(value.clone())) {
                Ok(fut) => match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(response) => Some(response),
                    Err(payload) => {
                        env.report_panic(&entry, super::processor::panic_message(payload.as_ref()));
                        None
                    }
                },
                Err(info) => {
                    env.report_panic(&entry, info);
                    None
                }
            };
            stream::iter(head).chain(chain(env, idx + 1, value))
        })
        .flatten()
        .boxed(),

        ProcessorKind::Interceptor(f) => {
            let env_for_next = Arc::clone(&env);
            let next: Continuation<T> =
                Arc::new(move |v: T| chain(Arc::clone(&env_for_next), idx + 1, v));
            stream::once(async move {
                match catch_invoke(|| f(value.clone(), Arc::clone(&next))) {
                    Ok(seq) => seq,
                    Err(info) => {
                        env.report_panic(&entry, info);
                        // The interceptor never ran; continue as if it passed
                        // the value through without yielding anything.
                        next(value)
                    }
                }
            })
            .flatten()
            .boxed()
        }
    }
}

/// Type-erased view of a [`Signaler`], stored in the agent's signaler map.
pub(crate) trait AnySignaler: Send + Sync + 'static {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn remove_owner(&self, owner: ModuleId);
    fn set_preferred(&self, order: Vec<ModuleId>);
}

impl<T: Signal> AnySignaler for Signaler<T> {
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn remove_owner(&self, owner: ModuleId) {
        self.remove_owner_entries(owner);
    }

    fn set_preferred(&self, order: Vec<ModuleId>) {
        self.set_preferred_order(order);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn bus() -> Bus {
        Bus::new(16)
    }

    fn owner(name: &str) -> (ModuleId, Arc<str>) {
        (ModuleId::allocate(), Arc::from(name))
    }

    /// String reversal pipeline: interceptor doubles downstream responses and
    /// appends -1; the receiver answers 44 and must see the reversed value.
    #[tokio::test]
    async fn interceptor_transforms_and_extends_responses() {
        let sig = Signaler::<String>::new(bus());
        let foo = owner("Foo");
        let bar = owner("Bar");
        let seen: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));

        sig.subscribe_interceptor(Some(foo.clone()), |ctx: SignalContext<String, i32>| {
            let reversed: String = ctx.value().chars().rev().collect();
            ctx.next_with(reversed)
                .map(|n| n * 2)
                .chain(stream::iter([-1]))
        });
        let seen_by_bar = Arc::clone(&seen);
        sig.subscribe_receiver_returning(Some(bar.clone()), move |v: String| {
            seen_by_bar.lock().unwrap().push(v);
            44i32
        });
        sig.set_preferred_order(vec![foo.0, bar.0]);

        let out = sig.dispatch_for::<i32>("!olleH".to_string()).collect_all().await;
        assert_eq!(out, vec![88, -1]);
        assert_eq!(seen.lock().unwrap().as_slice(), ["Hello!".to_string()]);
    }

    /// With no processors the value is its own response when types align.
    #[tokio::test]
    async fn empty_chain_passes_value_through_on_matching_types() {
        let sig = Signaler::<u32>::new(bus());
        let out = sig.dispatch_for::<u32>(7).collect_all().await;
        assert_eq!(out, vec![7]);

        let none = sig.dispatch_for::<String>(7).collect_all().await;
        assert!(none.is_empty());
    }

    /// Without a preferred order, receivers fire in subscription order.
    #[tokio::test]
    async fn subscription_order_is_preserved() {
        let sig = Signaler::<u8>::new(bus());
        let log: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        for name in ["A", "B", "C"] {
            let log = Arc::clone(&log);
            sig.subscribe_receiver(None, move |_| log.lock().unwrap().push(name));
        }

        sig.dispatch_drain(0).await;
        assert_eq!(log.lock().unwrap().as_slice(), ["A", "B", "C"]);
    }

    /// Preferred order hoists a later subscriber ahead of earlier ones.
    #[tokio::test]
    async fn preferred_order_overrides_subscription_order() {
        let sig = Signaler::<u8>::new(bus());
        let first = owner("First");
        let last = owner("Last");
        let log: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let l = Arc::clone(&log);
        sig.subscribe_receiver(Some(first.clone()), move |_| l.lock().unwrap().push("first"));
        let l = Arc::clone(&log);
        sig.subscribe_receiver(None, move |_| l.lock().unwrap().push("free"));
        let l = Arc::clone(&log);
        sig.subscribe_receiver(Some(last.clone()), move |_| l.lock().unwrap().push("last"));

        sig.set_preferred_order(vec![last.0, first.0]);
        sig.dispatch_drain(0).await;

        assert_eq!(log.lock().unwrap().as_slice(), ["last", "first", "free"]);
    }

    /// An interceptor that never calls `next` suppresses everything after it,
    /// observers included.
    #[tokio::test]
    async fn suppression_stops_the_rest_of_the_chain() {
        let sig = Signaler::<u8>::new(bus());
        let hits = Arc::new(StdMutex::new(0u32));

        sig.subscribe_interceptor(None, |_ctx: SignalContext<u8, u8>| stream::empty::<u8>());
        let h = Arc::clone(&hits);
        sig.subscribe_receiver(None, move |_| *h.lock().unwrap() += 1);
        let h = Arc::clone(&hits);
        sig.subscribe_observer(None, move |_| *h.lock().unwrap() += 1);

        sig.dispatch_drain(9).await;
        assert_eq!(*hits.lock().unwrap(), 0);
    }

    /// Calling `next` twice concatenates two full tail sequences.
    #[tokio::test]
    async fn double_next_concatenates_tails() {
        let sig = Signaler::<u8>::new(bus());

        sig.subscribe_interceptor(None, |ctx: SignalContext<u8, u8>| {
            ctx.next().chain(ctx.next_with(ctx.value() + 1))
        });
        sig.subscribe_receiver_returning(None, |v: u8| v * 10);

        let out = sig.dispatch_for::<u8>(1).collect_all().await;
        assert_eq!(out, vec![10, 20]);
    }

    /// A panicking receiver is caught; later processors still run.
    #[tokio::test]
    async fn panicking_processor_does_not_break_the_chain() {
        let sig = Signaler::<u8>::new(bus());
        let hits = Arc::new(StdMutex::new(0u32));

        sig.subscribe_receiver(None, |_| panic!("receiver boom"));
        let h = Arc::clone(&hits);
        sig.subscribe_receiver(None, move |_| *h.lock().unwrap() += 1);

        sig.dispatch_drain(1).await;
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    /// Responses whose dynamic type differs from the requested one are dropped.
    #[tokio::test]
    async fn mismatched_response_types_are_dropped() {
        let sig = Signaler::<u8>::new(bus());
        sig.subscribe_receiver_returning(None, |_v: u8| "text");
        sig.subscribe_receiver_returning(None, |v: u8| i64::from(v) * 3);

        let out = sig.dispatch_for::<i64>(2).collect_all().await;
        assert_eq!(out, vec![6]);
    }

    /// A processor subscribed after the snapshot is not observed by the
    /// in-flight dispatch.
    #[tokio::test]
    async fn dispatch_uses_its_snapshot() {
        let sig = Signaler::<u8>::new(bus());
        let hits = Arc::new(StdMutex::new(0u32));

        let h = Arc::clone(&hits);
        sig.subscribe_receiver(None, move |_| *h.lock().unwrap() += 1);

        let pending = sig.dispatch_for::<u8>(1);

        let h = Arc::clone(&hits);
        sig.subscribe_receiver(None, move |_| *h.lock().unwrap() += 100);

        let _ = pending.collect_all().await;
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    /// Async receivers complete before downstream processors observe the value.
    #[tokio::test]
    async fn async_receiver_runs_before_downstream() {
        let sig = Signaler::<u8>::new(bus());
        let log: Arc<StdMutex<Vec<&'static str>>> = Arc::new(StdMutex::new(Vec::new()));

        let l = Arc::clone(&log);
        sig.subscribe_async_receiver(None, move |_v: u8| {
            let l = Arc::clone(&l);
            async move {
                tokio::task::yield_now().await;
                l.lock().unwrap().push("async");
            }
        });
        let l = Arc::clone(&log);
        sig.subscribe_receiver(None, move |_| l.lock().unwrap().push("sync"));

        sig.dispatch_drain(0).await;
        assert_eq!(log.lock().unwrap().as_slice(), ["async", "sync"]);
    }

    /// Removing a processor by id takes effect for later dispatches.
    #[tokio::test]
    async fn removed_processor_no_longer_fires() {
        let sig = Signaler::<u8>::new(bus());
        let hits = Arc::new(StdMutex::new(0u32));

        let h = Arc::clone(&hits);
        let id = sig.subscribe_receiver(None, move |_| *h.lock().unwrap() += 1);

        sig.dispatch_drain(0).await;
        sig.remove(id);
        sig.dispatch_drain(0).await;

        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
