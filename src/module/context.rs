//! # ModuleContext: per-instance façade between a module and its agent.
//!
//! The context carries the module base state: the agent back-reference, the
//! cached display name, the set of signal types the module subscribed to
//! (used for back-removal), and the deferred-subscription buffer.
//!
//! ## Deferred registration
//! Modules may subscribe inside their constructor, before the agent
//! back-reference is assigned. Those subscriptions are buffered as closures
//! and drained when the agent attaches the context (insertion step). The
//! handle returned to the constructor is a proxy that becomes real on drain;
//! disposing it early cancels the eventual real subscription.
//!
//! ```text
//! constructor: ctx.receive(cb) ──► [deferred buffer]   (handle: proxy)
//!                                        │
//! agent.add() → attach(agent) ──► drain ─┴─► Signaler<T>.subscribe(...)
//!                                             └─► handle becomes real
//! ```
//!
//! ## Rules
//! - A context attaches to at most one agent, ever; after removal it is
//!   terminally detached and every agent-derived capability fails with
//!   [`AgentError::Detached`].
//! - Subscriptions made through the façade record their signal type so the
//!   agent can strip the module's processors from every signaler on removal.

use std::any::TypeId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use crate::agent::Agent;
use crate::error::AgentError;
use crate::signals::{
    RawSignalContext, Signal, SignalContext, SignalStream, Signaler, SubscriptionHandle,
};

use super::{Module, ModuleId};

/// Back-reference from a module to its owning agent.
enum AgentLink {
    /// Constructed but not yet inserted.
    Detached,
    /// Owned by an agent.
    Attached(Weak<Agent>),
    /// Removed; terminal.
    Removed,
}

/// Buffered constructor-time subscription.
type DeferredSub = Box<dyn FnOnce(&Arc<Agent>, &ContextInner) + Send>;

struct ContextInner {
    id: ModuleId,
    display_name: Arc<str>,
    link: Mutex<AgentLink>,
    deferred: Mutex<Vec<DeferredSub>>,
    subscribed: Mutex<HashSet<TypeId>>,
}

/// Per-module façade: signal subscription and send API plus the agent
/// back-reference. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct ModuleContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.inner.id)
            .field("display_name", &self.inner.display_name)
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    pub(crate) fn new(display_name: &'static str) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: ModuleId::allocate(),
                display_name: Arc::from(super::short_type_name(display_name)),
                link: Mutex::new(AgentLink::Detached),
                deferred: Mutex::new(Vec::new()),
                subscribed: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// The module instance's identity.
    pub fn id(&self) -> ModuleId {
        self.inner.id
    }

    /// The cached type-display name of the module.
    pub fn display_name(&self) -> &str {
        &self.inner.display_name
    }

    /// The owning agent.
    ///
    /// Fails with [`AgentError::Detached`] before insertion completes and
    /// forever after removal; callers never observe stale agent state.
    pub fn agent(&self) -> Result<Arc<Agent>, AgentError> {
        let link = self.inner.link.lock().unwrap_or_else(|p| p.into_inner());
        match &*link {
            AgentLink::Attached(weak) => weak.upgrade().ok_or_else(|| self.detached()),
            AgentLink::Detached | AgentLink::Removed => Err(self.detached()),
        }
    }

    fn detached(&self) -> AgentError {
        AgentError::Detached {
            module: self.inner.display_name.to_string(),
        }
    }

    // ---------------------------
    // Receiving
    // ---------------------------

    /// Subscribes a synchronous receiver for signals of type `T`.
    pub fn receive<T: Signal>(
        &self,
        f: impl Fn(T) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, AgentError> {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_receiver(Some(owner), f))
    }

    /// Subscribes a synchronous receiver that yields one response per signal.
    pub fn receive_returning<T: Signal, R: Send + 'static>(
        &self,
        f: impl Fn(T) -> R + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, AgentError> {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_receiver_returning(Some(owner), f))
    }

    /// Subscribes an async receiver; the chain awaits it before continuing.
    pub fn receive_async<T, Fut>(
        &self,
        f: impl Fn(T) -> Fut + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, AgentError>
    where
        T: Signal,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_async_receiver(Some(owner), f))
    }

    /// Subscribes an async receiver that yields one response per signal.
    pub fn receive_returning_async<T, R, Fut>(
        &self,
        f: impl Fn(T) -> Fut + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle, AgentError>
    where
        T: Signal,
        R: Send + 'static,
        Fut: std::future::Future<Output = R> + Send + 'static,
    {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_async_receiver_returning(Some(owner), f))
    }

    /// Subscribes an interceptor declaring responses of type `R`.
    ///
    /// The interceptor controls whether and with what value the rest of the
    /// chain runs; see [`SignalContext`].
    pub fn intercept<T, R, S, F>(&self, f: F) -> Result<SubscriptionHandle, AgentError>
    where
        T: Signal,
        R: Send + 'static,
        S: futures::Stream<Item = R> + Send + 'static,
        F: Fn(SignalContext<T, R>) -> S + Send + Sync + 'static,
    {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_interceptor(Some(owner), f))
    }

    /// Subscribes an interceptor relaying dynamically typed responses.
    pub fn intercept_any<T, S, F>(&self, f: F) -> Result<SubscriptionHandle, AgentError>
    where
        T: Signal,
        S: futures::Stream<Item = crate::signals::BoxAny> + Send + 'static,
        F: Fn(RawSignalContext<T>) -> S + Send + Sync + 'static,
    {
        self.subscribe::<T>(move |sig, owner| sig.subscribe_interceptor_any(Some(owner), f))
    }

    /// Runs `register` now when attached, or buffers it for the drain.
    fn subscribe<T: Signal>(
        &self,
        register: impl FnOnce(&Signaler<T>, (ModuleId, Arc<str>)) -> u64 + Send + 'static,
    ) -> Result<SubscriptionHandle, AgentError> {
        enum Route {
            Now(Arc<Agent>),
            Defer,
        }

        let route = {
            let link = self.inner.link.lock().unwrap_or_else(|p| p.into_inner());
            match &*link {
                AgentLink::Attached(weak) => Route::Now(weak.upgrade().ok_or_else(|| self.detached())?),
                AgentLink::Detached => Route::Defer,
                AgentLink::Removed => return Err(self.detached()),
            }
        };

        match route {
            Route::Now(agent) => Ok(register_with(&agent, &self.inner, register)),
            Route::Defer => {
                let handle = SubscriptionHandle::deferred();
                let proxy = handle.clone();
                self.inner
                    .deferred
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .push(Box::new(move |agent, inner| {
                        let real = register_with(agent, inner, register);
                        // Transfer the real remover onto the proxy the caller holds.
                        proxy.fulfill(Box::new(move || real.dispose()));
                    }));
                Ok(handle)
            }
        }
    }

    // ---------------------------
    // Sending & lookup forwards
    // ---------------------------

    /// Dispatches a signal through the owning agent, draining responses.
    pub async fn send<T: Signal>(&self, value: T) -> Result<(), AgentError> {
        self.agent()?.send(value).await
    }

    /// Dispatches a signal, returning the lazy response stream.
    pub fn send_for<T: Signal, R: Send + 'static>(
        &self,
        value: T,
    ) -> Result<SignalStream<R>, AgentError> {
        self.agent()?.send_for(value)
    }

    /// Dispatches a signal and collects every `R` response.
    pub async fn send_values<T: Signal, R: Send + 'static>(
        &self,
        value: T,
    ) -> Result<Vec<R>, AgentError> {
        Ok(self.send_for::<T, R>(value)?.collect_all().await)
    }

    /// Looks up another module of the owning agent by concrete type.
    pub fn module_of<M: Module>(&self) -> Result<Arc<M>, AgentError> {
        self.agent()?.get::<M>()
    }

    /// Like [`module_of`](Self::module_of) but absent modules yield `None`.
    pub fn module_or_default<M: Module>(&self) -> Option<Arc<M>> {
        self.agent().ok()?.get_or_default::<M>()
    }

    // ---------------------------
    // Agent-side lifecycle (crate internal)
    // ---------------------------

    /// Assigns the agent back-reference and drains buffered subscriptions.
    pub(crate) fn attach(&self, agent: &Arc<Agent>) -> Result<(), AgentError> {
        {
            let mut link = self.inner.link.lock().unwrap_or_else(|p| p.into_inner());
            match &*link {
                AgentLink::Detached => *link = AgentLink::Attached(Arc::downgrade(agent)),
                AgentLink::Attached(_) | AgentLink::Removed => return Err(self.detached()),
            }
        }

        let drained: Vec<DeferredSub> = {
            let mut deferred = self.inner.deferred.lock().unwrap_or_else(|p| p.into_inner());
            deferred.drain(..).collect()
        };
        for sub in drained {
            sub(agent, &self.inner);
        }
        Ok(())
    }

    /// Severs the back-reference permanently. Reinsertion is impossible.
    pub(crate) fn mark_removed(&self) {
        let mut link = self.inner.link.lock().unwrap_or_else(|p| p.into_inner());
        *link = AgentLink::Removed;
        drop(link);
        self.inner
            .deferred
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Signal types this module subscribed to, for back-removal.
    pub(crate) fn subscribed_types(&self) -> Vec<TypeId> {
        self.inner
            .subscribed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }
}

/// Registers a processor on the agent's signaler for `T` and returns a live
/// handle; records the signal type for back-removal.
fn register_with<T: Signal>(
    agent: &Arc<Agent>,
    inner: &ContextInner,
    register: impl FnOnce(&Signaler<T>, (ModuleId, Arc<str>)) -> u64,
) -> SubscriptionHandle {
    let signaler = agent.signaler::<T>();
    let owner = (inner.id, Arc::clone(&inner.display_name));
    let id = register(&signaler, owner);
    inner
        .subscribed
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(TypeId::of::<T>());

    let weak = Arc::downgrade(&signaler);
    SubscriptionHandle::active(Box::new(move || {
        if let Some(sig) = weak.upgrade() {
            sig.remove(id);
        }
    }))
}
