//! # Agent: lifecycle, signaler map, and module lookup.
//!
//! The agent owns the runtime components (event bus, subscriber fan-out,
//! module sequence, signaler map) and orchestrates the module lifecycle from
//! insertion to disposal.
//!
//! ## Architecture
//! ```text
//! AgentBuilder ──► Arc<Agent>
//!                     │
//!                     ├──► modules: ordered ModuleSlot sequence
//!                     ├──► signalers: TypeId → Signaler<T> (created on first touch)
//!                     ├──► preferred: TypeId → [ModuleId] (applied to signalers)
//!                     ├──► required_by: reverse dependency graph
//!                     ├──► bus ──► fan-out listener ──► SubscriberSet
//!                     └──► state: watch-backed observable cell
//! ```
//!
//! ## Rules
//! - The module sequence is mutated only from the caller's task during
//!   add/remove; insertion after `initialize` schedules init on the runtime,
//!   never inline.
//! - Signaler arrays are copy-on-write; dispatch never holds a lock.
//! - `initialize` aggregates module failures but still reaches `Initialized`.
//! - `dispose` is idempotent once `Disposed`; nothing is usable afterwards.

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{AgentError, ModuleError, ModuleFailure};
use crate::events::{Bus, Event, EventKind};
use crate::module::{downcast_module, Module, ModuleId, ModuleRef};
use crate::policies::RunExceptionPolicy;
use crate::signals::{
    panic_message, AnySignaler, Observation, Signal, SignalStream, Signaler, SubscriptionHandle,
};
use crate::subscribers::{Subscribe, SubscriberSet};

use super::state::{AgentState, StateCell};

/// Opaque capability resolving externally provided services during module
/// instantiation.
///
/// A missing provider behaves as one that always returns `None`. The returned
/// box must contain a value of exactly the requested type.
pub trait ServiceProvider: Send + Sync + 'static {
    /// Resolves a service by type identity, or `None` when absent.
    fn resolve(&self, ty: TypeId) -> Option<Box<dyn Any + Send + Sync>>;
}

/// One inserted module: identity, type, and the shared handle.
#[derive(Clone)]
pub(super) struct ModuleSlot {
    pub(super) id: ModuleId,
    pub(super) type_id: TypeId,
    pub(super) display_name: Arc<str>,
    pub(super) module: ModuleRef,
}

/// Container owning a set of modules, their signaler map, and lifecycle state.
///
/// Built by [`AgentBuilder`] inside a tokio runtime and handed out as
/// `Arc<Agent>`. Modules collaborate solely through the typed signal
/// pipeline; the agent routes, orders, and supervises.
pub struct Agent {
    pub(super) name: String,
    pub(super) description: String,
    pub(super) config: Config,
    pub(super) provider: Option<Arc<dyn ServiceProvider>>,
    pub(super) state: StateCell,
    pub(super) modules: Mutex<Vec<ModuleSlot>>,
    pub(super) signalers: dashmap::DashMap<TypeId, Arc<dyn AnySignaler>>,
    pub(super) preferred: dashmap::DashMap<TypeId, Vec<ModuleId>>,
    pub(super) required_by: Mutex<HashMap<TypeId, HashSet<TypeId>>>,
    /// Membership epoch; bumped on every add/remove so a running supervisor
    /// reconfigures.
    pub(super) membership: watch::Sender<u64>,
    /// Initialize tasks spawned for modules added after `initialize`.
    pub(super) pending_init: Mutex<Vec<JoinHandle<()>>>,
    /// Cancellation token of the active `run`, if any.
    pub(super) run_token: Mutex<Option<CancellationToken>>,
    pub(super) bus: Bus,
    fanout_stop: CancellationToken,
    fanout: Mutex<Option<JoinHandle<()>>>,
}

/// Builder for constructing an [`Agent`] with optional features.
pub struct AgentBuilder {
    name: String,
    description: String,
    config: Config,
    provider: Option<Arc<dyn ServiceProvider>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
}

impl AgentBuilder {
    /// Creates a new builder for an agent with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            config: Config::default(),
            provider: None,
            subscribers: Vec::new(),
        }
    }

    /// Sets the human-readable description.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Overrides the runtime configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Attaches an external service provider used during module instantiation.
    pub fn service_provider(mut self, provider: Arc<dyn ServiceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive runtime events (lifecycle, run loop failures,
    /// diagnostics) through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Builds the agent and spawns its event fan-out.
    ///
    /// Must be called within a tokio runtime.
    pub fn build(self) -> Arc<Agent> {
        let bus = Bus::new(self.config.bus_capacity_clamped());
        let fanout_stop = CancellationToken::new();
        let fanout = spawn_fanout(bus.clone(), self.subscribers, fanout_stop.clone());
        let (membership, _rx) = watch::channel(0);

        Arc::new(Agent {
            name: self.name,
            description: self.description,
            config: self.config,
            provider: self.provider,
            state: StateCell::new(),
            modules: Mutex::new(Vec::new()),
            signalers: dashmap::DashMap::new(),
            preferred: dashmap::DashMap::new(),
            required_by: Mutex::new(HashMap::new()),
            membership,
            pending_init: Mutex::new(Vec::new()),
            run_token: Mutex::new(None),
            bus,
            fanout_stop,
            fanout: Mutex::new(Some(fanout)),
        })
    }
}

/// Spawns the bus → subscriber-set forwarding task.
///
/// Runs until the stop token fires, then drains the subscriber workers.
fn spawn_fanout(
    bus: Bus,
    subscribers: Vec<Arc<dyn Subscribe>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    let set = SubscriberSet::new(subscribers, bus.clone());
    let mut rx = bus.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                msg = rx.recv() => match msg {
                    Ok(ev) => set.emit_arc(Arc::new(ev)),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                }
            }
        }
        set.shutdown().await;
    })
}

impl Agent {
    /// Creates an agent with default configuration and no subscribers.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        AgentBuilder::new(name).build()
    }

    /// The agent's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The agent's description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// The current lifecycle state.
    pub fn state(&self) -> AgentState {
        self.state.get()
    }

    /// Observable state stream; the current state is visible immediately.
    pub fn state_stream(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Read-only snapshot of the module sequence, in insertion order.
    pub fn modules(&self) -> Vec<ModuleRef> {
        self.lock_modules().iter().map(|s| Arc::clone(&s.module)).collect()
    }

    pub(super) fn lock_modules(&self) -> std::sync::MutexGuard<'_, Vec<ModuleSlot>> {
        self.modules.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(super) fn publish(&self, ev: Event) {
        self.bus.publish(ev);
    }

    pub(super) fn bump_membership(&self) {
        self.membership.send_modify(|epoch| *epoch += 1);
    }

    pub(super) fn membership_stream(&self) -> watch::Receiver<u64> {
        self.membership.subscribe()
    }

    fn set_state(&self, from: &[AgentState], to: AgentState) -> Result<(), AgentState> {
        self.state.transition(from, to)?;
        self.publish(Event::now(EventKind::StateChanged).with_state(to));
        Ok(())
    }

    // ---------------------------
    // Module lookup
    // ---------------------------

    /// Returns the first module of concrete type `T`.
    pub fn get<T: Module>(&self) -> Result<Arc<T>, AgentError> {
        self.get_or_default::<T>().ok_or_else(|| AgentError::NotFound {
            module: crate::module::short_type_name(std::any::type_name::<T>()).to_string(),
        })
    }

    /// Returns the first module of concrete type `T`, or `None`.
    pub fn get_or_default<T: Module>(&self) -> Option<Arc<T>> {
        let ty = TypeId::of::<T>();
        let slot = {
            let slots = self.lock_modules();
            slots.iter().find(|s| s.type_id == ty).cloned()
        };
        slot.and_then(|s| downcast_module::<T>(&s.module).ok())
    }

    /// Returns every module of concrete type `T`, in insertion order.
    pub fn get_all<T: Module>(&self) -> Vec<Arc<T>> {
        let ty = TypeId::of::<T>();
        let slots: Vec<ModuleSlot> = {
            let slots = self.lock_modules();
            slots.iter().filter(|s| s.type_id == ty).cloned().collect()
        };
        slots
            .iter()
            .filter_map(|s| downcast_module::<T>(&s.module).ok())
            .collect()
    }

    // ---------------------------
    // Signaling surface
    // ---------------------------

    /// Returns the signaler for `T`, creating it on first touch.
    pub(crate) fn signaler<T: Signal>(&self) -> Arc<Signaler<T>> {
        let key = TypeId::of::<T>();
        // Read the preset order before touching the signaler map; the two
        // maps are never locked at the same time.
        let preset: Option<Vec<crate::module::ModuleId>> =
            self.preferred.get(&key).map(|order| order.value().clone());
        let entry = self
            .signalers
            .entry(key)
            .or_insert_with(|| {
                let sig = Signaler::<T>::new(self.bus.clone());
                if let Some(order) = preset {
                    sig.set_preferred_order(order);
                }
                sig as Arc<dyn AnySignaler>
            })
            .clone();

        match entry.into_any().downcast::<Signaler<T>>() {
            Ok(sig) => sig,
            Err(_) => unreachable!("signaler map holds exactly one signaler per type identity"),
        }
    }

    /// Dispatches a signal and drives the whole chain, discarding responses.
    ///
    /// Permitted in every state except `Disposed`.
    pub async fn send<T: Signal>(&self, value: T) -> Result<(), AgentError> {
        self.gate_send("send")?;
        self.signaler::<T>().dispatch_drain(value).await;
        Ok(())
    }

    /// Dispatches a signal, returning the lazy stream of `R` responses.
    ///
    /// Nothing runs until the stream is polled; dropping it early abandons
    /// the rest of the chain.
    pub fn send_for<T: Signal, R: Send + 'static>(
        &self,
        value: T,
    ) -> Result<SignalStream<R>, AgentError> {
        self.gate_send("send_for")?;
        Ok(self.signaler::<T>().dispatch_for(value))
    }

    /// Dispatches a signal and collects every `R` response in chain order.
    pub async fn send_values<T: Signal, R: Send + 'static>(
        &self,
        value: T,
    ) -> Result<Vec<R>, AgentError> {
        Ok(self.send_for::<T, R>(value)?.collect_all().await)
    }

    fn gate_send(&self, operation: &'static str) -> Result<(), AgentError> {
        match self.state.get() {
            AgentState::Disposed => Err(AgentError::InvalidState {
                operation,
                state: AgentState::Disposed,
            }),
            _ => Ok(()),
        }
    }

    /// Subscribes a push observer for `T`, exposed as a stream.
    ///
    /// Dropping the observation unsubscribes. Not permitted once disposal
    /// has begun.
    pub fn observe<T: Signal>(&self) -> Result<Observation<T>, AgentError> {
        let state = self.state.get();
        if state.is_terminal() {
            return Err(AgentError::InvalidState {
                operation: "observe",
                state,
            });
        }

        let signaler = self.signaler::<T>();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = signaler.subscribe_observer(None, move |value: &T| {
            let _ = tx.send(value.clone());
        });

        let weak = Arc::downgrade(&signaler);
        let handle = SubscriptionHandle::active(Box::new(move || {
            if let Some(sig) = weak.upgrade() {
                sig.remove(id);
            }
        }));
        Ok(Observation::new(rx, handle))
    }

    /// Declares the preferred module order for signals of type `T`.
    ///
    /// Processors of listed modules run first, in the declared order; all
    /// other processors keep subscription order. Takes effect immediately
    /// and for every later subscription on the type.
    pub fn set_signal_order<T: Signal>(&self, order: &[ModuleId]) -> Result<(), AgentError> {
        let state = self.state.get();
        if state.is_terminal() {
            return Err(AgentError::InvalidState {
                operation: "set_signal_order",
                state,
            });
        }

        self.preferred.insert(TypeId::of::<T>(), order.to_vec());
        if let Some(sig) = self.signalers.get(&TypeId::of::<T>()) {
            sig.set_preferred(order.to_vec());
        }
        Ok(())
    }

    // ---------------------------
    // Lifecycle
    // ---------------------------

    /// Initializes every module in insertion order.
    ///
    /// - Idempotent no-op while `Initializing` or once `Initialized`.
    /// - Fails with `InvalidState` once disposal has begun.
    /// - A failing module does not stop the pass: failures are aggregated
    ///   into [`AgentError::InitFailed`] and the agent still becomes
    ///   `Initialized`.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), AgentError> {
        match self.state.get() {
            AgentState::Uninitialized => {}
            AgentState::Initializing | AgentState::Initialized => return Ok(()),
            state => {
                return Err(AgentError::InvalidState {
                    operation: "initialize",
                    state,
                })
            }
        }
        if self
            .set_state(&[AgentState::Uninitialized], AgentState::Initializing)
            .is_err()
        {
            // Lost the race to a concurrent initialize; that call owns the pass.
            return Ok(());
        }

        let slots: Vec<ModuleSlot> = self.lock_modules().clone();
        let mut failures: Vec<ModuleFailure> = Vec::new();
        for slot in slots {
            if let Err(err) = run_initialize(&slot, &self.bus).await {
                failures.push((slot.display_name.to_string(), err));
            }
        }

        // Initialization failures do not keep the agent out of `Initialized`.
        let _ = self.set_state(&[AgentState::Initializing], AgentState::Initialized);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AgentError::InitFailed { failures })
        }
    }

    /// Waits until every asynchronously scheduled module init has finished.
    ///
    /// Covers modules added while `Initializing` or after `Initialized`.
    pub async fn initialization_complete(&self) {
        loop {
            let handle = {
                let mut pending = self.pending_init.lock().unwrap_or_else(|p| p.into_inner());
                pending.pop()
            };
            match handle {
                Some(h) => {
                    let _ = h.await;
                }
                None => break,
            }
        }
    }

    /// Runs every module's run loop under the given exception policy until
    /// the caller's token cancels, loops are exhausted, or a stop-all policy
    /// fires.
    ///
    /// Rejected unless the agent is `Initialized` and no other run is active.
    pub async fn run(
        self: &Arc<Self>,
        policy: RunExceptionPolicy,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        super::supervisor::run(self, policy, cancel).await
    }

    /// Cancels the active `run`, if any; that `run` returns `Ok(())`.
    pub fn stop(&self) {
        let guard = self.run_token.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(token) = guard.as_ref() {
            token.cancel();
        }
    }

    /// Disposes the agent: stops the supervisor, removes every module
    /// (dependency order, vetoes overridden), clears signalers, and moves to
    /// `Disposed`.
    ///
    /// - Idempotent once disposal has begun.
    /// - Fails with `InvalidState` while `Initializing`.
    /// - Dispose failures are aggregated into [`AgentError::DisposeFailed`].
    pub async fn dispose(self: &Arc<Self>) -> Result<(), AgentError> {
        match self.state.get() {
            AgentState::Initializing => {
                return Err(AgentError::InvalidState {
                    operation: "dispose",
                    state: AgentState::Initializing,
                })
            }
            AgentState::Disposing | AgentState::Disposed => return Ok(()),
            AgentState::Uninitialized | AgentState::Initialized => {}
        }
        if self
            .set_state(
                &[AgentState::Uninitialized, AgentState::Initialized],
                AgentState::Disposing,
            )
            .is_err()
        {
            // Lost the race to a concurrent dispose.
            return Ok(());
        }

        self.stop();
        self.initialization_complete().await;

        let all_ids: Vec<ModuleId> = self.lock_modules().iter().map(|s| s.id).collect();
        let result = self.remove_batch(&all_ids, true).await;

        self.signalers.clear();
        self.preferred.clear();
        {
            let mut graph = self.required_by.lock().unwrap_or_else(|p| p.into_inner());
            graph.clear();
        }

        let _ = self.set_state(&[AgentState::Disposing], AgentState::Disposed);

        // Tear down the fan-out after the final StateChanged event.
        self.fanout_stop.cancel();
        let fanout = {
            let mut guard = self.fanout.lock().unwrap_or_else(|p| p.into_inner());
            guard.take()
        };
        if let Some(handle) = fanout {
            let _ = handle.await;
        }

        result.map(|_| ())
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // Unblocks the fan-out listener when the agent is dropped without a
        // dispose call.
        self.fanout_stop.cancel();
    }
}

/// Runs one module's `initialize`, converting panics into fatal errors and
/// publishing the outcome.
pub(super) async fn run_initialize(slot: &ModuleSlot, bus: &Bus) -> Result<(), ModuleError> {
    let fut = slot.module.initialize();
    let result = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ModuleError::Fatal {
            reason: panic_message(payload.as_ref()),
        }),
    };

    match &result {
        Ok(()) => {
            bus.publish(Event::now(EventKind::ModuleInitialized).with_module(slot.display_name.as_ref()));
        }
        Err(err) => {
            tracing::error!(module = slot.display_name.as_ref(), err = %err, "module initialization failed");
            bus.publish(
                Event::now(EventKind::ModuleInitFailed)
                    .with_module(slot.display_name.as_ref())
                    .with_error(err.to_string()),
            );
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::module::{ModuleContext, ModuleDescriptor, Registered};

    struct Plain {
        ctx: ModuleContext,
    }

    #[async_trait]
    impl Module for Plain {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Plain {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Plain>(|scope| Ok(Arc::new(Plain { ctx: scope.context() })))
        }
    }

    struct FailingInit {
        ctx: ModuleContext,
    }

    #[async_trait]
    impl Module for FailingInit {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn initialize(&self) -> Result<(), ModuleError> {
            Err(ModuleError::fail("init boom"))
        }
    }

    impl Registered for FailingInit {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<FailingInit>(|scope| {
                Ok(Arc::new(FailingInit { ctx: scope.context() }))
            })
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent_once_initialized() {
        let agent = Agent::new("test");
        agent.add::<Plain>().unwrap();

        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Initialized);

        agent.initialize().await.unwrap();
        assert_eq!(agent.state(), AgentState::Initialized);
    }

    #[tokio::test]
    async fn initialize_aggregates_failures_but_completes() {
        let agent = Agent::new("test");
        agent.add::<FailingInit>().unwrap();
        agent.add::<Plain>().unwrap();

        let err = agent.initialize().await.unwrap_err();
        match err {
            AgentError::InitFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "FailingInit");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(agent.state(), AgentState::Initialized);
    }

    #[tokio::test]
    async fn dispose_is_idempotent_and_terminal() {
        let agent = Agent::new("test");
        agent.add::<Plain>().unwrap();
        agent.initialize().await.unwrap();

        agent.dispose().await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);

        agent.dispose().await.unwrap();
        assert_eq!(agent.state(), AgentState::Disposed);

        assert!(agent.modules().is_empty());
        assert!(matches!(
            agent.send(1u8).await,
            Err(AgentError::InvalidState { .. })
        ));
        assert!(matches!(
            agent.add::<Plain>(),
            Err(AgentError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn run_requires_initialized_state() {
        let agent = Agent::new("test");
        let err = agent
            .run(RunExceptionPolicy::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn state_stream_reports_current_state_on_subscribe() {
        let agent = Agent::new("test");
        agent.initialize().await.unwrap();

        let rx = agent.state_stream();
        assert_eq!(*rx.borrow(), AgentState::Initialized);
    }

    #[tokio::test]
    async fn send_is_permitted_before_initialize() {
        let agent = Agent::new("test");
        let echoed = agent.send_values::<u8, u8>(3).await.unwrap();
        assert_eq!(echoed, vec![3]);
    }

    #[tokio::test]
    async fn observe_sees_signals_sent_after_subscription() {
        let agent = Agent::new("test");
        let mut obs = agent.observe::<u8>().unwrap();

        agent.send(5u8).await.unwrap();
        assert_eq!(obs.recv().await, Some(5));
    }
}
