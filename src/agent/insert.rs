//! # Module insertion: descriptor walk, dependency resolution, rollback.
//!
//! `add` runs these steps in order:
//!
//! 1. Reject in a terminal state.
//! 2. Singleton short-circuit: an existing instance of a singleton type is
//!    configured and returned; no new instance.
//! 3. Snapshot the module sequence (implicitly: the rollback set tracks every
//!    module appended during this call).
//! 4. Instantiate via the type's descriptor; the build closure resolves
//!    parameters through [`InsertScope`] — service provider, the agent,
//!    existing module, recursive insert, or probe match. Unresolvable
//!    parameters fail with `DependencyUnresolved`.
//! 5. Append the module and assign the agent back-reference (draining
//!    constructor-time deferred subscriptions).
//! 6. Resolve and assign each declared required member, recording
//!    required-by edges.
//! 7. Invoke the caller's `configure`.
//! 8. When the agent is `Initializing` or `Initialized`: schedule
//!    `initialize` asynchronously and signal the run supervisor that
//!    membership changed.
//! 9. On failure after step 3: remove every module appended by this call and
//!    return the cause wrapped in `ModuleInsertFailed`.
//!
//! ## Rules
//! - Dependency cycles fail with `DependencyUnresolved`.
//! - Rollback strips subscriptions and ordering entries; rolled-back modules
//!   were never initialized, so no dispose hook runs.
//! - Eager init and the membership bump happen only once the whole insertion
//!   succeeded, for every module it appended.

use std::any::TypeId;
use std::sync::Arc;

use crate::error::AgentError;
use crate::module::{
    descriptor_of, downcast_module, Module, ModuleContext, ModuleId, ModuleRef, Registered,
};
use crate::events::{Event, EventKind};

use super::agent::{Agent, ModuleSlot};
use super::state::AgentState;

/// Resolution scope threaded through one `add` call, including recursive
/// dependency insertions.
///
/// Handed to descriptor build closures and required-member setters; exposes
/// the §-documented resolution priority as typed methods.
pub struct InsertScope<'a> {
    agent: &'a Arc<Agent>,
    /// Types currently being constructed; guards against dependency cycles.
    stack: Vec<TypeId>,
    /// Every module appended during this call, in append order (rollback set).
    pub(super) added: Vec<ModuleId>,
    /// Context of the module whose build closure is running.
    current_ctx: Option<ModuleContext>,
    /// Type identity and display name of that module.
    current_type: Option<(TypeId, &'static str)>,
}

impl<'a> InsertScope<'a> {
    pub(super) fn new(agent: &'a Arc<Agent>) -> Self {
        Self {
            agent,
            stack: Vec::new(),
            added: Vec::new(),
            current_ctx: None,
            current_type: None,
        }
    }

    fn current_display(&self) -> String {
        self.current_type
            .map(|(_, name)| name.to_string())
            .unwrap_or_else(|| "<unknown>".to_string())
    }

    /// The context for the module under construction.
    ///
    /// Build closures store this in the module and return it from
    /// [`Module::context`].
    pub fn context(&self) -> ModuleContext {
        match &self.current_ctx {
            Some(ctx) => ctx.clone(),
            None => unreachable!("InsertScope::context called outside a build closure"),
        }
    }

    /// The agent being inserted into.
    pub fn agent(&self) -> Arc<Agent> {
        Arc::clone(self.agent)
    }

    /// Resolves an externally provided service by type.
    ///
    /// Fails with `DependencyUnresolved` when no provider is attached or the
    /// provider has no value of this type.
    pub fn service<S: Send + Sync + 'static>(&self) -> Result<S, AgentError> {
        let unresolved = || AgentError::DependencyUnresolved {
            module: self.current_display(),
            dependency: std::any::type_name::<S>().to_string(),
        };

        let provider = self.agent.provider.as_ref().ok_or_else(unresolved)?;
        let boxed = provider.resolve(TypeId::of::<S>()).ok_or_else(unresolved)?;
        boxed.downcast::<S>().map(|b| *b).map_err(|_| unresolved())
    }

    /// Resolves a module of concrete type `M`: an existing instance, else a
    /// recursively inserted one. Records a required-by edge.
    pub fn module<M: Registered>(&mut self) -> Result<Arc<M>, AgentError> {
        let agent = Arc::clone(self.agent);
        let resolved = match agent.get_or_default::<M>() {
            Some(existing) => existing,
            None => agent.insert_inner::<M>(self)?,
        };
        self.record_edge(TypeId::of::<M>());
        Ok(resolved)
    }

    /// Resolves an existing module matching `probe` (abstract-assignability).
    ///
    /// Never inserts; an absent match fails with `DependencyUnresolved`
    /// naming `dependency`.
    pub fn module_matching(
        &mut self,
        dependency: &'static str,
        probe: impl Fn(&ModuleRef) -> bool,
    ) -> Result<ModuleRef, AgentError> {
        let found = {
            let slots = self.agent.lock_modules();
            slots
                .iter()
                .find(|s| probe(&s.module))
                .map(|s| (s.type_id, Arc::clone(&s.module)))
        };
        match found {
            Some((type_id, module)) => {
                self.record_edge(type_id);
                Ok(module)
            }
            None => Err(AgentError::DependencyUnresolved {
                module: self.current_display(),
                dependency: dependency.to_string(),
            }),
        }
    }

    /// Records `current type requires required_type` in the reverse graph.
    fn record_edge(&self, required_type: TypeId) {
        if let Some((requirer, _)) = self.current_type {
            self.agent.record_required_by(required_type, requirer);
        }
    }
}

impl Agent {
    /// Adds a module of type `T`, resolving its dependencies.
    ///
    /// For singleton types an existing instance is returned instead of a new
    /// one. A failed insertion rolls back completely and returns
    /// [`AgentError::InsertFailed`].
    pub fn add<T: Registered>(self: &Arc<Self>) -> Result<Arc<T>, AgentError> {
        self.add_with::<T>(|_| {})
    }

    /// Adds a module of type `T` and applies `configure` to the (new or, for
    /// singletons, existing) instance.
    pub fn add_with<T: Registered>(
        self: &Arc<Self>,
        configure: impl FnOnce(&Arc<T>),
    ) -> Result<Arc<T>, AgentError> {
        self.gate_add()?;

        let descriptor = descriptor_of::<T>();
        if descriptor.singleton {
            if let Some(existing) = self.get_or_default::<T>() {
                configure(&existing);
                return Ok(existing);
            }
        }

        let mut scope = InsertScope::new(self);
        match self.insert_inner::<T>(&mut scope) {
            Ok(module) => {
                configure(&module);
                let added = std::mem::take(&mut scope.added);
                self.finish_insert(&added);
                Ok(module)
            }
            Err(cause) => {
                let added = std::mem::take(&mut scope.added);
                self.rollback(&added);
                Err(AgentError::InsertFailed {
                    module: descriptor.display_name().to_string(),
                    source: Box::new(cause),
                })
            }
        }
    }

    /// Adds a module built by `factory` instead of its type descriptor.
    ///
    /// The factory receives the module's detached context; constructor-time
    /// subscriptions buffer until the insertion assigns the back-reference.
    pub fn add_factory<T: Module>(
        self: &Arc<Self>,
        factory: impl FnOnce(ModuleContext) -> T,
    ) -> Result<Arc<T>, AgentError> {
        self.gate_add()?;

        let ctx = ModuleContext::new(std::any::type_name::<T>());
        let module = Arc::new(factory(ctx));
        let module_ref: ModuleRef = Arc::clone(&module) as ModuleRef;

        let mut added = Vec::new();
        match self.append_slot(&module_ref, TypeId::of::<T>(), &mut added) {
            Ok(()) => {
                self.finish_insert(&added);
                Ok(module)
            }
            Err(cause) => {
                self.rollback(&added);
                Err(AgentError::InsertFailed {
                    module: crate::module::short_type_name(std::any::type_name::<T>()).to_string(),
                    source: Box::new(cause),
                })
            }
        }
    }

    /// Returns an existing module assignable to `T`, inserting one only when
    /// absent.
    pub fn get_or_add<T: Registered>(self: &Arc<Self>) -> Result<Arc<T>, AgentError> {
        match self.get_or_default::<T>() {
            Some(existing) => Ok(existing),
            None => self.add::<T>(),
        }
    }

    fn gate_add(&self) -> Result<(), AgentError> {
        let state = self.state.get();
        if state.is_terminal() {
            return Err(AgentError::InvalidState {
                operation: "add",
                state,
            });
        }
        Ok(())
    }

    /// Inserts one module of type `M` (steps 4–6), recursing for
    /// dependencies. Shared by `add` and [`InsertScope::module`].
    pub(super) fn insert_inner<M: Registered>(
        self: &Arc<Self>,
        scope: &mut InsertScope<'_>,
    ) -> Result<Arc<M>, AgentError> {
        let descriptor = descriptor_of::<M>();

        // A singleton reached through dependency resolution reuses the
        // existing instance without reconfiguring it.
        if descriptor.singleton {
            if let Some(existing) = self.get_or_default::<M>() {
                return Ok(existing);
            }
        }

        if scope.stack.contains(&descriptor.type_id) {
            return Err(AgentError::DependencyUnresolved {
                module: scope.current_display(),
                dependency: format!("{} (dependency cycle)", descriptor.display_name()),
            });
        }

        scope.stack.push(descriptor.type_id);
        let saved_ctx = scope.current_ctx.take();
        let saved_type = scope.current_type.take();
        scope.current_ctx = Some(ModuleContext::new(descriptor.type_name));
        scope.current_type = Some((descriptor.type_id, descriptor.display_name()));

        let built = (descriptor.build)(scope).and_then(|module_ref| {
            self.append_slot(&module_ref, descriptor.type_id, &mut scope.added)?;
            for member in &descriptor.required {
                (member.assign)(&module_ref, scope).map_err(|err| {
                    tracing::warn!(
                        module = descriptor.display_name(),
                        member = member.member,
                        err = %err,
                        "required member assignment failed",
                    );
                    err
                })?;
            }
            Ok(module_ref)
        });

        scope.current_ctx = saved_ctx;
        scope.current_type = saved_type;
        scope.stack.pop();

        built.and_then(|module_ref| downcast_module::<M>(&module_ref))
    }

    /// Step 5: append to the sequence, assign the back-reference, publish.
    fn append_slot(
        self: &Arc<Self>,
        module: &ModuleRef,
        type_id: TypeId,
        added: &mut Vec<ModuleId>,
    ) -> Result<(), AgentError> {
        let ctx = module.context().clone();
        ctx.attach(self)?;

        let slot = ModuleSlot {
            id: ctx.id(),
            type_id,
            display_name: Arc::from(ctx.display_name()),
            module: Arc::clone(module),
        };
        let name = Arc::clone(&slot.display_name);
        self.lock_modules().push(slot);
        added.push(ctx.id());

        self.publish(Event::now(EventKind::ModuleAdded).with_module(name.as_ref()));
        Ok(())
    }

    /// Step 8: eager-init scheduling plus the supervisor membership signal.
    fn finish_insert(self: &Arc<Self>, added: &[ModuleId]) {
        if added.is_empty() {
            return;
        }

        if matches!(
            self.state.get(),
            AgentState::Initializing | AgentState::Initialized
        ) {
            let slots: Vec<ModuleSlot> = {
                let modules = self.lock_modules();
                modules
                    .iter()
                    .filter(|s| added.contains(&s.id))
                    .cloned()
                    .collect()
            };
            let mut pending = self.pending_init.lock().unwrap_or_else(|p| p.into_inner());
            for slot in slots {
                let bus = self.bus.clone();
                pending.push(tokio::spawn(async move {
                    let _ = super::agent::run_initialize(&slot, &bus).await;
                }));
            }
        }

        self.bump_membership();
    }

    /// Step 9: strip every module this call appended; the sequence returns to
    /// its pre-call snapshot.
    fn rollback(self: &Arc<Self>, added: &[ModuleId]) {
        for id in added.iter().rev() {
            let slot = {
                let mut modules = self.lock_modules();
                modules
                    .iter()
                    .position(|s| s.id == *id)
                    .map(|idx| modules.remove(idx))
            };
            if let Some(slot) = slot {
                // Never initialized, so no dispose hook runs.
                self.strip_module(&slot);
            }
        }
        if !added.is_empty() {
            self.bump_membership();
        }
    }

    /// Records `requirer requires required` in the reverse graph.
    pub(super) fn record_required_by(&self, required: TypeId, requirer: TypeId) {
        if required == requirer {
            return;
        }
        let mut graph = self.required_by.lock().unwrap_or_else(|p| p.into_inner());
        graph.entry(required).or_default().insert(requirer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Mutex as StdMutex, OnceLock};

    use async_trait::async_trait;

    use crate::module::ModuleDescriptor;
    use crate::ServiceProvider;

    #[derive(Debug)]
    struct Store {
        ctx: ModuleContext,
    }

    #[async_trait]
    impl Module for Store {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Store {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Store>(|scope| Ok(Arc::new(Store { ctx: scope.context() })))
                .singleton()
        }
    }

    struct Cache {
        ctx: ModuleContext,
        store: OnceLock<Arc<Store>>,
    }

    #[async_trait]
    impl Module for Cache {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Cache {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Cache>(|scope| {
                Ok(Arc::new(Cache {
                    ctx: scope.context(),
                    store: OnceLock::new(),
                }))
            })
            .requires("store", |module, scope| {
                let store = scope.module::<Store>()?;
                let _ = downcast_module::<Cache>(module)?.store.set(store);
                Ok(())
            })
        }
    }

    #[derive(Debug)]
    struct NeedsService {
        ctx: ModuleContext,
        #[allow(dead_code)]
        greeting: String,
    }

    #[async_trait]
    impl Module for NeedsService {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for NeedsService {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<NeedsService>(|scope| {
                Ok(Arc::new(NeedsService {
                    ctx: scope.context(),
                    greeting: scope.service::<String>()?,
                }))
            })
        }
    }

    #[derive(Debug)]
    struct Doomed {
        ctx: ModuleContext,
        #[allow(dead_code)]
        store: Arc<Store>,
    }

    #[async_trait]
    impl Module for Doomed {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Doomed {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Doomed>(|scope| {
                let store = scope.module::<Store>()?;
                // Unresolvable without a provider; fails after Store inserted.
                let _missing: String = scope.service::<String>()?;
                Ok(Arc::new(Doomed {
                    ctx: scope.context(),
                    store,
                }))
            })
        }
    }

    struct ConstructorSubscriber {
        ctx: ModuleContext,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Module for ConstructorSubscriber {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    struct Greeting;

    impl ServiceProvider for Greeting {
        fn resolve(&self, ty: TypeId) -> Option<Box<dyn std::any::Any + Send + Sync>> {
            (ty == TypeId::of::<String>()).then(|| Box::new("hello".to_string()) as _)
        }
    }

    /// At most one instance of a singleton type; `add` configures the
    /// existing one.
    #[tokio::test]
    async fn singleton_types_have_at_most_one_instance() {
        let agent = crate::Agent::new("test");
        let first = agent.add::<Store>().unwrap();

        let configured = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&configured);
        let second = agent
            .add_with::<Store>(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(configured.load(Ordering::SeqCst), 1);
        assert_eq!(agent.get_all::<Store>().len(), 1);
    }

    /// Required members resolve by inserting the dependency when absent.
    #[tokio::test]
    async fn required_members_insert_their_dependency() {
        let agent = crate::Agent::new("test");
        let cache = agent.add::<Cache>().unwrap();

        let store = agent.get::<Store>().unwrap();
        assert!(Arc::ptr_eq(cache.store.get().unwrap(), &store));
        assert_eq!(agent.modules().len(), 2);
    }

    /// A required member resolving to an existing module reuses it.
    #[tokio::test]
    async fn required_members_reuse_existing_modules() {
        let agent = crate::Agent::new("test");
        let store = agent.add::<Store>().unwrap();
        let cache = agent.add::<Cache>().unwrap();

        assert!(Arc::ptr_eq(cache.store.get().unwrap(), &store));
        assert_eq!(agent.modules().len(), 2);
    }

    /// A failed insertion leaves the module sequence exactly as before.
    #[tokio::test]
    async fn failed_add_rolls_back_to_the_snapshot() {
        let agent = crate::Agent::new("test");
        agent.add::<Store>().unwrap();

        let err = agent.add::<NeedsService>().unwrap_err();
        assert!(matches!(err, AgentError::InsertFailed { .. }));

        assert_eq!(agent.modules().len(), 1);
        assert!(agent.get_or_default::<NeedsService>().is_none());
    }

    /// Rollback also strips dependencies inserted along the way.
    #[tokio::test]
    async fn failed_add_rolls_back_recursively_inserted_dependencies() {
        let agent = crate::Agent::new("test");

        let err = agent.add::<Doomed>().unwrap_err();
        assert!(matches!(err, AgentError::InsertFailed { .. }));

        assert!(agent.modules().is_empty());
        assert!(agent.get_or_default::<Store>().is_none());
    }

    /// The service-provider resolution path.
    #[tokio::test]
    async fn services_resolve_through_the_provider() {
        let agent = crate::AgentBuilder::new("test")
            .service_provider(Arc::new(Greeting))
            .build();
        let module = agent.add::<NeedsService>().unwrap();
        assert_eq!(module.greeting, "hello");
    }

    /// Constructor-time subscriptions buffer and drain on insertion.
    #[tokio::test]
    async fn constructor_subscriptions_are_deferred_until_attach() {
        let agent = crate::Agent::new("test");
        let seen = Arc::new(AtomicUsize::new(0));

        let s = Arc::clone(&seen);
        let module = agent
            .add_factory(move |ctx: ModuleContext| {
                let counter = Arc::clone(&s);
                let c = Arc::clone(&counter);
                ctx.receive::<u8>(move |_| {
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
                ConstructorSubscriber { ctx, seen: counter }
            })
            .unwrap();

        agent.send(1u8).await.unwrap();
        assert_eq!(module.seen.load(Ordering::SeqCst), 1);
    }

    /// Factory-added modules land in the sequence like any other.
    #[tokio::test]
    async fn add_factory_appends_the_module() {
        let agent = crate::Agent::new("test");
        let log: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));

        let l = Arc::clone(&log);
        agent
            .add_factory(move |ctx: ModuleContext| {
                let sink = Arc::clone(&l);
                ctx.receive::<u8>(move |v| sink.lock().unwrap().push(v)).unwrap();
                ConstructorSubscriber {
                    ctx,
                    seen: Arc::new(AtomicUsize::new(0)),
                }
            })
            .unwrap();

        assert_eq!(agent.modules().len(), 1);
        agent.send(9u8).await.unwrap();
        assert_eq!(log.lock().unwrap().as_slice(), [9]);
    }

    /// `get_or_add` short-circuits on an existing instance.
    #[tokio::test]
    async fn get_or_add_reuses_existing() {
        let agent = crate::Agent::new("test");
        let first = agent.get_or_add::<Cache>().unwrap();
        let second = agent.get_or_add::<Cache>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
