//! # Module removal: dependent checks, ordered disposal, veto cascade.
//!
//! Removing a batch *S* of modules:
//!
//! 1. Rejected while `Initializing`; a no-op in a terminal state.
//! 2. If any module outside *S* declares a batch member's type as required,
//!    the whole batch is refused: a warning is logged and `Ok(false)`
//!    returned.
//! 3. *S* is sorted so that a module's requirers come **after** it
//!    (dependencies dispose first).
//! 4. Each module's `dispose` runs in that order:
//!    - [`ModuleError::Veto`] keeps the module, and every later batch member
//!      that transitively requires it stays too.
//!    - Any other error is aggregated into `ModuleDisposeFailed`; the module
//!      is still removed.
//! 5. Every removed module loses its agent back-reference, its slot in the
//!    sequence, its processors in every signaler, and its entries in the
//!    preferred-order arrays.
//! 6. The run supervisor is notified of the membership change.
//! 7. Returns `Ok(true)` iff at least one module was removed.
//!
//! ## Rules
//! - Vetoes are soft outcomes (warn + `false`), never errors.
//! - During agent disposal the batch runs in force mode: vetoes cannot keep
//!   a module alive and are aggregated like ordinary dispose failures.
//! - Removal never interrupts an in-flight dispatch; a dispatch that
//!   snapshotted the processor array before the removal completes normally.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::FutureExt;

use crate::error::{AgentError, ModuleError, ModuleFailure};
use crate::events::{Event, EventKind};
use crate::module::{Module, ModuleId};
use crate::signals::panic_message;

use super::agent::{Agent, ModuleSlot};
use super::state::AgentState;

impl Agent {
    /// Removes every module of concrete type `T`.
    ///
    /// Returns `Ok(false)` when no such module exists, the batch was refused
    /// because of outside dependents, or every member vetoed.
    pub async fn remove<T: Module>(self: &Arc<Self>) -> Result<bool, AgentError> {
        let ids: Vec<ModuleId> = {
            let ty = TypeId::of::<T>();
            let slots = self.lock_modules();
            slots.iter().filter(|s| s.type_id == ty).map(|s| s.id).collect()
        };
        self.remove_modules(&ids).await
    }

    /// Removes the given modules as one batch.
    pub async fn remove_modules(self: &Arc<Self>, ids: &[ModuleId]) -> Result<bool, AgentError> {
        match self.state.get() {
            AgentState::Initializing => {
                return Err(AgentError::InvalidState {
                    operation: "remove",
                    state: AgentState::Initializing,
                })
            }
            state if state.is_terminal() => return Ok(false),
            _ => {}
        }
        self.remove_batch(ids, false).await
    }

    /// Batch removal shared by `remove_modules` and agent disposal.
    ///
    /// `force` (disposal) skips the dependent check and overrides vetoes.
    pub(super) async fn remove_batch(
        self: &Arc<Self>,
        ids: &[ModuleId],
        force: bool,
    ) -> Result<bool, AgentError> {
        let batch: Vec<ModuleSlot> = {
            let slots = self.lock_modules();
            slots.iter().filter(|s| ids.contains(&s.id)).cloned().collect()
        };
        if batch.is_empty() {
            return Ok(false);
        }

        let graph: HashMap<TypeId, HashSet<TypeId>> = {
            let graph = self.required_by.lock().unwrap_or_else(|p| p.into_inner());
            graph.clone()
        };

        if !force {
            if let Some((member, dependent)) = self.blocking_dependent(&batch, &graph) {
                tracing::warn!(
                    module = member.as_ref(),
                    dependent = dependent.as_ref(),
                    "removal refused: module is required by a module outside the batch",
                );
                self.publish(
                    Event::now(EventKind::RemovalVetoed)
                        .with_module(member.as_ref())
                        .with_error(format!("required by {dependent}")),
                );
                return Ok(false);
            }
        }

        let ordered = order_dependencies_first(batch, &graph);

        let mut kept_types: HashSet<TypeId> = HashSet::new();
        let mut removed: Vec<ModuleSlot> = Vec::new();
        let mut failures: Vec<ModuleFailure> = Vec::new();

        for slot in ordered {
            if !force
                && !kept_types.is_empty()
                && requires_transitively(&graph, slot.type_id, &kept_types)
            {
                tracing::warn!(
                    module = slot.display_name.as_ref(),
                    "stays: it requires a module that vetoed its removal",
                );
                continue;
            }

            match run_dispose(&slot).await {
                Ok(()) => removed.push(slot),
                Err(err) if err.is_veto() && !force => {
                    tracing::warn!(
                        module = slot.display_name.as_ref(),
                        err = %err,
                        "module vetoed its removal",
                    );
                    self.publish(
                        Event::now(EventKind::RemovalVetoed)
                            .with_module(slot.display_name.as_ref())
                            .with_error(err.to_string()),
                    );
                    kept_types.insert(slot.type_id);
                }
                Err(err) => {
                    failures.push((slot.display_name.to_string(), err));
                    removed.push(slot);
                }
            }
        }

        for slot in &removed {
            {
                let mut modules = self.lock_modules();
                if let Some(idx) = modules.iter().position(|s| s.id == slot.id) {
                    modules.remove(idx);
                }
            }
            self.strip_module(slot);
        }

        if !removed.is_empty() {
            self.bump_membership();
        }

        if failures.is_empty() {
            Ok(!removed.is_empty())
        } else {
            Err(AgentError::DisposeFailed { failures })
        }
    }

    /// Finds a batch member required by a live module outside the batch.
    fn blocking_dependent(
        &self,
        batch: &[ModuleSlot],
        graph: &HashMap<TypeId, HashSet<TypeId>>,
    ) -> Option<(Arc<str>, Arc<str>)> {
        let batch_ids: HashSet<ModuleId> = batch.iter().map(|s| s.id).collect();
        let slots = self.lock_modules();

        for member in batch {
            if let Some(requirer_types) = graph.get(&member.type_id) {
                let outside = slots
                    .iter()
                    .find(|s| requirer_types.contains(&s.type_id) && !batch_ids.contains(&s.id));
                if let Some(dependent) = outside {
                    return Some((
                        Arc::clone(&member.display_name),
                        Arc::clone(&dependent.display_name),
                    ));
                }
            }
        }
        None
    }

    /// Strips one removed module out of every runtime structure: back-ref,
    /// signaler processors, preferred-order arrays, required-by edges.
    pub(super) fn strip_module(&self, slot: &ModuleSlot) {
        let ctx = slot.module.context();
        for ty in ctx.subscribed_types() {
            if let Some(sig) = self.signalers.get(&ty) {
                sig.remove_owner(slot.id);
            }
        }
        ctx.mark_removed();

        let ordered_types: Vec<TypeId> = self.preferred.iter().map(|e| *e.key()).collect();
        for ty in ordered_types {
            let updated = self.preferred.get_mut(&ty).and_then(|mut order| {
                if order.contains(&slot.id) {
                    order.retain(|m| *m != slot.id);
                    Some(order.clone())
                } else {
                    None
                }
            });
            if let Some(order) = updated {
                if let Some(sig) = self.signalers.get(&ty) {
                    sig.set_preferred(order);
                }
            }
        }

        let type_still_present = {
            let slots = self.lock_modules();
            slots.iter().any(|s| s.type_id == slot.type_id)
        };
        if !type_still_present {
            let mut graph = self.required_by.lock().unwrap_or_else(|p| p.into_inner());
            graph.remove(&slot.type_id);
            for requirers in graph.values_mut() {
                requirers.remove(&slot.type_id);
            }
        }

        self.publish(Event::now(EventKind::ModuleRemoved).with_module(slot.display_name.as_ref()));
    }
}

/// Runs one module's `dispose`, converting panics into fatal errors.
async fn run_dispose(slot: &ModuleSlot) -> Result<(), ModuleError> {
    let fut = slot.module.dispose();
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(ModuleError::Fatal {
            reason: panic_message(payload.as_ref()),
        }),
    }
}

/// Orders the batch so each module's requirers come after it; ties keep
/// insertion order. Types in a (defective) dependency cycle fall back to
/// insertion order at the end.
fn order_dependencies_first(
    batch: Vec<ModuleSlot>,
    graph: &HashMap<TypeId, HashSet<TypeId>>,
) -> Vec<ModuleSlot> {
    let batch_types: Vec<TypeId> = {
        let mut seen = HashSet::new();
        batch
            .iter()
            .filter(|s| seen.insert(s.type_id))
            .map(|s| s.type_id)
            .collect()
    };
    let in_batch: HashSet<TypeId> = batch_types.iter().copied().collect();

    // indegree[t] = number of batch types t requires.
    let mut indegree: HashMap<TypeId, usize> = batch_types.iter().map(|t| (*t, 0)).collect();
    for dep in &batch_types {
        if let Some(requirers) = graph.get(dep) {
            for requirer in requirers {
                if in_batch.contains(requirer) {
                    if let Some(count) = indegree.get_mut(requirer) {
                        *count += 1;
                    }
                }
            }
        }
    }

    let mut rank: HashMap<TypeId, usize> = HashMap::new();
    let mut ready: Vec<TypeId> = batch_types
        .iter()
        .filter(|t| indegree[t] == 0)
        .copied()
        .collect();
    let mut next_rank = 0usize;

    while let Some(ty) = ready.first().copied() {
        ready.remove(0);
        rank.insert(ty, next_rank);
        next_rank += 1;
        if let Some(requirers) = graph.get(&ty) {
            for requirer in requirers {
                if let Some(count) = indegree.get_mut(requirer) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(*requirer);
                    }
                }
            }
        }
    }

    let mut ordered: Vec<(usize, usize, ModuleSlot)> = batch
        .into_iter()
        .enumerate()
        .map(|(pos, slot)| {
            let r = rank.get(&slot.type_id).copied().unwrap_or(usize::MAX);
            (r, pos, slot)
        })
        .collect();
    ordered.sort_by_key(|(r, pos, _)| (*r, *pos));
    ordered.into_iter().map(|(_, _, slot)| slot).collect()
}

/// True when `ty` transitively requires any of the kept types.
fn requires_transitively(
    graph: &HashMap<TypeId, HashSet<TypeId>>,
    ty: TypeId,
    kept: &HashSet<TypeId>,
) -> bool {
    let mut seen: HashSet<TypeId> = kept.clone();
    let mut stack: Vec<TypeId> = kept.iter().copied().collect();

    while let Some(current) = stack.pop() {
        if let Some(requirers) = graph.get(&current) {
            for requirer in requirers {
                if *requirer == ty {
                    return true;
                }
                if seen.insert(*requirer) {
                    stack.push(*requirer);
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::OnceLock;

    use async_trait::async_trait;

    use crate::module::{downcast_module, ModuleContext, ModuleDescriptor, Registered};
    use crate::Agent;

    struct Base {
        ctx: ModuleContext,
        veto: AtomicBool,
    }

    #[async_trait]
    impl Module for Base {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn dispose(&self) -> Result<(), ModuleError> {
            if self.veto.load(Ordering::SeqCst) {
                Err(ModuleError::veto("still required"))
            } else {
                Ok(())
            }
        }
    }

    impl Registered for Base {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Base>(|scope| {
                Ok(Arc::new(Base {
                    ctx: scope.context(),
                    veto: AtomicBool::new(false),
                }))
            })
            .singleton()
        }
    }

    struct Mid {
        ctx: ModuleContext,
        base: OnceLock<Arc<Base>>,
    }

    #[async_trait]
    impl Module for Mid {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Mid {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Mid>(|scope| {
                Ok(Arc::new(Mid {
                    ctx: scope.context(),
                    base: OnceLock::new(),
                }))
            })
            .requires("base", |module, scope| {
                let base = scope.module::<Base>()?;
                let _ = downcast_module::<Mid>(module)?.base.set(base);
                Ok(())
            })
        }
    }

    struct Top {
        ctx: ModuleContext,
        mid: OnceLock<Arc<Mid>>,
    }

    #[async_trait]
    impl Module for Top {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }
    }

    impl Registered for Top {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Top>(|scope| {
                Ok(Arc::new(Top {
                    ctx: scope.context(),
                    mid: OnceLock::new(),
                }))
            })
            .requires("mid", |module, scope| {
                let mid = scope.module::<Mid>()?;
                let _ = downcast_module::<Top>(module)?.mid.set(mid);
                Ok(())
            })
        }
    }

    struct BadDispose {
        ctx: ModuleContext,
    }

    #[async_trait]
    impl Module for BadDispose {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn dispose(&self) -> Result<(), ModuleError> {
            Err(ModuleError::fail("cleanup failed"))
        }
    }

    impl Registered for BadDispose {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<BadDispose>(|scope| {
                Ok(Arc::new(BadDispose { ctx: scope.context() }))
            })
        }
    }

    /// A vetoing dependency keeps the whole batch: the dependency stays and
    /// so does its requirer.
    #[tokio::test]
    async fn veto_keeps_the_vetoing_module_and_its_requirers() {
        let agent = Agent::new("test");
        let mid = agent.add::<Mid>().unwrap();
        let base = agent.get::<Base>().unwrap();
        base.veto.store(true, Ordering::SeqCst);

        let removed = agent
            .remove_modules(&[base.context().id(), mid.context().id()])
            .await
            .unwrap();

        assert!(!removed);
        assert_eq!(agent.modules().len(), 2);
        assert!(agent.get_or_default::<Base>().is_some());
        assert!(agent.get_or_default::<Mid>().is_some());
    }

    /// The veto cascade is transitive: Top requires Mid requires Base; a veto
    /// by Base keeps all three.
    #[tokio::test]
    async fn veto_cascade_is_transitive() {
        let agent = Agent::new("test");
        let top = agent.add::<Top>().unwrap();
        let mid = agent.get::<Mid>().unwrap();
        let base = agent.get::<Base>().unwrap();
        base.veto.store(true, Ordering::SeqCst);

        let removed = agent
            .remove_modules(&[
                base.context().id(),
                mid.context().id(),
                top.context().id(),
            ])
            .await
            .unwrap();

        assert!(!removed);
        assert_eq!(agent.modules().len(), 3);
    }

    /// A batch missing a direct dependent is refused outright.
    #[tokio::test]
    async fn removal_is_refused_when_a_dependent_stays_behind() {
        let agent = Agent::new("test");
        let _mid = agent.add::<Mid>().unwrap();
        let base = agent.get::<Base>().unwrap();

        let removed = agent.remove_modules(&[base.context().id()]).await.unwrap();

        assert!(!removed);
        assert_eq!(agent.modules().len(), 2);
    }

    /// Removing a dependent first unblocks its dependency.
    #[tokio::test]
    async fn removing_the_full_chain_succeeds_dependencies_last() {
        let agent = Agent::new("test");
        let mid = agent.add::<Mid>().unwrap();
        let base = agent.get::<Base>().unwrap();

        let removed = agent
            .remove_modules(&[mid.context().id(), base.context().id()])
            .await
            .unwrap();

        assert!(removed);
        assert!(agent.modules().is_empty());
    }

    /// Dispose failures other than a veto still remove the module and
    /// surface as an aggregate.
    #[tokio::test]
    async fn non_veto_dispose_errors_aggregate_but_remove() {
        let agent = Agent::new("test");
        let bad = agent.add::<BadDispose>().unwrap();

        let err = agent
            .remove_modules(&[bad.context().id()])
            .await
            .unwrap_err();

        match err {
            AgentError::DisposeFailed { failures } => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].0, "BadDispose");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(agent.modules().is_empty());
    }

    /// Invariant: after removal the module's agent-derived capabilities fail
    /// deterministically, and its subscriptions are gone.
    #[tokio::test]
    async fn removed_modules_are_fully_detached() {
        let agent = Agent::new("test");
        let base = agent.add::<Base>().unwrap();
        base.context().receive::<u8>(|_| {}).unwrap();

        let removed = agent.remove::<Base>().await.unwrap();
        assert!(removed);

        assert!(matches!(
            base.context().agent(),
            Err(AgentError::Detached { .. })
        ));

        // add(T); remove(T) leaves the pipeline behaviorally untouched:
        // with no processors the value echoes back.
        let echoed = agent.send_values::<u8, u8>(7).await.unwrap();
        assert_eq!(echoed, vec![7]);
    }

    /// Removal of an absent type reports nothing removed.
    #[tokio::test]
    async fn removing_absent_modules_is_false() {
        let agent = Agent::new("test");
        assert!(!agent.remove::<Base>().await.unwrap());
    }
}
