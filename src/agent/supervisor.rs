//! # Run supervisor: concurrent per-module run loops under a policy.
//!
//! `Agent::run` executes every module's `run_loop` concurrently until the
//! caller's token cancels, every loop is exhausted, or a stop-all policy
//! fires.
//!
//! ## Architecture
//! ```text
//! Agent::run(policy, cancel)
//!     │  (state must be Initialized; one run at a time)
//!     ▼
//! reconfiguration loop {
//!     ├─► start a loop task per member not running and not finished
//!     ├─► cancel tasks whose module left the agent
//!     └─► await one of:
//!           ├─► supervisor token cancelled  → drain, return
//!           ├─► membership epoch changed    → reconcile again
//!           └─► a loop task exited          → apply exception policy
//! }
//! ```
//!
//! ## Policy effects on a failing loop
//! ```text
//! LogAndStopModule   drop the loop; others continue          (default)
//! LogAndRemoveModule remove the module; others continue
//! LogAndRerunModule  restart the loop after Config::rerun_backoff
//! LogAndRerunAll     cancel all, back off, restart every loop
//! LogAndStopAll      cancel all, return Ok
//! RethrowAndStopAll  cancel all, return the error
//! ```
//!
//! ## Rules
//! - A loop returning `Ok` or `Err(Canceled)` is a graceful exit; no policy
//!   applies and the loop is not restarted.
//! - Panics inside a loop are caught and treated as fatal loop errors, with
//!   the module identity intact.
//! - `Agent::stop()` cancels the supervisor's own token: `run` returns
//!   `Ok(())`. The **caller's** token cancelling returns `Err(Canceled)`.
//! - Each loop task gets a child token of the supervisor; cancellation never
//!   crosses from one module to another.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ModuleError};
use crate::events::{Bus, Event, EventKind};
use crate::module::ModuleId;
use crate::policies::RunExceptionPolicy;
use crate::signals::panic_message;

use super::agent::{Agent, ModuleSlot};
use super::state::AgentState;

/// Outcome of one loop task, with the module identity preserved.
struct LoopExit {
    id: ModuleId,
    name: Arc<str>,
    result: Result<(), ModuleError>,
}

/// Entry point behind [`Agent::run`].
pub(super) async fn run(
    agent: &Arc<Agent>,
    policy: RunExceptionPolicy,
    cancel: CancellationToken,
) -> Result<(), AgentError> {
    let state = agent.state.get();
    if state != AgentState::Initialized {
        return Err(AgentError::InvalidState {
            operation: "run",
            state,
        });
    }

    let supervisor = cancel.child_token();
    {
        let mut guard = agent.run_token.lock().unwrap_or_else(|p| p.into_inner());
        if guard.is_some() {
            return Err(AgentError::InvalidState {
                operation: "run",
                state,
            });
        }
        *guard = Some(supervisor.clone());
    }

    let result = drive(agent, policy, &cancel, &supervisor).await;

    {
        let mut guard = agent.run_token.lock().unwrap_or_else(|p| p.into_inner());
        *guard = None;
    }

    let mut stopped = Event::now(EventKind::SupervisorStopped);
    if let Err(err) = &result {
        stopped = stopped.with_error(err.to_string());
    }
    agent.publish(stopped);
    result
}

/// The reconfiguration loop.
async fn drive(
    agent: &Arc<Agent>,
    policy: RunExceptionPolicy,
    external: &CancellationToken,
    supervisor: &CancellationToken,
) -> Result<(), AgentError> {
    let backoff = agent.config.rerun_backoff;
    let mut membership = agent.membership_stream();
    let mut set: JoinSet<LoopExit> = JoinSet::new();
    let mut running: HashMap<ModuleId, CancellationToken> = HashMap::new();
    // Loops that exited and must not restart on reconfiguration.
    let mut finished: HashSet<ModuleId> = HashSet::new();
    let mut attempts: HashMap<ModuleId, u64> = HashMap::new();

    loop {
        // Reconcile the task set with the current membership.
        let slots: Vec<ModuleSlot> = agent.lock_modules().clone();
        let member_ids: HashSet<ModuleId> = slots.iter().map(|s| s.id).collect();
        for slot in &slots {
            if !running.contains_key(&slot.id) && !finished.contains(&slot.id) {
                spawn_loop(
                    &agent.bus,
                    &mut set,
                    &mut running,
                    &mut attempts,
                    slot,
                    supervisor,
                    None,
                );
            }
        }
        for (id, token) in &running {
            if !member_ids.contains(id) {
                token.cancel();
            }
        }

        tokio::select! {
            _ = supervisor.cancelled() => {
                cancel_and_drain(&mut set, &mut running).await;
                return if external.is_cancelled() {
                    Err(AgentError::Canceled)
                } else {
                    Ok(())
                };
            }
            changed = membership.changed() => {
                if changed.is_err() {
                    cancel_and_drain(&mut set, &mut running).await;
                    return Ok(());
                }
                continue;
            }
            joined = set.join_next() => {
                let exit = match joined {
                    // Every member loop is exhausted.
                    None => return Ok(()),
                    Some(Ok(exit)) => exit,
                    // Loop tasks catch panics themselves; an aborted task
                    // carries no policy-relevant outcome.
                    Some(Err(_)) => continue,
                };
                running.remove(&exit.id);

                let err = match exit.result {
                    Ok(()) | Err(ModuleError::Canceled) => {
                        finished.insert(exit.id);
                        agent.publish(
                            Event::now(EventKind::RunLoopStopped).with_module(exit.name.as_ref()),
                        );
                        continue;
                    }
                    Err(err) => err,
                };

                tracing::error!(
                    module = exit.name.as_ref(),
                    err = %err,
                    policy = ?policy,
                    "run loop failed",
                );
                agent.publish(
                    Event::now(EventKind::RunLoopFailed)
                        .with_module(exit.name.as_ref())
                        .with_attempt(attempts.get(&exit.id).copied().unwrap_or(0))
                        .with_error(err.to_string()),
                );

                match policy {
                    RunExceptionPolicy::LogAndStopModule => {
                        finished.insert(exit.id);
                    }
                    RunExceptionPolicy::LogAndRemoveModule => {
                        finished.insert(exit.id);
                        match agent.remove_modules(&[exit.id]).await {
                            Ok(_) => {}
                            Err(remove_err) => tracing::warn!(
                                module = exit.name.as_ref(),
                                err = %remove_err,
                                "failed to remove module after run loop error",
                            ),
                        }
                    }
                    RunExceptionPolicy::LogAndRerunModule => {
                        if let Some(slot) = slots.iter().find(|s| s.id == exit.id) {
                            agent.publish(
                                Event::now(EventKind::RerunScheduled)
                                    .with_module(exit.name.as_ref())
                                    .with_delay(backoff),
                            );
                            spawn_loop(
                                &agent.bus,
                                &mut set,
                                &mut running,
                                &mut attempts,
                                slot,
                                supervisor,
                                Some(backoff),
                            );
                        }
                    }
                    RunExceptionPolicy::LogAndRerunAll => {
                        agent.publish(Event::now(EventKind::RerunScheduled).with_delay(backoff));
                        cancel_and_drain(&mut set, &mut running).await;
                        finished.clear();
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => {}
                            _ = supervisor.cancelled() => {
                                return if external.is_cancelled() {
                                    Err(AgentError::Canceled)
                                } else {
                                    Ok(())
                                };
                            }
                        }
                    }
                    RunExceptionPolicy::LogAndStopAll => {
                        cancel_and_drain(&mut set, &mut running).await;
                        return Ok(());
                    }
                    RunExceptionPolicy::RethrowAndStopAll => {
                        cancel_and_drain(&mut set, &mut running).await;
                        return Err(AgentError::RunPolicy {
                            module: exit.name.to_string(),
                            source: err,
                        });
                    }
                }
            }
        }
    }
}

/// Spawns one loop task (optionally after a cancellable backoff sleep).
fn spawn_loop(
    bus: &Bus,
    set: &mut JoinSet<LoopExit>,
    running: &mut HashMap<ModuleId, CancellationToken>,
    attempts: &mut HashMap<ModuleId, u64>,
    slot: &ModuleSlot,
    supervisor: &CancellationToken,
    delay: Option<Duration>,
) {
    let token = supervisor.child_token();
    let attempt = {
        let counter = attempts.entry(slot.id).or_insert(0);
        *counter += 1;
        *counter
    };

    let bus = bus.clone();
    let module = Arc::clone(&slot.module);
    let id = slot.id;
    let name = Arc::clone(&slot.display_name);
    let task_token = token.clone();

    set.spawn(async move {
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = task_token.cancelled() => {
                    return LoopExit {
                        id,
                        name,
                        result: Err(ModuleError::Canceled),
                    };
                }
            }
        }

        bus.publish(
            Event::now(EventKind::RunLoopStarting)
                .with_module(name.as_ref())
                .with_attempt(attempt),
        );

        let fut = module.run_loop(task_token.clone());
        let result = match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ModuleError::Fatal {
                reason: panic_message(payload.as_ref()),
            }),
        };

        LoopExit { id, name, result }
    });

    running.insert(slot.id, token);
}

/// Cancels every loop task and waits for all of them to exit.
async fn cancel_and_drain(
    set: &mut JoinSet<LoopExit>,
    running: &mut HashMap<ModuleId, CancellationToken>,
) {
    for token in running.values() {
        token.cancel();
    }
    while set.join_next().await.is_some() {}
    running.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use crate::module::{Module, ModuleContext, ModuleDescriptor, Registered};
    use crate::Agent;

    struct AlwaysFails {
        ctx: ModuleContext,
        attempts: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Module for AlwaysFails {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn run_loop(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(ModuleError::fail("loop boom"))
        }
    }

    impl Registered for AlwaysFails {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<AlwaysFails>(|scope| {
                Ok(Arc::new(AlwaysFails {
                    ctx: scope.context(),
                    attempts: Arc::new(AtomicU64::new(0)),
                }))
            })
        }
    }

    struct Steady {
        ctx: ModuleContext,
        ticks: Arc<AtomicU64>,
        canceled_cleanly: Arc<AtomicU64>,
    }

    #[async_trait]
    impl Module for Steady {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn run_loop(&self, cancel: CancellationToken) -> Result<(), ModuleError> {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        self.ticks.fetch_add(1, Ordering::SeqCst);
                    }
                    _ = cancel.cancelled() => {
                        self.canceled_cleanly.fetch_add(1, Ordering::SeqCst);
                        return Err(ModuleError::Canceled);
                    }
                }
            }
        }
    }

    impl Registered for Steady {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<Steady>(|scope| {
                Ok(Arc::new(Steady {
                    ctx: scope.context(),
                    ticks: Arc::new(AtomicU64::new(0)),
                    canceled_cleanly: Arc::new(AtomicU64::new(0)),
                }))
            })
        }
    }

    struct OneShot {
        ctx: ModuleContext,
    }

    #[async_trait]
    impl Module for OneShot {
        fn context(&self) -> &ModuleContext {
            &self.ctx
        }

        async fn run_loop(&self, _cancel: CancellationToken) -> Result<(), ModuleError> {
            Ok(())
        }
    }

    impl Registered for OneShot {
        fn descriptor() -> ModuleDescriptor {
            ModuleDescriptor::new::<OneShot>(|scope| Ok(Arc::new(OneShot { ctx: scope.context() })))
        }
    }

    async fn initialized_agent() -> Arc<Agent> {
        let agent = Agent::new("test");
        agent.initialize().await.unwrap();
        agent
    }

    /// All loops completing naturally ends the run with `Ok`.
    #[tokio::test]
    async fn run_returns_when_every_loop_is_exhausted() {
        let agent = initialized_agent().await;
        agent.add::<OneShot>().unwrap();
        agent.initialization_complete().await;

        agent
            .run(RunExceptionPolicy::default(), CancellationToken::new())
            .await
            .unwrap();
    }

    /// A failing loop under the rerun policy restarts on the configured
    /// backoff cadence while the healthy module keeps running.
    #[tokio::test]
    async fn rerun_module_policy_restarts_only_the_offender() {
        let agent = initialized_agent().await;
        let failing = agent.add::<AlwaysFails>().unwrap();
        let steady = agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .run(RunExceptionPolicy::LogAndRerunModule, CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.stop();
        runner.await.unwrap().unwrap();

        // 200ms of 10ms backoffs: comfortably more than five attempts, and
        // the steady module was never cancelled early.
        assert!(failing.attempts.load(Ordering::SeqCst) >= 5);
        assert!(steady.ticks.load(Ordering::SeqCst) > 0);
        assert_eq!(steady.canceled_cleanly.load(Ordering::SeqCst), 1);
    }

    /// The default policy stops the offending loop and leaves others alone.
    #[tokio::test]
    async fn stop_module_policy_stops_only_the_offender() {
        let agent = initialized_agent().await;
        let failing = agent.add::<AlwaysFails>().unwrap();
        let steady = agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .run(RunExceptionPolicy::LogAndStopModule, CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.stop();
        runner.await.unwrap().unwrap();

        assert_eq!(failing.attempts.load(Ordering::SeqCst), 1);
        assert!(steady.ticks.load(Ordering::SeqCst) > 0);
    }

    /// `RethrowAndStopAll` propagates the loop error to the `run` caller.
    #[tokio::test]
    async fn rethrow_policy_propagates_the_error() {
        let agent = initialized_agent().await;
        agent.add::<AlwaysFails>().unwrap();
        agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let err = agent
            .run(RunExceptionPolicy::RethrowAndStopAll, CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            AgentError::RunPolicy { module, .. } => assert_eq!(module, "AlwaysFails"),
            other => panic!("unexpected error: {other}"),
        }
    }

    /// `LogAndRemoveModule` evicts the offender from the agent.
    #[tokio::test]
    async fn remove_module_policy_evicts_the_offender() {
        let agent = initialized_agent().await;
        agent.add::<AlwaysFails>().unwrap();
        agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .run(RunExceptionPolicy::LogAndRemoveModule, CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(agent.get_or_default::<AlwaysFails>().is_none());
        assert!(agent.get_or_default::<Steady>().is_some());

        agent.stop();
        runner.await.unwrap().unwrap();
    }

    /// The caller's token cancelling surfaces as `Err(Canceled)`; `stop()`
    /// returns quietly.
    #[tokio::test]
    async fn caller_cancellation_is_distinguished_from_stop() {
        let agent = initialized_agent().await;
        agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let cancel = CancellationToken::new();
        let runner = {
            let agent = Arc::clone(&agent);
            let cancel = cancel.clone();
            tokio::spawn(async move { agent.run(RunExceptionPolicy::default(), cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        let result = runner.await.unwrap();
        assert!(matches!(result, Err(AgentError::Canceled)));
    }

    /// A module added while the supervisor runs gets its loop started.
    #[tokio::test]
    async fn membership_changes_reconfigure_the_running_supervisor() {
        let agent = initialized_agent().await;
        let first = agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .run(RunExceptionPolicy::default(), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(first.ticks.load(Ordering::SeqCst) > 0);

        // Steady is not a singleton: a second instance joins the running
        // supervisor through the membership signal.
        let second = agent.add::<Steady>().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(second.ticks.load(Ordering::SeqCst) > 0);

        agent.stop();
        runner.await.unwrap().unwrap();
    }

    /// A second concurrent `run` is rejected.
    #[tokio::test]
    async fn concurrent_runs_are_rejected() {
        let agent = initialized_agent().await;
        agent.add::<Steady>().unwrap();
        agent.initialization_complete().await;

        let runner = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .run(RunExceptionPolicy::default(), CancellationToken::new())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let err = agent
            .run(RunExceptionPolicy::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::InvalidState { .. }));

        agent.stop();
        runner.await.unwrap().unwrap();
    }
}
