//! # modvisor
//!
//! **Modvisor** is an in-process modular agent runtime.
//!
//! An [`Agent`] is a lifecycle-managed container of [`Module`]s that
//! collaborate solely through typed, ordered, interceptable signal pipelines.
//! The crate is designed as a building block for composing independently
//! developed units into one supervised runtime.
//!
//! ## Features
//!
//! | Area               | Description                                                                 | Key types / traits                                |
//! |--------------------|-----------------------------------------------------------------------------|---------------------------------------------------|
//! | **Agent**          | Owns modules, lifecycle state, and one signaler per signal type.            | [`Agent`], [`AgentBuilder`], [`AgentState`]       |
//! | **Modules**        | Units of behavior with init/run/dispose hooks and a signal façade.          | [`Module`], [`ModuleContext`], [`Registered`]     |
//! | **Signals**        | Ordered processor chains: observers, receivers, interceptors.               | [`SignalContext`], [`SignalStream`], [`Observation`] |
//! | **Supervision**    | Parallel per-module run loops under a declared failure policy.              | [`RunExceptionPolicy`]                            |
//! | **Errors**         | Typed errors for the runtime and for module callbacks.                      | [`AgentError`], [`ModuleError`]                   |
//! | **Observability**  | Structured runtime events with non-blocking subscriber fan-out.             | [`Event`], [`Subscribe`], [`TraceSubscriber`]     |
//! | **Configuration**  | Centralized runtime settings.                                               | [`Config`]                                        |
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use modvisor::{
//!     Agent, Module, ModuleContext, ModuleDescriptor, Registered, RunExceptionPolicy,
//! };
//!
//! struct Greeter {
//!     ctx: ModuleContext,
//! }
//!
//! #[async_trait]
//! impl Module for Greeter {
//!     fn context(&self) -> &ModuleContext {
//!         &self.ctx
//!     }
//! }
//!
//! impl Registered for Greeter {
//!     fn descriptor() -> ModuleDescriptor {
//!         ModuleDescriptor::new::<Greeter>(|scope| {
//!             let ctx = scope.context();
//!             // Answer every string signal with its length.
//!             ctx.receive_returning::<String, usize>(|s| s.len())?;
//!             Ok(Arc::new(Greeter { ctx }))
//!         })
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let agent = Agent::new("demo");
//!     agent.add::<Greeter>()?;
//!     agent.initialize().await?;
//!
//!     let lengths: Vec<usize> = agent.send_values("hello".to_string()).await?;
//!     assert_eq!(lengths, vec![5]);
//!
//!     // Run module loops until stopped.
//!     let cancel = CancellationToken::new();
//!     agent.run(RunExceptionPolicy::default(), cancel).await?;
//!
//!     agent.dispose().await?;
//!     Ok(())
//! }
//! ```
//!
//! ---

mod agent;
mod config;
mod error;
mod events;
mod module;
mod policies;
mod signals;
mod subscribers;

// ---- Public re-exports ----

pub use agent::{Agent, AgentBuilder, AgentState, InsertScope, ServiceProvider};
pub use config::Config;
pub use error::{AgentError, ModuleError, ModuleFailure};
pub use events::{Bus, Event, EventKind};
pub use module::{
    downcast_module, Module, ModuleContext, ModuleDescriptor, ModuleId, ModuleRef, Registered,
    RequiredMember,
};
pub use policies::RunExceptionPolicy;
pub use signals::{
    BoxAny, Observation, RawSignalContext, Signal, SignalContext, SignalStream, Signaler,
    SubscriptionHandle,
};
pub use subscribers::{Subscribe, SubscriberSet, TraceSubscriber};
