//! # Module trait: async, lifecycle-managed unit of behavior.
//!
//! A module is constructed against a [`ModuleContext`], inserted into an
//! agent, initialized, optionally run (any number of times across `run`
//! invocations), and finally removed. Once removed it can never be inserted
//! again — into any agent.
//!
//! ## Rules
//! - All hooks take `&self`; modules use interior mutability for state.
//! - `run_loop` implementations **must** check `cancel.is_cancelled()`
//!   periodically (or select on `cancelled()`) to enable prompt shutdown,
//!   and should return [`ModuleError::Canceled`] when they exit because of it.
//! - `dispose` may veto removal by returning [`ModuleError::Veto`].
//!
//! ## Example
//! ```rust
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tokio_util::sync::CancellationToken;
//! use modvisor::{Module, ModuleContext, ModuleDescriptor, ModuleError, Registered};
//!
//! struct Ticker {
//!     ctx: ModuleContext,
//! }
//!
//! #[async_trait]
//! impl Module for Ticker {
//!     fn context(&self) -> &ModuleContext {
//!         &self.ctx
//!     }
//!
//!     async fn run_loop(&self, cancel: CancellationToken) -> Result<(), ModuleError> {
//!         while !cancel.is_cancelled() {
//!             tokio::time::sleep(std::time::Duration::from_millis(250)).await;
//!         }
//!         Err(ModuleError::Canceled)
//!     }
//! }
//!
//! impl Registered for Ticker {
//!     fn descriptor() -> ModuleDescriptor {
//!         ModuleDescriptor::new::<Ticker>(|scope| Ok(Arc::new(Ticker { ctx: scope.context() })))
//!     }
//! }
//! ```

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ModuleError};

use super::context::ModuleContext;

/// Shared handle to a module object.
pub type ModuleRef = Arc<dyn Module>;

/// Asynchronous, lifecycle-managed unit of behavior owned by an agent.
#[async_trait]
pub trait Module: Any + Send + Sync {
    /// The module's context: agent back-reference plus the signal façade.
    ///
    /// Implementations store the [`ModuleContext`] they were constructed
    /// with and return it here; the agent uses it to attach, detach, and
    /// clean up subscriptions.
    fn context(&self) -> &ModuleContext;

    /// One-time initialization, called when the agent initializes (or
    /// immediately after insertion into an already-initialized agent).
    ///
    /// Failures are aggregated; the agent still becomes `Initialized`.
    async fn initialize(&self) -> Result<(), ModuleError> {
        Ok(())
    }

    /// Optional long-running loop driven by the run supervisor.
    ///
    /// The default completes immediately, which the supervisor treats as a
    /// finished (non-restartable) loop.
    async fn run_loop(&self, cancel: CancellationToken) -> Result<(), ModuleError> {
        let _ = cancel;
        Ok(())
    }

    /// Cleanup before removal.
    ///
    /// Returning [`ModuleError::Veto`] keeps this module (and every batch
    /// member that transitively requires it) in the agent.
    async fn dispose(&self) -> Result<(), ModuleError> {
        Ok(())
    }
}

/// Downcasts a module handle to its concrete type.
pub fn downcast_module<T: Module>(module: &ModuleRef) -> Result<Arc<T>, AgentError> {
    let cloned: Arc<dyn Module> = Arc::clone(module);
    let any: Arc<dyn Any + Send + Sync> = cloned;
    any.downcast::<T>().map_err(|_| AgentError::NotFound {
        module: super::short_type_name(std::any::type_name::<T>()).to_string(),
    })
}
