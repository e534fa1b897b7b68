//! # Error types used by the modvisor runtime and modules.
//!
//! This module defines two main error enums:
//!
//! - [`AgentError`] errors raised by the agent runtime itself.
//! - [`ModuleError`] errors raised by individual module callbacks
//!   (`initialize`, `run_loop`, `dispose`).
//!
//! Both types provide `as_label` helpers for logs and metrics.
//! [`ModuleError`] has additional predicates: `is_fatal()` and `is_veto()`.
//!
//! ## Propagation rules
//! - Signal processor failures are caught and logged; dispatch continues.
//! - `initialize` failures are aggregated into [`AgentError::InitFailed`];
//!   the agent still reaches `Initialized`.
//! - `dispose` failures are aggregated into [`AgentError::DisposeFailed`],
//!   except [`ModuleError::Veto`], which keeps the module in place.
//! - `run_loop` failures are governed by the declared
//!   [`RunExceptionPolicy`](crate::RunExceptionPolicy).

use thiserror::Error;

use crate::agent::AgentState;

/// One `(module display name, error)` pair inside an aggregate failure.
pub type ModuleFailure = (String, ModuleError);

/// # Errors produced by the agent runtime.
///
/// These represent failures of the orchestration layer: lifecycle gate
/// violations, unresolved dependencies, and aggregated module failures.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum AgentError {
    /// Operation is not permitted in the agent's current lifecycle state.
    #[error("operation '{operation}' not permitted in state {state:?}")]
    InvalidState {
        /// The attempted operation.
        operation: &'static str,
        /// The state the agent was in.
        state: AgentState,
    },

    /// Requested module is not present in the agent.
    #[error("module '{module}' not found")]
    NotFound {
        /// Display name of the missing module type.
        module: String,
    },

    /// A constructor parameter or required member had no satisfying value.
    #[error("module '{module}': dependency '{dependency}' could not be resolved")]
    DependencyUnresolved {
        /// The module being instantiated.
        module: String,
        /// The parameter or member that failed to resolve.
        dependency: String,
    },

    /// Module insertion failed; a complete rollback has taken place.
    #[error("inserting module '{module}' failed (rolled back): {source}")]
    InsertFailed {
        /// The module that was being inserted.
        module: String,
        /// The underlying cause.
        #[source]
        source: Box<AgentError>,
    },

    /// Aggregate raised at the end of `initialize`, one entry per failing module.
    #[error("{} module(s) failed to initialize: {}", failures.len(), format_failures(failures))]
    InitFailed {
        /// Failing module names with their errors.
        failures: Vec<ModuleFailure>,
    },

    /// Aggregate raised at the end of a removal batch or agent disposal.
    #[error("{} module(s) failed to dispose: {}", failures.len(), format_failures(failures))]
    DisposeFailed {
        /// Failing module names with their errors.
        failures: Vec<ModuleFailure>,
    },

    /// A module's agent-derived capability was used after removal
    /// (or before insertion completed).
    #[error("module '{module}' is not attached to an agent")]
    Detached {
        /// Display name of the detached module.
        module: String,
    },

    /// The caller-supplied cancellation token fired during `run`.
    #[error("run canceled")]
    Canceled,

    /// A module's `run_loop` error propagated under
    /// [`RunExceptionPolicy::RethrowAndStopAll`](crate::RunExceptionPolicy::RethrowAndStopAll).
    #[error("module '{module}' run loop failed: {source}")]
    RunPolicy {
        /// The offending module.
        module: String,
        /// The run loop error.
        #[source]
        source: ModuleError,
    },
}

impl AgentError {
    /// Returns a short stable label (snake_case) for use in logs/metrics.
    pub fn as_label(&self) -> &'static str {
        match self {
            AgentError::InvalidState { .. } => "agent_invalid_state",
            AgentError::NotFound { .. } => "agent_module_not_found",
            AgentError::DependencyUnresolved { .. } => "agent_dependency_unresolved",
            AgentError::InsertFailed { .. } => "agent_insert_failed",
            AgentError::InitFailed { .. } => "agent_init_failed",
            AgentError::DisposeFailed { .. } => "agent_dispose_failed",
            AgentError::Detached { .. } => "agent_module_detached",
            AgentError::Canceled => "agent_run_canceled",
            AgentError::RunPolicy { .. } => "agent_run_policy",
        }
    }
}

/// # Errors produced by module callbacks.
///
/// These represent failures of individual modules managed by the runtime.
/// `Veto` carries special meaning during removal: the module refuses to be
/// disposed and stays in the agent.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ModuleError {
    /// Callback failed; under a rerun policy the run loop may be restarted.
    #[error("execution failed: {reason}")]
    Fail {
        /// Human-readable failure description.
        reason: String,
    },

    /// Non-recoverable error; a panic inside a callback also surfaces as this.
    #[error("fatal error: {reason}")]
    Fatal {
        /// Human-readable failure description.
        reason: String,
    },

    /// The module refuses disposal and remains in the agent.
    ///
    /// Only meaningful when returned from `dispose`; the removal batch keeps
    /// this module and every batch member that transitively requires it.
    #[error("disposal vetoed: {reason}")]
    Veto {
        /// Why the module cannot be disposed right now.
        reason: String,
    },

    /// The callback observed cancellation and exited.
    ///
    /// This is **not an error** in the traditional sense; the supervisor
    /// treats it as a graceful exit and applies no exception policy.
    #[error("context canceled")]
    Canceled,
}

impl ModuleError {
    /// Shorthand for [`ModuleError::Fail`].
    pub fn fail(reason: impl Into<String>) -> Self {
        ModuleError::Fail {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ModuleError::Fatal`].
    pub fn fatal(reason: impl Into<String>) -> Self {
        ModuleError::Fatal {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`ModuleError::Veto`].
    pub fn veto(reason: impl Into<String>) -> Self {
        ModuleError::Veto {
            reason: reason.into(),
        }
    }

    /// Returns a short stable label.
    pub fn as_label(&self) -> &'static str {
        match self {
            ModuleError::Fail { .. } => "module_failed",
            ModuleError::Fatal { .. } => "module_fatal",
            ModuleError::Veto { .. } => "module_veto",
            ModuleError::Canceled => "module_canceled",
        }
    }

    /// Indicates whether the error is fatal.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ModuleError::Fatal { .. })
    }

    /// Indicates whether the error is a disposal veto.
    pub fn is_veto(&self) -> bool {
        matches!(self, ModuleError::Veto { .. })
    }
}

fn format_failures(failures: &[ModuleFailure]) -> String {
    let items: Vec<String> = failures
        .iter()
        .map(|(name, err)| format!("{name}: {err}"))
        .collect();
    items.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_stable() {
        assert_eq!(AgentError::Canceled.as_label(), "agent_run_canceled");
        assert_eq!(ModuleError::Canceled.as_label(), "module_canceled");
        assert_eq!(ModuleError::veto("busy").as_label(), "module_veto");
    }

    #[test]
    fn aggregate_message_names_every_module() {
        let err = AgentError::InitFailed {
            failures: vec![
                ("Foo".to_string(), ModuleError::fail("boom")),
                ("Bar".to_string(), ModuleError::fatal("bang")),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("Foo"));
        assert!(msg.contains("Bar"));
        assert!(msg.contains("2 module(s)"));
    }

    #[test]
    fn veto_predicate() {
        assert!(ModuleError::veto("still required").is_veto());
        assert!(!ModuleError::fail("x").is_veto());
        assert!(ModuleError::fatal("x").is_fatal());
    }
}
