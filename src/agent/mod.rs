//! # Agent: container owning modules, signalers, and lifecycle state.
//!
//! The agent is the runtime's composition root. It owns the ordered module
//! sequence, one signaler per signal type, the preferred-order map, the
//! reverse required-by graph, and the lifecycle state machine; it exposes
//! add/remove/get, the send/observe surface, `initialize`, `run`, and
//! `dispose`.
//!
//! ## Files & responsibilities
//! - **agent.rs**: the [`Agent`] type and [`AgentBuilder`]; lifecycle
//!   (`initialize`/`dispose`), the signaler map, send/observe/ordering
//!   surface, module lookup.
//! - **state.rs**: [`AgentState`] and the observable state cell.
//! - **insert.rs**: module insertion — descriptor walk, dependency
//!   resolution via [`InsertScope`], required members, eager-init
//!   scheduling, rollback.
//! - **remove.rs**: batch removal — dependent check, dependency-ordered
//!   disposal, veto cascade, signaler/graph cleanup.
//! - **supervisor.rs**: the concurrent run supervisor and its exception
//!   policies.
//!
//! ## Lifecycle state machine
//! ```text
//! Uninitialized ──► Initializing ──► Initialized
//!       │                │                │
//!       └────────────────┴────────────────┴──► Disposing ──► Disposed
//! ```
//!
//! | Operation        | Unini. | Init.ing | Init. | Disp.ing | Disp. |
//! |------------------|--------|----------|-------|----------|-------|
//! | add module       | ✓      | ✓ eager  | ✓ eager | ✗      | ✗     |
//! | remove module    | ✓      | ✗        | ✓     | ✗        | ✗     |
//! | send signal      | ✓      | ✓        | ✓     | ✓        | ✗     |
//! | observe signal   | ✓      | ✓        | ✓     | ✗        | ✗     |
//! | set signal order | ✓      | ✓        | ✓     | ✗        | ✗     |
//! | initialize       | once   | no-op    | no-op | error    | error |
//! | dispose          | ✓      | error    | ✓     | no-op    | no-op |
//! | run              | ✗      | ✗        | ✓     | ✗        | ✗     |

mod insert;
mod remove;
mod state;
mod supervisor;
#[allow(clippy::module_inception)]
mod agent;

pub use agent::{Agent, AgentBuilder, ServiceProvider};
pub use insert::InsertScope;
pub use state::AgentState;
