//! # Agent lifecycle states and the observable state cell.
//!
//! States transition monotonically forward:
//! `Uninitialized → Initializing → Initialized`, and from any of the first
//! three to `Disposing → Disposed`. No transition leaves `Disposed`.
//!
//! The cell is a single-writer multi-reader observable backed by
//! [`tokio::sync::watch`]; subscribers immediately observe the current state
//! on subscribe.

use tokio::sync::watch;

/// Lifecycle state of an [`Agent`](crate::Agent).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    /// Created; modules may be added and removed freely.
    Uninitialized,
    /// `initialize` is running module init hooks.
    Initializing,
    /// Ready; `run` is permitted.
    Initialized,
    /// `dispose` is tearing modules down.
    Disposing,
    /// Terminal; no operation is usable.
    Disposed,
}

impl AgentState {
    /// True in `Disposing` and `Disposed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentState::Disposing | AgentState::Disposed)
    }
}

/// Single-writer observable state with compare-and-transition semantics.
pub(crate) struct StateCell {
    tx: watch::Sender<AgentState>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = watch::channel(AgentState::Uninitialized);
        Self { tx }
    }

    /// The current state.
    pub(crate) fn get(&self) -> AgentState {
        *self.tx.borrow()
    }

    /// A receiver that sees the current state immediately and every
    /// transition afterwards.
    pub(crate) fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.tx.subscribe()
    }

    /// Atomically moves to `to` if the current state is in `from`.
    ///
    /// Returns the state that blocked the transition on failure. Observers
    /// are only notified on success.
    pub(crate) fn transition(&self, from: &[AgentState], to: AgentState) -> Result<(), AgentState> {
        let mut blocked = None;
        self.tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                blocked = Some(*state);
                false
            }
        });
        match blocked {
            None => Ok(()),
            Some(state) => Err(state),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_follow_the_graph() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), AgentState::Uninitialized);

        cell.transition(&[AgentState::Uninitialized], AgentState::Initializing)
            .unwrap();
        cell.transition(&[AgentState::Initializing], AgentState::Initialized)
            .unwrap();
        assert_eq!(cell.get(), AgentState::Initialized);

        // No way back.
        let blocked = cell
            .transition(&[AgentState::Uninitialized], AgentState::Initializing)
            .unwrap_err();
        assert_eq!(blocked, AgentState::Initialized);
    }

    #[tokio::test]
    async fn subscribers_see_current_state_immediately() {
        let cell = StateCell::new();
        cell.transition(&[AgentState::Uninitialized], AgentState::Initializing)
            .unwrap();

        let rx = cell.subscribe();
        assert_eq!(*rx.borrow(), AgentState::Initializing);
    }

    #[test]
    fn terminal_states() {
        assert!(AgentState::Disposing.is_terminal());
        assert!(AgentState::Disposed.is_terminal());
        assert!(!AgentState::Initialized.is_terminal());
    }
}
