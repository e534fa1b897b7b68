//! # Subscription handles.
//!
//! Disposing a handle removes its processor from the signaler's
//! copy-on-write array. Handles created before the module's agent is
//! assigned start **deferred**: they become real when the buffered
//! subscription drains, and disposing them early cancels the eventual
//! real subscription retroactively.
//!
//! ## Rules
//! - `dispose` is idempotent.
//! - Disposing a deferred handle before the drain wins: the subscription is
//!   removed immediately after it materializes.
//! - Handles are detached observers; dropping one without calling `dispose`
//!   leaves the processor subscribed.

use std::sync::{Arc, Mutex};

/// Internal handle state.
enum HandleState {
    /// Buffered constructor-time subscription; no processor exists yet.
    Deferred,
    /// Live subscription; the closure removes the processor when invoked.
    Active(Box<dyn FnOnce() + Send>),
    /// Disposed (or disposed-before-drain).
    Disposed,
}

/// Handle to one subscribed signal processor.
///
/// Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct SubscriptionHandle {
    state: Arc<Mutex<HandleState>>,
}

impl SubscriptionHandle {
    /// Creates a handle for a subscription that is still buffered.
    pub(crate) fn deferred() -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState::Deferred)),
        }
    }

    /// Creates a handle around a live subscription remover.
    pub(crate) fn active(remover: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HandleState::Active(remover))),
        }
    }

    /// Attaches the real remover once a deferred subscription materializes.
    ///
    /// If the handle was disposed while still deferred, the remover runs
    /// immediately so the just-created processor is unsubscribed again.
    pub(crate) fn fulfill(&self, remover: Box<dyn FnOnce() + Send>) {
        let run_now = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match &*state {
                HandleState::Deferred => {
                    *state = HandleState::Active(remover);
                    None
                }
                HandleState::Disposed => Some(remover),
                HandleState::Active(_) => None,
            }
        };
        if let Some(remover) = run_now {
            remover();
        }
    }

    /// Removes the processor from its signaler. Idempotent.
    pub fn dispose(&self) {
        let remover = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            match std::mem::replace(&mut *state, HandleState::Disposed) {
                HandleState::Active(remover) => Some(remover),
                HandleState::Deferred | HandleState::Disposed => None,
            }
        };
        if let Some(remover) = remover {
            remover();
        }
    }

    /// True once `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        matches!(
            &*self.state.lock().unwrap_or_else(|p| p.into_inner()),
            HandleState::Disposed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn dispose_runs_remover_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let handle = SubscriptionHandle::active(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));

        handle.dispose();
        handle.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(handle.is_disposed());
    }

    #[test]
    fn disposing_deferred_handle_cancels_after_fulfill() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = SubscriptionHandle::deferred();

        handle.dispose();
        assert!(handle.is_disposed());

        let c = Arc::clone(&calls);
        handle.fulfill(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fulfill_then_dispose_removes_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let handle = SubscriptionHandle::deferred();

        let c = Arc::clone(&calls);
        handle.fulfill(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        handle.dispose();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
