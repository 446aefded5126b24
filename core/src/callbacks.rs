//! Hooks fired on circuit state transitions

use crate::circuit::BreakerState;
use std::sync::Arc;

/// A state change of a circuit, handed to transition hooks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub circuit: String,
    pub from: BreakerState,
    pub to: BreakerState,
    /// Consecutive failures at the time of the transition
    pub consecutive_failures: u32,
}

pub type TransitionHook = Arc<dyn Fn(&Transition) + Send + Sync>;

/// Hooks keyed by the state a transition lands in
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<TransitionHook>,
    pub on_close: Option<TransitionHook>,
    pub on_half_open: Option<TransitionHook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the hook registered for `transition.to`, if any
    ///
    /// Hooks run after the circuit lock is released, so they may query the
    /// circuit themselves.
    pub fn fire(&self, transition: &Transition) {
        let hook = match transition.to {
            BreakerState::Open => &self.on_open,
            BreakerState::Closed => &self.on_close,
            BreakerState::HalfOpen => &self.on_half_open,
        };

        if let Some(hook) = hook {
            hook(transition);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .finish()
    }
}
