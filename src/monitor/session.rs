use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::types::MarketData;

/// Lifecycle of one (wallet, token) monitoring session.
///
/// `Idle` means "no session". Terminal states are final: once entered, no
/// further transitions happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Completed,
    TimedOut,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::TimedOut | SessionState::Cancelled
        )
    }
}

/// Out-of-band events delivered to a running sampler.
#[derive(Debug)]
pub enum SessionSignal {
    Sell {
        market: MarketData,
        tx_signature: String,
        sampled_at: i64,
    },
    Shutdown,
}

/// Shared handle to a running session: its signal channel and observable
/// state.
pub(crate) struct SessionHandle {
    pub signal_tx: mpsc::UnboundedSender<SessionSignal>,
    pub state: std::sync::Arc<Mutex<SessionState>>,
}

impl SessionHandle {
    pub fn current_state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}

/// Move to a terminal state. Returns false (and changes nothing) if the
/// session is already terminal, which makes duplicate terminal signals
/// no-ops.
pub(crate) fn transition_terminal(
    state: &std::sync::Arc<Mutex<SessionState>>,
    next: SessionState,
) -> bool {
    debug_assert!(next.is_terminal());
    let mut current = state.lock().unwrap();
    if current.is_terminal() {
        return false;
    }
    *current = next;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn terminal_states_are_final() {
        let state = Arc::new(Mutex::new(SessionState::Active));

        assert!(transition_terminal(&state, SessionState::Completed));
        assert_eq!(*state.lock().unwrap(), SessionState::Completed);

        // Re-entering a terminal state is a no-op.
        assert!(!transition_terminal(&state, SessionState::TimedOut));
        assert_eq!(*state.lock().unwrap(), SessionState::Completed);

        assert!(!transition_terminal(&state, SessionState::Cancelled));
        assert_eq!(*state.lock().unwrap(), SessionState::Completed);
    }
}
