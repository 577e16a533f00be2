use crate::RuntimeFault;

/// Lifecycle of one process after its channel is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Initializing,
    Running,
    Draining,
    Terminated,
}

impl DispatchState {
    /// The only legal moves are one step forward.
    pub fn can_transition_to(self, next: DispatchState) -> bool {
        matches!(
            (self, next),
            (DispatchState::Initializing, DispatchState::Running)
                | (DispatchState::Running, DispatchState::Draining)
                | (DispatchState::Draining, DispatchState::Terminated)
        )
    }
}

#[derive(Debug)]
pub struct StateMachine {
    current: DispatchState,
    history: Vec<DispatchState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: DispatchState::Initializing,
            history: vec![DispatchState::Initializing],
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> DispatchState {
        self.current
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[DispatchState] {
        &self.history
    }

    pub fn transition(&mut self, next: DispatchState) -> Result<(), RuntimeFault> {
        if !self.current.can_transition_to(next) {
            return Err(RuntimeFault::InvalidTransition {
                from: self.current,
                to: next,
            });
        }
        tracing::debug!("dispatcher {:?} -> {next:?}", self.current);
        self.current = next;
        self.history.push(next);
        Ok(())
    }

    pub fn into_history(self) -> Vec<DispatchState> {
        self.history
    }
}
