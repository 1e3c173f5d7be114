use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle state of one managed instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Stopped,
    Starting,
    Running,
    Stopping,
    Installing,
    Crashed,
}

#[derive(Error, Debug)]
pub enum TransitionError {
    #[error("invalid transition: {0:?} -> {1:?}")]
    InvalidTransition(State, State),
}

pub struct StateMachine {
    pub state: State,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: State::Stopped,
        }
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// `Running -> Stopped` covers a server shutting itself down cleanly
    /// (an operator typed `stop` in the game console). `Installing` is only
    /// reachable from `Stopped` and only returns there.
    pub fn can_transition(&self, to: State) -> bool {
        matches!(
            (self.state, to),
            (State::Stopped, State::Starting)
                | (State::Stopped, State::Installing)
                | (State::Starting, State::Running)
                | (State::Starting, State::Crashed)
                | (State::Starting, State::Stopped)
                | (State::Running, State::Stopping)
                | (State::Running, State::Crashed)
                | (State::Running, State::Stopped)
                | (State::Stopping, State::Stopped)
                | (State::Stopping, State::Crashed)
                | (State::Installing, State::Stopped)
                | (State::Crashed, State::Stopped)
        )
    }

    pub fn transition(&mut self, to: State) -> Result<(), TransitionError> {
        if self.can_transition(to) {
            tracing::info!("State transition: {:?} -> {:?}", self.state, to);
            self.state = to;
            Ok(())
        } else {
            Err(TransitionError::InvalidTransition(self.state, to))
        }
    }
}
