//! Agent state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::handle::AgentHandle;
use crate::agent::signal::WorkItem;

/// State of a launched agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Start issued, no signal seen yet.
    Starting,
    /// Agent reported it is up.
    Ready,
    /// Agent reported an error and is expected to exit.
    Errored,
    /// Agent is gone.
    Exited,
}

impl AgentState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: AgentState) -> bool {
        use AgentState::*;

        matches!(
            (self, target),
            (Starting, Ready) | (Starting, Errored) | (Starting, Exited) |
            (Ready, Errored) | (Ready, Exited) |
            (Errored, Exited)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Errored => "errored",
            Self::Exited => "exited",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// One launched agent. Dropped by the scheduler once it has exited.
#[derive(Debug)]
pub struct AgentRecord {
    pub index: WorkItem,
    pub state: AgentState,
    pub launched_at: DateTime<Utc>,
    pub transitions: Vec<StateTransition>,
    /// `None` when the start itself failed.
    pub handle: Option<Box<dyn AgentHandle>>,
}

impl AgentRecord {
    pub fn new(index: WorkItem, handle: Option<Box<dyn AgentHandle>>) -> Self {
        Self {
            index,
            state: AgentState::Starting,
            launched_at: Utc::now(),
            transitions: Vec::new(),
            handle,
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: AgentState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition agent #{} from {} to {}",
                self.index, self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });
        self.state = new_state;
        Ok(())
    }

    /// Time since launch.
    pub fn uptime(&self) -> chrono::Duration {
        Utc::now().signed_duration_since(self.launched_at)
    }
}
