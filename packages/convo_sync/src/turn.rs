//! Turn tracking.
//!
//! A turn starts when the human speaks and ends when the orchestrator
//! reports completion. While a turn is active new input is refused.
//! There is no timeout: a backend that never completes leaves the turn
//! active until the conversation is reopened.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{COMPLETION_MARKER, HUMAN_ALIAS, Message, ORCHESTRATOR_ALIAS};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TurnState {
    #[default]
    Idle,
    Active,
}

impl TurnState {
    pub fn is_active(&self) -> bool {
        matches!(self, TurnState::Active)
    }
}

/// Named transition triggers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnTransition {
    /// Idle -> Active on a message from the human participant.
    HumanSpoke,
    /// Active -> Idle on an orchestrator message carrying the marker.
    OrchestratorCompleted,
}

/// Who opens and closes a turn.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRules {
    pub human_alias: String,
    pub orchestrator_alias: String,
    pub completion_marker: String,
}

impl Default for TurnRules {
    fn default() -> Self {
        Self {
            human_alias: HUMAN_ALIAS.to_string(),
            orchestrator_alias: ORCHESTRATOR_ALIAS.to_string(),
            completion_marker: COMPLETION_MARKER.to_string(),
        }
    }
}

impl TurnRules {
    fn trigger(&self, msg: &Message) -> Option<TurnTransition> {
        if msg.sender_alias == self.human_alias {
            Some(TurnTransition::HumanSpoke)
        } else if msg.sender_alias == self.orchestrator_alias
            && msg.content.contains(&self.completion_marker)
        {
            Some(TurnTransition::OrchestratorCompleted)
        } else {
            None
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct TurnStateMachine {
    state: TurnState,
    rules: TurnRules,
}

impl TurnStateMachine {
    pub fn new(rules: TurnRules) -> Self {
        Self {
            state: TurnState::Idle,
            rules,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn can_submit(&self) -> bool {
        !self.state.is_active()
    }

    /// Feed a live message. Returns the transition taken, if any.
    pub fn observe(&mut self, msg: &Message) -> Option<TurnTransition> {
        let transition = match (self.state, self.rules.trigger(msg)?) {
            (TurnState::Idle, t @ TurnTransition::HumanSpoke) => {
                self.state = TurnState::Active;
                t
            }
            (TurnState::Active, t @ TurnTransition::OrchestratorCompleted) => {
                self.state = TurnState::Idle;
                t
            }
            _ => return None,
        };
        debug!(?transition, state = ?self.state, message = %msg.id, "turn transition");
        Some(transition)
    }

    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
    }
}
