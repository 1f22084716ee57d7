//! Session lifecycle and turn tracking.

use crate::{
    error::SessionError,
    protocol::{AgentState, TurnId},
};
use std::fmt;

/// Connection lifecycle of a session.
///
/// `Connecting → Active → Ending → Closed`, with `Failed` reachable from any
/// state except `Closed`. `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Connecting,
    Active,
    Ending,
    Closed,
    Failed,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleState::Closed | LifecycleState::Failed)
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Ending)
                | (Ending, Closed)
                | (Connecting | Active | Ending, Failed)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Connecting => "connecting",
            LifecycleState::Active => "active",
            LifecycleState::Ending => "ending",
            LifecycleState::Closed => "closed",
            LifecycleState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Who may currently produce content while the session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TurnState {
    Idle,
    AgentTurn,
    UserTurnOpen,
}

impl TurnState {
    /// Maps an agent-reported state onto a turn. Unknown states map to `None`
    /// and leave the current turn untouched.
    pub fn from_agent_state(state: &AgentState) -> Option<TurnState> {
        match state {
            AgentState::Idle => Some(TurnState::Idle),
            AgentState::Listening => Some(TurnState::UserTurnOpen),
            AgentState::Thinking | AgentState::Speaking => Some(TurnState::AgentTurn),
            AgentState::Other(_) => None,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Invalid lifecycle transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Result of applying an agent state to the turn tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnUpdate {
    pub turn: TurnState,
    pub reply_complete: bool,
    pub reply_to: Option<TurnId>,
}

/// Fails with [`SessionError::InvalidState`] unless `state` is `Active`.
pub fn require_active(state: LifecycleState) -> Result<(), SessionError> {
    if state == LifecycleState::Active {
        Ok(())
    } else {
        Err(SessionError::InvalidState(state))
    }
}

/// The lifecycle plus turn sub-state of one session.
#[derive(Debug, Clone)]
pub struct StateMachine {
    lifecycle: LifecycleState,
    turn: TurnState,
    awaiting_reply: Option<TurnId>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleState::Connecting,
            turn: TurnState::Idle,
            awaiting_reply: None,
        }
    }
}

impl StateMachine {
    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn turn(&self) -> TurnState {
        self.turn
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: LifecycleState) -> Result<LifecycleState, InvalidTransition> {
        let from = self.lifecycle;
        if !from.can_transition_to(next) {
            return Err(InvalidTransition { from, to: next });
        }
        self.lifecycle = next;
        if next == LifecycleState::Active {
            self.turn = TurnState::Idle;
            self.awaiting_reply = None;
        }
        Ok(from)
    }

    pub fn ensure_active(&self) -> Result<(), SessionError> {
        require_active(self.lifecycle)
    }

    /// Records that the user sent `turn` and is waiting for the agent.
    pub fn user_turn_sent(&mut self, turn: TurnId) {
        self.awaiting_reply = Some(turn);
    }

    /// Applies an agent-reported state.
    ///
    /// Any state is accepted, including ones that skip an expected step; a
    /// reply is complete whenever the agent leaves its turn.
    pub fn apply_agent_state(&mut self, state: &AgentState) -> TurnUpdate {
        let previous = self.turn;
        if let Some(next) = TurnState::from_agent_state(state) {
            self.turn = next;
        }
        let reply_complete =
            previous == TurnState::AgentTurn && self.turn != TurnState::AgentTurn;
        let reply_to = if reply_complete {
            self.awaiting_reply.take()
        } else {
            None
        };
        TurnUpdate {
            turn: self.turn,
            reply_complete,
            reply_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    const ALL: [LifecycleState; 5] = [Connecting, Active, Ending, Closed, Failed];

    #[test]
    fn test_transition_table() {
        let allowed = [
            (Connecting, Active),
            (Connecting, Closed),
            (Connecting, Failed),
            (Active, Ending),
            (Active, Failed),
            (Ending, Closed),
            (Ending, Failed),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        let mut machine = StateMachine::default();
        machine.transition(Active).unwrap();
        machine.transition(Failed).unwrap();
        for next in ALL {
            assert!(machine.transition(next).is_err());
        }
        assert_eq!(machine.lifecycle(), Failed);

        let mut machine = StateMachine::default();
        machine.transition(Active).unwrap();
        machine.transition(Ending).unwrap();
        machine.transition(Closed).unwrap();
        assert_eq!(
            machine.transition(Failed),
            Err(InvalidTransition {
                from: Closed,
                to: Failed
            })
        );
    }

    #[test]
    fn test_require_active_only_accepts_active() {
        for state in ALL {
            let outcome = require_active(state);
            if state == Active {
                assert!(outcome.is_ok());
            } else {
                assert!(matches!(outcome, Err(SessionError::InvalidState(s)) if s == state));
            }
        }
    }

    #[test]
    fn test_agent_states_drive_turns() {
        let mut machine = StateMachine::default();
        machine.transition(Active).unwrap();
        assert_eq!(machine.turn(), TurnState::Idle);

        let update = machine.apply_agent_state(&AgentState::Listening);
        assert_eq!(update.turn, TurnState::UserTurnOpen);
        assert!(!update.reply_complete);

        machine.user_turn_sent(TurnId(1));
        assert_eq!(
            machine.apply_agent_state(&AgentState::Thinking).turn,
            TurnState::AgentTurn
        );
        let update = machine.apply_agent_state(&AgentState::Speaking);
        assert_eq!(update.turn, TurnState::AgentTurn);
        assert!(!update.reply_complete);

        let update = machine.apply_agent_state(&AgentState::Listening);
        assert_eq!(
            update,
            TurnUpdate {
                turn: TurnState::UserTurnOpen,
                reply_complete: true,
                reply_to: Some(TurnId(1)),
            }
        );
    }

    #[test]
    fn test_unknown_agent_state_keeps_turn() {
        let mut machine = StateMachine::default();
        machine.transition(Active).unwrap();
        machine.apply_agent_state(&AgentState::Speaking);

        let update = machine.apply_agent_state(&AgentState::Other("dozing".to_string()));
        assert_eq!(update.turn, TurnState::AgentTurn);
        assert!(!update.reply_complete);

        // Skipping straight from speaking to idle still completes the reply.
        let update = machine.apply_agent_state(&AgentState::Idle);
        assert!(update.reply_complete);
        assert_eq!(update.reply_to, None);
    }
}
