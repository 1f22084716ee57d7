//! Events published by a session to its subscribers.

use crate::{
    protocol::{AgentState, ToolCallRequest, ToolCallResult, Transcript, TurnId},
    state::{LifecycleState, TurnState},
};
use serde_json::Value;
use std::fmt;

/// Name under which handlers subscribe.
///
/// The reserved names are typed; anything else falls back to
/// [`EventName::Other`] so callers can subscribe to names a future protocol
/// version may start emitting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventName {
    State,
    Output,
    Transcript,
    ToolCall,
    Error,
    Other(String),
}

impl EventName {
    pub fn as_str(&self) -> &str {
        match self {
            EventName::State => "state",
            EventName::Output => "output",
            EventName::Transcript => "transcript",
            EventName::ToolCall => "toolCall",
            EventName::Error => "error",
            EventName::Other(name) => name,
        }
    }
}

impl From<&str> for EventName {
    fn from(name: &str) -> Self {
        match name {
            "state" => EventName::State,
            "output" => EventName::Output,
            "transcript" => EventName::Transcript,
            "toolCall" => EventName::ToolCall,
            "error" => EventName::Error,
            other => EventName::Other(other.to_string()),
        }
    }
}

impl From<String> for EventName {
    fn from(name: String) -> Self {
        EventName::from(name.as_str())
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a `state` event.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    /// The session's connection lifecycle moved.
    Lifecycle(LifecycleState),
    /// The agent reported a conversation state.
    Agent {
        state: AgentState,
        turn: TurnState,
        /// Set when this state ends an agent turn.
        reply_complete: bool,
        /// The user turn the completed reply answered, if known.
        reply_to: Option<TurnId>,
    },
    /// Terminal failure. No further events follow.
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallEvent {
    Requested(ToolCallRequest),
    Completed(ToolCallResult),
}

/// Non-fatal problems surfaced on the `error` event.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorEvent {
    /// An inbound frame could not be decoded and was dropped.
    MalformedFrame(String),
    /// The server sent an `error` message.
    Remote(String),
    /// An outbound message was not sent.
    Outbound(String),
}

impl fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorEvent::MalformedFrame(reason) => write!(f, "malformed frame: {reason}"),
            ErrorEvent::Remote(message) => write!(f, "server error: {message}"),
            ErrorEvent::Outbound(reason) => write!(f, "message not sent: {reason}"),
        }
    }
}

/// Everything a session publishes.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(StateEvent),
    /// Accumulated agent output for the current utterance.
    Output { text: String, is_final: bool },
    Transcript(Transcript),
    ToolCall(ToolCallEvent),
    Error(ErrorEvent),
    /// A message of a kind this client does not model, published under its
    /// own discriminator.
    Other { kind: String, payload: Value },
}

impl SessionEvent {
    pub fn name(&self) -> EventName {
        match self {
            SessionEvent::State(_) => EventName::State,
            SessionEvent::Output { .. } => EventName::Output,
            SessionEvent::Transcript(_) => EventName::Transcript,
            SessionEvent::ToolCall(_) => EventName::ToolCall,
            SessionEvent::Error(_) => EventName::Error,
            SessionEvent::Other { kind, .. } => EventName::from(kind.as_str()),
        }
    }
}
