//! Wire vocabulary and the typed envelopes exchanged over a call's WebSocket.
//!
//! Field names and kind discriminators are not hard-coded into the envelope
//! types. They live in [`ProtocolFields`], which defaults to the Ultravox v1
//! data-message names and can be overridden (for example from a JSON file) when
//! the protocol grows new spellings.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discriminator values for every envelope kind the codec understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KindNames {
    pub state: String,
    pub transcript: String,
    pub tool_invocation: String,
    pub tool_result: String,
    pub input_text: String,
    pub playback_clear_buffer: String,
    pub debug: String,
    pub error: String,
}

impl Default for KindNames {
    fn default() -> Self {
        Self {
            state: "state".to_string(),
            transcript: "transcript".to_string(),
            tool_invocation: "client_tool_invocation".to_string(),
            tool_result: "client_tool_result".to_string(),
            input_text: "input_text_message".to_string(),
            playback_clear_buffer: "playback_clear_buffer".to_string(),
            debug: "debug".to_string(),
            error: "error".to_string(),
        }
    }
}

/// The field-name table used by [`crate::codec::Codec`].
///
/// Any key missing from a deserialized table keeps its default, so an override
/// file only needs to name what changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolFields {
    /// The string field that selects the envelope kind.
    pub discriminator: String,
    pub kinds: KindNames,
    pub invocation_id: String,
    pub tool_name: String,
    pub parameters: String,
    pub result: String,
    pub error_type: String,
    pub error_message: String,
    /// `errorType` value reported when no handler is registered for a tool.
    pub unknown_tool_error: String,
    /// `errorType` value reported when a handler fails.
    pub execution_error: String,
    pub state: String,
    pub role: String,
    pub text: String,
    pub delta: String,
    pub is_final: String,
    pub medium: String,
    pub message: String,
    /// When set, outbound text messages carry their turn id under this name.
    pub turn_id: Option<String>,
}

impl Default for ProtocolFields {
    fn default() -> Self {
        Self {
            discriminator: "type".to_string(),
            kinds: KindNames::default(),
            invocation_id: "invocationId".to_string(),
            tool_name: "toolName".to_string(),
            parameters: "parameters".to_string(),
            result: "result".to_string(),
            error_type: "errorType".to_string(),
            error_message: "errorMessage".to_string(),
            unknown_tool_error: "undefined".to_string(),
            execution_error: "implementation-error".to_string(),
            state: "state".to_string(),
            role: "role".to_string(),
            text: "text".to_string(),
            delta: "delta".to_string(),
            is_final: "final".to_string(),
            medium: "medium".to_string(),
            message: "message".to_string(),
            turn_id: None,
        }
    }
}

/// Identifier attached to each user text turn sent by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TurnId(pub u64);

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn-{}", self.0)
    }
}

/// Who produced a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Role {
    Agent,
    User,
    Other(String),
}

impl Role {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "agent" => Role::Agent,
            "user" => Role::User,
            other => Role::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Agent => "agent",
            Role::User => "user",
            Role::Other(other) => other,
        }
    }
}

/// The agent-side conversation state reported by `state` messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AgentState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    /// A state this client does not know yet. Kept verbatim.
    Other(String),
}

impl AgentState {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "idle" => AgentState::Idle,
            "listening" => AgentState::Listening,
            "thinking" => AgentState::Thinking,
            "speaking" => AgentState::Speaking,
            other => AgentState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Listening => "listening",
            AgentState::Thinking => "thinking",
            AgentState::Speaking => "speaking",
            AgentState::Other(other) => other,
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transcript fragment for either side of the conversation.
///
/// `text` carries a full replacement of the transcript so far, `delta` an
/// increment to append. The server sends one or the other.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub role: Role,
    pub text: Option<String>,
    pub delta: Option<String>,
    pub is_final: bool,
    pub medium: Option<String>,
}

/// An agent request to run a client-side tool.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Correlation id; the matching result must echo it.
    pub invocation_id: String,
    pub tool_name: String,
    pub parameters: Value,
}

/// Why a tool call did not produce a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolErrorKind {
    /// No handler is registered under the requested name.
    UnknownTool,
    /// The handler ran and failed (error or panic).
    ExecutionError,
}

impl fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolErrorKind::UnknownTool => f.write_str("unknown tool"),
            ToolErrorKind::ExecutionError => f.write_str("execution error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolFailure {
    pub kind: ToolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Failure(ToolFailure),
}

/// The client's answer to a [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub invocation_id: String,
    pub outcome: ToolOutcome,
}

impl ToolCallResult {
    pub fn success(invocation_id: impl Into<String>, value: Value) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: ToolOutcome::Success(value),
        }
    }

    pub fn unknown_tool(invocation_id: impl Into<String>, tool_name: &str) -> Self {
        Self::failure(
            invocation_id,
            ToolErrorKind::UnknownTool,
            format!("Unknown tool: {tool_name}"),
        )
    }

    pub fn execution_error(invocation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::failure(invocation_id, ToolErrorKind::ExecutionError, message)
    }

    fn failure(
        invocation_id: impl Into<String>,
        kind: ToolErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            invocation_id: invocation_id.into(),
            outcome: ToolOutcome::Failure(ToolFailure {
                kind,
                message: message.into(),
            }),
        }
    }

    /// The failure kind, if this result is not a success.
    pub fn error_kind(&self) -> Option<ToolErrorKind> {
        match &self.outcome {
            ToolOutcome::Success(_) => None,
            ToolOutcome::Failure(failure) => Some(failure.kind),
        }
    }
}

/// A user text turn sent to the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTextMessage {
    pub text: String,
    pub turn_id: Option<TurnId>,
}

/// One decoded (or to-be-encoded) protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// A non-final transcript fragment.
    TextDelta(Transcript),
    /// The final transcript for an utterance.
    FinalText(Transcript),
    StateChange(AgentState),
    ToolCallRequest(ToolCallRequest),
    ToolCallResult(ToolCallResult),
    InputTextMessage(InputTextMessage),
    /// An error reported by the server.
    Error(String),
    PlaybackClearBuffer,
    Debug(String),
    /// A well-formed message with a discriminator this client does not know.
    Unknown { kind: String, payload: Value },
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::TextDelta(_) => EnvelopeKind::TextDelta,
            Envelope::FinalText(_) => EnvelopeKind::FinalText,
            Envelope::StateChange(_) => EnvelopeKind::StateChange,
            Envelope::ToolCallRequest(_) => EnvelopeKind::ToolCallRequest,
            Envelope::ToolCallResult(_) => EnvelopeKind::ToolCallResult,
            Envelope::InputTextMessage(_) => EnvelopeKind::InputTextMessage,
            Envelope::Error(_) => EnvelopeKind::Error,
            Envelope::PlaybackClearBuffer => EnvelopeKind::PlaybackClearBuffer,
            Envelope::Debug(_) => EnvelopeKind::Debug,
            Envelope::Unknown { .. } => EnvelopeKind::Unknown,
        }
    }
}

/// Fieldless mirror of [`Envelope`], used in errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    TextDelta,
    FinalText,
    StateChange,
    ToolCallRequest,
    ToolCallResult,
    InputTextMessage,
    Error,
    PlaybackClearBuffer,
    Debug,
    Unknown,
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EnvelopeKind::TextDelta => "TextDelta",
            EnvelopeKind::FinalText => "FinalText",
            EnvelopeKind::StateChange => "StateChange",
            EnvelopeKind::ToolCallRequest => "ToolCallRequest",
            EnvelopeKind::ToolCallResult => "ToolCallResult",
            EnvelopeKind::InputTextMessage => "InputTextMessage",
            EnvelopeKind::Error => "Error",
            EnvelopeKind::PlaybackClearBuffer => "PlaybackClearBuffer",
            EnvelopeKind::Debug => "Debug",
            EnvelopeKind::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}
