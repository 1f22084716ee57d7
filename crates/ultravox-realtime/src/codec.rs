//! Converts between text frames and typed [`Envelope`]s.

use crate::{
    error::CodecError,
    protocol::{
        AgentState, Envelope, InputTextMessage, ProtocolFields, Role, ToolCallRequest,
        ToolCallResult, ToolErrorKind, ToolFailure, ToolOutcome, Transcript, TurnId,
    },
};
use serde_json::{Map, Value};

/// A table-driven JSON codec for the call's data messages.
///
/// Encoding is deterministic: the same envelope always produces the same
/// bytes, which keeps recorded fixtures and replays stable.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    fields: ProtocolFields,
}

impl Codec {
    pub fn new(fields: ProtocolFields) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &ProtocolFields {
        &self.fields
    }

    /// Decodes one text frame.
    ///
    /// Frames that are not JSON objects, lack the discriminator, or lack a
    /// field required by their kind are rejected with
    /// [`CodecError::MalformedFrame`]. Well-formed frames of an unknown kind
    /// become [`Envelope::Unknown`].
    pub fn decode(&self, frame: &str) -> Result<Envelope, CodecError> {
        let value: Value =
            serde_json::from_str(frame).map_err(|e| CodecError::MalformedFrame(e.to_string()))?;
        let Value::Object(object) = value else {
            return Err(malformed("frame is not a JSON object"));
        };

        let f = &self.fields;
        let kind = object
            .get(&f.discriminator)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed(format!("missing string field `{}`", f.discriminator)))?
            .to_string();
        let k = &f.kinds;

        let envelope = if kind == k.state {
            let state = required_str(&object, &f.state, &kind)?;
            Envelope::StateChange(AgentState::from_wire(state))
        } else if kind == k.transcript {
            let transcript = Transcript {
                role: Role::from_wire(optional_str(&object, &f.role).unwrap_or_default()),
                text: optional_str(&object, &f.text).map(str::to_string),
                delta: optional_str(&object, &f.delta).map(str::to_string),
                is_final: object
                    .get(&f.is_final)
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                medium: optional_str(&object, &f.medium).map(str::to_string),
            };
            if transcript.is_final {
                Envelope::FinalText(transcript)
            } else {
                Envelope::TextDelta(transcript)
            }
        } else if kind == k.tool_invocation {
            Envelope::ToolCallRequest(ToolCallRequest {
                invocation_id: required_str(&object, &f.invocation_id, &kind)?.to_string(),
                tool_name: required_str(&object, &f.tool_name, &kind)?.to_string(),
                parameters: object
                    .get(&f.parameters)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Map::new())),
            })
        } else if kind == k.tool_result {
            Envelope::ToolCallResult(self.decode_tool_result(&object, &kind)?)
        } else if kind == k.input_text {
            let turn_id = f
                .turn_id
                .as_ref()
                .and_then(|field| object.get(field))
                .and_then(Value::as_u64)
                .map(TurnId);
            Envelope::InputTextMessage(InputTextMessage {
                text: required_str(&object, &f.text, &kind)?.to_string(),
                turn_id,
            })
        } else if kind == k.error {
            Envelope::Error(
                optional_str(&object, &f.message)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else if kind == k.debug {
            Envelope::Debug(
                optional_str(&object, &f.message)
                    .unwrap_or_default()
                    .to_string(),
            )
        } else if kind == k.playback_clear_buffer {
            Envelope::PlaybackClearBuffer
        } else {
            Envelope::Unknown {
                kind,
                payload: Value::Object(object),
            }
        };
        Ok(envelope)
    }

    fn decode_tool_result(
        &self,
        object: &Map<String, Value>,
        kind: &str,
    ) -> Result<ToolCallResult, CodecError> {
        let f = &self.fields;
        let invocation_id = required_str(object, &f.invocation_id, kind)?.to_string();
        let outcome = match optional_str(object, &f.error_type) {
            Some(error_type) => ToolOutcome::Failure(ToolFailure {
                kind: if error_type == f.unknown_tool_error {
                    ToolErrorKind::UnknownTool
                } else {
                    ToolErrorKind::ExecutionError
                },
                message: optional_str(object, &f.error_message)
                    .unwrap_or_default()
                    .to_string(),
            }),
            // Results travel as JSON-encoded strings. Anything that does not
            // parse is kept as a plain string value.
            None => ToolOutcome::Success(match optional_str(object, &f.result) {
                Some(raw) => {
                    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
                }
                None => Value::Null,
            }),
        };
        Ok(ToolCallResult {
            invocation_id,
            outcome,
        })
    }

    /// Encodes a locally constructible envelope into a text frame.
    ///
    /// Only [`Envelope::InputTextMessage`] and [`Envelope::ToolCallResult`] can
    /// be sent; every other kind fails with [`CodecError::UnencodableKind`].
    pub fn encode(&self, envelope: &Envelope) -> Result<String, CodecError> {
        let f = &self.fields;
        let mut object = Map::new();

        match envelope {
            Envelope::InputTextMessage(message) => {
                object.insert(f.discriminator.clone(), f.kinds.input_text.clone().into());
                object.insert(f.text.clone(), message.text.clone().into());
                if let (Some(field), Some(turn)) = (&f.turn_id, message.turn_id) {
                    object.insert(field.clone(), turn.0.into());
                }
            }
            Envelope::ToolCallResult(result) => {
                object.insert(f.discriminator.clone(), f.kinds.tool_result.clone().into());
                object.insert(f.invocation_id.clone(), result.invocation_id.clone().into());
                match &result.outcome {
                    ToolOutcome::Success(value) => {
                        object.insert(f.result.clone(), Value::String(value.to_string()));
                    }
                    ToolOutcome::Failure(failure) => {
                        let error_type = match failure.kind {
                            ToolErrorKind::UnknownTool => &f.unknown_tool_error,
                            ToolErrorKind::ExecutionError => &f.execution_error,
                        };
                        object.insert(f.error_type.clone(), error_type.clone().into());
                        object.insert(f.error_message.clone(), failure.message.clone().into());
                    }
                }
            }
            other => return Err(CodecError::UnencodableKind(other.kind())),
        }

        Ok(Value::Object(object).to_string())
    }
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedFrame(reason.into())
}

fn optional_str<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a str> {
    object.get(field).and_then(Value::as_str)
}

fn required_str<'a>(
    object: &'a Map<String, Value>,
    field: &str,
    kind: &str,
) -> Result<&'a str, CodecError> {
    optional_str(object, field)
        .ok_or_else(|| malformed(format!("`{kind}` message is missing string field `{field}`")))
}
