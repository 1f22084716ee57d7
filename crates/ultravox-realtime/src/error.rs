//! Error types for the realtime session layer.

use crate::{protocol::EnvelopeKind, state::LifecycleState};
use std::any::Any;
use tokio_tungstenite::tungstenite;

/// Failures of the message codec. Both are local: a bad frame is dropped and
/// the session keeps going.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),
    #[error("Envelope kind {0} is receive-only and cannot be encoded")]
    UnencodableKind(EnvelopeKind),
}

/// Failures of the underlying connection. These are fatal to a session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Handshake failed: {0}")]
    Handshake(String),
    #[error("Connection closed by remote (code {code}): {reason}")]
    RemoteClosed { code: u16, reason: String },
    #[error("Connection is closed")]
    Closed,
    #[error(transparent)]
    WebSocket(#[from] tungstenite::Error),
}

/// Errors returned to callers of [`crate::session::Session`].
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Session is {0}; the operation requires an active session")]
    InvalidState(LifecycleState),
    #[error("Session has already been started")]
    AlreadyStarted,
    #[error("Transport failure: {0}")]
    Transport(#[from] TransportError),
}

/// Renders a panic payload caught by `catch_unwind`.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
