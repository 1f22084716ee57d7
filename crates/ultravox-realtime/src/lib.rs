//! Ultravox Realtime Session Crate
//!
//! A client for a live Ultravox call: it joins the call's WebSocket, decodes
//! the agent's data messages, publishes them as events, answers client tool
//! invocations and sends user text turns. Creating the call is the job of the
//! REST client in `ultravox-core`; this crate starts from its join URL.

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
mod session_loop;
pub mod state;
pub mod tools;
pub mod transport;

pub use config::SessionConfig;
pub use error::{CodecError, SessionError, TransportError};
pub use events::{ErrorEvent, EventName, SessionEvent, StateEvent, ToolCallEvent};
pub use protocol::{ProtocolFields, TurnId};
pub use session::{CallRef, Session};
pub use state::LifecycleState;
pub use tools::{ToolDefinition, ToolHandler, ToolRegistry};
