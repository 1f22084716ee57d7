//! Ultravox REST Client Crate
//!
//! Single-shot HTTP calls against the Ultravox API: creating and closing the
//! calls a realtime session joins, plus read-only lookups for calls and
//! voices. Nothing here retries; callers decide what a failure means.

pub mod calls;
pub mod client;
pub mod error;
pub mod voices;

pub use calls::{CallSession, CallSessions, CreateCallParams};
pub use client::{Page, UltravoxClient};
pub use error::ApiError;
