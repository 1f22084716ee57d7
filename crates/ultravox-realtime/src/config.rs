//! Per-session settings.

use crate::{dispatcher::DEFAULT_QUEUE_CAPACITY, protocol::ProtocolFields};
use std::time::Duration;

/// How long `stop` waits for the transport to close.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long `start` waits for the WebSocket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Wire field and kind names.
    pub fields: ProtocolFields,
    pub shutdown_grace: Duration,
    pub handshake_timeout: Duration,
    /// Publishes a handler may queue while an event is being dispatched.
    pub dispatch_queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fields: ProtocolFields::default(),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            dispatch_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl SessionConfig {
    pub fn with_fields(mut self, fields: ProtocolFields) -> Self {
        self.fields = fields;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }
}
