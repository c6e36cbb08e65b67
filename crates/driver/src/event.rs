//! Command and connection-pool lifecycle events.

use serde_json::Value;

use crate::Document;

/// Command monitoring events, emitted around every command a client sends.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandEvent {
    Started {
        command_name: String,
        database_name: String,
        command: Document,
        request_id: i64,
        service_id: Option<Value>,
    },
    Succeeded {
        command_name: String,
        database_name: String,
        reply: Document,
        request_id: i64,
        duration_micros: u64,
    },
    Failed {
        command_name: String,
        database_name: String,
        failure: String,
        request_id: i64,
        duration_micros: u64,
    },
}

impl CommandEvent {
    pub fn command_name(&self) -> &str {
        match self {
            CommandEvent::Started { command_name, .. }
            | CommandEvent::Succeeded { command_name, .. }
            | CommandEvent::Failed { command_name, .. } => command_name,
        }
    }

    pub fn database_name(&self) -> &str {
        match self {
            CommandEvent::Started { database_name, .. }
            | CommandEvent::Succeeded { database_name, .. }
            | CommandEvent::Failed { database_name, .. } => database_name,
        }
    }

    /// Name of the observable event kind, as written in test documents.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CommandEvent::Started { .. } => "commandStartedEvent",
            CommandEvent::Succeeded { .. } => "commandSucceededEvent",
            CommandEvent::Failed { .. } => "commandFailedEvent",
        }
    }
}

/// Why a pooled connection was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionClosedReason {
    Stale,
    Idle,
    Error,
    PoolClosed,
}

impl ConnectionClosedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionClosedReason::Stale => "stale",
            ConnectionClosedReason::Idle => "idle",
            ConnectionClosedReason::Error => "error",
            ConnectionClosedReason::PoolClosed => "poolClosed",
        }
    }
}

/// Why a connection check-out failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutFailedReason {
    PoolClosed,
    Timeout,
    ConnectionError,
}

impl CheckOutFailedReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckOutFailedReason::PoolClosed => "poolClosed",
            CheckOutFailedReason::Timeout => "timeout",
            CheckOutFailedReason::ConnectionError => "connectionError",
        }
    }
}

/// Connection pool (CMAP) events.
#[derive(Debug, Clone, PartialEq)]
pub enum CmapEvent {
    PoolCreated,
    PoolReady,
    PoolCleared { service_id: Option<Value> },
    PoolClosed,
    ConnectionCreated { connection_id: u32 },
    ConnectionReady { connection_id: u32 },
    ConnectionClosed {
        connection_id: u32,
        reason: ConnectionClosedReason,
        service_id: Option<Value>,
    },
    ConnectionCheckOutStarted,
    ConnectionCheckOutFailed { reason: CheckOutFailedReason },
    ConnectionCheckedOut { connection_id: u32 },
    ConnectionCheckedIn { connection_id: u32 },
}

impl CmapEvent {
    /// Name of the observable event kind, as written in `observeEvents`.
    pub fn kind_name(&self) -> &'static str {
        match self {
            CmapEvent::PoolCreated => "poolCreatedEvent",
            CmapEvent::PoolReady => "poolReadyEvent",
            CmapEvent::PoolCleared { .. } => "poolClearedEvent",
            CmapEvent::PoolClosed => "poolClosedEvent",
            CmapEvent::ConnectionCreated { .. } => "connectionCreatedEvent",
            CmapEvent::ConnectionReady { .. } => "connectionReadyEvent",
            CmapEvent::ConnectionClosed { .. } => "connectionClosedEvent",
            CmapEvent::ConnectionCheckOutStarted => "connectionCheckOutStartedEvent",
            CmapEvent::ConnectionCheckOutFailed { .. } => "connectionCheckOutFailedEvent",
            CmapEvent::ConnectionCheckedOut { .. } => "connectionCheckedOutEvent",
            CmapEvent::ConnectionCheckedIn { .. } => "connectionCheckedInEvent",
        }
    }
}

/// Sink for a client's events. Implementations must be cheap and non-blocking:
/// they are called inline on the client's execution path.
pub trait EventHandler: Send + Sync {
    fn handle_command_event(&self, event: CommandEvent);
    fn handle_cmap_event(&self, event: CmapEvent);
}
