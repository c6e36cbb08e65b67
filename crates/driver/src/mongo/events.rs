//! Forwards the official driver's monitoring events to an [`EventHandler`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use mongodb::event::cmap::{
    CmapEventHandler, ConnectionCheckedInEvent, ConnectionCheckedOutEvent,
    ConnectionCheckoutFailedEvent, ConnectionCheckoutFailedReason, ConnectionCheckoutStartedEvent,
    ConnectionClosedEvent, ConnectionClosedReason as MongoClosedReason, ConnectionCreatedEvent,
    ConnectionReadyEvent, PoolClearedEvent, PoolClosedEvent, PoolCreatedEvent, PoolReadyEvent,
};
use mongodb::event::command::{
    CommandEventHandler, CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent,
};
use parking_lot::Mutex;

use crate::event::{
    CheckOutFailedReason, CmapEvent, CommandEvent, ConnectionClosedReason, EventHandler,
};

use super::convert::{from_bson, object_id_json};

/// Installed as both the command and the CMAP handler of a driver client.
pub(crate) struct EventBridge {
    handler: Option<Arc<dyn EventHandler>>,
    /// Database of each in-flight request; finish events do not carry it.
    in_flight: Mutex<HashMap<i32, String>>,
    checked_out: AtomicU32,
}

impl EventBridge {
    pub(crate) fn new(handler: Option<Arc<dyn EventHandler>>) -> Self {
        EventBridge {
            handler,
            in_flight: Mutex::new(HashMap::new()),
            checked_out: AtomicU32::new(0),
        }
    }

    pub(crate) fn checked_out(&self) -> u32 {
        self.checked_out.load(Ordering::SeqCst)
    }

    fn command(&self, event: CommandEvent) {
        if let Some(handler) = &self.handler {
            handler.handle_command_event(event);
        }
    }

    fn cmap(&self, event: CmapEvent) {
        if let Some(handler) = &self.handler {
            handler.handle_cmap_event(event);
        }
    }

    fn finished(&self, request_id: i32) -> String {
        self.in_flight.lock().remove(&request_id).unwrap_or_default()
    }
}

fn closed_reason(reason: &MongoClosedReason) -> ConnectionClosedReason {
    match reason {
        MongoClosedReason::Stale => ConnectionClosedReason::Stale,
        MongoClosedReason::Idle => ConnectionClosedReason::Idle,
        MongoClosedReason::PoolClosed => ConnectionClosedReason::PoolClosed,
        _ => ConnectionClosedReason::Error,
    }
}

fn check_out_failed_reason(reason: &ConnectionCheckoutFailedReason) -> CheckOutFailedReason {
    match reason {
        ConnectionCheckoutFailedReason::Timeout => CheckOutFailedReason::Timeout,
        _ => CheckOutFailedReason::ConnectionError,
    }
}

impl CommandEventHandler for EventBridge {
    fn handle_command_started_event(&self, event: CommandStartedEvent) {
        self.in_flight.lock().insert(event.request_id, event.db.clone());
        self.command(CommandEvent::Started {
            command_name: event.command_name,
            database_name: event.db,
            command: from_bson(event.command),
            request_id: i64::from(event.request_id),
            service_id: event.service_id.as_ref().map(object_id_json),
        });
    }

    fn handle_command_succeeded_event(&self, event: CommandSucceededEvent) {
        let database_name = self.finished(event.request_id);
        self.command(CommandEvent::Succeeded {
            command_name: event.command_name,
            database_name,
            reply: from_bson(event.reply),
            request_id: i64::from(event.request_id),
            duration_micros: event.duration.as_micros() as u64,
        });
    }

    fn handle_command_failed_event(&self, event: CommandFailedEvent) {
        let database_name = self.finished(event.request_id);
        self.command(CommandEvent::Failed {
            command_name: event.command_name,
            database_name,
            failure: event.failure.to_string(),
            request_id: i64::from(event.request_id),
            duration_micros: event.duration.as_micros() as u64,
        });
    }
}

impl CmapEventHandler for EventBridge {
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {
        self.cmap(CmapEvent::PoolCreated);
    }

    fn handle_pool_ready_event(&self, _event: PoolReadyEvent) {
        self.cmap(CmapEvent::PoolReady);
    }

    fn handle_pool_cleared_event(&self, event: PoolClearedEvent) {
        self.cmap(CmapEvent::PoolCleared {
            service_id: event.service_id.as_ref().map(object_id_json),
        });
    }

    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {
        self.cmap(CmapEvent::PoolClosed);
    }

    fn handle_connection_created_event(&self, event: ConnectionCreatedEvent) {
        self.cmap(CmapEvent::ConnectionCreated {
            connection_id: event.connection_id,
        });
    }

    fn handle_connection_ready_event(&self, event: ConnectionReadyEvent) {
        self.cmap(CmapEvent::ConnectionReady {
            connection_id: event.connection_id,
        });
    }

    fn handle_connection_closed_event(&self, event: ConnectionClosedEvent) {
        self.cmap(CmapEvent::ConnectionClosed {
            connection_id: event.connection_id,
            reason: closed_reason(&event.reason),
            service_id: None,
        });
    }

    fn handle_connection_checkout_started_event(&self, _event: ConnectionCheckoutStartedEvent) {
        self.cmap(CmapEvent::ConnectionCheckOutStarted);
    }

    fn handle_connection_checkout_failed_event(&self, event: ConnectionCheckoutFailedEvent) {
        self.cmap(CmapEvent::ConnectionCheckOutFailed {
            reason: check_out_failed_reason(&event.reason),
        });
    }

    fn handle_connection_checked_out_event(&self, event: ConnectionCheckedOutEvent) {
        self.checked_out.fetch_add(1, Ordering::SeqCst);
        self.cmap(CmapEvent::ConnectionCheckedOut {
            connection_id: event.connection_id,
        });
    }

    fn handle_connection_checked_in_event(&self, event: ConnectionCheckedInEvent) {
        // Saturating: check-ins of connections checked out before this bridge was installed.
        let _ = self
            .checked_out
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)));
        self.cmap(CmapEvent::ConnectionCheckedIn {
            connection_id: event.connection_id,
        });
    }
}
