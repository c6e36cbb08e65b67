//! Capturing a client's events and matching them against expectations.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde_json::Value;
use unified_driver::{CmapEvent, CommandEvent, Document, EventHandler};
use unified_format::{
    ExpectedCmapEvent, ExpectedCommandEvent, ExpectedEventList, ExpectedEventsForClient,
    ObservableEvent,
};

use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::matching::{matches, resolve_placeholders};

/// Commands whose events are never captured.
const SENSITIVE_COMMANDS: &[&str] = &[
    "authenticate",
    "saslStart",
    "saslContinue",
    "getnonce",
    "createUser",
    "updateUser",
    "copydbnonce",
    "copydbsaslstart",
    "copydb",
];

/// Always dropped from the command stream: fail points are test plumbing.
const FAIL_POINT_COMMAND: &str = "configureFailPoint";

// ── Recording ────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Buffers {
    commands: Vec<CommandEvent>,
    cmap: Vec<CmapEvent>,
    /// `lsid` of every command started, observed or not.
    lsids: Vec<Option<Document>>,
    /// Request ids of started events that were suppressed, so their
    /// replies are suppressed too.
    suppressed: HashSet<i64>,
    commands_stopped: bool,
    cmap_stopped: bool,
}

/// Event handler installed on every client entity.
pub struct EventRecorder {
    observe: HashSet<ObservableEvent>,
    ignore: HashSet<String>,
    buffers: Mutex<Buffers>,
}

impl EventRecorder {
    pub fn new(observe: &[ObservableEvent], ignore_commands: &[String]) -> Self {
        EventRecorder {
            observe: observe.iter().copied().collect(),
            ignore: ignore_commands.iter().cloned().collect(),
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Freeze the command stream and return what was captured.
    pub fn stop_capturing_command_events(&self) -> Vec<CommandEvent> {
        let mut b = self.buffers.lock();
        b.commands_stopped = true;
        std::mem::take(&mut b.commands)
    }

    /// Freeze the pool stream and return what was captured.
    pub fn stop_capturing_cmap_events(&self) -> Vec<CmapEvent> {
        let mut b = self.buffers.lock();
        b.cmap_stopped = true;
        std::mem::take(&mut b.cmap)
    }

    /// `lsid`s of the last two commands started on this client.
    pub fn last_two_lsids(&self) -> Option<(Option<Document>, Option<Document>)> {
        let b = self.buffers.lock();
        match b.lsids.as_slice() {
            [.., a, b] => Some((a.clone(), b.clone())),
            _ => None,
        }
    }

    fn is_sensitive(command_name: &str, command: Option<&Document>) -> bool {
        if matches!(command_name.to_ascii_lowercase().as_str(), "hello" | "ismaster") {
            return command.map_or(true, |c| !c.contains_key("speculativeAuthenticate"));
        }
        SENSITIVE_COMMANDS.contains(&command_name)
    }

    fn observes_command(&self, event: &CommandEvent) -> bool {
        let kind = match event {
            CommandEvent::Started { .. } => ObservableEvent::CommandStartedEvent,
            CommandEvent::Succeeded { .. } => ObservableEvent::CommandSucceededEvent,
            CommandEvent::Failed { .. } => ObservableEvent::CommandFailedEvent,
        };
        self.observe.contains(&kind)
            && event.command_name() != FAIL_POINT_COMMAND
            && !self.ignore.contains(event.command_name())
    }
}

fn observable_kind(event: &CmapEvent) -> ObservableEvent {
    match event {
        CmapEvent::PoolCreated => ObservableEvent::PoolCreatedEvent,
        CmapEvent::PoolReady => ObservableEvent::PoolReadyEvent,
        CmapEvent::PoolCleared { .. } => ObservableEvent::PoolClearedEvent,
        CmapEvent::PoolClosed => ObservableEvent::PoolClosedEvent,
        CmapEvent::ConnectionCreated { .. } => ObservableEvent::ConnectionCreatedEvent,
        CmapEvent::ConnectionReady { .. } => ObservableEvent::ConnectionReadyEvent,
        CmapEvent::ConnectionClosed { .. } => ObservableEvent::ConnectionClosedEvent,
        CmapEvent::ConnectionCheckOutStarted => ObservableEvent::ConnectionCheckOutStartedEvent,
        CmapEvent::ConnectionCheckOutFailed { .. } => ObservableEvent::ConnectionCheckOutFailedEvent,
        CmapEvent::ConnectionCheckedOut { .. } => ObservableEvent::ConnectionCheckedOutEvent,
        CmapEvent::ConnectionCheckedIn { .. } => ObservableEvent::ConnectionCheckedInEvent,
    }
}

impl EventHandler for EventRecorder {
    fn handle_command_event(&self, event: CommandEvent) {
        let mut b = self.buffers.lock();
        if b.commands_stopped {
            return;
        }
        match &event {
            CommandEvent::Started {
                command_name,
                command,
                request_id,
                ..
            } => {
                if Self::is_sensitive(command_name, Some(command)) {
                    b.suppressed.insert(*request_id);
                    return;
                }
                let lsid = command.get("lsid").and_then(Value::as_object).cloned();
                b.lsids.push(lsid);
            }
            CommandEvent::Succeeded { request_id, .. } | CommandEvent::Failed { request_id, .. } => {
                if b.suppressed.remove(request_id) {
                    return;
                }
            }
        }
        if self.observes_command(&event) {
            b.commands.push(event);
        }
    }

    fn handle_cmap_event(&self, event: CmapEvent) {
        if !self.observe.contains(&observable_kind(&event)) {
            return;
        }
        let mut b = self.buffers.lock();
        if !b.cmap_stopped {
            b.cmap.push(event);
        }
    }
}

// ── Matching ─────────────────────────────────────────────────────────────────

/// Events captured from one client, split by stream.
#[derive(Debug, Clone, Default)]
pub struct CapturedEvents {
    pub commands: Vec<CommandEvent>,
    pub cmap: Vec<CmapEvent>,
}

/// Match one client's expectation list against what it captured.
pub fn match_events(
    expected: &ExpectedEventsForClient,
    actual: &CapturedEvents,
    entities: &EntityMap,
) -> RunnerResult<()> {
    match &expected.events {
        ExpectedEventList::Command(events) => match_sequence(
            &expected.client,
            events,
            &actual.commands,
            expected.ignore_extra_events,
            |e, a| match_command_event(e, a, entities),
        ),
        ExpectedEventList::Cmap(events) => match_sequence(
            &expected.client,
            events,
            &actual.cmap,
            expected.ignore_extra_events,
            |e, a| match_cmap_event(e, a, entities),
        ),
    }
}

/// Ordered matching. Without `ignore_extra` the lists correspond one to one;
/// with it, each expectation takes the next compatible actual event.
fn match_sequence<E, A: std::fmt::Debug>(
    client: &str,
    expected: &[E],
    actual: &[A],
    ignore_extra: bool,
    check: impl Fn(&E, &A) -> RunnerResult<Result<(), String>>,
) -> RunnerResult<()> {
    if !ignore_extra {
        if expected.len() != actual.len() {
            return Err(RunnerError::mismatch(format!(
                "client '{}': expected {} events, got {}: {:?}",
                client,
                expected.len(),
                actual.len(),
                actual
            )));
        }
        for (i, (e, a)) in expected.iter().zip(actual).enumerate() {
            check(e, a)?.map_err(|msg| {
                RunnerError::mismatch(format!("client '{}' event {}: {}", client, i, msg))
            })?;
        }
        return Ok(());
    }

    let mut next = 0;
    for (i, e) in expected.iter().enumerate() {
        let mut last_failure = None;
        loop {
            let Some(a) = actual.get(next) else {
                return Err(RunnerError::mismatch(format!(
                    "client '{}' event {}: no matching event found{}",
                    client,
                    i,
                    last_failure
                        .map(|m| format!(" (last mismatch: {})", m))
                        .unwrap_or_default()
                )));
            };
            next += 1;
            match check(e, a)? {
                Ok(()) => break,
                Err(msg) => last_failure = Some(msg),
            }
        }
    }
    Ok(())
}

fn match_document(
    field: &str,
    expected: &Document,
    actual: &Document,
    entities: &EntityMap,
) -> RunnerResult<Result<(), String>> {
    let expected = resolve_placeholders(&Value::Object(expected.clone()), entities)?;
    let actual = Value::Object(actual.clone());
    Ok(matches(&expected, Some(&actual)).map_err(|msg| format!("{}: {}", field, msg)))
}

fn match_name(field: &str, expected: Option<&String>, actual: &str) -> Result<(), String> {
    match expected {
        Some(name) if name != actual => {
            Err(format!("expected {} '{}', got '{}'", field, name, actual))
        }
        _ => Ok(()),
    }
}

fn match_command_event(
    expected: &ExpectedCommandEvent,
    actual: &CommandEvent,
    entities: &EntityMap,
) -> RunnerResult<Result<(), String>> {
    match (expected, actual) {
        (
            ExpectedCommandEvent::CommandStartedEvent(e),
            CommandEvent::Started {
                command_name,
                database_name,
                command,
                ..
            },
        ) => {
            if let Err(msg) = match_name("commandName", e.command_name.as_ref(), command_name)
                .and_then(|_| match_name("databaseName", e.database_name.as_ref(), database_name))
            {
                return Ok(Err(msg));
            }
            match &e.command {
                Some(expected) => match_document("command", expected, command, entities),
                None => Ok(Ok(())),
            }
        }
        (
            ExpectedCommandEvent::CommandSucceededEvent(e),
            CommandEvent::Succeeded {
                command_name, reply, ..
            },
        ) => {
            if let Err(msg) = match_name("commandName", e.command_name.as_ref(), command_name) {
                return Ok(Err(msg));
            }
            match &e.reply {
                Some(expected) => match_document("reply", expected, reply, entities),
                None => Ok(Ok(())),
            }
        }
        (ExpectedCommandEvent::CommandFailedEvent(e), CommandEvent::Failed { command_name, .. }) => {
            Ok(match_name("commandName", e.command_name.as_ref(), command_name))
        }
        (expected, actual) => Ok(Err(format!(
            "expected {}, got {} for '{}'",
            expected_command_kind(expected),
            actual.kind_name(),
            actual.command_name()
        ))),
    }
}

fn expected_command_kind(event: &ExpectedCommandEvent) -> &'static str {
    match event {
        ExpectedCommandEvent::CommandStartedEvent(_) => "commandStartedEvent",
        ExpectedCommandEvent::CommandSucceededEvent(_) => "commandSucceededEvent",
        ExpectedCommandEvent::CommandFailedEvent(_) => "commandFailedEvent",
    }
}

fn expected_cmap_kind(event: &ExpectedCmapEvent) -> ObservableEvent {
    match event {
        ExpectedCmapEvent::PoolCreatedEvent(_) => ObservableEvent::PoolCreatedEvent,
        ExpectedCmapEvent::PoolReadyEvent(_) => ObservableEvent::PoolReadyEvent,
        ExpectedCmapEvent::PoolClearedEvent(_) => ObservableEvent::PoolClearedEvent,
        ExpectedCmapEvent::PoolClosedEvent(_) => ObservableEvent::PoolClosedEvent,
        ExpectedCmapEvent::ConnectionCreatedEvent(_) => ObservableEvent::ConnectionCreatedEvent,
        ExpectedCmapEvent::ConnectionReadyEvent(_) => ObservableEvent::ConnectionReadyEvent,
        ExpectedCmapEvent::ConnectionClosedEvent(_) => ObservableEvent::ConnectionClosedEvent,
        ExpectedCmapEvent::ConnectionCheckOutStartedEvent(_) => {
            ObservableEvent::ConnectionCheckOutStartedEvent
        }
        ExpectedCmapEvent::ConnectionCheckOutFailedEvent(_) => {
            ObservableEvent::ConnectionCheckOutFailedEvent
        }
        ExpectedCmapEvent::ConnectionCheckedOutEvent(_) => ObservableEvent::ConnectionCheckedOutEvent,
        ExpectedCmapEvent::ConnectionCheckedInEvent(_) => ObservableEvent::ConnectionCheckedInEvent,
    }
}

fn match_has_service_id(expected: Option<bool>, actual: &Option<Value>) -> Result<(), String> {
    match expected {
        Some(want) if want != actual.is_some() => Err(format!(
            "expected hasServiceId {}, got serviceId {:?}",
            want, actual
        )),
        _ => Ok(()),
    }
}

fn match_cmap_event(
    expected: &ExpectedCmapEvent,
    actual: &CmapEvent,
    entities: &EntityMap,
) -> RunnerResult<Result<(), String>> {
    if expected_cmap_kind(expected) != observable_kind(actual) {
        return Ok(Err(format!(
            "expected {:?}, got {}",
            expected_cmap_kind(expected),
            actual.kind_name()
        )));
    }
    let result = match (expected, actual) {
        (ExpectedCmapEvent::PoolClearedEvent(e), CmapEvent::PoolCleared { service_id }) => {
            let expected_id = match &e.service_id {
                Some(v) => Some(resolve_placeholders(v, entities)?),
                None => None,
            };
            match_has_service_id(e.has_service_id, service_id).and_then(|_| match &expected_id {
                Some(expected) => matches(expected, service_id.as_ref())
                    .map_err(|msg| format!("serviceId: {}", msg)),
                None => Ok(()),
            })
        }
        (
            ExpectedCmapEvent::ConnectionClosedEvent(e),
            CmapEvent::ConnectionClosed {
                reason, service_id, ..
            },
        ) => match_name("reason", e.reason.as_ref(), reason.as_str())
            .and_then(|_| match_has_service_id(e.has_service_id, service_id)),
        (
            ExpectedCmapEvent::ConnectionCheckOutFailedEvent(e),
            CmapEvent::ConnectionCheckOutFailed { reason },
        ) => match_name("reason", e.reason.as_ref(), reason.as_str()),
        _ => Ok(()),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unified_driver::ConnectionClosedReason;

    fn started(name: &str, command: Value, request_id: i64) -> CommandEvent {
        CommandEvent::Started {
            command_name: name.to_string(),
            database_name: "db".to_string(),
            command: command.as_object().cloned().unwrap(),
            request_id,
            service_id: None,
        }
    }

    fn succeeded(name: &str, request_id: i64) -> CommandEvent {
        CommandEvent::Succeeded {
            command_name: name.to_string(),
            database_name: "db".to_string(),
            reply: json!({ "ok": 1 }).as_object().cloned().unwrap(),
            request_id,
            duration_micros: 0,
        }
    }

    fn expected(value: Value) -> ExpectedEventsForClient {
        serde_json::from_value(value).unwrap()
    }

    fn captured(commands: Vec<CommandEvent>) -> CapturedEvents {
        CapturedEvents {
            commands,
            cmap: Vec::new(),
        }
    }

    fn all_command_events() -> Vec<ObservableEvent> {
        vec![
            ObservableEvent::CommandStartedEvent,
            ObservableEvent::CommandSucceededEvent,
            ObservableEvent::CommandFailedEvent,
        ]
    }

    #[test]
    fn recorder_honours_observe_and_ignore_lists() {
        let recorder = EventRecorder::new(
            &[ObservableEvent::CommandStartedEvent],
            &["find".to_string()],
        );
        recorder.handle_command_event(started("insert", json!({ "insert": "c" }), 1));
        recorder.handle_command_event(succeeded("insert", 1));
        recorder.handle_command_event(started("find", json!({ "find": "c" }), 2));
        recorder.handle_command_event(started("configureFailPoint", json!({}), 3));

        let events = recorder.stop_capturing_command_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command_name(), "insert");
    }

    #[test]
    fn recorder_drops_sensitive_commands_and_their_replies() {
        let recorder = EventRecorder::new(&all_command_events(), &[]);
        recorder.handle_command_event(started("hello", json!({ "hello": 1 }), 1));
        recorder.handle_command_event(succeeded("hello", 1));
        recorder.handle_command_event(started(
            "hello",
            json!({ "hello": 1, "speculativeAuthenticate": {} }),
            2,
        ));
        recorder.handle_command_event(started("saslStart", json!({}), 3));

        let events = recorder.stop_capturing_command_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].command_name(), "hello");
    }

    #[test]
    fn recorder_keeps_lsids_of_unobserved_commands() {
        let recorder = EventRecorder::new(&[], &[]);
        recorder.handle_command_event(started("find", json!({ "lsid": { "id": 1 } }), 1));
        recorder.handle_command_event(started("find", json!({ "lsid": { "id": 2 } }), 2));
        let (a, b) = recorder.last_two_lsids().unwrap();
        assert_ne!(a, b);
        assert!(recorder.stop_capturing_command_events().is_empty());
    }

    #[test]
    fn recorder_discards_events_after_stop() {
        let recorder = EventRecorder::new(&[ObservableEvent::ConnectionCheckedOutEvent], &[]);
        recorder.handle_cmap_event(CmapEvent::ConnectionCheckedOut { connection_id: 1 });
        recorder.handle_cmap_event(CmapEvent::ConnectionCheckedIn { connection_id: 1 });
        assert_eq!(recorder.stop_capturing_cmap_events().len(), 1);
        recorder.handle_cmap_event(CmapEvent::ConnectionCheckedOut { connection_id: 2 });
        assert!(recorder.stop_capturing_cmap_events().is_empty());
    }

    #[test]
    fn extra_events_fail_unless_ignored() {
        let entities = EntityMap::default();
        let actual = captured(vec![
            started("insert", json!({ "insert": "c" }), 1),
            started("getMore", json!({ "getMore": 1 }), 2),
            started("find", json!({ "find": "c" }), 3),
        ]);
        let mut exp = json!({
            "client": "client0",
            "events": [
                { "commandStartedEvent": { "commandName": "insert" } },
                { "commandStartedEvent": { "command": { "find": "c" } } }
            ]
        });
        let err = match_events(&expected(exp.clone()), &actual, &entities).unwrap_err();
        assert!(err.to_string().contains("expected 2 events, got 3"), "{}", err);

        exp["ignoreExtraEvents"] = json!(true);
        match_events(&expected(exp), &actual, &entities).unwrap();
    }

    #[test]
    fn ignored_extras_still_respect_order() {
        let entities = EntityMap::default();
        let actual = captured(vec![
            started("find", json!({}), 1),
            started("insert", json!({}), 2),
        ]);
        let exp = expected(json!({
            "client": "client0",
            "ignoreExtraEvents": true,
            "events": [
                { "commandStartedEvent": { "commandName": "insert" } },
                { "commandStartedEvent": { "commandName": "find" } }
            ]
        }));
        let err = match_events(&exp, &actual, &entities).unwrap_err();
        assert!(err.to_string().contains("event 1"), "{}", err);
    }

    #[test]
    fn mismatch_names_client_and_index() {
        let entities = EntityMap::default();
        let actual = captured(vec![started("insert", json!({}), 1), succeeded("insert", 1)]);
        let exp = expected(json!({
            "client": "client0",
            "events": [
                { "commandStartedEvent": { "commandName": "insert" } },
                { "commandFailedEvent": { "commandName": "insert" } }
            ]
        }));
        let err = match_events(&exp, &actual, &entities).unwrap_err().to_string();
        assert!(err.contains("client 'client0' event 1"), "{}", err);
        assert!(err.contains("commandFailedEvent"), "{}", err);
    }

    #[test]
    fn cmap_fields_are_checked() {
        let entities = EntityMap::default();
        let actual = CapturedEvents {
            commands: Vec::new(),
            cmap: vec![CmapEvent::ConnectionClosed {
                connection_id: 1,
                reason: ConnectionClosedReason::Error,
                service_id: None,
            }],
        };
        let ok = expected(json!({
            "client": "client0",
            "eventType": "cmap",
            "events": [ { "connectionClosedEvent": { "reason": "error", "hasServiceId": false } } ]
        }));
        match_events(&ok, &actual, &entities).unwrap();

        let bad = expected(json!({
            "client": "client0",
            "eventType": "cmap",
            "events": [ { "connectionClosedEvent": { "reason": "stale" } } ]
        }));
        assert!(match_events(&bad, &actual, &entities).is_err());
    }
}
