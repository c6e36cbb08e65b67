//! Server-side `failCommand` fail points.
//!
//! A fail point is configured with a `configureFailPoint` command and fires
//! on the commands named in `data.failCommands`, either a fixed number of
//! times, after skipping some, or until switched `off`.

use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult};
use crate::Document;

use super::store::{code_name, server_error, BAD_VALUE};

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    AlwaysOn,
    Times(u64),
    Skip(u64),
}

/// What a firing fail point does to the command it intercepts.
#[derive(Debug, Clone)]
pub(crate) enum Injected {
    /// Drop the connection before replying.
    CloseConnection,
    /// Reply with a top-level command error.
    Error(DriverError),
    /// Apply the command, then report a write concern error.
    WriteConcern { reply: Document, error: DriverError },
}

#[derive(Debug, Clone)]
struct FailPoint {
    name: String,
    mode: Mode,
    fail_commands: Vec<String>,
    app_name: Option<String>,
    close_connection: bool,
    error_code: Option<i32>,
    error_labels: Vec<String>,
    write_concern_error: Option<Document>,
}

impl FailPoint {
    fn applies_to(&self, command_name: &str, app_name: Option<&str>) -> bool {
        if self.name != "failCommand" {
            return false;
        }
        if !self.fail_commands.iter().any(|c| c == command_name) {
            return false;
        }
        match &self.app_name {
            Some(wanted) => app_name == Some(wanted.as_str()),
            None => true,
        }
    }

    /// Whether this fail point fires for the current match; advances its counter.
    fn consume(&mut self) -> bool {
        match &mut self.mode {
            Mode::AlwaysOn => true,
            Mode::Times(n) => {
                if *n == 0 {
                    false
                } else {
                    *n -= 1;
                    true
                }
            }
            Mode::Skip(n) => {
                if *n == 0 {
                    true
                } else {
                    *n -= 1;
                    false
                }
            }
        }
    }

    fn exhausted(&self) -> bool {
        self.mode == Mode::Times(0)
    }

    fn injected(&self) -> Injected {
        if self.close_connection {
            return Injected::CloseConnection;
        }
        if let Some(wce) = &self.write_concern_error {
            let code = wce.get("code").and_then(Value::as_i64).unwrap_or(64) as i32;
            let message = wce
                .get("errmsg")
                .and_then(Value::as_str)
                .unwrap_or("write concern error injected by fail point")
                .to_string();
            let code_name = wce
                .get("codeName")
                .and_then(Value::as_str)
                .unwrap_or_else(|| code_name(code))
                .to_string();
            let labels = wce
                .get("errorLabels")
                .and_then(Value::as_array)
                .map(|l| l.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default();
            return Injected::WriteConcern {
                reply: wce.clone(),
                error: DriverError::Command {
                    code,
                    code_name,
                    message,
                    labels,
                },
            };
        }
        let code = self.error_code.unwrap_or(1);
        Injected::Error(DriverError::Command {
            code,
            code_name: code_name(code).to_string(),
            message: format!("Failing command via '{}' failpoint", self.name),
            labels: self.error_labels.clone(),
        })
    }
}

fn parse_mode(mode: &Value) -> DriverResult<Option<Mode>> {
    match mode {
        Value::String(s) if s == "alwaysOn" => Ok(Some(Mode::AlwaysOn)),
        Value::String(s) if s == "off" => Ok(None),
        Value::Object(m) => {
            if let Some(n) = m.get("times").and_then(Value::as_u64) {
                Ok(Some(Mode::Times(n)))
            } else if let Some(n) = m.get("skip").and_then(Value::as_u64) {
                Ok(Some(Mode::Skip(n)))
            } else {
                Err(server_error(BAD_VALUE, format!("unsupported fail point mode: {}", mode)))
            }
        }
        other => Err(server_error(BAD_VALUE, format!("unsupported fail point mode: {}", other))),
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|items| items.iter().filter_map(|i| i.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// The fail points currently enabled on the server.
#[derive(Debug, Default)]
pub(crate) struct FailPoints {
    active: Vec<FailPoint>,
}

impl FailPoints {
    /// Apply a `configureFailPoint` command. Returns the reply body.
    pub fn configure(&mut self, command: &Document) -> DriverResult<Document> {
        let name = command
            .get("configureFailPoint")
            .and_then(Value::as_str)
            .ok_or_else(|| server_error(BAD_VALUE, "configureFailPoint must name a fail point"))?
            .to_string();
        let mode = command
            .get("mode")
            .ok_or_else(|| server_error(BAD_VALUE, "configureFailPoint requires a mode"))?;

        self.active.retain(|fp| fp.name != name);
        let Some(mode) = parse_mode(mode)? else {
            return Ok(Document::new());
        };

        let empty = Document::new();
        let data = command.get("data").and_then(Value::as_object).unwrap_or(&empty);
        self.active.push(FailPoint {
            name,
            mode,
            fail_commands: string_list(data.get("failCommands")),
            app_name: data.get("appName").and_then(Value::as_str).map(str::to_string),
            close_connection: data
                .get("closeConnection")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            error_code: data.get("errorCode").and_then(Value::as_i64).map(|c| c as i32),
            error_labels: string_list(data.get("errorLabels")),
            write_concern_error: data.get("writeConcernError").and_then(Value::as_object).cloned(),
        });
        let mut reply = Document::new();
        reply.insert("count".to_string(), json!(0));
        Ok(reply)
    }

    /// Consult the fail points for an incoming command.
    pub fn check(&mut self, command_name: &str, app_name: Option<&str>) -> Option<Injected> {
        let position = self
            .active
            .iter_mut()
            .position(|fp| fp.applies_to(command_name, app_name) && fp.consume())?;
        let injected = self.active[position].injected();
        if self.active[position].exhausted() {
            self.active.remove(position);
        }
        Some(injected)
    }

    pub fn names(&self) -> Vec<String> {
        self.active.iter().map(|fp| fp.name.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configure(points: &mut FailPoints, v: Value) {
        points.configure(v.as_object().unwrap()).unwrap();
    }

    #[test]
    fn times_mode_fires_then_expires() {
        let mut points = FailPoints::default();
        configure(
            &mut points,
            json!({
                "configureFailPoint": "failCommand",
                "mode": { "times": 1 },
                "data": { "failCommands": ["insert"], "errorCode": 11601 }
            }),
        );
        assert!(points.check("find", None).is_none());
        match points.check("insert", None) {
            Some(Injected::Error(err)) => assert_eq!(err.code(), Some(11601)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(points.check("insert", None).is_none());
        assert!(points.names().is_empty());
    }

    #[test]
    fn off_removes_fail_point() {
        let mut points = FailPoints::default();
        configure(
            &mut points,
            json!({
                "configureFailPoint": "failCommand",
                "mode": "alwaysOn",
                "data": { "failCommands": ["ping"], "closeConnection": true }
            }),
        );
        assert!(matches!(points.check("ping", None), Some(Injected::CloseConnection)));
        assert!(matches!(points.check("ping", None), Some(Injected::CloseConnection)));
        configure(&mut points, json!({ "configureFailPoint": "failCommand", "mode": "off" }));
        assert!(points.check("ping", None).is_none());
    }

    #[test]
    fn app_name_restricts_matching_clients() {
        let mut points = FailPoints::default();
        configure(
            &mut points,
            json!({
                "configureFailPoint": "failCommand",
                "mode": { "skip": 1 },
                "data": { "failCommands": ["find"], "appName": "app", "errorLabels": ["L"] }
            }),
        );
        assert!(points.check("find", None).is_none());
        assert!(points.check("find", Some("app")).is_none());
        match points.check("find", Some("app")) {
            Some(Injected::Error(err)) => assert!(err.has_label("L")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
