use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult};
use crate::options::CallOptions;
use crate::traits::Cursor;
use crate::Document;

use super::MongoCore;

/// Cursor id, `ns` and batch from a `{cursor: {...}}` reply.
pub(crate) fn parse_cursor_reply(
    reply: &Document,
    batch_field: &str,
) -> DriverResult<(i64, String, Vec<Document>)> {
    let cursor = reply
        .get("cursor")
        .and_then(Value::as_object)
        .ok_or_else(|| DriverError::invalid_argument("reply has no cursor document"))?;
    let id = match cursor.get("id") {
        Some(Value::Object(long)) => long
            .get("$numberLong")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0),
        Some(value) => value.as_i64().unwrap_or(0),
        None => 0,
    };
    let ns = cursor
        .get("ns")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let batch = cursor
        .get(batch_field)
        .and_then(Value::as_array)
        .map(|docs| docs.iter().filter_map(Value::as_object).cloned().collect())
        .unwrap_or_default();
    Ok((id, ns, batch))
}

/// A server cursor driven with `getMore` and closed with `killCursors`.
pub(crate) struct MongoCursor {
    core: Arc<MongoCore>,
    database: String,
    collection: String,
    id: i64,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
    /// Change streams report an empty `getMore` instead of waiting for more.
    change_stream: bool,
    call: CallOptions,
}

impl MongoCursor {
    pub(crate) fn from_reply(
        core: Arc<MongoCore>,
        reply: &Document,
        batch_size: Option<u32>,
        change_stream: bool,
        call: CallOptions,
    ) -> DriverResult<Self> {
        let (id, ns, first_batch) = parse_cursor_reply(reply, "firstBatch")?;
        let (database, collection) = ns
            .split_once('.')
            .map(|(db, coll)| (db.to_string(), coll.to_string()))
            .unwrap_or_else(|| (ns.clone(), String::new()));
        Ok(MongoCursor {
            core,
            database,
            collection,
            id,
            buffer: first_batch.into(),
            batch_size,
            change_stream,
            call,
        })
    }

    async fn get_more(&mut self) -> DriverResult<()> {
        let mut command = Document::new();
        command.insert("getMore".to_string(), json!({ "$numberLong": self.id.to_string() }));
        command.insert("collection".to_string(), json!(self.collection));
        if let Some(batch_size) = self.batch_size {
            command.insert("batchSize".to_string(), json!(batch_size));
        }
        let reply = self.core.command(&self.database, command, &self.call, None).await?;
        let (id, _, batch) = parse_cursor_reply(&reply, "nextBatch")?;
        self.id = id;
        self.buffer.extend(batch);
        Ok(())
    }
}

#[async_trait]
impl Cursor for MongoCursor {
    async fn next(&mut self) -> DriverResult<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.id == 0 {
                return Ok(None);
            }
            self.get_more().await?;
            if self.change_stream && self.buffer.is_empty() {
                return Ok(None);
            }
        }
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.buffer.clear();
        if self.id == 0 {
            return Ok(());
        }
        let mut command = Document::new();
        command.insert("killCursors".to_string(), json!(self.collection));
        command.insert(
            "cursors".to_string(),
            json!([{ "$numberLong": self.id.to_string() }]),
        );
        self.id = 0;
        self.core
            .command(&self.database, command, &self.call, None)
            .await
            .map(|_| ())
    }
}
