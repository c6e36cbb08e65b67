use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult};
use crate::options::CallOptions;
use crate::traits::{Cursor, WatchTarget};
use crate::{Document, Namespace};

use super::client::ClientCore;
use super::store::{matches_filter, values_equal, ChangeRecord};
use super::ServerState;

/// `{cursor: {id, ns, <batch_field>: docs}}`
pub(crate) fn cursor_reply(ns: &str, id: i64, batch_field: &str, docs: &[Document]) -> Document {
    let batch: Vec<Value> = docs.iter().cloned().map(Value::Object).collect();
    let mut cursor = Document::new();
    cursor.insert("id".to_string(), json!(id));
    cursor.insert("ns".to_string(), json!(ns));
    cursor.insert(batch_field.to_string(), Value::Array(batch));
    let mut reply = Document::new();
    reply.insert("cursor".to_string(), Value::Object(cursor));
    reply
}

/// Split a result set into the first batch and what later `getMore`s return.
pub(crate) fn split_first_batch(
    docs: Vec<Document>,
    batch_size: Option<u32>,
) -> (Vec<Document>, VecDeque<Document>) {
    match batch_size.filter(|b| *b > 0) {
        Some(size) if docs.len() > size as usize => {
            let mut rest: VecDeque<Document> = docs.into();
            let first = rest.drain(..size as usize).collect();
            (first, rest)
        }
        _ => (docs, VecDeque::new()),
    }
}

fn take_batch(remaining: &mut VecDeque<Document>, batch_size: Option<u32>) -> Vec<Document> {
    let n = match batch_size.filter(|b| *b > 0) {
        Some(size) => (size as usize).min(remaining.len()),
        None => remaining.len(),
    };
    remaining.drain(..n).collect()
}

/// A find, aggregate or listing cursor.
pub(crate) struct MemoryCursor {
    core: Arc<ClientCore>,
    ns: Namespace,
    id: i64,
    buffer: VecDeque<Document>,
    remaining: VecDeque<Document>,
    batch_size: Option<u32>,
    call: CallOptions,
}

impl MemoryCursor {
    pub fn new(
        core: Arc<ClientCore>,
        ns: Namespace,
        id: i64,
        first_batch: Vec<Document>,
        remaining: VecDeque<Document>,
        batch_size: Option<u32>,
        call: CallOptions,
    ) -> Self {
        MemoryCursor {
            core,
            ns,
            id,
            buffer: first_batch.into(),
            remaining,
            batch_size,
            call,
        }
    }

    fn get_more(&mut self) -> DriverResult<()> {
        let mut command = Document::new();
        command.insert("getMore".to_string(), json!(self.id));
        command.insert("collection".to_string(), json!(self.ns.coll));
        if let Some(size) = self.batch_size {
            command.insert("batchSize".to_string(), json!(size));
        }
        let ns = self.ns.to_string();
        let id = self.id;
        let remaining = &mut self.remaining;
        let batch_size = self.batch_size;
        let (batch, exhausted) = self.core.execute(&self.ns.db, command, &self.call, |_, _| {
            let batch = take_batch(remaining, batch_size);
            let exhausted = remaining.is_empty();
            let reply_id = if exhausted { 0 } else { id };
            Ok((cursor_reply(&ns, reply_id, "nextBatch", &batch), (batch, exhausted)))
        })?;
        self.buffer.extend(batch);
        if exhausted {
            self.id = 0;
        }
        Ok(())
    }
}

#[async_trait]
impl Cursor for MemoryCursor {
    async fn next(&mut self) -> DriverResult<Option<Document>> {
        if self.buffer.is_empty() && self.id != 0 {
            self.get_more()?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> DriverResult<()> {
        self.buffer.clear();
        if self.id == 0 {
            return Ok(());
        }
        let mut command = Document::new();
        command.insert("killCursors".to_string(), json!(self.ns.coll));
        command.insert("cursors".to_string(), json!([self.id]));
        self.id = 0;
        self.remaining.clear();
        self.core
            .execute(&self.ns.db, command, &self.call, |_, _| Ok((Document::new(), ())))
    }
}

/// A change stream over the deployment's published writes.
pub(crate) struct MemoryChangeStream {
    core: Arc<ClientCore>,
    target: WatchTarget,
    /// `$match` stages that follow `$changeStream`.
    filters: Vec<Document>,
    lookup_full_document: bool,
    id: i64,
    next_seq: u64,
    buffer: VecDeque<Document>,
    batch_size: Option<u32>,
    call: CallOptions,
    closed: bool,
}

impl MemoryChangeStream {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        core: Arc<ClientCore>,
        target: WatchTarget,
        filters: Vec<Document>,
        lookup_full_document: bool,
        id: i64,
        next_seq: u64,
        batch_size: Option<u32>,
        call: CallOptions,
    ) -> Self {
        MemoryChangeStream {
            core,
            target,
            filters,
            lookup_full_document,
            id,
            next_seq,
            buffer: VecDeque::new(),
            batch_size,
            call,
            closed: false,
        }
    }

    fn database(&self) -> &str {
        match &self.target {
            WatchTarget::Cluster => "admin",
            WatchTarget::Database(db) => db,
            WatchTarget::Collection(ns) => &ns.db,
        }
    }

    fn collection(&self) -> String {
        match &self.target {
            WatchTarget::Collection(ns) => ns.coll.clone(),
            _ => "$cmd.aggregate".to_string(),
        }
    }

    fn observes(target: &WatchTarget, change: &ChangeRecord) -> bool {
        match target {
            WatchTarget::Cluster => true,
            WatchTarget::Database(db) => &change.ns.db == db,
            WatchTarget::Collection(ns) => &change.ns == ns,
        }
    }

    fn collect(
        state: &ServerState,
        target: &WatchTarget,
        filters: &[Document],
        lookup: bool,
        from_seq: u64,
    ) -> DriverResult<(Vec<Document>, u64)> {
        let mut next_seq = from_seq;
        let mut docs = Vec::new();
        for (seq, change) in state.oplog.iter().filter(|(seq, _)| *seq >= from_seq) {
            next_seq = seq + 1;
            if !Self::observes(target, change) {
                continue;
            }
            let doc = change_document(*seq, change, state, lookup);
            let mut keep = true;
            for filter in filters {
                if !matches_filter(&doc, filter)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                docs.push(doc);
            }
        }
        Ok((docs, next_seq))
    }

    fn get_more(&mut self) -> DriverResult<()> {
        let mut command = Document::new();
        command.insert("getMore".to_string(), json!(self.id));
        command.insert("collection".to_string(), json!(self.collection()));
        if let Some(size) = self.batch_size {
            command.insert("batchSize".to_string(), json!(size));
        }
        let ns = format!("{}.{}", self.database(), self.collection());
        let (target, filters, lookup, from, id) = (
            &self.target,
            &self.filters,
            self.lookup_full_document,
            self.next_seq,
            self.id,
        );
        let database = self.database().to_string();
        let (docs, next_seq) = self.core.execute(&database, command, &self.call, |state, _| {
            let (docs, next_seq) = Self::collect(state, target, filters, lookup, from)?;
            Ok((cursor_reply(&ns, id, "nextBatch", &docs), (docs, next_seq)))
        })?;
        self.next_seq = next_seq;
        self.buffer.extend(docs);
        Ok(())
    }
}

fn change_document(seq: u64, change: &ChangeRecord, state: &ServerState, lookup: bool) -> Document {
    let mut doc = Document::new();
    doc.insert("_id".to_string(), json!({ "_data": format!("{:016X}", seq) }));
    doc.insert("operationType".to_string(), json!(change.operation_type));
    doc.insert(
        "ns".to_string(),
        json!({ "db": change.ns.db, "coll": change.ns.coll }),
    );
    if let Some(key) = &change.document_key {
        doc.insert("documentKey".to_string(), key.clone());
    }
    match change.operation_type {
        "insert" => {
            if let Some(full) = &change.full_document {
                doc.insert("fullDocument".to_string(), Value::Object(full.clone()));
            }
        }
        "update" => {
            if let Some(desc) = &change.update_description {
                doc.insert("updateDescription".to_string(), desc.clone());
            }
            if lookup {
                let id = change.document_key.as_ref().and_then(|k| k.get("_id"));
                let current = state
                    .store
                    .documents(&change.ns)
                    .into_iter()
                    .find(|d| match (d.get("_id"), id) {
                        (Some(a), Some(b)) => values_equal(a, b),
                        _ => false,
                    });
                doc.insert(
                    "fullDocument".to_string(),
                    current.map(Value::Object).unwrap_or(Value::Null),
                );
            }
        }
        _ => {}
    }
    doc
}

#[async_trait]
impl Cursor for MemoryChangeStream {
    async fn next(&mut self) -> DriverResult<Option<Document>> {
        if self.closed {
            return Err(DriverError::Closed {
                what: "change stream".to_string(),
            });
        }
        if self.buffer.is_empty() {
            self.get_more()?;
        }
        Ok(self.buffer.pop_front())
    }

    async fn close(&mut self) -> DriverResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        let mut command = Document::new();
        command.insert("killCursors".to_string(), json!(self.collection()));
        command.insert("cursors".to_string(), json!([self.id]));
        let database = self.database().to_string();
        self.core
            .execute(&database, command, &self.call, |_, _| Ok((Document::new(), ())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs(n: usize) -> Vec<Document> {
        (0..n)
            .map(|i| json!({ "_id": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn first_batch_respects_batch_size() {
        let (first, rest) = split_first_batch(docs(5), Some(2));
        assert_eq!(first.len(), 2);
        assert_eq!(rest.len(), 3);

        let (first, rest) = split_first_batch(docs(5), None);
        assert_eq!(first.len(), 5);
        assert!(rest.is_empty());
    }

    #[test]
    fn cursor_reply_shape() {
        let reply = cursor_reply("db.coll", 0, "firstBatch", &docs(1));
        assert_eq!(
            Value::Object(reply),
            json!({ "cursor": { "id": 0, "ns": "db.coll", "firstBatch": [{ "_id": 0 }] } })
        );
    }
}
