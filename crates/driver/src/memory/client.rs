//! `MemoryClient` and the execution path every command takes.
//!
//! A round trip checks a connection out of the client's pool, decorates the
//! command with session and concern fields, consults the server's fail
//! points, applies the command to the store under the server lock, and
//! emits the command and pool events around it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{DriverError, DriverResult, TRANSIENT_TRANSACTION_ERROR};
use crate::event::{
    CheckOutFailedReason, CmapEvent, CommandEvent, ConnectionClosedReason, EventHandler,
};
use crate::options::{
    AggregateOptions, BucketOptions, CallOptions, ChangeStreamOptions, ClientOptions,
    DeleteRequest, FindAndModifyAction, FindAndModifyRequest, FindRequest, HandleOptions,
    IndexOptions, ReplaceRequest, SessionOptions, TopologyDescription, UpdateRequest, WriteModel,
};
use crate::results::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::traits::{AggregateTarget, Client, Cursor, Session, WatchTarget};
use crate::wire::{
    apply_concerns, assemble_file, batch_kind, batches, bucket_call, bucket_namespaces,
    bulk_error, chunk_models, document, file_document, file_not_found, update_result,
    validate_model, validate_replacement, validate_update, with_id, write_command,
};
use crate::{Document, Namespace};

use super::cursor::{cursor_reply, split_first_batch, MemoryChangeStream, MemoryCursor};
use super::failpoint::Injected;
use super::session::{MemorySession, TxnContext};
use super::store::{
    matches_filter, new_object_id, run_pipeline, server_error, ChangeRecord, Store, UpdateOutcome,
    WriteSpec, BAD_VALUE, COMMAND_NOT_FOUND, UNRECOGNIZED_STAGE,
};
use super::{CommandRecord, Server, ServerState};

/// Command envelope fields that are not collection options.
const ENVELOPE_FIELDS: &[&str] = &[
    "lsid",
    "txnNumber",
    "autocommit",
    "startTransaction",
    "writeConcern",
    "readConcern",
    "$db",
    "$readPreference",
    "comment",
    "maxTimeMS",
];

fn carries_lsid(name: &str) -> bool {
    !matches!(
        name,
        "hello" | "isMaster" | "ismaster" | "buildInfo" | "buildinfo" | "killAllSessions" | "endSessions"
    )
}

/// A fresh logical session id: `{id: <UUID binary>}`.
pub(crate) fn new_lsid() -> Document {
    let id = Uuid::new_v4();
    document(json!({
        "id": { "$binary": { "base64": STANDARD.encode(id.as_bytes()), "subType": "04" } }
    }))
}

fn error_message(err: &DriverError) -> String {
    match err {
        DriverError::Command { message, .. } | DriverError::BulkWrite { message, .. } => {
            message.clone()
        }
        other => other.to_string(),
    }
}

// ── Pool and execution path ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Pool {
    idle: Vec<u32>,
    next_connection_id: u32,
    checked_out: u32,
    closed: bool,
}

enum Outcome<T> {
    Replied(Document, T),
    WriteConcernFailed(Document, DriverError),
    Failed(DriverError),
    ConnectionClosed,
}

pub(crate) struct ClientCore {
    server: Arc<Server>,
    handler: Option<Arc<dyn EventHandler>>,
    pool: Mutex<Pool>,
    implicit_lsid: Document,
    app_name: Option<String>,
}

impl ClientCore {
    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    fn emit_command(&self, event: CommandEvent) {
        if let Some(handler) = &self.handler {
            handler.handle_command_event(event);
        }
    }

    fn emit_cmap(&self, event: CmapEvent) {
        if let Some(handler) = &self.handler {
            handler.handle_cmap_event(event);
        }
    }

    fn is_closed(&self) -> bool {
        self.pool.lock().closed
    }

    fn check_out(&self) -> DriverResult<u32> {
        self.emit_cmap(CmapEvent::ConnectionCheckOutStarted);
        let checked_out = {
            let mut pool = self.pool.lock();
            if pool.closed {
                None
            } else {
                pool.checked_out += 1;
                Some(match pool.idle.pop() {
                    Some(id) => (id, false),
                    None => {
                        pool.next_connection_id += 1;
                        (pool.next_connection_id, true)
                    }
                })
            }
        };
        let Some((connection_id, created)) = checked_out else {
            self.emit_cmap(CmapEvent::ConnectionCheckOutFailed {
                reason: CheckOutFailedReason::PoolClosed,
            });
            return Err(DriverError::Closed {
                what: "client".to_string(),
            });
        };
        if created {
            self.emit_cmap(CmapEvent::ConnectionCreated { connection_id });
            self.emit_cmap(CmapEvent::ConnectionReady { connection_id });
        }
        self.emit_cmap(CmapEvent::ConnectionCheckedOut { connection_id });
        Ok(connection_id)
    }

    fn check_in(&self, connection_id: u32) {
        {
            let mut pool = self.pool.lock();
            pool.checked_out = pool.checked_out.saturating_sub(1);
            pool.idle.push(connection_id);
        }
        self.emit_cmap(CmapEvent::ConnectionCheckedIn { connection_id });
    }

    /// Network failure on `connection_id`: clear the pool and close the connection.
    fn discard(&self, connection_id: u32) {
        let stale = {
            let mut pool = self.pool.lock();
            pool.checked_out = pool.checked_out.saturating_sub(1);
            std::mem::take(&mut pool.idle)
        };
        let service_id = self.server.service_id.clone();
        self.emit_cmap(CmapEvent::PoolCleared {
            service_id: service_id.clone(),
        });
        self.emit_cmap(CmapEvent::ConnectionCheckedIn { connection_id });
        self.emit_cmap(CmapEvent::ConnectionClosed {
            connection_id,
            reason: ConnectionClosedReason::Error,
            service_id: service_id.clone(),
        });
        for id in stale {
            self.emit_cmap(CmapEvent::ConnectionClosed {
                connection_id: id,
                reason: ConnectionClosedReason::Stale,
                service_id: service_id.clone(),
            });
        }
    }

    fn decorate(&self, command: &mut Document, name: &str, handle: &HandleOptions, txn: &TxnContext) {
        let lsid = txn
            .lsid
            .clone()
            .or_else(|| carries_lsid(name).then(|| self.implicit_lsid.clone()));
        if let Some(lsid) = lsid {
            command.insert("lsid".to_string(), Value::Object(lsid));
        }

        if let Some(number) = txn.txn_number {
            command.insert("txnNumber".to_string(), json!(number));
            if txn.starts {
                command.insert("startTransaction".to_string(), json!(true));
            }
            command.insert("autocommit".to_string(), json!(false));
            if let Some(rc) = &txn.read_concern {
                command.insert("readConcern".to_string(), json!({ "level": rc.level }));
            }
            if let Some(wc) = &txn.write_concern {
                let wc = wc.to_document();
                if !wc.is_empty() {
                    command.insert("writeConcern".to_string(), Value::Object(wc));
                }
            }
            return;
        }
        apply_concerns(command, name, handle);
    }

    /// Resolve the session in `options` and run one round trip.
    pub(crate) fn execute<T, F>(
        &self,
        database: &str,
        command: Document,
        options: &CallOptions,
        apply: F,
    ) -> DriverResult<T>
    where
        F: FnOnce(&mut ServerState, &mut Vec<ChangeRecord>) -> DriverResult<(Document, T)>,
    {
        let session = match &options.session {
            Some(session) => {
                let session = session
                    .as_any()
                    .downcast_ref::<MemorySession>()
                    .ok_or_else(|| {
                        DriverError::invalid_argument("session was not started by an in-memory client")
                    })?;
                if !session.belongs_to(self) {
                    return Err(DriverError::invalid_argument(
                        "session was started by a different client",
                    ));
                }
                Some(session)
            }
            None => None,
        };
        self.round_trip(database, command, session, &options.handle, apply)
    }

    pub(crate) fn round_trip<T, F>(
        &self,
        database: &str,
        mut command: Document,
        session: Option<&MemorySession>,
        handle: &HandleOptions,
        apply: F,
    ) -> DriverResult<T>
    where
        F: FnOnce(&mut ServerState, &mut Vec<ChangeRecord>) -> DriverResult<(Document, T)>,
    {
        let command_name = command.keys().next().cloned().unwrap_or_default();
        let txn = match session {
            Some(session) => session.prepare(&command_name, self.server.profile.topology)?,
            None => TxnContext::default(),
        };
        self.decorate(&mut command, &command_name, handle, &txn);

        let connection_id = self.check_out()?;
        let request_id = self.server.next_request_id();
        tracing::trace!(command = %command_name, database, request_id, "sending command");
        self.emit_command(CommandEvent::Started {
            command_name: command_name.clone(),
            database_name: database.to_string(),
            command: command.clone(),
            request_id,
            service_id: self.server.service_id.clone(),
        });
        let started = Instant::now();

        let outcome = {
            let mut state = self.server.state.lock();
            state.commands.push(CommandRecord {
                database: database.to_string(),
                command_name: command_name.clone(),
                command,
            });
            let injected = if command_name == "configureFailPoint" {
                None
            } else {
                state
                    .fail_points
                    .check(&command_name, self.app_name.as_deref())
            };
            match injected {
                Some(Injected::CloseConnection) => Outcome::ConnectionClosed,
                Some(Injected::Error(err)) => Outcome::Failed(err),
                deferred => {
                    if txn.starts {
                        if let Some(session) = session {
                            session.capture_snapshot(&state.store);
                        }
                    }
                    let mut changes = Vec::new();
                    let result = apply(&mut *state, &mut changes);
                    match session.filter(|_| txn.in_transaction()) {
                        Some(session) => session.defer_changes(changes),
                        None => state.publish(changes),
                    }
                    match (result, deferred) {
                        (Ok((mut reply, _)), Some(Injected::WriteConcern { reply: wce, error })) => {
                            reply.insert("writeConcernError".to_string(), Value::Object(wce));
                            Outcome::WriteConcernFailed(reply, error)
                        }
                        (Ok((reply, value)), _) => Outcome::Replied(reply, value),
                        (Err(err), _) => Outcome::Failed(err),
                    }
                }
            }
        };

        let duration_micros = started.elapsed().as_micros() as u64;
        let succeeded = |mut reply: Document| {
            reply.insert("ok".to_string(), json!(1));
            CommandEvent::Succeeded {
                command_name: command_name.clone(),
                database_name: database.to_string(),
                reply,
                request_id,
                duration_micros,
            }
        };
        let failed = |failure: String| CommandEvent::Failed {
            command_name: command_name.clone(),
            database_name: database.to_string(),
            failure,
            request_id,
            duration_micros,
        };

        match outcome {
            Outcome::Replied(reply, value) => {
                self.emit_command(succeeded(reply));
                self.check_in(connection_id);
                Ok(value)
            }
            Outcome::WriteConcernFailed(reply, error) => {
                self.emit_command(succeeded(reply));
                self.check_in(connection_id);
                Err(error)
            }
            Outcome::Failed(err) => {
                tracing::trace!(command = %command_name, error = %err, "command failed");
                self.emit_command(failed(err.to_string()));
                self.check_in(connection_id);
                Err(err)
            }
            Outcome::ConnectionClosed => {
                let err = DriverError::Network {
                    message: format!(
                        "connection {} closed while running {}",
                        connection_id, command_name
                    ),
                    labels: Vec::new(),
                };
                self.emit_command(failed(err.to_string()));
                self.discard(connection_id);
                if let Some(session) = session {
                    session.mark_dirty();
                }
                if txn.in_transaction() && command_name != "commitTransaction" {
                    Err(err.with_label(TRANSIENT_TRANSACTION_ERROR))
                } else {
                    Err(err)
                }
            }
        }
    }
}

// ── Batched writes ───────────────────────────────────────────────────────────

enum Applied {
    Inserted(Value),
    Updated(UpdateOutcome),
    Deleted(u64),
}

fn apply_model(
    store: &mut Store,
    ns: &Namespace,
    model: WriteModel,
    changes: &mut Vec<ChangeRecord>,
) -> DriverResult<Applied> {
    match model {
        WriteModel::InsertOne(doc) => store.insert(ns, doc, changes).map(Applied::Inserted),
        WriteModel::UpdateOne(r) => {
            let spec = WriteSpec { filter: &r.filter, sort: None, multi: false, upsert: r.upsert };
            store.update(ns, &spec, &r.update, changes).map(Applied::Updated)
        }
        WriteModel::UpdateMany(r) => {
            let spec = WriteSpec { filter: &r.filter, sort: None, multi: true, upsert: r.upsert };
            store.update(ns, &spec, &r.update, changes).map(Applied::Updated)
        }
        WriteModel::ReplaceOne(r) => {
            let spec = WriteSpec { filter: &r.filter, sort: None, multi: false, upsert: r.upsert };
            store.replace(ns, &spec, &r.replacement, changes).map(Applied::Updated)
        }
        WriteModel::DeleteOne(r) => store.delete(ns, &r.filter, false, changes).map(Applied::Deleted),
        WriteModel::DeleteMany(r) => store.delete(ns, &r.filter, true, changes).map(Applied::Deleted),
    }
}

/// A connected [`MemoryDeployment`](super::MemoryDeployment) client.
pub struct MemoryClient {
    core: Arc<ClientCore>,
}

impl MemoryClient {
    pub(crate) fn connect(server: Arc<Server>, options: ClientOptions) -> Self {
        let app_name = options
            .uri_options
            .get("appname")
            .or_else(|| options.uri_options.get("appName"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let core = Arc::new(ClientCore {
            server,
            handler: options.event_handler,
            pool: Mutex::new(Pool::default()),
            implicit_lsid: new_lsid(),
            app_name,
        });
        core.emit_cmap(CmapEvent::PoolCreated);
        core.emit_cmap(CmapEvent::PoolReady);
        MemoryClient { core }
    }

    fn write_batch(
        &self,
        ns: &Namespace,
        batch: Vec<(usize, WriteModel)>,
        ordered: bool,
        options: &CallOptions,
        result: &mut BulkWriteResult,
    ) -> DriverResult<Option<DriverError>> {
        let command = write_command(ns, &batch, ordered);
        let command_name = batch_kind(&batch[0].1).command().0;

        self.core.execute(&ns.db, command, options, |state, changes| {
            let mut n = 0u64;
            let mut modified = 0u64;
            let mut upserted = Vec::new();
            let mut write_errors = Vec::new();
            let mut first_error = None;
            for (position, (index, model)) in batch.into_iter().enumerate() {
                match apply_model(&mut state.store, ns, model, changes) {
                    Ok(Applied::Inserted(id)) => {
                        n += 1;
                        result.inserted_count += 1;
                        result.inserted_ids.insert(index, id);
                    }
                    Ok(Applied::Updated(outcome)) => {
                        if let Some(id) = outcome.upserted_id {
                            n += 1;
                            result.upserted_count += 1;
                            result.upserted_ids.insert(index, id.clone());
                            upserted.push(json!({ "index": position, "_id": id }));
                        } else {
                            n += outcome.matched;
                            result.matched_count += outcome.matched;
                        }
                        modified += outcome.modified;
                        result.modified_count += outcome.modified;
                    }
                    Ok(Applied::Deleted(count)) => {
                        n += count;
                        result.deleted_count += count;
                    }
                    Err(err) => {
                        write_errors.push(json!({
                            "index": position,
                            "code": err.code().unwrap_or(BAD_VALUE),
                            "errmsg": error_message(&err),
                        }));
                        first_error.get_or_insert(err);
                        if ordered {
                            break;
                        }
                    }
                }
            }
            let mut reply = Document::new();
            reply.insert("n".to_string(), json!(n));
            if command_name == "update" {
                reply.insert("nModified".to_string(), json!(modified));
                if !upserted.is_empty() {
                    reply.insert("upserted".to_string(), Value::Array(upserted));
                }
            }
            if !write_errors.is_empty() {
                reply.insert("writeErrors".to_string(), Value::Array(write_errors));
            }
            Ok((reply, first_error))
        })
    }

    /// Run `models` as one or more write commands. Write errors come back in
    /// the second slot; command-level failures as `Err`.
    fn run_writes(
        &self,
        ns: &Namespace,
        models: Vec<WriteModel>,
        ordered: bool,
        options: &CallOptions,
    ) -> DriverResult<(BulkWriteResult, Option<DriverError>)> {
        for model in &models {
            validate_model(model)?;
        }
        let models = models
            .into_iter()
            .map(|m| match m {
                WriteModel::InsertOne(doc) => WriteModel::InsertOne(with_id(doc, new_object_id)),
                other => other,
            })
            .collect();
        let mut result = BulkWriteResult::default();
        let mut first_error = None;
        for batch in batches(models) {
            if let Some(err) = self.write_batch(ns, batch, ordered, options, &mut result)? {
                first_error.get_or_insert(err);
                if ordered {
                    break;
                }
            }
        }
        Ok((result, first_error))
    }

    fn single_write(
        &self,
        ns: &Namespace,
        model: WriteModel,
        options: &CallOptions,
    ) -> DriverResult<BulkWriteResult> {
        let (result, error) = self.run_writes(ns, vec![model], true, options)?;
        match error {
            Some(err) => Err(err),
            None => Ok(result),
        }
    }

    async fn collect(
        &self,
        ns: &Namespace,
        request: FindRequest,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>> {
        let mut cursor = self.find(ns, request, options).await?;
        let mut docs = Vec::new();
        while let Some(doc) = cursor.next().await? {
            docs.push(doc);
        }
        Ok(docs)
    }
}

fn str_field<'a>(command: &'a Document, field: &str) -> DriverResult<&'a str> {
    command.get(field).and_then(Value::as_str).ok_or_else(|| {
        server_error(BAD_VALUE, format!("field '{}' must be a string", field))
    })
}

fn object_field(command: &Document, field: &str) -> Document {
    command
        .get(field)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

fn collection_info(name: &str, options: Document) -> Document {
    document(json!({
        "name": name,
        "type": "collection",
        "options": options,
        "info": { "readOnly": false },
    }))
}

fn get_parameter(parameters: &Document, command: &Document) -> DriverResult<Document> {
    if command.get("getParameter").and_then(Value::as_str) == Some("*") {
        return Ok(parameters.clone());
    }
    let mut reply = Document::new();
    for name in command
        .keys()
        .filter(|k| k.as_str() != "getParameter" && !ENVELOPE_FIELDS.contains(&k.as_str()))
    {
        if let Some(value) = parameters.get(name) {
            reply.insert(name.clone(), value.clone());
        }
    }
    if reply.is_empty() {
        return Err(server_error(72, "no option found to get"));
    }
    Ok(reply)
}

/// Commands reachable only through `run_command`.
fn generic_command(
    server: &Server,
    state: &mut ServerState,
    database: &str,
    name: &str,
    command: &Document,
    changes: &mut Vec<ChangeRecord>,
) -> DriverResult<Document> {
    if server.profile.unsupported_commands.iter().any(|c| c == name) {
        return Err(server_error(
            COMMAND_NOT_FOUND,
            format!("no such command: '{}'", name),
        ));
    }
    let mut reply = match name {
        "ping" | "endSessions" => Document::new(),
        "hello" | "isMaster" | "ismaster" => server.hello(),
        "buildInfo" | "buildinfo" => server.build_info(),
        "getParameter" => get_parameter(&server.profile.parameters, command)?,
        "killAllSessions" => {
            let ServerState {
                sessions, store, ..
            } = &mut *state;
            sessions.retain(|s| s.strong_count() > 0);
            for session in sessions.iter().filter_map(|s| s.upgrade()) {
                session.lock().kill(store);
            }
            Document::new()
        }
        "configureFailPoint" => state.fail_points.configure(command)?,
        "create" => {
            let ns = Namespace::new(database, str_field(command, "create")?);
            let options: Document = command
                .iter()
                .filter(|(k, _)| k.as_str() != "create" && !ENVELOPE_FIELDS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            state.store.create_collection(&ns, options, changes)?;
            Document::new()
        }
        "drop" => {
            let ns = Namespace::new(database, str_field(command, "drop")?);
            state.store.drop_collection(&ns, changes);
            document(json!({ "ns": ns.to_string() }))
        }
        "dropDatabase" => {
            state.store.drop_database(database, changes);
            document(json!({ "dropped": database }))
        }
        "listCollections" => {
            let filter = object_field(command, "filter");
            let mut infos = Vec::new();
            for coll in state.store.collection_names(database) {
                let ns = Namespace::new(database, coll.clone());
                let info = collection_info(&coll, state.store.collection_options(&ns).unwrap_or_default());
                if matches_filter(&info, &filter)? {
                    infos.push(info);
                }
            }
            cursor_reply(&format!("{}.$cmd.listCollections", database), 0, "firstBatch", &infos)
        }
        "count" => {
            let ns = Namespace::new(database, str_field(command, "count")?);
            let filter = object_field(command, "query");
            let n = state.store.find(&ns, &filter, None, None, None, None)?.len();
            document(json!({ "n": n }))
        }
        "distinct" => {
            let ns = Namespace::new(database, str_field(command, "distinct")?);
            let key = str_field(command, "key")?;
            let values = state.store.distinct(&ns, key, &object_field(command, "query"))?;
            document(json!({ "values": values }))
        }
        "find" => {
            let ns = Namespace::new(database, str_field(command, "find")?);
            let sort = command.get("sort").and_then(Value::as_object);
            let docs = state.store.find(
                &ns,
                &object_field(command, "filter"),
                sort,
                command.get("skip").and_then(Value::as_u64),
                command.get("limit").and_then(Value::as_i64),
                command.get("projection").and_then(Value::as_object),
            )?;
            cursor_reply(&ns.to_string(), 0, "firstBatch", &docs)
        }
        "insert" => {
            let ns = Namespace::new(database, str_field(command, "insert")?);
            let docs = command
                .get("documents")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let mut n = 0;
            for doc in docs {
                let Value::Object(doc) = doc else {
                    return Err(server_error(BAD_VALUE, "documents must be objects"));
                };
                state.store.insert(&ns, doc, changes)?;
                n += 1;
            }
            document(json!({ "n": n }))
        }
        other => {
            return Err(server_error(
                COMMAND_NOT_FOUND,
                format!("no such command: '{}'", other),
            ))
        }
    };
    reply.insert("ok".to_string(), json!(1));
    Ok(reply)
}

#[async_trait]
impl Client for MemoryClient {
    async fn run_command(
        &self,
        database: &str,
        command: Document,
        options: &CallOptions,
    ) -> DriverResult<Document> {
        let name = command
            .keys()
            .next()
            .cloned()
            .ok_or_else(|| DriverError::invalid_argument("command document must not be empty"))?;
        let server = self.core.server.clone();
        self.core
            .execute(database, command.clone(), options, |state, changes| {
                let reply = generic_command(&server, state, database, &name, &command, changes)?;
                Ok((reply.clone(), reply))
            })
    }

    async fn insert_one(
        &self,
        ns: &Namespace,
        document: Document,
        options: &CallOptions,
    ) -> DriverResult<InsertOneResult> {
        let document = with_id(document, new_object_id);
        let inserted_id = document.get("_id").cloned().unwrap_or(Value::Null);
        self.single_write(ns, WriteModel::InsertOne(document), options)?;
        Ok(InsertOneResult { inserted_id })
    }

    async fn insert_many(
        &self,
        ns: &Namespace,
        documents: Vec<Document>,
        ordered: bool,
        options: &CallOptions,
    ) -> DriverResult<InsertManyResult> {
        if documents.is_empty() {
            return Err(DriverError::invalid_argument(
                "insertMany requires at least one document",
            ));
        }
        let models = documents.into_iter().map(WriteModel::InsertOne).collect();
        let (result, error) = self.run_writes(ns, models, ordered, options)?;
        if let Some(err) = error {
            return Err(bulk_error(err, &result));
        }
        Ok(InsertManyResult {
            inserted_ids: result.inserted_ids,
        })
    }

    async fn update(
        &self,
        ns: &Namespace,
        request: UpdateRequest,
        options: &CallOptions,
    ) -> DriverResult<UpdateResult> {
        let model = if request.multi {
            WriteModel::UpdateMany(request)
        } else {
            WriteModel::UpdateOne(request)
        };
        self.single_write(ns, model, options).map(update_result)
    }

    async fn replace_one(
        &self,
        ns: &Namespace,
        request: ReplaceRequest,
        options: &CallOptions,
    ) -> DriverResult<UpdateResult> {
        self.single_write(ns, WriteModel::ReplaceOne(request), options)
            .map(update_result)
    }

    async fn delete(
        &self,
        ns: &Namespace,
        request: DeleteRequest,
        options: &CallOptions,
    ) -> DriverResult<DeleteResult> {
        let model = if request.multi {
            WriteModel::DeleteMany(request)
        } else {
            WriteModel::DeleteOne(request)
        };
        let result = self.single_write(ns, model, options)?;
        Ok(DeleteResult {
            deleted_count: result.deleted_count,
        })
    }

    async fn bulk_write(
        &self,
        ns: &Namespace,
        models: Vec<WriteModel>,
        ordered: bool,
        options: &CallOptions,
    ) -> DriverResult<BulkWriteResult> {
        if models.is_empty() {
            return Err(DriverError::invalid_argument(
                "bulkWrite requires at least one model",
            ));
        }
        let (result, error) = self.run_writes(ns, models, ordered, options)?;
        match error {
            Some(err) => Err(bulk_error(err, &result)),
            None => Ok(result),
        }
    }

    async fn find(
        &self,
        ns: &Namespace,
        request: FindRequest,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>> {
        let mut command = document(json!({ "find": ns.coll, "filter": request.filter }));
        if let Some(sort) = &request.sort {
            command.insert("sort".to_string(), json!(sort));
        }
        if let Some(projection) = &request.projection {
            command.insert("projection".to_string(), json!(projection));
        }
        if let Some(skip) = request.skip {
            command.insert("skip".to_string(), json!(skip));
        }
        if let Some(limit) = request.limit {
            command.insert("limit".to_string(), json!(limit));
        }
        if let Some(batch_size) = request.batch_size {
            command.insert("batchSize".to_string(), json!(batch_size));
        }
        if let Some(comment) = &request.comment {
            command.insert("comment".to_string(), comment.clone());
        }

        let (id, first, rest) = self.core.execute(&ns.db, command, options, |state, _| {
            let docs = state.store.find(
                ns,
                &request.filter,
                request.sort.as_ref(),
                request.skip,
                request.limit,
                request.projection.as_ref(),
            )?;
            let (first, rest) = split_first_batch(docs, request.batch_size);
            let id = if rest.is_empty() { 0 } else { state.next_cursor_id() };
            Ok((
                cursor_reply(&ns.to_string(), id, "firstBatch", &first),
                (id, first, rest),
            ))
        })?;
        Ok(Box::new(MemoryCursor::new(
            self.core.clone(),
            ns.clone(),
            id,
            first,
            rest,
            request.batch_size,
            options.clone(),
        )))
    }

    async fn find_and_modify(
        &self,
        ns: &Namespace,
        request: FindAndModifyRequest,
        options: &CallOptions,
    ) -> DriverResult<Option<Document>> {
        let mut command = document(json!({ "findAndModify": ns.coll, "query": request.filter }));
        if let Some(sort) = &request.sort {
            command.insert("sort".to_string(), json!(sort));
        }
        if let Some(projection) = &request.projection {
            command.insert("fields".to_string(), json!(projection));
        }
        match &request.action {
            FindAndModifyAction::Remove => {
                command.insert("remove".to_string(), json!(true));
            }
            FindAndModifyAction::Update(update) => {
                validate_update(update)?;
                command.insert("update".to_string(), update.to_json());
            }
            FindAndModifyAction::Replace(replacement) => {
                validate_replacement(replacement)?;
                command.insert("update".to_string(), json!(replacement));
            }
        }
        if !matches!(request.action, FindAndModifyAction::Remove) {
            command.insert("new".to_string(), json!(request.return_new));
            command.insert("upsert".to_string(), json!(request.upsert));
        }

        self.core.execute(&ns.db, command, options, |state, changes| {
            let spec = WriteSpec {
                filter: &request.filter,
                sort: request.sort.as_ref(),
                multi: false,
                upsert: request.upsert,
            };
            let (before, after) = state
                .store
                .find_and_modify(ns, &spec, &request.action, changes)?;
            let updated_existing = before.is_some() && after.is_some();
            let n = u64::from(before.is_some() || after.is_some());
            let value = if request.return_new { after } else { before };
            let value = match (&request.projection, value) {
                (Some(projection), Some(doc)) => Some(super::store::project(&doc, projection)),
                (_, value) => value,
            };
            let reply = document(json!({
                "lastErrorObject": { "n": n, "updatedExisting": updated_existing },
                "value": value.clone().map(Value::Object).unwrap_or(Value::Null),
            }));
            Ok((reply, value))
        })
    }

    async fn aggregate(
        &self,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        aggregate_options: AggregateOptions,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>> {
        let (ns, aggregate_field) = match &target {
            AggregateTarget::Database(db) => (Namespace::new(db.clone(), "$cmd.aggregate"), json!(1)),
            AggregateTarget::Collection(ns) => (ns.clone(), json!(ns.coll)),
        };
        let mut cursor_options = Document::new();
        if let Some(batch_size) = aggregate_options.batch_size {
            cursor_options.insert("batchSize".to_string(), json!(batch_size));
        }
        let mut command = document(json!({
            "aggregate": aggregate_field,
            "pipeline": pipeline,
            "cursor": cursor_options,
        }));
        if let Some(allow) = aggregate_options.allow_disk_use {
            command.insert("allowDiskUse".to_string(), json!(allow));
        }
        if let Some(let_vars) = &aggregate_options.let_vars {
            command.insert("let".to_string(), json!(let_vars));
        }
        if let Some(comment) = &aggregate_options.comment {
            command.insert("comment".to_string(), comment.clone());
        }

        let batch_size = aggregate_options.batch_size;
        let (id, first, rest) = self.core.execute(&ns.db, command, options, |state, _| {
            let (input, stages): (Vec<Document>, &[Document]) = match pipeline.first().and_then(|s| s.get("$documents")) {
                Some(Value::Array(docs)) => (
                    docs.iter().filter_map(|d| d.as_object().cloned()).collect(),
                    &pipeline[1..],
                ),
                _ => match &target {
                    AggregateTarget::Collection(ns) => (state.store.documents(ns), &pipeline[..]),
                    AggregateTarget::Database(_) => {
                        return Err(server_error(
                            UNRECOGNIZED_STAGE,
                            "database-level aggregation requires a leading $documents stage",
                        ))
                    }
                },
            };
            let docs = run_pipeline(input, stages)?;
            let (first, rest) = split_first_batch(docs, batch_size);
            let id = if rest.is_empty() { 0 } else { state.next_cursor_id() };
            Ok((
                cursor_reply(&ns.to_string(), id, "firstBatch", &first),
                (id, first, rest),
            ))
        })?;
        Ok(Box::new(MemoryCursor::new(
            self.core.clone(),
            ns,
            id,
            first,
            rest,
            batch_size,
            options.clone(),
        )))
    }

    async fn count_documents(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<u64> {
        let pipeline = vec![
            document(json!({ "$match": filter })),
            document(json!({ "$group": { "_id": 1, "n": { "$sum": 1 } } })),
        ];
        let command = document(json!({
            "aggregate": ns.coll,
            "pipeline": pipeline,
            "cursor": {},
        }));
        self.core.execute(&ns.db, command, options, |state, _| {
            let docs = run_pipeline(state.store.documents(ns), &pipeline)?;
            let n = docs
                .first()
                .and_then(|d| d.get("n"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            Ok((cursor_reply(&ns.to_string(), 0, "firstBatch", &docs), n))
        })
    }

    async fn estimated_document_count(
        &self,
        ns: &Namespace,
        options: &CallOptions,
    ) -> DriverResult<u64> {
        let command = document(json!({ "count": ns.coll }));
        self.core.execute(&ns.db, command, options, |state, _| {
            let n = state.store.documents(ns).len() as u64;
            Ok((document(json!({ "n": n })), n))
        })
    }

    async fn distinct(
        &self,
        ns: &Namespace,
        field: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Value>> {
        let command = document(json!({ "distinct": ns.coll, "key": field, "query": filter }));
        self.core.execute(&ns.db, command, options, |state, _| {
            let values = state.store.distinct(ns, field, &filter)?;
            Ok((document(json!({ "values": values })), values))
        })
    }

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
        collection_options: Document,
        options: &CallOptions,
    ) -> DriverResult<()> {
        let mut command = document(json!({ "create": name }));
        command.extend(collection_options.clone());
        let ns = Namespace::new(database, name);
        self.core.execute(database, command, options, |state, changes| {
            state.store.create_collection(&ns, collection_options, changes)?;
            Ok((Document::new(), ()))
        })
    }

    async fn drop_collection(&self, ns: &Namespace, options: &CallOptions) -> DriverResult<()> {
        let command = document(json!({ "drop": ns.coll }));
        self.core.execute(&ns.db, command, options, |state, changes| {
            // Dropping a missing collection succeeds, as on current servers.
            state.store.drop_collection(ns, changes);
            Ok((document(json!({ "ns": ns.to_string() })), ()))
        })
    }

    async fn list_collections(
        &self,
        database: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>> {
        let command = document(json!({ "listCollections": 1, "filter": filter }));
        self.core.execute(database, command, options, |state, _| {
            let mut infos = Vec::new();
            for coll in state.store.collection_names(database) {
                let ns = Namespace::new(database, coll.clone());
                let info = collection_info(
                    &coll,
                    state.store.collection_options(&ns).unwrap_or_default(),
                );
                if matches_filter(&info, &filter)? {
                    infos.push(info);
                }
            }
            let reply = cursor_reply(
                &format!("{}.$cmd.listCollections", database),
                0,
                "firstBatch",
                &infos,
            );
            Ok((reply, infos))
        })
    }

    async fn list_databases(
        &self,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>> {
        let mut command = document(json!({ "listDatabases": 1 }));
        if !filter.is_empty() {
            command.insert("filter".to_string(), json!(filter));
        }
        self.core.execute("admin", command, options, |state, _| {
            let mut databases = Vec::new();
            for name in state.store.database_names() {
                let info = document(json!({ "name": name, "sizeOnDisk": 8192, "empty": false }));
                if matches_filter(&info, &filter)? {
                    databases.push(info);
                }
            }
            let reply = document(json!({ "databases": databases, "totalSize": 8192 * databases.len() }));
            Ok((reply, databases))
        })
    }

    async fn create_index(
        &self,
        ns: &Namespace,
        keys: Document,
        index_options: IndexOptions,
        options: &CallOptions,
    ) -> DriverResult<String> {
        let name = index_options.name.clone().unwrap_or_else(|| {
            keys.iter()
                .map(|(k, v)| format!("{}_{}", k, v))
                .collect::<Vec<_>>()
                .join("_")
        });
        let unique = index_options.unique.unwrap_or(false);
        let mut index = document(json!({ "key": keys, "name": name }));
        if unique {
            index.insert("unique".to_string(), json!(true));
        }
        let command = document(json!({ "createIndexes": ns.coll, "indexes": [index] }));
        self.core.execute(&ns.db, command, options, |state, _| {
            let before = state
                .store
                .collection(ns)
                .map(|c| c.indexes.len())
                .unwrap_or(1);
            let name = state.store.create_index(ns, &keys, Some(name), unique)?;
            let after = state.store.collection(ns).map(|c| c.indexes.len()).unwrap_or(1);
            Ok((
                document(json!({ "numIndexesBefore": before, "numIndexesAfter": after })),
                name,
            ))
        })
    }

    async fn list_indexes(&self, ns: &Namespace, options: &CallOptions) -> DriverResult<Vec<Document>> {
        let command = document(json!({ "listIndexes": ns.coll, "cursor": {} }));
        self.core.execute(&ns.db, command, options, |state, _| {
            let indexes = state.store.list_indexes(ns)?;
            Ok((cursor_reply(&ns.to_string(), 0, "firstBatch", &indexes), indexes))
        })
    }

    async fn rename_collection(
        &self,
        ns: &Namespace,
        to: &str,
        drop_target: bool,
        options: &CallOptions,
    ) -> DriverResult<()> {
        let target = Namespace::new(ns.db.clone(), to);
        let command = document(json!({
            "renameCollection": ns.to_string(),
            "to": target.to_string(),
            "dropTarget": drop_target,
        }));
        self.core.execute("admin", command, options, |state, changes| {
            state.store.rename(ns, &target, drop_target, changes)?;
            Ok((Document::new(), ()))
        })
    }

    async fn watch(
        &self,
        target: WatchTarget,
        pipeline: Vec<Document>,
        stream_options: ChangeStreamOptions,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>> {
        let mut stage = Document::new();
        if let Some(full_document) = &stream_options.full_document {
            stage.insert("fullDocument".to_string(), json!(full_document));
        }
        if let Some(token) = &stream_options.resume_after {
            stage.insert("resumeAfter".to_string(), token.clone());
        }
        if target == WatchTarget::Cluster {
            stage.insert("allChangesForCluster".to_string(), json!(true));
        }
        let mut full_pipeline = vec![json!({ "$changeStream": stage })];
        full_pipeline.extend(pipeline.iter().cloned().map(Value::Object));

        let (database, aggregate_field, ns) = match &target {
            WatchTarget::Cluster => ("admin".to_string(), json!(1), "admin.$cmd.aggregate".to_string()),
            WatchTarget::Database(db) => (db.clone(), json!(1), format!("{}.$cmd.aggregate", db)),
            WatchTarget::Collection(ns) => (ns.db.clone(), json!(ns.coll), ns.to_string()),
        };
        let mut cursor_options = Document::new();
        if let Some(batch_size) = stream_options.batch_size {
            cursor_options.insert("batchSize".to_string(), json!(batch_size));
        }
        let command = document(json!({
            "aggregate": aggregate_field,
            "pipeline": full_pipeline,
            "cursor": cursor_options,
        }));

        let mut filters = Vec::new();
        for stage in &pipeline {
            match stage.get("$match").and_then(Value::as_object) {
                Some(filter) if stage.len() == 1 => filters.push(filter.clone()),
                _ => {
                    return Err(DriverError::invalid_argument(format!(
                        "unsupported change stream stage: {}",
                        Value::Object(stage.clone())
                    )))
                }
            }
        }
        let resume_seq = stream_options
            .resume_after
            .as_ref()
            .and_then(|t| t.get("_data"))
            .and_then(Value::as_str)
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(|seq| seq + 1);

        let (id, next_seq) = self.core.execute(&database, command, options, |state, _| {
            let id = state.next_cursor_id();
            let next_seq = resume_seq.unwrap_or_else(|| state.head_seq());
            Ok((cursor_reply(&ns, id, "firstBatch", &[]), (id, next_seq)))
        })?;
        Ok(Box::new(MemoryChangeStream::new(
            self.core.clone(),
            target,
            filters,
            stream_options.full_document.as_deref() == Some("updateLookup"),
            id,
            next_seq,
            stream_options.batch_size,
            options.clone(),
        )))
    }

    async fn upload(
        &self,
        database: &str,
        bucket: &BucketOptions,
        filename: &str,
        bytes: Vec<u8>,
        metadata: Option<Document>,
        options: &CallOptions,
    ) -> DriverResult<Value> {
        let call = bucket_call(bucket, options);
        let (files_ns, chunks_ns) = bucket_namespaces(database, bucket);
        let id = new_object_id();
        let chunks = chunk_models(&id, &bytes, bucket, new_object_id);
        if !chunks.is_empty() {
            let (_, error) = self.run_writes(&chunks_ns, chunks, true, &call)?;
            if let Some(err) = error {
                return Err(err);
            }
        }
        let file = file_document(&id, &bytes, bucket, filename, metadata);
        self.single_write(&files_ns, WriteModel::InsertOne(file), &call)?;
        Ok(id)
    }

    async fn download(
        &self,
        database: &str,
        bucket: &BucketOptions,
        id: &Value,
        options: &CallOptions,
    ) -> DriverResult<Vec<u8>> {
        let (files_ns, chunks_ns) = bucket_namespaces(database, bucket);
        let files = self
            .collect(
                &files_ns,
                FindRequest {
                    filter: document(json!({ "_id": id })),
                    limit: Some(1),
                    ..FindRequest::default()
                },
                options,
            )
            .await?;
        let file = files.into_iter().next().ok_or_else(|| file_not_found(id))?;
        let chunks = self
            .collect(
                &chunks_ns,
                FindRequest {
                    filter: document(json!({ "files_id": id })),
                    sort: Some(document(json!({ "n": 1 }))),
                    ..FindRequest::default()
                },
                options,
            )
            .await?;
        assemble_file(id, &file, &chunks)
    }

    async fn delete_file(
        &self,
        database: &str,
        bucket: &BucketOptions,
        id: &Value,
        options: &CallOptions,
    ) -> DriverResult<()> {
        let call = bucket_call(bucket, options);
        let (files_ns, chunks_ns) = bucket_namespaces(database, bucket);
        let deleted = self
            .delete(
                &files_ns,
                DeleteRequest {
                    filter: document(json!({ "_id": id })),
                    multi: false,
                    hint: None,
                },
                &call,
            )
            .await?;
        self.delete(
            &chunks_ns,
            DeleteRequest {
                filter: document(json!({ "files_id": id })),
                multi: true,
                hint: None,
            },
            &call,
        )
        .await?;
        if deleted.deleted_count == 0 {
            return Err(file_not_found(id));
        }
        Ok(())
    }

    async fn start_session(&self, options: SessionOptions) -> DriverResult<Arc<dyn Session>> {
        if self.core.is_closed() {
            return Err(DriverError::Closed {
                what: "client".to_string(),
            });
        }
        if options.snapshot == Some(true) && options.causal_consistency == Some(true) {
            return Err(DriverError::invalid_argument(
                "causalConsistency and snapshot cannot both be enabled",
            ));
        }
        let session = Arc::new(MemorySession::new(self.core.clone(), new_lsid(), options));
        {
            let mut state = self.core.server.state.lock();
            state.sessions.push(Arc::downgrade(session.shared()));
            state.stats.sessions_started += 1;
        }
        Ok(session)
    }

    fn topology(&self) -> TopologyDescription {
        TopologyDescription {
            topology_type: self.core.server.profile.topology,
            shards_are_replica_sets: self.core.server.profile.shards_are_replica_sets,
        }
    }

    fn connections_checked_out(&self) -> u32 {
        self.core.pool.lock().checked_out
    }

    async fn close(&self) -> DriverResult<()> {
        let idle = {
            let mut pool = self.core.pool.lock();
            if pool.closed {
                return Ok(());
            }
            pool.closed = true;
            std::mem::take(&mut pool.idle)
        };
        for connection_id in idle {
            self.core.emit_cmap(CmapEvent::ConnectionClosed {
                connection_id,
                reason: ConnectionClosedReason::PoolClosed,
                service_id: self.core.server.service_id.clone(),
            });
        }
        self.core.emit_cmap(CmapEvent::PoolClosed);
        self.core.server.state.lock().stats.clients_closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_id_prepends_object_id() {
        let doc = with_id(document(json!({ "x": 1 })), new_object_id);
        assert_eq!(doc.keys().next().map(String::as_str), Some("_id"));
        assert!(doc["_id"].get("$oid").is_some());
    }

    #[test]
    fn lsid_is_uuid_binary() {
        let lsid = new_lsid();
        assert_eq!(lsid["id"]["$binary"]["subType"], json!("04"));
        let bytes = STANDARD.decode(lsid["id"]["$binary"]["base64"].as_str().unwrap()).unwrap();
        assert_eq!(bytes.len(), 16);
    }
}
