use std::sync::Arc;

use async_trait::async_trait;
use bson::oid::ObjectId;
use mongodb::options::SessionOptions as MongoSessionOptions;
use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult, NAMESPACE_NOT_FOUND};
use crate::options::{
    AggregateOptions, BucketOptions, CallOptions, ChangeStreamOptions, DeleteRequest,
    FindAndModifyAction, FindAndModifyRequest, FindRequest, IndexOptions, ReplaceRequest,
    SessionOptions, TopologyDescription, UpdateRequest, WriteModel,
};
use crate::results::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::traits::{AggregateTarget, Client, Cursor, Session, WatchTarget};
use crate::wire::{
    assemble_file, batch_kind, batches, bucket_call, bucket_namespaces, bulk_error, chunk_models,
    document, file_document, file_not_found, update_result, validate_model, validate_replacement,
    validate_update, with_id, write_command, BatchKind,
};
use crate::{Document, Namespace};

use super::convert::{
    from_mongo_error, object_id_json, transaction_options, write_concern_error, write_errors,
};
use super::cursor::MongoCursor;
use super::{MongoCore, MongoSession};

fn new_object_id() -> Value {
    object_id_json(&ObjectId::new())
}

fn count_field(reply: &Document, field: &str) -> u64 {
    reply.get(field).and_then(Value::as_u64).unwrap_or(0)
}

/// A client connected to a [`MongoDeployment`](super::MongoDeployment).
pub struct MongoClient {
    core: Arc<MongoCore>,
}

impl MongoClient {
    pub(crate) fn new(core: Arc<MongoCore>) -> Self {
        MongoClient { core }
    }

    /// Cursors need one session for every `getMore`; borrow an implicit one
    /// when the caller did not supply a session.
    async fn cursor_call(&self, options: &CallOptions) -> DriverResult<CallOptions> {
        let mut call = options.clone();
        if call.session.is_none() {
            call.session = Some(self.start_session(SessionOptions::default()).await?);
        }
        Ok(call)
    }

    async fn open_cursor(
        &self,
        database: &str,
        command: Document,
        batch_size: Option<u32>,
        change_stream: bool,
        options: &CallOptions,
    ) -> DriverResult<MongoCursor> {
        let call = self.cursor_call(options).await?;
        let reply = self.core.command(database, command, &call, None).await?;
        MongoCursor::from_reply(self.core.clone(), &reply, batch_size, change_stream, call)
    }

    async fn drain(
        &self,
        database: &str,
        command: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>> {
        let mut cursor = self.open_cursor(database, command, None, false, options).await?;
        let mut docs = Vec::new();
        while let Some(doc) = cursor.next().await? {
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Send one write command and fold its reply into `result`. Write errors
    /// come back in the `Ok` slot; a write concern error fails the call.
    async fn write_batch(
        &self,
        ns: &Namespace,
        batch: Vec<(usize, WriteModel)>,
        ordered: bool,
        options: &CallOptions,
        result: &mut BulkWriteResult,
    ) -> DriverResult<Option<DriverError>> {
        let command = write_command(ns, &batch, ordered);
        let kind = batch_kind(&batch[0].1);
        let reply = self.core.command(&ns.db, command, options, None).await?;
        let n = count_field(&reply, "n");
        let errors = write_errors(&reply);
        let failed = |position: usize| errors.iter().any(|(p, _)| *p == position);
        let first_failure = errors.iter().map(|(p, _)| *p).min();

        match kind {
            BatchKind::Insert => {
                result.inserted_count += n;
                for (position, (index, model)) in batch.iter().enumerate() {
                    if ordered && first_failure.map_or(false, |f| position >= f) {
                        break;
                    }
                    if failed(position) {
                        continue;
                    }
                    if let WriteModel::InsertOne(doc) = model {
                        result
                            .inserted_ids
                            .insert(*index, doc.get("_id").cloned().unwrap_or(Value::Null));
                    }
                }
            }
            BatchKind::Update => {
                let upserted = reply
                    .get("upserted")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                for entry in &upserted {
                    let position = entry.get("index").and_then(Value::as_u64).unwrap_or(0) as usize;
                    if let Some((index, _)) = batch.get(position) {
                        let id = entry.get("_id").cloned().unwrap_or(Value::Null);
                        result.upserted_ids.insert(*index, id);
                    }
                }
                let upserted = upserted.len() as u64;
                result.upserted_count += upserted;
                result.matched_count += n.saturating_sub(upserted);
                result.modified_count += count_field(&reply, "nModified");
            }
            BatchKind::Delete => result.deleted_count += n,
        }

        if let Some(err) = write_concern_error(&reply) {
            return Err(err);
        }
        Ok(errors.into_iter().next().map(|(_, err)| err))
    }

    async fn run_writes(
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
            if let Some(err) = self.write_batch(ns, batch, ordered, options, &mut result).await? {
                first_error.get_or_insert(err);
                if ordered {
                    break;
                }
            }
        }
        Ok((result, first_error))
    }

    async fn single_write(
        &self,
        ns: &Namespace,
        model: WriteModel,
        options: &CallOptions,
    ) -> DriverResult<BulkWriteResult> {
        let (result, error) = self.run_writes(ns, vec![model], true, options).await?;
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

#[async_trait]
impl Client for MongoClient {
    async fn run_command(
        &self,
        database: &str,
        command: Document,
        options: &CallOptions,
    ) -> DriverResult<Document> {
        if command.is_empty() {
            return Err(DriverError::invalid_argument(
                "command document must not be empty",
            ));
        }
        self.core.command(database, command, options, None).await
    }

    async fn insert_one(
        &self,
        ns: &Namespace,
        document: Document,
        options: &CallOptions,
    ) -> DriverResult<InsertOneResult> {
        let document = with_id(document, new_object_id);
        let inserted_id = document.get("_id").cloned().unwrap_or(Value::Null);
        self.single_write(ns, WriteModel::InsertOne(document), options)
            .await?;
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
        let (result, error) = self.run_writes(ns, models, ordered, options).await?;
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
        self.single_write(ns, model, options).await.map(update_result)
    }

    async fn replace_one(
        &self,
        ns: &Namespace,
        request: ReplaceRequest,
        options: &CallOptions,
    ) -> DriverResult<UpdateResult> {
        self.single_write(ns, WriteModel::ReplaceOne(request), options)
            .await
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
        let result = self.single_write(ns, model, options).await?;
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
        let (result, error) = self.run_writes(ns, models, ordered, options).await?;
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
        let cursor = self
            .open_cursor(&ns.db, command, request.batch_size, false, options)
            .await?;
        Ok(Box::new(cursor))
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
        let reply = self.core.command(&ns.db, command, options, None).await?;
        if let Some(err) = write_concern_error(&reply) {
            return Err(err);
        }
        Ok(reply.get("value").and_then(Value::as_object).cloned())
    }

    async fn aggregate(
        &self,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        aggregate_options: AggregateOptions,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>> {
        let (database, aggregate_field) = match &target {
            AggregateTarget::Database(db) => (db.clone(), json!(1)),
            AggregateTarget::Collection(ns) => (ns.db.clone(), json!(ns.coll)),
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
        let cursor = self
            .open_cursor(&database, command, aggregate_options.batch_size, false, options)
            .await?;
        Ok(Box::new(cursor))
    }

    async fn count_documents(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<u64> {
        let command = document(json!({
            "aggregate": ns.coll,
            "pipeline": [
                { "$match": filter },
                { "$group": { "_id": 1, "n": { "$sum": 1 } } },
            ],
            "cursor": {},
        }));
        let docs = self.drain(&ns.db, command, options).await?;
        Ok(docs.first().map_or(0, |d| count_field(d, "n")))
    }

    async fn estimated_document_count(
        &self,
        ns: &Namespace,
        options: &CallOptions,
    ) -> DriverResult<u64> {
        let command = document(json!({ "count": ns.coll }));
        let reply = self.core.command(&ns.db, command, options, None).await?;
        Ok(count_field(&reply, "n"))
    }

    async fn distinct(
        &self,
        ns: &Namespace,
        field: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Value>> {
        let command = document(json!({ "distinct": ns.coll, "key": field, "query": filter }));
        let reply = self.core.command(&ns.db, command, options, None).await?;
        Ok(reply
            .get("values")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
        collection_options: Document,
        options: &CallOptions,
    ) -> DriverResult<()> {
        let mut command = document(json!({ "create": name }));
        command.extend(collection_options);
        self.core.command(database, command, options, None).await?;
        Ok(())
    }

    async fn drop_collection(&self, ns: &Namespace, options: &CallOptions) -> DriverResult<()> {
        let command = document(json!({ "drop": ns.coll }));
        match self.core.command(&ns.db, command, options, None).await {
            Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn list_collections(
        &self,
        database: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>> {
        let command = document(json!({ "listCollections": 1, "filter": filter }));
        self.drain(database, command, options).await
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
        let reply = self.core.command("admin", command, options, None).await?;
        Ok(reply
            .get("databases")
            .and_then(Value::as_array)
            .map(|dbs| dbs.iter().filter_map(Value::as_object).cloned().collect())
            .unwrap_or_default())
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
        let mut index = document(json!({ "key": keys, "name": name }));
        if index_options.unique == Some(true) {
            index.insert("unique".to_string(), json!(true));
        }
        let command = document(json!({ "createIndexes": ns.coll, "indexes": [index] }));
        let reply = self.core.command(&ns.db, command, options, None).await?;
        if let Some(err) = write_concern_error(&reply) {
            return Err(err);
        }
        Ok(name)
    }

    async fn list_indexes(&self, ns: &Namespace, options: &CallOptions) -> DriverResult<Vec<Document>> {
        let command = document(json!({ "listIndexes": ns.coll, "cursor": {} }));
        self.drain(&ns.db, command, options).await
    }

    async fn rename_collection(
        &self,
        ns: &Namespace,
        to: &str,
        drop_target: bool,
        options: &CallOptions,
    ) -> DriverResult<()> {
        let command = document(json!({
            "renameCollection": ns.to_string(),
            "to": Namespace::new(ns.db.clone(), to).to_string(),
            "dropTarget": drop_target,
        }));
        self.core.command("admin", command, options, None).await?;
        Ok(())
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
        full_pipeline.extend(pipeline.into_iter().map(Value::Object));

        let (database, aggregate_field) = match &target {
            WatchTarget::Cluster => ("admin".to_string(), json!(1)),
            WatchTarget::Database(db) => (db.clone(), json!(1)),
            WatchTarget::Collection(ns) => (ns.db.clone(), json!(ns.coll)),
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
        let cursor = self
            .open_cursor(&database, command, stream_options.batch_size, true, options)
            .await?;
        Ok(Box::new(cursor))
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
            let (_, error) = self.run_writes(&chunks_ns, chunks, true, &call).await?;
            if let Some(err) = error {
                return Err(err);
            }
        }
        let file = file_document(&id, &bytes, bucket, filename, metadata);
        self.single_write(&files_ns, WriteModel::InsertOne(file), &call)
            .await?;
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
        if options.snapshot == Some(true) && options.causal_consistency == Some(true) {
            return Err(DriverError::invalid_argument(
                "causalConsistency and snapshot cannot both be enabled",
            ));
        }
        let client = self.core.client()?;
        let mongo_options = MongoSessionOptions::builder()
            .causal_consistency(options.causal_consistency)
            .snapshot(options.snapshot)
            .default_transaction_options(
                options.default_transaction_options.as_ref().map(transaction_options),
            )
            .build();
        let inner = client
            .start_session(mongo_options)
            .await
            .map_err(from_mongo_error)?;
        Ok(Arc::new(MongoSession::new(self.core.clone(), inner, options)))
    }

    fn topology(&self) -> TopologyDescription {
        self.core.topology.clone()
    }

    fn connections_checked_out(&self) -> u32 {
        self.core.bridge.checked_out()
    }

    async fn close(&self) -> DriverResult<()> {
        // Dropping the last handle closes the driver's pools.
        if self.core.client.lock().take().is_some() {
            tracing::debug!("closed live client");
        }
        Ok(())
    }
}
