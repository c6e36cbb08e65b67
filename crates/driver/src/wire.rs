//! Command documents shared by every [`Client`](crate::Client)
//! implementation: write batching, `q`/`u` entries, bucket file layout and
//! the validation a driver does before anything is sent.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult};
use crate::options::{BucketOptions, CallOptions, HandleOptions, UpdateModifications, WriteModel};
use crate::results::{BulkWriteResult, UpdateResult};
use crate::{Document, Namespace};

pub(crate) fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn is_write_command(name: &str) -> bool {
    matches!(
        name,
        "insert"
            | "update"
            | "delete"
            | "findAndModify"
            | "create"
            | "drop"
            | "dropDatabase"
            | "createIndexes"
            | "dropIndexes"
            | "renameCollection"
    )
}

fn is_read_command(name: &str) -> bool {
    matches!(name, "find" | "aggregate" | "count" | "distinct")
}

/// Add the handle's write concern to write commands and its read concern to
/// reads, unless the command already carries one. Not for commands inside a
/// transaction.
pub(crate) fn apply_concerns(command: &mut Document, name: &str, handle: &HandleOptions) {
    if is_write_command(name) && !command.contains_key("writeConcern") {
        if let Some(wc) = &handle.write_concern {
            let wc = wc.to_document();
            if !wc.is_empty() {
                command.insert("writeConcern".to_string(), Value::Object(wc));
            }
        }
    }
    if is_read_command(name) && !command.contains_key("readConcern") {
        if let Some(rc) = &handle.read_concern {
            command.insert("readConcern".to_string(), json!({ "level": rc.level }));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BatchKind {
    Insert,
    Update,
    Delete,
}

pub(crate) fn batch_kind(model: &WriteModel) -> BatchKind {
    match model {
        WriteModel::InsertOne(_) => BatchKind::Insert,
        WriteModel::UpdateOne(_) | WriteModel::UpdateMany(_) | WriteModel::ReplaceOne(_) => {
            BatchKind::Update
        }
        WriteModel::DeleteOne(_) | WriteModel::DeleteMany(_) => BatchKind::Delete,
    }
}

/// Group consecutive models of the same kind, remembering each model's index.
pub(crate) fn batches(models: Vec<WriteModel>) -> Vec<Vec<(usize, WriteModel)>> {
    let mut out: Vec<Vec<(usize, WriteModel)>> = Vec::new();
    for (index, model) in models.into_iter().enumerate() {
        match out.last_mut() {
            Some(batch) if batch_kind(&batch[0].1) == batch_kind(&model) => {
                batch.push((index, model))
            }
            _ => out.push(vec![(index, model)]),
        }
    }
    out
}

impl BatchKind {
    /// Command name and the field carrying the batch's entries.
    pub(crate) fn command(self) -> (&'static str, &'static str) {
        match self {
            BatchKind::Insert => ("insert", "documents"),
            BatchKind::Update => ("update", "updates"),
            BatchKind::Delete => ("delete", "deletes"),
        }
    }
}

/// The `insert`/`update`/`delete` command for one batch of same-kind models.
pub(crate) fn write_command(ns: &Namespace, batch: &[(usize, WriteModel)], ordered: bool) -> Document {
    let (command_name, field) = batch
        .first()
        .map(|(_, m)| batch_kind(m).command())
        .unwrap_or(("insert", "documents"));
    let entries: Vec<Value> = batch.iter().map(|(_, m)| wire_entry(m)).collect();
    let mut command = Document::new();
    command.insert(command_name.to_string(), json!(ns.coll));
    command.insert(field.to_string(), Value::Array(entries));
    command.insert("ordered".to_string(), json!(ordered));
    command
}

pub(crate) fn validate_update(update: &UpdateModifications) -> DriverResult<()> {
    if let UpdateModifications::Document(doc) = update {
        if doc.is_empty() || !doc.keys().all(|k| k.starts_with('$')) {
            return Err(DriverError::invalid_argument(
                "update document must contain only atomic operators",
            ));
        }
    }
    Ok(())
}

pub(crate) fn validate_replacement(replacement: &Document) -> DriverResult<()> {
    if replacement.keys().any(|k| k.starts_with('$')) {
        return Err(DriverError::invalid_argument(
            "replacement document must not contain atomic operators",
        ));
    }
    Ok(())
}

pub(crate) fn validate_model(model: &WriteModel) -> DriverResult<()> {
    match model {
        WriteModel::UpdateOne(r) | WriteModel::UpdateMany(r) => validate_update(&r.update),
        WriteModel::ReplaceOne(r) => validate_replacement(&r.replacement),
        _ => Ok(()),
    }
}

pub(crate) fn wire_entry(model: &WriteModel) -> Value {
    match model {
        WriteModel::InsertOne(doc) => Value::Object(doc.clone()),
        WriteModel::UpdateOne(r) | WriteModel::UpdateMany(r) => {
            let mut entry = document(json!({
                "q": r.filter,
                "u": r.update.to_json(),
                "multi": matches!(model, WriteModel::UpdateMany(_)) || r.multi,
                "upsert": r.upsert,
            }));
            if let Some(filters) = &r.array_filters {
                entry.insert("arrayFilters".to_string(), json!(filters));
            }
            if let Some(hint) = &r.hint {
                entry.insert("hint".to_string(), hint.clone());
            }
            Value::Object(entry)
        }
        WriteModel::ReplaceOne(r) => {
            let mut entry = document(json!({
                "q": r.filter,
                "u": r.replacement,
                "multi": false,
                "upsert": r.upsert,
            }));
            if let Some(hint) = &r.hint {
                entry.insert("hint".to_string(), hint.clone());
            }
            Value::Object(entry)
        }
        WriteModel::DeleteOne(r) | WriteModel::DeleteMany(r) => {
            let limit = if matches!(model, WriteModel::DeleteOne(_)) { 1 } else { 0 };
            let mut entry = document(json!({ "q": r.filter, "limit": limit }));
            if let Some(hint) = &r.hint {
                entry.insert("hint".to_string(), hint.clone());
            }
            Value::Object(entry)
        }
    }
}

/// Give an insert its `_id` before it is sent, as drivers do.
pub(crate) fn with_id(doc: Document, new_id: impl FnOnce() -> Value) -> Document {
    if doc.contains_key("_id") {
        return doc;
    }
    let mut out = Document::new();
    out.insert("_id".to_string(), new_id());
    out.extend(doc);
    out
}

// ── Buckets ──────────────────────────────────────────────────────────────────

/// The `<bucket>.files` and `<bucket>.chunks` namespaces.
pub(crate) fn bucket_namespaces(database: &str, bucket: &BucketOptions) -> (Namespace, Namespace) {
    (
        Namespace::new(database, format!("{}.files", bucket.bucket_name)),
        Namespace::new(database, format!("{}.chunks", bucket.bucket_name)),
    )
}

/// Call options for bucket writes: the bucket's write concern wins.
pub(crate) fn bucket_call(bucket: &BucketOptions, options: &CallOptions) -> CallOptions {
    let mut call = options.clone();
    if let Some(wc) = &bucket.write_concern {
        call.handle.write_concern = Some(wc.clone());
    }
    call
}

fn binary(bytes: &[u8]) -> Value {
    json!({ "$binary": { "base64": STANDARD.encode(bytes), "subType": "00" } })
}

fn decode_binary(value: Option<&Value>) -> DriverResult<Vec<u8>> {
    let encoded = value
        .and_then(|v| v.get("$binary"))
        .and_then(|b| b.get("base64"))
        .and_then(Value::as_str)
        .ok_or_else(|| DriverError::Bucket {
            message: "chunk data is not binary".to_string(),
        })?;
    STANDARD.decode(encoded).map_err(|e| DriverError::Bucket {
        message: format!("chunk data is not valid base64: {}", e),
    })
}

pub(crate) fn file_not_found(id: &Value) -> DriverError {
    DriverError::Bucket {
        message: format!("FileNotFound: file not found for id {}", id),
    }
}

/// Chunk inserts for a new file.
pub(crate) fn chunk_models(
    id: &Value,
    bytes: &[u8],
    bucket: &BucketOptions,
    mut new_id: impl FnMut() -> Value,
) -> Vec<WriteModel> {
    bytes
        .chunks(bucket.chunk_size_bytes.max(1) as usize)
        .enumerate()
        .map(|(n, data)| {
            WriteModel::InsertOne(document(json!({
                "_id": new_id(),
                "files_id": id,
                "n": n,
                "data": binary(data),
            })))
        })
        .collect()
}

/// The files collection entry, written after every chunk.
pub(crate) fn file_document(
    id: &Value,
    bytes: &[u8],
    bucket: &BucketOptions,
    filename: &str,
    metadata: Option<Document>,
) -> Document {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let mut file = document(json!({
        "_id": id,
        "length": bytes.len(),
        "chunkSize": bucket.chunk_size_bytes.max(1),
        "uploadDate": { "$date": { "$numberLong": millis.to_string() } },
        "filename": filename,
    }));
    if let Some(metadata) = metadata {
        file.insert("metadata".to_string(), Value::Object(metadata));
    }
    file
}

/// Concatenate `chunks` (sorted by `n`), checking none is missing and the
/// total matches the file's `length`.
pub(crate) fn assemble_file(id: &Value, file: &Document, chunks: &[Document]) -> DriverResult<Vec<u8>> {
    let length = file.get("length").and_then(Value::as_u64).unwrap_or(0) as usize;
    let mut bytes = Vec::with_capacity(length);
    for (expected, chunk) in chunks.iter().enumerate() {
        let n = chunk.get("n").and_then(Value::as_u64);
        if n != Some(expected as u64) {
            return Err(DriverError::Bucket {
                message: format!("ChunkIsMissing: expected chunk {} of file {}", expected, id),
            });
        }
        bytes.extend(decode_binary(chunk.get("data"))?);
    }
    if bytes.len() != length {
        return Err(DriverError::Bucket {
            message: format!(
                "ChunkIsMissing: file {} has {} bytes of chunk data, expected {}",
                id,
                bytes.len(),
                length
            ),
        });
    }
    Ok(bytes)
}

pub(crate) fn bulk_error(err: DriverError, result: &BulkWriteResult) -> DriverError {
    match err {
        DriverError::Command {
            code,
            code_name,
            message,
            labels,
        } => DriverError::BulkWrite {
            code,
            code_name,
            message,
            labels,
            result: serde_json::to_value(result).unwrap_or(Value::Null),
        },
        other => other,
    }
}

pub(crate) fn update_result(result: BulkWriteResult) -> UpdateResult {
    UpdateResult {
        matched_count: result.matched_count,
        modified_count: result.modified_count,
        upserted_count: result.upserted_count,
        upserted_id: result.upserted_ids.into_values().next(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{DeleteRequest, ReadConcern, UpdateRequest, WriteConcern};

    #[test]
    fn batches_group_consecutive_kinds() {
        let insert = || WriteModel::InsertOne(Document::new());
        let delete = || {
            WriteModel::DeleteOne(DeleteRequest {
                filter: Document::new(),
                multi: false,
                hint: None,
            })
        };
        let grouped = batches(vec![insert(), insert(), delete(), insert()]);
        let shape: Vec<Vec<usize>> = grouped
            .iter()
            .map(|b| b.iter().map(|(i, _)| *i).collect())
            .collect();
        assert_eq!(shape, vec![vec![0, 1], vec![2], vec![3]]);
    }

    #[test]
    fn update_validation() {
        assert!(validate_update(&UpdateModifications::Document(document(json!({ "x": 1 })))).is_err());
        assert!(validate_update(&UpdateModifications::Document(document(json!({ "$set": { "x": 1 } })))).is_ok());
        assert!(validate_replacement(&document(json!({ "$set": {} }))).is_err());
    }

    #[test]
    fn write_wire_entries() {
        let update = WriteModel::UpdateMany(UpdateRequest {
            filter: document(json!({ "a": 1 })),
            update: UpdateModifications::Document(document(json!({ "$set": { "b": 2 } }))),
            multi: false,
            upsert: false,
            array_filters: None,
            hint: None,
        });
        assert_eq!(
            wire_entry(&update),
            json!({ "q": { "a": 1 }, "u": { "$set": { "b": 2 } }, "multi": true, "upsert": false })
        );
    }

    #[test]
    fn write_command_keeps_the_command_name_first() {
        let batch = vec![(0, WriteModel::InsertOne(document(json!({ "_id": 1 }))))];
        let command = write_command(&Namespace::new("db", "coll"), &batch, false);
        let keys: Vec<&str> = command.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["insert", "documents", "ordered"]);
        assert_eq!(command["ordered"], json!(false));
    }

    #[test]
    fn concerns_follow_the_command_kind() {
        let handle = HandleOptions {
            read_concern: Some(ReadConcern::local()),
            read_preference: None,
            write_concern: Some(WriteConcern::majority()),
        };
        let mut insert = document(json!({ "insert": "coll", "documents": [] }));
        apply_concerns(&mut insert, "insert", &handle);
        assert_eq!(insert["writeConcern"], json!({ "w": "majority" }));
        assert!(!insert.contains_key("readConcern"));

        let mut find = document(json!({ "find": "coll", "readConcern": { "level": "snapshot" } }));
        apply_concerns(&mut find, "find", &handle);
        assert_eq!(find["readConcern"], json!({ "level": "snapshot" }));
        assert!(!find.contains_key("writeConcern"));
    }

    #[test]
    fn with_id_keeps_an_existing_id() {
        let kept = with_id(document(json!({ "_id": 7, "x": 1 })), || json!(0));
        assert_eq!(kept["_id"], json!(7));
        let added = with_id(document(json!({ "x": 1 })), || json!(9));
        assert_eq!(added.keys().next().map(String::as_str), Some("_id"));
    }

    #[test]
    fn chunks_reassemble_and_gaps_are_detected() {
        let bucket = BucketOptions {
            chunk_size_bytes: 2,
            ..BucketOptions::default()
        };
        let id = json!(1);
        let bytes = b"hello".to_vec();
        let mut n = 0;
        let chunks: Vec<Document> = chunk_models(&id, &bytes, &bucket, || {
            n += 1;
            json!(n)
        })
        .into_iter()
        .filter_map(|m| match m {
            WriteModel::InsertOne(doc) => Some(doc),
            _ => None,
        })
        .collect();
        assert_eq!(chunks.len(), 3);
        let file = file_document(&id, &bytes, &bucket, "greeting", None);
        assert_eq!(file["chunkSize"], json!(2));
        assert_eq!(assemble_file(&id, &file, &chunks).unwrap(), bytes);

        let err = assemble_file(&id, &file, &[chunks[0].clone(), chunks[2].clone()]).unwrap_err();
        assert!(err.to_string().contains("ChunkIsMissing"));
    }
}
