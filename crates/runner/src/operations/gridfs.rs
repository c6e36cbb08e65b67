//! Bucket operations. File contents are exchanged as `$binary` values.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};

use super::args::Args;
use super::OperationResult;
use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};
use crate::matching::decode_hex;

/// Bytes named by an upload `source`: `{"$$hexBytes": "..."}` or the id of a stream entity.
fn source_bytes(entities: &EntityMap, source: Value) -> RunnerResult<Vec<u8>> {
    match source {
        Value::String(id) => Ok(entities.stream(&id)?.clone()),
        Value::Object(map) => match map.get("$$hexBytes").and_then(Value::as_str) {
            Some(hex) => decode_hex(hex).map_err(RunnerError::Configuration),
            None => Err(RunnerError::configuration(
                "upload: source document must be {\"$$hexBytes\": ...}",
            )),
        },
        other => Err(RunnerError::configuration(format!(
            "upload: invalid source {}",
            other
        ))),
    }
}

pub async fn upload(entities: &EntityMap, object: &str, mut args: Args) -> RunnerResult<OperationResult> {
    let bucket = entities.bucket(object)?;
    let call = args.call_options(entities, &bucket.options)?;
    let bytes = source_bytes(entities, args.required("source")?)?;
    let filename = args.string("filename")?;
    let metadata = args.opt_document("metadata")?;
    let mut settings = bucket.bucket.clone();
    if let Some(size) = args.opt_u32("chunkSizeBytes")? {
        settings.chunk_size_bytes = size;
    }
    let id = bucket
        .client
        .upload(&bucket.database, &settings, &filename, bytes, metadata, &call)
        .await?;
    Ok(OperationResult::Value(id))
}

pub async fn download(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let bucket = entities.bucket(object)?;
    let call = args.call_options(entities, &bucket.options)?;
    let id = args.required("id")?;
    let bytes = bucket
        .client
        .download(&bucket.database, &bucket.bucket, &id, &call)
        .await?;
    Ok(OperationResult::Value(json!({
        "$binary": { "base64": STANDARD.encode(bytes), "subType": "00" }
    })))
}

pub async fn delete(entities: &EntityMap, object: &str, mut args: Args) -> RunnerResult<OperationResult> {
    let bucket = entities.bucket(object)?;
    let call = args.call_options(entities, &bucket.options)?;
    let id = args.required("id")?;
    bucket
        .client
        .delete_file(&bucket.database, &bucket.bucket, &id, &call)
        .await?;
    Ok(OperationResult::None)
}
