use serde_json::{json, Value};
use unified_driver::{
    AggregateOptions, AggregateTarget, FindAndModifyAction, FindAndModifyRequest, FindRequest,
};

use super::args::{delete_request, replace_request, update_request, write_model, Args};
use super::{drain, serialized, OperationResult};
use crate::entities::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};

pub async fn insert_one(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let document = args.document("document")?;
    let result = coll.client.insert_one(&coll.ns, document, &call).await?;
    serialized(&result)
}

pub async fn insert_many(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let documents = args.documents("documents")?;
    let ordered = args.opt_bool("ordered")?.unwrap_or(true);
    let result = coll.client.insert_many(&coll.ns, documents, ordered, &call).await?;
    serialized(&result)
}

pub async fn update(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
    multi: bool,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let request = update_request(&mut args, multi)?;
    let result = coll.client.update(&coll.ns, request, &call).await?;
    serialized(&result)
}

pub async fn replace_one(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let request = replace_request(&mut args)?;
    let result = coll.client.replace_one(&coll.ns, request, &call).await?;
    serialized(&result)
}

pub async fn delete(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
    multi: bool,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let request = delete_request(&mut args, multi)?;
    let result = coll.client.delete(&coll.ns, request, &call).await?;
    serialized(&result)
}

pub async fn bulk_write(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let models = match args.required("requests")? {
        Value::Array(requests) => requests
            .into_iter()
            .map(write_model)
            .collect::<RunnerResult<Vec<_>>>()?,
        other => {
            return Err(RunnerError::configuration(format!(
                "bulkWrite: requests must be an array, got {}",
                other
            )))
        }
    };
    let ordered = args.opt_bool("ordered")?.unwrap_or(true);
    let result = coll.client.bulk_write(&coll.ns, models, ordered, &call).await?;
    serialized(&result)
}

fn find_request(args: &mut Args) -> RunnerResult<FindRequest> {
    Ok(FindRequest {
        filter: args.document_or_empty("filter")?,
        sort: args.opt_document("sort")?,
        projection: args.opt_document("projection")?,
        skip: args.opt_u64("skip")?,
        limit: args.opt_i64("limit")?,
        batch_size: args.opt_u32("batchSize")?,
        comment: args.take("comment"),
    })
}

pub async fn find(entities: &EntityMap, object: &str, mut args: Args) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let request = find_request(&mut args)?;
    let cursor = coll.client.find(&coll.ns, request, &call).await?;
    drain(cursor).await
}

pub async fn create_find_cursor(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let request = find_request(&mut args)?;
    let cursor = coll.client.find(&coll.ns, request, &call).await?;
    Ok(OperationResult::Cursor(cursor))
}

/// Which `findOneAnd*` variant is running.
#[derive(Debug, Clone, Copy)]
pub enum Modify {
    Update,
    Replace,
    Delete,
}

pub async fn find_one_and_modify(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
    modify: Modify,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let filter = args.document("filter")?;
    let action = match modify {
        Modify::Update => FindAndModifyAction::Update(args.update()?),
        Modify::Replace => FindAndModifyAction::Replace(args.document("replacement")?),
        Modify::Delete => FindAndModifyAction::Remove,
    };
    let return_new = match args.opt_string("returnDocument")?.as_deref() {
        None | Some("Before") => false,
        Some("After") => true,
        Some(other) => {
            return Err(RunnerError::configuration(format!(
                "unknown returnDocument '{}'",
                other
            )))
        }
    };
    let request = FindAndModifyRequest {
        filter,
        action,
        sort: args.opt_document("sort")?,
        projection: args.opt_document("projection")?,
        upsert: args.opt_bool("upsert")?.unwrap_or(false),
        return_new,
    };
    let document = coll.client.find_and_modify(&coll.ns, request, &call).await?;
    Ok(OperationResult::Value(document.map_or(Value::Null, Value::Object)))
}

pub async fn aggregate(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let (client, target, options) = match entities.get(object)? {
        Entity::Collection(c) => (&c.client, AggregateTarget::Collection(c.ns.clone()), &c.options),
        Entity::Database(d) => (&d.client, AggregateTarget::Database(d.name.clone()), &d.options),
        other => {
            return Err(RunnerError::configuration(format!(
                "aggregate: '{}' is a {}, expected a collection or database",
                object,
                other.kind()
            )))
        }
    };
    let call = args.call_options(entities, options)?;
    let pipeline = args.documents("pipeline")?;
    let aggregate_options = AggregateOptions {
        batch_size: args.opt_u32("batchSize")?,
        allow_disk_use: args.opt_bool("allowDiskUse")?,
        let_vars: args.opt_document("let")?,
        comment: args.take("comment"),
    };
    let cursor = client.aggregate(target, pipeline, aggregate_options, &call).await?;
    drain(cursor).await
}

pub async fn count_documents(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let filter = args.document("filter")?;
    let count = coll.client.count_documents(&coll.ns, filter, &call).await?;
    Ok(OperationResult::Value(json!(count)))
}

pub async fn estimated_document_count(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let count = coll.client.estimated_document_count(&coll.ns, &call).await?;
    Ok(OperationResult::Value(json!(count)))
}

pub async fn distinct(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let field = args.string("fieldName")?;
    let filter = args.document_or_empty("filter")?;
    let values = coll.client.distinct(&coll.ns, &field, filter, &call).await?;
    Ok(OperationResult::Value(Value::Array(values)))
}
