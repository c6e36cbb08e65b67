use serde_json::{json, Value};
use unified_driver::{ChangeStreamOptions, IndexOptions, Namespace, WatchTarget};
use unified_format::ReadPreferenceSpec;

use super::args::Args;
use super::OperationResult;
use crate::entities::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};
use crate::options;

fn documents(docs: Vec<unified_driver::Document>) -> OperationResult {
    OperationResult::Value(Value::Array(docs.into_iter().map(Value::Object).collect()))
}

/// `runCommand` on a database. The reply is returned as is.
pub async fn run_command(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let db = entities.database(object)?;
    let mut handle = db.options.clone();
    if let Some(spec) = args.take("readPreference") {
        let spec: ReadPreferenceSpec = serde_json::from_value(spec)
            .map_err(|e| RunnerError::configuration(format!("runCommand: invalid readPreference: {}", e)))?;
        handle.read_preference = Some(options::read_preference(&spec)?);
    }
    let call = args.call_options(entities, &handle)?;
    let command = args.document("command")?;
    if let Some(name) = args.opt_string("commandName")? {
        if command.keys().next() != Some(&name) {
            return Err(RunnerError::configuration(format!(
                "runCommand: commandName '{}' is not the first key of the command",
                name
            )));
        }
    }
    let reply = db.client.run_command(&db.name, command, &call).await?;
    Ok(OperationResult::Value(Value::Object(reply)))
}

pub async fn create_collection(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let db = entities.database(object)?;
    let call = args.call_options(entities, &db.options)?;
    let name = args.string("collection")?;
    db.client
        .create_collection(&db.name, &name, args.into_rest(), &call)
        .await?;
    Ok(OperationResult::None)
}

pub async fn drop_collection(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let db = entities.database(object)?;
    let call = args.call_options(entities, &db.options)?;
    let name = args.string("collection")?;
    db.client
        .drop_collection(&Namespace::new(db.name.clone(), name), &call)
        .await?;
    Ok(OperationResult::None)
}

pub async fn list_collections(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let db = entities.database(object)?;
    let call = args.call_options(entities, &db.options)?;
    let filter = args.document_or_empty("filter")?;
    let collections = db.client.list_collections(&db.name, filter, &call).await?;
    Ok(documents(collections))
}

pub async fn list_databases(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let client = entities.client(object)?;
    let call = args.call_options(entities, &Default::default())?;
    let filter = args.document_or_empty("filter")?;
    let databases = client.client.list_databases(filter, &call).await?;
    Ok(documents(databases))
}

pub async fn create_index(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let keys = args.document("keys")?;
    let index_options = IndexOptions {
        name: args.opt_string("name")?,
        unique: args.opt_bool("unique")?,
    };
    let name = coll.client.create_index(&coll.ns, keys, index_options, &call).await?;
    Ok(OperationResult::Value(json!(name)))
}

pub async fn list_indexes(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let indexes = coll.client.list_indexes(&coll.ns, &call).await?;
    Ok(documents(indexes))
}

pub async fn rename(entities: &EntityMap, object: &str, mut args: Args) -> RunnerResult<OperationResult> {
    let coll = entities.collection(object)?;
    let call = args.call_options(entities, &coll.options)?;
    let to = args.string("to")?;
    let drop_target = args.opt_bool("dropTarget")?.unwrap_or(false);
    coll.client
        .rename_collection(&coll.ns, &to, drop_target, &call)
        .await?;
    Ok(OperationResult::None)
}

/// `createChangeStream` on a client, database or collection.
pub async fn create_change_stream(
    entities: &EntityMap,
    object: &str,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let (client, target, handle) = match entities.get(object)? {
        Entity::Client(c) => (&c.client, WatchTarget::Cluster, Default::default()),
        Entity::Database(d) => (&d.client, WatchTarget::Database(d.name.clone()), d.options.clone()),
        Entity::Collection(c) => (&c.client, WatchTarget::Collection(c.ns.clone()), c.options.clone()),
        other => {
            return Err(RunnerError::configuration(format!(
                "createChangeStream: '{}' is a {}, expected a client, database or collection",
                object,
                other.kind()
            )))
        }
    };
    let call = args.call_options(entities, &handle)?;
    let pipeline = args.documents("pipeline")?;
    let stream_options = ChangeStreamOptions {
        full_document: args.opt_string("fullDocument")?,
        batch_size: args.opt_u32("batchSize")?,
        resume_after: args.take("resumeAfter"),
    };
    let stream = client.watch(target, pipeline, stream_options, &call).await?;
    Ok(OperationResult::ChangeStream(stream))
}
