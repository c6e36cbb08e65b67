//! Typed access to an operation's `arguments` document.

use std::sync::Arc;

use serde_json::Value;
use unified_driver::{
    CallOptions, DeleteRequest, Document, HandleOptions, ReplaceRequest, Session,
    UpdateModifications, UpdateRequest, WriteModel,
};

use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};

/// Arguments of one operation. Getters remove what they read.
pub struct Args {
    operation: &'static str,
    doc: Document,
}

impl Args {
    pub fn new(operation: &'static str, arguments: Option<&Document>) -> Self {
        Args {
            operation,
            doc: arguments.cloned().unwrap_or_default(),
        }
    }

    fn invalid(&self, key: &str, expected: &str, got: &Value) -> RunnerError {
        RunnerError::configuration(format!(
            "{}: argument '{}' must be {}, got {}",
            self.operation, key, expected, got
        ))
    }

    fn missing(&self, key: &str) -> RunnerError {
        RunnerError::configuration(format!("{}: missing argument '{}'", self.operation, key))
    }

    pub fn take(&mut self, key: &str) -> Option<Value> {
        self.doc.remove(key)
    }

    pub fn required(&mut self, key: &str) -> RunnerResult<Value> {
        self.take(key).ok_or_else(|| self.missing(key))
    }

    pub fn document(&mut self, key: &str) -> RunnerResult<Document> {
        match self.required(key)? {
            Value::Object(d) => Ok(d),
            other => Err(self.invalid(key, "a document", &other)),
        }
    }

    pub fn opt_document(&mut self, key: &str) -> RunnerResult<Option<Document>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Object(d)) => Ok(Some(d)),
            Some(other) => Err(self.invalid(key, "a document", &other)),
        }
    }

    /// A document that defaults to empty, such as a filter.
    pub fn document_or_empty(&mut self, key: &str) -> RunnerResult<Document> {
        Ok(self.opt_document(key)?.unwrap_or_default())
    }

    pub fn documents(&mut self, key: &str) -> RunnerResult<Vec<Document>> {
        match self.required(key)? {
            Value::Array(items) => items
                .into_iter()
                .map(|v| match v {
                    Value::Object(d) => Ok(d),
                    other => Err(self.invalid(key, "an array of documents", &other)),
                })
                .collect(),
            other => Err(self.invalid(key, "an array of documents", &other)),
        }
    }

    pub fn string(&mut self, key: &str) -> RunnerResult<String> {
        match self.required(key)? {
            Value::String(s) => Ok(s),
            other => Err(self.invalid(key, "a string", &other)),
        }
    }

    pub fn opt_string(&mut self, key: &str) -> RunnerResult<Option<String>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(self.invalid(key, "a string", &other)),
        }
    }

    pub fn opt_bool(&mut self, key: &str) -> RunnerResult<Option<bool>> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(b)),
            Some(other) => Err(self.invalid(key, "a boolean", &other)),
        }
    }

    pub fn opt_i64(&mut self, key: &str) -> RunnerResult<Option<i64>> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v.as_i64().map(Some).ok_or_else(|| self.invalid(key, "an integer", &v)),
        }
    }

    pub fn opt_u64(&mut self, key: &str) -> RunnerResult<Option<u64>> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a non-negative integer", &v)),
        }
    }

    pub fn opt_u32(&mut self, key: &str) -> RunnerResult<Option<u32>> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .and_then(|n| u32::try_from(n).ok())
                .map(Some)
                .ok_or_else(|| self.invalid(key, "a non-negative integer", &v)),
        }
    }

    /// The session named by the `session` argument, if any.
    pub fn session(&mut self, entities: &EntityMap) -> RunnerResult<Option<Arc<dyn Session>>> {
        match self.opt_string("session")? {
            Some(id) => Ok(Some(entities.session(&id)?.session.clone())),
            None => Ok(None),
        }
    }

    /// Call options for a handle with `handle` settings, in the named session.
    pub fn call_options(
        &mut self,
        entities: &EntityMap,
        handle: &HandleOptions,
    ) -> RunnerResult<CallOptions> {
        Ok(CallOptions {
            session: self.session(entities)?,
            handle: handle.clone(),
        })
    }

    /// `update` as either an operator document or a pipeline.
    pub fn update(&mut self) -> RunnerResult<UpdateModifications> {
        update_modifications(self.operation, self.required("update")?)
    }

    /// Remaining arguments, for options passed through verbatim.
    pub fn into_rest(self) -> Document {
        self.doc
    }
}

fn update_modifications(operation: &str, value: Value) -> RunnerResult<UpdateModifications> {
    match value {
        Value::Object(d) => Ok(UpdateModifications::Document(d)),
        Value::Array(stages) => stages
            .into_iter()
            .map(|s| match s {
                Value::Object(d) => Ok(d),
                other => Err(RunnerError::configuration(format!(
                    "{}: pipeline stage must be a document, got {}",
                    operation, other
                ))),
            })
            .collect::<RunnerResult<Vec<_>>>()
            .map(UpdateModifications::Pipeline),
        other => Err(RunnerError::configuration(format!(
            "{}: update must be a document or pipeline, got {}",
            operation, other
        ))),
    }
}

/// An update request from `filter`, `update`, `upsert`, `arrayFilters` and `hint`.
pub fn update_request(args: &mut Args, multi: bool) -> RunnerResult<UpdateRequest> {
    Ok(UpdateRequest {
        filter: args.document("filter")?,
        update: args.update()?,
        multi,
        upsert: args.opt_bool("upsert")?.unwrap_or(false),
        array_filters: match args.take("arrayFilters") {
            Some(Value::Array(items)) => Some(
                items
                    .into_iter()
                    .filter_map(|v| v.as_object().cloned())
                    .collect(),
            ),
            _ => None,
        },
        hint: args.take("hint"),
    })
}

pub fn replace_request(args: &mut Args) -> RunnerResult<ReplaceRequest> {
    Ok(ReplaceRequest {
        filter: args.document("filter")?,
        replacement: args.document("replacement")?,
        upsert: args.opt_bool("upsert")?.unwrap_or(false),
        hint: args.take("hint"),
    })
}

pub fn delete_request(args: &mut Args, multi: bool) -> RunnerResult<DeleteRequest> {
    Ok(DeleteRequest {
        filter: args.document("filter")?,
        multi,
        hint: args.take("hint"),
    })
}

/// One entry of `bulkWrite`'s `requests`: `{<modelName>: {...}}`.
pub fn write_model(value: Value) -> RunnerResult<WriteModel> {
    let Value::Object(map) = value else {
        return Err(RunnerError::configuration(format!(
            "bulkWrite: request must be a document, got {}",
            value
        )));
    };
    let mut entries = map.into_iter();
    let (name, body) = match (entries.next(), entries.next()) {
        (Some(entry), None) => entry,
        _ => {
            return Err(RunnerError::configuration(
                "bulkWrite: request must have exactly one key",
            ))
        }
    };
    let body = match body {
        Value::Object(d) => d,
        other => {
            return Err(RunnerError::configuration(format!(
                "bulkWrite: {} must be a document, got {}",
                name, other
            )))
        }
    };
    let mut args = Args::new("bulkWrite", Some(&body));
    match name.as_str() {
        "insertOne" => Ok(WriteModel::InsertOne(args.document("document")?)),
        "updateOne" => Ok(WriteModel::UpdateOne(update_request(&mut args, false)?)),
        "updateMany" => Ok(WriteModel::UpdateMany(update_request(&mut args, true)?)),
        "replaceOne" => Ok(WriteModel::ReplaceOne(replace_request(&mut args)?)),
        "deleteOne" => Ok(WriteModel::DeleteOne(delete_request(&mut args, false)?)),
        "deleteMany" => Ok(WriteModel::DeleteMany(delete_request(&mut args, true)?)),
        other => Err(RunnerError::configuration(format!(
            "bulkWrite: unknown write model '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(v: Value) -> Args {
        Args::new("test", v.as_object())
    }

    #[test]
    fn getters_consume_arguments() {
        let mut a = args(json!({ "filter": { "x": 1 }, "limit": 2 }));
        assert_eq!(a.document("filter").unwrap(), *json!({ "x": 1 }).as_object().unwrap());
        assert_eq!(a.opt_i64("limit").unwrap(), Some(2));
        assert!(a.into_rest().is_empty());
    }

    #[test]
    fn missing_and_mistyped_arguments_are_configuration_errors() {
        let mut a = args(json!({ "filter": 3 }));
        let err = a.document("filter").unwrap_err().to_string();
        assert!(err.contains("must be a document"), "{}", err);
        let err = a.document("filter").unwrap_err().to_string();
        assert!(err.contains("missing argument 'filter'"), "{}", err);
    }

    #[test]
    fn update_accepts_pipelines() {
        let mut a = args(json!({ "filter": {}, "update": [{ "$set": { "x": 1 } }] }));
        let req = update_request(&mut a, false).unwrap();
        assert!(matches!(req.update, UpdateModifications::Pipeline(ref p) if p.len() == 1));
    }

    #[test]
    fn write_models_parse_by_name() {
        let model = write_model(json!({ "deleteMany": { "filter": { "x": 1 } } })).unwrap();
        assert!(matches!(model, WriteModel::DeleteMany(ref d) if d.multi));
        assert!(write_model(json!({ "upsertOne": {} })).is_err());
        assert!(write_model(json!({ "insertOne": { "document": {} }, "deleteOne": {} })).is_err());
    }
}
