//! Operation dispatch and expectation checking.
//!
//! Each [`OperationDescription`] is resolved against the entity map,
//! dispatched by name to one handler, and its outcome is checked against
//! `expectError` / `expectResult`. Operations run strictly one after the
//! other; nothing here spawns.

mod admin;
mod args;
mod crud;
mod cursor;
mod gridfs;
mod session;
mod test_runner;

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;
use unified_driver::{Client, Cursor, DriverError};
use unified_format::{ExpectedError, OperationDescription, OperationName};

use crate::entities::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};
use crate::matching::{assert_matches, resolve_placeholders};

use args::Args;

/// What a handler produced.
pub enum OperationResult {
    None,
    Value(Value),
    Cursor(Box<dyn Cursor>),
    ChangeStream(Box<dyn Cursor>),
}

impl OperationResult {
    fn value(&self) -> RunnerResult<Option<&Value>> {
        match self {
            OperationResult::None => Ok(None),
            OperationResult::Value(v) => Ok(Some(v)),
            OperationResult::Cursor(_) | OperationResult::ChangeStream(_) => Err(
                RunnerError::configuration("expectResult cannot be checked against a cursor"),
            ),
        }
    }

    async fn discard(self) {
        if let OperationResult::Cursor(mut c) | OperationResult::ChangeStream(mut c) = self {
            if let Err(err) = c.close().await {
                tracing::warn!(error = %err, "failed to close unsaved cursor");
            }
        }
    }
}

/// Serialize a driver result into a plain value.
pub(crate) fn serialized<T: Serialize>(result: &T) -> RunnerResult<OperationResult> {
    serde_json::to_value(result)
        .map(OperationResult::Value)
        .map_err(|e| RunnerError::configuration(format!("unserializable result: {}", e)))
}

/// Drain a cursor into an array, closing it afterwards.
pub(crate) async fn drain(mut cursor: Box<dyn Cursor>) -> RunnerResult<OperationResult> {
    let mut docs = Vec::new();
    let drained = async {
        while let Some(doc) = cursor.next().await? {
            docs.push(Value::Object(doc));
        }
        Ok::<_, DriverError>(())
    }
    .await;
    let closed = cursor.close().await;
    drained?;
    closed?;
    Ok(OperationResult::Value(Value::Array(docs)))
}

/// Runs a test's operations against its entity map.
pub struct OperationExecutor<'a> {
    entities: &'a mut EntityMap,
    util: &'a dyn Client,
    /// Names of fail points enabled so far, to be disabled at teardown.
    fail_points: &'a mut Vec<String>,
}

impl<'a> OperationExecutor<'a> {
    pub fn new(
        entities: &'a mut EntityMap,
        util: &'a dyn Client,
        fail_points: &'a mut Vec<String>,
    ) -> Self {
        OperationExecutor {
            entities,
            util,
            fail_points,
        }
    }

    /// Run one operation and check it against its expectations.
    pub async fn execute_and_check(&mut self, operation: &OperationDescription) -> RunnerResult<()> {
        let name = operation.name.as_str();
        tracing::trace!(operation = name, object = %operation.object, "executing operation");
        let outcome = self.dispatch(operation).await;

        if operation.ignore_result_and_error {
            return match outcome {
                Ok(result) => self.save_or_discard(operation, result).await,
                Err(err) => err.into_driver_error().map(|err| {
                    tracing::debug!(operation = name, error = %err, "ignored operation error");
                }),
            };
        }

        if let Some(expected) = &operation.expect_error {
            return match outcome {
                Ok(result) => {
                    result.discard().await;
                    Err(RunnerError::mismatch(format!(
                        "{}: expected error, got success",
                        name
                    )))
                }
                Err(err) => {
                    let err = err.into_driver_error()?;
                    check_error(name, expected, &err, self.entities)
                }
            };
        }

        let result = outcome.map_err(|err| match err {
            RunnerError::Driver(source) => RunnerError::Operation {
                operation: name.to_string(),
                source,
            },
            other => other,
        })?;

        if let Some(expected) = &operation.expect_result {
            let expected = resolve_placeholders(expected, self.entities)?;
            let checked = result
                .value()
                .and_then(|actual| assert_matches(&expected, actual, &format!("{} result", name)));
            if let Err(err) = checked {
                result.discard().await;
                return Err(err);
            }
        }
        self.save_or_discard(operation, result).await
    }

    /// Boxed entry point for operations nested inside other operations.
    fn execute_nested<'b>(
        &'b mut self,
        operation: &'b OperationDescription,
    ) -> Pin<Box<dyn Future<Output = RunnerResult<()>> + 'b>> {
        Box::pin(self.execute_and_check(operation))
    }

    async fn save_or_discard(
        &mut self,
        operation: &OperationDescription,
        result: OperationResult,
    ) -> RunnerResult<()> {
        let Some(id) = &operation.save_result_as_entity else {
            result.discard().await;
            return Ok(());
        };
        let entity = match result {
            OperationResult::Value(v) => Entity::Value(v),
            OperationResult::Cursor(c) => Entity::Cursor(c),
            OperationResult::ChangeStream(c) => Entity::ChangeStream(c),
            OperationResult::None => {
                return Err(RunnerError::configuration(format!(
                    "{} produced no result to save as '{}'",
                    operation.name.as_str(),
                    id
                )))
            }
        };
        self.entities.insert(id, entity)?;
        tracing::debug!(id = %id, "saved operation result as entity");
        Ok(())
    }

    async fn dispatch(&mut self, operation: &OperationDescription) -> RunnerResult<OperationResult> {
        let name = operation.name;
        let object = operation.object.as_str();
        let args = Args::new(name.as_str(), operation.arguments.as_ref());
        let entities = &*self.entities;
        match name {
            // ── Collection CRUD ──
            OperationName::InsertOne => crud::insert_one(entities, object, args).await,
            OperationName::InsertMany => crud::insert_many(entities, object, args).await,
            OperationName::UpdateOne => crud::update(entities, object, args, false).await,
            OperationName::UpdateMany => crud::update(entities, object, args, true).await,
            OperationName::ReplaceOne => crud::replace_one(entities, object, args).await,
            OperationName::DeleteOne => crud::delete(entities, object, args, false).await,
            OperationName::DeleteMany => crud::delete(entities, object, args, true).await,
            OperationName::BulkWrite => crud::bulk_write(entities, object, args).await,
            OperationName::Find => crud::find(entities, object, args).await,
            OperationName::CreateFindCursor => crud::create_find_cursor(entities, object, args).await,
            OperationName::FindOneAndUpdate => {
                crud::find_one_and_modify(entities, object, args, crud::Modify::Update).await
            }
            OperationName::FindOneAndReplace => {
                crud::find_one_and_modify(entities, object, args, crud::Modify::Replace).await
            }
            OperationName::FindOneAndDelete => {
                crud::find_one_and_modify(entities, object, args, crud::Modify::Delete).await
            }
            OperationName::Aggregate => crud::aggregate(entities, object, args).await,
            OperationName::CountDocuments => crud::count_documents(entities, object, args).await,
            OperationName::EstimatedDocumentCount => {
                crud::estimated_document_count(entities, object, args).await
            }
            OperationName::Distinct => crud::distinct(entities, object, args).await,

            // ── Administration ──
            OperationName::RunCommand => admin::run_command(entities, object, args).await,
            OperationName::CreateCollection => admin::create_collection(entities, object, args).await,
            OperationName::DropCollection => admin::drop_collection(entities, object, args).await,
            OperationName::ListCollections => admin::list_collections(entities, object, args).await,
            OperationName::ListDatabases => admin::list_databases(entities, object, args).await,
            OperationName::CreateIndex => admin::create_index(entities, object, args).await,
            OperationName::ListIndexes => admin::list_indexes(entities, object, args).await,
            OperationName::Rename => admin::rename(entities, object, args).await,
            OperationName::CreateChangeStream => {
                admin::create_change_stream(entities, object, args).await
            }

            // ── Sessions ──
            OperationName::StartTransaction => session::start_transaction(entities, object, args),
            OperationName::CommitTransaction => session::commit_transaction(entities, object).await,
            OperationName::AbortTransaction => session::abort_transaction(entities, object).await,
            OperationName::EndSession => session::end_session(entities, object).await,
            OperationName::WithTransaction => self.with_transaction(object, args).await,

            // ── Cursors ──
            OperationName::IterateUntilDocumentOrError => {
                cursor::iterate_until_document_or_error(&mut *self.entities, object).await
            }
            OperationName::Close => cursor::close(&mut *self.entities, object).await,

            // ── Buckets ──
            OperationName::Upload => gridfs::upload(entities, object, args).await,
            OperationName::Download => gridfs::download(entities, object, args).await,
            OperationName::Delete => gridfs::delete(entities, object, args).await,

            // ── Test runner ──
            OperationName::FailPoint => {
                test_runner::expect_runner_object(name, object)?;
                let fail_point = test_runner::fail_point(entities, args).await?;
                self.fail_points.push(fail_point);
                Ok(OperationResult::None)
            }
            OperationName::TargetedFailPoint => {
                test_runner::expect_runner_object(name, object)?;
                let fail_point = test_runner::targeted_fail_point(entities, args).await?;
                self.fail_points.push(fail_point);
                Ok(OperationResult::None)
            }
            OperationName::AssertSessionTransactionState
            | OperationName::AssertSessionPinned
            | OperationName::AssertSessionUnpinned
            | OperationName::AssertSessionDirty
            | OperationName::AssertSessionNotDirty => {
                test_runner::expect_runner_object(name, object)?;
                test_runner::assert_session(name, entities, args)
            }
            OperationName::AssertSameLsidOnLastTwoCommands
            | OperationName::AssertDifferentLsidOnLastTwoCommands => {
                test_runner::expect_runner_object(name, object)?;
                test_runner::assert_lsids(name, entities, args)
            }
            OperationName::AssertCollectionExists | OperationName::AssertCollectionNotExists => {
                test_runner::expect_runner_object(name, object)?;
                test_runner::assert_collection(name, self.util, args).await
            }
            OperationName::AssertIndexExists | OperationName::AssertIndexNotExists => {
                test_runner::expect_runner_object(name, object)?;
                test_runner::assert_index(name, self.util, args).await
            }
            OperationName::AssertNumberConnectionsCheckedOut => {
                test_runner::expect_runner_object(name, object)?;
                test_runner::assert_connections_checked_out(entities, args)
            }
        }
    }
}

/// Check a driver error against every predicate of `expectError`.
fn check_error(
    operation: &str,
    expected: &ExpectedError,
    actual: &DriverError,
    entities: &EntityMap,
) -> RunnerResult<()> {
    let fail = |what: String| -> RunnerResult<()> {
        Err(RunnerError::mismatch(format!(
            "{}: {} (error was: {})",
            operation, what, actual
        )))
    };

    if expected.is_error == Some(false) {
        return fail("isError must be true when given".to_string());
    }
    if let Some(client_error) = expected.is_client_error {
        if actual.is_client_error() != client_error {
            return fail(format!("expected isClientError {}", client_error));
        }
    }
    if let Some(needle) = &expected.error_contains {
        if !actual.to_string().to_lowercase().contains(&needle.to_lowercase()) {
            return fail(format!("expected message containing '{}'", needle));
        }
    }
    if let Some(code) = expected.error_code {
        if actual.code() != Some(code) {
            return fail(format!("expected error code {}, got {:?}", code, actual.code()));
        }
    }
    if let Some(code_name) = &expected.error_code_name {
        if actual.code_name() != Some(code_name.as_str()) {
            return fail(format!(
                "expected code name {}, got {:?}",
                code_name,
                actual.code_name()
            ));
        }
    }
    for label in &expected.error_labels_contain {
        if !actual.has_label(label) {
            return fail(format!("expected error label {}", label));
        }
    }
    for label in &expected.error_labels_omit {
        if actual.has_label(label) {
            return fail(format!("unexpected error label {}", label));
        }
    }
    if let Some(expected_result) = &expected.expect_result {
        let expected_result = resolve_placeholders(expected_result, entities)?;
        assert_matches(
            &expected_result,
            actual.partial_result(),
            &format!("{} error result", operation),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn expected(v: Value) -> ExpectedError {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn error_predicates_are_all_checked() {
        let entities = EntityMap::default();
        let err = DriverError::command(11000, "DuplicateKey", "E11000 duplicate key error");
        let ok = expected(json!({
            "isClientError": false,
            "errorContains": "duplicate KEY",
            "errorCode": 11000,
            "errorCodeName": "DuplicateKey",
            "errorLabelsOmit": ["TransientTransactionError"]
        }));
        check_error("insertOne", &ok, &err, &entities).unwrap();

        for bad in [
            json!({ "isClientError": true }),
            json!({ "errorContains": "timeout" }),
            json!({ "errorCode": 11001 }),
            json!({ "errorCodeName": "BadValue" }),
            json!({ "errorLabelsContain": ["RetryableWriteError"] }),
        ] {
            let result = check_error("insertOne", &expected(bad.clone()), &err, &entities);
            assert!(matches!(result, Err(RunnerError::Mismatch(_))), "{}", bad);
        }
    }

    #[test]
    fn partial_results_are_matched() {
        let entities = EntityMap::default();
        let err = DriverError::BulkWrite {
            code: 11000,
            code_name: "DuplicateKey".to_string(),
            message: "E11000".to_string(),
            labels: Vec::new(),
            result: json!({ "insertedCount": 1 }),
        };
        check_error(
            "bulkWrite",
            &expected(json!({ "expectResult": { "insertedCount": 1 } })),
            &err,
            &entities,
        )
        .unwrap();
        assert!(check_error(
            "bulkWrite",
            &expected(json!({ "expectResult": { "insertedCount": 2 } })),
            &err,
            &entities,
        )
        .is_err());
    }
}
