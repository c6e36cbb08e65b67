use std::time::Duration;

use serde_json::Value;
use unified_format::EntityKind;

use super::OperationResult;
use crate::entities::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};

/// A change stream is polled this many times before iteration gives up.
const CHANGE_STREAM_POLLS: u32 = 50;
const CHANGE_STREAM_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Next document of a cursor or change stream.
///
/// A find cursor that is exhausted yields `null`. A change stream waits
/// for the next change, bounded by a fixed number of polls.
pub async fn iterate_until_document_or_error(
    entities: &mut EntityMap,
    object: &str,
) -> RunnerResult<OperationResult> {
    match entities.get_mut(object)? {
        Entity::Cursor(cursor) => {
            let next = cursor.next().await?;
            Ok(OperationResult::Value(next.map_or(Value::Null, Value::Object)))
        }
        Entity::ChangeStream(stream) => {
            for _ in 0..CHANGE_STREAM_POLLS {
                if let Some(change) = stream.next().await? {
                    return Ok(OperationResult::Value(Value::Object(change)));
                }
                tokio::time::sleep(CHANGE_STREAM_POLL_INTERVAL).await;
            }
            Err(RunnerError::mismatch(format!(
                "change stream '{}' produced no change",
                object
            )))
        }
        other => Err(RunnerError::WrongKind {
            id: object.to_string(),
            expected: EntityKind::Cursor,
            actual: other.kind(),
        }),
    }
}

/// Close a cursor, change stream or client. The entity stays bound.
pub async fn close(entities: &mut EntityMap, object: &str) -> RunnerResult<OperationResult> {
    match entities.get_mut(object)? {
        Entity::Cursor(cursor) | Entity::ChangeStream(cursor) => cursor.close().await?,
        Entity::Client(client) => client.client.close().await?,
        other => {
            return Err(RunnerError::configuration(format!(
                "close: '{}' is a {}, which cannot be closed",
                object,
                other.kind()
            )))
        }
    }
    Ok(OperationResult::None)
}
