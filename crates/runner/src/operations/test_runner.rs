//! Operations addressed to the runner itself (`object: "testRunner"`).

use serde_json::{json, Value};
use unified_driver::{CallOptions, Client, Document, Namespace, NAMESPACE_NOT_FOUND};
use unified_format::OperationName;

use super::args::Args;
use super::OperationResult;
use crate::entities::EntityMap;
use crate::error::{RunnerError, RunnerResult};

pub const TEST_RUNNER: &str = "testRunner";

pub fn expect_runner_object(name: OperationName, object: &str) -> RunnerResult<()> {
    if object == TEST_RUNNER {
        Ok(())
    } else {
        Err(RunnerError::configuration(format!(
            "{} must target '{}', not '{}'",
            name.as_str(),
            TEST_RUNNER,
            object
        )))
    }
}

fn fail_point_name(command: &Document) -> RunnerResult<String> {
    command
        .get("configureFailPoint")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| RunnerError::configuration("failPoint document must name configureFailPoint"))
}

async fn configure(client: &dyn Client, command: Document) -> RunnerResult<String> {
    let name = fail_point_name(&command)?;
    client
        .run_command("admin", command, &CallOptions::default())
        .await?;
    tracing::debug!(fail_point = %name, "enabled fail point");
    Ok(name)
}

/// Enable a fail point through a client entity. Returns its name.
pub async fn fail_point(entities: &EntityMap, mut args: Args) -> RunnerResult<String> {
    let client = entities.client(&args.string("client")?)?.client.clone();
    configure(client.as_ref(), args.document("failPoint")?).await
}

/// Enable a fail point on the server a pinned session is bound to.
pub async fn targeted_fail_point(entities: &EntityMap, mut args: Args) -> RunnerResult<String> {
    let session_id = args.string("session")?;
    let session = entities.session(&session_id)?;
    if !session.session.is_pinned() {
        return Err(RunnerError::mismatch(format!(
            "targetedFailPoint: session '{}' is not pinned",
            session_id
        )));
    }
    let client = entities.client(&session.client_id)?.client.clone();
    configure(client.as_ref(), args.document("failPoint")?).await
}

pub fn assert_session(
    name: OperationName,
    entities: &EntityMap,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let id = args.string("session")?;
    let session = &entities.session(&id)?.session;
    let (holds, what) = match name {
        OperationName::AssertSessionTransactionState => {
            let expected = args.string("state")?;
            let actual = session.transaction_state().as_str();
            if actual != expected {
                return Err(RunnerError::mismatch(format!(
                    "session '{}' transaction state is {}, expected {}",
                    id, actual, expected
                )));
            }
            return Ok(OperationResult::None);
        }
        OperationName::AssertSessionPinned => (session.is_pinned(), "pinned"),
        OperationName::AssertSessionUnpinned => (!session.is_pinned(), "unpinned"),
        OperationName::AssertSessionDirty => (session.is_dirty(), "dirty"),
        OperationName::AssertSessionNotDirty => (!session.is_dirty(), "not dirty"),
        other => {
            return Err(RunnerError::configuration(format!(
                "{} is not a session assertion",
                other.as_str()
            )))
        }
    };
    if holds {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::mismatch(format!("session '{}' is not {}", id, what)))
    }
}

pub fn assert_lsids(
    name: OperationName,
    entities: &EntityMap,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let id = args.string("client")?;
    let (first, second) = entities.client(&id)?.recorder.last_two_lsids().ok_or_else(|| {
        RunnerError::mismatch(format!("client '{}' has sent fewer than two commands", id))
    })?;
    let same = first == second;
    let want_same = name == OperationName::AssertSameLsidOnLastTwoCommands;
    if same == want_same {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::mismatch(format!(
            "client '{}': last two commands used {} lsids ({:?} / {:?})",
            id,
            if same { "the same" } else { "different" },
            first,
            second
        )))
    }
}

pub async fn assert_collection(
    name: OperationName,
    util: &dyn Client,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let database = args.string("databaseName")?;
    let collection = args.string("collectionName")?;
    let filter = json!({ "name": collection });
    let found = util
        .list_collections(
            &database,
            filter.as_object().cloned().unwrap_or_default(),
            &CallOptions::default(),
        )
        .await?;
    let exists = !found.is_empty();
    let want = name == OperationName::AssertCollectionExists;
    if exists == want {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::mismatch(format!(
            "collection {}.{} {}",
            database,
            collection,
            if exists { "exists" } else { "does not exist" }
        )))
    }
}

pub async fn assert_index(
    name: OperationName,
    util: &dyn Client,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let ns = Namespace::new(args.string("databaseName")?, args.string("collectionName")?);
    let index = args.string("indexName")?;
    let exists = match util.list_indexes(&ns, &CallOptions::default()).await {
        Ok(indexes) => indexes
            .iter()
            .any(|i| i.get("name").and_then(Value::as_str) == Some(index.as_str())),
        Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) => false,
        Err(err) => return Err(err.into()),
    };
    let want = name == OperationName::AssertIndexExists;
    if exists == want {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::mismatch(format!(
            "index {} on {} {}",
            index,
            ns,
            if exists { "exists" } else { "does not exist" }
        )))
    }
}

pub fn assert_connections_checked_out(
    entities: &EntityMap,
    mut args: Args,
) -> RunnerResult<OperationResult> {
    let id = args.string("client")?;
    let expected = args
        .opt_u32("connections")?
        .ok_or_else(|| RunnerError::configuration("assertNumberConnectionsCheckedOut: missing argument 'connections'"))?;
    let actual = entities.client(&id)?.client.connections_checked_out();
    if actual == expected {
        Ok(OperationResult::None)
    } else {
        Err(RunnerError::mismatch(format!(
            "client '{}' has {} connections checked out, expected {}",
            id, actual, expected
        )))
    }
}
