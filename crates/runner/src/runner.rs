//! The per-test state machine.
//!
//! Every test goes through skip check, setup, execution and verification,
//! each phase depending on the previous one succeeding. Teardown (fail
//! points off, entity map released, utility client closed) runs on every path out
//! of setup, including failures.

use std::collections::HashMap;

use semver::Version;
use serde_json::{json, Value};
use unified_driver::{
    CallOptions, Client, ClientOptions, Deployment, Document, FindRequest, HandleOptions,
    Namespace, ReadConcern, ReadPreference, TopologyType, WriteConcern, NAMESPACE_NOT_FOUND,
};
use unified_format::{check_schema_version, CollectionData, EntityKind, Suite, Test};

use crate::config::RunnerConfig;
use crate::entities::{Entity, EntityMap};
use crate::error::{RunnerError, RunnerResult};
use crate::events::{match_events, CapturedEvents};
use crate::matching::assert_includes;
use crate::operations::OperationExecutor;
use crate::report::{SuiteReport, TestOutcome, TestReport};
use crate::requirements::RequirementContext;

/// `killAllSessions` replies that mean there was nothing to do.
const BENIGN_KILL_SESSIONS_CODES: [i32; 3] = [
    11601, // Interrupted
    13,    // Unauthorized
    59,    // CommandNotFound
];

/// Servers below this version may fail the first `distinct` in a
/// transaction on a sharded cluster with `NamespaceNotFound`.
const DISTINCT_RACE_FIXED_IN: Version = Version::new(5, 2, 2);

/// Run every test of `suite` in order.
///
/// A suite whose schema version is unsupported runs nothing; each of its
/// tests is reported as failed with the version error.
pub async fn run_suite(deployment: &dyn Deployment, config: &RunnerConfig, suite: &Suite) -> SuiteReport {
    let mut report = SuiteReport::new(suite.description.clone());
    if let Err(err) = check_schema_version(&suite.schema_version) {
        tracing::warn!(suite = %suite.description, error = %err, "refusing to run suite");
        for test in &suite.tests {
            report.push(TestReport {
                description: test.description.clone(),
                outcome: TestOutcome::Failed {
                    message: err.to_string(),
                },
            });
        }
        return report;
    }

    for test in &suite.tests {
        let outcome = run_test(deployment, config, suite, test).await;
        match &outcome {
            TestOutcome::Passed => tracing::debug!(test = %test.description, "passed"),
            TestOutcome::Failed { message } => {
                tracing::debug!(test = %test.description, %message, "failed")
            }
            TestOutcome::Skipped { reason } => {
                tracing::debug!(test = %test.description, %reason, "skipped")
            }
        }
        report.push(TestReport {
            description: test.description.clone(),
            outcome,
        });
    }
    report
}

/// Run one test of `suite`.
pub async fn run_test(
    deployment: &dyn Deployment,
    config: &RunnerConfig,
    suite: &Suite,
    test: &Test,
) -> TestOutcome {
    if let Some(reason) = &test.skip_reason {
        return TestOutcome::Skipped {
            reason: reason.clone(),
        };
    }
    if config.is_skipped(&test.description) {
        return TestOutcome::Skipped {
            reason: "listed in the skip list".to_string(),
        };
    }

    tracing::trace!(test = %test.description, "setup");
    let util = match deployment.connect(util_options(config)).await {
        Ok(util) => util,
        Err(err) => {
            return TestOutcome::Failed {
                message: format!("could not connect utility client: {}", err),
            }
        }
    };

    let mut entities = EntityMap::default();
    let mut fail_points = Vec::new();
    let result = execute(
        deployment,
        config,
        suite,
        test,
        util.as_ref(),
        &mut entities,
        &mut fail_points,
    )
    .await;

    tracing::trace!(test = %test.description, "teardown");
    disable_fail_points(util.as_ref(), &fail_points).await;
    entities.cleanup().await;
    if let Err(err) = util.close().await {
        tracing::warn!(error = %err, "failed to close utility client");
    }

    match result {
        Ok(Phase::Completed) => TestOutcome::Passed,
        Ok(Phase::Unmet(reason)) => TestOutcome::Skipped { reason },
        Err(err) => TestOutcome::Failed {
            message: err.to_string(),
        },
    }
}

enum Phase {
    Completed,
    Unmet(String),
}

fn util_options(config: &RunnerConfig) -> ClientOptions {
    ClientOptions {
        uri: if config.load_balanced {
            config.single_mongos_lb_uri.clone()
        } else {
            None
        },
        ..ClientOptions::default()
    }
}

async fn execute(
    deployment: &dyn Deployment,
    config: &RunnerConfig,
    suite: &Suite,
    test: &Test,
    util: &dyn Client,
    entities: &mut EntityMap,
    fail_points: &mut Vec<String>,
) -> RunnerResult<Phase> {
    terminate_open_transactions(config, util).await?;
    let parameters = server_parameters(util).await?;

    let requirements = RequirementContext::new(config, util, &parameters);
    if !requirements.is_any_satisfied(&suite.run_on_requirements).await? {
        return Ok(Phase::Unmet("suite runOnRequirements not satisfied".to_string()));
    }
    if !requirements.is_any_satisfied(&test.run_on_requirements).await? {
        return Ok(Phase::Unmet("test runOnRequirements not satisfied".to_string()));
    }

    seed_initial_data(util, &suite.initial_data).await?;

    tracing::trace!(test = %test.description, "execute");
    *entities = EntityMap::create(deployment, config, &suite.create_entities).await?;

    if matches!(
        util.topology().topology_type,
        TopologyType::Sharded | TopologyType::LoadBalanced
    ) {
        let version = requirements.server_version().await?.clone();
        prime_distinct(util, entities, &version).await?;
    }

    {
        let mut executor = OperationExecutor::new(entities, util, fail_points);
        for operation in &test.operations {
            if let Err(err) = executor.execute_and_check(operation).await {
                if let Err(cleanup) = terminate_open_transactions(config, util).await {
                    tracing::warn!(error = %cleanup, "could not terminate transactions after failure");
                }
                return Err(err);
            }
        }
    }

    tracing::trace!(test = %test.description, "verify");
    let captured = stop_capturing(entities);
    if let Some(expected) = &test.expect_events {
        for client_events in expected {
            let actual = captured.get(&client_events.client).ok_or_else(|| {
                RunnerError::configuration(format!(
                    "expectEvents names '{}', which is not a client entity",
                    client_events.client
                ))
            })?;
            match_events(client_events, actual, entities)?;
        }
    }
    if let Some(outcome) = &test.outcome {
        check_outcome(util, outcome).await?;
    }
    Ok(Phase::Completed)
}

/// Kill sessions left over from an earlier test so their transactions
/// cannot hold locks. Skipped on serverless deployments.
async fn terminate_open_transactions(config: &RunnerConfig, util: &dyn Client) -> RunnerResult<()> {
    if config.serverless {
        return Ok(());
    }
    let command = document(json!({ "killAllSessions": [] }));
    match util.run_command("admin", command, &CallOptions::default()).await {
        Ok(_) => Ok(()),
        Err(err) if err.code().is_some_and(|c| BENIGN_KILL_SESSIONS_CODES.contains(&c)) => {
            tracing::warn!(error = %err, "ignoring killAllSessions failure");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

async fn server_parameters(util: &dyn Client) -> RunnerResult<Document> {
    let command = document(json!({ "getParameter": "*" }));
    Ok(util.run_command("admin", command, &CallOptions::default()).await?)
}

/// Drop every seeded collection that exists, then recreate or fill them,
/// all with majority write concern.
async fn seed_initial_data(util: &dyn Client, data: &[CollectionData]) -> RunnerResult<()> {
    let majority = CallOptions::with_handle(HandleOptions {
        write_concern: Some(WriteConcern::majority()),
        ..HandleOptions::default()
    });
    for collection in data {
        let filter = document(json!({ "name": collection.collection_name }));
        let existing = util
            .list_collections(&collection.database_name, filter, &CallOptions::default())
            .await?;
        if !existing.is_empty() {
            let ns = Namespace::new(collection.database_name.clone(), collection.collection_name.clone());
            util.drop_collection(&ns, &majority).await?;
        }
    }
    for collection in data {
        if collection.documents.is_empty() {
            util
                .create_collection(
                    &collection.database_name,
                    &collection.collection_name,
                    Document::new(),
                    &majority,
                )
                .await?;
        } else {
            let ns = Namespace::new(collection.database_name.clone(), collection.collection_name.clone());
            util
                .insert_many(&ns, collection.documents.clone(), true, &majority)
                .await?;
        }
        tracing::trace!(
            database = %collection.database_name,
            collection = %collection.collection_name,
            documents = collection.documents.len(),
            "seeded collection"
        );
    }
    Ok(())
}

/// Run `distinct` once per collection entity through the utility client so
/// the entity clients record no extra events.
async fn prime_distinct(util: &dyn Client, entities: &EntityMap, version: &Version) -> RunnerResult<()> {
    for (id, entity) in entities.map_of(EntityKind::Collection) {
        let Entity::Collection(coll) = entity else {
            continue;
        };
        let command = document(json!({ "distinct": coll.ns.coll, "key": "_id" }));
        match util.run_command(&coll.ns.db, command, &CallOptions::default()).await {
            Ok(_) => {}
            Err(err) if err.code() == Some(NAMESPACE_NOT_FOUND) && *version < DISTINCT_RACE_FIXED_IN => {
                tracing::warn!(collection = %id, error = %err, "ignoring distinct failure");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

/// Freeze every client's event buffers, keyed by client id.
fn stop_capturing(entities: &EntityMap) -> HashMap<String, CapturedEvents> {
    entities
        .clients()
        .into_iter()
        .map(|(id, client)| {
            let captured = CapturedEvents {
                commands: client.recorder.stop_capturing_command_events(),
                cmap: client.recorder.stop_capturing_cmap_events(),
            };
            (id.to_string(), captured)
        })
        .collect()
}

async fn check_outcome(util: &dyn Client, outcome: &[CollectionData]) -> RunnerResult<()> {
    let call = CallOptions::with_handle(HandleOptions {
        read_concern: Some(ReadConcern::local()),
        read_preference: Some(ReadPreference::primary()),
        write_concern: None,
    });
    for expected in outcome {
        let ns = Namespace::new(expected.database_name.clone(), expected.collection_name.clone());
        let request = FindRequest {
            sort: Some(document(json!({ "_id": 1 }))),
            ..FindRequest::default()
        };
        let mut cursor = util.find(&ns, request, &call).await?;
        let mut actual = Vec::new();
        while let Some(doc) = cursor.next().await? {
            actual.push(Value::Object(doc));
        }
        cursor.close().await?;

        if actual.len() != expected.documents.len() {
            return Err(RunnerError::mismatch(format!(
                "outcome {}: expected {} documents, found {}",
                ns,
                expected.documents.len(),
                actual.len()
            )));
        }
        for (i, (want, got)) in expected.documents.iter().zip(&actual).enumerate() {
            assert_includes(&Value::Object(want.clone()), got, &format!("outcome {}[{}]", ns, i))?;
        }
    }
    Ok(())
}

/// Turn off the fail points a test enabled, newest first.
async fn disable_fail_points(util: &dyn Client, names: &[String]) {
    for name in names.iter().rev() {
        let command = document(json!({ "configureFailPoint": name, "mode": "off" }));
        if let Err(err) = util.run_command("admin", command, &CallOptions::default()).await {
            tracing::warn!(fail_point = %name, error = %err, "failed to disable fail point");
        }
    }
}

fn document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}
