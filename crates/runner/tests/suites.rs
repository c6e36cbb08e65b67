//! End-to-end suite runs against the in-process deployment.
//!
//! Each test builds a suite document inline, runs it through `run_suite`
//! and checks both the reported outcomes and what the deployment saw.

use serde_json::{json, Value};
use unified_driver::memory::{DeploymentProfile, MemoryDeployment};
use unified_driver::{Document, Namespace, TopologyType};
use unified_format::Suite;
use unified_runner::{run_suite, RunnerConfig, SuiteReport, TestOutcome};

// ──────────────────────────────────────────────
// Fixtures
// ──────────────────────────────────────────────

fn suite(v: Value) -> Suite {
    unified_format::from_json(&v).unwrap()
}

/// A suite with one observing client, `db0` and `coll0` over `test.coll0`.
fn suite_with(initial: Value, tests: Value) -> Suite {
    suite(json!({
        "description": "fixture",
        "schemaVersion": "1.0",
        "createEntities": [
            { "client": { "id": "client0", "observeEvents": ["commandStartedEvent"] } },
            { "database": { "id": "db0", "client": "client0", "databaseName": "test" } },
            { "collection": { "id": "coll0", "database": "db0", "collectionName": "coll0" } },
            { "session": { "id": "session0", "client": "client0" } }
        ],
        "initialData": initial,
        "tests": tests
    }))
}

fn seeded(docs: Value) -> Value {
    json!([{ "databaseName": "test", "collectionName": "coll0", "documents": docs }])
}

async fn run(deployment: &MemoryDeployment, suite: &Suite) -> SuiteReport {
    run_suite(deployment, &RunnerConfig::default(), suite).await
}

fn outcome(report: &SuiteReport, i: usize) -> &TestOutcome {
    &report.tests[i].outcome
}

fn fail_once(command: &str, code: i32) -> Document {
    json!({
        "configureFailPoint": "failCommand",
        "mode": { "times": 1 },
        "data": { "failCommands": [command], "errorCode": code }
    })
    .as_object()
    .cloned()
    .unwrap()
}

fn noop_suite() -> Suite {
    suite_with(seeded(json!([])), json!([{ "description": "noop", "operations": [] }]))
}

fn sharded(version: &str) -> MemoryDeployment {
    MemoryDeployment::new(
        DeploymentProfile::default()
            .with_topology(TopologyType::Sharded)
            .with_server_version(version),
    )
}

fn failure_message(report: &SuiteReport, i: usize) -> String {
    match outcome(report, i) {
        TestOutcome::Failed { message } => message.clone(),
        other => panic!("expected a failure, got {:?}", other),
    }
}

// ──────────────────────────────────────────────
// 1. Gating
// ──────────────────────────────────────────────

#[tokio::test]
async fn unsupported_schema_version_executes_nothing() {
    let deployment = MemoryDeployment::default();
    let suite: Suite = serde_json::from_value(json!({
        "description": "future",
        "schemaVersion": "2.0",
        "tests": [
            { "description": "a", "operations": [] },
            { "description": "b", "operations": [] }
        ]
    }))
    .unwrap();
    let report = run(&deployment, &suite).await;
    assert_eq!(report.failed, 2);
    assert!(failure_message(&report, 0).contains("unsupported schema version"));
    assert!(deployment.commands().is_empty());
    assert_eq!(deployment.stats().clients_opened, 0);
}

#[tokio::test]
async fn skip_reason_constructs_no_entities() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "skipped",
            "skipReason": "not today",
            "operations": [{ "name": "insertOne", "object": "coll0", "arguments": { "document": {} } }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(
        outcome(&report, 0),
        &TestOutcome::Skipped {
            reason: "not today".to_string()
        }
    );
    assert_eq!(deployment.stats().clients_opened, 0);
    assert!(deployment.commands().is_empty());
}

#[tokio::test]
async fn skip_list_is_checked_before_connecting() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{ "description": "known broken", "operations": [] }]),
    );
    let config = RunnerConfig::default().with_skip_tests(["known broken"]);
    let report = run_suite(&deployment, &config, &suite).await;
    assert_eq!(report.skipped, 1);
    assert_eq!(deployment.stats().clients_opened, 0);
}

#[tokio::test]
async fn unmet_topology_sends_only_setup_commands() {
    let deployment =
        MemoryDeployment::new(DeploymentProfile::default().with_topology(TopologyType::Single));
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "sharded only",
            "runOnRequirements": [{ "topologies": ["sharded"] }],
            "operations": [{ "name": "insertOne", "object": "coll0", "arguments": { "document": {} } }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert!(matches!(outcome(&report, 0), TestOutcome::Skipped { .. }));
    assert_eq!(deployment.command_names(), vec!["killAllSessions", "getParameter"]);
    let stats = deployment.stats();
    assert_eq!(stats.clients_opened, 1);
    assert_eq!(stats.clients_closed, 1);
}

#[tokio::test]
async fn serverless_skips_session_termination() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "serverless forbidden",
            "runOnRequirements": [{ "serverless": "forbid" }],
            "operations": []
        }]),
    );
    let config = RunnerConfig::default().with_serverless(true);
    let report = run_suite(&deployment, &config, &suite).await;
    assert!(matches!(outcome(&report, 0), TestOutcome::Skipped { .. }));
    assert_eq!(deployment.command_names(), vec!["getParameter"]);
}

// ──────────────────────────────────────────────
// 2. Operations and expectations
// ──────────────────────────────────────────────

#[tokio::test]
async fn insert_one_reports_id_and_single_started_event() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "insert",
            "operations": [{
                "name": "insertOne",
                "object": "coll0",
                "arguments": { "document": { "x": 1 } },
                "expectResult": { "insertedId": { "$$type": "objectId" } }
            }],
            "expectEvents": [{
                "client": "client0",
                "events": [{
                    "commandStartedEvent": {
                        "commandName": "insert",
                        "databaseName": "test",
                        "command": { "insert": "coll0", "documents": [{ "x": 1 }] }
                    }
                }]
            }],
            "outcome": [{ "databaseName": "test", "collectionName": "coll0", "documents": [{ "x": 1 }] }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

#[tokio::test]
async fn expected_error_on_success_fails_the_test() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "no error",
            "operations": [{
                "name": "insertOne",
                "object": "coll0",
                "arguments": { "document": { "_id": 1 } },
                "expectError": { "errorCode": 11000 }
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert!(failure_message(&report, 0).contains("expected error, got success"));
}

#[tokio::test]
async fn duplicate_key_matches_expected_error() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([{ "_id": 1 }])),
        json!([{
            "description": "duplicate",
            "operations": [{
                "name": "insertOne",
                "object": "coll0",
                "arguments": { "document": { "_id": 1 } },
                "expectError": { "isClientError": false, "errorCode": 11000, "errorContains": "duplicate key" }
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

#[tokio::test]
async fn fail_point_error_is_matched_and_turned_off_at_teardown() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "fail point",
            "operations": [
                {
                    "name": "failPoint",
                    "object": "testRunner",
                    "arguments": {
                        "client": "client0",
                        "failPoint": {
                            "configureFailPoint": "failCommand",
                            "mode": "alwaysOn",
                            "data": { "failCommands": ["insert"], "errorCode": 91 }
                        }
                    }
                },
                {
                    "name": "insertOne",
                    "object": "coll0",
                    "arguments": { "document": { "_id": 1 } },
                    "expectError": { "errorCode": 91, "errorCodeName": "ShutdownInProgress" }
                }
            ],
            "expectEvents": [{
                "client": "client0",
                "events": [{ "commandStartedEvent": { "commandName": "insert" } }]
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
    assert!(deployment.active_fail_points().is_empty());
}

#[tokio::test]
async fn find_cursor_is_saved_and_iterated() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([{ "_id": 1 }, { "_id": 2 }, { "_id": 3 }])),
        json!([{
            "description": "cursor",
            "operations": [
                {
                    "name": "createFindCursor",
                    "object": "coll0",
                    "arguments": { "filter": {}, "sort": { "_id": 1 }, "batchSize": 2 },
                    "saveResultAsEntity": "cursor0"
                },
                { "name": "iterateUntilDocumentOrError", "object": "cursor0", "expectResult": { "_id": 1 } },
                { "name": "iterateUntilDocumentOrError", "object": "cursor0", "expectResult": { "_id": 2 } },
                { "name": "iterateUntilDocumentOrError", "object": "cursor0", "expectResult": { "_id": 3 } },
                { "name": "close", "object": "cursor0" }
            ],
            "expectEvents": [{
                "client": "client0",
                "events": [
                    { "commandStartedEvent": { "commandName": "find" } },
                    { "commandStartedEvent": { "commandName": "getMore" } }
                ],
                "ignoreExtraEvents": true
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

#[tokio::test]
async fn with_transaction_commits_callback_writes() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "transaction",
            "operations": [
                {
                    "name": "withTransaction",
                    "object": "session0",
                    "arguments": {
                        "callback": [{
                            "name": "insertOne",
                            "object": "coll0",
                            "arguments": { "session": "session0", "document": { "_id": 1 } },
                            "expectResult": { "insertedId": 1 }
                        }]
                    }
                },
                {
                    "name": "assertSessionTransactionState",
                    "object": "testRunner",
                    "arguments": { "session": "session0", "state": "committed" }
                }
            ],
            "outcome": [{ "databaseName": "test", "collectionName": "coll0", "documents": [{ "_id": 1 }] }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

#[tokio::test]
async fn collection_assertions_use_the_utility_client() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "admin",
            "operations": [
                {
                    "name": "createCollection",
                    "object": "db0",
                    "arguments": { "collection": "other" }
                },
                {
                    "name": "assertCollectionExists",
                    "object": "testRunner",
                    "arguments": { "databaseName": "test", "collectionName": "other" }
                },
                {
                    "name": "dropCollection",
                    "object": "db0",
                    "arguments": { "collection": "other" }
                },
                {
                    "name": "assertCollectionNotExists",
                    "object": "testRunner",
                    "arguments": { "databaseName": "test", "collectionName": "other" }
                },
                {
                    "name": "assertIndexNotExists",
                    "object": "testRunner",
                    "arguments": { "databaseName": "test", "collectionName": "other", "indexName": "x_1" }
                }
            ]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

// ──────────────────────────────────────────────
// 3. Events and outcome
// ──────────────────────────────────────────────

fn events_suite(ignore_extra: bool) -> Suite {
    suite_with(
        seeded(json!([{ "_id": 1 }])),
        json!([{
            "description": "interleaved",
            "operations": [
                { "name": "insertOne", "object": "coll0", "arguments": { "document": { "_id": 2 } } },
                { "name": "countDocuments", "object": "coll0", "arguments": { "filter": {} }, "expectResult": 2 },
                { "name": "find", "object": "coll0", "arguments": { "filter": {} } }
            ],
            "expectEvents": [{
                "client": "client0",
                "events": [
                    { "commandStartedEvent": { "commandName": "insert" } },
                    { "commandStartedEvent": { "commandName": "find" } }
                ],
                "ignoreExtraEvents": ignore_extra
            }]
        }]),
    )
}

#[tokio::test]
async fn extra_events_fail_unless_ignored() {
    let deployment = MemoryDeployment::default();
    let report = run(&deployment, &events_suite(false)).await;
    assert!(failure_message(&report, 0).contains("client0"));

    let report = run(&deployment, &events_suite(true)).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

fn outcome_suite(expected: Value) -> Suite {
    suite_with(
        seeded(json!([{ "_id": 1, "a": 1 }, { "_id": 2, "a": 2 }])),
        json!([{
            "description": "outcome",
            "operations": [],
            "outcome": [{ "databaseName": "test", "collectionName": "coll0", "documents": expected }]
        }]),
    )
}

#[tokio::test]
async fn outcome_is_a_sorted_subset_match() {
    let deployment = MemoryDeployment::default();
    let report = run(&deployment, &outcome_suite(json!([{ "_id": 1, "a": 1 }, { "_id": 2 }]))).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);

    let report = run(&deployment, &outcome_suite(json!([{ "_id": 1, "a": 1 }, { "_id": 2, "a": 9 }]))).await;
    assert!(failure_message(&report, 0).contains("outcome test.coll0[1]"));

    let report = run(&deployment, &outcome_suite(json!([{ "_id": 1, "a": 1 }]))).await;
    assert!(failure_message(&report, 0).contains("expected 1 documents, found 2"));
}

#[tokio::test]
async fn outcome_tolerates_extra_keys_only_at_the_top_level() {
    let deployment = MemoryDeployment::default();
    let nested = |expected: Value| {
        suite_with(
            seeded(json!([{ "_id": 1, "a": { "b": 1, "c": 2 }, "z": 0 }])),
            json!([{
                "description": "nested outcome",
                "operations": [],
                "outcome": [{ "databaseName": "test", "collectionName": "coll0", "documents": [expected] }]
            }]),
        )
    };

    let report = run(&deployment, &nested(json!({ "_id": 1, "a": { "b": 1 } }))).await;
    let message = failure_message(&report, 0);
    assert!(message.contains("outcome test.coll0[0]"), "{}", message);
    assert!(message.contains("unexpected key 'c'"), "{}", message);

    let report = run(&deployment, &nested(json!({ "_id": 1, "a": { "b": 1, "c": 2 } }))).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

#[tokio::test]
async fn initial_data_seeding_is_idempotent() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([{ "_id": 1, "a": 1 }, { "_id": 2, "a": 2 }])),
        json!([{ "description": "noop", "operations": [] }]),
    );
    run(&deployment, &suite).await;
    let first = deployment.documents(&Namespace::new("test", "coll0"));
    run(&deployment, &suite).await;
    let second = deployment.documents(&Namespace::new("test", "coll0"));
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[tokio::test]
async fn empty_initial_data_creates_the_collection() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "exists",
            "operations": [{
                "name": "assertCollectionExists",
                "object": "testRunner",
                "arguments": { "databaseName": "test", "collectionName": "coll0" }
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
}

// ──────────────────────────────────────────────
// 4. Teardown
// ──────────────────────────────────────────────

#[tokio::test]
async fn failure_mid_test_still_releases_everything_once() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "fails halfway",
            "operations": [
                { "name": "startTransaction", "object": "session0" },
                {
                    "name": "insertOne",
                    "object": "coll0",
                    "arguments": { "session": "session0", "document": { "_id": 1 } }
                },
                { "name": "find", "object": "missing", "arguments": { "filter": {} } },
                { "name": "commitTransaction", "object": "session0" }
            ],
            "outcome": [{ "databaseName": "test", "collectionName": "coll0", "documents": [] }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert!(failure_message(&report, 0).contains("entity 'missing' not found"));

    let stats = deployment.stats();
    assert_eq!(stats.clients_opened, 2);
    assert_eq!(stats.clients_closed, 2);
    assert_eq!(stats.sessions_started, 1);
    assert_eq!(stats.sessions_ended, 1);
    // The open transaction was killed rather than committed.
    assert!(deployment.documents(&Namespace::new("test", "coll0")).is_empty());
}

#[tokio::test]
async fn each_test_gets_fresh_entities() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([
            {
                "description": "saves",
                "operations": [{
                    "name": "countDocuments",
                    "object": "coll0",
                    "arguments": { "filter": {} },
                    "saveResultAsEntity": "count"
                }]
            },
            {
                "description": "saves again",
                "operations": [{
                    "name": "countDocuments",
                    "object": "coll0",
                    "arguments": { "filter": {} },
                    "saveResultAsEntity": "count"
                }]
            }
        ]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(report.passed, 2, "{}", report);
    assert!(report.is_success());
}

#[tokio::test]
async fn failing_operation_kills_sessions_before_reporting() {
    let deployment = MemoryDeployment::default();
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "wrong count",
            "operations": [
                { "name": "insertOne", "object": "coll0", "arguments": { "document": { "_id": 1 } } },
                { "name": "countDocuments", "object": "coll0", "arguments": { "filter": {} }, "expectResult": 5 }
            ]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert!(matches!(outcome(&report, 0), TestOutcome::Failed { .. }));

    let names = deployment.command_names();
    let kills: Vec<usize> = names
        .iter()
        .enumerate()
        .filter(|(_, n)| n.as_str() == "killAllSessions")
        .map(|(i, _)| i)
        .collect();
    assert_eq!(kills.len(), 2, "{:?}", names);
    assert_eq!(kills[0], 0);
    let count = names.iter().rposition(|n| n == "aggregate" || n == "count").unwrap();
    assert!(kills[1] > count, "{:?}", names);
}

// ──────────────────────────────────────────────
// 5. Server quirks
// ──────────────────────────────────────────────

#[tokio::test]
async fn benign_kill_all_sessions_errors_are_ignored() {
    for code in [11601, 13, 59] {
        let deployment = MemoryDeployment::default();
        deployment.set_fail_point(fail_once("killAllSessions", code)).unwrap();
        let report = run(&deployment, &noop_suite()).await;
        assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "code {}: {}", code, report);
    }
}

#[tokio::test]
async fn other_kill_all_sessions_errors_fail_the_test() {
    let deployment = MemoryDeployment::default();
    deployment.set_fail_point(fail_once("killAllSessions", 8)).unwrap();
    let report = run(&deployment, &noop_suite()).await;
    assert!(failure_message(&report, 0).contains("(8)"));
    assert_eq!(deployment.command_names(), vec!["killAllSessions"]);
}

#[tokio::test]
async fn sharded_distinct_runs_outside_entity_clients() {
    let deployment = sharded("6.0.4");
    let suite = suite_with(
        seeded(json!([])),
        json!([{
            "description": "one insert",
            "operations": [{ "name": "insertOne", "object": "coll0", "arguments": { "document": { "_id": 1 } } }],
            "expectEvents": [{
                "client": "client0",
                "events": [{ "commandStartedEvent": { "commandName": "insert" } }]
            }]
        }]),
    );
    let report = run(&deployment, &suite).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);

    let distinct = deployment
        .commands()
        .into_iter()
        .find(|c| c.command_name == "distinct")
        .unwrap();
    assert_eq!(distinct.database, "test");
    assert_eq!(distinct.command["distinct"], json!("coll0"));
    assert_eq!(distinct.command["key"], json!("_id"));
}

#[tokio::test]
async fn distinct_namespace_not_found_is_ignored_before_5_2_2() {
    let deployment = sharded("5.0.0");
    deployment.set_fail_point(fail_once("distinct", 26)).unwrap();
    let report = run(&deployment, &noop_suite()).await;
    assert_eq!(outcome(&report, 0), &TestOutcome::Passed, "{}", report);
    assert!(deployment.active_fail_points().is_empty());
}

#[tokio::test]
async fn distinct_namespace_not_found_fails_from_5_2_2() {
    let deployment = sharded("5.2.2");
    deployment.set_fail_point(fail_once("distinct", 26)).unwrap();
    let report = run(&deployment, &noop_suite()).await;
    assert!(failure_message(&report, 0).contains("(26)"));
}

#[tokio::test]
async fn distinct_failure_with_other_code_fails_on_old_servers() {
    let deployment = sharded("5.0.0");
    deployment.set_fail_point(fail_once("distinct", 8)).unwrap();
    let report = run(&deployment, &noop_suite()).await;
    assert!(failure_message(&report, 0).contains("(8)"));
}

#[tokio::test]
async fn malformed_stream_hex_is_a_configuration_error() {
    let deployment = MemoryDeployment::default();
    let suite = suite(json!({
        "description": "streams",
        "schemaVersion": "1.4",
        "createEntities": [{ "stream": { "id": "stream0", "hexBytes": "aéb" } }],
        "tests": [{ "description": "bad hex", "operations": [] }]
    }));
    let report = run(&deployment, &suite).await;
    let message = failure_message(&report, 0);
    assert!(message.contains("configuration error"), "{}", message);
    assert!(message.contains("invalid hex string"), "{}", message);
}
