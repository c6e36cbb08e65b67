//! End-to-end behaviour of the in-process deployment through the public
//! `Client`/`Session`/`Cursor` traits.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use unified_driver::memory::{DeploymentProfile, MemoryDeployment};
use unified_driver::{
    CallOptions, Client, CmapEvent, CommandEvent, ConnectionClosedReason, Deployment, Document,
    EventHandler, FindRequest, Namespace, SessionOptions, TopologyType, TransactionOptions,
    TransactionState, UpdateModifications, UpdateRequest, WatchTarget, WriteModel,
    TRANSIENT_TRANSACTION_ERROR,
};

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<CommandEvent>>,
    cmap: Mutex<Vec<CmapEvent>>,
}

impl EventHandler for Recorder {
    fn handle_command_event(&self, event: CommandEvent) {
        self.commands.lock().unwrap().push(event);
    }

    fn handle_cmap_event(&self, event: CmapEvent) {
        self.cmap.lock().unwrap().push(event);
    }
}

impl Recorder {
    fn started(&self) -> Vec<(String, Document)> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e {
                CommandEvent::Started {
                    command_name,
                    command,
                    ..
                } => Some((command_name.clone(), command.clone())),
                _ => None,
            })
            .collect()
    }

    fn cmap_kinds(&self) -> Vec<&'static str> {
        self.cmap.lock().unwrap().iter().map(|e| e.kind_name()).collect()
    }
}

fn doc(v: Value) -> Document {
    v.as_object().cloned().unwrap()
}

fn ns() -> Namespace {
    Namespace::new("db", "coll")
}

async fn connect(deployment: &MemoryDeployment) -> (Arc<dyn Client>, Arc<Recorder>) {
    let recorder = Arc::new(Recorder::default());
    let client = deployment
        .connect(unified_driver::ClientOptions {
            event_handler: Some(recorder.clone()),
            ..Default::default()
        })
        .await
        .unwrap();
    (client, recorder)
}

fn fail_command(commands: &[&str], data: Value) -> Document {
    let mut data = doc(data);
    data.insert("failCommands".to_string(), json!(commands));
    doc(json!({
        "configureFailPoint": "failCommand",
        "mode": { "times": 1 },
        "data": data,
    }))
}

// ── Events ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn insert_emits_command_and_pool_events_in_order() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;

    let result = client
        .insert_one(&ns(), doc(json!({ "x": 1 })), &CallOptions::default())
        .await
        .unwrap();
    assert!(result.inserted_id.get("$oid").is_some());

    let started = recorder.started();
    assert_eq!(started.len(), 1);
    let (name, command) = &started[0];
    assert_eq!(name, "insert");
    assert_eq!(command["insert"], json!("coll"));
    assert!(command.contains_key("lsid"));
    assert_eq!(command["documents"][0]["_id"], result.inserted_id);

    assert_eq!(
        recorder.cmap_kinds(),
        vec![
            "poolCreatedEvent",
            "poolReadyEvent",
            "connectionCheckOutStartedEvent",
            "connectionCreatedEvent",
            "connectionReadyEvent",
            "connectionCheckedOutEvent",
            "connectionCheckedInEvent",
        ]
    );
    assert_eq!(client.connections_checked_out(), 0);
}

#[tokio::test]
async fn command_name_is_the_first_key_as_written() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;

    client
        .run_command(
            "admin",
            doc(json!({ "ping": 1, "comment": "first key wins" })),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    client
        .insert_many(
            &ns(),
            vec![doc(json!({ "_id": 1 })), doc(json!({ "_id": 2 }))],
            true,
            &CallOptions::default(),
        )
        .await
        .unwrap();

    let names: Vec<String> = recorder.started().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["ping", "insert"]);
    assert_eq!(deployment.command_names(), vec!["ping", "insert"]);
    let (_, insert) = &recorder.started()[1];
    assert_eq!(insert.keys().next().map(String::as_str), Some("insert"));
}

#[tokio::test]
async fn close_is_idempotent_and_counted_once() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    client
        .run_command("admin", doc(json!({ "ping": 1 })), &CallOptions::default())
        .await
        .unwrap();
    client.close().await.unwrap();
    client.close().await.unwrap();

    let stats = deployment.stats();
    assert_eq!(stats.clients_opened, 1);
    assert_eq!(stats.clients_closed, 1);
    assert_eq!(recorder.cmap_kinds().last(), Some(&"poolClosedEvent"));

    let err = client
        .run_command("admin", doc(json!({ "ping": 1 })), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_client_error());
}

// ── CRUD ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn duplicate_key_in_insert_many_reports_partial_result() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let docs = vec![
        doc(json!({ "_id": 1 })),
        doc(json!({ "_id": 1 })),
        doc(json!({ "_id": 2 })),
    ];
    let err = client
        .insert_many(&ns(), docs, true, &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Some(11000));
    assert_eq!(err.partial_result().unwrap()["insertedCount"], json!(1));
    assert_eq!(deployment.documents(&ns()).len(), 1);
}

#[tokio::test]
async fn find_cursor_fetches_remaining_batches_with_get_more() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let docs = (1..=5).map(|i| doc(json!({ "_id": i }))).collect();
    client
        .insert_many(&ns(), docs, true, &CallOptions::default())
        .await
        .unwrap();

    let mut cursor = client
        .find(
            &ns(),
            FindRequest {
                sort: Some(doc(json!({ "_id": 1 }))),
                batch_size: Some(2),
                ..FindRequest::default()
            },
            &CallOptions::default(),
        )
        .await
        .unwrap();
    let mut seen = Vec::new();
    while let Some(d) = cursor.next().await.unwrap() {
        seen.push(d["_id"].clone());
    }
    assert_eq!(seen, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);

    let names: Vec<String> = recorder.started().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["insert", "find", "getMore", "getMore"]);
}

#[tokio::test]
async fn bulk_write_splits_batches_by_kind() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let models = vec![
        WriteModel::InsertOne(doc(json!({ "_id": 1, "x": 1 }))),
        WriteModel::InsertOne(doc(json!({ "_id": 2, "x": 1 }))),
        WriteModel::UpdateMany(UpdateRequest {
            filter: doc(json!({ "x": 1 })),
            update: UpdateModifications::Document(doc(json!({ "$inc": { "x": 1 } }))),
            multi: true,
            upsert: false,
            array_filters: None,
            hint: None,
        }),
    ];
    let result = client
        .bulk_write(&ns(), models, true, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result.inserted_count, 2);
    assert_eq!(result.modified_count, 2);
    let names: Vec<String> = recorder.started().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["insert", "update"]);
}

// ── Transactions ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn abort_rolls_back_and_commit_publishes() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    let session = client.start_session(SessionOptions::default()).await.unwrap();
    let call = CallOptions {
        session: Some(session.clone()),
        ..CallOptions::default()
    };

    session.start_transaction(TransactionOptions::default()).unwrap();
    client.insert_one(&ns(), doc(json!({ "_id": 1 })), &call).await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::InProgress);
    session.abort_transaction().await.unwrap();
    assert!(deployment.documents(&ns()).is_empty());

    session.start_transaction(TransactionOptions::default()).unwrap();
    client.insert_one(&ns(), doc(json!({ "_id": 2 })), &call).await.unwrap();
    session.commit_transaction().await.unwrap();
    assert_eq!(deployment.documents(&ns()), vec![doc(json!({ "_id": 2 }))]);

    let started = recorder.started();
    let (_, first_insert) = &started[0];
    assert_eq!(first_insert["txnNumber"], json!(1));
    assert_eq!(first_insert["startTransaction"], json!(true));
    assert_eq!(first_insert["autocommit"], json!(false));
    let names: Vec<&str> = started.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["insert", "abortTransaction", "insert", "commitTransaction"]);
    assert_eq!(started[3].1["txnNumber"], json!(2));

    assert!(session.abort_transaction().await.is_err());
    session.end_session().await.unwrap();
}

#[tokio::test]
async fn kill_all_sessions_aborts_open_transactions() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let session = client.start_session(SessionOptions::default()).await.unwrap();
    let call = CallOptions {
        session: Some(session.clone()),
        ..CallOptions::default()
    };
    session.start_transaction(TransactionOptions::default()).unwrap();
    client.insert_one(&ns(), doc(json!({ "_id": 1 })), &call).await.unwrap();

    client
        .run_command(
            "admin",
            doc(json!({ "killAllSessions": [] })),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    assert!(deployment.documents(&ns()).is_empty());
    assert_eq!(session.transaction_state(), TransactionState::Aborted);
}

#[tokio::test]
async fn sharded_transactions_pin_the_session() {
    let deployment =
        MemoryDeployment::new(DeploymentProfile::default().with_topology(TopologyType::Sharded));
    let (client, _) = connect(&deployment).await;
    let session = client.start_session(SessionOptions::default()).await.unwrap();
    let call = CallOptions {
        session: Some(session.clone()),
        ..CallOptions::default()
    };
    session.start_transaction(TransactionOptions::default()).unwrap();
    assert!(!session.is_pinned());
    client.insert_one(&ns(), doc(json!({ "_id": 1 })), &call).await.unwrap();
    assert!(session.is_pinned());
    session.commit_transaction().await.unwrap();
    client
        .find(&ns(), FindRequest::default(), &call)
        .await
        .unwrap();
    assert!(!session.is_pinned());
}

// ── Fail points ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn close_connection_fail_point_clears_pool_and_dirties_session() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    deployment
        .set_fail_point(fail_command(&["insert"], json!({ "closeConnection": true })))
        .unwrap();
    let session = client.start_session(SessionOptions::default()).await.unwrap();
    let call = CallOptions {
        session: Some(session.clone()),
        ..CallOptions::default()
    };
    session.start_transaction(TransactionOptions::default()).unwrap();

    let err = client
        .insert_one(&ns(), doc(json!({ "_id": 1 })), &call)
        .await
        .unwrap_err();
    assert!(err.is_network_error());
    assert!(err.has_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(session.is_dirty());

    let cmap = recorder.cmap.lock().unwrap().clone();
    assert!(cmap.iter().any(|e| matches!(e, CmapEvent::PoolCleared { .. })));
    assert!(cmap.iter().any(|e| matches!(
        e,
        CmapEvent::ConnectionClosed {
            reason: ConnectionClosedReason::Error,
            ..
        }
    )));
    assert!(deployment.active_fail_points().is_empty());
}

#[tokio::test]
async fn error_code_fail_point_fails_matching_command_once() {
    let deployment = MemoryDeployment::default();
    let (client, recorder) = connect(&deployment).await;
    client
        .run_command(
            "admin",
            fail_command(&["find"], json!({ "errorCode": 91, "errorLabels": ["RetryableWriteError"] })),
            &CallOptions::default(),
        )
        .await
        .unwrap();

    let err = match client
        .find(&ns(), FindRequest::default(), &CallOptions::default())
        .await
    {
        Err(err) => err,
        Ok(_) => panic!("expected the fail point to fire"),
    };
    assert_eq!(err.code(), Some(91));
    assert_eq!(err.code_name(), Some("ShutdownInProgress"));
    assert!(err.has_label("RetryableWriteError"));
    assert!(client
        .find(&ns(), FindRequest::default(), &CallOptions::default())
        .await
        .is_ok());

    let failed = recorder
        .commands
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, CommandEvent::Failed { .. }))
        .count();
    assert_eq!(failed, 1);
}

// ── Change streams and buckets ───────────────────────────────────────────────

#[tokio::test]
async fn change_stream_sees_writes_after_it_was_opened() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    client
        .insert_one(&ns(), doc(json!({ "_id": 0 })), &CallOptions::default())
        .await
        .unwrap();

    let mut stream = client
        .watch(
            WatchTarget::Collection(ns()),
            vec![doc(json!({ "$match": { "operationType": "insert" } }))],
            Default::default(),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    assert!(stream.next().await.unwrap().is_none());

    client
        .insert_one(&ns(), doc(json!({ "_id": 1, "x": 1 })), &CallOptions::default())
        .await
        .unwrap();
    let change = stream.next().await.unwrap().unwrap();
    assert_eq!(change["operationType"], json!("insert"));
    assert_eq!(change["fullDocument"], json!({ "_id": 1, "x": 1 }));
    assert_eq!(change["ns"], json!({ "db": "db", "coll": "coll" }));
    stream.close().await.unwrap();
}

#[tokio::test]
async fn bucket_upload_download_delete() {
    let deployment = MemoryDeployment::default();
    let (client, _) = connect(&deployment).await;
    let bucket = unified_driver::BucketOptions {
        chunk_size_bytes: 4,
        ..Default::default()
    };
    let bytes = vec![0x11, 0x22, 0x33, 0x44, 0x55, 0x66];
    let id = client
        .upload("db", &bucket, "file", bytes.clone(), None, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(
        deployment.documents(&Namespace::new("db", "fs.chunks")).len(),
        2
    );
    let downloaded = client
        .download("db", &bucket, &id, &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(downloaded, bytes);

    client
        .delete_file("db", &bucket, &id, &CallOptions::default())
        .await
        .unwrap();
    let err = client
        .download("db", &bucket, &id, &CallOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_client_error());
    assert!(err.to_string().contains("FileNotFound"));
}

#[tokio::test]
async fn build_info_and_parameters_reflect_profile() {
    let deployment = MemoryDeployment::new(
        DeploymentProfile::default()
            .with_server_version("4.4.1")
            .with_parameter("enableTestCommands", json!(1)),
    );
    let (client, _) = connect(&deployment).await;
    let info = client
        .run_command("admin", doc(json!({ "buildInfo": 1 })), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(info["version"], json!("4.4.1"));
    let params = client
        .run_command("admin", doc(json!({ "getParameter": "*" })), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(params["enableTestCommands"], json!(1));
}
