//! Typed structs representing a unified test suite document.
//!
//! These types are pure data: they are deserialized once from the suite
//! JSON and never mutated by the runner. Fields whose shape depends on the
//! operation being run (operation arguments, expected results) are kept as
//! `serde_json::Value` and interpreted by the consumer.

use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::deserialize::FormatError;

/// A JSON object, the unit of data exchanged with the deployment.
pub type Document = Map<String, Value>;

// ── Suite ───────────────────────────────────────────────────────────

/// Top-level suite document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suite {
    pub description: String,
    pub schema_version: String,
    #[serde(default)]
    pub run_on_requirements: Vec<RunOnRequirement>,
    #[serde(default)]
    pub create_entities: Vec<EntityDescription>,
    /// Data seeded before every test in the suite.
    #[serde(default)]
    pub initial_data: Vec<CollectionData>,
    pub tests: Vec<Test>,
}

/// A single test case within a suite.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Test {
    pub description: String,
    #[serde(default)]
    pub run_on_requirements: Vec<RunOnRequirement>,
    pub skip_reason: Option<String>,
    pub operations: Vec<OperationDescription>,
    pub expect_events: Option<Vec<ExpectedEventsForClient>>,
    pub outcome: Option<Vec<CollectionData>>,
}

/// Documents in one collection, used for seeding and for outcome checks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionData {
    pub database_name: String,
    pub collection_name: String,
    #[serde(default)]
    pub documents: Vec<Document>,
}

// ── Requirements ────────────────────────────────────────────────────

/// Topology classes a requirement can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Topology {
    #[serde(rename = "single")]
    Single,
    #[serde(rename = "replicaset")]
    ReplicaSet,
    #[serde(rename = "sharded")]
    Sharded,
    #[serde(rename = "sharded-replicaset")]
    ShardedReplicaSet,
    #[serde(rename = "load-balanced")]
    LoadBalanced,
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Topology::Single => "single",
            Topology::ReplicaSet => "replicaset",
            Topology::Sharded => "sharded",
            Topology::ShardedReplicaSet => "sharded-replicaset",
            Topology::LoadBalanced => "load-balanced",
        };
        f.write_str(name)
    }
}

/// How a requirement treats serverless deployments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerlessRequirement {
    Forbid,
    Allow,
    Require,
}

/// A conjunction of optional predicates over deployment facts.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOnRequirement {
    pub serverless: Option<ServerlessRequirement>,
    pub auth: Option<bool>,
    pub min_server_version: Option<String>,
    pub max_server_version: Option<String>,
    pub topologies: Option<Vec<Topology>>,
    pub server_parameters: Option<Document>,
}

// ── Entities ────────────────────────────────────────────────────────

/// Kind discriminant for declared and result-bound entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Client,
    Database,
    Collection,
    Session,
    Bucket,
    Stream,
    Cursor,
    ChangeStream,
    Value,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Client => "client",
            EntityKind::Database => "database",
            EntityKind::Collection => "collection",
            EntityKind::Session => "session",
            EntityKind::Bucket => "bucket",
            EntityKind::Stream => "stream",
            EntityKind::Cursor => "cursor",
            EntityKind::ChangeStream => "changeStream",
            EntityKind::Value => "value",
        };
        f.write_str(name)
    }
}

/// One entry of `createEntities`, keyed by its kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityDescription {
    Client(ClientEntity),
    Database(DatabaseEntity),
    Collection(CollectionEntity),
    Bucket(BucketEntity),
    Stream(StreamEntity),
    Session(SessionEntity),
}

impl EntityDescription {
    pub fn id(&self) -> &str {
        match self {
            EntityDescription::Client(e) => &e.id,
            EntityDescription::Database(e) => &e.id,
            EntityDescription::Collection(e) => &e.id,
            EntityDescription::Bucket(e) => &e.id,
            EntityDescription::Stream(e) => &e.id,
            EntityDescription::Session(e) => &e.id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityDescription::Client(_) => EntityKind::Client,
            EntityDescription::Database(_) => EntityKind::Database,
            EntityDescription::Collection(_) => EntityKind::Collection,
            EntityDescription::Bucket(_) => EntityKind::Bucket,
            EntityDescription::Stream(_) => EntityKind::Stream,
            EntityDescription::Session(_) => EntityKind::Session,
        }
    }
}

/// Event names a client entity may be asked to observe.
///
/// Pool events are accepted under both their `connectionPool*` and
/// `pool*` spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ObservableEvent {
    CommandStartedEvent,
    CommandSucceededEvent,
    CommandFailedEvent,
    #[serde(rename = "connectionPoolCreatedEvent", alias = "poolCreatedEvent")]
    PoolCreatedEvent,
    #[serde(rename = "connectionPoolReadyEvent", alias = "poolReadyEvent")]
    PoolReadyEvent,
    #[serde(rename = "connectionPoolClearedEvent", alias = "poolClearedEvent")]
    PoolClearedEvent,
    #[serde(rename = "connectionPoolClosedEvent", alias = "poolClosedEvent")]
    PoolClosedEvent,
    ConnectionCreatedEvent,
    ConnectionReadyEvent,
    ConnectionClosedEvent,
    ConnectionCheckOutStartedEvent,
    ConnectionCheckOutFailedEvent,
    ConnectionCheckedOutEvent,
    ConnectionCheckedInEvent,
}

impl ObservableEvent {
    pub fn is_command_event(self) -> bool {
        matches!(
            self,
            ObservableEvent::CommandStartedEvent
                | ObservableEvent::CommandSucceededEvent
                | ObservableEvent::CommandFailedEvent
        )
    }
}

/// Declared server API version for a client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerApi {
    pub version: String,
    pub strict: Option<bool>,
    pub deprecation_errors: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntity {
    pub id: String,
    pub uri_options: Option<Document>,
    pub use_multiple_mongoses: Option<bool>,
    #[serde(default)]
    pub observe_events: Vec<ObservableEvent>,
    #[serde(default)]
    pub ignore_command_monitoring_events: Vec<String>,
    pub server_api: Option<ServerApi>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseEntity {
    pub id: String,
    pub client: String,
    pub database_name: String,
    pub database_options: Option<CollectionOrDatabaseOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionEntity {
    pub id: String,
    pub database: String,
    pub collection_name: String,
    pub collection_options: Option<CollectionOrDatabaseOptions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEntity {
    pub id: String,
    pub client: String,
    pub session_options: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketEntity {
    pub id: String,
    pub database: String,
    pub bucket_options: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntity {
    pub id: String,
    pub hex_bytes: String,
}

// ── Handle options ──────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionOrDatabaseOptions {
    pub read_concern: Option<ReadConcernSpec>,
    pub read_preference: Option<ReadPreferenceSpec>,
    pub write_concern: Option<WriteConcernSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadConcernSpec {
    pub level: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadPreferenceSpec {
    pub mode: String,
    pub max_staleness_seconds: Option<i64>,
    #[serde(default)]
    pub tags: Vec<Document>,
    pub hedge: Option<HedgeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HedgeSpec {
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteConcernSpec {
    /// Either a node count or a tag name such as `"majority"`.
    pub w: Option<Value>,
    #[serde(rename = "wtimeoutMS")]
    pub wtimeout_ms: Option<u64>,
    pub journal: Option<bool>,
}

// ── Operations ──────────────────────────────────────────────────────

/// The closed set of operations the interpreter knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationName {
    AbortTransaction,
    Aggregate,
    AssertCollectionExists,
    AssertCollectionNotExists,
    AssertIndexExists,
    AssertIndexNotExists,
    AssertDifferentLsidOnLastTwoCommands,
    AssertSameLsidOnLastTwoCommands,
    AssertSessionDirty,
    AssertSessionNotDirty,
    AssertSessionPinned,
    AssertSessionUnpinned,
    AssertSessionTransactionState,
    AssertNumberConnectionsCheckedOut,
    BulkWrite,
    Close,
    CommitTransaction,
    CreateChangeStream,
    CreateCollection,
    CreateFindCursor,
    CreateIndex,
    DeleteOne,
    DropCollection,
    EndSession,
    Find,
    FindOneAndReplace,
    FindOneAndUpdate,
    FindOneAndDelete,
    FailPoint,
    InsertOne,
    InsertMany,
    IterateUntilDocumentOrError,
    ListCollections,
    ListDatabases,
    ListIndexes,
    ReplaceOne,
    StartTransaction,
    TargetedFailPoint,
    Delete,
    Download,
    Upload,
    WithTransaction,
    CountDocuments,
    DeleteMany,
    Distinct,
    EstimatedDocumentCount,
    RunCommand,
    UpdateMany,
    UpdateOne,
    Rename,
}

impl OperationName {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationName::AbortTransaction => "abortTransaction",
            OperationName::Aggregate => "aggregate",
            OperationName::AssertCollectionExists => "assertCollectionExists",
            OperationName::AssertCollectionNotExists => "assertCollectionNotExists",
            OperationName::AssertIndexExists => "assertIndexExists",
            OperationName::AssertIndexNotExists => "assertIndexNotExists",
            OperationName::AssertDifferentLsidOnLastTwoCommands => {
                "assertDifferentLsidOnLastTwoCommands"
            }
            OperationName::AssertSameLsidOnLastTwoCommands => "assertSameLsidOnLastTwoCommands",
            OperationName::AssertSessionDirty => "assertSessionDirty",
            OperationName::AssertSessionNotDirty => "assertSessionNotDirty",
            OperationName::AssertSessionPinned => "assertSessionPinned",
            OperationName::AssertSessionUnpinned => "assertSessionUnpinned",
            OperationName::AssertSessionTransactionState => "assertSessionTransactionState",
            OperationName::AssertNumberConnectionsCheckedOut => "assertNumberConnectionsCheckedOut",
            OperationName::BulkWrite => "bulkWrite",
            OperationName::Close => "close",
            OperationName::CommitTransaction => "commitTransaction",
            OperationName::CreateChangeStream => "createChangeStream",
            OperationName::CreateCollection => "createCollection",
            OperationName::CreateFindCursor => "createFindCursor",
            OperationName::CreateIndex => "createIndex",
            OperationName::DeleteOne => "deleteOne",
            OperationName::DropCollection => "dropCollection",
            OperationName::EndSession => "endSession",
            OperationName::Find => "find",
            OperationName::FindOneAndReplace => "findOneAndReplace",
            OperationName::FindOneAndUpdate => "findOneAndUpdate",
            OperationName::FindOneAndDelete => "findOneAndDelete",
            OperationName::FailPoint => "failPoint",
            OperationName::InsertOne => "insertOne",
            OperationName::InsertMany => "insertMany",
            OperationName::IterateUntilDocumentOrError => "iterateUntilDocumentOrError",
            OperationName::ListCollections => "listCollections",
            OperationName::ListDatabases => "listDatabases",
            OperationName::ListIndexes => "listIndexes",
            OperationName::ReplaceOne => "replaceOne",
            OperationName::StartTransaction => "startTransaction",
            OperationName::TargetedFailPoint => "targetedFailPoint",
            OperationName::Delete => "delete",
            OperationName::Download => "download",
            OperationName::Upload => "upload",
            OperationName::WithTransaction => "withTransaction",
            OperationName::CountDocuments => "countDocuments",
            OperationName::DeleteMany => "deleteMany",
            OperationName::Distinct => "distinct",
            OperationName::EstimatedDocumentCount => "estimatedDocumentCount",
            OperationName::RunCommand => "runCommand",
            OperationName::UpdateMany => "updateMany",
            OperationName::UpdateOne => "updateOne",
            OperationName::Rename => "rename",
        }
    }
}

impl fmt::Display for OperationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a test.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationDescription {
    pub name: OperationName,
    /// Entity id the operation targets, or `"testRunner"`.
    pub object: String,
    pub arguments: Option<Document>,
    pub expect_error: Option<ExpectedError>,
    pub expect_result: Option<Value>,
    pub save_result_as_entity: Option<String>,
    #[serde(default)]
    pub ignore_result_and_error: bool,
}

/// Predicates over the error an operation is expected to raise.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedError {
    pub is_error: Option<bool>,
    pub is_client_error: Option<bool>,
    pub error_contains: Option<String>,
    pub error_code: Option<i32>,
    pub error_code_name: Option<String>,
    #[serde(default)]
    pub error_labels_contain: Vec<String>,
    #[serde(default)]
    pub error_labels_omit: Vec<String>,
    /// Partial result carried by the error, such as a bulk write result.
    pub expect_result: Option<Value>,
}

// ── Expected events ─────────────────────────────────────────────────

/// Which event stream of a client an expectation list applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventType {
    #[default]
    Command,
    Cmap,
}

/// Expected events for one client, already split by stream.
#[derive(Debug, Clone)]
pub enum ExpectedEventList {
    Command(Vec<ExpectedCommandEvent>),
    Cmap(Vec<ExpectedCmapEvent>),
}

impl ExpectedEventList {
    pub fn event_type(&self) -> EventType {
        match self {
            ExpectedEventList::Command(_) => EventType::Command,
            ExpectedEventList::Cmap(_) => EventType::Cmap,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            ExpectedEventList::Command(events) => events.len(),
            ExpectedEventList::Cmap(events) => events.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawExpectedEvents")]
pub struct ExpectedEventsForClient {
    pub client: String,
    pub events: ExpectedEventList,
    pub ignore_extra_events: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExpectedEvents {
    client: String,
    event_type: Option<String>,
    events: Vec<Value>,
    #[serde(default)]
    ignore_extra_events: bool,
}

impl TryFrom<RawExpectedEvents> for ExpectedEventsForClient {
    type Error = FormatError;

    fn try_from(raw: RawExpectedEvents) -> Result<Self, Self::Error> {
        let events = match raw.event_type.as_deref().unwrap_or("command") {
            "command" => ExpectedEventList::Command(parse_events(&raw.client, raw.events)?),
            "cmap" => ExpectedEventList::Cmap(parse_events(&raw.client, raw.events)?),
            other => {
                return Err(FormatError::InvalidField {
                    field: "eventType".to_string(),
                    message: format!("unsupported event type '{}' for client '{}'", other, raw.client),
                })
            }
        };
        Ok(ExpectedEventsForClient {
            client: raw.client,
            events,
            ignore_extra_events: raw.ignore_extra_events,
        })
    }
}

fn parse_events<T: serde::de::DeserializeOwned>(
    client: &str,
    events: Vec<Value>,
) -> Result<Vec<T>, FormatError> {
    events
        .into_iter()
        .enumerate()
        .map(|(i, v)| {
            serde_json::from_value(v).map_err(|e| FormatError::InvalidField {
                field: format!("expectEvents[{}].events[{}]", client, i),
                message: e.to_string(),
            })
        })
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedCommandEvent {
    CommandStartedEvent(ExpectedCommandStarted),
    CommandSucceededEvent(ExpectedCommandSucceeded),
    CommandFailedEvent(ExpectedCommandFailed),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCommandStarted {
    pub command: Option<Document>,
    pub command_name: Option<String>,
    pub database_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCommandSucceeded {
    pub reply: Option<Document>,
    pub command_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCommandFailed {
    pub command_name: Option<String>,
}

/// Pool and connection lifecycle expectations.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExpectedCmapEvent {
    PoolCreatedEvent(NoFields),
    PoolReadyEvent(NoFields),
    PoolClearedEvent(ExpectedPoolCleared),
    PoolClosedEvent(NoFields),
    ConnectionCreatedEvent(NoFields),
    ConnectionReadyEvent(NoFields),
    ConnectionClosedEvent(ExpectedConnectionClosed),
    ConnectionCheckOutStartedEvent(NoFields),
    ConnectionCheckOutFailedEvent(ExpectedCheckOutFailed),
    ConnectionCheckedOutEvent(NoFields),
    ConnectionCheckedInEvent(NoFields),
}

/// An expectation that carries no fields, written as `{}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NoFields {}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedPoolCleared {
    pub service_id: Option<Value>,
    pub has_service_id: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedConnectionClosed {
    pub reason: Option<String>,
    pub has_service_id: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExpectedCheckOutFailed {
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn entity_description_dispatches_on_key() {
        let desc: EntityDescription = serde_json::from_value(json!({
            "collection": { "id": "coll0", "database": "db0", "collectionName": "test" }
        }))
        .unwrap();
        assert_eq!(desc.id(), "coll0");
        assert_eq!(desc.kind(), EntityKind::Collection);
    }

    #[test]
    fn observe_events_accepts_both_pool_spellings() {
        let client: ClientEntity = serde_json::from_value(json!({
            "id": "client0",
            "observeEvents": ["poolCreatedEvent", "connectionPoolReadyEvent", "commandStartedEvent"]
        }))
        .unwrap();
        assert_eq!(
            client.observe_events,
            vec![
                ObservableEvent::PoolCreatedEvent,
                ObservableEvent::PoolReadyEvent,
                ObservableEvent::CommandStartedEvent
            ]
        );
    }

    #[test]
    fn unknown_operation_name_is_rejected() {
        let result: Result<OperationDescription, _> = serde_json::from_value(json!({
            "name": "mapReduce",
            "object": "collection0"
        }));
        assert!(result.is_err());
    }

    #[test]
    fn operation_name_round_trips_through_as_str() {
        let op: OperationDescription = serde_json::from_value(json!({
            "name": "assertDifferentLsidOnLastTwoCommands",
            "object": "testRunner",
            "arguments": { "client": "client0" }
        }))
        .unwrap();
        assert_eq!(op.name.as_str(), "assertDifferentLsidOnLastTwoCommands");
        assert!(!op.ignore_result_and_error);
    }

    #[test]
    fn expected_events_default_to_command_stream() {
        let expected: ExpectedEventsForClient = serde_json::from_value(json!({
            "client": "client0",
            "events": [
                { "commandStartedEvent": { "commandName": "insert" } }
            ]
        }))
        .unwrap();
        assert_eq!(expected.events.event_type(), EventType::Command);
        assert_eq!(expected.events.len(), 1);
        assert!(!expected.ignore_extra_events);
    }

    #[test]
    fn cmap_expectations_parse_empty_objects() {
        let expected: ExpectedEventsForClient = serde_json::from_value(json!({
            "client": "client0",
            "eventType": "cmap",
            "ignoreExtraEvents": true,
            "events": [
                { "connectionCheckedOutEvent": {} },
                { "connectionClosedEvent": { "reason": "error" } }
            ]
        }))
        .unwrap();
        match expected.events {
            ExpectedEventList::Cmap(events) => {
                assert_eq!(events.len(), 2);
                assert!(matches!(
                    &events[1],
                    ExpectedCmapEvent::ConnectionClosedEvent(e) if e.reason.as_deref() == Some("error")
                ));
            }
            other => panic!("expected cmap events, got {:?}", other),
        }
        assert!(expected.ignore_extra_events);
    }

    #[test]
    fn command_event_under_cmap_stream_is_rejected() {
        let result: Result<ExpectedEventsForClient, _> = serde_json::from_value(json!({
            "client": "client0",
            "eventType": "cmap",
            "events": [ { "commandStartedEvent": {} } ]
        }));
        assert!(result.is_err());
    }
}
