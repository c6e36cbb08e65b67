//! Option types passed across the driver boundary.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::event::EventHandler;
use crate::traits::Session;
use crate::Document;

// ── Concerns and read preference ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConcern {
    pub level: String,
}

impl ReadConcern {
    pub fn local() -> Self {
        ReadConcern {
            level: "local".to_string(),
        }
    }
}

/// The `w` component of a write concern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    Nodes(u32),
    Majority,
    Custom(String),
}

impl Acknowledgment {
    fn to_json(&self) -> Value {
        match self {
            Acknowledgment::Nodes(n) => json!(n),
            Acknowledgment::Majority => json!("majority"),
            Acknowledgment::Custom(tag) => json!(tag),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteConcern {
    pub w: Option<Acknowledgment>,
    pub w_timeout_ms: Option<u64>,
    pub journal: Option<bool>,
}

impl WriteConcern {
    pub fn majority() -> Self {
        WriteConcern {
            w: Some(Acknowledgment::Majority),
            ..WriteConcern::default()
        }
    }

    /// Wire form, as it appears in a command's `writeConcern` field.
    pub fn to_document(&self) -> Document {
        let mut doc = Map::new();
        if let Some(w) = &self.w {
            doc.insert("w".to_string(), w.to_json());
        }
        if let Some(t) = self.w_timeout_ms {
            doc.insert("wtimeout".to_string(), json!(t));
        }
        if let Some(j) = self.journal {
            doc.insert("j".to_string(), json!(j));
        }
        doc
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    Secondary,
    SecondaryPreferred,
    Nearest,
}

impl ReadPreferenceMode {
    pub fn parse(mode: &str) -> Option<Self> {
        match mode.to_ascii_lowercase().as_str() {
            "primary" => Some(ReadPreferenceMode::Primary),
            "primarypreferred" => Some(ReadPreferenceMode::PrimaryPreferred),
            "secondary" => Some(ReadPreferenceMode::Secondary),
            "secondarypreferred" => Some(ReadPreferenceMode::SecondaryPreferred),
            "nearest" => Some(ReadPreferenceMode::Nearest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReadPreference {
    pub mode: ReadPreferenceMode,
    pub max_staleness_seconds: Option<i64>,
    pub tags: Vec<Document>,
    pub hedge: Option<bool>,
}

impl ReadPreference {
    pub fn primary() -> Self {
        ReadPreference {
            mode: ReadPreferenceMode::Primary,
            max_staleness_seconds: None,
            tags: Vec::new(),
            hedge: None,
        }
    }
}

/// Read/write settings inherited from a database or collection handle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandleOptions {
    pub read_concern: Option<ReadConcern>,
    pub read_preference: Option<ReadPreference>,
    pub write_concern: Option<WriteConcern>,
}

impl HandleOptions {
    /// Overlay `child` on top of `self`; fields set in `child` win.
    pub fn merged_with(&self, child: &HandleOptions) -> HandleOptions {
        HandleOptions {
            read_concern: child
                .read_concern
                .clone()
                .or_else(|| self.read_concern.clone()),
            read_preference: child
                .read_preference
                .clone()
                .or_else(|| self.read_preference.clone()),
            write_concern: child
                .write_concern
                .clone()
                .or_else(|| self.write_concern.clone()),
        }
    }
}

/// Per-call context: the session to run in and the inherited handle options.
#[derive(Clone, Default)]
pub struct CallOptions {
    pub session: Option<Arc<dyn Session>>,
    pub handle: HandleOptions,
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("session", &self.session.as_ref().map(|s| s.lsid()))
            .field("handle", &self.handle)
            .finish()
    }
}

impl CallOptions {
    pub fn with_handle(handle: HandleOptions) -> Self {
        CallOptions {
            session: None,
            handle,
        }
    }
}

// ── Client construction ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerApiOptions {
    pub version: String,
    pub strict: Option<bool>,
    pub deprecation_errors: Option<bool>,
}

#[derive(Clone, Default)]
pub struct ClientOptions {
    /// Connection string; `None` means the deployment's default endpoint.
    pub uri: Option<String>,
    pub uri_options: Document,
    pub use_multiple_mongoses: bool,
    pub server_api: Option<ServerApiOptions>,
    /// Receives command and connection-pool events, in emission order.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("uri", &self.uri)
            .field("uri_options", &self.uri_options)
            .field("use_multiple_mongoses", &self.use_multiple_mongoses)
            .field("server_api", &self.server_api)
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

// ── Sessions and transactions ────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransactionOptions {
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
    pub read_preference: Option<ReadPreference>,
    pub max_commit_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionOptions {
    pub causal_consistency: Option<bool>,
    pub snapshot: Option<bool>,
    pub default_transaction_options: Option<TransactionOptions>,
}

/// Client-side state of a session's current transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    None,
    Starting,
    InProgress,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionState::None => "none",
            TransactionState::Starting => "starting",
            TransactionState::InProgress => "in_progress",
            TransactionState::Committed => "committed",
            TransactionState::Aborted => "aborted",
        }
    }
}

// ── Topology ─────────────────────────────────────────────────────────────────

/// Topology type as discovered by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TopologyType {
    Single,
    ReplicaSet,
    Sharded,
    LoadBalanced,
}

/// What the driver knows about the deployment it is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescription {
    pub topology_type: TopologyType,
    /// For sharded deployments: whether every shard is a replica set.
    pub shards_are_replica_sets: bool,
}

// ── Operation requests ───────────────────────────────────────────────────────

/// An update given either as operator document or as aggregation pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateModifications {
    Document(Document),
    Pipeline(Vec<Document>),
}

impl UpdateModifications {
    pub fn to_json(&self) -> Value {
        match self {
            UpdateModifications::Document(d) => Value::Object(d.clone()),
            UpdateModifications::Pipeline(p) => {
                Value::Array(p.iter().cloned().map(Value::Object).collect())
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindRequest {
    pub filter: Document,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub skip: Option<u64>,
    pub limit: Option<i64>,
    pub batch_size: Option<u32>,
    pub comment: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub filter: Document,
    pub update: UpdateModifications,
    pub multi: bool,
    pub upsert: bool,
    pub array_filters: Option<Vec<Document>>,
    pub hint: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceRequest {
    pub filter: Document,
    pub replacement: Document,
    pub upsert: bool,
    pub hint: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRequest {
    pub filter: Document,
    pub multi: bool,
    pub hint: Option<Value>,
}

/// What a `findAndModify` does to the matched document.
#[derive(Debug, Clone, PartialEq)]
pub enum FindAndModifyAction {
    Update(UpdateModifications),
    Replace(Document),
    Remove,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindAndModifyRequest {
    pub filter: Document,
    pub action: FindAndModifyAction,
    pub sort: Option<Document>,
    pub projection: Option<Document>,
    pub upsert: bool,
    /// Return the document as it is after the modification.
    pub return_new: bool,
}

/// One element of a `bulkWrite` request.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteModel {
    InsertOne(Document),
    UpdateOne(UpdateRequest),
    UpdateMany(UpdateRequest),
    ReplaceOne(ReplaceRequest),
    DeleteOne(DeleteRequest),
    DeleteMany(DeleteRequest),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateOptions {
    pub batch_size: Option<u32>,
    pub allow_disk_use: Option<bool>,
    pub let_vars: Option<Document>,
    pub comment: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeStreamOptions {
    pub full_document: Option<String>,
    pub batch_size: Option<u32>,
    pub resume_after: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexOptions {
    pub name: Option<String>,
    pub unique: Option<bool>,
}

/// Settings of a GridFS-style bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketOptions {
    pub bucket_name: String,
    pub chunk_size_bytes: u32,
    pub write_concern: Option<WriteConcern>,
}

impl Default for BucketOptions {
    fn default() -> Self {
        BucketOptions {
            bucket_name: "fs".to_string(),
            chunk_size_bytes: 255 * 1024,
            write_concern: None,
        }
    }
}
