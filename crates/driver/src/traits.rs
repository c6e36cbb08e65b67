use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::DriverResult;
use crate::options::{
    AggregateOptions, BucketOptions, CallOptions, ChangeStreamOptions, ClientOptions,
    DeleteRequest, FindAndModifyRequest, FindRequest, IndexOptions, ReplaceRequest,
    SessionOptions, TopologyDescription, TransactionOptions, TransactionState, UpdateRequest,
    WriteModel,
};
use crate::results::{
    BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult,
};
use crate::{Document, Namespace};

/// A database deployment the runner can open clients against.
///
/// Implementations wrap a real driver or, for tests, the in-process
/// [`MemoryDeployment`](crate::memory::MemoryDeployment).
#[async_trait]
pub trait Deployment: Send + Sync {
    /// Open a connected client. Pool events for the new client are delivered
    /// to `options.event_handler` from this call onwards.
    async fn connect(&self, options: ClientOptions) -> DriverResult<Arc<dyn Client>>;
}

/// Target of an `aggregate` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateTarget {
    Database(String),
    Collection(Namespace),
}

/// Scope of a change stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    Cluster,
    Database(String),
    Collection(Namespace),
}

/// A connected client.
///
/// Every method that talks to the server takes `&CallOptions`, carrying the
/// session (if any) and the read/write settings inherited from the handle
/// the call was made through.
///
/// ## Events
///
/// Each server round trip produces, in order: a connection check-out,
/// `CommandEvent::Started`, `Succeeded` or `Failed`, and a check-in. The
/// runner depends on that ordering when matching events.
#[async_trait]
pub trait Client: Send + Sync {
    // ── Generic commands ─────────────────────────────────────────────────────

    /// Run an arbitrary command against `database` and return the raw reply.
    async fn run_command(
        &self,
        database: &str,
        command: Document,
        options: &CallOptions,
    ) -> DriverResult<Document>;

    // ── CRUD ─────────────────────────────────────────────────────────────────

    async fn insert_one(
        &self,
        ns: &Namespace,
        document: Document,
        options: &CallOptions,
    ) -> DriverResult<InsertOneResult>;

    async fn insert_many(
        &self,
        ns: &Namespace,
        documents: Vec<Document>,
        ordered: bool,
        options: &CallOptions,
    ) -> DriverResult<InsertManyResult>;

    async fn update(
        &self,
        ns: &Namespace,
        request: UpdateRequest,
        options: &CallOptions,
    ) -> DriverResult<UpdateResult>;

    async fn replace_one(
        &self,
        ns: &Namespace,
        request: ReplaceRequest,
        options: &CallOptions,
    ) -> DriverResult<UpdateResult>;

    async fn delete(
        &self,
        ns: &Namespace,
        request: DeleteRequest,
        options: &CallOptions,
    ) -> DriverResult<DeleteResult>;

    async fn bulk_write(
        &self,
        ns: &Namespace,
        models: Vec<WriteModel>,
        ordered: bool,
        options: &CallOptions,
    ) -> DriverResult<BulkWriteResult>;

    async fn find(
        &self,
        ns: &Namespace,
        request: FindRequest,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>>;

    /// Returns the pre- or post-image selected by `request.return_new`,
    /// or `None` when nothing matched.
    async fn find_and_modify(
        &self,
        ns: &Namespace,
        request: FindAndModifyRequest,
        options: &CallOptions,
    ) -> DriverResult<Option<Document>>;

    async fn aggregate(
        &self,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        aggregate_options: AggregateOptions,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>>;

    async fn count_documents(
        &self,
        ns: &Namespace,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<u64>;

    async fn estimated_document_count(
        &self,
        ns: &Namespace,
        options: &CallOptions,
    ) -> DriverResult<u64>;

    async fn distinct(
        &self,
        ns: &Namespace,
        field: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Value>>;

    // ── Administration ───────────────────────────────────────────────────────

    async fn create_collection(
        &self,
        database: &str,
        name: &str,
        collection_options: Document,
        options: &CallOptions,
    ) -> DriverResult<()>;

    async fn drop_collection(&self, ns: &Namespace, options: &CallOptions) -> DriverResult<()>;

    async fn list_collections(
        &self,
        database: &str,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>>;

    async fn list_databases(
        &self,
        filter: Document,
        options: &CallOptions,
    ) -> DriverResult<Vec<Document>>;

    /// Returns the name of the created index.
    async fn create_index(
        &self,
        ns: &Namespace,
        keys: Document,
        index_options: IndexOptions,
        options: &CallOptions,
    ) -> DriverResult<String>;

    async fn list_indexes(&self, ns: &Namespace, options: &CallOptions)
        -> DriverResult<Vec<Document>>;

    async fn rename_collection(
        &self,
        ns: &Namespace,
        to: &str,
        drop_target: bool,
        options: &CallOptions,
    ) -> DriverResult<()>;

    // ── Change streams ───────────────────────────────────────────────────────

    async fn watch(
        &self,
        target: WatchTarget,
        pipeline: Vec<Document>,
        stream_options: ChangeStreamOptions,
        options: &CallOptions,
    ) -> DriverResult<Box<dyn Cursor>>;

    // ── Buckets ──────────────────────────────────────────────────────────────

    /// Store `bytes` as a new file; returns the file id.
    async fn upload(
        &self,
        database: &str,
        bucket: &BucketOptions,
        filename: &str,
        bytes: Vec<u8>,
        metadata: Option<Document>,
        options: &CallOptions,
    ) -> DriverResult<Value>;

    async fn download(
        &self,
        database: &str,
        bucket: &BucketOptions,
        id: &Value,
        options: &CallOptions,
    ) -> DriverResult<Vec<u8>>;

    async fn delete_file(
        &self,
        database: &str,
        bucket: &BucketOptions,
        id: &Value,
        options: &CallOptions,
    ) -> DriverResult<()>;

    // ── Sessions and lifecycle ───────────────────────────────────────────────

    async fn start_session(&self, options: SessionOptions) -> DriverResult<Arc<dyn Session>>;

    /// Topology as currently known to the client; no server round trip.
    fn topology(&self) -> TopologyDescription;

    /// Connections currently checked out of this client's pool.
    fn connections_checked_out(&self) -> u32;

    /// Close the client and its pool. Closing twice is not an error.
    async fn close(&self) -> DriverResult<()>;
}

/// A logical session.
///
/// Methods take `&self`: a session is shared between the entity map and the
/// calls running in it, so implementations keep their state behind a lock.
#[async_trait]
pub trait Session: Send + Sync {
    /// Logical session id, as sent in the `lsid` field of commands.
    fn lsid(&self) -> Document;

    fn start_transaction(&self, options: TransactionOptions) -> DriverResult<()>;

    async fn commit_transaction(&self) -> DriverResult<()>;

    async fn abort_transaction(&self) -> DriverResult<()>;

    fn transaction_state(&self) -> TransactionState;

    /// Set after a network error was seen while the session was in use.
    fn is_dirty(&self) -> bool;

    /// True while the session is pinned to one mongos or load balancer connection.
    fn is_pinned(&self) -> bool;

    async fn end_session(&self) -> DriverResult<()>;

    /// Escape hatch for implementations that need their concrete session back.
    fn as_any(&self) -> &dyn Any;
}

/// A server-side cursor or change stream, iterated one document at a time.
#[async_trait]
pub trait Cursor: Send {
    /// The next document, or `None` once the cursor has nothing more to return.
    async fn next(&mut self) -> DriverResult<Option<Document>>;

    async fn close(&mut self) -> DriverResult<()>;
}
