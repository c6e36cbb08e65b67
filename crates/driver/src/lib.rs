//! unified-driver: the database client boundary consumed by the unified test runner.
//!
//! The runner never talks to a database directly. It opens clients through a
//! [`Deployment`], runs CRUD and administrative calls through [`Client`],
//! drives transactions through [`Session`], and observes command and
//! connection-pool events through an [`EventHandler`] installed at connect
//! time.
//!
//! [`mongo::MongoDeployment`] implements the boundary over the official
//! `mongodb` driver for running suites against a live deployment.
//! [`memory::MemoryDeployment`] implements it in-process. It backs the
//! runner's own tests and the `unified` CLI's simulated mode.

mod error;
mod event;
pub mod memory;
pub mod mongo;
mod options;
mod results;
mod traits;
mod wire;

use std::fmt;

pub use error::{DriverError, DriverResult, NAMESPACE_NOT_FOUND, TRANSIENT_TRANSACTION_ERROR};
pub use event::{
    CheckOutFailedReason, CmapEvent, CommandEvent, ConnectionClosedReason, EventHandler,
};
pub use options::{
    Acknowledgment, AggregateOptions, BucketOptions, CallOptions, ChangeStreamOptions,
    ClientOptions, DeleteRequest, FindAndModifyAction, FindAndModifyRequest, FindRequest,
    HandleOptions, IndexOptions, ReadConcern, ReadPreference, ReadPreferenceMode,
    ReplaceRequest, ServerApiOptions, SessionOptions, TopologyDescription, TopologyType,
    TransactionOptions, TransactionState, UpdateModifications, UpdateRequest, WriteConcern,
    WriteModel,
};
pub use results::{BulkWriteResult, DeleteResult, InsertManyResult, InsertOneResult, UpdateResult};
pub use traits::{AggregateTarget, Client, Cursor, Deployment, Session, WatchTarget};

/// A JSON object, the unit of data exchanged with the deployment.
pub type Document = serde_json::Map<String, serde_json::Value>;

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Namespace {
            db: db.into(),
            coll: coll.into(),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}
