use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use mongodb::options::SelectionCriteria;
use mongodb::ClientSession;
use parking_lot::Mutex;

use crate::error::{DriverError, DriverResult};
use crate::options::{
    HandleOptions, SessionOptions, TopologyType, TransactionOptions, TransactionState,
};
use crate::traits::Session;
use crate::wire::apply_concerns;
use crate::Document;

use super::convert::{from_bson, from_mongo_error, to_bson, transaction_options};
use super::MongoCore;

#[derive(Debug)]
struct Flags {
    txn_state: TransactionState,
    txn_options: TransactionOptions,
    /// Set once the driver session was told about the current transaction.
    started: bool,
    dirty: bool,
    pinned: bool,
    ended: bool,
}

/// A session on a [`MongoClient`](super::MongoClient).
///
/// The driver session is async-locked for the duration of each command, so
/// concurrent calls in one session are serialized.
pub struct MongoSession {
    core: Arc<MongoCore>,
    lsid: Document,
    defaults: Option<TransactionOptions>,
    inner: tokio::sync::Mutex<ClientSession>,
    flags: Mutex<Flags>,
}

impl MongoSession {
    pub(crate) fn new(core: Arc<MongoCore>, inner: ClientSession, options: SessionOptions) -> Self {
        let lsid = from_bson(inner.id().clone());
        MongoSession {
            core,
            lsid,
            defaults: options.default_transaction_options,
            inner: tokio::sync::Mutex::new(inner),
            flags: Mutex::new(Flags {
                txn_state: TransactionState::None,
                txn_options: TransactionOptions::default(),
                started: false,
                dirty: false,
                pinned: false,
                ended: false,
            }),
        }
    }

    pub(crate) fn belongs_to(&self, core: &MongoCore) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.core), core)
    }

    fn closed() -> DriverError {
        DriverError::Closed {
            what: "session".to_string(),
        }
    }

    /// Advance the transaction state for one command. Returns whether the
    /// command runs inside the transaction, and the options to start it
    /// with if it is the first.
    fn begin_command(&self) -> DriverResult<(bool, Option<TransactionOptions>)> {
        let mut f = self.flags.lock();
        if f.ended {
            return Err(Self::closed());
        }
        let topology = self.core.topology.topology_type;
        match f.txn_state {
            TransactionState::Starting => {
                f.txn_state = TransactionState::InProgress;
                f.pinned = matches!(topology, TopologyType::Sharded | TopologyType::LoadBalanced);
                f.started = true;
                Ok((true, Some(f.txn_options.clone())))
            }
            TransactionState::InProgress => Ok((true, None)),
            TransactionState::Committed | TransactionState::Aborted => {
                f.txn_state = TransactionState::None;
                f.pinned = false;
                Ok((false, None))
            }
            TransactionState::None => Ok((false, None)),
        }
    }

    /// Run `command` in this session.
    pub(crate) async fn run(
        &self,
        database: &str,
        mut command: Document,
        handle: &HandleOptions,
        selection: Option<SelectionCriteria>,
    ) -> DriverResult<Document> {
        let client = self.core.client()?;
        let (in_transaction, start) = self.begin_command()?;
        let name = command.keys().next().cloned().unwrap_or_default();
        if !in_transaction {
            apply_concerns(&mut command, &name, handle);
        }
        let command = to_bson(command)?;
        let selection = if in_transaction { None } else { selection };

        let mut inner = self.inner.lock().await;
        if let Some(options) = start {
            inner
                .start_transaction(transaction_options(&options))
                .await
                .map_err(from_mongo_error)?;
        }
        let result = client
            .database(database)
            .run_command_with_session(command, selection, &mut inner)
            .await
            .map_err(from_mongo_error);
        drop(inner);
        if matches!(&result, Err(err) if err.is_network_error()) {
            self.flags.lock().dirty = true;
        }
        result.map(from_bson)
    }

    fn merged_options(&self, options: TransactionOptions) -> TransactionOptions {
        let defaults = self.defaults.clone().unwrap_or_default();
        TransactionOptions {
            read_concern: options.read_concern.or(defaults.read_concern),
            write_concern: options.write_concern.or(defaults.write_concern),
            read_preference: options.read_preference.or(defaults.read_preference),
            max_commit_time_ms: options.max_commit_time_ms.or(defaults.max_commit_time_ms),
        }
    }

    fn state(&self) -> DriverResult<(TransactionState, bool)> {
        let f = self.flags.lock();
        if f.ended {
            return Err(Self::closed());
        }
        Ok((f.txn_state, f.started))
    }

    fn finish(&self, state: TransactionState) {
        let mut f = self.flags.lock();
        f.txn_state = state;
        if state == TransactionState::Aborted {
            f.pinned = false;
        }
    }
}

#[async_trait]
impl Session for MongoSession {
    fn lsid(&self) -> Document {
        self.lsid.clone()
    }

    fn start_transaction(&self, options: TransactionOptions) -> DriverResult<()> {
        let merged = self.merged_options(options);
        let mut f = self.flags.lock();
        if f.ended {
            return Err(Self::closed());
        }
        if matches!(
            f.txn_state,
            TransactionState::Starting | TransactionState::InProgress
        ) {
            return Err(DriverError::transaction("Transaction already in progress"));
        }
        f.txn_state = TransactionState::Starting;
        f.txn_options = merged;
        f.started = false;
        f.pinned = false;
        Ok(())
    }

    async fn commit_transaction(&self) -> DriverResult<()> {
        match self.state()? {
            (TransactionState::None, _) => Err(DriverError::transaction("No transaction started")),
            (TransactionState::Aborted, _) => Err(DriverError::transaction(
                "Cannot call commitTransaction after calling abortTransaction",
            )),
            // Nothing reached the server, so there is nothing to commit.
            (TransactionState::Starting, _) | (TransactionState::Committed, false) => {
                self.finish(TransactionState::Committed);
                Ok(())
            }
            (TransactionState::InProgress, _) | (TransactionState::Committed, true) => {
                self.core.client()?;
                let mut inner = self.inner.lock().await;
                let result = inner.commit_transaction().await.map_err(from_mongo_error);
                drop(inner);
                if let Err(err) = result {
                    if err.is_network_error() {
                        self.flags.lock().dirty = true;
                        return Err(err.with_label("UnknownTransactionCommitResult"));
                    }
                    return Err(err);
                }
                self.finish(TransactionState::Committed);
                Ok(())
            }
        }
    }

    async fn abort_transaction(&self) -> DriverResult<()> {
        match self.state()? {
            (TransactionState::None, _) => Err(DriverError::transaction("No transaction started")),
            (TransactionState::Committed, _) => Err(DriverError::transaction(
                "Cannot call abortTransaction after calling commitTransaction",
            )),
            (TransactionState::Aborted, _) => {
                Err(DriverError::transaction("Cannot call abortTransaction twice"))
            }
            (TransactionState::Starting, _) => {
                self.finish(TransactionState::Aborted);
                Ok(())
            }
            (TransactionState::InProgress, _) => {
                let mut inner = self.inner.lock().await;
                if let Err(err) = inner.abort_transaction().await {
                    // Abort errors are not reported; the transaction is over either way.
                    tracing::debug!(error = %err, "abortTransaction failed");
                }
                drop(inner);
                self.finish(TransactionState::Aborted);
                Ok(())
            }
        }
    }

    fn transaction_state(&self) -> TransactionState {
        self.flags.lock().txn_state
    }

    fn is_dirty(&self) -> bool {
        self.flags.lock().dirty
    }

    fn is_pinned(&self) -> bool {
        self.flags.lock().pinned
    }

    async fn end_session(&self) -> DriverResult<()> {
        let state = {
            let f = self.flags.lock();
            if f.ended {
                return Ok(());
            }
            f.txn_state
        };
        if state == TransactionState::InProgress {
            self.abort_transaction().await?;
        }
        self.flags.lock().ended = true;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
