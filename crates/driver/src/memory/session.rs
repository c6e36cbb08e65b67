use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use crate::error::{DriverError, DriverResult};
use crate::options::{
    HandleOptions, ReadConcern, SessionOptions, TopologyType, TransactionOptions,
    TransactionState, WriteConcern,
};
use crate::traits::Session;
use crate::Document;

use super::client::ClientCore;
use super::store::{ChangeRecord, Store};
use super::ServerState;

/// Session state shared with the server so `killAllSessions` can abort it.
#[derive(Debug)]
pub(crate) struct SessionState {
    txn_state: TransactionState,
    txn_number: i64,
    txn_options: TransactionOptions,
    /// Store contents before the transaction's first command.
    snapshot: Option<Store>,
    /// Writes made inside the transaction, published on commit.
    pending: Vec<ChangeRecord>,
    dirty: bool,
    pinned: bool,
    ended: bool,
}

impl SessionState {
    /// Roll back an open transaction, restoring the store it snapshotted.
    pub fn kill(&mut self, store: &mut Store) {
        if let Some(snapshot) = self.snapshot.take() {
            *store = snapshot;
        }
        self.pending.clear();
        if self.txn_state == TransactionState::InProgress {
            self.txn_state = TransactionState::Aborted;
        }
        self.pinned = false;
    }
}

/// How a command relates to the session it runs in.
#[derive(Debug, Clone, Default)]
pub(crate) struct TxnContext {
    pub lsid: Option<Document>,
    pub txn_number: Option<i64>,
    /// First command of the transaction.
    pub starts: bool,
    pub read_concern: Option<ReadConcern>,
    pub write_concern: Option<WriteConcern>,
}

impl TxnContext {
    pub fn in_transaction(&self) -> bool {
        self.txn_number.is_some()
    }
}

/// A session on a [`MemoryClient`](super::MemoryClient).
pub struct MemorySession {
    core: Arc<ClientCore>,
    lsid: Document,
    defaults: Option<TransactionOptions>,
    shared: Arc<Mutex<SessionState>>,
}

impl MemorySession {
    pub(crate) fn new(core: Arc<ClientCore>, lsid: Document, options: SessionOptions) -> Self {
        MemorySession {
            core,
            lsid,
            defaults: options.default_transaction_options,
            shared: Arc::new(Mutex::new(SessionState {
                txn_state: TransactionState::None,
                txn_number: 0,
                txn_options: TransactionOptions::default(),
                snapshot: None,
                pending: Vec::new(),
                dirty: false,
                pinned: false,
                ended: false,
            })),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Mutex<SessionState>> {
        &self.shared
    }

    pub(crate) fn belongs_to(&self, core: &ClientCore) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.core), core)
    }

    /// Work out the session fields for `command_name` and advance the
    /// transaction state machine.
    pub(crate) fn prepare(&self, command_name: &str, topology: TopologyType) -> DriverResult<TxnContext> {
        let mut s = self.shared.lock();
        if s.ended {
            return Err(DriverError::Closed {
                what: "session".to_string(),
            });
        }
        let mut ctx = TxnContext {
            lsid: Some(self.lsid.clone()),
            ..TxnContext::default()
        };
        if matches!(command_name, "commitTransaction" | "abortTransaction") {
            ctx.txn_number = Some(s.txn_number);
            ctx.write_concern = s.txn_options.write_concern.clone();
            return Ok(ctx);
        }
        match s.txn_state {
            TransactionState::Starting => {
                s.txn_state = TransactionState::InProgress;
                s.pinned = matches!(topology, TopologyType::Sharded | TopologyType::LoadBalanced);
                ctx.txn_number = Some(s.txn_number);
                ctx.starts = true;
                ctx.read_concern = s.txn_options.read_concern.clone();
            }
            TransactionState::InProgress => {
                ctx.txn_number = Some(s.txn_number);
            }
            TransactionState::Committed | TransactionState::Aborted => {
                s.txn_state = TransactionState::None;
                s.pinned = false;
            }
            TransactionState::None => {}
        }
        Ok(ctx)
    }

    /// Called under the server lock before the first command of a transaction runs.
    pub(crate) fn capture_snapshot(&self, store: &Store) {
        let mut s = self.shared.lock();
        if s.snapshot.is_none() {
            s.snapshot = Some(store.clone());
        }
    }

    pub(crate) fn defer_changes(&self, changes: Vec<ChangeRecord>) {
        self.shared.lock().pending.extend(changes);
    }

    pub(crate) fn mark_dirty(&self) {
        self.shared.lock().dirty = true;
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

    fn state(&self) -> DriverResult<TransactionState> {
        let s = self.shared.lock();
        if s.ended {
            return Err(DriverError::Closed {
                what: "session".to_string(),
            });
        }
        Ok(s.txn_state)
    }

    fn transaction_command(&self, name: &str) -> Document {
        let mut command = Document::new();
        command.insert(name.to_string(), json!(1));
        if name == "commitTransaction" {
            if let Some(ms) = self.shared.lock().txn_options.max_commit_time_ms {
                command.insert("maxTimeMS".to_string(), json!(ms));
            }
        }
        command
    }

    fn rollback(&self, state: &mut ServerState) {
        self.shared.lock().kill(&mut state.store);
    }
}

#[async_trait]
impl Session for MemorySession {
    fn lsid(&self) -> Document {
        self.lsid.clone()
    }

    fn start_transaction(&self, options: TransactionOptions) -> DriverResult<()> {
        let merged = self.merged_options(options);
        let mut s = self.shared.lock();
        if s.ended {
            return Err(DriverError::Closed {
                what: "session".to_string(),
            });
        }
        if matches!(
            s.txn_state,
            TransactionState::Starting | TransactionState::InProgress
        ) {
            return Err(DriverError::transaction("Transaction already in progress"));
        }
        s.txn_number += 1;
        s.txn_state = TransactionState::Starting;
        s.txn_options = merged;
        s.snapshot = None;
        s.pending.clear();
        s.pinned = false;
        Ok(())
    }

    async fn commit_transaction(&self) -> DriverResult<()> {
        match self.state()? {
            TransactionState::None => Err(DriverError::transaction("No transaction started")),
            TransactionState::Aborted => Err(DriverError::transaction(
                "Cannot call commitTransaction after calling abortTransaction",
            )),
            TransactionState::Starting => {
                // Nothing was sent, so there is nothing to commit server-side.
                self.shared.lock().txn_state = TransactionState::Committed;
                Ok(())
            }
            TransactionState::InProgress | TransactionState::Committed => {
                let command = self.transaction_command("commitTransaction");
                let shared = self.shared.clone();
                self.core.round_trip(
                    "admin",
                    command,
                    Some(self),
                    &HandleOptions::default(),
                    |state, _| {
                        let pending = {
                            let mut s = shared.lock();
                            s.snapshot = None;
                            std::mem::take(&mut s.pending)
                        };
                        state.publish(pending);
                        Ok((Document::new(), ()))
                    },
                )
                .map_err(|err| {
                    if err.is_network_error() {
                        err.with_label("UnknownTransactionCommitResult")
                    } else {
                        err
                    }
                })?;
                self.shared.lock().txn_state = TransactionState::Committed;
                Ok(())
            }
        }
    }

    async fn abort_transaction(&self) -> DriverResult<()> {
        match self.state()? {
            TransactionState::None => Err(DriverError::transaction("No transaction started")),
            TransactionState::Committed => Err(DriverError::transaction(
                "Cannot call abortTransaction after calling commitTransaction",
            )),
            TransactionState::Aborted => {
                Err(DriverError::transaction("Cannot call abortTransaction twice"))
            }
            TransactionState::Starting => {
                self.shared.lock().txn_state = TransactionState::Aborted;
                Ok(())
            }
            TransactionState::InProgress => {
                let command = self.transaction_command("abortTransaction");
                let result = self.core.round_trip(
                    "admin",
                    command,
                    Some(self),
                    &HandleOptions::default(),
                    |state, _| {
                        self.rollback(state);
                        Ok((Document::new(), ()))
                    },
                );
                if let Err(err) = result {
                    // Abort errors are not reported; the transaction is over either way.
                    tracing::debug!(error = %err, "abortTransaction failed");
                    let mut state = self.core.server().state.lock();
                    self.rollback(&mut state);
                }
                let mut s = self.shared.lock();
                s.txn_state = TransactionState::Aborted;
                s.pinned = false;
                Ok(())
            }
        }
    }

    fn transaction_state(&self) -> TransactionState {
        self.shared.lock().txn_state
    }

    fn is_dirty(&self) -> bool {
        self.shared.lock().dirty
    }

    fn is_pinned(&self) -> bool {
        self.shared.lock().pinned
    }

    async fn end_session(&self) -> DriverResult<()> {
        let state = {
            let s = self.shared.lock();
            if s.ended {
                return Ok(());
            }
            s.txn_state
        };
        if state == TransactionState::InProgress {
            self.abort_transaction().await?;
        }
        self.shared.lock().ended = true;
        self.core.server().state.lock().stats.sessions_ended += 1;
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
