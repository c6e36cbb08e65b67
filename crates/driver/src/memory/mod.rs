//! An in-process deployment.
//!
//! `MemoryDeployment` simulates a single server (or the view through one
//! mongos or load balancer) well enough to drive the unified runner end to
//! end: it stores documents, evaluates filters, runs transactions with
//! snapshot rollback, honours `failCommand` fail points and emits command
//! and connection-pool events with the same ordering a real driver does.
//!
//! Test code inspects it directly through [`MemoryDeployment::commands`],
//! [`MemoryDeployment::documents`] and [`MemoryDeployment::stats`].

mod client;
mod cursor;
mod failpoint;
mod session;
mod store;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{DriverError, DriverResult};
use crate::options::{ClientOptions, TopologyType};
use crate::traits::{Client, Deployment};
use crate::{Document, Namespace};

pub use client::MemoryClient;
pub use session::MemorySession;

use failpoint::FailPoints;
use session::SessionState;
use store::{ChangeRecord, Store};

/// Shape of the simulated deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentProfile {
    pub topology: TopologyType,
    pub shards_are_replica_sets: bool,
    pub server_version: String,
    /// Returned by `getParameter`.
    pub parameters: Document,
    /// Commands the server answers with `CommandNotFound`.
    pub unsupported_commands: Vec<String>,
}

impl Default for DeploymentProfile {
    fn default() -> Self {
        DeploymentProfile {
            topology: TopologyType::ReplicaSet,
            shards_are_replica_sets: false,
            server_version: "7.0.0".to_string(),
            parameters: Document::new(),
            unsupported_commands: Vec::new(),
        }
    }
}

impl DeploymentProfile {
    pub fn with_topology(mut self, topology: TopologyType) -> Self {
        self.topology = topology;
        self
    }

    pub fn with_server_version(mut self, version: impl Into<String>) -> Self {
        self.server_version = version.into();
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    fn version_array(&self) -> Vec<i64> {
        let mut parts: Vec<i64> = self
            .server_version
            .split(['.', '-'])
            .take(3)
            .map(|p| p.parse().unwrap_or(0))
            .collect();
        parts.resize(4, 0);
        parts
    }
}

/// Lifetime counters, for asserting that everything opened was closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeploymentStats {
    pub clients_opened: u32,
    pub clients_closed: u32,
    pub sessions_started: u32,
    pub sessions_ended: u32,
}

/// A command as received by the server, after client-side decoration.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub database: String,
    pub command_name: String,
    pub command: Document,
}

pub(crate) struct ServerState {
    pub store: Store,
    pub fail_points: FailPoints,
    /// Published writes, in commit order, keyed by sequence number.
    pub oplog: Vec<(u64, ChangeRecord)>,
    next_seq: u64,
    next_cursor_id: i64,
    pub commands: Vec<CommandRecord>,
    pub sessions: Vec<Weak<Mutex<SessionState>>>,
    pub stats: DeploymentStats,
}

impl ServerState {
    pub fn publish(&mut self, changes: Vec<ChangeRecord>) {
        for change in changes {
            self.next_seq += 1;
            self.oplog.push((self.next_seq, change));
        }
    }

    /// Sequence number the next published write will get.
    pub fn head_seq(&self) -> u64 {
        self.next_seq + 1
    }

    pub fn next_cursor_id(&mut self) -> i64 {
        self.next_cursor_id += 1;
        self.next_cursor_id
    }
}

pub(crate) struct Server {
    pub profile: DeploymentProfile,
    pub state: Mutex<ServerState>,
    /// Reported as `serviceId` when the topology is load balanced.
    pub service_id: Option<Value>,
    next_request_id: AtomicI64,
}

impl Server {
    pub fn next_request_id(&self) -> i64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn build_info(&self) -> Document {
        let mut reply = Document::new();
        reply.insert("version".to_string(), json!(self.profile.server_version));
        reply.insert("versionArray".to_string(), json!(self.profile.version_array()));
        reply
    }

    pub fn hello(&self) -> Document {
        let mut reply = Document::new();
        reply.insert("isWritablePrimary".to_string(), json!(true));
        reply.insert("maxWireVersion".to_string(), json!(21));
        match self.profile.topology {
            TopologyType::Sharded => {
                reply.insert("msg".to_string(), json!("isdbgrid"));
            }
            TopologyType::ReplicaSet => {
                reply.insert("setName".to_string(), json!("rs0"));
            }
            TopologyType::LoadBalanced => {
                if let Some(id) = &self.service_id {
                    reply.insert("serviceId".to_string(), id.clone());
                }
            }
            TopologyType::Single => {}
        }
        reply
    }
}

/// An in-process deployment; cheap to clone, clones share the same server.
#[derive(Clone)]
pub struct MemoryDeployment {
    server: Arc<Server>,
}

impl Default for MemoryDeployment {
    fn default() -> Self {
        MemoryDeployment::new(DeploymentProfile::default())
    }
}

impl MemoryDeployment {
    pub fn new(profile: DeploymentProfile) -> Self {
        let service_id = (profile.topology == TopologyType::LoadBalanced)
            .then(|| json!({ "$oid": "000000000000000000000001" }));
        MemoryDeployment {
            server: Arc::new(Server {
                profile,
                state: Mutex::new(ServerState {
                    store: Store::default(),
                    fail_points: FailPoints::default(),
                    oplog: Vec::new(),
                    next_seq: 0,
                    next_cursor_id: 0,
                    commands: Vec::new(),
                    sessions: Vec::new(),
                    stats: DeploymentStats::default(),
                }),
                service_id,
                next_request_id: AtomicI64::new(0),
            }),
        }
    }

    pub fn profile(&self) -> &DeploymentProfile {
        &self.server.profile
    }

    pub fn stats(&self) -> DeploymentStats {
        self.server.state.lock().stats
    }

    /// Every command the server received, from all clients, in arrival order.
    pub fn commands(&self) -> Vec<CommandRecord> {
        self.server.state.lock().commands.clone()
    }

    pub fn command_names(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.command_name).collect()
    }

    pub fn documents(&self, ns: &Namespace) -> Vec<Document> {
        self.server.state.lock().store.documents(ns)
    }

    /// Configure a fail point without going through a client.
    pub fn set_fail_point(&self, command: Document) -> DriverResult<()> {
        self.server.state.lock().fail_points.configure(&command)?;
        Ok(())
    }

    pub fn active_fail_points(&self) -> Vec<String> {
        self.server.state.lock().fail_points.names()
    }
}

#[async_trait]
impl Deployment for MemoryDeployment {
    async fn connect(&self, options: ClientOptions) -> DriverResult<Arc<dyn Client>> {
        if let Some(uri) = &options.uri {
            if !(uri.starts_with("mongodb://") || uri.starts_with("mongodb+srv://")) {
                return Err(DriverError::invalid_argument(format!(
                    "invalid connection string '{}'",
                    uri
                )));
            }
        }
        let client = MemoryClient::connect(self.server.clone(), options);
        self.server.state.lock().stats.clients_opened += 1;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_array_pads_to_four_components() {
        let profile = DeploymentProfile::default().with_server_version("5.2.1");
        assert_eq!(profile.version_array(), vec![5, 2, 1, 0]);
        let profile = DeploymentProfile::default().with_server_version("8.0.0-rc1");
        assert_eq!(profile.version_array(), vec![8, 0, 0, 0]);
    }

    #[test]
    fn profile_deserializes_with_defaults() {
        let profile: DeploymentProfile = serde_json::from_value(json!({
            "topology": "sharded",
            "parameters": { "enableTestCommands": true }
        }))
        .unwrap();
        assert_eq!(profile.topology, TopologyType::Sharded);
        assert_eq!(profile.server_version, "7.0.0");
        assert_eq!(profile.parameters["enableTestCommands"], json!(true));
    }

    #[test]
    fn publish_assigns_increasing_sequence_numbers() {
        let deployment = MemoryDeployment::default();
        let mut state = deployment.server.state.lock();
        let head = state.head_seq();
        let ns = Namespace::new("db", "coll");
        let mut changes = Vec::new();
        state.store.drop_collection(&ns, &mut changes);
        state.store.create_collection(&ns, Document::new(), &mut changes).unwrap();
        state.publish(changes);
        assert_eq!(state.oplog.len(), 1);
        assert_eq!(state.oplog[0].0, head);
    }
}
