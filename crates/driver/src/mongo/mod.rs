//! Live deployment backed by the official `mongodb` driver.
//!
//! Every operation goes over the wire as a command document built the same
//! way the in-process deployment builds it, so command monitoring shows the
//! same shapes against a real server. Replies are converted back to
//! extended JSON at the boundary.

mod client;
mod convert;
mod cursor;
mod events;
mod session;

use std::sync::Arc;

use async_trait::async_trait;
use bson::doc;
use mongodb::event::cmap::CmapEventHandler;
use mongodb::event::command::CommandEventHandler;
use mongodb::options::{
    ClientOptions as MongoClientOptions, SelectionCriteria, ServerApi, ServerApiVersion,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::error::{DriverError, DriverResult};
use crate::options::{CallOptions, ClientOptions, ServerApiOptions, TopologyDescription, TopologyType};
use crate::traits::{Client, Deployment};
use crate::wire::apply_concerns;
use crate::Document;

pub use client::MongoClient;
pub use session::MongoSession;

use convert::{from_bson, from_mongo_error, selection_criteria, to_bson};
use events::EventBridge;

/// A running deployment reached through a connection string.
pub struct MongoDeployment {
    uri: String,
    topology: OnceCell<TopologyDescription>,
}

impl MongoDeployment {
    pub fn new(uri: impl Into<String>) -> Self {
        MongoDeployment {
            uri: uri.into(),
            topology: OnceCell::new(),
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Topology of the deployment, discovered once on an unobserved client.
    pub async fn topology(&self) -> DriverResult<TopologyDescription> {
        self.topology
            .get_or_try_init(|| discover(&self.uri))
            .await
            .cloned()
    }
}

async fn discover(uri: &str) -> DriverResult<TopologyDescription> {
    let options = MongoClientOptions::parse(uri).await.map_err(from_mongo_error)?;
    let load_balanced = options.load_balanced == Some(true);
    let client = mongodb::Client::with_options(options).map_err(from_mongo_error)?;
    let admin = client.database("admin");
    let hello = admin
        .run_command(doc! { "hello": 1 }, None)
        .await
        .map_err(from_mongo_error)?;
    let topology_type = topology_type(&from_bson(hello), load_balanced);
    let shards_are_replica_sets = if topology_type == TopologyType::Sharded {
        match admin.run_command(doc! { "listShards": 1 }, None).await {
            Ok(reply) => shards_are_replica_sets(&from_bson(reply)),
            Err(err) => {
                tracing::warn!(error = %err, "listShards failed; assuming standalone shards");
                false
            }
        }
    } else {
        false
    };
    tracing::debug!(?topology_type, shards_are_replica_sets, "discovered topology");
    Ok(TopologyDescription {
        topology_type,
        shards_are_replica_sets,
    })
}

/// Classify a `hello` reply.
fn topology_type(hello: &Document, load_balanced: bool) -> TopologyType {
    if load_balanced || hello.contains_key("serviceId") {
        TopologyType::LoadBalanced
    } else if hello.get("msg").and_then(Value::as_str) == Some("isdbgrid") {
        TopologyType::Sharded
    } else if hello.contains_key("setName") {
        TopologyType::ReplicaSet
    } else {
        TopologyType::Single
    }
}

/// Replica-set shards list their host as `<set>/<host>,<host>`.
fn shards_are_replica_sets(list_shards: &Document) -> bool {
    let shards = list_shards
        .get("shards")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    !shards.is_empty()
        && shards.iter().all(|shard| {
            shard
                .get("host")
                .and_then(Value::as_str)
                .map_or(false, |host| host.contains('/'))
        })
}

/// Append `uri_options` to the connection string's query.
fn with_uri_options(uri: &str, uri_options: &Document) -> String {
    if uri_options.is_empty() {
        return uri.to_string();
    }
    let query: Vec<String> = uri_options
        .iter()
        .map(|(key, value)| match value {
            Value::String(s) => format!("{}={}", key, s),
            other => format!("{}={}", key, other),
        })
        .collect();
    let after_scheme = uri.split_once("://").map_or(uri, |(_, rest)| rest);
    let separator = if uri.contains('?') {
        "&"
    } else if after_scheme.contains('/') {
        "?"
    } else {
        "/?"
    };
    format!("{}{}{}", uri, separator, query.join("&"))
}

fn server_api(options: &ServerApiOptions) -> DriverResult<ServerApi> {
    if options.version != "1" {
        return Err(DriverError::invalid_argument(format!(
            "unsupported server API version '{}'",
            options.version
        )));
    }
    Ok(ServerApi::builder()
        .version(ServerApiVersion::V1)
        .strict(options.strict)
        .deprecation_errors(options.deprecation_errors)
        .build())
}

#[async_trait]
impl Deployment for MongoDeployment {
    async fn connect(&self, options: ClientOptions) -> DriverResult<Arc<dyn Client>> {
        let topology = self.topology().await?;
        let uri = with_uri_options(
            options.uri.as_deref().unwrap_or(&self.uri),
            &options.uri_options,
        );
        let mut mongo_options = MongoClientOptions::parse(&uri)
            .await
            .map_err(from_mongo_error)?;
        if let Some(api) = &options.server_api {
            mongo_options.server_api = Some(server_api(api)?);
        }
        if !options.use_multiple_mongoses && topology.topology_type == TopologyType::Sharded {
            mongo_options.hosts.truncate(1);
        }
        let bridge = Arc::new(EventBridge::new(options.event_handler));
        let command_handler: Arc<dyn CommandEventHandler> = bridge.clone();
        let cmap_handler: Arc<dyn CmapEventHandler> = bridge.clone();
        mongo_options.command_event_handler = Some(command_handler);
        mongo_options.cmap_event_handler = Some(cmap_handler);
        let client = mongodb::Client::with_options(mongo_options).map_err(from_mongo_error)?;
        tracing::debug!(uri = %uri, "connected live client");
        Ok(Arc::new(MongoClient::new(Arc::new(MongoCore {
            client: Mutex::new(Some(client)),
            bridge,
            topology,
        }))))
    }
}

/// State shared by a client, its sessions and its cursors.
pub(crate) struct MongoCore {
    client: Mutex<Option<mongodb::Client>>,
    bridge: Arc<EventBridge>,
    pub(crate) topology: TopologyDescription,
}

impl MongoCore {
    pub(crate) fn client(&self) -> DriverResult<mongodb::Client> {
        self.client.lock().clone().ok_or_else(|| DriverError::Closed {
            what: "client".to_string(),
        })
    }

    fn session<'a>(&self, options: &'a CallOptions) -> DriverResult<Option<&'a MongoSession>> {
        let Some(session) = &options.session else {
            return Ok(None);
        };
        let session = session
            .as_any()
            .downcast_ref::<MongoSession>()
            .ok_or_else(|| DriverError::invalid_argument("session was not started by a live client"))?;
        if !session.belongs_to(self) {
            return Err(DriverError::invalid_argument(
                "session was started by a different client",
            ));
        }
        Ok(Some(session))
    }

    /// Run one command, in the call's session if it has one. The handle's
    /// read preference selects the server unless `selection` overrides it.
    pub(crate) async fn command(
        &self,
        database: &str,
        mut command: Document,
        options: &CallOptions,
        selection: Option<SelectionCriteria>,
    ) -> DriverResult<Document> {
        let selection = selection.or_else(|| {
            options
                .handle
                .read_preference
                .as_ref()
                .map(selection_criteria)
        });
        if let Some(session) = self.session(options)? {
            return session.run(database, command, &options.handle, selection).await;
        }
        let client = self.client()?;
        let name = command.keys().next().cloned().unwrap_or_default();
        apply_concerns(&mut command, &name, &options.handle);
        tracing::trace!(command = %name, database, "sending command");
        client
            .database(database)
            .run_command(to_bson(command)?, selection)
            .await
            .map(from_bson)
            .map_err(from_mongo_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(v: Value) -> Document {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn hello_replies_classify_the_topology() {
        let mongos = doc(json!({ "isWritablePrimary": true, "msg": "isdbgrid" }));
        assert_eq!(topology_type(&mongos, false), TopologyType::Sharded);
        let member = doc(json!({ "isWritablePrimary": true, "setName": "rs0" }));
        assert_eq!(topology_type(&member, false), TopologyType::ReplicaSet);
        let balanced = doc(json!({ "serviceId": { "$oid": "5f1a2b3c4d5e6f7081920a1b" } }));
        assert_eq!(topology_type(&balanced, false), TopologyType::LoadBalanced);
        assert_eq!(topology_type(&doc(json!({})), true), TopologyType::LoadBalanced);
        assert_eq!(topology_type(&doc(json!({ "ok": 1 })), false), TopologyType::Single);
    }

    #[test]
    fn shard_hosts_reveal_replica_sets() {
        let sets = doc(json!({ "shards": [
            { "_id": "sh1", "host": "sh1/a:27018,b:27018" },
            { "_id": "sh2", "host": "sh2/c:27018" }
        ] }));
        assert!(shards_are_replica_sets(&sets));
        let mixed = doc(json!({ "shards": [
            { "_id": "sh1", "host": "sh1/a:27018" },
            { "_id": "sh2", "host": "c:27018" }
        ] }));
        assert!(!shards_are_replica_sets(&mixed));
        assert!(!shards_are_replica_sets(&doc(json!({ "shards": [] }))));
    }

    #[test]
    fn uri_options_extend_the_query() {
        let opts = doc(json!({ "appname": "utr", "retryWrites": false, "heartbeatFrequencyMS": 500 }));
        assert_eq!(
            with_uri_options("mongodb://localhost:27017", &opts),
            "mongodb://localhost:27017/?appname=utr&retryWrites=false&heartbeatFrequencyMS=500"
        );
        assert_eq!(
            with_uri_options("mongodb://a,b/?replicaSet=rs0", &doc(json!({ "w": 1 }))),
            "mongodb://a,b/?replicaSet=rs0&w=1"
        );
        assert_eq!(
            with_uri_options("mongodb://a/admin", &doc(json!({ "w": "majority" }))),
            "mongodb://a/admin?w=majority"
        );
        assert_eq!(with_uri_options("mongodb://a", &Document::new()), "mongodb://a");
    }

    #[test]
    fn only_server_api_version_1_is_known() {
        let v1 = ServerApiOptions {
            version: "1".to_string(),
            strict: Some(true),
            deprecation_errors: None,
        };
        assert!(server_api(&v1).is_ok());
        let v2 = ServerApiOptions {
            version: "2".to_string(),
            ..v1
        };
        assert!(server_api(&v2).unwrap_err().is_client_error());
    }

    #[tokio::test]
    async fn unparseable_uri_fails_to_connect() {
        let deployment = MongoDeployment::new("not-a-connection-string");
        let err = match deployment.connect(ClientOptions::default()).await {
            Ok(_) => panic!("connected with a malformed uri"),
            Err(err) => err,
        };
        assert!(err.is_client_error());
        assert_eq!(deployment.uri(), "not-a-connection-string");
    }
}
