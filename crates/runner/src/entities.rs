//! The entity graph: named runtime objects a test operates on.
//!
//! Entities are built from `createEntities` in declaration order. A
//! description may only refer to entities declared before it, so the graph
//! is acyclic by construction. Operations add more entities at run time
//! through `saveResultAsEntity` (cursors, change streams, plain values).
//!
//! The map owns everything it holds. [`EntityMap::cleanup`] ends sessions,
//! closes cursors and closes clients on every exit path of a test.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use unified_driver::{
    BucketOptions, Client, ClientOptions, Cursor, Deployment, HandleOptions, Namespace, Session,
};
use unified_format::{EntityDescription, EntityKind};

use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::events::EventRecorder;
use crate::matching::decode_hex;
use crate::options;

pub struct ClientEntry {
    pub client: Arc<dyn Client>,
    pub recorder: Arc<EventRecorder>,
}

pub struct DatabaseEntry {
    pub client_id: String,
    pub client: Arc<dyn Client>,
    pub name: String,
    pub options: HandleOptions,
}

pub struct CollectionEntry {
    pub client_id: String,
    pub client: Arc<dyn Client>,
    pub ns: Namespace,
    /// Database options overlaid with the collection's own.
    pub options: HandleOptions,
}

pub struct SessionEntry {
    pub client_id: String,
    pub session: Arc<dyn Session>,
}

pub struct BucketEntry {
    pub client: Arc<dyn Client>,
    pub database: String,
    pub bucket: BucketOptions,
    pub options: HandleOptions,
}

/// A runtime entity.
pub enum Entity {
    Client(ClientEntry),
    Database(DatabaseEntry),
    Collection(CollectionEntry),
    Session(SessionEntry),
    Bucket(BucketEntry),
    Stream(Vec<u8>),
    Cursor(Box<dyn Cursor>),
    ChangeStream(Box<dyn Cursor>),
    Value(Value),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Client(_) => EntityKind::Client,
            Entity::Database(_) => EntityKind::Database,
            Entity::Collection(_) => EntityKind::Collection,
            Entity::Session(_) => EntityKind::Session,
            Entity::Bucket(_) => EntityKind::Bucket,
            Entity::Stream(_) => EntityKind::Stream,
            Entity::Cursor(_) => EntityKind::Cursor,
            Entity::ChangeStream(_) => EntityKind::ChangeStream,
            Entity::Value(_) => EntityKind::Value,
        }
    }
}

/// Ordered map from entity id to entity.
#[derive(Default)]
pub struct EntityMap {
    order: Vec<String>,
    entities: HashMap<String, Entity>,
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, id: &str) -> RunnerResult<&$ty> {
            match self.get(id)? {
                Entity::$variant(e) => Ok(e),
                other => Err(RunnerError::WrongKind {
                    id: id.to_string(),
                    expected: EntityKind::$variant,
                    actual: other.kind(),
                }),
            }
        }
    };
}

impl EntityMap {
    /// Build every entity in `descriptions`, in order.
    ///
    /// On failure, whatever was already built is cleaned up before the
    /// error is returned.
    pub async fn create(
        deployment: &dyn Deployment,
        config: &RunnerConfig,
        descriptions: &[EntityDescription],
    ) -> RunnerResult<EntityMap> {
        let mut map = EntityMap::default();
        for description in descriptions {
            if let Err(err) = map.create_one(deployment, config, description).await {
                map.cleanup().await;
                return Err(match err {
                    RunnerError::Lookup { id } => RunnerError::configuration(format!(
                        "entity '{}' refers to undeclared entity '{}'",
                        description.id(),
                        id
                    )),
                    RunnerError::WrongKind {
                        id,
                        expected,
                        actual,
                    } => RunnerError::configuration(format!(
                        "entity '{}' refers to '{}', which is a {} rather than a {}",
                        description.id(),
                        id,
                        actual,
                        expected
                    )),
                    other => other,
                });
            }
        }
        Ok(map)
    }

    async fn create_one(
        &mut self,
        deployment: &dyn Deployment,
        config: &RunnerConfig,
        description: &EntityDescription,
    ) -> RunnerResult<()> {
        let entity = match description {
            EntityDescription::Client(c) => {
                let recorder = Arc::new(EventRecorder::new(
                    &c.observe_events,
                    &c.ignore_command_monitoring_events,
                ));
                let uri = if config.load_balanced && c.use_multiple_mongoses == Some(false) {
                    config.single_mongos_lb_uri.clone()
                } else {
                    None
                };
                let client = deployment
                    .connect(ClientOptions {
                        uri,
                        uri_options: c.uri_options.clone().unwrap_or_default(),
                        use_multiple_mongoses: c.use_multiple_mongoses.unwrap_or(false),
                        server_api: c.server_api.as_ref().map(options::server_api),
                        event_handler: Some(recorder.clone()),
                    })
                    .await?;
                Entity::Client(ClientEntry { client, recorder })
            }
            EntityDescription::Database(d) => {
                let client = self.client(&d.client)?.client.clone();
                Entity::Database(DatabaseEntry {
                    client_id: d.client.clone(),
                    client,
                    name: d.database_name.clone(),
                    options: options::handle_options(d.database_options.as_ref())?,
                })
            }
            EntityDescription::Collection(c) => {
                let db = self.database(&c.database)?;
                let own = options::handle_options(c.collection_options.as_ref())?;
                Entity::Collection(CollectionEntry {
                    client_id: db.client_id.clone(),
                    client: db.client.clone(),
                    ns: Namespace::new(db.name.clone(), c.collection_name.clone()),
                    options: db.options.merged_with(&own),
                })
            }
            EntityDescription::Session(s) => {
                let client = self.client(&s.client)?.client.clone();
                let session = client
                    .start_session(options::session_options(s.session_options.as_ref())?)
                    .await?;
                Entity::Session(SessionEntry {
                    client_id: s.client.clone(),
                    session,
                })
            }
            EntityDescription::Bucket(b) => {
                let db = self.database(&b.database)?;
                Entity::Bucket(BucketEntry {
                    client: db.client.clone(),
                    database: db.name.clone(),
                    bucket: options::bucket_options(b.bucket_options.as_ref())?,
                    options: db.options.clone(),
                })
            }
            EntityDescription::Stream(s) => {
                Entity::Stream(decode_hex(&s.hex_bytes).map_err(RunnerError::Configuration)?)
            }
        };
        tracing::debug!(id = description.id(), kind = %description.kind(), "created entity");
        self.insert(description.id(), entity)
    }

    /// Bind `entity` under `id`. Ids are never reused within a test.
    pub fn insert(&mut self, id: &str, entity: Entity) -> RunnerResult<()> {
        if self.entities.contains_key(id) {
            return Err(RunnerError::configuration(format!(
                "entity id '{}' is already in use",
                id
            )));
        }
        self.order.push(id.to_string());
        self.entities.insert(id.to_string(), entity);
        Ok(())
    }

    pub fn get(&self, id: &str) -> RunnerResult<&Entity> {
        self.entities.get(id).ok_or_else(|| RunnerError::Lookup { id: id.to_string() })
    }

    pub fn get_mut(&mut self, id: &str) -> RunnerResult<&mut Entity> {
        self.entities
            .get_mut(id)
            .ok_or_else(|| RunnerError::Lookup { id: id.to_string() })
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.contains_key(id)
    }

    typed_getter!(client, Client, ClientEntry);
    typed_getter!(database, Database, DatabaseEntry);
    typed_getter!(collection, Collection, CollectionEntry);
    typed_getter!(session, Session, SessionEntry);
    typed_getter!(bucket, Bucket, BucketEntry);
    typed_getter!(stream, Stream, Vec<u8>);
    typed_getter!(value, Value, Value);

    /// Entities of one kind, in the order they were bound.
    pub fn map_of(&self, kind: EntityKind) -> Vec<(&str, &Entity)> {
        self.order
            .iter()
            .filter_map(|id| {
                let entity = self.entities.get(id)?;
                (entity.kind() == kind).then_some((id.as_str(), entity))
            })
            .collect()
    }

    pub fn clients(&self) -> Vec<(&str, &ClientEntry)> {
        self.map_of(EntityKind::Client)
            .into_iter()
            .filter_map(|(id, e)| match e {
                Entity::Client(c) => Some((id, c)),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Release everything the map owns, newest first.
    ///
    /// Sessions are ended and cursors closed before any client goes away.
    /// Failures are logged and skipped. Calling this twice is a no-op.
    pub async fn cleanup(&mut self) {
        let mut clients = Vec::new();
        while let Some(id) = self.order.pop() {
            let Some(entity) = self.entities.remove(&id) else {
                continue;
            };
            let result = match entity {
                Entity::Session(s) => s.session.end_session().await,
                Entity::Cursor(mut c) | Entity::ChangeStream(mut c) => c.close().await,
                Entity::Client(c) => {
                    clients.push((id, c));
                    continue;
                }
                _ => Ok(()),
            };
            if let Err(err) = result {
                tracing::warn!(id = %id, error = %err, "failed to release entity");
            }
        }
        for (id, c) in clients {
            if let Err(err) = c.client.close().await {
                tracing::warn!(id = %id, error = %err, "failed to close client");
            }
        }
        self.entities.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use unified_driver::memory::MemoryDeployment;

    fn descriptions(v: Value) -> Vec<EntityDescription> {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn builds_entities_in_declaration_order() {
        let deployment = MemoryDeployment::default();
        let mut map = EntityMap::create(
            &deployment,
            &RunnerConfig::default(),
            &descriptions(json!([
                { "client": { "id": "client0", "observeEvents": ["commandStartedEvent"] } },
                { "database": {
                    "id": "db0", "client": "client0", "databaseName": "test",
                    "databaseOptions": { "writeConcern": { "w": "majority" } }
                } },
                { "collection": {
                    "id": "coll0", "database": "db0", "collectionName": "things",
                    "collectionOptions": { "readConcern": { "level": "local" } }
                } },
                { "session": { "id": "session0", "client": "client0" } },
                { "stream": { "id": "stream0", "hexBytes": "0011" } }
            ])),
        )
        .await
        .unwrap();

        let coll = map.collection("coll0").unwrap();
        assert_eq!(coll.ns, Namespace::new("test", "things"));
        assert_eq!(coll.client_id, "client0");
        assert!(coll.options.write_concern.is_some());
        assert!(coll.options.read_concern.is_some());
        assert_eq!(map.stream("stream0").unwrap(), &vec![0x00, 0x11]);

        let ids: Vec<&str> = map.map_of(EntityKind::Client).into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["client0"]);

        map.cleanup().await;
        assert!(map.is_empty());
        let stats = deployment.stats();
        assert_eq!(stats.clients_closed, 1);
        assert_eq!(stats.sessions_ended, 1);
    }

    #[tokio::test]
    async fn forward_reference_is_a_configuration_error() {
        let deployment = MemoryDeployment::default();
        let result = EntityMap::create(
            &deployment,
            &RunnerConfig::default(),
            &descriptions(json!([
                { "client": { "id": "client0" } },
                { "collection": { "id": "coll0", "database": "db0", "collectionName": "c" } },
                { "database": { "id": "db0", "client": "client0", "databaseName": "test" } }
            ])),
        )
        .await;
        match result {
            Err(RunnerError::Configuration(msg)) => assert!(msg.contains("db0"), "{}", msg),
            Err(other) => panic!("unexpected error {}", other),
            Ok(_) => panic!("expected a configuration error"),
        }
        // The client built before the failure was closed again.
        assert_eq!(deployment.stats().clients_closed, 1);
    }

    #[tokio::test]
    async fn wrong_kind_reference_is_a_configuration_error() {
        let deployment = MemoryDeployment::default();
        let result = EntityMap::create(
            &deployment,
            &RunnerConfig::default(),
            &descriptions(json!([
                { "client": { "id": "client0" } },
                { "collection": { "id": "coll0", "database": "client0", "collectionName": "c" } }
            ])),
        )
        .await;
        assert!(matches!(result, Err(RunnerError::Configuration(_))));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent() {
        let deployment = MemoryDeployment::default();
        let mut map = EntityMap::create(
            &deployment,
            &RunnerConfig::default(),
            &descriptions(json!([{ "client": { "id": "client0" } }])),
        )
        .await
        .unwrap();
        map.cleanup().await;
        map.cleanup().await;
        assert_eq!(deployment.stats().clients_closed, 1);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut map = EntityMap::default();
        map.insert("x", Entity::Value(json!(1))).unwrap();
        assert!(matches!(
            map.insert("x", Entity::Value(json!(2))),
            Err(RunnerError::Configuration(_))
        ));
        assert_eq!(map.value("x").unwrap(), &json!(1));
    }
}
