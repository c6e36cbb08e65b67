//! `runOnRequirements` evaluation.
//!
//! A requirement holds when all of its predicates hold; a list holds when
//! any requirement in it does, and an empty list always holds. Predicates
//! that need no server round trip (topology, serverless, auth) are checked
//! first, so a requirement that fails on topology never costs a command.

use semver::Version;
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use unified_driver::{CallOptions, Client, Document, TopologyDescription, TopologyType};
use unified_format::{patch_version, RunOnRequirement, ServerlessRequirement, Topology};

use crate::config::RunnerConfig;
use crate::error::{RunnerError, RunnerResult};
use crate::matching::matches;

/// Deployment facts a requirement is checked against.
pub struct RequirementContext<'a> {
    config: &'a RunnerConfig,
    util: &'a dyn Client,
    parameters: &'a Document,
    version: OnceCell<Version>,
}

impl<'a> RequirementContext<'a> {
    /// `parameters` is the reply to `getParameter: "*"`, fetched by the caller.
    pub fn new(config: &'a RunnerConfig, util: &'a dyn Client, parameters: &'a Document) -> Self {
        RequirementContext {
            config,
            util,
            parameters,
            version: OnceCell::new(),
        }
    }

    pub async fn is_any_satisfied(&self, requirements: &[RunOnRequirement]) -> RunnerResult<bool> {
        if requirements.is_empty() {
            return Ok(true);
        }
        for requirement in requirements {
            if self.is_satisfied(requirement).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub async fn is_satisfied(&self, requirement: &RunOnRequirement) -> RunnerResult<bool> {
        if let Some(topologies) = &requirement.topologies {
            let topology = self.util.topology();
            if !topologies.iter().any(|t| topology_matches(*t, &topology)) {
                tracing::debug!(?topologies, actual = ?topology.topology_type, "topology requirement unmet");
                return Ok(false);
            }
        }
        if let Some(serverless) = requirement.serverless {
            let ok = match serverless {
                ServerlessRequirement::Forbid => !self.config.serverless,
                ServerlessRequirement::Require => self.config.serverless,
                ServerlessRequirement::Allow => true,
            };
            if !ok {
                tracing::debug!(?serverless, "serverless requirement unmet");
                return Ok(false);
            }
        }
        if let Some(auth) = requirement.auth {
            if auth != self.config.auth_enabled {
                tracing::debug!(required = auth, "auth requirement unmet");
                return Ok(false);
            }
        }
        if requirement.min_server_version.is_some() || requirement.max_server_version.is_some() {
            let version = self.server_version().await?;
            if let Some(min) = &requirement.min_server_version {
                if version < &parse_version(min)? {
                    tracing::debug!(%version, min = %min, "server version below minimum");
                    return Ok(false);
                }
            }
            if let Some(max) = &requirement.max_server_version {
                if version > &parse_version(max)? {
                    tracing::debug!(%version, max = %max, "server version above maximum");
                    return Ok(false);
                }
            }
        }
        if let Some(parameters) = &requirement.server_parameters {
            for (name, expected) in parameters {
                if matches(expected, self.parameters.get(name)).is_err() {
                    tracing::debug!(parameter = %name, "server parameter requirement unmet");
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Server version from `buildInfo`, fetched at most once.
    pub async fn server_version(&self) -> RunnerResult<&Version> {
        self.version
            .get_or_try_init(|| async {
                let reply = self
                    .util
                    .run_command("admin", json_document(json!({ "buildInfo": 1 })), &CallOptions::default())
                    .await?;
                let version = reply
                    .get("version")
                    .and_then(Value::as_str)
                    .ok_or_else(|| RunnerError::mismatch("buildInfo reply has no version"))?;
                parse_version(version)
            })
            .await
    }
}

fn json_document(value: Value) -> Document {
    match value {
        Value::Object(map) => map,
        _ => Document::new(),
    }
}

/// Parse a server version, ignoring any pre-release suffix (`8.0.0-rc1`).
pub fn parse_version(version: &str) -> RunnerResult<Version> {
    let base = version.split(['-', '+']).next().unwrap_or(version);
    let parsed = Version::parse(&patch_version(base))
        .map_err(|e| RunnerError::configuration(format!("invalid server version '{}': {}", version, e)))?;
    Ok(Version::new(parsed.major, parsed.minor, parsed.patch))
}

fn topology_matches(required: Topology, actual: &TopologyDescription) -> bool {
    match (required, actual.topology_type) {
        (Topology::Single, TopologyType::Single) => true,
        (Topology::ReplicaSet, TopologyType::ReplicaSet) => true,
        (Topology::Sharded, TopologyType::Sharded) => true,
        (Topology::ShardedReplicaSet, TopologyType::Sharded) => actual.shards_are_replica_sets,
        (Topology::LoadBalanced, TopologyType::LoadBalanced) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use unified_driver::memory::{DeploymentProfile, MemoryDeployment};
    use unified_driver::{ClientOptions, Deployment};

    fn requirement(v: Value) -> RunOnRequirement {
        serde_json::from_value(v).unwrap()
    }

    async fn connect_util(profile: DeploymentProfile) -> (MemoryDeployment, Arc<dyn Client>) {
        let deployment = MemoryDeployment::new(profile);
        let client = deployment.connect(ClientOptions::default()).await.unwrap();
        (deployment, client)
    }

    #[test]
    fn parse_version_pads_and_strips_prerelease() {
        assert_eq!(parse_version("4.4").unwrap(), Version::new(4, 4, 0));
        assert_eq!(parse_version("8.0.0-rc1").unwrap(), Version::new(8, 0, 0));
        assert!(parse_version("latest").is_err());
    }

    #[test]
    fn sharded_replicaset_requires_replica_set_shards() {
        let plain = TopologyDescription {
            topology_type: TopologyType::Sharded,
            shards_are_replica_sets: false,
        };
        assert!(topology_matches(Topology::Sharded, &plain));
        assert!(!topology_matches(Topology::ShardedReplicaSet, &plain));
        let rs = TopologyDescription {
            shards_are_replica_sets: true,
            ..plain
        };
        assert!(topology_matches(Topology::ShardedReplicaSet, &rs));
    }

    #[tokio::test]
    async fn empty_list_is_satisfied() {
        let (_d, client) = connect_util(DeploymentProfile::default()).await;
        let config = RunnerConfig::default();
        let params = Document::new();
        let ctx = RequirementContext::new(&config, client.as_ref(), &params);
        assert!(ctx.is_any_satisfied(&[]).await.unwrap());
    }

    #[tokio::test]
    async fn unmet_topology_sends_no_commands() {
        let (deployment, client) =
            connect_util(DeploymentProfile::default().with_topology(TopologyType::Single)).await;
        let config = RunnerConfig::default();
        let params = Document::new();
        let ctx = RequirementContext::new(&config, client.as_ref(), &params);
        let reqs = vec![requirement(json!({ "topologies": ["sharded"], "minServerVersion": "4.0" }))];
        assert!(!ctx.is_any_satisfied(&reqs).await.unwrap());
        assert!(deployment.commands().is_empty());
    }

    #[tokio::test]
    async fn version_bounds_are_inclusive_and_build_info_is_cached() {
        let (deployment, client) =
            connect_util(DeploymentProfile::default().with_server_version("5.0.3")).await;
        let config = RunnerConfig::default();
        let params = Document::new();
        let ctx = RequirementContext::new(&config, client.as_ref(), &params);
        assert!(ctx
            .is_satisfied(&requirement(json!({ "minServerVersion": "5.0.3", "maxServerVersion": "5.0.3" })))
            .await
            .unwrap());
        assert!(!ctx
            .is_satisfied(&requirement(json!({ "minServerVersion": "5.1" })))
            .await
            .unwrap());
        assert!(!ctx
            .is_satisfied(&requirement(json!({ "maxServerVersion": "4.4.99" })))
            .await
            .unwrap());
        assert_eq!(deployment.command_names(), vec!["buildInfo"]);
    }

    #[tokio::test]
    async fn any_requirement_in_the_list_suffices() {
        let (_d, client) = connect_util(DeploymentProfile::default()).await;
        let config = RunnerConfig::default().with_serverless(true);
        let params = Document::new();
        let ctx = RequirementContext::new(&config, client.as_ref(), &params);
        let reqs = vec![
            requirement(json!({ "serverless": "forbid" })),
            requirement(json!({ "serverless": "require", "topologies": ["replicaset"] })),
        ];
        assert!(ctx.is_any_satisfied(&reqs).await.unwrap());
    }

    #[tokio::test]
    async fn auth_and_parameters() {
        let (_d, client) = connect_util(DeploymentProfile::default()).await;
        let config = RunnerConfig::default();
        let params = json_document(json!({ "enableTestCommands": 1, "featureFlag": true }));
        let ctx = RequirementContext::new(&config, client.as_ref(), &params);
        assert!(!ctx.is_satisfied(&requirement(json!({ "auth": true }))).await.unwrap());
        assert!(ctx
            .is_satisfied(&requirement(json!({ "serverParameters": { "enableTestCommands": 1.0 } })))
            .await
            .unwrap());
        assert!(!ctx
            .is_satisfied(&requirement(json!({ "serverParameters": { "missing": 1 } })))
            .await
            .unwrap());
    }
}
