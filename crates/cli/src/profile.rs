//! Deployment profiles: TOML files describing the simulated deployment a
//! run targets.
//!
//! ```toml
//! topology = "sharded"
//! server_version = "6.0.4"
//! auth = true
//!
//! [parameters]
//! requireApiVersion = false
//! ```

use std::path::Path;

use serde::Deserialize;
use unified_driver::memory::DeploymentProfile;
use unified_driver::TopologyType;
use unified_runner::RunnerConfig;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Profile {
    #[serde(flatten)]
    pub deployment: DeploymentProfile,
    pub auth: bool,
    pub serverless: bool,
    /// Only meaningful for `topology = "load-balanced"`.
    pub single_mongos_lb_uri: Option<String>,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self, String> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| format!("error reading profile '{}': {}", path.display(), e))?;
        Self::parse(&source).map_err(|e| format!("error parsing profile '{}': {}", path.display(), e))
    }

    pub fn parse(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Overlay what the profile says about the deployment onto `config`.
    /// Environment toggles already set in `config` are never cleared.
    pub fn apply(&self, config: RunnerConfig) -> RunnerConfig {
        let auth = config.auth_enabled || self.auth;
        let serverless = config.serverless || self.serverless;
        let mut config = config.with_auth(auth).with_serverless(serverless);
        if self.deployment.topology == TopologyType::LoadBalanced && !config.load_balanced {
            config = config.with_load_balancer(self.single_mongos_lb_uri.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_profile_is_the_default_replica_set() {
        let profile = Profile::parse("").unwrap();
        assert_eq!(profile, Profile::default());
        assert_eq!(profile.deployment.topology, TopologyType::ReplicaSet);
    }

    #[test]
    fn deployment_fields_sit_at_the_top_level() {
        let profile = Profile::parse(
            r#"
topology = "sharded"
server_version = "6.0.4"
shards_are_replica_sets = true
auth = true

[parameters]
requireApiVersion = false
"#,
        )
        .unwrap();
        assert_eq!(profile.deployment.topology, TopologyType::Sharded);
        assert_eq!(profile.deployment.server_version, "6.0.4");
        assert!(profile.deployment.shards_are_replica_sets);
        assert!(profile.auth);
        assert_eq!(
            profile.deployment.parameters.get("requireApiVersion"),
            Some(&json!(false))
        );
    }

    #[test]
    fn unknown_topology_is_rejected() {
        assert!(Profile::parse("topology = \"mesh\"").is_err());
    }

    #[test]
    fn apply_enables_load_balancing_for_load_balanced_topology() {
        let profile = Profile::parse(
            r#"
topology = "load-balanced"
single_mongos_lb_uri = "mongodb://lb:27017"
serverless = true
"#,
        )
        .unwrap();
        let config = profile.apply(RunnerConfig::default());
        assert!(config.load_balanced);
        assert!(config.serverless);
        assert_eq!(config.single_mongos_lb_uri.as_deref(), Some("mongodb://lb:27017"));
    }

    #[test]
    fn apply_keeps_environment_toggles() {
        let config = Profile::default().apply(RunnerConfig::default().with_auth(true));
        assert!(config.auth_enabled);
        assert!(!config.load_balanced);
    }
}
