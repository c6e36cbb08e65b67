//! Runner configuration.
//!
//! Everything the runner needs to know about its environment lives in
//! [`RunnerConfig`]; nothing below the orchestrator reads process
//! environment variables.

/// Deployment facts and caller preferences that are not discoverable by
/// talking to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunnerConfig {
    /// The deployment requires authentication.
    pub auth_enabled: bool,
    /// The deployment is serverless; `killAllSessions` is not available.
    pub serverless: bool,
    /// The deployment sits behind a load balancer.
    pub load_balanced: bool,
    /// URI of a load balancer fronting a single mongos.
    pub single_mongos_lb_uri: Option<String>,
    pub trace: bool,
    /// Test descriptions to skip regardless of suite content.
    pub skip_tests: Vec<String>,
}

impl RunnerConfig {
    /// Read `AUTH`, `SERVERLESS`, `LOAD_BALANCED`, `SINGLE_MONGOS_LB_URI` and
    /// `UTR_TRACE` from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |key: &str| lookup(key).map(|v| !v.is_empty()).unwrap_or(false);
        RunnerConfig {
            auth_enabled: lookup("AUTH").as_deref() == Some("auth"),
            serverless: flag("SERVERLESS"),
            load_balanced: flag("LOAD_BALANCED"),
            single_mongos_lb_uri: lookup("SINGLE_MONGOS_LB_URI").filter(|v| !v.is_empty()),
            trace: flag("UTR_TRACE"),
            skip_tests: Vec::new(),
        }
    }

    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub fn with_serverless(mut self, serverless: bool) -> Self {
        self.serverless = serverless;
        self
    }

    pub fn with_load_balancer(mut self, single_mongos_uri: Option<String>) -> Self {
        self.load_balanced = true;
        self.single_mongos_lb_uri = single_mongos_uri;
        self
    }

    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_skip_tests<I, S>(mut self, descriptions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skip_tests
            .extend(descriptions.into_iter().map(Into::into));
        self
    }

    pub fn is_skipped(&self, description: &str) -> bool {
        self.skip_tests.iter().any(|d| d == description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn from_lookup_reads_toggles() {
        let vars: HashMap<&str, &str> = [
            ("AUTH", "auth"),
            ("SERVERLESS", "1"),
            ("LOAD_BALANCED", ""),
            ("SINGLE_MONGOS_LB_URI", "mongodb://lb:27017"),
        ]
        .into_iter()
        .collect();
        let config = RunnerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert!(config.auth_enabled);
        assert!(config.serverless);
        assert!(!config.load_balanced);
        assert!(!config.trace);
        assert_eq!(
            config.single_mongos_lb_uri.as_deref(),
            Some("mongodb://lb:27017")
        );
    }

    #[test]
    fn auth_requires_exact_value() {
        let config = RunnerConfig::from_lookup(|k| (k == "AUTH").then(|| "noauth".to_string()));
        assert!(!config.auth_enabled);
    }

    #[test]
    fn skip_list_matches_whole_descriptions() {
        let config = RunnerConfig::default().with_skip_tests(["insert one"]);
        assert!(config.is_skipped("insert one"));
        assert!(!config.is_skipped("insert"));
    }
}
