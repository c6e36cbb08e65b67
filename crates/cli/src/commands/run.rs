use std::path::{Path, PathBuf};
use std::process;

use unified_driver::memory::MemoryDeployment;
use unified_driver::mongo::MongoDeployment;
use unified_driver::Deployment;
use unified_runner::{RunnerConfig, TestOutcome};

use crate::profile::Profile;
use crate::suites;
use crate::tap::Tap;

pub(crate) struct RunOptions<'a> {
    pub paths: &'a [PathBuf],
    /// Live deployment; the profile's simulated deployment is used otherwise.
    pub uri: Option<&'a str>,
    pub profile: Option<&'a Path>,
    pub skip: &'a [String],
    pub skip_file: Option<&'a Path>,
    pub trace: bool,
}

/// Build the runner configuration: environment first, then the profile,
/// then flags.
pub(crate) fn build_config(options: &RunOptions<'_>, profile: &Profile) -> Result<RunnerConfig, String> {
    let mut config = profile
        .apply(RunnerConfig::from_env())
        .with_skip_tests(options.skip.iter().cloned());
    if options.trace {
        config = config.with_trace(true);
    }
    if let Some(path) = options.skip_file {
        config = config.with_skip_tests(read_skip_file(path)?);
    }
    Ok(config)
}

/// The live deployment at `uri`, or the profile's simulated one.
fn deployment(uri: Option<&str>, profile: &Profile) -> Box<dyn Deployment> {
    match uri {
        Some(uri) => {
            tracing::info!(uri, "running against a live deployment");
            Box::new(MongoDeployment::new(uri))
        }
        None => Box::new(MemoryDeployment::new(profile.deployment.clone())),
    }
}

/// One description per line; blank lines and `#` comments are ignored.
fn read_skip_file(path: &Path) -> Result<Vec<String>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("error reading skip file '{}': {}", path.display(), e))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

pub(crate) fn cmd_run(options: RunOptions<'_>) {
    let profile = match options.profile {
        Some(path) => Profile::load(path).unwrap_or_else(|msg| {
            eprintln!("error: {}", msg);
            process::exit(1);
        }),
        None => Profile::default(),
    };
    let config = build_config(&options, &profile).unwrap_or_else(|msg| {
        eprintln!("error: {}", msg);
        process::exit(1);
    });
    crate::init_tracing(config.trace);

    let files = suites::collect(options.paths).unwrap_or_else(|msg| {
        eprintln!("error: {}", msg);
        process::exit(1);
    });
    if files.is_empty() {
        eprintln!("error: no suite files found");
        process::exit(1);
    }

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to create tokio runtime: {}", e);
            process::exit(1);
        }
    };

    let deployment = deployment(options.uri, &profile);
    let mut tap = Tap::new();
    for file in &files {
        let suite = match suites::load(file) {
            Ok(suite) => suite,
            Err(e) => {
                tap.not_ok(&file.display().to_string(), e.to_string());
                continue;
            }
        };
        tracing::debug!(file = %file.display(), suite = %suite.description, "running suite");
        let report = rt.block_on(unified_runner::run_suite(deployment.as_ref(), &config, &suite));
        for test in &report.tests {
            let name = format!("{} :: {}", report.description, test.description);
            match &test.outcome {
                TestOutcome::Passed => tap.ok(&name),
                TestOutcome::Failed { message } => tap.not_ok(&name, message.clone()),
                TestOutcome::Skipped { reason } => tap.skip(&name, reason),
            }
        }
    }

    let failed = tap.failure_count();
    tap.finish();
    if failed > 0 {
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn options<'a>(skip: &'a [String], skip_file: Option<&'a Path>) -> RunOptions<'a> {
        RunOptions {
            paths: &[],
            uri: None,
            profile: None,
            skip,
            skip_file,
            trace: false,
        }
    }

    #[test]
    fn skip_file_ignores_blanks_and_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skip.txt");
        fs::write(&path, "# flaky on sharded\ninsert one\n\n  find many  \n").unwrap();
        assert_eq!(read_skip_file(&path).unwrap(), ["insert one", "find many"]);
    }

    #[test]
    fn flags_and_skip_file_are_merged() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("skip.txt");
        fs::write(&path, "from file\n").unwrap();
        let skip = vec!["from flag".to_string()];
        let config = build_config(&options(&skip, Some(&path)), &Profile::default()).unwrap();
        assert!(config.is_skipped("from flag"));
        assert!(config.is_skipped("from file"));
    }

    #[test]
    fn missing_skip_file_is_reported() {
        let err = build_config(
            &options(&[], Some(Path::new("no/such/skip.txt"))),
            &Profile::default(),
        )
        .unwrap_err();
        assert!(err.contains("no/such/skip.txt"));
    }

    #[tokio::test]
    async fn uri_selects_the_live_deployment() {
        use unified_driver::{Client, ClientOptions};

        let live = deployment(Some("not a connection string"), &Profile::default());
        assert!(live.connect(ClientOptions::default()).await.is_err());

        let simulated = deployment(None, &Profile::default());
        let client = simulated.connect(ClientOptions::default()).await.unwrap();
        client.close().await.unwrap();
    }
}
