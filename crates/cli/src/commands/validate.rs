use std::path::PathBuf;
use std::process;

use crate::suites;
use crate::{report_error, OutputFormat};

/// Parse every suite and check its schema version without running it.
pub(crate) fn cmd_validate(paths: &[PathBuf], output: OutputFormat, quiet: bool) {
    let files = match suites::collect(paths) {
        Ok(files) => files,
        Err(msg) => {
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let mut invalid = 0;
    for file in &files {
        match suites::load(file) {
            Ok(suite) => {
                if quiet {
                    continue;
                }
                match output {
                    OutputFormat::Text => println!(
                        "valid {} ({} tests)",
                        file.display(),
                        suite.tests.len()
                    ),
                    OutputFormat::Json => println!(
                        "{}",
                        serde_json::json!({
                            "file": file.display().to_string(),
                            "valid": true,
                            "tests": suite.tests.len(),
                        })
                    ),
                }
            }
            Err(e) => {
                invalid += 1;
                let msg = format!("invalid {}: {}", file.display(), e);
                report_error(&msg, output, quiet);
            }
        }
    }

    if invalid > 0 {
        process::exit(1);
    }
}
