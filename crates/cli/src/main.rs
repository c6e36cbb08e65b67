mod commands;
mod profile;
mod suites;
mod tap;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use commands::{cmd_run, cmd_validate, RunOptions};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Unified test format runner.
#[derive(Parser)]
#[command(name = "unified", version, about = "Unified test format runner")]
struct Cli {
    /// Output format for validate (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run suites and report TAP, against a simulated deployment unless --uri is given
    Run {
        /// Suite files or directories of suite files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Connection string of a live deployment to run against
        #[arg(long)]
        uri: Option<String>,
        /// TOML deployment profile
        #[arg(long)]
        profile: Option<PathBuf>,
        /// Skip the test with this description (repeatable)
        #[arg(long)]
        skip: Vec<String>,
        /// File listing test descriptions to skip, one per line
        #[arg(long)]
        skip_file: Option<PathBuf>,
        /// Log every runner phase and operation to stderr
        #[arg(long)]
        trace: bool,
    },

    /// Parse suites and check their schema versions without running them
    Validate {
        /// Suite files or directories of suite files
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            paths,
            uri,
            profile,
            skip,
            skip_file,
            trace,
        } => {
            cmd_run(RunOptions {
                paths: &paths,
                uri: uri.as_deref(),
                profile: profile.as_deref(),
                skip: &skip,
                skip_file: skip_file.as_deref(),
                trace,
            });
        }
        Commands::Validate { paths } => {
            cmd_validate(&paths, cli.output, cli.quiet);
        }
    }
}

/// Logs go to stderr so TAP on stdout stays parseable. `RUST_LOG` wins
/// unless tracing was asked for explicitly.
pub(crate) fn init_tracing(trace: bool) {
    let filter = if trace {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}
