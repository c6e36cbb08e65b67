//! unified-runner: interpreter for unified test format suites.
//!
//! [`run_suite`] takes a parsed [`Suite`](unified_format::Suite), a
//! [`Deployment`](unified_driver::Deployment) to run it against and a
//! [`RunnerConfig`], and returns a [`SuiteReport`] with one
//! [`TestOutcome`] per test. The pieces it is built from are public so a
//! harness can drive them individually:
//!
//! - [`EntityMap`]: clients, databases, collections, sessions, buckets and
//!   saved results, addressed by test-scoped id
//! - [`RequirementContext`]: `runOnRequirements` evaluation
//! - [`OperationExecutor`]: operation dispatch with `expectError` /
//!   `expectResult` checks
//! - [`match_events`] and [`matching`]: event and value matching

mod config;
mod entities;
mod error;
mod events;
pub mod matching;
mod operations;
mod options;
mod report;
mod requirements;
mod runner;

pub use config::RunnerConfig;
pub use entities::{Entity, EntityMap};
pub use error::{RunnerError, RunnerResult};
pub use events::{match_events, CapturedEvents, EventRecorder};
pub use operations::{OperationExecutor, OperationResult};
pub use report::{SuiteReport, TestOutcome, TestReport};
pub use requirements::{parse_version, RequirementContext};
pub use runner::{run_suite, run_test};
