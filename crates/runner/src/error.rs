use unified_driver::DriverError;
use unified_format::{EntityKind, FormatError};

/// Errors raised while interpreting a test.
///
/// An unmet requirement is not an error; it produces
/// [`TestOutcome::Skipped`](crate::TestOutcome::Skipped).
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The suite is malformed or refers to something it never declared.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// An operation named an entity that does not exist.
    #[error("entity '{id}' not found")]
    Lookup { id: String },

    /// An entity exists but is not of the kind the caller needs.
    #[error("entity '{id}' is a {actual}, expected a {expected}")]
    WrongKind {
        id: String,
        expected: EntityKind,
        actual: EntityKind,
    },

    /// An operation failed and the test did not expect it to.
    #[error("operation '{operation}' failed: {source}")]
    Operation {
        operation: String,
        #[source]
        source: DriverError,
    },

    /// Observed state diverged from what the test expects.
    #[error("assertion failed: {0}")]
    Mismatch(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Format(#[from] FormatError),
}

impl RunnerError {
    pub fn mismatch(message: impl Into<String>) -> Self {
        RunnerError::Mismatch(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        RunnerError::Configuration(message.into())
    }

    /// The driver error behind an operation failure, if this is one.
    ///
    /// Anything else (lookups, malformed arguments, failed assertions) is
    /// handed back unchanged so it can propagate.
    pub fn into_driver_error(self) -> Result<DriverError, RunnerError> {
        match self {
            RunnerError::Driver(err) | RunnerError::Operation { source: err, .. } => Ok(err),
            other => Err(other),
        }
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_errors_are_recoverable_from_operation_failures() {
        let err = RunnerError::Operation {
            operation: "insertOne".to_string(),
            source: DriverError::command(11000, "DuplicateKey", "E11000"),
        };
        assert_eq!(err.into_driver_error().unwrap().code(), Some(11000));

        let err = RunnerError::Lookup {
            id: "session0".to_string(),
        };
        assert!(err.into_driver_error().is_err());
    }

    #[test]
    fn wrong_kind_names_both_kinds() {
        let err = RunnerError::WrongKind {
            id: "db0".to_string(),
            expected: EntityKind::Collection,
            actual: EntityKind::Database,
        };
        assert_eq!(err.to_string(), "entity 'db0' is a database, expected a collection");
    }
}
