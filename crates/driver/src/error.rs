use serde_json::Value;

/// Error label attached to errors that may succeed if the whole transaction is retried.
pub const TRANSIENT_TRANSACTION_ERROR: &str = "TransientTransactionError";

/// Server error code for a missing database or collection.
pub const NAMESPACE_NOT_FOUND: i32 = 26;

/// All errors a driver implementation can return.
///
/// The runner normalizes every variant into code, code name, message,
/// labels and a client-side flag; see the accessor methods.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The server rejected a command.
    #[error("command failed with {code_name} ({code}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
        labels: Vec<String>,
    },

    /// A bulk write failed part-way; `result` holds what was applied.
    #[error("bulk write failed with code {code}: {message}")]
    BulkWrite {
        code: i32,
        code_name: String,
        message: String,
        labels: Vec<String>,
        result: Value,
    },

    /// The connection to the server was lost.
    #[error("network error: {message}")]
    Network { message: String, labels: Vec<String> },

    /// Arguments were rejected before anything was sent.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// A session or transaction was used in an invalid state.
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// The handle (client, session, cursor) was already closed.
    #[error("{what} is closed")]
    Closed { what: String },

    /// A bucket file is missing or its chunks are inconsistent.
    #[error("{message}")]
    Bucket { message: String },
}

impl DriverError {
    pub fn command(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        DriverError::Command {
            code,
            code_name: code_name.into(),
            message: message.into(),
            labels: Vec::new(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        DriverError::InvalidArgument {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        DriverError::Transaction {
            message: message.into(),
        }
    }

    /// Server error code, if the error came from the server.
    pub fn code(&self) -> Option<i32> {
        match self {
            DriverError::Command { code, .. } | DriverError::BulkWrite { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn code_name(&self) -> Option<&str> {
        match self {
            DriverError::Command { code_name, .. } | DriverError::BulkWrite { code_name, .. } => {
                Some(code_name)
            }
            _ => None,
        }
    }

    pub fn labels(&self) -> &[String] {
        match self {
            DriverError::Command { labels, .. }
            | DriverError::BulkWrite { labels, .. }
            | DriverError::Network { labels, .. } => labels,
            _ => &[],
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels().iter().any(|l| l == label)
    }

    /// True when the failure originated in the client rather than the server.
    pub fn is_client_error(&self) -> bool {
        !matches!(
            self,
            DriverError::Command { .. } | DriverError::BulkWrite { .. }
        )
    }

    pub fn is_network_error(&self) -> bool {
        matches!(self, DriverError::Network { .. })
    }

    /// Partial result carried by the error.
    pub fn partial_result(&self) -> Option<&Value> {
        match self {
            DriverError::BulkWrite { result, .. } => Some(result),
            _ => None,
        }
    }

    pub(crate) fn with_label(mut self, label: &str) -> Self {
        match &mut self {
            DriverError::Command { labels, .. }
            | DriverError::BulkWrite { labels, .. }
            | DriverError::Network { labels, .. } => {
                if !labels.iter().any(|l| l == label) {
                    labels.push(label.to_string());
                }
            }
            _ => {}
        }
        self
    }
}

pub type DriverResult<T> = Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_are_server_side() {
        let err = DriverError::command(11000, "DuplicateKey", "E11000 duplicate key");
        assert!(!err.is_client_error());
        assert_eq!(err.code(), Some(11000));
        assert_eq!(err.code_name(), Some("DuplicateKey"));
        assert!(err.to_string().contains("E11000"));
    }

    #[test]
    fn network_errors_are_client_side_and_carry_labels() {
        let err = DriverError::Network {
            message: "connection closed".to_string(),
            labels: Vec::new(),
        }
        .with_label(TRANSIENT_TRANSACTION_ERROR);
        assert!(err.is_client_error());
        assert!(err.has_label(TRANSIENT_TRANSACTION_ERROR));
        assert_eq!(err.code(), None);
    }

    #[test]
    fn with_label_does_not_duplicate() {
        let err = DriverError::command(1, "InternalError", "x")
            .with_label("A")
            .with_label("A");
        assert_eq!(err.labels(), &["A".to_string()]);
    }
}
