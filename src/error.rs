use thiserror::Error;

/// Error type for the history store
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("History not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed document: {0}")]
    MalformedDocument(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("Keyword pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    #[error("Async task error: {0}")]
    AsyncTask(#[from] tokio::task::JoinError),
}

impl HistoryError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a malformed document error
    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        Self::MalformedDocument(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_) | Self::AsyncTask(_))
    }

    /// Whether this error came from an unparseable document.
    ///
    /// Document-level parse failures go through the repair path instead of
    /// failing the surrounding query.
    pub fn is_parse_failure(&self) -> bool {
        matches!(self, Self::MalformedDocument(_) | Self::Xml(_))
    }
}

/// Convenient result type for the history store
pub type Result<T> = std::result::Result<T, HistoryError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_error_creation_helpers() {
        match HistoryError::not_found("msg/roomA") {
            HistoryError::NotFound(msg) => assert_eq!(msg, "msg/roomA"),
            _ => panic!("Expected NotFound error"),
        }

        match HistoryError::invalid_input("bad component") {
            HistoryError::InvalidInput(msg) => assert_eq!(msg, "bad component"),
            _ => panic!("Expected InvalidInput error"),
        }

        match HistoryError::malformed("unclosed <record>") {
            HistoryError::MalformedDocument(msg) => assert_eq!(msg, "unclosed <record>"),
            _ => panic!("Expected MalformedDocument error"),
        }

        match HistoryError::configuration("cache_capacity") {
            HistoryError::Configuration(msg) => assert_eq!(msg, "cache_capacity"),
            _ => panic!("Expected Configuration error"),
        }
    }

    #[test]
    fn test_error_retry_logic() {
        let io_err = HistoryError::Io(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
        assert!(io_err.is_retryable());

        assert!(!HistoryError::not_found("x").is_retryable());
        assert!(!HistoryError::invalid_input("x").is_retryable());
        assert!(!HistoryError::malformed("x").is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = HistoryError::not_found("callhistory/default");
        assert_eq!(err.to_string(), "History not found: callhistory/default");

        let err = HistoryError::from(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.to_string().starts_with("IO error:"));
    }

    #[test]
    fn test_parse_failure_classification() {
        assert!(HistoryError::malformed("truncated").is_parse_failure());
        assert!(!HistoryError::not_found("x").is_parse_failure());
        assert!(
            !HistoryError::Io(io::Error::new(io::ErrorKind::Other, "disk")).is_parse_failure()
        );
    }
}
