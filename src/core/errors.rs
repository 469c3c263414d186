use std::collections::HashMap;
use thiserror::Error;

/// Unified error type for the router
#[derive(Debug, Error)]
pub enum RouterError {
    /// Peek or dequeue on an empty hop queue
    #[error("Hop queue of partition {partition} is empty")]
    EmptyQueue { partition: usize },

    /// A hop answered with an abort status
    #[error("Transaction aborted: {tag} - {reason}")]
    AbortedTransaction { tag: String, reason: String },

    /// Update or read targeted a missing row
    #[error("Record not found: {table}/{key}")]
    RecordNotFound { table: String, key: String },

    /// Write collided with an existing row
    #[error("Duplicate key: {table}/{key}")]
    DuplicateKey { table: String, key: String },

    /// A dependency or ordering gate that can never open
    #[error("Dependency unsatisfiable for {tag}: {reason} (missing: {missing:?})")]
    DependencyUnsatisfiable {
        tag: String,
        missing: Vec<String>,
        reason: String,
    },

    /// Prerequisite declarations form a cycle
    #[error("Circular dependency detected: {cycle}")]
    DependencyCycle { cycle: String },

    #[error("Invalid partition {partition} (router has {partitions})")]
    InvalidPartition { partition: usize, partitions: usize },

    /// Hop rejected at submission
    #[error("Invalid hop for {tag}: {message}")]
    InvalidHop { tag: String, message: String },

    #[error("Router is already running")]
    AlreadyRunning,

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Row store failures
    #[error("Storage operation failed: {operation}")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Coordinator/executor channel errors
    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: HashMap<String, String>,
    },
}

impl RouterError {
    pub fn empty_queue(partition: usize) -> Self {
        Self::EmptyQueue { partition }
    }

    pub fn aborted<S: Into<String>, R: Into<String>>(tag: S, reason: R) -> Self {
        Self::AbortedTransaction {
            tag: tag.into(),
            reason: reason.into(),
        }
    }

    pub fn record_not_found<T: Into<String>, K: Into<String>>(table: T, key: K) -> Self {
        Self::RecordNotFound {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn duplicate_key<T: Into<String>, K: Into<String>>(table: T, key: K) -> Self {
        Self::DuplicateKey {
            table: table.into(),
            key: key.into(),
        }
    }

    pub fn unsatisfiable<S: Into<String>, R: Into<String>>(
        tag: S,
        missing: Vec<String>,
        reason: R,
    ) -> Self {
        Self::DependencyUnsatisfiable {
            tag: tag.into(),
            missing,
            reason: reason.into(),
        }
    }

    pub fn invalid_hop<S: Into<String>, M: Into<String>>(tag: S, message: M) -> Self {
        Self::InvalidHop {
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error naming the offending field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn storage<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        operation: S,
        source: E,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            context: HashMap::new(),
        }
    }

    /// Add context to an internal error
    pub fn with_context<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        if let Self::Internal { ref mut context, .. } = self {
            context.insert(key.into(), value.into());
        }
        self
    }

    /// Whether the unit that hit this error can keep going
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::AbortedTransaction { .. }
            | Self::RecordNotFound { .. }
            | Self::DuplicateKey { .. }
            | Self::DependencyUnsatisfiable { .. } => true,
            Self::Storage { .. } | Self::Io { .. } => true,
            Self::EmptyQueue { .. } | Self::Channel { .. } => false,
            Self::Configuration { .. } | Self::DependencyCycle { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::EmptyQueue { .. } => "queue",
            Self::AbortedTransaction { .. } => "abort",
            Self::RecordNotFound { .. } | Self::DuplicateKey { .. } => "record",
            Self::DependencyUnsatisfiable { .. } | Self::DependencyCycle { .. } => "dependency",
            Self::InvalidPartition { .. } | Self::InvalidHop { .. } => "submission",
            Self::AlreadyRunning => "lifecycle",
            Self::Configuration { .. } => "configuration",
            Self::Storage { .. } => "storage",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Channel { .. } => "channel",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, RouterError>;

impl From<std::io::Error> for RouterError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for RouterError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for RouterError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<sled::Error> for RouterError {
    fn from(err: sled::Error) -> Self {
        Self::storage("sled_operation", err)
    }
}

impl From<anyhow::Error> for RouterError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(err.to_string()).with_context("source", "anyhow")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(RouterError::empty_queue(0).category(), "queue");
        assert_eq!(RouterError::aborted("T1", "conflict").category(), "abort");
        assert_eq!(
            RouterError::unsatisfiable("T7", vec!["T2".into()], "aborted").category(),
            "dependency"
        );
    }

    #[test]
    fn test_error_recoverability() {
        assert!(RouterError::aborted("T1", "x").is_recoverable());
        assert!(RouterError::record_not_found("Users", "1").is_recoverable());
        assert!(!RouterError::empty_queue(2).is_recoverable());
        assert!(!RouterError::configuration("bad").is_recoverable());
    }

    #[test]
    fn test_error_context() {
        let err = RouterError::internal("boom").with_context("partition", "3");
        if let RouterError::Internal { context, .. } = err {
            assert_eq!(context.get("partition"), Some(&"3".to_string()));
        } else {
            panic!("Expected internal error");
        }
    }

    #[test]
    fn test_error_display() {
        let err = RouterError::unsatisfiable("T7", vec!["T2".into(), "T3".into()], "timed out");
        let display = err.to_string();
        assert!(display.contains("T7"));
        assert!(display.contains("timed out"));
        assert!(display.contains("T3"));
    }
}
