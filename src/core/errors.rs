use std::fmt;
use thiserror::Error;

/// Stage of a pipeline that produced an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Estimate,
    Reconcile,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Estimate => f.write_str("estimate"),
            Self::Reconcile => f.write_str("reconcile"),
        }
    }
}

/// Unified error type for the live cache
#[derive(Debug, Error)]
pub enum LiveCacheError {
    /// The caller's fold rejected the trigger; nothing was written or scheduled
    #[error("Fold failed for key {key}")]
    Fold {
        key: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A caller-supplied stage returned an error
    #[error("{stage} stage failed for key {key} (version {version})")]
    Stage {
        key: String,
        stage: StageKind,
        version: u64,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stage exceeded its configured time budget
    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout {
        operation: String,
        timeout_ms: u64,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// No async runtime was available to run pipelines on
    #[error("Runtime unavailable: {message}")]
    Runtime { message: String },

    /// IO errors (config files)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Serialization errors
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Pipeline task panicked or was torn down with the runtime
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl LiveCacheError {
    /// Create a fold error from the caller's error
    pub fn fold<K: Into<String>>(key: K, source: anyhow::Error) -> Self {
        Self::Fold {
            key: key.into(),
            source: source.into(),
        }
    }

    /// Create a stage error from the caller's error
    pub fn stage<K: Into<String>>(
        key: K,
        stage: StageKind,
        version: u64,
        source: anyhow::Error,
    ) -> Self {
        Self::Stage {
            key: key.into(),
            stage,
            version,
            source: source.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

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

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
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

    /// Create an internal error with source
    pub fn internal_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether resubmitting the same trigger may succeed
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Stage { .. } | Self::Timeout { .. } | Self::Io { .. } => true,
            Self::Fold { .. } | Self::Configuration { .. } | Self::Runtime { .. } => false,
            Self::Serialization { .. } | Self::Internal { .. } => false,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Fold { .. } => "fold",
            Self::Stage { .. } => "stage",
            Self::Timeout { .. } => "timeout",
            Self::Configuration { .. } => "configuration",
            Self::Runtime { .. } => "runtime",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, LiveCacheError>;

impl From<serde_yaml::Error> for LiveCacheError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<serde_json::Error> for LiveCacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}
