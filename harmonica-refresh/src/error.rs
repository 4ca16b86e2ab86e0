//! Error types for the refresh coordinator

/// Result type for coordinator operations.
///
/// Store and summarizer seams return [`anyhow::Result`]; the coordinator's own
/// surface narrows those into [`RefreshError`].
pub type Result<T> = std::result::Result<T, RefreshError>;

/// Errors surfaced by the refresh coordinator.
///
/// Most failures inside the coordinator are recovered locally (a failed edit
/// write is logged and the next poll heals it). The variants below are the
/// ones a caller can actually observe.
///
/// # Error Categories
///
/// - **Regeneration Errors**: the summarizer or the follow-up persistence failed
/// - **Store Errors**: a read against the summary store failed
/// - **Configuration Errors**: invalid or unreadable configuration
/// - **IO Errors**: file system access issues
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// Regenerating a resource's summary failed; the resource is now `Outdated`
    #[error("Summary regeneration failed for {resource_id}: {source}")]
    Regeneration {
        resource_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Reading from the summary store failed
    #[error("Summary store error: {source}")]
    Store {
        #[from]
        source: anyhow::Error,
    },

    /// Configuration is invalid
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// IO errors when reading configuration files
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl RefreshError {
    /// Wrap a failed regeneration for `resource_id`.
    pub fn regeneration<S: Into<String>>(resource_id: S, source: anyhow::Error) -> Self {
        Self::Regeneration {
            resource_id: resource_id.into(),
            source,
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// True if this error came out of a regeneration attempt.
    pub fn is_regeneration(&self) -> bool {
        matches!(self, Self::Regeneration { .. })
    }
}
