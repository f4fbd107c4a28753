//! Error types shared across the crate.

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Could not build or reach the connection pool.
    #[error("database unavailable: {0}")]
    Unavailable(String),

    /// Checked out a connection but the query failed.
    #[error("query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Schema migration failed at startup.
    #[error("migration failed: {0}")]
    Migration(#[from] Box<refinery::Error>),

    /// A row the caller expected to exist was not there.
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Unavailable(e.to_string())
    }
}

impl From<deadpool_postgres::CreatePoolError> for DatabaseError {
    fn from(e: deadpool_postgres::CreatePoolError) -> Self {
        DatabaseError::Unavailable(e.to_string())
    }
}

/// Errors from outbound messaging and media retrieval.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The provider rejected an outbound message.
    #[error("send failed: {reason}")]
    SendFailed { reason: String },

    /// Inbound media could not be downloaded.
    #[error("media fetch failed: {reason}")]
    MediaFetchFailed { reason: String },

    /// The webhook server could not start.
    #[error("startup failed: {reason}")]
    StartupFailed { reason: String },

    /// Transport-level HTTP failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the classifier/extraction collaborator.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transport-level HTTP failure.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API returned a non-success status.
    #[error("api error {status}: {body}")]
    Api { status: u16, body: String },

    /// The model produced output we could not decode.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Errors building the process configuration from the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}
