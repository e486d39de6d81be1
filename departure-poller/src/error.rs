use thiserror::Error;

/// Errors reading the departure change feed.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("departure query failed with: {0}")]
    QueryError(#[from] sqlx::Error),
}

/// Errors refreshing a reference data snapshot.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("{resolver} refresh query failed with: {error}")]
    QueryError {
        resolver: &'static str,
        error: sqlx::Error,
    },
    #[error("{resolver} refresh failed: {reason}")]
    RefreshFailed {
        resolver: &'static str,
        reason: String,
    },
}

/// Errors that end a poll cycle, or the polling loop itself.
#[derive(Error, Debug)]
pub enum PollerError {
    #[error(transparent)]
    FeedError(#[from] FeedError),
    #[error("failed to serialize {pipeline} message: {error}")]
    SerializeError {
        pipeline: &'static str,
        error: serde_json::Error,
    },
    #[error("the outbound queue was closed")]
    QueueClosed,
    #[error("the connectivity signal was dropped")]
    ConnectivityClosed,
}

impl PollerError {
    /// Whether the polling loop can keep going after this error.
    ///
    /// A serialization failure happens after the filters cached what they
    /// accepted, so retrying the batch would silently drop those records.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PollerError::SerializeError { .. }
                | PollerError::QueueClosed
                | PollerError::ConnectivityClosed
        )
    }
}

/// Errors delivering a message to the broker bridge.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("invalid publish url: {0}")]
    ParseUrlError(url::ParseError),
    #[error("publish request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}
