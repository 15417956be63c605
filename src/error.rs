use std::time::Duration;

/// Broad classification of a gateway failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    AcquireTimeout,
    Transport,
    QueryExecution,
    PoolClosed,
}

/// Errors surfaced by the query gateway
///
/// Messages never include the connection string, so they are safe to log.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timed out after {}ms waiting for a database connection", .0.as_millis())]
    AcquireTimeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Query execution error: {message}")]
    QueryExecution {
        message: String,
        /// SQLSTATE reported by the server, when there is one
        code: Option<String>,
    },

    #[error("Connection pool is closed")]
    PoolClosed,
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Configuration(_) => ErrorKind::Configuration,
            GatewayError::AcquireTimeout(_) => ErrorKind::AcquireTimeout,
            GatewayError::Transport(_) => ErrorKind::Transport,
            GatewayError::QueryExecution { .. } => ErrorKind::QueryExecution,
            GatewayError::PoolClosed => ErrorKind::PoolClosed,
        }
    }

    /// Whether the same request may succeed if simply issued again.
    ///
    /// Server-side rejections are not retryable: they reflect the statement,
    /// not the connection it ran on.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AcquireTimeout | ErrorKind::Transport
        )
    }

    /// Whether the connection that produced this error must be discarded
    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub(crate) fn query(message: impl Into<String>) -> Self {
        GatewayError::QueryExecution {
            message: message.into(),
            code: None,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db) => GatewayError::QueryExecution {
                message: db.message().to_string(),
                code: db.code().map(|c| c.into_owned()),
            },
            // The connection is still usable after a decode failure
            err @ (sqlx::Error::RowNotFound
            | sqlx::Error::TypeNotFound { .. }
            | sqlx::Error::ColumnIndexOutOfBounds { .. }
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)) => GatewayError::query(err.to_string()),
            sqlx::Error::Configuration(e) => GatewayError::Configuration(e.to_string()),
            sqlx::Error::PoolClosed => GatewayError::PoolClosed,
            other => GatewayError::Transport(other.to_string()),
        }
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
