use thiserror::Error;

/// Shown whenever a query fails without a server-supplied message.
pub const DEFAULT_ERROR_MESSAGE: &str = "We're experiencing a high volume of requests at the moment. Please try again in a little while. We apologize for the inconvenience.";

/// Core error type for perplexed.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum SearchError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The request could not be made, or the endpoint answered with a non-success status.
    #[error("transport error{}: {message}", fmt_status(.status))]
    Transport {
        status: Option<u16>,
        retry_after: Option<u64>,
        message: String,
    },

    /// A record between two separators was not valid JSON.
    #[error("malformed record: {reason}")]
    MalformedRecord { reason: String },

    /// A record was valid JSON but did not carry the required fields.
    #[error("invalid record: {reason}")]
    InvalidRecord { reason: String },

    /// The producer answered with `success: false`.
    #[error("search failed: {}", .message.as_deref().unwrap_or("<no message>"))]
    Application { message: Option<String> },

    #[error("a query is already streaming (generation {generation})")]
    QueryInFlight { generation: u64 },

    #[error("session driver has shut down")]
    SessionClosed,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SearchError {
    /// Short stable name for logs and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport { .. } => "transport",
            Self::MalformedRecord { .. } => "malformed_record",
            Self::InvalidRecord { .. } => "invalid_record",
            Self::Application { .. } => "application",
            Self::QueryInFlight { .. } => "query_in_flight",
            Self::SessionClosed => "session_closed",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }

    /// Text the presentation layer should display for this failure.
    ///
    /// Application and validation errors carry their message through verbatim;
    /// every other failure collapses to [`DEFAULT_ERROR_MESSAGE`].
    pub fn user_message(&self) -> String {
        match self {
            Self::Application { message: Some(m) } if !m.trim().is_empty() => m.clone(),
            Self::Validation(m) => m.clone(),
            _ => DEFAULT_ERROR_MESSAGE.to_string(),
        }
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

pub type CoreResult<T> = std::result::Result<T, SearchError>;
