//! Crate-wide error type and result alias.

use thiserror::Error;

pub type VolleyResult<T> = Result<T, VolleyError>;

/// Every failure kind a scenario step can surface. Each one short-circuits
/// the remaining steps of the owning virtual-user instance; none are retried.
#[derive(Debug, Error)]
pub enum VolleyError {
    /// Zero or more than one key of the request specification belongs to the
    /// service-method vocabulary.
    #[error("unrecognized request: {0}")]
    UnrecognizedRequest(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid dispatch: {0}")]
    InvalidDispatch(String),

    #[error("response timeout after {seconds}s on channel {channel:?}")]
    ResponseTimeout { channel: String, seconds: u64 },

    /// The reply payload does not structurally equal the expected data.
    #[error("data is not valid")]
    DataMismatch,

    /// A capture or match expression could not be evaluated.
    #[error("extraction failed: {0}")]
    Extraction(String),

    /// One or more match assertions failed against the reply.
    #[error("failed match")]
    MatchFailed,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("scenario error: {0}")]
    Scenario(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VolleyError {
    /// Stable per-kind key, used for logging and report tooling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnrecognizedRequest(_) => "unrecognized_request",
            Self::Connection(_) => "connection_error",
            Self::InvalidDispatch(_) => "invalid_dispatch",
            Self::ResponseTimeout { .. } => "response_timeout",
            Self::DataMismatch => "data_mismatch",
            Self::Extraction(_) => "extraction_error",
            Self::MatchFailed => "match_failed",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::Scenario(_) => "scenario_error",
            Self::Config(_) => "config_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }
}
