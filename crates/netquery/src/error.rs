use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// An error raised by a [`Fetcher`](crate::Fetcher) while fetching a request.
///
/// These errors never leave the query layer as an `Err`. The fetch coordinator converts them
/// into a failed [`QueryResponse`] carrying [`code`](Self::code) and the error message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The request could not be delivered, like connection loss or DNS resolution.
    ///
    /// The attached string contains the transport's error message.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    /// The remote answered with a failure status.
    #[error("request failed with status {code}: {message}")]
    Status { code: i64, message: String },
    /// The remote answered, but the payload does not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// The fetch was torn down before it settled, for example on runtime shutdown.
    #[error("fetch interrupted")]
    Interrupted,
    /// The fetcher panicked.
    #[error("fetcher panicked: {0}")]
    Panicked(String),
}

impl FetchError {
    /// The error code surfaced to consumers, if this error has one.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Self::Panicked(message)
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => Self::Transport(format!("timed out: {err}")),
            std::io::ErrorKind::InvalidData => Self::Malformed(err.to_string()),
            _ => Self::Transport(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// The outcome of a fetch, as produced by a [`Fetcher`](crate::Fetcher) and handed back to
/// callers of the query layer.
///
/// `success` and the presence of `data` are independent: a successful response may well carry
/// no payload, and a failed one may carry a partial one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse<T> {
    /// The response payload.
    pub data: Option<T>,
    /// Whether the request succeeded.
    pub success: bool,
    /// Error code of a failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<i64>,
    /// Error message of a failed request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
}

impl<T> QueryResponse<T> {
    /// A successful response carrying `data`.
    pub fn ok(data: T) -> Self {
        Self {
            data: Some(data),
            success: true,
            error_code: None,
            error_msg: None,
        }
    }

    /// A successful response without a payload.
    pub fn empty() -> Self {
        Self {
            data: None,
            success: true,
            error_code: None,
            error_msg: None,
        }
    }

    /// A failed response.
    pub fn failure(error_code: Option<i64>, error_msg: impl Into<String>) -> Self {
        Self {
            data: None,
            success: false,
            error_code,
            error_msg: Some(error_msg.into()),
        }
    }

    /// The response for a query that has nothing to request.
    ///
    /// This is not an error, so it carries neither code nor message.
    pub fn no_request() -> Self {
        Self {
            data: None,
            success: false,
            error_code: None,
            error_msg: None,
        }
    }
}

impl<T> From<FetchError> for QueryResponse<T> {
    fn from(err: FetchError) -> Self {
        Self::failure(err.code(), err.to_string())
    }
}

impl<T> From<Result<QueryResponse<T>, FetchError>> for QueryResponse<T> {
    fn from(result: Result<QueryResponse<T>, FetchError>) -> Self {
        result.unwrap_or_else(Self::from)
    }
}
