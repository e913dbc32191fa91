use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::paginator::FetchRefused;

/// The push channel failed to open or dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("channel rejected: {0}")]
    Rejected(String),

    #[error("channel closed unexpectedly: {0}")]
    Closed(String),
}

impl TransportError {
    /// Classify a websocket error; refused/reset connections mean the
    /// backend is not reachable at all.
    pub fn from_tungstenite(err: tungstenite::Error) -> Self {
        match &err {
            tungstenite::Error::Io(io_err)
                if matches!(
                    io_err.kind(),
                    std::io::ErrorKind::ConnectionRefused
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::ConnectionAborted
                ) =>
            {
                Self::Unavailable
            }
            tungstenite::Error::Http(response) => {
                Self::Rejected(format!("HTTP {}", response.status()))
            }
            _ => Self::Closed(err.to_string()),
        }
    }
}

/// An inbound frame that is not a valid message record.
#[derive(Debug, Error)]
#[error("malformed frame: {0}")]
pub struct FrameError(#[from] pub serde_json::Error);

/// A history pull or a submission request failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("server is unavailable")]
    Unavailable,

    #[error("request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response body: {0}")]
    Decode(String),

    #[error("request failed: {0}")]
    Request(String),
}

impl FetchError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_connect() {
            Self::Unavailable
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Request(err.to_string())
        }
    }
}

/// The relevance oracle could not produce an answer. Never surfaced to
/// the user; callers fall back to the default anchor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OracleError {
    #[error("relevance oracle timed out")]
    Timeout,

    #[error("relevance oracle unavailable: {0}")]
    Unavailable(String),

    #[error("malformed relevance response: {0}")]
    Malformed(String),
}

impl OracleError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::Malformed(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Why a submission did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("{0}")]
    InvalidContent(String),

    #[error("a turn is still in progress")]
    TurnActive,

    #[error("not connected to the conversation")]
    Disconnected,

    #[error("another message is still being sent")]
    InFlight,

    #[error("no conversation is open")]
    NoConversation,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// The engine task is gone.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("conversation engine is gone")]
    Gone,

    #[error("conversation engine didn't respond")]
    NoResponse,

    #[error(transparent)]
    History(#[from] FetchRefused),
}
