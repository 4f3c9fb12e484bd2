//! Error types for the wiki API client.
//!
//! # Design
//! Three failure families stay apart so callers can branch on them:
//! - `Api`: the server understood the request and answered with a defined
//!   negative outcome. The raw result code is always preserved.
//! - `ApiBusy`: the server kept signalling replication lag until the retry
//!   budget ran out. Transient; the whole operation may be retried later.
//! - `Transport` / `MalformedResponse`: the exchange failed or the body was
//!   not the expected shape. Never retried by the client.

use std::fmt;

use thiserror::Error;

use crate::http::TransportError;

/// A server-defined result string.
///
/// Known codes compare by value with `recognized == true`; anything else is
/// carried verbatim with `recognized == false`. Never empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultCode {
    raw: String,
    recognized: bool,
}

impl ResultCode {
    /// Returns `None` for an empty string, which is not a result code.
    pub fn new(raw: impl Into<String>, recognized: bool) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return None;
        }
        Some(Self { raw, recognized })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn is_recognized(&self) -> bool {
        self.recognized
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl PartialEq<str> for ResultCode {
    fn eq(&self, other: &str) -> bool {
        self.raw == other
    }
}

impl PartialEq<&str> for ResultCode {
    fn eq(&self, other: &&str) -> bool {
        self.raw == *other
    }
}

/// A recognized failure outcome reported by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub code: ResultCode,
    pub message: Option<String>,
}

impl ApiError {
    pub fn new(code: ResultCode, message: Option<String>) -> Self {
        Self { code, message }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.code, message),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for ApiError {}

/// Errors returned by `Client` operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    /// Replication lag persisted past the retry budget.
    #[error("API busy: server lagged on all {attempts} attempts")]
    ApiBusy { attempts: u32 },

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The body could not be parsed into the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    #[error("invalid API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The next retry wait would run past the configured call deadline.
    #[error("call deadline exceeded after {attempts} attempts")]
    DeadlineExceeded { attempts: u32 },

    /// A login reply was fed to a handshake with no round in flight.
    #[error("login reply {code:?} with no round in flight")]
    UnexpectedLoginReply { code: String },
}

impl Error {
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::ApiBusy { .. })
    }

    /// Raw result code when this is an `Api` error.
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Error::Api(err) => Some(err.code.as_str()),
            _ => None,
        }
    }
}
