//! Error types for conformance runs
//!
//! Every failure is fatal to the run. The variants mirror the categories a
//! report needs to tell apart: transport failures, malformed documents,
//! inconsistent device state, exceeded waits, and WebSocket protocol
//! violations.

use std::time::Duration;

use thiserror::Error;

/// Result type for conformance operations
pub type ConformanceResult<T> = Result<T, ConformanceError>;

/// Errors that abort a conformance run
#[derive(Debug, Error)]
pub enum ConformanceError {
    /// The HTTP transport failed (connection refused, TLS, timeout)
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The WebSocket transport failed
    #[error("WebSocket transport failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A response carried the wrong status code
    #[error("{method} {path}: expected status {expected}, got {actual}")]
    Status {
        method: String,
        path: String,
        expected: u16,
        actual: u16,
    },

    /// A document or message is missing a field or has the wrong structure
    #[error("{path}: expected {expected}, got {actual}")]
    Shape {
        path: String,
        expected: String,
        actual: String,
    },

    /// The device state does not agree with what was previously observed
    #[error("inconsistent state for {what}: expected {expected}, got {actual}")]
    State {
        what: String,
        expected: String,
        actual: String,
    },

    /// A bounded wait ran out
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// The WebSocket delivered a message that was not expected at this point
    #[error("unexpected {message_type} message: {detail}")]
    UnexpectedMessage {
        message_type: String,
        detail: String,
    },

    /// The WebSocket closed before all expected messages arrived
    #[error("connection closed while waiting for {expecting}")]
    ConnectionClosed { expecting: String },

    /// The description does not advertise a WebSocket endpoint
    #[error("thing description does not advertise a WebSocket link")]
    MissingChannel,

    /// An operation was attempted in the wrong session state
    #[error("session is {state}, cannot {operation}")]
    InvalidSession {
        state: &'static str,
        operation: &'static str,
    },
}

impl ConformanceError {
    /// Build a shape error from anything displayable
    pub fn shape(
        path: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::Shape {
            path: path.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Build a state-consistency error from anything displayable
    pub fn state(
        what: impl Into<String>,
        expected: impl std::fmt::Display,
        actual: impl std::fmt::Display,
    ) -> Self {
        Self::State {
            what: what.into(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// Short category label used in run summaries
    pub fn category(&self) -> &'static str {
        match self {
            Self::Http(_) | Self::WebSocket(_) => "TRANSPORT",
            Self::Status { .. } => "STATUS",
            Self::Shape { .. } | Self::MissingChannel => "SHAPE",
            Self::State { .. } => "STATE",
            Self::Timeout { .. } => "TIMEOUT",
            Self::UnexpectedMessage { .. } => "MESSAGE",
            Self::ConnectionClosed { .. } => "CLOSED",
            Self::InvalidSession { .. } => "SESSION",
        }
    }
}
