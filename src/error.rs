//! Failure taxonomy for the request pipeline
//!
//! Every failure a pipeline stage can produce is classified here and then
//! folded into the descriptor's error list and status code. No stage lets
//! one of these escape its dispatch boundary.

use thiserror::Error;

/// Classified failure produced by a pipeline stage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Malformed or missing request input. Never reaches the network.
    #[error("request validation failed: {0}")]
    Validation(String),

    /// Connection, DNS, or TLS level failure from the transport.
    #[error("transport failure: {message}")]
    Transport {
        message: String,
        /// Status code reported by the transport, when one exists.
        status: Option<u16>,
    },

    /// The caller's cancellation signal fired, or the transport timed out.
    #[error("request cancelled or timed out: {0}")]
    Timeout(String),

    /// Response arrived but the payload did not match the expected shape.
    /// The response status code is preserved by the caller.
    #[error("response decode failed: {0}")]
    Decode(String),

    /// Synthetic rejection while the circuit breaker is open. No network
    /// attempt was made.
    #[error("circuit breaker is open; request rejected without dispatch")]
    CircuitOpen,

    /// The retry budget is spent; the last real failure is surfaced.
    #[error("retry budget exhausted after {attempts} attempts: {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },
}

impl FetchError {
    /// Status code this failure maps onto, if it overrides the one already
    /// on the descriptor. Decode failures and retry exhaustion keep the
    /// status of the underlying response.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Validation(_) => Some(400),
            Self::Transport { status, .. } => Some(status.unwrap_or(500)),
            Self::Timeout(_) => Some(408),
            Self::Decode(_) => None,
            Self::CircuitOpen => Some(503),
            Self::RetryExhausted { .. } => None,
        }
    }
}
