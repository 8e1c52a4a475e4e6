//! Relay error types

use chatrelay_protocol::BackendKind;
use thiserror::Error;

use crate::session::{HandshakeStep, SessionState};

/// Failures surfaced to the caller before any event is streamed.
///
/// Failures during streaming never show up here; the normalizer absorbs them
/// and still terminates the event sequence.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("prompt exceeded token limit: {used} tokens used, {limit} limit")]
    TokenLimitExceeded { used: u64, limit: u64 },

    #[error("{backend} handshake failed at {step}{}: {detail}", status_suffix(.status))]
    HandshakeFailed {
        backend: BackendKind,
        step: HandshakeStep,
        status: Option<u16>,
        detail: String,
    },

    #[error("session cannot advance from {from:?}")]
    InvalidTransition { from: SessionState },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("request cancelled during {backend} handshake")]
    Cancelled { backend: BackendKind },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RelayError {
    pub(crate) fn handshake(
        backend: BackendKind,
        step: HandshakeStep,
        status: Option<u16>,
        detail: impl Into<String>,
    ) -> Self {
        Self::HandshakeFailed {
            backend,
            step,
            status,
            detail: detail.into(),
        }
    }

    /// Upstream HTTP status when the failure came from a response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HandshakeFailed { status, .. } => *status,
            Self::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Every error variant is raised before the first canonical event
    pub fn is_pre_stream(&self) -> bool {
        true
    }

    pub fn is_token_limit(&self) -> bool {
        matches!(self, Self::TokenLimitExceeded { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

fn status_suffix(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" [{}]", code),
        None => String::new(),
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
