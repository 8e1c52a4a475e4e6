//! Back-end session state machines.
//!
//! Every back-end walks `Init → Authenticated → ConversationReady →
//! MessageSlotReady → Streaming → Done`, skipping the states its handshake
//! does not need. Each call to [`BackendSession::advance`] performs at most
//! one network request. A failed step moves the session to
//! [`SessionState::Failed`], which is terminal.

mod anon_chat;
mod huggingchat;
mod inference;

pub use anon_chat::{AnonChatSession, ChatRequirements, ProofOfWorkRequirement};
pub use huggingchat::HuggingChatSession;
pub use inference::{InferenceParams, InferenceSession, DEFAULT_TEMPERATURE};

use async_trait::async_trait;
use chatrelay_protocol::BackendKind;
use std::fmt;

use crate::error::{RelayError, RelayResult};
use crate::normalizer::WireFormat;
use crate::transport::ByteStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Init,
    Authenticated,
    ConversationReady,
    MessageSlotReady,
    Streaming,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

/// Named handshake step, reported in errors and logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeStep {
    /// Settings POST that yields the session cookie
    Settings,
    /// Conversation creation
    Conversation,
    /// Latest message id lookup
    MessageSlot,
    /// Requirements probe and proof-of-work
    Requirements,
    /// Local payload preparation
    Prepare,
    /// Streaming request
    Stream,
}

impl HandshakeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Conversation => "conversation",
            Self::MessageSlot => "message_slot",
            Self::Requirements => "requirements",
            Self::Prepare => "prepare",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for HandshakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One request's handshake with one upstream.
///
/// Sessions are never reused: build one per client request and drop it when
/// the stream ends or a step fails.
#[async_trait]
pub trait BackendSession: Send {
    fn backend(&self) -> BackendKind;

    fn state(&self) -> SessionState;

    /// HTTP status of the most recent network step
    fn last_status(&self) -> Option<u16>;

    /// Identifier extracted by the most recent successful step
    fn last_id(&self) -> Option<&str>;

    /// How the streaming body is encoded
    fn wire_format(&self) -> WireFormat;

    /// Run the next handshake step and return the new state
    async fn advance(&mut self) -> RelayResult<SessionState>;

    /// Hand over the response body once `Streaming`; the session becomes `Done`
    fn take_body(&mut self) -> Option<ByteStream>;
}

/// Advance `session` until it streams, then take its body
pub async fn drive_to_streaming(session: &mut dyn BackendSession) -> RelayResult<ByteStream> {
    while session.state() != SessionState::Streaming {
        session.advance().await?;
    }

    session.take_body().ok_or_else(|| {
        RelayError::InvalidResponse(format!("{} session has no body", session.backend()))
    })
}

/// State bookkeeping shared by every back-end
#[derive(Debug)]
pub(crate) struct StepTracker {
    backend: BackendKind,
    state: SessionState,
    last_status: Option<u16>,
    last_id: Option<String>,
}

impl StepTracker {
    pub(crate) fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            state: SessionState::Init,
            last_status: None,
            last_id: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn last_status(&self) -> Option<u16> {
        self.last_status
    }

    pub(crate) fn last_id(&self) -> Option<&str> {
        self.last_id.as_deref()
    }

    pub(crate) fn ensure_can_advance(&self) -> RelayResult<()> {
        match self.state {
            SessionState::Streaming | SessionState::Done | SessionState::Failed => {
                Err(RelayError::InvalidTransition { from: self.state })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn record_status(&mut self, status: u16) {
        self.last_status = Some(status);
    }

    pub(crate) fn complete(
        &mut self,
        step: HandshakeStep,
        next: SessionState,
        id: Option<String>,
    ) -> SessionState {
        tracing::info!(
            backend = %self.backend,
            %step,
            status = ?self.last_status,
            id = id.as_deref().unwrap_or("-"),
            "handshake step ok"
        );
        if id.is_some() {
            self.last_id = id;
        }
        self.state = next;
        next
    }

    pub(crate) fn fail(
        &mut self,
        step: HandshakeStep,
        status: Option<u16>,
        detail: impl Into<String>,
    ) -> RelayError {
        let detail = detail.into();
        if status.is_some() {
            self.last_status = status;
        }
        tracing::warn!(
            backend = %self.backend,
            %step,
            status = ?status,
            detail = %detail,
            "handshake step failed"
        );
        self.state = SessionState::Failed;
        RelayError::handshake(self.backend, step, status, detail)
    }

    pub(crate) fn fail_network(&mut self, step: HandshakeStep, err: reqwest::Error) -> RelayError {
        tracing::warn!(backend = %self.backend, %step, error = %err, "handshake request failed");
        self.state = SessionState::Failed;
        RelayError::Network(err)
    }

    pub(crate) fn finish(&mut self) {
        if self.state == SessionState::Streaming {
            self.state = SessionState::Done;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_rejects_advance_after_failure() {
        let mut tracker = StepTracker::new(BackendKind::HuggingChat);
        assert!(tracker.ensure_can_advance().is_ok());

        let err = tracker.fail(HandshakeStep::Settings, Some(500), "boom");
        assert!(matches!(err, RelayError::HandshakeFailed { .. }));
        assert_eq!(tracker.state(), SessionState::Failed);
        assert_eq!(tracker.last_status(), Some(500));
        assert!(matches!(
            tracker.ensure_can_advance(),
            Err(RelayError::InvalidTransition {
                from: SessionState::Failed
            })
        ));
    }

    #[test]
    fn test_tracker_keeps_last_id() {
        let mut tracker = StepTracker::new(BackendKind::AnonChat);
        tracker.record_status(200);
        tracker.complete(
            HandshakeStep::Requirements,
            SessionState::Authenticated,
            Some("device".to_string()),
        );
        tracker.complete(HandshakeStep::Prepare, SessionState::MessageSlotReady, None);
        assert_eq!(tracker.last_id(), Some("device"));
        assert_eq!(tracker.state(), SessionState::MessageSlotReady);
    }

    #[test]
    fn test_finish_only_from_streaming() {
        let mut tracker = StepTracker::new(BackendKind::Inference);
        tracker.finish();
        assert_eq!(tracker.state(), SessionState::Init);

        tracker.complete(HandshakeStep::Stream, SessionState::Streaming, None);
        tracker.finish();
        assert_eq!(tracker.state(), SessionState::Done);
        assert!(tracker.state().is_terminal());
    }

    #[test]
    fn test_step_names() {
        assert_eq!(HandshakeStep::MessageSlot.to_string(), "message_slot");
        assert_eq!(HandshakeStep::Requirements.to_string(), "requirements");
    }
}
