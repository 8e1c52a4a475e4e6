//! Canonical stream events

use serde::{Deserialize, Serialize};

/// Failure kinds that can appear inside a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A stream line could not be parsed
    UpstreamProtocol,
    /// The body closed or failed before a terminator was seen
    UpstreamDisconnected,
    /// The caller cancelled the request
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpstreamProtocol => "upstream_protocol",
            Self::UpstreamDisconnected => "upstream_disconnected",
            Self::Cancelled => "cancelled",
        }
    }
}

/// One backend-independent increment of a streamed answer.
///
/// A well-formed sequence starts with [`CanonicalEvent::RoleAnnounce`] and
/// ends with exactly one terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    RoleAnnounce,
    ContentDelta { text: String },
    Finished,
    Error { kind: ErrorKind, detail: String },
}

impl CanonicalEvent {
    pub fn delta(text: impl Into<String>) -> Self {
        Self::ContentDelta { text: text.into() }
    }

    pub fn error(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Error {
            kind,
            detail: detail.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Error { .. })
    }

    pub fn as_delta(&self) -> Option<&str> {
        match self {
            Self::ContentDelta { text } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_events() {
        assert!(CanonicalEvent::Finished.is_terminal());
        assert!(CanonicalEvent::error(ErrorKind::Cancelled, "client gone").is_terminal());
        assert!(!CanonicalEvent::RoleAnnounce.is_terminal());
        assert!(!CanonicalEvent::delta("x").is_terminal());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_string(&CanonicalEvent::delta("hi")).unwrap();
        assert_eq!(json, r#"{"type":"content_delta","text":"hi"}"#);

        let event: CanonicalEvent = serde_json::from_str(
            r#"{"type":"error","kind":"upstream_disconnected","detail":"eof"}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            CanonicalEvent::error(ErrorKind::UpstreamDisconnected, "eof")
        );
    }
}
