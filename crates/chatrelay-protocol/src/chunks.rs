//! Outward chat-completion shapes (OpenAI-compatible)

use serde::{Deserialize, Serialize};

use crate::{CanonicalEvent, Role};

pub const COMPLETION_ID: &str = "chatcmpl-chatrelay";

/// Creation timestamp advertised for every model card
pub const MODEL_CARD_CREATED: i64 = 1_700_000_000;

/// Partial message carried by a streamed chunk
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// `chat.completion.chunk` object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatCompletionChunk {
    /// Wrap one canonical event into the outward chunk shape
    pub fn from_event(event: &CanonicalEvent, model: &str) -> Self {
        let (delta, finish_reason) = match event {
            CanonicalEvent::RoleAnnounce => (
                ChunkDelta {
                    role: Some(Role::Assistant),
                    content: None,
                },
                None,
            ),
            CanonicalEvent::ContentDelta { text } => (
                ChunkDelta {
                    role: None,
                    content: Some(text.clone()),
                },
                None,
            ),
            CanonicalEvent::Finished => (ChunkDelta::default(), Some("stop".to_string())),
            CanonicalEvent::Error { .. } => (ChunkDelta::default(), Some("error".to_string())),
        };

        Self {
            id: COMPLETION_ID.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

/// Non-streamed `chat.completion` object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
}

impl ChatCompletion {
    pub fn assistant(model: &str, content: impl Into<String>) -> Self {
        Self {
            id: COMPLETION_ID.to_string(),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: Role::Assistant,
                    content: content.into(),
                },
                finish_reason: Some("stop".to_string()),
            }],
        }
    }

    pub fn content(&self) -> Option<&str> {
        self.choices.first().map(|c| c.message.content.as_str())
    }
}

/// Entry of the `/models` listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCard {
    pub id: String,
    pub description: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}
