//! Chat turn types as received from clients

use serde::{Deserialize, Serialize};
use std::fmt;

/// Role of a chat participant.
///
/// Anything other than `system`, `user` or `assistant` is kept verbatim in
/// [`Role::Other`] so it can be echoed back by lossy templates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    User,
    Assistant,
    Other(String),
}

/// Template-level grouping of roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCategory {
    /// System, user, and any unrecognized role
    Instruction,
    /// Assistant
    Answer,
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other(name) => name,
        }
    }

    /// Unknown roles are instruction-like, never answer-like.
    pub fn category(&self) -> RoleCategory {
        match self {
            Self::Assistant => RoleCategory::Answer,
            Self::System | Self::User | Self::Other(_) => RoleCategory::Instruction,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl From<String> for Role {
    fn from(value: String) -> Self {
        match value.as_str() {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::Other(value),
        }
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self::from(value.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single role-tagged turn of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn new(role: impl Into<Role>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn category(&self) -> RoleCategory {
        self.role.category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_roundtrips_through_strings() {
        let turn: ChatTurn =
            serde_json::from_str(r#"{"role":"assistant","content":"hello"}"#).unwrap();
        assert_eq!(turn.role, Role::Assistant);

        let json = serde_json::to_string(&ChatTurn::system("be brief")).unwrap();
        assert_eq!(json, r#"{"role":"system","content":"be brief"}"#);
    }

    #[test]
    fn test_unknown_role_is_kept_verbatim() {
        let turn: ChatTurn = serde_json::from_str(r#"{"role":"bot","content":"x"}"#).unwrap();
        assert_eq!(turn.role, Role::Other("bot".to_string()));
        assert_eq!(turn.role.as_str(), "bot");
        assert!(!turn.role.is_known());

        let json = serde_json::to_string(&turn).unwrap();
        assert!(json.contains(r#""role":"bot""#));
    }

    #[test]
    fn test_unknown_role_is_instruction_like() {
        assert_eq!(Role::from("tool").category(), RoleCategory::Instruction);
        assert_eq!(Role::System.category(), RoleCategory::Instruction);
        assert_eq!(Role::User.category(), RoleCategory::Instruction);
        assert_eq!(Role::Assistant.category(), RoleCategory::Answer);
    }
}
