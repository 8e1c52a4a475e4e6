//! Model profile types

use serde::{Deserialize, Serialize};

/// Reserved generation margin used when a profile does not set one
pub const DEFAULT_RESERVED_TOKENS: u32 = 20;

/// Prompt rendering convention shared by a group of upstream models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateFamily {
    /// `<s> [INST] ... [/INST] ... </s>` (Mistral / Mixtral)
    BracketInstruction,
    /// `<|im_start|>role ... <|im_end|>` turn markers
    ChatMl,
    /// `<start_of_turn>role ... <end_of_turn>` turn markers
    Gemma,
    /// `GPT4 Correct User:` / `GPT4 Correct Assistant:` named turns
    NamedTurn,
    /// `` `role`: `` blocks; not invertible
    Generic,
    /// Upstream accepts role-tagged turns, nothing is rendered
    RoleTagged,
}

impl TemplateFamily {
    /// Whether the composed prompt for this family is a structured turn list
    pub fn is_structured(&self) -> bool {
        matches!(self, Self::RoleTagged)
    }
}

/// Upstream back-end kind; each has its own handshake and wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Managed inference endpoint, one stateless streaming POST
    Inference,
    /// Browser-session chat service with cookie + conversation handshake
    HuggingChat,
    /// Anonymous web chat guarded by a proof-of-work challenge
    AnonChat,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inference => "inference",
            Self::HuggingChat => "huggingchat",
            Self::AnonChat => "anon_chat",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vocabulary used to count prompt tokens
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// `tokenizer.json` of the upstream Hugging Face repository
    #[default]
    HuggingFace,
    /// OpenAI `cl100k_base` BPE
    Cl100kBase,
}

/// Everything the relay needs to know about one public model id.
///
/// Profiles are loaded once at startup and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    /// Id clients send in the `model` field
    pub public_id: String,

    /// Full upstream model name (also the tokenizer key)
    pub upstream_name: String,

    pub template: TemplateFamily,

    pub backend: BackendKind,

    /// Token text that ends generation on token-delta streams
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_marker: Option<String>,

    /// Context window of the upstream model
    pub token_limit: u32,

    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: u32,

    /// Multiplier applied to counted prompt tokens before budgeting
    #[serde(default = "default_token_scale")]
    pub token_scale: f64,

    #[serde(default)]
    pub tokenizer: TokenizerKind,
}

fn default_reserved_tokens() -> u32 {
    DEFAULT_RESERVED_TOKENS
}

fn default_token_scale() -> f64 {
    1.0
}

impl ModelProfile {
    pub fn new(
        public_id: impl Into<String>,
        upstream_name: impl Into<String>,
        template: TemplateFamily,
        backend: BackendKind,
        token_limit: u32,
    ) -> Self {
        Self {
            public_id: public_id.into(),
            upstream_name: upstream_name.into(),
            template,
            backend,
            stop_marker: None,
            token_limit,
            reserved_tokens: DEFAULT_RESERVED_TOKENS,
            token_scale: 1.0,
            tokenizer: TokenizerKind::HuggingFace,
        }
    }

    pub fn with_stop_marker(mut self, marker: impl Into<String>) -> Self {
        self.stop_marker = Some(marker.into());
        self
    }

    pub fn with_reserved_tokens(mut self, reserved: u32) -> Self {
        self.reserved_tokens = reserved;
        self
    }

    pub fn with_token_scale(mut self, scale: f64) -> Self {
        self.token_scale = scale;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: TokenizerKind) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Organisation part of the upstream name (`mistralai/...` -> `mistralai`)
    pub fn owner(&self) -> &str {
        self.upstream_name
            .split_once('/')
            .map(|(owner, _)| owner)
            .unwrap_or(self.backend.as_str())
    }
}
