//! Token counting and generation-length budgeting

use chatrelay_protocol::{ModelProfile, TokenizerKind};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::composer::ComposedPrompt;
use crate::error::{RelayError, RelayResult};

pub const CL100K_BASE: &str = "cl100k_base";

/// Access-gated upstream tokenizers and the public repositories that publish
/// the same vocabulary.
pub const GATED_TOKENIZER_STAND_INS: &[(&str, &str)] = &[
    (
        "meta-llama/Meta-Llama-3-70B-Instruct",
        "NousResearch/Meta-Llama-3-70B",
    ),
    ("google/gemma-7b-it", "unsloth/gemma-7b"),
    (
        "mistralai/Mistral-7B-Instruct-v0.2",
        "dfurman/Mistral-7B-Instruct-v0.2",
    ),
    (
        "mistralai/Mixtral-8x7B-Instruct-v0.1",
        "dfurman/Mixtral-8x7B-Instruct-v0.1",
    ),
];

/// Counts tokens of one vocabulary
pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> RelayResult<usize>;
}

/// Hugging Face `tokenizer.json` vocabulary
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

impl HfTokenCounter {
    pub fn from_file(path: &Path) -> RelayResult<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            RelayError::Tokenizer(format!(
                "Failed to load tokenizer from {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Self { tokenizer })
    }
}

impl TokenCounter for HfTokenCounter {
    fn count_tokens(&self, text: &str) -> RelayResult<usize> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| RelayError::Tokenizer(format!("Tokenization failed: {}", e)))?;
        Ok(encoding.get_ids().len())
    }
}

/// OpenAI `cl100k_base` BPE
pub struct Cl100kCounter {
    bpe: &'static tiktoken_rs::CoreBPE,
}

impl Cl100kCounter {
    pub fn new() -> Self {
        Self {
            bpe: tiktoken_rs::cl100k_base_singleton(),
        }
    }
}

impl Default for Cl100kCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for Cl100kCounter {
    fn count_tokens(&self, text: &str) -> RelayResult<usize> {
        Ok(self.bpe.encode_with_special_tokens(text).len())
    }
}

/// One token per whitespace-separated word. For tests and offline runs only;
/// real limits must be checked against the model's vocabulary.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhitespaceCounter;

impl TokenCounter for WhitespaceCounter {
    fn count_tokens(&self, text: &str) -> RelayResult<usize> {
        Ok(text.split_whitespace().count())
    }
}

/// Tokenizer key used for a profile: `cl100k_base`, the gated stand-in, or
/// the upstream name itself.
pub fn tokenizer_key(profile: &ModelProfile) -> &str {
    if profile.tokenizer == TokenizerKind::Cl100kBase {
        return CL100K_BASE;
    }

    GATED_TOKENIZER_STAND_INS
        .iter()
        .find(|(gated, _)| *gated == profile.upstream_name)
        .map(|(_, stand_in)| *stand_in)
        .unwrap_or(profile.upstream_name.as_str())
}

/// Read-only tokenizer set, loaded once at startup and shared across requests
#[derive(Default, Clone)]
pub struct TokenizerRegistry {
    counters: HashMap<String, Arc<dyn TokenCounter>>,
}

impl std::fmt::Debug for TokenizerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.counters.keys().collect();
        keys.sort();
        f.debug_struct("TokenizerRegistry")
            .field("keys", &keys)
            .finish()
    }
}

impl TokenizerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the tokenizers needed by `profiles`.
    ///
    /// Hugging Face vocabularies are read from
    /// `<tokenizer_dir>/<key>/tokenizer.json`. Missing files are logged and
    /// skipped; requests for those models then fail before any network call.
    pub fn load(profiles: &[ModelProfile], tokenizer_dir: Option<&Path>) -> RelayResult<Self> {
        let mut registry = Self::new();

        for profile in profiles {
            let key = tokenizer_key(profile);
            if registry.contains(key) {
                continue;
            }

            if profile.tokenizer == TokenizerKind::Cl100kBase {
                registry.register(CL100K_BASE, Cl100kCounter::new());
                continue;
            }

            let Some(dir) = tokenizer_dir else {
                tracing::warn!(
                    model = %profile.public_id,
                    "no tokenizer_dir configured, token budget unavailable"
                );
                continue;
            };

            let path = dir.join(key).join("tokenizer.json");
            if !path.exists() {
                tracing::warn!(
                    model = %profile.public_id,
                    path = %path.display(),
                    "tokenizer file missing"
                );
                continue;
            }

            registry.register(key, HfTokenCounter::from_file(&path)?);
            tracing::debug!(model = %profile.public_id, key, "tokenizer loaded");
        }

        Ok(registry)
    }

    pub fn register(&mut self, key: impl Into<String>, counter: impl TokenCounter + 'static) {
        self.counters.insert(key.into(), Arc::new(counter));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.counters.contains_key(key)
    }

    pub fn counter_for(&self, profile: &ModelProfile) -> RelayResult<Arc<dyn TokenCounter>> {
        let key = tokenizer_key(profile);
        self.counters.get(key).cloned().ok_or_else(|| {
            RelayError::Tokenizer(format!(
                "no tokenizer loaded for {} (key {})",
                profile.public_id, key
            ))
        })
    }

    /// Token count of `text` in the vocabulary of `profile`'s upstream model
    pub fn encode(&self, text: &str, profile: &ModelProfile) -> RelayResult<usize> {
        self.counter_for(profile)?.count_tokens(text)
    }
}

/// Bounds generation length by the model's context window
#[derive(Debug, Clone)]
pub struct TokenBudgeter {
    tokenizers: Arc<TokenizerRegistry>,
}

impl TokenBudgeter {
    pub fn new(tokenizers: Arc<TokenizerRegistry>) -> Self {
        Self { tokenizers }
    }

    /// Scaled prompt token count. Structured prompts count each turn's content.
    pub fn count(&self, prompt: &ComposedPrompt, profile: &ModelProfile) -> RelayResult<u64> {
        let raw = match prompt {
            ComposedPrompt::Text { text, .. } => self.tokenizers.encode(text, profile)?,
            ComposedPrompt::Turns { turns, .. } => {
                let counter = self.tokenizers.counter_for(profile)?;
                let mut total = 0;
                for turn in turns {
                    total += counter.count_tokens(&turn.content)?;
                }
                total
            }
        };

        let scaled = (raw as f64 * profile.token_scale).ceil() as u64;
        tracing::debug!(model = %profile.public_id, raw, scaled, "prompt token count");
        Ok(scaled)
    }

    /// `token_limit - reserved_tokens - count`; may be negative
    pub fn remaining(&self, prompt: &ComposedPrompt, profile: &ModelProfile) -> RelayResult<i64> {
        let used = self.count(prompt, profile)?;
        Ok(headroom(profile, used))
    }

    /// Effective generation cap.
    ///
    /// `None` or a non-positive request means "as much as fits". Fails with
    /// [`RelayError::TokenLimitExceeded`] when nothing fits.
    pub fn clamp(
        &self,
        requested: Option<i64>,
        prompt: &ComposedPrompt,
        profile: &ModelProfile,
    ) -> RelayResult<u64> {
        let used = self.count(prompt, profile)?;
        let remaining = headroom(profile, used);

        if remaining <= 0 {
            return Err(RelayError::TokenLimitExceeded {
                used,
                limit: u64::from(profile.token_limit),
            });
        }

        let cap = match requested {
            Some(n) if n > 0 => n.min(remaining),
            _ => remaining,
        };
        Ok(cap as u64)
    }
}

fn headroom(profile: &ModelProfile, used: u64) -> i64 {
    i64::from(profile.token_limit) - i64::from(profile.reserved_tokens) - used as i64
}
