//! Model registry

use chatrelay_protocol::{
    BackendKind, ModelCard, ModelProfile, TemplateFamily, TokenizerKind, MODEL_CARD_CREATED,
};
use std::collections::HashMap;

use crate::error::{RelayError, RelayResult};

pub const DEFAULT_MODEL: &str = "mixtral-8x7b";

/// Profiles shipped with the relay, used when configuration lists none
pub fn builtin_profiles() -> Vec<ModelProfile> {
    vec![
        ModelProfile::new(
            "mixtral-8x7b",
            "mistralai/Mixtral-8x7B-Instruct-v0.1",
            TemplateFamily::BracketInstruction,
            BackendKind::Inference,
            32768,
        )
        .with_stop_marker("</s>"),
        ModelProfile::new(
            "nous-mixtral-8x7b",
            "NousResearch/Nous-Hermes-2-Mixtral-8x7B-DPO",
            TemplateFamily::ChatMl,
            BackendKind::Inference,
            32768,
        )
        .with_stop_marker("<|im_end|>"),
        ModelProfile::new(
            "mistral-7b",
            "mistralai/Mistral-7B-Instruct-v0.2",
            TemplateFamily::BracketInstruction,
            BackendKind::Inference,
            32768,
        )
        .with_stop_marker("</s>"),
        ModelProfile::new(
            "openchat-3.5",
            "openchat/openchat-3.5-0106",
            TemplateFamily::NamedTurn,
            BackendKind::Inference,
            8192,
        )
        .with_stop_marker("<|end_of_turn|>"),
        ModelProfile::new(
            "gemma-7b",
            "google/gemma-7b-it",
            TemplateFamily::Gemma,
            BackendKind::Inference,
            8192,
        )
        .with_stop_marker("<eos>"),
        ModelProfile::new(
            "llama3-70b",
            "meta-llama/Meta-Llama-3-70B-Instruct",
            TemplateFamily::RoleTagged,
            BackendKind::HuggingChat,
            8192,
        ),
        ModelProfile::new(
            "command-r-plus",
            "CohereForAI/c4ai-command-r-plus",
            TemplateFamily::RoleTagged,
            BackendKind::HuggingChat,
            32768,
        ),
        ModelProfile::new(
            "gpt-3.5-turbo",
            "text-davinci-002-render-sha",
            TemplateFamily::RoleTagged,
            BackendKind::AnonChat,
            8192,
        )
        .with_tokenizer(TokenizerKind::Cl100kBase),
    ]
}

/// Read-only lookup from public model id to profile.
///
/// Unknown ids resolve to the default profile; that is not an error.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    profiles: Vec<ModelProfile>,
    index: HashMap<String, usize>,
    default_index: usize,
}

impl ModelRegistry {
    pub fn new(profiles: Vec<ModelProfile>, default_model: &str) -> RelayResult<Self> {
        if profiles.is_empty() {
            return Err(RelayError::Configuration(
                "model registry needs at least one profile".to_string(),
            ));
        }

        let mut index = HashMap::with_capacity(profiles.len());
        for (i, profile) in profiles.iter().enumerate() {
            if index.insert(profile.public_id.clone(), i).is_some() {
                return Err(RelayError::Configuration(format!(
                    "duplicate model id: {}",
                    profile.public_id
                )));
            }
        }

        let default_index = *index.get(default_model).ok_or_else(|| {
            RelayError::Configuration(format!("default model {} is not registered", default_model))
        })?;

        Ok(Self {
            profiles,
            index,
            default_index,
        })
    }

    /// Built-in table with `mixtral-8x7b` as the default
    pub fn builtin() -> Self {
        let profiles = builtin_profiles();
        let index: HashMap<String, usize> = profiles
            .iter()
            .enumerate()
            .map(|(i, p)| (p.public_id.clone(), i))
            .collect();
        let default_index = index.get(DEFAULT_MODEL).copied().unwrap_or(0);

        Self {
            profiles,
            index,
            default_index,
        }
    }

    /// Registry described by a gateway configuration
    pub fn from_config(config: &chatrelay_config::GatewayConfig) -> RelayResult<Self> {
        if config.models.is_empty() {
            Self::new(builtin_profiles(), &config.default_model)
        } else {
            Self::new(config.models.clone(), &config.default_model)
        }
    }

    pub fn resolve(&self, public_id: &str) -> &ModelProfile {
        match self.index.get(public_id) {
            Some(&i) => &self.profiles[i],
            None => {
                let fallback = self.default_profile();
                tracing::debug!(
                    requested = public_id,
                    fallback = %fallback.public_id,
                    "unknown model id, using default"
                );
                fallback
            }
        }
    }

    pub fn get(&self, public_id: &str) -> Option<&ModelProfile> {
        self.index.get(public_id).map(|&i| &self.profiles[i])
    }

    pub fn default_profile(&self) -> &ModelProfile {
        &self.profiles[self.default_index]
    }

    pub fn profiles(&self) -> &[ModelProfile] {
        &self.profiles
    }

    /// Entries of the OpenAI-style `/models` listing
    pub fn model_cards(&self) -> Vec<ModelCard> {
        self.profiles
            .iter()
            .map(|profile| ModelCard {
                id: profile.public_id.clone(),
                description: format!(
                    "[{}]: https://huggingface.co/{}",
                    profile.upstream_name, profile.upstream_name
                ),
                object: "model".to_string(),
                created: MODEL_CARD_CREATED,
                owned_by: profile.owner().to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_model_resolves_to_default() {
        let registry = ModelRegistry::builtin();
        let profile = registry.resolve("unknown-model-xyz");
        assert_eq!(profile.public_id, DEFAULT_MODEL);
        assert_eq!(profile.upstream_name, "mistralai/Mixtral-8x7B-Instruct-v0.1");
    }

    #[test]
    fn test_builtin_lookup() {
        let registry = ModelRegistry::builtin();

        let gemma = registry.resolve("gemma-7b");
        assert_eq!(gemma.template, TemplateFamily::Gemma);
        assert_eq!(gemma.stop_marker.as_deref(), Some("<eos>"));
        assert_eq!(gemma.token_limit, 8192);
        assert_eq!(gemma.reserved_tokens, 20);

        let anon = registry.resolve("gpt-3.5-turbo");
        assert_eq!(anon.backend, BackendKind::AnonChat);
        assert_eq!(anon.tokenizer, TokenizerKind::Cl100kBase);
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut profiles = builtin_profiles();
        profiles.push(profiles[0].clone());
        assert!(matches!(
            ModelRegistry::new(profiles, DEFAULT_MODEL),
            Err(RelayError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_default_rejected() {
        assert!(ModelRegistry::new(builtin_profiles(), "does-not-exist").is_err());
        assert!(ModelRegistry::new(Vec::new(), DEFAULT_MODEL).is_err());
    }

    #[test]
    fn test_model_cards() {
        let registry = ModelRegistry::builtin();
        let cards = registry.model_cards();
        assert_eq!(cards.len(), registry.profiles().len());

        let mixtral = &cards[0];
        assert_eq!(mixtral.id, "mixtral-8x7b");
        assert_eq!(
            mixtral.description,
            "[mistralai/Mixtral-8x7B-Instruct-v0.1]: https://huggingface.co/mistralai/Mixtral-8x7B-Instruct-v0.1"
        );
        assert_eq!(mixtral.object, "model");
        assert_eq!(mixtral.created, 1_700_000_000);
        assert_eq!(mixtral.owned_by, "mistralai");
    }
}
