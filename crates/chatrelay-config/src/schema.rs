use chatrelay_protocol::ModelProfile;
use chatrelay_telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Environment variables consulted, in order, when no proxy is configured
pub const PROXY_ENV_VARS: &[&str] = &[
    "https_proxy",
    "HTTPS_PROXY",
    "http_proxy",
    "HTTP_PROXY",
    "all_proxy",
    "ALL_PROXY",
];

/// Main gateway configuration
///
/// Configuration is loaded from (in priority order):
/// 1. `chatrelay.jsonc` - JSON with comments
/// 2. `chatrelay.json` - Standard JSON
/// 3. `chatrelay.yml` / `chatrelay.yaml` - YAML format
///
/// Also checks hidden variants (`.chatrelay.*`) and `~/.config/chatrelay/`.
/// Every field has a default, so an empty file is a valid configuration.
///
/// # Example
///
/// ```yaml
/// default_model: mixtral-8x7b
/// proxy: http://127.0.0.1:7890
/// handshake_timeout_secs: 10
/// tokenizer_dir: /var/lib/chatrelay/tokenizers
/// endpoints:
///   inference: https://api-inference.huggingface.co
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Public model id used when a request names an unknown model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Outbound proxy for every upstream call
    #[serde(default)]
    pub proxy: Option<String>,

    /// Per-step timeout for handshake requests (default: 10)
    #[serde(default = "default_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Connect timeout for the streaming request; the body read itself is unbounded
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Bearer credentials must start with this prefix (default: `hf_`)
    #[serde(default = "default_credential_prefix")]
    pub credential_prefix: String,

    /// Environment variable read when the caller supplies no credential
    #[serde(default = "default_credential_env")]
    pub credential_env: String,

    /// Directory holding `<upstream-name>/tokenizer.json` files
    #[serde(default)]
    pub tokenizer_dir: Option<PathBuf>,

    #[serde(default)]
    pub endpoints: EndpointSettings,

    /// Model table; the built-in table is used when empty
    #[serde(default)]
    pub models: Vec<ModelProfile>,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            default_model: default_model(),
            proxy: None,
            handshake_timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            credential_prefix: default_credential_prefix(),
            credential_env: default_credential_env(),
            tokenizer_dir: None,
            endpoints: EndpointSettings::default(),
            models: Vec::new(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Configured proxy, or the first non-empty proxy environment variable
    pub fn resolve_proxy(&self) -> Option<String> {
        if let Some(proxy) = self.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
            return Some(proxy.to_string());
        }

        PROXY_ENV_VARS.iter().find_map(|name| {
            std::env::var(name)
                .ok()
                .filter(|value| !value.trim().is_empty())
        })
    }
}

fn default_model() -> String {
    "mixtral-8x7b".to_string()
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_credential_prefix() -> String {
    "hf_".to_string()
}

fn default_credential_env() -> String {
    "HF_TOKEN".to_string()
}

// ============================================================================
// Upstream endpoints
// ============================================================================

/// Base URLs of the three upstream back-ends
///
/// # Example
///
/// ```yaml
/// endpoints:
///   inference: https://api-inference.huggingface.co
///   huggingchat: https://huggingface.co
///   anon_chat: https://chat.openai.com/backend-anon
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSettings {
    #[serde(default = "default_inference_endpoint")]
    pub inference: String,

    #[serde(default = "default_huggingchat_endpoint")]
    pub huggingchat: String,

    #[serde(default = "default_anon_chat_endpoint")]
    pub anon_chat: String,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            inference: default_inference_endpoint(),
            huggingchat: default_huggingchat_endpoint(),
            anon_chat: default_anon_chat_endpoint(),
        }
    }
}

impl EndpointSettings {
    /// Point every back-end at one base URL (mock servers)
    pub fn all(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            inference: base.clone(),
            huggingchat: base.clone(),
            anon_chat: base,
        }
    }
}

fn default_inference_endpoint() -> String {
    "https://api-inference.huggingface.co".to_string()
}

fn default_huggingchat_endpoint() -> String {
    "https://huggingface.co".to_string()
}

fn default_anon_chat_endpoint() -> String {
    "https://chat.openai.com/backend-anon".to_string()
}
