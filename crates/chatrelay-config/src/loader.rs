use crate::schema::GatewayConfig;
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Jsonc,
    Json,
    Yaml,
}

impl ConfigFormat {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?;

        match ext {
            "jsonc" => Some(Self::Jsonc),
            "json" => Some(Self::Json),
            "yml" | "yaml" => Some(Self::Yaml),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub config: GatewayConfig,
    pub path: PathBuf,
    pub format: ConfigFormat,
}

/// Load the configuration from `config_path`, the first discovered file, or
/// defaults when no file exists anywhere.
pub fn load_config(config_path: Option<&Path>) -> Result<GatewayConfig> {
    match config_path.map(|p| p.to_path_buf()).or_else(find_config_file) {
        Some(path) => load_config_from_file(&path).map(|r| r.config),
        None => {
            tracing::debug!("no configuration file found, using defaults");
            Ok(GatewayConfig::default())
        }
    }
}

pub fn resolve_config(config_path: Option<&Path>) -> Result<ResolvedConfig> {
    let path = config_path
        .map(|p| p.to_path_buf())
        .or_else(find_config_file)
        .ok_or_else(|| anyhow!("No configuration file found"))?;

    load_config_from_file(&path)
}

pub fn load_config_from_file(path: &Path) -> Result<ResolvedConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let format = ConfigFormat::from_path(path)
        .ok_or_else(|| anyhow!("Unknown config format for: {}", path.display()))?;

    let config = parse_config_content(&content, format)?;
    let config = expand_env_vars(config);
    validate(&config).with_context(|| format!("Invalid config file: {}", path.display()))?;

    Ok(ResolvedConfig {
        config,
        path: path.to_path_buf(),
        format,
    })
}

fn parse_config_content(content: &str, format: ConfigFormat) -> Result<GatewayConfig> {
    if content.trim().is_empty() {
        return Ok(GatewayConfig::default());
    }

    match format {
        ConfigFormat::Jsonc => json5::from_str(content).context("Failed to parse JSONC"),
        ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
        ConfigFormat::Yaml => serde_yaml_ng::from_str(content).context("Failed to parse YAML"),
    }
}

fn validate(config: &GatewayConfig) -> Result<()> {
    if config.handshake_timeout_secs == 0 {
        return Err(anyhow!("handshake_timeout_secs must be positive"));
    }

    for profile in &config.models {
        if profile.reserved_tokens >= profile.token_limit {
            return Err(anyhow!(
                "model {}: reserved_tokens ({}) must be below token_limit ({})",
                profile.public_id,
                profile.reserved_tokens,
                profile.token_limit
            ));
        }
        if !(profile.token_scale.is_finite() && profile.token_scale > 0.0) {
            return Err(anyhow!(
                "model {}: token_scale must be a positive number",
                profile.public_id
            ));
        }
    }

    if !config.models.is_empty()
        && !config
            .models
            .iter()
            .any(|p| p.public_id == config.default_model)
    {
        return Err(anyhow!(
            "default_model {} is not in the configured model table",
            config.default_model
        ));
    }

    Ok(())
}

const CONFIG_CANDIDATES: &[&str] = &[
    "chatrelay.jsonc",
    "chatrelay.json",
    "chatrelay.yml",
    "chatrelay.yaml",
    ".chatrelay.jsonc",
    ".chatrelay.json",
    ".chatrelay.yml",
    ".chatrelay.yaml",
];

pub fn find_config_file() -> Option<PathBuf> {
    for candidate in CONFIG_CANDIDATES {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Some(path);
        }
    }

    if let Ok(home) = env::var("HOME") {
        for candidate in CONFIG_CANDIDATES {
            let path = PathBuf::from(&home)
                .join(".config")
                .join("chatrelay")
                .join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
    }

    None
}

fn expand_env_vars(mut config: GatewayConfig) -> GatewayConfig {
    config.proxy = config.proxy.map(|p| expand_env_string(&p));
    config.tokenizer_dir = config
        .tokenizer_dir
        .map(|dir| PathBuf::from(expand_env_string(&dir.to_string_lossy())));
    config.endpoints.inference = expand_env_string(&config.endpoints.inference);
    config.endpoints.huggingchat = expand_env_string(&config.endpoints.huggingchat);
    config.endpoints.anon_chat = expand_env_string(&config.endpoints.anon_chat);
    config
}

fn expand_env_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
        } else {
            let mut var_name = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_alphanumeric() || c == '_' {
                    var_name.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            if var_name.is_empty() {
                result.push('$');
            } else if let Ok(value) = env::var(&var_name) {
                result.push_str(&value);
            } else {
                result.push('$');
                result.push_str(&var_name);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_expand_env_string_with_braces() {
        env::set_var("CHATRELAY_TEST_HOST", "10.0.0.2");
        let result = expand_env_string("http://${CHATRELAY_TEST_HOST}:8080");
        assert_eq!(result, "http://10.0.0.2:8080");
    }

    #[test]
    fn test_expand_env_string_without_braces() {
        env::set_var("CHATRELAY_TEST_PORT", "3128");
        let result = expand_env_string("http://proxy:$CHATRELAY_TEST_PORT/");
        assert_eq!(result, "http://proxy:3128/");
    }

    #[test]
    fn test_expand_env_string_missing_var() {
        let result = expand_env_string("prefix_${CHATRELAY_NONEXISTENT}_suffix");
        assert_eq!(result, "prefix_${CHATRELAY_NONEXISTENT}_suffix");
    }

    #[test]
    fn test_expand_env_string_lone_dollar() {
        assert_eq!(expand_env_string("cost: $ 5"), "cost: $ 5");
    }

    #[test]
    fn test_config_format_from_path() {
        assert_eq!(
            ConfigFormat::from_path(Path::new("chatrelay.jsonc")),
            Some(ConfigFormat::Jsonc)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("chatrelay.json")),
            Some(ConfigFormat::Json)
        );
        assert_eq!(
            ConfigFormat::from_path(Path::new("chatrelay.yaml")),
            Some(ConfigFormat::Yaml)
        );
        assert_eq!(ConfigFormat::from_path(Path::new("chatrelay.toml")), None);
    }

    #[test]
    fn test_load_jsonc_with_comments() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.jsonc");
        fs::write(
            &path,
            r#"{
  // upstream selection
  "default_model": "mistral-7b",
  "handshake_timeout_secs": 5 /* seconds */
}"#,
        )
        .unwrap();

        let resolved = load_config_from_file(&path).unwrap();
        assert_eq!(resolved.format, ConfigFormat::Jsonc);
        assert_eq!(resolved.config.default_model, "mistral-7b");
        assert_eq!(resolved.config.handshake_timeout_secs, 5);
    }

    #[test]
    fn test_empty_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.yml");
        fs::write(&path, "").unwrap();

        let resolved = load_config_from_file(&path).unwrap();
        assert_eq!(resolved.config.default_model, "mixtral-8x7b");
    }

    #[test]
    fn test_zero_handshake_timeout_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.json");
        fs::write(&path, r#"{"handshake_timeout_secs": 0}"#).unwrap();

        let err = load_config_from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("handshake_timeout_secs"));
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("chatrelay.toml");
        fs::write(&path, "default_model = 'x'").unwrap();

        assert!(load_config_from_file(&path).is_err());
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = load_config_from_file(Path::new("/nonexistent/chatrelay.json")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
