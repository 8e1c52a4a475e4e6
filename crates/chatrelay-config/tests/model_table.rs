//! Loading custom model tables from disk

use chatrelay_config::{load_config, load_config_from_file, ConfigFormat};
use chatrelay_protocol::{BackendKind, TemplateFamily, TokenizerKind};
use std::fs;
use tempfile::TempDir;

#[test]
fn test_yaml_model_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chatrelay.yaml");
    fs::write(
        &path,
        r#"
default_model: local-mistral
endpoints:
  inference: http://127.0.0.1:8080
models:
  - public_id: local-mistral
    upstream_name: mistralai/Mistral-7B-Instruct-v0.2
    template: bracket_instruction
    backend: inference
    stop_marker: "</s>"
    token_limit: 4096
    reserved_tokens: 64
  - public_id: anon
    upstream_name: text-davinci-002-render-sha
    template: role_tagged
    backend: anon_chat
    token_limit: 8192
    token_scale: 1.2
    tokenizer: cl100k_base
telemetry:
  level: debug
  json_output: true
"#,
    )
    .unwrap();

    let resolved = load_config_from_file(&path).unwrap();
    assert_eq!(resolved.format, ConfigFormat::Yaml);

    let config = resolved.config;
    assert_eq!(config.default_model, "local-mistral");
    assert_eq!(config.endpoints.inference, "http://127.0.0.1:8080");
    assert_eq!(config.endpoints.anon_chat, "https://chat.openai.com/backend-anon");
    assert_eq!(config.models.len(), 2);

    let mistral = &config.models[0];
    assert_eq!(mistral.template, TemplateFamily::BracketInstruction);
    assert_eq!(mistral.backend, BackendKind::Inference);
    assert_eq!(mistral.stop_marker.as_deref(), Some("</s>"));
    assert_eq!(mistral.reserved_tokens, 64);

    let anon = &config.models[1];
    assert_eq!(anon.tokenizer, TokenizerKind::Cl100kBase);
    assert_eq!(anon.reserved_tokens, 20);
    assert!((anon.token_scale - 1.2).abs() < f64::EPSILON);

    assert_eq!(config.telemetry.level, "debug");
    assert!(config.telemetry.json_output);
}

#[test]
fn test_default_model_must_exist_in_custom_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chatrelay.json");
    fs::write(
        &path,
        r#"{
  "default_model": "missing",
  "models": [{
    "public_id": "gemma",
    "upstream_name": "google/gemma-7b-it",
    "template": "gemma",
    "backend": "inference",
    "token_limit": 8192
  }]
}"#,
    )
    .unwrap();

    let err = load_config_from_file(&path).unwrap_err();
    assert!(format!("{:#}", err).contains("default_model missing"));
}

#[test]
fn test_reserved_tokens_must_fit_in_limit() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chatrelay.json");
    fs::write(
        &path,
        r#"{
  "default_model": "tiny",
  "models": [{
    "public_id": "tiny",
    "upstream_name": "org/tiny",
    "template": "generic",
    "backend": "inference",
    "token_limit": 16,
    "reserved_tokens": 16
  }]
}"#,
    )
    .unwrap();

    assert!(load_config_from_file(&path).is_err());
}

#[test]
fn test_proxy_and_tokenizer_dir_expand_env() {
    std::env::set_var("CHATRELAY_IT_PROXY_PORT", "7890");
    std::env::set_var("CHATRELAY_IT_DATA", "/srv/relay");

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("chatrelay.json");
    fs::write(
        &path,
        r#"{
  "proxy": "http://127.0.0.1:${CHATRELAY_IT_PROXY_PORT}",
  "tokenizer_dir": "$CHATRELAY_IT_DATA/tokenizers"
}"#,
    )
    .unwrap();

    let config = load_config(Some(&path)).unwrap();
    assert_eq!(config.proxy.as_deref(), Some("http://127.0.0.1:7890"));
    assert_eq!(config.resolve_proxy().as_deref(), Some("http://127.0.0.1:7890"));
    assert_eq!(
        config.tokenizer_dir.as_deref(),
        Some(std::path::Path::new("/srv/relay/tokenizers"))
    );
}
