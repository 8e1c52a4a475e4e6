//! Shared utilities for handling upstream handshake responses

use reqwest::header::{HeaderMap, SET_COOKIE};
use serde::Deserialize;

const MAX_ERROR_DETAIL: usize = 512;

/// Value of cookie `name` from the response's `Set-Cookie` headers
pub fn extract_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| key.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Parse error message from an upstream error body.
/// Structured JSON errors are summarized, anything else is returned raw.
pub async fn parse_error_body(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(text) => summarize_error_text(&text),
        Err(_) => "Failed to read error response body".to_string(),
    }
}

fn summarize_error_text(text: &str) -> String {
    if let Ok(error) = serde_json::from_str::<ErrorResponse>(text) {
        let summary = error.to_string();
        if summary != "Unknown error" {
            return summary;
        }
    }

    let mut raw: String = text.chars().take(MAX_ERROR_DETAIL).collect();
    if raw.len() < text.len() {
        raw.push_str("...");
    }
    raw
}

/// Error shapes used by the chat back-ends
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(alias = "type")]
    error_type: Option<String>,
    #[serde(alias = "message", alias = "error", alias = "detail")]
    error_message: Option<String>,
    #[serde(alias = "code")]
    error_code: Option<String>,
}

impl std::fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::new();

        if let Some(code) = &self.error_code {
            parts.push(format!("code: {}", code));
        }
        if let Some(error_type) = &self.error_type {
            parts.push(format!("type: {}", error_type));
        }
        if let Some(message) = &self.error_message {
            parts.push(format!("message: {}", message));
        }

        if parts.is_empty() {
            write!(f, "Unknown error")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_extract_cookie_present() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("token=abc; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("hf-chat=8c1a6d2e; Path=/; HttpOnly; SameSite=None"),
        );

        assert_eq!(
            extract_cookie(&headers, "hf-chat").as_deref(),
            Some("8c1a6d2e")
        );
    }

    #[test]
    fn test_extract_cookie_missing_or_empty() {
        let mut headers = HeaderMap::new();
        assert_eq!(extract_cookie(&headers, "hf-chat"), None);

        headers.append(SET_COOKIE, HeaderValue::from_static("hf-chat=; Max-Age=0"));
        assert_eq!(extract_cookie(&headers, "hf-chat"), None);
    }

    #[test]
    fn test_error_text_summary() {
        assert_eq!(
            summarize_error_text(r#"{"message": "Model is overloaded", "code": "503"}"#),
            "code: 503, message: Model is overloaded"
        );
        assert_eq!(
            summarize_error_text(r#"{"detail": "Unusual activity"}"#),
            "message: Unusual activity"
        );
        assert_eq!(summarize_error_text("plain failure"), "plain failure");
    }

    #[test]
    fn test_error_text_is_truncated() {
        let long = "x".repeat(MAX_ERROR_DETAIL + 10);
        let summary = summarize_error_text(&long);
        assert!(summary.ends_with("..."));
        assert_eq!(summary.len(), MAX_ERROR_DETAIL + 3);
    }
}
