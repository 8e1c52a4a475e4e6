//! Caller-supplied upstream credential

use chatrelay_config::GatewayConfig;
use chatrelay_telemetry::mask_secret;
use secrecy::{ExposeSecret, SecretString};

/// Bearer credential forwarded to the inference endpoint.
///
/// Only a prefix check is performed; anything else is the upstream's job.
pub struct Credential(SecretString);

impl Credential {
    /// Accept `raw` (optionally `Bearer `-prefixed) when it starts with `prefix`
    pub fn from_bearer(raw: &str, prefix: &str) -> Option<Self> {
        let value = raw.trim();
        let value = value
            .strip_prefix("Bearer ")
            .or_else(|| value.strip_prefix("bearer "))
            .unwrap_or(value)
            .trim();

        if value.is_empty() {
            return None;
        }
        if !value.starts_with(prefix) {
            tracing::warn!(
                credential = %mask_secret(value),
                prefix,
                "ignoring credential with unexpected prefix"
            );
            return None;
        }

        Some(Self(SecretString::from(value)))
    }

    /// Credential from the environment variable `var`
    pub fn from_env(var: &str, prefix: &str) -> Option<Self> {
        let value = std::env::var(var).ok()?;
        Self::from_bearer(&value, prefix)
    }

    /// Caller's bearer value, else the configured environment variable
    pub fn resolve(bearer: Option<&str>, config: &GatewayConfig) -> Option<Self> {
        match bearer {
            Some(raw) if !raw.trim().is_empty() => {
                Self::from_bearer(raw, &config.credential_prefix)
            }
            _ => Self::from_env(&config.credential_env, &config.credential_prefix),
        }
    }

    pub fn secret(&self) -> &SecretString {
        &self.0
    }

    pub fn masked(&self) -> String {
        mask_secret(self.0.expose_secret())
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Credential").field(&self.masked()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_with_prefix_is_accepted() {
        let credential = Credential::from_bearer("Bearer hf_abcdefgh1234", "hf_").unwrap();
        assert_eq!(credential.secret().expose_secret(), "hf_abcdefgh1234");
        assert_eq!(credential.masked(), "hf_********1234");
    }

    #[test]
    fn test_unexpected_prefix_is_dropped() {
        assert!(Credential::from_bearer("sk-abcdefgh1234", "hf_").is_none());
        assert!(Credential::from_bearer("Bearer ", "hf_").is_none());
    }

    #[test]
    fn test_debug_never_prints_secret() {
        let credential = Credential::from_bearer("hf_abcdefgh1234", "hf_").unwrap();
        let debug = format!("{:?}", credential);
        assert!(!debug.contains("abcdefgh"));
    }

    #[test]
    fn test_resolve_falls_back_to_env() {
        let config = GatewayConfig {
            credential_env: "CHATRELAY_TEST_CREDENTIAL_FALLBACK".to_string(),
            ..Default::default()
        };
        std::env::set_var("CHATRELAY_TEST_CREDENTIAL_FALLBACK", "hf_fromenvironment");

        let credential = Credential::resolve(None, &config).unwrap();
        assert_eq!(credential.secret().expose_secret(), "hf_fromenvironment");

        let explicit = Credential::resolve(Some("hf_explicitvalue"), &config).unwrap();
        assert_eq!(explicit.secret().expose_secret(), "hf_explicitvalue");

        std::env::remove_var("CHATRELAY_TEST_CREDENTIAL_FALLBACK");
    }
}
