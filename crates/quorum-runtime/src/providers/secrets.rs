//! API keys for remote providers.
//!
//! A key lives in a [`SecretString`] and only leaves it when a request
//! header is built. Blank values count as missing.

use secrecy::{ExposeSecret, SecretString};
use serde_json::Value as JsonValue;
use std::fmt;

use super::ProviderError;

/// Where an [`ApiKey`] came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyOrigin {
    /// The provider's JSON config block.
    Inline,
    /// The named environment variable.
    Env(String),
    /// Handed over directly by the caller.
    Explicit,
}

impl fmt::Display for KeyOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyOrigin::Inline => f.write_str("inline config"),
            KeyOrigin::Env(var) => write!(f, "${}", var),
            KeyOrigin::Explicit => f.write_str("caller"),
        }
    }
}

pub struct ApiKey {
    secret: SecretString,
    origin: KeyOrigin,
    provider: &'static str,
}

impl ApiKey {
    pub fn new(provider: &'static str, key: impl Into<String>) -> Self {
        Self::with_origin(provider, key.into(), KeyOrigin::Explicit)
    }

    fn with_origin(provider: &'static str, key: String, origin: KeyOrigin) -> Self {
        Self {
            secret: SecretString::from(key),
            origin,
            provider,
        }
    }

    /// Read the key from `var`.
    pub fn from_env(provider: &'static str, var: &str) -> Result<Self, ProviderError> {
        Self::lookup(provider, None, var).ok_or_else(|| {
            ProviderError::NotConfigured(format!("{} needs an API key in ${}", provider, var))
        })
    }

    /// Prefer `config[field]`, then `var`.
    pub fn resolve(
        provider: &'static str,
        config: &JsonValue,
        field: &str,
        var: &str,
    ) -> Result<Self, ProviderError> {
        Self::lookup(provider, config[field].as_str(), var).ok_or_else(|| {
            ProviderError::NotConfigured(format!(
                "{} needs an API key: set `{}` in its config or ${}",
                provider, field, var
            ))
        })
    }

    fn lookup(provider: &'static str, inline: Option<&str>, var: &str) -> Option<Self> {
        if let Some(key) = inline.filter(|k| !k.trim().is_empty()) {
            return Some(Self::with_origin(provider, key.to_string(), KeyOrigin::Inline));
        }
        std::env::var(var)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .map(|key| Self::with_origin(provider, key, KeyOrigin::Env(var.to_string())))
    }

    /// The raw key, for the authorization header only.
    pub fn expose(&self) -> &str {
        self.secret.expose_secret()
    }

    pub fn origin(&self) -> &KeyOrigin {
        &self.origin
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("provider", &self.provider)
            .field("origin", &self.origin)
            .field("secret", &"***")
            .finish()
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key (from {})", self.provider, self.origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_never_formatted() {
        let key = ApiKey::new("OpenRouter", "sk-or-v1-abcdef");

        assert!(!format!("{:?}", key).contains("abcdef"));
        assert_eq!(key.to_string(), "OpenRouter key (from caller)");
        assert_eq!(key.expose(), "sk-or-v1-abcdef");
    }

    #[test]
    fn test_inline_key_wins() {
        std::env::set_var("QUORUM_TEST_KEY_PRIORITY", "from-env");
        let key = ApiKey::resolve(
            "OpenRouter",
            &json!({"api_key": "from-config"}),
            "api_key",
            "QUORUM_TEST_KEY_PRIORITY",
        )
        .unwrap();
        std::env::remove_var("QUORUM_TEST_KEY_PRIORITY");

        assert_eq!(key.expose(), "from-config");
        assert_eq!(key.origin(), &KeyOrigin::Inline);
    }

    #[test]
    fn test_blank_inline_key_falls_back_to_env() {
        std::env::set_var("QUORUM_TEST_KEY_FALLBACK", "from-env");
        let key = ApiKey::resolve(
            "OpenRouter",
            &json!({"api_key": "  "}),
            "api_key",
            "QUORUM_TEST_KEY_FALLBACK",
        )
        .unwrap();
        std::env::remove_var("QUORUM_TEST_KEY_FALLBACK");

        assert_eq!(key.expose(), "from-env");
        assert_eq!(key.origin(), &KeyOrigin::Env("QUORUM_TEST_KEY_FALLBACK".to_string()));
        assert!(key.to_string().contains("$QUORUM_TEST_KEY_FALLBACK"));
    }

    #[test]
    fn test_missing_key_names_both_places() {
        let err = ApiKey::resolve("OpenRouter", &json!({}), "api_key", "QUORUM_TEST_KEY_ABSENT")
            .unwrap_err()
            .to_string();
        assert!(err.contains("`api_key`"));
        assert!(err.contains("$QUORUM_TEST_KEY_ABSENT"));

        let err = ApiKey::from_env("OpenRouter", "QUORUM_TEST_KEY_ABSENT").unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
    }
}
