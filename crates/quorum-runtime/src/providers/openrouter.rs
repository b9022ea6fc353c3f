//! OpenRouter model client.
//!
//! Asks an OpenRouter-compatible chat completion endpoint for a directional
//! forecast over the unit's features. One client serves every model in a
//! rotation pool: the model id is taken from the endpoint being called.
//!
//! Per-attempt timeouts are applied by the caller from the endpoint's
//! `call_timeout`; the HTTP client only carries a connect timeout.

use async_trait::async_trait;
use quorum_core::{CallError, Endpoint, ProducerResult};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;

use super::http::{classify_status, parse_forecast};
use super::secrets::ApiKey;
use super::ProviderError;
use crate::producers::ModelClient;

/// Environment variable holding the OpenRouter API key.
pub const OPENROUTER_API_KEY_ENV: &str = "OPENROUTER_API_KEY";

const PROVIDER: &str = "OpenRouter";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_MAX_TOKENS: u32 = 512;

const SYSTEM_PROMPT: &str = "You are a forecasting model. Given a JSON object of features, \
reply with only a JSON object {\"value\": <number in [-1, 1]>, \"confidence\": <number in [0, 1]>} \
where value is the expected direction and strength of the move.";

pub struct OpenRouterClient {
    key: ApiKey,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenRouterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenRouterClient")
            .field("key", &self.key)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl OpenRouterClient {
    pub fn new(key: ApiKey) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::HttpClient(e.to_string()))?;

        Ok(Self {
            key,
            base_url: DEFAULT_BASE_URL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client,
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(ApiKey::from_env(PROVIDER, OPENROUTER_API_KEY_ENV)?)
    }

    /// Build from JSON config (`api_key`, `base_url`, `max_tokens`), with the
    /// key falling back to `OPENROUTER_API_KEY`.
    pub fn from_config(config: &JsonValue) -> Result<Self, ProviderError> {
        let key = ApiKey::resolve(PROVIDER, config, "api_key", OPENROUTER_API_KEY_ENV)?;
        let mut client = Self::new(key)?;

        if let Some(url) = config["base_url"].as_str() {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(ProviderError::InvalidConfig(
                    "base_url must start with http:// or https://".to_string(),
                ));
            }
            client.base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(max_tokens) = config["max_tokens"].as_u64() {
            client.max_tokens = max_tokens.min(u32::MAX as u64) as u32;
        }
        Ok(client)
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    /// Reported by OpenRouter when usage accounting is enabled
    #[serde(default)]
    cost: Option<f64>,
}

#[async_trait]
impl ModelClient for OpenRouterClient {
    async fn call(&self, model: &Endpoint, features: &JsonValue) -> Result<ProducerResult, CallError> {
        let request = ChatRequest {
            model: &model.id,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: features.to_string(),
                },
            ],
            max_tokens: self.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(self.key.expose())
            .header("X-Title", "quorum")
            .json(&request)
            .send()
            .await
            .map_err(|e| CallError::transient(&model.id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&model.id, status.as_u16(), retry_after.as_deref(), &body));
        }

        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| CallError::inference(&model.id, format!("malformed response: {}", e), false))?;

        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CallError::inference(&model.id, "response has no choices", false))?;

        let cost = body
            .usage
            .and_then(|u| u.cost)
            .unwrap_or(model.cost_per_call);

        tracing::debug!(model = %model.id, cost, "OpenRouter completion received");
        Ok(parse_forecast(&model.id, &content)?.with_cost(cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_key() {
        let client = OpenRouterClient::new(ApiKey::new(PROVIDER, "sk-or-secret")).unwrap();
        assert!(!format!("{:?}", client).contains("sk-or-secret"));
    }

    #[test]
    fn test_config_rejects_bad_base_url() {
        let result = OpenRouterClient::from_config(&serde_json::json!({
            "api_key": "k",
            "base_url": "ftp://example.com"
        }));
        assert!(matches!(result, Err(ProviderError::InvalidConfig(_))));
    }

    #[test]
    fn test_config_overrides() {
        let client = OpenRouterClient::from_config(&serde_json::json!({
            "api_key": "k",
            "base_url": "http://localhost:8080/v1/",
            "max_tokens": 64
        }))
        .unwrap();
        assert_eq!(client.base_url, "http://localhost:8080/v1");
        assert_eq!(client.max_tokens, 64);
    }
}
