use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ProviderError;
use crate::provider::{Generation, ModelProvider, StructuredGeneration, TokenUsage};
use crate::schema::{Schema, parse_json_text};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for OllamaSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            max_tokens: 8192,
            timeout_secs: 60,
        }
    }
}

#[derive(Clone)]
pub struct OllamaProvider {
    name: String,
    settings: OllamaSettings,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a serde_json::Value>,
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    num_predict: usize,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: u64,
    #[serde(default)]
    eval_count: u64,
}

impl OllamaProvider {
    pub fn new(settings: OllamaSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .context("Failed to build HTTP client for Ollama")?;

        Ok(Self {
            name: format!("ollama:{}", settings.model),
            settings,
            client,
        })
    }

    /// Ping the server's model list; used by health checks, not per call.
    pub async fn check_health(&self) -> bool {
        let url = format!("{}/api/tags", self.settings.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    async fn send(
        &self,
        prompt: &str,
        format: Option<&serde_json::Value>,
    ) -> Result<OllamaResponse, ProviderError> {
        let url = format!("{}/api/generate", self.settings.base_url);
        let request = OllamaRequest {
            model: &self.settings.model,
            prompt,
            stream: false,
            format,
            options: OllamaOptions {
                num_predict: self.settings.max_tokens,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(
                status.as_u16(),
                retry_after_ms,
                body,
            ));
        }

        response
            .json::<OllamaResponse>()
            .await
            .map_err(|e| ProviderError::Server(format!("Failed to parse Ollama response: {}", e)))
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else if err.is_connect() {
        ProviderError::Network(err.to_string())
    } else {
        ProviderError::classify(err.to_string())
    }
}

#[async_trait]
impl ModelProvider for OllamaProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let response = self.send(prompt, None).await?;
        Ok(Generation {
            text: response.response,
            usage: TokenUsage::new(response.prompt_eval_count, response.eval_count),
        })
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Schema,
    ) -> Result<StructuredGeneration, ProviderError> {
        let response = self.send(prompt, Some(&schema.json)).await?;
        let usage = TokenUsage::new(response.prompt_eval_count, response.eval_count);
        // Unparseable output goes back as a string so the gateway's
        // validation step can reject it and reinforce.
        let value = parse_json_text(&response.response)
            .unwrap_or(serde_json::Value::String(response.response));
        Ok(StructuredGeneration { value, usage })
    }

    fn is_available(&self) -> bool {
        !self.settings.base_url.is_empty() && !self.settings.model.is_empty()
    }

    fn max_tokens(&self) -> usize {
        self.settings.max_tokens
    }

    fn supports_structured_output(&self) -> bool {
        true
    }
}
