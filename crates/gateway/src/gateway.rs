use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, ProviderError};
use crate::provider::{Capability, ModelProvider, TokenUsage};
use crate::retry::{RetryError, RetryPolicy};
use crate::schema::{Schema, parse_json_text};

/// Per-run accounting of model calls.
#[derive(Debug, Default)]
pub struct UsageMeter {
    calls: AtomicUsize,
    attempts: AtomicUsize,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageSnapshot {
    pub model_calls: usize,
    pub attempts: usize,
    pub usage: TokenUsage,
}

impl UsageMeter {
    fn record(&self, attempts: usize, usage: Option<TokenUsage>) {
        self.attempts.fetch_add(attempts, Ordering::Relaxed);
        if let Some(usage) = usage {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.prompt_tokens
                .fetch_add(usage.prompt_tokens, Ordering::Relaxed);
            self.completion_tokens
                .fetch_add(usage.completion_tokens, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            model_calls: self.calls.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            usage: TokenUsage::new(
                self.prompt_tokens.load(Ordering::Relaxed),
                self.completion_tokens.load(Ordering::Relaxed),
            ),
        }
    }
}

/// Cancellation and accounting carried by every gateway call of a run.
#[derive(Debug, Clone, Default)]
pub struct CallScope {
    pub cancel: CancelToken,
    pub usage: Arc<UsageMeter>,
}

impl CallScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self {
            cancel,
            usage: Arc::new(UsageMeter::default()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CallResult {
    Text(String),
    Json(serde_json::Value),
}

#[derive(Debug, Clone)]
pub struct GatewayResponse<T> {
    pub value: T,
    pub usage: TokenUsage,
    pub provider: String,
    pub attempts: usize,
}

/// Resilient call layer in front of a primary and optional fallback provider.
pub struct Gateway {
    primary: Arc<dyn ModelProvider>,
    fallback: Option<Arc<dyn ModelProvider>>,
    policy: RetryPolicy,
    in_flight: Semaphore,
}

impl Gateway {
    pub fn new(primary: Arc<dyn ModelProvider>, config: &GatewayConfig) -> Self {
        Self {
            primary,
            fallback: None,
            policy: RetryPolicy::from_config(&config.retry),
            in_flight: Semaphore::new(config.max_in_flight_calls.max(1)),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ModelProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn primary(&self) -> &dyn ModelProvider {
        self.primary.as_ref()
    }

    pub fn fallback(&self) -> Option<&dyn ModelProvider> {
        self.fallback.as_deref()
    }

    pub fn is_available(&self) -> bool {
        self.primary.is_available() || self.fallback.as_ref().is_some_and(|f| f.is_available())
    }

    /// Plain text generation.
    pub async fn generate(
        &self,
        prompt: &str,
        scope: &CallScope,
    ) -> Result<GatewayResponse<String>, GatewayError> {
        let response = self.call(prompt, None, scope).await?;
        let text = match response.value {
            CallResult::Text(text) => text,
            CallResult::Json(value) => value.to_string(),
        };
        Ok(GatewayResponse {
            value: text,
            usage: response.usage,
            provider: response.provider,
            attempts: response.attempts,
        })
    }

    /// Schema-validated generation decoded into `T`. Invalid output is
    /// retried once with reinforced formatting instructions.
    pub async fn call_structured<T: DeserializeOwned>(
        &self,
        prompt: &str,
        schema: &Schema,
        scope: &CallScope,
    ) -> Result<GatewayResponse<T>, GatewayError> {
        let first = self.call(prompt, Some(schema), scope).await?;
        let reason = match decode::<T>(first.value) {
            Ok(value) => {
                return Ok(GatewayResponse {
                    value,
                    usage: first.usage,
                    provider: first.provider,
                    attempts: first.attempts,
                });
            }
            Err(reason) => reason,
        };

        warn!(
            schema = schema.name,
            provider = %first.provider,
            error = %reason,
            "Structured output failed validation, retrying with reinforced instructions"
        );

        let reinforced = schema.reinforce(prompt, &reason);
        let second = self.call(&reinforced, Some(schema), scope).await?;
        let value = decode::<T>(second.value).map_err(|reason| GatewayError::SchemaValidation {
            schema: schema.name.to_string(),
            reason,
        })?;

        Ok(GatewayResponse {
            value,
            usage: first.usage + second.usage,
            provider: second.provider,
            attempts: first.attempts + second.attempts,
        })
    }

    /// One logical call: primary with retry/backoff, then the fallback once.
    pub async fn call(
        &self,
        prompt: &str,
        schema: Option<&Schema>,
        scope: &CallScope,
    ) -> Result<GatewayResponse<CallResult>, GatewayError> {
        let primary_result = if self.primary.is_available() {
            self.call_with_retry(self.primary.as_ref(), prompt, schema, scope)
                .await
        } else {
            Err(GatewayError::ProviderUnavailable {
                provider: self.primary.name().to_string(),
            })
        };

        match (primary_result, &self.fallback) {
            (Ok(response), _) => Ok(response),
            (Err(primary_err), Some(fallback)) if primary_err.allows_fallback() => {
                warn!(
                    primary = self.primary.name(),
                    fallback = fallback.name(),
                    error = %primary_err,
                    "Primary provider failed, trying fallback"
                );
                self.call_once(fallback.as_ref(), prompt, schema, scope)
                    .await
                    .map_err(|fallback_err| GatewayError::FallbackFailed {
                        primary: Box::new(primary_err),
                        fallback: Box::new(fallback_err),
                    })
            }
            (Err(err), _) => Err(err),
        }
    }

    async fn call_with_retry(
        &self,
        provider: &dyn ModelProvider,
        prompt: &str,
        schema: Option<&Schema>,
        scope: &CallScope,
    ) -> Result<GatewayResponse<CallResult>, GatewayError> {
        let outcome = self
            .policy
            .retry(provider.name(), &scope.cancel, || {
                self.attempt(provider, prompt, schema)
            })
            .await;

        match outcome {
            Ok(((value, usage), attempts)) => {
                scope.usage.record(attempts, Some(usage));
                Ok(GatewayResponse {
                    value,
                    usage,
                    provider: provider.name().to_string(),
                    attempts,
                })
            }
            Err(RetryError::Fatal { attempts, error }) => {
                scope.usage.record(attempts, None);
                Err(GatewayError::Fatal {
                    provider: provider.name().to_string(),
                    source: error,
                })
            }
            Err(RetryError::Exhausted { attempts, error }) => {
                scope.usage.record(attempts, None);
                Err(GatewayError::RetriesExhausted {
                    provider: provider.name().to_string(),
                    attempts,
                    last: error,
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                scope.usage.record(attempts, None);
                Err(GatewayError::Cancelled)
            }
        }
    }

    async fn call_once(
        &self,
        provider: &dyn ModelProvider,
        prompt: &str,
        schema: Option<&Schema>,
        scope: &CallScope,
    ) -> Result<GatewayResponse<CallResult>, GatewayError> {
        if !provider.is_available() {
            return Err(GatewayError::ProviderUnavailable {
                provider: provider.name().to_string(),
            });
        }

        let result = tokio::select! {
            result = self.attempt(provider, prompt, schema) => result,
            _ = scope.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        match result {
            Ok((value, usage)) => {
                scope.usage.record(1, Some(usage));
                Ok(GatewayResponse {
                    value,
                    usage,
                    provider: provider.name().to_string(),
                    attempts: 1,
                })
            }
            Err(error) => {
                scope.usage.record(1, None);
                let provider = provider.name().to_string();
                if error.is_transient() {
                    Err(GatewayError::RetriesExhausted {
                        provider,
                        attempts: 1,
                        last: error,
                    })
                } else {
                    Err(GatewayError::Fatal {
                        provider,
                        source: error,
                    })
                }
            }
        }
    }

    /// A single provider round-trip. The in-flight permit is held only here.
    async fn attempt(
        &self,
        provider: &dyn ModelProvider,
        prompt: &str,
        schema: Option<&Schema>,
    ) -> Result<(CallResult, TokenUsage), ProviderError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| ProviderError::Unavailable("gateway is shut down".to_string()))?;

        match schema {
            None => provider
                .generate(prompt)
                .await
                .map(|g| (CallResult::Text(g.text), g.usage)),
            Some(schema) if provider.capabilities().supports(Capability::StructuredGenerate) => {
                provider
                    .generate_structured(prompt, schema)
                    .await
                    .map(|g| (CallResult::Json(g.value), g.usage))
            }
            Some(schema) => {
                debug!(
                    provider = provider.name(),
                    schema = schema.name,
                    "Provider lacks structured output, using prompt instructions"
                );
                provider
                    .generate(&schema.with_instructions(prompt))
                    .await
                    .map(|g| (CallResult::Text(g.text), g.usage))
            }
        }
    }
}

fn decode<T: DeserializeOwned>(result: CallResult) -> Result<T, String> {
    let value = match result {
        CallResult::Json(serde_json::Value::String(text)) | CallResult::Text(text) => {
            parse_json_text(&text).map_err(|e| format!("output is not valid JSON: {}", e))?
        }
        CallResult::Json(value) => value,
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}
