pub mod cancel;
pub mod config;
pub mod error;
pub mod gateway;
pub mod mock;
pub mod ollama;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod template;

pub use cancel::CancelToken;
pub use config::{GatewayConfig, RetryConfig};
pub use error::{GatewayError, ProviderError};
pub use gateway::{CallResult, CallScope, Gateway, GatewayResponse, UsageMeter, UsageSnapshot};
pub use ollama::{OllamaProvider, OllamaSettings};
pub use provider::{
    Capability, CapabilitySet, Generation, ModelProvider, StructuredGeneration, TokenUsage,
};
pub use retry::{RetryError, RetryPolicy, Retryable};
pub use schema::{Schema, parse_json_text};
pub use template::{Bindings, BuiltinTemplates, PromptRenderer, TemplateError};
