use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::ops::{Add, AddAssign};

use crate::error::ProviderError;
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    BasicGenerate,
    StructuredGenerate,
    Streaming,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn basic() -> Self {
        Self(BTreeSet::from([Capability::BasicGenerate]))
    }

    pub fn with(mut self, capability: Capability) -> Self {
        self.0.insert(capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

impl Add for TokenUsage {
    type Output = TokenUsage;

    fn add(self, rhs: TokenUsage) -> TokenUsage {
        TokenUsage {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: TokenUsage) {
        *self = *self + rhs;
    }
}

#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone)]
pub struct StructuredGeneration {
    pub value: serde_json::Value,
    pub usage: TokenUsage,
}

/// A language-model backend. Concrete providers are chosen at configuration
/// time; the gateway dispatches on `capabilities()`.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError>;

    async fn generate_structured(
        &self,
        _prompt: &str,
        _schema: &Schema,
    ) -> Result<StructuredGeneration, ProviderError> {
        Err(ProviderError::Unsupported(Capability::StructuredGenerate))
    }

    fn is_available(&self) -> bool;

    fn max_tokens(&self) -> usize;

    fn supports_structured_output(&self) -> bool {
        false
    }

    fn capabilities(&self) -> CapabilitySet {
        let set = CapabilitySet::basic();
        if self.supports_structured_output() {
            set.with(Capability::StructuredGenerate)
        } else {
            set
        }
    }
}
