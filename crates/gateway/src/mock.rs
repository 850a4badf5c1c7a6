//! Scripted model provider for tests and offline runs.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::error::ProviderError;
use crate::provider::{Generation, ModelProvider, StructuredGeneration, TokenUsage};
use crate::schema::{Schema, parse_json_text};

type Responder = Box<dyn Fn(&str) -> Result<String, ProviderError> + Send + Sync>;

/// Replays queued replies in order; once the queue is empty, answers through
/// the responder (if any). Every attempt is counted and its prompt recorded.
pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<Result<String, ProviderError>>>,
    responder: Option<Responder>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    available: AtomicBool,
    structured: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            responder: None,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            structured: true,
        }
    }

    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: Fn(&str) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    /// Report no native structured output, so the gateway falls back to
    /// prompt instructions.
    pub fn text_only(mut self) -> Self {
        self.structured = false;
        self
    }

    pub fn push_ok(&self, reply: impl Into<String>) {
        lock(&self.script).push_back(Ok(reply.into()));
    }

    pub fn push_err(&self, error: ProviderError) {
        lock(&self.script).push_back(Err(error));
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.prompts).clone()
    }

    fn next_reply(&self, prompt: &str) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(prompt.to_string());

        if let Some(scripted) = lock(&self.script).pop_front() {
            return scripted;
        }
        match &self.responder {
            Some(responder) => responder(prompt),
            None => Err(ProviderError::InvalidRequest(format!(
                "{}: script exhausted",
                self.name
            ))),
        }
    }

    fn usage(prompt: &str, reply: &str) -> TokenUsage {
        TokenUsage::new(
            prompt.split_whitespace().count() as u64,
            reply.split_whitespace().count() as u64,
        )
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(&self, prompt: &str) -> Result<Generation, ProviderError> {
        let text = self.next_reply(prompt)?;
        Ok(Generation {
            usage: Self::usage(prompt, &text),
            text,
        })
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        _schema: &Schema,
    ) -> Result<StructuredGeneration, ProviderError> {
        let text = self.next_reply(prompt)?;
        let usage = Self::usage(prompt, &text);
        let value = parse_json_text(&text).unwrap_or(serde_json::Value::String(text));
        Ok(StructuredGeneration { value, usage })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn max_tokens(&self) -> usize {
        8192
    }

    fn supports_structured_output(&self) -> bool {
        self.structured
    }
}
