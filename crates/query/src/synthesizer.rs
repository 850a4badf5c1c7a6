use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::ConfidenceWeights;
use crate::context::RunContext;
use crate::error::PipelineError;
use crate::pipeline::ProcessingMetadata;
use crate::scorer::ScoredChunk;
use crate::verifier::VerificationReport;
use gateway::template::{DEFAULT_VARIANT, tasks};
use gateway::{Bindings, Gateway, PromptRenderer, Schema};

pub const INSUFFICIENT_CONTEXT: &str =
    "The provided document does not contain enough information to answer this question.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// Chunk indices cited by the answer, in citation order
    pub sources_used: Vec<usize>,
    pub confidence_score: f64,
    #[serde(default)]
    pub metadata: ProcessingMetadata,
}

/// First-pass answer, before verification.
#[derive(Debug, Clone, PartialEq)]
pub struct Draft {
    pub text: String,
    pub sources_used: Vec<usize>,
}

/// What the verifier produced for a draft.
#[derive(Debug, Clone)]
pub enum Verification {
    Disabled,
    Failed,
    Completed(VerificationReport),
}

impl Verification {
    pub fn report(&self) -> Option<&VerificationReport> {
        match self {
            Verification::Completed(report) => Some(report),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
struct AnswerReply {
    answer: String,
    #[serde(default)]
    sources_used: Vec<String>,
}

pub struct ResponseSynthesizer {
    gateway: Arc<Gateway>,
    renderer: Arc<dyn PromptRenderer>,
    variant: String,
    weights: ConfidenceWeights,
}

impl ResponseSynthesizer {
    pub fn new(gateway: Arc<Gateway>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self {
            gateway,
            renderer,
            variant: DEFAULT_VARIANT.to_string(),
            weights: ConfidenceWeights::default(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    pub fn with_weights(mut self, weights: ConfidenceWeights) -> Self {
        self.weights = weights;
        self
    }

    /// The answer given when no chunk survived selection. Makes no model call.
    pub fn insufficient() -> Answer {
        Answer {
            text: INSUFFICIENT_CONTEXT.to_string(),
            sources_used: Vec::new(),
            confidence_score: 0.0,
            metadata: ProcessingMetadata::default(),
        }
    }

    pub async fn draft(
        &self,
        query: &str,
        leaves: &[ScoredChunk],
        graph_summary: &str,
        memory: Option<&str>,
        ctx: &RunContext,
    ) -> Result<Draft, PipelineError> {
        let prompt = self.renderer.render(
            tasks::RESPONSE_GENERATION,
            &self.variant,
            &Bindings::new()
                .with("query", query)
                .with("context", numbered_context(leaves))
                .with("graph", graph_summary)
                .with("memory", memory.unwrap_or("(none)")),
        )?;
        let response = self
            .gateway
            .call_structured::<AnswerReply>(&prompt, &Schema::answer(), &ctx.scope)
            .await
            .map_err(PipelineError::Synthesis)?;

        Ok(Draft {
            text: response.value.answer.trim().to_string(),
            sources_used: resolve_sources(&response.value.sources_used, leaves),
        })
    }

    /// Final answer from a draft and its verification. A draft with refuted
    /// claims is revised once; if the revision fails the draft stands.
    pub async fn synthesize(
        &self,
        query: &str,
        leaves: &[ScoredChunk],
        draft: Draft,
        verification: &Verification,
        ctx: &RunContext,
    ) -> Result<Answer, PipelineError> {
        if leaves.is_empty() {
            return Ok(Self::insufficient());
        }

        let mut draft = draft;
        if let Some(report) = verification.report() {
            let refuted: Vec<&str> = report.refuted().map(|c| c.text.as_str()).collect();
            if !refuted.is_empty() {
                match self.revise(query, leaves, &draft, &refuted, ctx).await {
                    Ok(revised) => draft = revised,
                    Err(e) => warn!(
                        run_id = %ctx.run_id,
                        error = %e,
                        "Revision failed, keeping draft"
                    ),
                }
            }
        }

        let confidence_score = self.confidence(leaves, &draft.sources_used, verification);
        debug!(
            run_id = %ctx.run_id,
            sources = ?draft.sources_used,
            confidence = confidence_score,
            "Synthesized answer"
        );
        Ok(Answer {
            text: draft.text,
            sources_used: draft.sources_used,
            confidence_score,
            metadata: ProcessingMetadata::default(),
        })
    }

    async fn revise(
        &self,
        query: &str,
        leaves: &[ScoredChunk],
        draft: &Draft,
        refuted: &[&str],
        ctx: &RunContext,
    ) -> Result<Draft, PipelineError> {
        let refuted = refuted
            .iter()
            .map(|claim| format!("- {}", claim))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = self.renderer.render(
            tasks::RESPONSE_REVISION,
            DEFAULT_VARIANT,
            &Bindings::new()
                .with("query", query)
                .with("draft", draft.text.as_str())
                .with("refuted", refuted)
                .with("context", numbered_context(leaves)),
        )?;
        let response = self
            .gateway
            .call_structured::<AnswerReply>(&prompt, &Schema::answer(), &ctx.scope)
            .await
            .map_err(PipelineError::Synthesis)?;

        Ok(Draft {
            text: response.value.answer.trim().to_string(),
            sources_used: resolve_sources(&response.value.sources_used, leaves),
        })
    }

    fn confidence(
        &self,
        leaves: &[ScoredChunk],
        sources: &[usize],
        verification: &Verification,
    ) -> f64 {
        let used: Vec<f64> = leaves
            .iter()
            .filter(|leaf| sources.contains(&leaf.chunk.index))
            .map(|leaf| leaf.score)
            .collect();
        let relevance = if used.is_empty() {
            0.0
        } else {
            (used.iter().sum::<f64>() / used.len() as f64).clamp(0.0, 1.0)
        };

        let score = match verification {
            Verification::Disabled => relevance,
            Verification::Failed => self.weights.relevance * relevance,
            Verification::Completed(report) => {
                self.weights.relevance * relevance
                    + self.weights.verification * report.verified_ratio.clamp(0.0, 1.0)
            }
        };
        score.clamp(0.0, 1.0)
    }
}

/// Leaves rendered as `[index] text` blocks, the form cited in `sources_used`.
pub fn numbered_context(leaves: &[ScoredChunk]) -> String {
    leaves
        .iter()
        .map(|leaf| format!("[{}] {}", leaf.chunk.index, leaf.chunk.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Map cited strings ("3", "[3]", "chunk 3") onto leaf indices. Unknown
/// citations are dropped; with nothing left every leaf counts as used.
fn resolve_sources(cited: &[String], leaves: &[ScoredChunk]) -> Vec<usize> {
    let mut sources = Vec::new();
    for citation in cited {
        let digits: String = citation
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit())
            .collect();
        let Ok(index) = digits.parse::<usize>() else {
            continue;
        };
        if leaves.iter().any(|leaf| leaf.chunk.index == index) && !sources.contains(&index) {
            sources.push(index);
        }
    }

    if sources.is_empty() {
        leaves.iter().map(|leaf| leaf.chunk.index).collect()
    } else {
        sources
    }
}
