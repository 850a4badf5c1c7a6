use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::debug;

use crate::context::RunContext;
use crate::error::PipelineError;
use gateway::template::{DEFAULT_VARIANT, scoring_bands, tasks};
use gateway::{Bindings, Gateway, PromptRenderer, Schema};
use ingest::Chunk;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelevanceScore {
    pub chunk_index: usize,
    pub score: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreBand {
    DirectAnswer,
    StrongSupport,
    Background,
    Tangential,
    Irrelevant,
}

impl ScoreBand {
    pub fn of(score: f64) -> Self {
        match score {
            s if s >= 0.9 => ScoreBand::DirectAnswer,
            s if s >= 0.7 => ScoreBand::StrongSupport,
            s if s >= 0.5 => ScoreBand::Background,
            s if s >= 0.3 => ScoreBand::Tangential,
            _ => ScoreBand::Irrelevant,
        }
    }
}

/// A chunk together with the score that selected it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f64,
    pub reasoning: String,
}

impl ScoredChunk {
    pub fn band(&self) -> ScoreBand {
        ScoreBand::of(self.score)
    }
}

#[derive(Deserialize)]
struct RelevanceReply {
    chunks: Vec<Value>,
}

pub struct RelevanceScorer {
    gateway: Arc<Gateway>,
    renderer: Arc<dyn PromptRenderer>,
    variant: String,
}

impl RelevanceScorer {
    pub fn new(gateway: Arc<Gateway>, renderer: Arc<dyn PromptRenderer>) -> Self {
        Self {
            gateway,
            renderer,
            variant: DEFAULT_VARIANT.to_string(),
        }
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = variant.into();
        self
    }

    /// One score per chunk, in input order. Chunks are sent in batches of at
    /// most `max_chunks_per_call`; batches run concurrently.
    pub async fn score(
        &self,
        query: &str,
        chunks: &[Chunk],
        max_chunks_per_call: usize,
        memory: Option<&str>,
        ctx: &RunContext,
    ) -> Result<Vec<RelevanceScore>, PipelineError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[Chunk]> = chunks.chunks(max_chunks_per_call.max(1)).collect();
        let mut tasks = JoinSet::new();

        for (batch_no, batch) in batches.iter().enumerate() {
            let prompt = self.render(query, batch, memory)?;
            let indices: Vec<usize> = batch.iter().map(|c| c.index).collect();
            let gateway = Arc::clone(&self.gateway);
            let scope = ctx.scope.clone();
            let branches = Arc::clone(&ctx.branches);

            tasks.spawn(async move {
                let _permit = branches
                    .acquire_owned()
                    .await
                    .map_err(|e| PipelineError::Task(e.to_string()))?;
                let response = gateway
                    .call_structured::<RelevanceReply>(&prompt, &Schema::relevance(), &scope)
                    .await
                    .map_err(PipelineError::Scoring)?;
                Ok::<_, PipelineError>((batch_no, parse_batch(&indices, &response.value.chunks)))
            });
        }

        let mut scored: Vec<Option<Vec<RelevanceScore>>> = vec![None; batches.len()];
        while let Some(joined) = tasks.join_next().await {
            let (batch_no, scores) = joined??;
            scored[batch_no] = Some(scores);
        }

        let scores: Vec<RelevanceScore> = scored.into_iter().flatten().flatten().collect();
        debug!(
            chunks = chunks.len(),
            batches = batches.len(),
            "Scored chunks"
        );
        Ok(scores)
    }

    fn render(
        &self,
        query: &str,
        batch: &[Chunk],
        memory: Option<&str>,
    ) -> Result<String, PipelineError> {
        let listing = batch
            .iter()
            .map(|c| format!("[chunk_index: {}]\n{}", c.index, c.text.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(self.renderer.render(
            tasks::RELEVANCE_SCORING,
            &self.variant,
            &Bindings::new()
                .with("query", query)
                .with("memory", memory.unwrap_or("(none)"))
                .with("bands", scoring_bands())
                .with("chunks", listing),
        )?)
    }
}

/// Lenient decoding of one batch reply. Every index in `indices` gets exactly
/// one score; anything missing or malformed scores 0.0, duplicates keep the
/// lower score and entries for other chunks are ignored.
fn parse_batch(indices: &[usize], entries: &[Value]) -> Vec<RelevanceScore> {
    let mut best: HashMap<usize, (f64, String)> = HashMap::new();

    for entry in entries {
        let Some(index) = entry.get("chunk_index").and_then(as_index) else {
            continue;
        };
        if !indices.contains(&index) {
            continue;
        }
        let score = entry
            .get("relevance_score")
            .and_then(as_number)
            .filter(|s| s.is_finite())
            .map(|s| s.clamp(0.0, 1.0))
            .unwrap_or(0.0);
        let reasoning = entry
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        match best.entry(index) {
            Entry::Occupied(mut existing) => {
                if score < existing.get().0 {
                    existing.insert((score, reasoning));
                }
            }
            Entry::Vacant(slot) => {
                slot.insert((score, reasoning));
            }
        }
    }

    indices
        .iter()
        .map(|&index| match best.remove(&index) {
            Some((score, reasoning)) => RelevanceScore {
                chunk_index: index,
                score,
                reasoning,
            },
            None => RelevanceScore {
                chunk_index: index,
                score: 0.0,
                reasoning: "no score returned".to_string(),
            },
        })
        .collect()
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && *f >= 0.0).map(|f| f as u64))
            .map(|n| n as usize),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use gateway::mock::ScriptedProvider;
    use gateway::{BuiltinTemplates, GatewayConfig};
    use ingest::{Chunker, Document};
    use serde_json::json;

    #[test]
    fn malformed_entries_default_to_zero() {
        let entries = vec![
            json!({"chunk_index": 0, "relevance_score": 0.95, "reasoning": "direct"}),
            json!({"chunk_index": "1", "relevance_score": "0.7"}),
            json!({"chunk_index": 2, "relevance_score": "high"}),
            json!({"chunk_index": 3, "relevance_score": 4.2}),
            json!({"chunk_index": 9, "relevance_score": 1.0}),
            json!({"relevance_score": 1.0}),
        ];
        let scores = parse_batch(&[0, 1, 2, 3, 4], &entries);

        let values: Vec<f64> = scores.iter().map(|s| s.score).collect();
        assert_eq!(values, vec![0.95, 0.7, 0.0, 1.0, 0.0]);
        assert_eq!(scores[4].chunk_index, 4);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(&s.score)));
    }

    #[test]
    fn duplicate_entries_keep_the_lower_score() {
        let entries = vec![
            json!({"chunk_index": 0, "relevance_score": 0.9}),
            json!({"chunk_index": 0, "relevance_score": 0.4, "reasoning": "on reflection"}),
        ];
        let scores = parse_batch(&[0], &entries);
        assert_eq!(scores[0].score, 0.4);
        assert_eq!(scores[0].reasoning, "on reflection");
    }

    #[test]
    fn bands_follow_thresholds() {
        assert_eq!(ScoreBand::of(0.95), ScoreBand::DirectAnswer);
        assert_eq!(ScoreBand::of(0.7), ScoreBand::StrongSupport);
        assert_eq!(ScoreBand::of(0.5), ScoreBand::Background);
        assert_eq!(ScoreBand::of(0.3), ScoreBand::Tangential);
        assert_eq!(ScoreBand::of(0.1), ScoreBand::Irrelevant);
    }

    #[tokio::test]
    async fn batches_preserve_input_order() {
        let provider = Arc::new(ScriptedProvider::new("mock").with_responder(|prompt| {
            // Score each listed chunk by its own index so order is checkable
            let entries: Vec<String> = prompt
                .lines()
                .filter_map(|l| l.strip_prefix("[chunk_index: "))
                .filter_map(|l| l.strip_suffix(']'))
                .map(|i| format!(r#"{{"chunk_index": {i}, "relevance_score": 0.{i}, "reasoning": "r"}}"#))
                .collect();
            Ok(format!(r#"{{"chunks": [{}]}}"#, entries.join(",")))
        }));
        let gateway = Arc::new(Gateway::new(provider.clone(), &GatewayConfig::default()));
        let scorer = RelevanceScorer::new(gateway, Arc::new(BuiltinTemplates::new()));

        let document = Document::from_text(
            "One fact. Two facts. Three facts. Four facts. Five facts. Six facts. Seven facts.",
        );
        let chunks = Chunker::default().split(&document, 7, true).unwrap();
        let ctx = RunContext::new(&PipelineConfig::default());

        let scores = scorer
            .score("facts?", &chunks, 3, None, &ctx)
            .await
            .unwrap();

        assert_eq!(provider.calls(), chunks.len().div_ceil(3));
        let order: Vec<usize> = scores.iter().map(|s| s.chunk_index).collect();
        let expected: Vec<usize> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(order, expected);
        assert!(provider.prompts()[0].contains("CHUNKS TO SCORE:"));
    }
}
