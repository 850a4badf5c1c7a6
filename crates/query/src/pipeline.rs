//! Pipeline orchestration: chunk, optionally prefilter, drill down, draft,
//! verify and synthesize, all inside one [`RunContext`].

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::context::RunContext;
use crate::drill::{DrillController, DrillOutcome, Enrichment, TerminalReason};
use crate::error::{ConfigError, PipelineError, Stage, StageFailure};
use crate::scorer::{RelevanceScorer, ScoredChunk};
use crate::scratchpad::ScratchpadEntry;
use crate::synthesizer::{Answer, Draft, ResponseSynthesizer, Verification};
use crate::verifier::{FactVerifier, VerificationReport, VerificationStatus};
use extract::{KnowledgeGraph, KnowledgeGraphBuilder};
use gateway::template::tasks;
use gateway::{BuiltinTemplates, CancelToken, Gateway, PromptRenderer};
use index::{Metadata, VectorStore};
use ingest::late::{late_chunk_embeddings, pooled_embedding};
use ingest::{Chunk, Chunker, ChunkerConfig, Document, TokenEmbedder, cosine_similarity};

/// Entities and relations listed in the synthesis prompt
const GRAPH_SUMMARY_LIMIT: usize = 20;

pub const CANCELLED_ANSWER: &str =
    "Processing was cancelled before an answer could be synthesized.";

/// Per-request overrides of the pipeline configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagOptions {
    pub max_depth: Option<usize>,
    pub max_chunks: Option<usize>,
    pub enable_knowledge_graph: Option<bool>,
    pub enable_fact_verification: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct RagRequest {
    pub query: String,
    pub document: Document,
    pub options: RagOptions,
}

impl RagRequest {
    pub fn new(query: impl Into<String>, document: Document) -> Self {
        Self {
            query: query.into(),
            document,
            options: RagOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RagOptions) -> Self {
        self.options = options;
        self
    }
}

/// Explains how an answer was reached and why its confidence is what it is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub run_id: Uuid,
    pub chunks_processed: usize,
    pub recursion_depth: usize,
    pub terminal_reason: TerminalReason,
    pub model_calls: usize,
    pub attempts: usize,
    pub tokens_used: u64,
    pub processing_time_ms: u64,
    pub degraded_stages: Vec<StageFailure>,
    pub verification_status: Option<VerificationStatus>,
    pub entities: usize,
    pub relations: usize,
}

impl ProcessingMetadata {
    pub fn is_degraded(&self, stage: Stage) -> bool {
        self.degraded_stages.iter().any(|f| f.stage == stage)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagResponse {
    pub answer: Answer,
    pub leaves: Vec<ScoredChunk>,
    pub knowledge_graph: KnowledgeGraph,
    pub verification: Option<VerificationReport>,
    #[serde(skip)]
    pub scratchpad: Vec<ScratchpadEntry>,
}

impl RagResponse {
    pub fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            run_id: self.answer.metadata.run_id,
            knowledge_graph: self.knowledge_graph.clone(),
            scratchpad: self.scratchpad.clone(),
            answer: self.answer.clone(),
        }
    }
}

/// Persisted state of one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: Uuid,
    pub knowledge_graph: KnowledgeGraph,
    pub scratchpad: Vec<ScratchpadEntry>,
    pub answer: Answer,
}

impl RunSnapshot {
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run snapshot")?;
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write run snapshot: {}", path.display()))?;
        Ok(())
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read run snapshot: {}", path.display()))?;
        serde_json::from_str(&json).context("Failed to parse run snapshot")
    }
}

pub struct AgenticRag {
    config: PipelineConfig,
    gateway: Arc<Gateway>,
    renderer: Arc<dyn PromptRenderer>,
    chunker: Arc<Chunker>,
    embedder: Option<Arc<dyn TokenEmbedder>>,
    vector_store: Option<Arc<dyn VectorStore>>,
}

impl AgenticRag {
    /// Fails before any run if the configuration is unusable.
    pub fn new(config: PipelineConfig, gateway: Arc<Gateway>) -> Result<Self, ConfigError> {
        config.validate()?;
        let chunker = Chunker::new(ChunkerConfig {
            overlap_chars: config.processing.overlap_chars,
        });
        Ok(Self {
            config,
            gateway,
            renderer: Arc::new(BuiltinTemplates::new()),
            chunker: Arc::new(chunker),
            embedder: None,
            vector_store: None,
        })
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn PromptRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Enables late-chunking prefiltering when `processing.prefilter_top_k` is set.
    pub fn with_embedder(mut self, embedder: Arc<dyn TokenEmbedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn with_vector_store(mut self, store: Arc<dyn VectorStore>) -> Self {
        self.vector_store = Some(store);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn process(&self, request: RagRequest) -> Result<RagResponse, PipelineError> {
        self.process_with_cancel(request, CancelToken::new()).await
    }

    /// Run the pipeline; cancelling `cancel` (or hitting the configured
    /// deadline) ends the drill-down early and skips the remaining model calls.
    pub async fn process_with_cancel(
        &self,
        request: RagRequest,
        cancel: CancelToken,
    ) -> Result<RagResponse, PipelineError> {
        let config = self.effective_config(&request.options);
        config.validate()?;
        if request.query.trim().is_empty() {
            return Err(ConfigError::new("query", "must not be empty").into());
        }

        let deadline = config
            .concurrency
            .deadline_ms
            .map(|ms| cancel.cancel_after(Duration::from_millis(ms)));
        let ctx = RunContext::with_cancel(&config, cancel);
        info!(
            run_id = %ctx.run_id,
            document = request.document.id(),
            bytes = request.document.len(),
            "Processing query"
        );

        let result = self.run(&config, &ctx, &request).await;
        if let Some(handle) = deadline {
            handle.abort();
        }
        result
    }

    async fn run(
        &self,
        config: &PipelineConfig,
        ctx: &RunContext,
        request: &RagRequest,
    ) -> Result<RagResponse, PipelineError> {
        let query = request.query.as_str();
        let document = &request.document;
        let processing = &config.processing;

        let target = processing.initial_target_count(document.len());
        let mut initial = self
            .chunker
            .split(document, target, processing.respect_sentences)?;

        if let (Some(k), Some(embedder)) = (processing.prefilter_top_k, &self.embedder) {
            match self.prefilter(ctx, embedder.as_ref(), query, document, &initial, k).await {
                Ok(kept) => initial = kept,
                Err(e) => ctx.record_failure(Stage::LateChunking, format!("{:#}", e)),
            }
        }

        let outcome = self.drill(config, ctx, query, document, initial).await?;
        let (answer, verification) = self.answer(config, ctx, query, &outcome).await?;

        let knowledge_graph = ctx.graph.lock().await.clone();
        let usage = ctx.scope.usage.snapshot();
        let metadata = ProcessingMetadata {
            run_id: ctx.run_id,
            chunks_processed: outcome.chunks_processed,
            recursion_depth: outcome.depth_reached,
            terminal_reason: outcome.reason,
            model_calls: usage.model_calls,
            attempts: usage.attempts,
            tokens_used: usage.usage.total_tokens,
            processing_time_ms: ctx.elapsed_ms(),
            degraded_stages: ctx.degraded(),
            verification_status: verification.as_ref().map(|r| r.overall),
            entities: knowledge_graph.entity_count(),
            relations: knowledge_graph.relation_count(),
        };
        info!(
            run_id = %ctx.run_id,
            depth = metadata.recursion_depth,
            chunks = metadata.chunks_processed,
            model_calls = metadata.model_calls,
            confidence = answer.confidence_score,
            degraded = metadata.degraded_stages.len(),
            elapsed_ms = metadata.processing_time_ms,
            "Query processed"
        );

        Ok(RagResponse {
            answer: Answer { metadata, ..answer },
            leaves: outcome.leaves,
            knowledge_graph,
            verification,
            scratchpad: ctx.scratchpad.entries(),
        })
    }

    async fn drill(
        &self,
        config: &PipelineConfig,
        ctx: &RunContext,
        query: &str,
        document: &Document,
        initial: Vec<Chunk>,
    ) -> Result<DrillOutcome, PipelineError> {
        let scorer = RelevanceScorer::new(Arc::clone(&self.gateway), Arc::clone(&self.renderer))
            .with_variant(config.prompts.variant(tasks::RELEVANCE_SCORING));

        let knowledge_graph = config.knowledge_graph.enabled.then(|| {
            let builder =
                KnowledgeGraphBuilder::new(Arc::clone(&self.gateway), Arc::clone(&self.renderer))
                    .with_variant(config.prompts.variant(tasks::KNOWLEDGE_EXTRACTION));
            (Arc::new(builder), config.knowledge_graph.extract_options())
        });

        let controller = DrillController::new(
            Arc::new(scorer),
            Arc::clone(&self.chunker),
            config.processing.clone(),
            Enrichment {
                knowledge_graph,
                scratchpad: config.scratchpad.enabled,
            },
        );
        controller.run(ctx, query, document, initial).await
    }

    /// Draft, verify and finalize. A cancelled run answers from what it has
    /// without further model calls.
    async fn answer(
        &self,
        config: &PipelineConfig,
        ctx: &RunContext,
        query: &str,
        outcome: &DrillOutcome,
    ) -> Result<(Answer, Option<VerificationReport>), PipelineError> {
        let leaves = outcome.leaves.as_slice();
        if leaves.is_empty() {
            return Ok((ResponseSynthesizer::insufficient(), None));
        }
        if ctx.is_cancelled() {
            return Ok((cancelled_answer(leaves), None));
        }

        let synthesizer =
            ResponseSynthesizer::new(Arc::clone(&self.gateway), Arc::clone(&self.renderer))
                .with_variant(config.prompts.variant(tasks::RESPONSE_GENERATION))
                .with_weights(config.confidence.clone());

        let graph_summary = ctx.graph.lock().await.summary(GRAPH_SUMMARY_LIMIT);
        let memory = self.memory(config, ctx);
        let draft: Draft = match synthesizer
            .draft(query, leaves, &graph_summary, memory.as_deref(), ctx)
            .await
        {
            Ok(draft) => draft,
            Err(e) if e.is_cancelled() => return Ok((cancelled_answer(leaves), None)),
            Err(e) => return Err(e),
        };

        let verification = if config.fact_verification.enabled {
            let verifier = FactVerifier::new(Arc::clone(&self.gateway), Arc::clone(&self.renderer))
                .with_variant(config.prompts.variant(tasks::FACT_VERIFICATION))
                .require_evidence(config.fact_verification.require_evidence);
            let spans: Vec<String> = leaves.iter().map(|l| l.chunk.text.clone()).collect();
            match verifier
                .verify(&draft.text, &spans, config.fact_verification.min_confidence, ctx)
                .await
            {
                Ok(report) => Verification::Completed(report),
                Err(e) => {
                    ctx.record_failure(Stage::FactVerification, e);
                    Verification::Failed
                }
            }
        } else {
            Verification::Disabled
        };

        let answer = synthesizer
            .synthesize(query, leaves, draft, &verification, ctx)
            .await?;
        Ok((answer, verification.report().cloned()))
    }

    fn memory(&self, config: &PipelineConfig, ctx: &RunContext) -> Option<String> {
        if !config.scratchpad.enabled || ctx.scratchpad.is_empty() {
            return None;
        }
        match ctx.scratchpad.read_all() {
            Ok(notes) => Some(notes),
            Err(e) => {
                ctx.record_failure(Stage::Scratchpad, e);
                None
            }
        }
    }

    /// Keep the `k` chunks whose late-chunking embeddings are closest to the
    /// query, in document order.
    async fn prefilter(
        &self,
        ctx: &RunContext,
        embedder: &dyn TokenEmbedder,
        query: &str,
        document: &Document,
        chunks: &[Chunk],
        k: usize,
    ) -> Result<Vec<Chunk>> {
        if chunks.len() <= k {
            return Ok(chunks.to_vec());
        }

        let vectors = late_chunk_embeddings(embedder, document, chunks).await?;
        let query_vector = pooled_embedding(embedder, query).await?;

        let keep: HashSet<usize> = match &self.vector_store {
            Some(store) => {
                for (chunk, vector) in chunks.iter().zip(vectors) {
                    let mut metadata = Metadata::new();
                    metadata.insert("run_id".into(), json!(ctx.run_id.to_string()));
                    metadata.insert("document_id".into(), json!(document.id()));
                    metadata.insert("span".into(), json!([chunk.span.0, chunk.span.1]));
                    store.put(chunk.index, vector, metadata).await?;
                }
                store
                    .query(&query_vector, k)
                    .await?
                    .into_iter()
                    .map(|hit| hit.chunk_id)
                    .collect()
            }
            None => {
                let mut ranked: Vec<(usize, f32)> = chunks
                    .iter()
                    .zip(&vectors)
                    .map(|(chunk, vector)| (chunk.index, cosine_similarity(&query_vector, vector)))
                    .collect();
                ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
                ranked.into_iter().take(k).map(|(index, _)| index).collect()
            }
        };

        let kept: Vec<Chunk> = chunks
            .iter()
            .filter(|c| keep.contains(&c.index))
            .cloned()
            .collect();
        if kept.is_empty() {
            return Err(anyhow!("vector store returned none of this document's chunks"));
        }
        info!(
            run_id = %ctx.run_id,
            before = chunks.len(),
            after = kept.len(),
            "Prefiltered chunks by embedding similarity"
        );
        Ok(kept)
    }

    fn effective_config(&self, options: &RagOptions) -> PipelineConfig {
        let mut config = self.config.clone();
        if let Some(depth) = options.max_depth {
            config.processing.max_recursive_depth = depth;
        }
        if let Some(max_chunks) = options.max_chunks {
            config.processing.initial_chunk_count = max_chunks;
        }
        if let Some(enabled) = options.enable_knowledge_graph {
            config.knowledge_graph.enabled = enabled;
        }
        if let Some(enabled) = options.enable_fact_verification {
            config.fact_verification.enabled = enabled;
        }
        config
    }
}

fn cancelled_answer(leaves: &[ScoredChunk]) -> Answer {
    warn!(leaves = leaves.len(), "Run cancelled before synthesis");
    Answer {
        text: CANCELLED_ANSWER.to_string(),
        sources_used: leaves.iter().map(|l| l.chunk.index).collect(),
        ..ResponseSynthesizer::insufficient()
    }
}
