//! Drill-down controller.
//!
//! The traversal is an explicit loop over [`DrillPhase`] with the frontier
//! held in [`DrillState`]; there is no recursion. Each pass scores the
//! frontier, keeps the chunks at or above the threshold and re-splits them one
//! level deeper, until nothing is selected, the depth limit is hit, the
//! selection is already paragraph sized, no unvisited span remains, or the
//! run is cancelled.
//!
//! Leaves are kept per branch: a drilled chunk whose children all fall below
//! the threshold stays in the final context itself.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

use crate::config::ProcessingConfig;
use crate::context::RunContext;
use crate::error::{PipelineError, Stage};
use crate::scorer::{RelevanceScore, RelevanceScorer, ScoredChunk};
use extract::{ExtractOptions, KnowledgeGraphBuilder};
use ingest::{Chunk, Chunker, Document, Span};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalReason {
    #[default]
    NothingSelected,
    DepthLimit,
    ParagraphGranularity,
    NoNewSpans,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "phase", content = "reason")]
pub enum DrillPhase {
    Initial,
    Scoring,
    Selecting,
    Drilling,
    Terminal(TerminalReason),
}

#[derive(Debug, Clone, Default)]
pub struct DrillState {
    pub depth: usize,
    pub frontier: Vec<Chunk>,
    pub visited_spans: HashSet<Span>,
}

impl DrillState {
    pub fn new(frontier: Vec<Chunk>) -> Self {
        Self {
            depth: 0,
            frontier,
            visited_spans: HashSet::new(),
        }
    }

    pub fn is_visited(&self, span: Span) -> bool {
        self.visited_spans.contains(&span)
    }

    fn advance(&mut self, frontier: Vec<Chunk>) {
        self.depth += 1;
        self.frontier = frontier;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillOutcome {
    /// Final context, in document order
    pub leaves: Vec<ScoredChunk>,
    pub depth_reached: usize,
    pub chunks_processed: usize,
    pub reason: TerminalReason,
    pub transitions: Vec<DrillPhase>,
}

/// Optional enrichment run on every drilled level.
pub struct Enrichment {
    pub knowledge_graph: Option<(Arc<KnowledgeGraphBuilder>, ExtractOptions)>,
    pub scratchpad: bool,
}

pub struct DrillController {
    scorer: Arc<RelevanceScorer>,
    chunker: Arc<Chunker>,
    config: ProcessingConfig,
    enrichment: Enrichment,
}

impl DrillController {
    pub fn new(
        scorer: Arc<RelevanceScorer>,
        chunker: Arc<Chunker>,
        config: ProcessingConfig,
        enrichment: Enrichment,
    ) -> Self {
        Self {
            scorer,
            chunker,
            config,
            enrichment,
        }
    }

    pub async fn run(
        &self,
        ctx: &RunContext,
        query: &str,
        document: &Document,
        initial: Vec<Chunk>,
    ) -> Result<DrillOutcome, PipelineError> {
        let mut next_index = initial.iter().map(|c| c.index + 1).max().unwrap_or(0);
        let mut state = DrillState::new(initial);
        let mut phase = DrillPhase::Initial;
        let mut transitions = Vec::new();
        let mut scores: Vec<RelevanceScore> = Vec::new();
        let mut selected: Vec<ScoredChunk> = Vec::new();
        let mut pending_parents: Vec<ScoredChunk> = Vec::new();
        let mut leaves: Vec<ScoredChunk> = Vec::new();
        let mut chunks_processed = 0;

        let reason = loop {
            debug!(run_id = %ctx.run_id, depth = state.depth, ?phase, "Drill-down transition");
            transitions.push(phase);

            phase = match phase {
                DrillPhase::Initial => {
                    if state.frontier.is_empty() {
                        DrillPhase::Terminal(TerminalReason::NothingSelected)
                    } else {
                        DrillPhase::Scoring
                    }
                }

                DrillPhase::Scoring => {
                    if ctx.is_cancelled() {
                        DrillPhase::Terminal(TerminalReason::Cancelled)
                    } else {
                        let memory = self.working_memory(ctx);
                        match self
                            .scorer
                            .score(
                                query,
                                &state.frontier,
                                self.config.max_chunks_per_call,
                                memory.as_deref(),
                                ctx,
                            )
                            .await
                        {
                            Ok(batch) => {
                                chunks_processed += state.frontier.len();
                                scores = batch;
                                DrillPhase::Selecting
                            }
                            Err(e) if e.is_cancelled() => {
                                DrillPhase::Terminal(TerminalReason::Cancelled)
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }

                DrillPhase::Selecting => {
                    selected = self.select(&state, &scores);
                    retain_unselected_parents(&mut pending_parents, &selected, &mut leaves);

                    info!(
                        run_id = %ctx.run_id,
                        depth = state.depth,
                        frontier = state.frontier.len(),
                        selected = selected.len(),
                        "Drill-down level scored"
                    );

                    if selected.is_empty() {
                        DrillPhase::Terminal(TerminalReason::NothingSelected)
                    } else if state.depth >= self.config.max_recursive_depth {
                        DrillPhase::Terminal(TerminalReason::DepthLimit)
                    } else if selected.iter().all(|s| self.is_paragraph(&s.chunk)) {
                        DrillPhase::Terminal(TerminalReason::ParagraphGranularity)
                    } else {
                        DrillPhase::Drilling
                    }
                }

                DrillPhase::Drilling => {
                    self.enrich(ctx, state.depth, &selected).await;

                    let mut next_frontier = Vec::new();
                    for parent in selected.drain(..) {
                        state.visited_spans.insert(parent.chunk.span);
                        let children = self.children_of(&state, document, &parent.chunk, next_index);
                        if children.len() < 2 {
                            leaves.push(parent);
                            continue;
                        }
                        next_index += children.len();
                        next_frontier.extend(children);
                        pending_parents.push(parent);
                    }

                    if next_frontier.is_empty() {
                        DrillPhase::Terminal(TerminalReason::NoNewSpans)
                    } else {
                        state.advance(next_frontier);
                        DrillPhase::Scoring
                    }
                }

                DrillPhase::Terminal(reason) => break reason,
            };
        };

        leaves.append(&mut selected);
        leaves.append(&mut pending_parents);
        leaves.sort_by_key(|l| (l.chunk.span, l.chunk.index));

        info!(
            run_id = %ctx.run_id,
            depth = state.depth,
            leaves = leaves.len(),
            chunks_processed,
            ?reason,
            "Drill-down finished"
        );

        Ok(DrillOutcome {
            leaves,
            depth_reached: state.depth,
            chunks_processed,
            reason,
            transitions,
        })
    }

    /// Frontier chunks at or above the threshold whose span was not visited.
    fn select(&self, state: &DrillState, scores: &[RelevanceScore]) -> Vec<ScoredChunk> {
        state
            .frontier
            .iter()
            .zip(scores)
            .filter(|(chunk, score)| {
                score.score >= self.config.relevance_threshold && !state.is_visited(chunk.span)
            })
            .map(|(chunk, score)| ScoredChunk {
                chunk: chunk.clone(),
                score: score.score,
                reasoning: score.reasoning.clone(),
            })
            .collect()
    }

    /// Short spans and spans without an inner blank line are not re-split.
    fn is_paragraph(&self, chunk: &Chunk) -> bool {
        chunk.span_len() < self.config.min_chunk_chars || !chunk.has_paragraph_break()
    }

    /// Sub-chunks of `parent` one level deeper, numbered from `first_index`.
    /// Empty when the parent is already paragraph sized or cannot be split
    /// into new, strictly smaller spans.
    fn children_of(
        &self,
        state: &DrillState,
        document: &Document,
        parent: &Chunk,
        first_index: usize,
    ) -> Vec<Chunk> {
        if self.is_paragraph(parent) {
            return Vec::new();
        }

        let split = self.chunker.split_span(
            document,
            parent.span,
            self.config.sub_chunks_per_drill,
            self.config.respect_sentences,
            state.depth + 1,
            Some(parent.index),
            first_index,
        );
        let Ok(candidates) = split else {
            return Vec::new();
        };

        candidates
            .into_iter()
            .filter(|c| c.is_strictly_within(parent) && !state.is_visited(c.span))
            .enumerate()
            .map(|(offset, mut child)| {
                child.index = first_index + offset;
                child
            })
            .collect()
    }

    fn working_memory(&self, ctx: &RunContext) -> Option<String> {
        if !self.enrichment.scratchpad {
            return None;
        }
        match ctx.scratchpad.latest() {
            Ok(note) => note,
            Err(e) => {
                ctx.record_failure(Stage::Scratchpad, e);
                None
            }
        }
    }

    /// Knowledge-graph extraction per selected branch, then one scratchpad
    /// note for the level. Failures are recorded, never returned.
    async fn enrich(&self, ctx: &RunContext, depth: usize, selected: &[ScoredChunk]) {
        let mut new_entities: Vec<String> = Vec::new();

        if let Some((builder, options)) = &self.enrichment.knowledge_graph {
            let mut tasks = JoinSet::new();
            for branch in selected {
                let builder = Arc::clone(builder);
                let options = options.clone();
                let scope = ctx.scope.clone();
                let graph = Arc::clone(&ctx.graph);
                let branches = Arc::clone(&ctx.branches);
                let text = branch.chunk.text.clone();

                tasks.spawn(async move {
                    let _permit = branches.acquire_owned().await.ok();
                    let extraction = builder.extract(&[text.as_str()], &options, &scope).await?;
                    let names: Vec<String> =
                        extraction.entities.iter().map(|e| e.name.clone()).collect();
                    let mut graph = graph.lock().await;
                    graph.merge(extraction.into_graph());
                    Ok::<_, extract::ExtractError>(names)
                });
            }

            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(names)) => new_entities.extend(names),
                    Ok(Err(extract::ExtractError::Gateway(e))) if e.is_cancelled() => {}
                    Ok(Err(e)) => ctx.record_failure(Stage::KnowledgeGraph, e),
                    Err(e) => ctx.record_failure(Stage::KnowledgeGraph, e),
                }
            }
        }

        if self.enrichment.scratchpad {
            new_entities.sort();
            new_entities.dedup();
            let note = level_note(depth, selected, &new_entities);
            if let Err(e) = ctx.scratchpad.write(&format!("depth-{}", depth), &note) {
                ctx.record_failure(Stage::Scratchpad, e);
            }
        }
    }
}

/// Parents whose children were all rejected stay in the context as leaves.
fn retain_unselected_parents(
    pending: &mut Vec<ScoredChunk>,
    selected: &[ScoredChunk],
    leaves: &mut Vec<ScoredChunk>,
) {
    for parent in pending.drain(..) {
        let has_selected_child = selected
            .iter()
            .any(|s| s.chunk.parent_index == Some(parent.chunk.index));
        if !has_selected_child {
            leaves.push(parent);
        }
    }
}

fn level_note(depth: usize, selected: &[ScoredChunk], entities: &[String]) -> String {
    let mut lines = vec![format!(
        "depth {}: {} chunk(s) selected for drill-down",
        depth,
        selected.len()
    )];
    lines.extend(selected.iter().map(|s| {
        format!(
            "- chunk {} ({:.2}, {:?}): {}",
            s.chunk.index,
            s.score,
            s.band(),
            s.reasoning
        )
    }));
    if !entities.is_empty() {
        lines.push(format!("entities: {}", entities.join(", ")));
    }
    lines.join("\n")
}
