use std::sync::Arc;
use std::time::Duration;

use gateway::mock::ScriptedProvider;
use gateway::{CancelToken, Gateway, GatewayConfig, ProviderError};
use index::InMemoryVectorStore;
use ingest::{Document, HashingEmbedder};
use query::pipeline::CANCELLED_ANSWER;
use query::synthesizer::INSUFFICIENT_CONTEXT;
use query::{
    AgenticRag, PipelineConfig, PipelineError, RagOptions, RagRequest, RunSnapshot, Stage,
    TerminalReason, VerificationStatus,
};

const ANSWERING_PARAGRAPH: &str = "Acme Corp was founded in 1999 by Jane Doe in Denver. \
    The company builds reusable rockets for small satellites.";

const ACME_HISTORY: &str = "Acme Corp was founded in 1999 by Jane Doe in a rented garage in Denver, \
    Colorado. The company began by repairing weather balloons for the regional airport before \
    turning to launch hardware. Its first reusable booster flew in 2004 from a desert pad in \
    New Mexico and landed within a few meters of its target. Today the company builds reusable \
    rockets for small satellites, employs about four hundred engineers, and runs a second \
    factory near the Texas coast. Jane Doe still chairs the board and signs off on every new \
    vehicle design.";

const IRRELEVANT_PARAGRAPH: &str = "Local bakeries sell green chile bread to tourists. \
    The town hosts a balloon festival every autumn.";

#[derive(Clone, Copy)]
struct Behaviour {
    score: fn(&str) -> f64,
    extraction_fails: bool,
    scoring_delay: Option<Duration>,
}

impl Behaviour {
    fn scoring(score: fn(&str) -> f64) -> Self {
        Self {
            score,
            extraction_fails: false,
            scoring_delay: None,
        }
    }
}

fn mentions_acme(text: &str) -> f64 {
    if text.contains("Acme") { 0.95 } else { 0.1 }
}

fn everything_relevant(_: &str) -> f64 {
    0.8
}

/// Answers every prompt the pipeline sends, keyed on the task it renders.
fn respond(behaviour: Behaviour, prompt: &str) -> Result<String, ProviderError> {
    if let Some((_, listing)) = prompt.split_once("CHUNKS TO SCORE:\n") {
        if let Some(delay) = behaviour.scoring_delay {
            std::thread::sleep(delay);
        }
        let entries: Vec<String> = listing
            .split("[chunk_index: ")
            .filter_map(|block| block.split_once("]\n"))
            .map(|(index, text)| {
                format!(
                    r#"{{"chunk_index": {}, "relevance_score": {}, "reasoning": "scripted"}}"#,
                    index,
                    (behaviour.score)(text)
                )
            })
            .collect();
        return Ok(format!(r#"{{"chunks": [{}]}}"#, entries.join(",")));
    }

    if prompt.contains("Extract entities and relationships") {
        if behaviour.extraction_fails {
            return Err(ProviderError::InvalidRequest("extraction model offline".into()));
        }
        return Ok(r#"{
            "entities": [
                {"name": "Acme Corp", "type": "ORGANIZATION", "confidence": 0.95, "mentions": ["Acme"]},
                {"name": "Denver", "type": "LOCATION", "confidence": 0.9, "mentions": []}
            ],
            "relations": [
                {"from_entity": "Acme Corp", "to_entity": "Denver", "relation_type": "LOCATED_IN",
                 "confidence": 0.9, "evidence": "Acme Corp in Denver"}
            ]
        }"#
        .into());
    }

    if prompt.contains("Break the following answer into atomic claims") {
        return Ok(r#"{"claims": ["Acme Corp exists"]}"#.into());
    }

    if prompt.contains("CLAIM TO VERIFY:") {
        return Ok(r#"{"verdict": "VERIFIED", "evidence": "Acme Corp", "confidence": 0.9}"#.into());
    }

    if let Some((_, context)) = prompt.split_once("CONTEXT:\n") {
        let numbered = context.split("\n\nKNOWN ENTITIES").next().unwrap_or(context);
        let cited: Vec<String> = numbered
            .lines()
            .filter_map(|line| line.strip_prefix('['))
            .filter_map(|line| line.split_once(']'))
            .map(|(index, _)| format!("\"{}\"", index))
            .collect();
        return Ok(format!(
            r#"{{"answer": "Acme Corp was founded in 1999.", "sources_used": [{}], "confidence_score": 0.9}}"#,
            cited.join(",")
        ));
    }

    Err(ProviderError::InvalidRequest("unexpected prompt".into()))
}

fn provider(behaviour: Behaviour) -> Arc<ScriptedProvider> {
    Arc::new(ScriptedProvider::new("mock").with_responder(move |prompt| respond(behaviour, prompt)))
}

fn pipeline(provider: Arc<ScriptedProvider>, config: PipelineConfig) -> AgenticRag {
    let gateway = Gateway::new(provider, &GatewayConfig::default());
    AgenticRag::new(config, Arc::new(gateway)).unwrap()
}

/// Ten paragraphs of four sentences each.
fn long_document() -> Document {
    let paragraphs: Vec<String> = (0..10)
        .map(|p| {
            (0..4)
                .map(|s| {
                    format!(
                        "Acme Corp opened office number {} in Denver after a long search.",
                        p * 4 + s
                    )
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect();
    Document::new("offices", paragraphs.join("\n\n"))
}

#[tokio::test]
async fn answering_paragraph_resolves_at_depth_zero() {
    let provider = provider(Behaviour::scoring(mentions_acme));
    let rag = pipeline(provider, PipelineConfig::default());

    let response = rag
        .process(RagRequest::new(
            "When was Acme Corp founded?",
            Document::from_text(ANSWERING_PARAGRAPH),
        ))
        .await
        .unwrap();

    let metadata = &response.answer.metadata;
    assert_eq!(response.leaves.len(), 1);
    assert!(response.leaves[0].score >= 0.9);
    assert_eq!(metadata.recursion_depth, 0);
    assert_eq!(metadata.terminal_reason, TerminalReason::ParagraphGranularity);
    assert_eq!(response.answer.sources_used, vec![response.leaves[0].chunk.index]);
    assert_eq!(metadata.verification_status, Some(VerificationStatus::Verified));
    assert!((response.answer.confidence_score - (0.6 * 0.95 + 0.4)).abs() < 1e-9);
    assert!(metadata.degraded_stages.is_empty());
    assert!(metadata.model_calls >= 4);
}

#[tokio::test]
async fn full_paragraph_answers_without_recursion() {
    assert!(ACME_HISTORY.len() > PipelineConfig::default().processing.min_chunk_chars);
    let provider = provider(Behaviour::scoring(mentions_acme));
    let rag = pipeline(provider, PipelineConfig::default());

    let response = rag
        .process(RagRequest::new(
            "When was Acme Corp founded?",
            Document::from_text(ACME_HISTORY),
        ))
        .await
        .unwrap();

    let metadata = &response.answer.metadata;
    assert_eq!(response.leaves.len(), 1);
    assert_eq!(response.leaves[0].chunk.index, 0);
    assert!(response.leaves[0].score >= 0.9);
    assert_eq!(metadata.recursion_depth, 0);
    assert_eq!(metadata.terminal_reason, TerminalReason::ParagraphGranularity);
    assert_eq!(response.answer.sources_used, vec![0]);
}

#[tokio::test]
async fn irrelevant_document_states_insufficient_context() {
    let provider = provider(Behaviour::scoring(mentions_acme));
    let rag = pipeline(provider.clone(), PipelineConfig::default());

    let response = rag
        .process(RagRequest::new(
            "When was Acme Corp founded?",
            Document::from_text(IRRELEVANT_PARAGRAPH),
        ))
        .await
        .unwrap();

    assert!(response.leaves.is_empty());
    assert_eq!(response.answer.text, INSUFFICIENT_CONTEXT);
    assert!(response.answer.sources_used.is_empty());
    assert_eq!(response.answer.confidence_score, 0.0);
    assert_eq!(response.answer.metadata.terminal_reason, TerminalReason::NothingSelected);
    // Only the scoring call reached the model
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn drill_down_stops_at_the_depth_limit() {
    let provider = provider(Behaviour::scoring(everything_relevant));
    let rag = pipeline(provider, PipelineConfig::default());
    let options = RagOptions {
        max_depth: Some(1),
        ..RagOptions::default()
    };

    let response = rag
        .process(RagRequest::new("Where are Acme's offices?", long_document()).with_options(options))
        .await
        .unwrap();

    let metadata = &response.answer.metadata;
    assert_eq!(metadata.recursion_depth, 1);
    assert_eq!(metadata.terminal_reason, TerminalReason::DepthLimit);
    assert!(response.leaves.iter().all(|leaf| leaf.chunk.depth == 1));
    assert!(response.knowledge_graph.get("acme corp").is_some());
    assert_eq!(metadata.entities, 2);
    assert_eq!(metadata.relations, 1);
    assert!(!response.scratchpad.is_empty());
    assert!(metadata.chunks_processed > response.leaves.len());
}

#[tokio::test]
async fn failed_extraction_degrades_without_aborting() {
    let behaviour = Behaviour {
        extraction_fails: true,
        ..Behaviour::scoring(everything_relevant)
    };
    let rag = pipeline(provider(behaviour), PipelineConfig::default());
    let options = RagOptions {
        max_depth: Some(1),
        ..RagOptions::default()
    };

    let response = rag
        .process(RagRequest::new("Where are Acme's offices?", long_document()).with_options(options))
        .await
        .unwrap();

    let metadata = &response.answer.metadata;
    assert!(metadata.is_degraded(Stage::KnowledgeGraph));
    assert!(response.knowledge_graph.is_empty());
    assert!(!response.answer.sources_used.is_empty());
    assert_eq!(response.answer.text, "Acme Corp was founded in 1999.");
}

#[tokio::test]
async fn cancelled_run_makes_no_model_calls() {
    let provider = provider(Behaviour::scoring(everything_relevant));
    let rag = pipeline(provider.clone(), PipelineConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();

    let response = rag
        .process_with_cancel(
            RagRequest::new("When was Acme Corp founded?", long_document()),
            cancel,
        )
        .await
        .unwrap();

    assert_eq!(provider.calls(), 0);
    assert_eq!(response.answer.metadata.terminal_reason, TerminalReason::Cancelled);
    assert_eq!(response.answer.confidence_score, 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deadline_cancels_the_drill_down() {
    let behaviour = Behaviour {
        scoring_delay: Some(Duration::from_millis(300)),
        ..Behaviour::scoring(everything_relevant)
    };
    let mut config = PipelineConfig::default();
    config.concurrency.deadline_ms = Some(50);
    let rag = pipeline(provider(behaviour), config);

    let response = rag
        .process(RagRequest::new("Where are Acme's offices?", long_document()))
        .await
        .unwrap();

    assert_eq!(response.answer.metadata.terminal_reason, TerminalReason::Cancelled);
    assert_eq!(response.answer.confidence_score, 0.0);
    if !response.leaves.is_empty() {
        assert_eq!(response.answer.text, CANCELLED_ANSWER);
    }
}

#[tokio::test]
async fn unavailable_primary_is_served_by_fallback() {
    let primary = provider(Behaviour::scoring(mentions_acme));
    primary.set_available(false);
    let fallback = provider(Behaviour::scoring(mentions_acme));
    let gateway = Gateway::new(primary.clone(), &GatewayConfig::default()).with_fallback(fallback.clone());
    let rag = AgenticRag::new(PipelineConfig::default(), Arc::new(gateway)).unwrap();

    let response = rag
        .process(RagRequest::new(
            "When was Acme Corp founded?",
            Document::from_text(ANSWERING_PARAGRAPH),
        ))
        .await
        .unwrap();

    assert_eq!(primary.calls(), 0);
    assert!(fallback.calls() > 0);
    assert_eq!(response.answer.sources_used.len(), 1);
}

#[tokio::test]
async fn invalid_request_options_are_rejected() {
    let provider = provider(Behaviour::scoring(mentions_acme));
    let rag = pipeline(provider.clone(), PipelineConfig::default());
    let options = RagOptions {
        max_chunks: Some(0),
        ..RagOptions::default()
    };

    let result = rag
        .process(RagRequest::new("q", Document::from_text(ANSWERING_PARAGRAPH)).with_options(options))
        .await;

    assert!(matches!(result, Err(PipelineError::Configuration(_))));
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn prefilter_keeps_the_top_chunks_from_the_vector_store() {
    let provider = provider(Behaviour::scoring(everything_relevant));
    let store = Arc::new(InMemoryVectorStore::new());
    let mut config = PipelineConfig::default();
    config.processing.prefilter_top_k = Some(2);
    let gateway = Gateway::new(provider.clone(), &GatewayConfig::default());
    let rag = AgenticRag::new(config, Arc::new(gateway))
        .unwrap()
        .with_embedder(Arc::new(HashingEmbedder::default()))
        .with_vector_store(store.clone());
    let options = RagOptions {
        max_depth: Some(1),
        ..RagOptions::default()
    };

    let response = rag
        .process(RagRequest::new("Where are Acme's offices?", long_document()).with_options(options))
        .await
        .unwrap();

    let metadata = &response.answer.metadata;
    assert!(!metadata.is_degraded(Stage::LateChunking));
    assert!(store.stats().points > 2);
    let run_id = store.metadata(0).unwrap()["run_id"].clone();
    assert_eq!(run_id, serde_json::json!(metadata.run_id.to_string()));

    // Only the kept chunks reach the first scoring call
    let first = &provider.prompts()[0];
    let (_, listing) = first.split_once("CHUNKS TO SCORE:\n").unwrap();
    assert_eq!(listing.matches("[chunk_index: ").count(), 2);
}

#[tokio::test]
async fn snapshot_round_trips_through_disk() {
    let provider = provider(Behaviour::scoring(everything_relevant));
    let rag = pipeline(provider, PipelineConfig::default());
    let options = RagOptions {
        max_depth: Some(1),
        ..RagOptions::default()
    };
    let response = rag
        .process(RagRequest::new("Where are Acme's offices?", long_document()).with_options(options))
        .await
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("run.json");
    let snapshot = response.snapshot();
    snapshot.save(&path).await.unwrap();

    let loaded = RunSnapshot::load(&path).await.unwrap();
    assert_eq!(loaded.run_id, response.answer.metadata.run_id);
    assert_eq!(loaded.scratchpad, snapshot.scratchpad);
    assert_eq!(loaded.answer.text, snapshot.answer.text);
    assert_eq!(loaded.answer.sources_used, snapshot.answer.sources_used);
    assert_eq!(loaded.answer.metadata.degraded_stages, snapshot.answer.metadata.degraded_stages);
    assert_eq!(
        loaded.knowledge_graph.entity_names(),
        snapshot.knowledge_graph.entity_names()
    );
}
