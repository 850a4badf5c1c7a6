pub mod graph;
pub mod normalizer;
pub mod schema;

pub use graph::{Entity, KnowledgeGraph, Relation, RelationKey};
pub use normalizer::{normalize_entity_type, normalize_name, normalize_relation_type};
pub use schema::{ExtractedEntity, ExtractedRelation, ExtractionResult};

use gateway::template::{DEFAULT_VARIANT, tasks};
use gateway::{
    Bindings, CallScope, Gateway, GatewayError, PromptRenderer, Schema, TemplateError, TokenUsage,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("nothing to extract from")]
    NoText,

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractOptions {
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,
    pub min_confidence: f64,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            entity_types: [
                "PERSON",
                "ORGANIZATION",
                "TECHNOLOGY",
                "CONCEPT",
                "EVENT",
                "LOCATION",
            ]
            .map(String::from)
            .to_vec(),
            relation_types: [
                "DEVELOPS",
                "USES",
                "FOUNDED",
                "LOCATED_IN",
                "WORKS_FOR",
                "INVENTED",
            ]
            .map(String::from)
            .to_vec(),
            min_confidence: 0.8,
        }
    }
}

/// Entities and relations from one extraction call, already normalized and
/// filtered by confidence.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub usage: TokenUsage,
}

impl Extraction {
    pub fn into_graph(self) -> KnowledgeGraph {
        let mut graph = KnowledgeGraph::new();
        self.entities.into_iter().for_each(|e| graph.merge_entity(e));
        self.relations.into_iter().for_each(|r| graph.merge_relation(r));
        graph
    }
}

pub struct KnowledgeGraphBuilder {
    gateway: Arc<Gateway>,
    renderer: Arc<dyn PromptRenderer>,
    variant: String,
}

impl KnowledgeGraphBuilder {
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

    /// One schema-validated call over the given spans. Results below
    /// `options.min_confidence`, or of a type outside the configured lists,
    /// are dropped before the caller merges. An empty list allows every type.
    pub async fn extract(
        &self,
        spans: &[&str],
        options: &ExtractOptions,
        scope: &CallScope,
    ) -> Result<Extraction, ExtractError> {
        let text = spans
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        if text.is_empty() {
            return Err(ExtractError::NoText);
        }

        let prompt = self.renderer.render(
            tasks::KNOWLEDGE_EXTRACTION,
            &self.variant,
            &Bindings::new()
                .with("entity_types", options.entity_types.join(", "))
                .with("relation_types", options.relation_types.join(", "))
                .with("text", text),
        )?;

        let response = self
            .gateway
            .call_structured::<ExtractionResult>(&prompt, &Schema::entity_extraction(), scope)
            .await?;

        let extraction = filter_extraction(response.value, options, response.usage);
        debug!(
            entities = extraction.entities.len(),
            relations = extraction.relations.len(),
            "Extracted knowledge"
        );
        Ok(extraction)
    }
}

fn allows(types: &[String], normalized: &str, normalize: fn(&str) -> String) -> bool {
    types.is_empty() || types.iter().any(|t| normalize(t) == normalized)
}

fn filter_extraction(result: ExtractionResult, options: &ExtractOptions, usage: TokenUsage) -> Extraction {
    let min_confidence = options.min_confidence;
    let entities = result
        .entities
        .into_iter()
        .filter(|e| e.confidence >= min_confidence)
        .map(|e| {
            let mut mentions = e.mentions;
            if mentions.is_empty() {
                mentions.push(e.name.clone());
            }
            Entity::new(&e.name, &e.entity_type, e.confidence, mentions)
        })
        .filter(|e| !e.name.is_empty())
        .filter(|e| allows(&options.entity_types, &e.entity_type, normalize_entity_type))
        .collect();

    let relations = result
        .relations
        .into_iter()
        .filter(|r| r.confidence >= min_confidence)
        .map(|r| {
            Relation::new(
                &r.from_entity,
                &r.to_entity,
                &r.relation_type,
                r.confidence,
                &r.evidence,
            )
        })
        .filter(|r| !r.from_entity.is_empty() && !r.to_entity.is_empty())
        .filter(|r| allows(&options.relation_types, &r.relation_type, normalize_relation_type))
        .collect();

    Extraction {
        entities,
        relations,
        usage,
    }
}
