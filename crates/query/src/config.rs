use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;
use extract::ExtractOptions;
use gateway::template::DEFAULT_VARIANT;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub processing: ProcessingConfig,
    pub knowledge_graph: KnowledgeGraphConfig,
    pub fact_verification: FactVerificationConfig,
    pub scratchpad: ScratchpadConfig,
    pub prompts: PromptsConfig,
    pub concurrency: ConcurrencyConfig,
    pub confidence: ConfidenceWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Upper bound on depth-0 chunks
    pub initial_chunk_count: usize,
    /// Preferred depth-0 chunk size; short documents get fewer chunks
    pub chunk_size: usize,
    pub sub_chunks_per_drill: usize,
    pub max_recursive_depth: usize,
    pub respect_sentences: bool,
    pub relevance_threshold: f64,
    /// Spans shorter than this, or holding a single paragraph, are not re-split
    pub min_chunk_chars: usize,
    pub max_chunks_per_call: usize,
    pub overlap_chars: usize,
    /// Keep only the k most similar chunks (late-chunking embeddings) before scoring
    pub prefilter_top_k: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            initial_chunk_count: 25,
            chunk_size: 800,
            sub_chunks_per_drill: 4,
            max_recursive_depth: 3,
            respect_sentences: true,
            relevance_threshold: 0.5,
            min_chunk_chars: 400,
            max_chunks_per_call: 10,
            overlap_chars: 0,
            prefilter_top_k: None,
        }
    }
}

impl ProcessingConfig {
    /// Depth-0 chunk count for a document of `len` bytes.
    pub fn initial_target_count(&self, len: usize) -> usize {
        len.div_ceil(self.chunk_size.max(1))
            .min(self.initial_chunk_count)
            .max(1)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeGraphConfig {
    pub enabled: bool,
    pub entity_types: Vec<String>,
    pub relation_types: Vec<String>,
    pub min_confidence: f64,
}

impl Default for KnowledgeGraphConfig {
    fn default() -> Self {
        let options = ExtractOptions::default();
        Self {
            enabled: true,
            entity_types: options.entity_types,
            relation_types: options.relation_types,
            min_confidence: options.min_confidence,
        }
    }
}

impl KnowledgeGraphConfig {
    pub fn extract_options(&self) -> ExtractOptions {
        ExtractOptions {
            entity_types: self.entity_types.clone(),
            relation_types: self.relation_types.clone(),
            min_confidence: self.min_confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FactVerificationConfig {
    pub enabled: bool,
    /// A VERIFIED verdict must quote evidence found in the context
    pub require_evidence: bool,
    pub min_confidence: f64,
}

impl Default for FactVerificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_evidence: true,
            min_confidence: 0.75,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScratchpadConfig {
    pub enabled: bool,
    pub compression_level: i32,
    pub max_entries: usize,
}

impl Default for ScratchpadConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            compression_level: 3,
            max_entries: 64,
        }
    }
}

/// Per-task template variant, e.g. `relevance_scoring = "strict"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    pub variants: BTreeMap<String, String>,
}

impl PromptsConfig {
    pub fn variant(&self, task: &str) -> &str {
        self.variants
            .get(task)
            .map(String::as_str)
            .unwrap_or(DEFAULT_VARIANT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Branches (extractions, verdicts, scoring batches) in flight per run
    pub max_concurrent_branches: usize,
    pub deadline_ms: Option<u64>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_concurrent_branches: 4,
            deadline_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub relevance: f64,
    pub verification: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            relevance: 0.6,
            verification: 0.4,
        }
    }
}

fn check_unit(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::new(field, format!("{} is outside [0, 1]", value)))
    }
}

fn check_positive(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::new(field, "must be greater than zero"))
    }
}

impl PipelineConfig {
    /// Reject configurations no run could honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processing;
        check_positive("processing.initial_chunk_count", p.initial_chunk_count)?;
        check_positive("processing.chunk_size", p.chunk_size)?;
        check_positive("processing.max_chunks_per_call", p.max_chunks_per_call)?;
        if p.sub_chunks_per_drill < 2 {
            return Err(ConfigError::new(
                "processing.sub_chunks_per_drill",
                "must be at least 2",
            ));
        }
        if p.prefilter_top_k == Some(0) {
            return Err(ConfigError::new(
                "processing.prefilter_top_k",
                "must be greater than zero when set",
            ));
        }
        check_unit("processing.relevance_threshold", p.relevance_threshold)?;
        check_unit("knowledge_graph.min_confidence", self.knowledge_graph.min_confidence)?;
        check_unit(
            "fact_verification.min_confidence",
            self.fact_verification.min_confidence,
        )?;
        check_positive(
            "concurrency.max_concurrent_branches",
            self.concurrency.max_concurrent_branches,
        )?;
        if !(1..=22).contains(&self.scratchpad.compression_level) {
            return Err(ConfigError::new(
                "scratchpad.compression_level",
                "must be between 1 and 22",
            ));
        }
        check_positive("scratchpad.max_entries", self.scratchpad.max_entries)?;

        let w = &self.confidence;
        if !(w.relevance > 0.0 && w.verification > 0.0) {
            return Err(ConfigError::new(
                "confidence",
                "weights must be positive",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.processing.initial_chunk_count, 25);
        assert_eq!(config.processing.max_recursive_depth, 3);
        assert_eq!(config.knowledge_graph.min_confidence, 0.8);
        assert_eq!(config.fact_verification.min_confidence, 0.75);
        assert_eq!(config.knowledge_graph.relation_types[0], "DEVELOPS");
    }

    #[test]
    fn rejects_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.processing.relevance_threshold = 1.5;
        assert_eq!(
            config.validate().unwrap_err().field,
            "processing.relevance_threshold"
        );

        let mut config = PipelineConfig::default();
        config.processing.sub_chunks_per_drill = 1;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.confidence.verification = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn initial_count_shrinks_for_short_documents() {
        let processing = ProcessingConfig::default();
        assert_eq!(processing.initial_target_count(300), 1);
        assert_eq!(processing.initial_target_count(1700), 3);
        assert_eq!(processing.initial_target_count(1_000_000), 25);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"processing": {"max_recursive_depth": 2}, "prompts": {"variants": {"relevance_scoring": "strict"}}}"#,
        )
        .unwrap();
        assert_eq!(config.processing.max_recursive_depth, 2);
        assert_eq!(config.processing.initial_chunk_count, 25);
        assert_eq!(config.prompts.variant("relevance_scoring"), "strict");
        assert_eq!(config.prompts.variant("response_generation"), "default");
    }
}
