use serde::{Deserialize, Serialize};
use std::fmt;

use gateway::{GatewayError, TemplateError};
use ingest::ChunkError;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("invalid configuration: {field}: {reason}")]
pub struct ConfigError {
    pub field: &'static str,
    pub reason: String,
}

impl ConfigError {
    pub fn new(field: &'static str, reason: impl Into<String>) -> Self {
        Self {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures that abort a run. Optional stages never produce these; they are
/// recorded as [`StageFailure`]s instead.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    #[error("chunking failed: {0}")]
    Chunking(#[from] ChunkError),

    #[error("relevance scoring failed: {0}")]
    Scoring(#[source] GatewayError),

    #[error("response synthesis failed: {0}")]
    Synthesis(#[source] GatewayError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("background task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Scoring(e) | PipelineError::Synthesis(e) => e.is_cancelled(),
            _ => false,
        }
    }
}

impl From<tokio::task::JoinError> for PipelineError {
    fn from(err: tokio::task::JoinError) -> Self {
        PipelineError::Task(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Chunking,
    LateChunking,
    Scoring,
    DrillDown,
    KnowledgeGraph,
    Scratchpad,
    FactVerification,
    Synthesis,
}

impl Stage {
    pub fn is_optional(self) -> bool {
        matches!(
            self,
            Stage::LateChunking | Stage::KnowledgeGraph | Stage::Scratchpad | Stage::FactVerification
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Chunking => "chunking",
            Stage::LateChunking => "late_chunking",
            Stage::Scoring => "scoring",
            Stage::DrillDown => "drill_down",
            Stage::KnowledgeGraph => "knowledge_graph",
            Stage::Scratchpad => "scratchpad",
            Stage::FactVerification => "fact_verification",
            Stage::Synthesis => "synthesis",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An optional stage that failed; the run continued without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}
