pub mod config;
pub mod context;
pub mod drill;
pub mod error;
pub mod pipeline;
pub mod scorer;
pub mod scratchpad;
pub mod synthesizer;
pub mod verifier;

pub use config::{
    ConcurrencyConfig, ConfidenceWeights, FactVerificationConfig, KnowledgeGraphConfig,
    PipelineConfig, ProcessingConfig, PromptsConfig, ScratchpadConfig,
};
pub use context::RunContext;
pub use drill::{DrillController, DrillOutcome, DrillPhase, DrillState, Enrichment, TerminalReason};
pub use error::{ConfigError, PipelineError, Stage, StageFailure};
pub use pipeline::{
    AgenticRag, ProcessingMetadata, RagOptions, RagRequest, RagResponse, RunSnapshot,
};
pub use scorer::{RelevanceScore, RelevanceScorer, ScoreBand, ScoredChunk};
pub use scratchpad::{Scratchpad, ScratchpadEntry, ScratchpadError};
pub use synthesizer::{Answer, Draft, ResponseSynthesizer, Verification};
pub use verifier::{Claim, FactVerifier, Verdict, VerificationReport, VerificationStatus, VerifyError};
