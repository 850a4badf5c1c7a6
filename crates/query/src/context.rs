use std::fmt::Display;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::error::{Stage, StageFailure};
use crate::scratchpad::Scratchpad;
use extract::KnowledgeGraph;
use gateway::{CallScope, CancelToken};

/// Everything one pipeline invocation owns. Passed explicitly through every
/// stage; nothing here outlives the run unless exported.
pub struct RunContext {
    pub run_id: Uuid,
    pub graph: Arc<Mutex<KnowledgeGraph>>,
    pub scratchpad: Arc<Scratchpad>,
    pub scope: CallScope,
    /// Bounds concurrent branches (extractions, verdicts, scoring batches)
    pub branches: Arc<Semaphore>,
    degraded: StdMutex<Vec<StageFailure>>,
    started: Instant,
}

impl RunContext {
    pub fn new(config: &PipelineConfig) -> Self {
        Self::with_cancel(config, CancelToken::new())
    }

    pub fn with_cancel(config: &PipelineConfig, cancel: CancelToken) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            graph: Arc::new(Mutex::new(KnowledgeGraph::new())),
            scratchpad: Arc::new(Scratchpad::new(&config.scratchpad)),
            scope: CallScope::with_cancel(cancel),
            branches: Arc::new(Semaphore::new(
                config.concurrency.max_concurrent_branches.max(1),
            )),
            degraded: StdMutex::new(Vec::new()),
            started: Instant::now(),
        }
    }

    pub fn cancel(&self) {
        self.scope.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.scope.cancel.is_cancelled()
    }

    /// Log and remember an optional-stage failure; the run continues.
    pub fn record_failure(&self, stage: Stage, error: impl Display) {
        let message = error.to_string();
        warn!(
            run_id = %self.run_id,
            stage = %stage,
            error = %message,
            "Optional stage failed, continuing without it"
        );
        self.degraded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(StageFailure { stage, message });
    }

    pub fn degraded(&self) -> Vec<StageFailure> {
        self.degraded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_degraded(&self, stage: Stage) -> bool {
        self.degraded().iter().any(|f| f.stage == stage)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_degraded_stages() {
        let ctx = RunContext::new(&PipelineConfig::default());
        assert!(!ctx.is_degraded(Stage::KnowledgeGraph));

        ctx.record_failure(Stage::KnowledgeGraph, "schema validation failed");

        assert!(ctx.is_degraded(Stage::KnowledgeGraph));
        assert_eq!(ctx.degraded()[0].message, "schema validation failed");
    }

    #[test]
    fn runs_are_independent() {
        let config = PipelineConfig::default();
        let a = RunContext::new(&config);
        let b = RunContext::new(&config);
        a.cancel();

        assert_ne!(a.run_id, b.run_id);
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
    }
}
