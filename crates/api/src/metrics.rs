use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use query::ProcessingMetadata;

pub struct Metrics {
    // Counters
    total_requests: AtomicUsize,
    successful_requests: AtomicUsize,
    failed_requests: AtomicUsize,
    degraded_runs: AtomicUsize,

    // Timing (in microseconds)
    total_query_time_us: AtomicU64,

    // Counts
    total_chunks_processed: AtomicUsize,
    total_entities_extracted: AtomicUsize,
    total_model_calls: AtomicUsize,
    total_tokens_used: AtomicU64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            total_requests: AtomicUsize::new(0),
            successful_requests: AtomicUsize::new(0),
            failed_requests: AtomicUsize::new(0),
            degraded_runs: AtomicUsize::new(0),
            total_query_time_us: AtomicU64::new(0),
            total_chunks_processed: AtomicUsize::new(0),
            total_entities_extracted: AtomicUsize::new(0),
            total_model_calls: AtomicUsize::new(0),
            total_tokens_used: AtomicU64::new(0),
        })
    }

    pub fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Account for a finished run.
    pub fn record_query(&self, duration: Duration, metadata: &ProcessingMetadata) {
        self.total_query_time_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.total_chunks_processed
            .fetch_add(metadata.chunks_processed, Ordering::Relaxed);
        self.total_entities_extracted
            .fetch_add(metadata.entities, Ordering::Relaxed);
        self.total_model_calls
            .fetch_add(metadata.model_calls, Ordering::Relaxed);
        self.total_tokens_used
            .fetch_add(metadata.tokens_used, Ordering::Relaxed);
        if !metadata.degraded_stages.is_empty() {
            self.degraded_runs.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successful = self.successful_requests.load(Ordering::Relaxed);
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            successful_requests: successful,
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            degraded_runs: self.degraded_runs.load(Ordering::Relaxed),
            avg_query_time_ms: avg_time_ms(&self.total_query_time_us, successful),
            total_chunks_processed: self.total_chunks_processed.load(Ordering::Relaxed),
            total_entities_extracted: self.total_entities_extracted.load(Ordering::Relaxed),
            total_model_calls: self.total_model_calls.load(Ordering::Relaxed),
            total_tokens_used: self.total_tokens_used.load(Ordering::Relaxed),
        }
    }
}

fn avg_time_ms(total_us: &AtomicU64, count: usize) -> f64 {
    let total = total_us.load(Ordering::Relaxed) as f64;
    if count > 0 {
        total / count as f64 / 1000.0 // Convert to ms
    } else {
        0.0
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub degraded_runs: usize,
    pub avg_query_time_ms: f64,
    pub total_chunks_processed: usize,
    pub total_entities_extracted: usize,
    pub total_model_calls: usize,
    pub total_tokens_used: u64,
}

pub struct TimedOperation {
    start: Instant,
}

impl TimedOperation {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}
