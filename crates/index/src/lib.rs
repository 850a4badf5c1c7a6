pub mod memory;
pub mod qdrant;

pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredId {
    pub chunk_id: usize,
    pub score: f32,
}

/// Vector/embedding store used by late-chunking prefiltering.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn put(&self, chunk_id: usize, vector: Vec<f32>, metadata: Metadata) -> Result<()>;

    /// Up to `k` stored chunk ids, most similar first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>>;
}

#[derive(Debug, Serialize)]
pub struct IndexStats {
    pub points: usize,
    pub dimension: Option<usize>,
}
