use anyhow::{Result, bail};
use async_trait::async_trait;
use dashmap::DashMap;

use crate::{IndexStats, Metadata, ScoredId, VectorStore};
use ingest::cosine_similarity;

/// Run-scoped store; brute-force cosine search.
#[derive(Debug, Default)]
pub struct InMemoryVectorStore {
    points: DashMap<usize, (Vec<f32>, Metadata)>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self, chunk_id: usize) -> Option<Metadata> {
        self.points.get(&chunk_id).map(|p| p.value().1.clone())
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            points: self.points.len(),
            dimension: self.points.iter().next().map(|p| p.value().0.len()),
        }
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn put(&self, chunk_id: usize, vector: Vec<f32>, metadata: Metadata) -> Result<()> {
        if let Some(dimension) = self.stats().dimension {
            if dimension != vector.len() && !self.points.contains_key(&chunk_id) {
                bail!(
                    "vector dimension {} does not match store dimension {}",
                    vector.len(),
                    dimension
                );
            }
        }
        self.points.insert(chunk_id, (vector, metadata));
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let mut scored: Vec<ScoredId> = self
            .points
            .iter()
            .map(|entry| ScoredId {
                chunk_id: *entry.key(),
                score: cosine_similarity(vector, &entry.value().0),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }
}
