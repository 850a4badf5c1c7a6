use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Metadata, ScoredId, VectorStore};

/// Qdrant collection accessed over its REST API.
pub struct QdrantStore {
    base_url: String,
    client: reqwest::Client,
    collection_name: String,
    dimension: usize,
}

#[derive(Serialize)]
struct CreateCollection {
    vectors: VectorParams,
}

#[derive(Serialize)]
struct VectorParams {
    size: usize,
    distance: String,
}

#[derive(Serialize)]
struct UpsertPoints {
    points: Vec<Point>,
}

#[derive(Serialize)]
struct Point {
    id: u64,
    vector: Vec<f32>,
    payload: Metadata,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    vector: &'a [f32],
    limit: usize,
    with_payload: bool,
}

#[derive(Deserialize)]
struct CollectionInfo {
    result: CollectionResult,
}

#[derive(Deserialize)]
struct CollectionResult {
    collections: Vec<Collection>,
}

#[derive(Deserialize)]
struct Collection {
    name: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    result: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    id: serde_json::Value,
    score: f32,
}

impl QdrantStore {
    pub fn new(base_url: String, collection_name: String, dimension: usize) -> Self {
        Self {
            base_url,
            client: reqwest::Client::new(),
            collection_name,
            dimension,
        }
    }

    /// Create the collection unless it already exists
    pub async fn init_collection(&self) -> Result<()> {
        let url = format!("{}/collections", self.base_url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to list Qdrant collections")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to list collections: {}", response.status());
        }

        let info: CollectionInfo = response.json().await?;
        let exists = info
            .result
            .collections
            .iter()
            .any(|c| c.name == self.collection_name);

        if exists {
            info!(collection = %self.collection_name, "Collection already exists");
            return Ok(());
        }

        let url = format!("{}/collections/{}", self.base_url, self.collection_name);
        let create_req = CreateCollection {
            vectors: VectorParams {
                size: self.dimension,
                distance: "Cosine".to_string(),
            },
        };

        let response = self.client.put(&url).json(&create_req).send().await?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("Failed to create collection: {}", error_text);
        }

        info!(
            collection = %self.collection_name,
            dimension = self.dimension,
            "Collection created"
        );
        Ok(())
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn put(&self, chunk_id: usize, vector: Vec<f32>, metadata: Metadata) -> Result<()> {
        if vector.len() != self.dimension {
            anyhow::bail!(
                "vector dimension {} does not match collection dimension {}",
                vector.len(),
                self.dimension
            );
        }

        let mut payload = metadata;
        payload.insert("chunk_id".to_string(), serde_json::json!(chunk_id));

        let url = format!(
            "{}/collections/{}/points",
            self.base_url, self.collection_name
        );
        let upsert_req = UpsertPoints {
            points: vec![Point {
                id: chunk_id as u64,
                vector,
                payload,
            }],
        };

        let response = self
            .client
            .put(&url)
            .json(&upsert_req)
            .send()
            .await
            .context("Failed to send upsert request to Qdrant")?;

        if !response.status().is_success() {
            let error_text = response.text().await?;
            anyhow::bail!("Failed to upsert point: {}", error_text);
        }

        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<ScoredId>> {
        let url = format!(
            "{}/collections/{}/points/search",
            self.base_url, self.collection_name
        );
        let body = SearchRequest {
            vector,
            limit: k,
            with_payload: false,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to send search request to Qdrant")?;

        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            anyhow::bail!("Qdrant search failed: {}", error_text);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse Qdrant response")?;

        parse_hits(parsed)
    }
}

fn parse_hits(response: SearchResponse) -> Result<Vec<ScoredId>> {
    response
        .result
        .into_iter()
        .map(|hit| {
            let id = hit
                .id
                .as_u64()
                .context("Qdrant point id is not an integer")?;
            Ok(ScoredId {
                chunk_id: id as usize,
                score: hit.score,
            })
        })
        .collect()
}
