//! Late chunking: token embeddings are computed once over the full document
//! context and then mean-pooled over each chunk's span, so a chunk's vector
//! carries information from its surroundings (coreference, topic).

use anyhow::{Context, Result};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::{Chunk, Document, Span};

#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    pub span: Span,
    pub vector: Vec<f32>,
}

/// An embedding model that exposes per-token (contextualised) vectors.
#[async_trait]
pub trait TokenEmbedder: Send + Sync {
    fn dimension(&self) -> usize;

    /// Largest slice of text embedded in one context window
    fn max_context_chars(&self) -> usize;

    /// Token vectors for `text`; spans are relative to `text`
    async fn embed_tokens(&self, text: &str) -> Result<Vec<TokenEmbedding>>;
}

/// Pool full-document token embeddings over every chunk span.
pub async fn late_chunk_embeddings(
    embedder: &dyn TokenEmbedder,
    document: &Document,
    chunks: &[Chunk],
) -> Result<Vec<Vec<f32>>> {
    let tokens = embed_document(embedder, document).await?;

    Ok(chunks
        .iter()
        .map(|chunk| {
            let overlapping = tokens
                .iter()
                .filter(|t| t.span.0 < chunk.span.1 && t.span.1 > chunk.span.0)
                .map(|t| t.vector.as_slice());
            mean_pool(overlapping, embedder.dimension())
        })
        .collect())
}

/// Embed free text (e.g. a query) as a single pooled vector
pub async fn pooled_embedding(embedder: &dyn TokenEmbedder, text: &str) -> Result<Vec<f32>> {
    let tokens = embedder
        .embed_tokens(text)
        .await
        .context("Failed to embed text")?;
    Ok(mean_pool(
        tokens.iter().map(|t| t.vector.as_slice()),
        embedder.dimension(),
    ))
}

async fn embed_document(
    embedder: &dyn TokenEmbedder,
    document: &Document,
) -> Result<Vec<TokenEmbedding>> {
    let text = document.text();
    let window = embedder.max_context_chars().max(1);
    let mut tokens = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + window).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            end = start + 1;
            while !text.is_char_boundary(end) {
                end += 1;
            }
        }

        let window_tokens = embedder
            .embed_tokens(&text[start..end])
            .await
            .with_context(|| format!("Failed to embed document window {}..{}", start, end))?;

        tokens.extend(window_tokens.into_iter().map(|t| TokenEmbedding {
            span: (t.span.0 + start, t.span.1 + start),
            vector: t.vector,
        }));
        start = end;
    }

    Ok(tokens)
}

fn mean_pool<'a>(vectors: impl Iterator<Item = &'a [f32]>, dimension: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; dimension];
    let mut count = 0usize;
    for vector in vectors {
        for (acc, v) in pooled.iter_mut().zip(vector) {
            *acc += v;
        }
        count += 1;
    }
    if count > 0 {
        for acc in &mut pooled {
            *acc /= count as f32;
        }
    }
    l2_normalize(&mut pooled);
    pooled
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Deterministic local embedder: signed feature hashing of word tokens,
/// each token blended with its neighbours inside `window` positions.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    window: usize,
    max_context_chars: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(256, 4, 8192)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize, window: usize, max_context_chars: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            window,
            max_context_chars,
        }
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        // Two hashed features per token
        for bytes in digest.chunks(8).take(2) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            let h = u64::from_le_bytes(raw);
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }
        vector
    }
}

#[async_trait]
impl TokenEmbedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn max_context_chars(&self) -> usize {
        self.max_context_chars
    }

    async fn embed_tokens(&self, text: &str) -> Result<Vec<TokenEmbedding>> {
        let words: Vec<(Span, Vec<f32>)> = text
            .split_word_bound_indices()
            .filter(|(_, w)| w.chars().any(char::is_alphanumeric))
            .map(|(offset, w)| ((offset, offset + w.len()), self.token_vector(w)))
            .collect();

        let embeddings = (0..words.len())
            .map(|i| {
                let lo = i.saturating_sub(self.window);
                let hi = (i + self.window + 1).min(words.len());
                let neighbours = hi - lo - 1;

                let mut vector = words[i].1.clone();
                if neighbours > 0 {
                    for (j, (_, other)) in words.iter().enumerate().take(hi).skip(lo) {
                        if j == i {
                            continue;
                        }
                        for (acc, v) in vector.iter_mut().zip(other) {
                            *acc += 0.5 * v / neighbours as f32;
                        }
                    }
                }
                TokenEmbedding {
                    span: words[i].0,
                    vector,
                }
            })
            .collect();

        Ok(embeddings)
    }
}

/// Cosine similarity of two equal-length vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Chunker;

    #[tokio::test]
    async fn one_unit_vector_per_chunk() {
        let doc = Document::new(
            "d",
            "Acme builds reusable rockets in Texas. The company was founded in 2002. \
             Bakers knead bread dough at dawn. Sourdough needs a starter culture.",
        );
        let chunks = Chunker::default().split(&doc, 2, true).unwrap();
        let embedder = HashingEmbedder::default();

        let vectors = late_chunk_embeddings(&embedder, &doc, &chunks).await.unwrap();

        assert_eq!(vectors.len(), chunks.len());
        for v in &vectors {
            assert_eq!(v.len(), embedder.dimension());
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[tokio::test]
    async fn related_chunk_ranks_above_unrelated_chunk() {
        let doc = Document::new(
            "d",
            "Acme builds reusable rockets. Rockets launch satellites into orbit. \
             Bakers knead bread dough. Bread rises in warm ovens.",
        );
        let chunks = Chunker::default().split(&doc, 2, true).unwrap();
        let embedder = HashingEmbedder::default();
        let vectors = late_chunk_embeddings(&embedder, &doc, &chunks).await.unwrap();
        let query = pooled_embedding(&embedder, "rockets orbit satellites").await.unwrap();

        let rocket = cosine_similarity(&query, &vectors[0]);
        let bread = cosine_similarity(&query, &vectors[vectors.len() - 1]);
        assert!(rocket > bread, "rocket={} bread={}", rocket, bread);
    }

    #[tokio::test]
    async fn windows_cover_long_documents() {
        let doc = Document::new("d", "alpha beta gamma delta. ".repeat(50));
        let chunks = Chunker::default().split(&doc, 5, true).unwrap();
        let embedder = HashingEmbedder::new(32, 2, 64);

        let vectors = late_chunk_embeddings(&embedder, &doc, &chunks).await.unwrap();

        assert!(vectors.iter().all(|v| v.iter().any(|x| *x != 0.0)));
    }
}
