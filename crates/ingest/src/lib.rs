pub mod chunk;
pub mod chunker;
pub mod late;
pub mod reader;

pub use chunk::{Chunk, Document, Span};
pub use chunker::{Chunker, ChunkerConfig};
pub use late::{HashingEmbedder, TokenEmbedder, TokenEmbedding, cosine_similarity};
pub use reader::FileReader;

use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("document is empty")]
    EmptyDocument,
}

/// Generate a stable document ID from a file path
pub fn generate_doc_id(path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..16])
}
