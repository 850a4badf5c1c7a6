use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Byte range `[start, end)` into the document text, always on char boundaries.
pub type Span = (usize, usize);

/// Raw document text with a stable identifier. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    id: String,
    text: String,
}

impl Document {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
        }
    }

    /// Build a document whose id is derived from its content
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let id = Self::generate_doc_id(&text);
        Self { id, text }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Slice of the document covered by `span`
    pub fn slice(&self, span: Span) -> &str {
        &self.text[span.0..span.1]
    }

    fn generate_doc_id(text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let result = hasher.finalize();
        hex::encode(&result[..16]) // Use first 16 bytes (32 hex chars)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
    pub span: Span,
    pub depth: usize,
    pub parent_index: Option<usize>,
}

impl Chunk {
    pub fn new(
        index: usize,
        document: &Document,
        span: Span,
        depth: usize,
        parent_index: Option<usize>,
    ) -> Self {
        Self {
            index,
            text: document.slice(span).to_string(),
            span,
            depth,
            parent_index,
        }
    }

    pub fn span_len(&self) -> usize {
        self.span.1 - self.span.0
    }

    /// True when `self` covers a strictly smaller range inside `other`
    pub fn is_strictly_within(&self, other: &Chunk) -> bool {
        self.span.0 >= other.span.0
            && self.span.1 <= other.span.1
            && self.span_len() < other.span_len()
    }

    /// True when a blank line separates two paragraphs inside the chunk
    pub fn has_paragraph_break(&self) -> bool {
        self.text.trim().lines().any(|line| line.trim().is_empty())
    }

    /// Estimate token count (rough: 1.3 tokens per word)
    pub fn estimated_tokens(&self) -> usize {
        let word_count = self.text.split_whitespace().count();
        (word_count as f64 * 1.3) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_is_stable_for_same_text() {
        let a = Document::from_text("Acme builds rockets.");
        let b = Document::from_text("Acme builds rockets.");
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 32);
    }

    #[test]
    fn paragraph_breaks_ignore_surrounding_whitespace() {
        let doc = Document::new("d1", "One line.\nStill the same paragraph.\n\n");
        let whole = Chunk::new(0, &doc, (0, doc.len()), 0, None);
        assert!(!whole.has_paragraph_break());

        let doc = Document::new("d2", "First paragraph.\r\n\r\nSecond paragraph.");
        let whole = Chunk::new(0, &doc, (0, doc.len()), 0, None);
        assert!(whole.has_paragraph_break());
    }

    #[test]
    fn chunk_text_matches_span() {
        let doc = Document::new("d1", "Hello world. Bye now.");
        let chunk = Chunk::new(0, &doc, (6, 12), 0, None);
        assert_eq!(chunk.text, "world.");
        assert_eq!(chunk.span_len(), 6);
    }

    #[test]
    fn whitespace_only_document_is_empty() {
        assert!(Document::new("d", "  \n\t ").is_empty());
        assert!(!Document::new("d", "x").is_empty());
    }
}
