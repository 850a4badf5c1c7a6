use unicode_segmentation::UnicodeSegmentation;

use crate::chunk::{Chunk, Document, Span};
use crate::ChunkError;

#[derive(Debug, Clone, Default)]
pub struct ChunkerConfig {
    /// Maximum number of bytes a chunk may reach back into its predecessor
    pub overlap_chars: usize,
}

/// Splits documents (or sub-spans of them) into sentence-respecting chunks
/// whose spans tile the covered text.
pub struct Chunker {
    config: ChunkerConfig,
}

impl Default for Chunker {
    fn default() -> Self {
        Self::new(ChunkerConfig::default())
    }
}

impl Chunker {
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Split a whole document into roughly `target_chunk_count` depth-0 chunks
    /// indexed `0..N`.
    pub fn split(
        &self,
        document: &Document,
        target_chunk_count: usize,
        respect_sentences: bool,
    ) -> Result<Vec<Chunk>, ChunkError> {
        if document.is_empty() {
            return Err(ChunkError::EmptyDocument);
        }

        self.split_span(
            document,
            (0, document.len()),
            target_chunk_count,
            respect_sentences,
            0,
            None,
            0,
        )
    }

    /// Split `span` of `document` into child chunks at `depth`, numbering
    /// them from `first_index`.
    #[allow(clippy::too_many_arguments)]
    pub fn split_span(
        &self,
        document: &Document,
        span: Span,
        target_chunk_count: usize,
        respect_sentences: bool,
        depth: usize,
        parent_index: Option<usize>,
        first_index: usize,
    ) -> Result<Vec<Chunk>, ChunkError> {
        let text = document.slice(span);
        if text.trim().is_empty() {
            return Err(ChunkError::EmptyDocument);
        }

        let target_size = text.len().div_ceil(target_chunk_count.max(1)).max(1);

        let pieces = if respect_sentences {
            self.pack_sentences(text, target_size)
        } else {
            self.hard_split(text, 0, text.len(), target_size)
        };

        let pieces = self.apply_overlap(text, pieces);

        Ok(pieces
            .into_iter()
            .enumerate()
            .map(|(i, (start, end))| {
                Chunk::new(
                    first_index + i,
                    document,
                    (span.0 + start, span.0 + end),
                    depth,
                    parent_index,
                )
            })
            .collect())
    }

    /// Greedily pack whole sentences up to `target_size` bytes
    fn pack_sentences(&self, text: &str, target_size: usize) -> Vec<Span> {
        let mut pieces = Vec::new();
        let mut current_start = 0;
        let mut current_end = 0;

        for (offset, sentence) in text.split_sentence_bound_indices() {
            let sentence_end = offset + sentence.len();

            // A single oversized sentence degrades to character-limit splitting
            if sentence.len() > target_size {
                if current_end > current_start {
                    pieces.push((current_start, current_end));
                }
                pieces.extend(self.hard_split(text, offset, sentence_end, target_size));
                current_start = sentence_end;
                current_end = sentence_end;
                continue;
            }

            if current_end > current_start && sentence_end - current_start > target_size {
                pieces.push((current_start, current_end));
                current_start = offset;
            }
            current_end = sentence_end;
        }

        if current_end > current_start {
            pieces.push((current_start, current_end));
        }

        pieces
    }

    /// Split `text[start..end]` on a byte limit, preferring to cut after whitespace
    fn hard_split(&self, text: &str, start: usize, end: usize, target_size: usize) -> Vec<Span> {
        let mut pieces = Vec::new();
        let mut cursor = start;

        while cursor < end {
            if end - cursor <= target_size {
                pieces.push((cursor, end));
                break;
            }

            let mut limit = cursor + target_size;
            while limit > cursor && !text.is_char_boundary(limit) {
                limit -= 1;
            }
            if limit == cursor {
                // Target smaller than one character: take the whole character
                limit = cursor + 1;
                while !text.is_char_boundary(limit) {
                    limit += 1;
                }
            }

            let cut = text[cursor..limit]
                .char_indices()
                .rev()
                .find(|(_, c)| c.is_whitespace())
                .map(|(i, c)| cursor + i + c.len_utf8())
                .filter(|&cut| cut > cursor)
                .unwrap_or(limit);

            pieces.push((cursor, cut));
            cursor = cut;
        }

        pieces
    }

    fn apply_overlap(&self, text: &str, pieces: Vec<Span>) -> Vec<Span> {
        if self.config.overlap_chars == 0 {
            return pieces;
        }

        let mut out: Vec<Span> = Vec::with_capacity(pieces.len());
        for (start, end) in pieces {
            let start = match out.last() {
                Some(&(prev_start, _)) => {
                    let mut s = start
                        .saturating_sub(self.config.overlap_chars)
                        .max(prev_start + 1);
                    while !text.is_char_boundary(s) {
                        s += 1;
                    }
                    s.min(start)
                }
                None => start,
            };
            out.push((start, end));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_tiles(doc: &Document, chunks: &[Chunk], overlap: usize) {
        assert!(!chunks.is_empty());
        assert_eq!(chunks[0].span.0, 0);
        assert_eq!(chunks.last().map(|c| c.span.1), Some(doc.len()));
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            assert!(next.span.0 <= prev.span.1, "gap between chunks");
            assert!(prev.span.1 - next.span.0 <= overlap, "overlap too large");
        }
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.text, doc.slice(chunk.span));
        }
    }

    #[test]
    fn test_basic_chunking() {
        let chunker = Chunker::default();
        let doc = Document::new("test-doc", "This is a test paragraph.\n\nThis is another paragraph.");
        let chunks = chunker.split(&doc, 2, true).unwrap();

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].depth, 0);
        assert_eq!(chunks[0].parent_index, None);
        assert_tiles(&doc, &chunks, 0);
    }

    #[test]
    fn empty_document_is_rejected() {
        let chunker = Chunker::default();
        let doc = Document::new("empty", "   \n ");
        assert!(matches!(chunker.split(&doc, 4, true), Err(ChunkError::EmptyDocument)));
    }

    #[test]
    fn never_splits_inside_a_sentence_when_sentences_fit() {
        let text = "Rust is fast. Rust is safe. Cargo builds crates. Tokio runs tasks. Serde parses data.";
        let doc = Document::new("d", text);
        let chunks = Chunker::default().split(&doc, 3, true).unwrap();

        assert_tiles(&doc, &chunks, 0);
        for chunk in &chunks {
            assert!(chunk.text.trim_end().ends_with('.'), "cut mid-sentence: {:?}", chunk.text);
        }
    }

    #[test]
    fn oversized_sentence_falls_back_to_char_limit() {
        let long = "word ".repeat(100);
        let text = format!("Short one. {}end.", long);
        let doc = Document::new("d", text);
        let chunks = Chunker::default().split(&doc, 10, true).unwrap();

        assert!(chunks.len() >= 10);
        assert_tiles(&doc, &chunks, 0);
    }

    #[test]
    fn tiling_holds_without_sentence_respect_and_multibyte_text() {
        let text = "Überall süße Früchte – naïve café. ".repeat(20);
        let doc = Document::new("d", text);
        for target in [1, 3, 7, 50] {
            let chunks = Chunker::default().split(&doc, target, false).unwrap();
            assert_tiles(&doc, &chunks, 0);
        }
    }

    #[test]
    fn overlap_is_bounded() {
        let text = "One sentence here. Two sentence here. Three sentence here. Four sentence here.";
        let doc = Document::new("d", text);
        let chunker = Chunker::new(ChunkerConfig { overlap_chars: 5 });
        let chunks = chunker.split(&doc, 4, true).unwrap();

        assert_tiles(&doc, &chunks, 5);
        assert!(chunks.windows(2).any(|w| w[1].span.0 < w[0].span.1));
    }

    #[test]
    fn split_span_numbers_children_from_first_index() {
        let text = "Alpha beta. Gamma delta. Epsilon zeta.";
        let doc = Document::new("d", text);
        let parent = Chunk::new(3, &doc, (12, text.len()), 0, None);
        let children = Chunker::default()
            .split_span(&doc, parent.span, 2, true, 1, Some(parent.index), 10)
            .unwrap();

        assert_eq!(children.len(), 2);
        assert_eq!(children[0].index, 10);
        assert_eq!(children[1].index, 11);
        for child in &children {
            assert_eq!(child.depth, 1);
            assert_eq!(child.parent_index, Some(3));
            assert!(child.is_strictly_within(&parent));
        }
        assert_eq!(children[0].span.0, parent.span.0);
        assert_eq!(children[1].span.1, parent.span.1);
    }
}
