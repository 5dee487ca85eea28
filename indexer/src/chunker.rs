//! Splitting file content into embeddable chunks.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::Result;

/// A piece of a file to embed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Text sent to the embedding provider.
    pub text: String,

    /// Chunk metadata (line span, symbol, ...), stored with the vector.
    pub metadata: serde_json::Value,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(text: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }
}

/// Splits file content into ordered chunks.
///
/// AST-aware chunkers live outside this crate and plug in here.
pub trait Chunker: Send + Sync {
    /// Chunk `content` read from `path`.
    fn chunk(&self, path: &str, content: &str) -> Result<Vec<Chunk>>;
}

/// Fixed-size windows of lines with overlap.
#[derive(Debug, Clone)]
pub struct LineChunker {
    max_lines: usize,
    overlap: usize,
}

impl LineChunker {
    /// Create a chunker with windows of `max_lines` overlapping by `overlap`.
    pub fn new(max_lines: usize, overlap: usize) -> Self {
        let max_lines = max_lines.max(1);
        Self {
            max_lines,
            overlap: overlap.min(max_lines - 1),
        }
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::new(40, 5)
    }
}

impl Chunker for LineChunker {
    fn chunk(&self, path: &str, content: &str) -> Result<Vec<Chunk>> {
        let lines: Vec<&str> = content.lines().collect();
        let step = self.max_lines - self.overlap;
        let mut chunks = Vec::new();

        let mut start = 0;
        while start < lines.len() {
            let end = (start + self.max_lines).min(lines.len());
            let window = &lines[start..end];

            if window.iter().any(|l| !l.trim().is_empty()) {
                chunks.push(Chunk::new(
                    window.join("\n"),
                    json!({
                        "path": path,
                        "start_line": start + 1,
                        "end_line": end,
                    }),
                ));
            }

            if end == lines.len() {
                break;
            }
            start += step;
        }

        Ok(chunks)
    }
}
