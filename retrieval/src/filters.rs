//! Metadata filters applied after vector search.

use chrono::{DateTime, SecondsFormat, Utc};
use codelens_indexer::FileMetadata;
use serde::{Deserialize, Serialize};

/// Inclusive complexity-score range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexityRange {
    pub min: f64,
    pub max: f64,
}

impl ComplexityRange {
    /// Create a range; bounds are swapped if given in reverse.
    pub fn new(min: f64, max: f64) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// Whether `score` lies within the range, bounds included.
    pub fn contains(&self, score: f64) -> bool {
        (self.min..=self.max).contains(&score)
    }
}

/// Filters a candidate must pass to be returned.
///
/// Filters only admit or drop candidates; they never change scores. A
/// candidate whose file lacks the field an active filter needs is dropped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Case-insensitive substring of the file author.
    pub author: Option<String>,

    /// Keep files modified at or after this time.
    pub modified_since: Option<DateTime<Utc>>,

    /// Keep files whose complexity score lies in this range.
    pub complexity: Option<ComplexityRange>,
}

impl SearchFilters {
    /// No filters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Filter by modification recency.
    pub fn with_modified_since(mut self, since: DateTime<Utc>) -> Self {
        self.modified_since = Some(since);
        self
    }

    /// Filter by complexity score.
    pub fn with_complexity(mut self, min: f64, max: f64) -> Self {
        self.complexity = Some(ComplexityRange::new(min, max));
        self
    }

    /// Whether no filter is active.
    pub fn is_empty(&self) -> bool {
        self.author.is_none() && self.modified_since.is_none() && self.complexity.is_none()
    }

    /// Whether a file with `metadata` passes every active filter.
    pub fn admits(&self, metadata: &FileMetadata) -> bool {
        if let Some(wanted) = &self.author {
            let Some(author) = &metadata.author else {
                return false;
            };
            if !author.to_lowercase().contains(&wanted.to_lowercase()) {
                return false;
            }
        }

        if let Some(since) = self.modified_since {
            match metadata.modified_at {
                Some(modified) if modified >= since => {}
                _ => return false,
            }
        }

        if let Some(range) = self.complexity {
            match metadata.complexity_score {
                Some(score) if range.contains(score) => {}
                _ => return false,
            }
        }

        true
    }

    /// Canonical encoding of the active filters, for cache keys.
    ///
    /// Filters that admit the same candidates encode identically, and
    /// different filters never collide.
    pub fn cache_fragment(&self) -> String {
        let author = self
            .author
            .as_ref()
            .map_or_else(|| "*".to_string(), |a| format!("{:?}", a.to_lowercase()));
        let since = self.modified_since.map_or_else(
            || "*".to_string(),
            |t| t.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        let complexity = self
            .complexity
            .map_or_else(|| "*".to_string(), |r| format!("{:?}..={:?}", r.min, r.max));
        format!("author={author};since={since};complexity={complexity}")
    }
}
