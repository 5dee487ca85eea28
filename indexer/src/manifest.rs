//! Durable record of what has been indexed for each path.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::debug;

use crate::error::Result;

/// Content fingerprint: hex SHA-256 of the file content.
pub fn fingerprint(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Metadata used to filter search results.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Author of the file.
    #[serde(default)]
    pub author: Option<String>,

    /// When the file was last modified.
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,

    /// Complexity score.
    #[serde(default)]
    pub complexity_score: Option<f64>,
}

impl FileMetadata {
    /// Set the author.
    pub fn with_author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the modification time.
    pub fn with_modified_at(mut self, modified_at: DateTime<Utc>) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Set the complexity score.
    pub fn with_complexity(mut self, score: f64) -> Self {
        self.complexity_score = Some(score);
        self
    }
}

/// Manifest entry for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path of the file; unique within a manifest.
    pub path: String,

    /// Fingerprint of the content that was indexed.
    pub fingerprint: String,

    /// Ids of the vectors this file produced.
    pub vector_ids: BTreeSet<String>,

    /// When the file was last indexed.
    pub last_indexed_at: DateTime<Utc>,

    /// File metadata.
    pub metadata: FileMetadata,
}

/// Mapping from path to [`FileRecord`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexManifest {
    files: HashMap<String, FileRecord>,
}

impl IndexManifest {
    /// Create an empty manifest.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a path.
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.files.get(path)
    }

    /// Insert or replace the record for its path.
    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.files.insert(record.path.clone(), record)
    }

    /// Remove a path.
    pub fn remove(&mut self, path: &str) -> Option<FileRecord> {
        self.files.remove(path)
    }

    /// Replace the metadata of an existing record.
    pub fn update_metadata(&mut self, path: &str, metadata: FileMetadata) -> bool {
        match self.files.get_mut(path) {
            Some(record) => {
                record.metadata = metadata;
                true
            }
            None => false,
        }
    }

    /// Check if a path is present.
    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    /// Number of files.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// Check if the manifest is empty.
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// All paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.files.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Iterate over records.
    pub fn records(&self) -> impl Iterator<Item = &FileRecord> {
        self.files.values()
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

}

/// Write to a temp file next to `path`, then rename over it.
pub(crate) async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents).await?;
    fs::rename(&temp_path, path).await?;
    debug!("Wrote {path:?}");
    Ok(())
}
