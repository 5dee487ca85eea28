//! Content-derived cache keys.

use sha2::{Digest, Sha256};

/// Separator between key parts. Never produced by `normalize_whitespace`.
const PART_SEPARATOR: u8 = 0x1f;

/// Derive a cache key from the semantic input.
///
/// Parts are hashed in order, so `["a", "bc"]` and `["ab", "c"]` differ.
pub fn cache_key<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut hasher = Sha256::new();
    for (i, part) in parts.into_iter().enumerate() {
        if i > 0 {
            hasher.update([PART_SEPARATOR]);
        }
        hasher.update(part.as_ref().as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// Collapse runs of whitespace and trim the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
