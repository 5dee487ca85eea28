//! Namespaced TTL cache store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// Default lifetime of a cached query result.
pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default lifetime of a cached embedding.
pub const DEFAULT_EMBEDDING_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Cache namespace. Each namespace has its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Namespace {
    /// Final ranked search results.
    Query,
    /// Embedding vectors keyed by text hash.
    Embedding,
}

impl Namespace {
    /// Every namespace, in a stable order.
    pub const ALL: [Namespace; 2] = [Namespace::Query, Namespace::Embedding];
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Namespace::Query => f.write_str("query"),
            Namespace::Embedding => f.write_str("embedding"),
        }
    }
}

/// A cached value with its expiry information.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Content-derived key.
    pub key: String,

    /// Opaque cached bytes.
    pub value: Vec<u8>,

    /// When the entry was written.
    pub created_at: DateTime<Utc>,

    /// How long the entry stays visible.
    pub ttl: Duration,

    /// Namespace the entry belongs to.
    pub namespace: Namespace,
}

impl CacheEntry {
    /// Whether a reader at `now` may observe this entry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        // A clock that went backwards counts as no time elapsed.
        let elapsed = now
            .signed_duration_since(self.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed < self.ttl
    }
}

/// Options controlling cache behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheOptions {
    /// When false every lookup misses and nothing is stored.
    pub enabled: bool,

    /// Lifetime of query-result entries.
    pub query_ttl: Duration,

    /// Lifetime of embedding entries.
    pub embedding_ttl: Duration,
}

impl CacheOptions {
    /// TTL configured for a namespace.
    pub fn ttl(&self, namespace: Namespace) -> Duration {
        match namespace {
            Namespace::Query => self.query_ttl,
            Namespace::Embedding => self.embedding_ttl,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            query_ttl: DEFAULT_QUERY_TTL,
            embedding_ttl: DEFAULT_EMBEDDING_TTL,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

/// Cache of opaque values partitioned by namespace.
///
/// Entries are sharded across a concurrent map, so readers and writers on
/// disjoint keys do not contend. Expiry is checked lazily on every read; an
/// expired entry is reported as a miss and removed on the spot.
pub struct CacheStore {
    /// Entries keyed by namespace and content key.
    entries: DashMap<(Namespace, String), CacheEntry>,

    /// TTLs and the enabled flag.
    options: CacheOptions,

    /// Time source for expiry.
    clock: Arc<dyn Clock>,

    /// Counters for the query namespace.
    query_counters: Counters,

    /// Counters for the embedding namespace.
    embedding_counters: Counters,

    /// Path for snapshot persistence.
    snapshot_path: Option<PathBuf>,
}

impl CacheStore {
    /// Create an in-memory cache.
    pub fn new(options: CacheOptions) -> Self {
        Self {
            entries: DashMap::new(),
            options,
            clock: Arc::new(SystemClock),
            query_counters: Counters::default(),
            embedding_counters: Counters::default(),
            snapshot_path: None,
        }
    }

    /// Create a cache backed by a snapshot file, loading it if present.
    pub async fn with_persistence(path: impl AsRef<Path>, options: CacheOptions) -> Result<Self> {
        let mut store = Self::new(options);
        store.snapshot_path = Some(path.as_ref().to_path_buf());
        store.load().await?;
        Ok(store)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The active options.
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// Whether the cache stores anything at all.
    pub fn is_enabled(&self) -> bool {
        self.options.enabled
    }

    fn counters(&self, namespace: Namespace) -> &Counters {
        match namespace {
            Namespace::Query => &self.query_counters,
            Namespace::Embedding => &self.embedding_counters,
        }
    }

    /// Look up a value. Expired and absent entries are both misses.
    pub fn get(&self, namespace: Namespace, key: &str) -> Option<Vec<u8>> {
        let counters = self.counters(namespace);
        if !self.options.enabled {
            counters.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let now = self.clock.now();
        let map_key = (namespace, key.to_string());

        // The read guard must be released before `remove_if` touches the shard.
        let lookup = self.entries.get(&map_key).map(|entry| {
            if entry.is_live(now) {
                Some(entry.value.clone())
            } else {
                None
            }
        });

        match lookup {
            Some(Some(value)) => {
                counters.hits.fetch_add(1, Ordering::Relaxed);
                debug!("Cache hit ({namespace})");
                Some(value)
            }
            Some(None) => {
                // Only remove if no writer refreshed it in the meantime.
                self.entries
                    .remove_if(&map_key, |_, entry| !entry.is_live(now));
                counters.expired.fetch_add(1, Ordering::Relaxed);
                counters.misses.fetch_add(1, Ordering::Relaxed);
                debug!("Cache entry expired ({namespace})");
                None
            }
            None => {
                counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a value with the namespace's TTL.
    pub fn set(&self, namespace: Namespace, key: &str, value: Vec<u8>) {
        self.set_with_ttl(namespace, key, value, self.options.ttl(namespace));
    }

    /// Store a value with an explicit TTL. A zero TTL stores nothing.
    pub fn set_with_ttl(&self, namespace: Namespace, key: &str, value: Vec<u8>, ttl: Duration) {
        if !self.options.enabled || ttl.is_zero() {
            return;
        }

        let entry = CacheEntry {
            key: key.to_string(),
            value,
            created_at: self.clock.now(),
            ttl,
            namespace,
        };
        self.entries.insert((namespace, key.to_string()), entry);
    }

    /// Look up and decode a JSON value. Undecodable entries are dropped.
    pub fn get_json<T: DeserializeOwned>(&self, namespace: Namespace, key: &str) -> Option<T> {
        let bytes = self.get(namespace, key)?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("Dropping undecodable {namespace} cache entry: {e}");
                self.entries.remove(&(namespace, key.to_string()));
                None
            }
        }
    }

    /// Encode a value as JSON and store it.
    pub fn set_json<T: Serialize>(&self, namespace: Namespace, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, bytes);
        Ok(())
    }

    /// Remove every entry in a namespace, or everything when `None`.
    ///
    /// Returns the number of entries removed.
    pub fn clear(&self, namespace: Option<Namespace>) -> usize {
        let before = self.entries.len();
        match namespace {
            Some(ns) => self.entries.retain(|(entry_ns, _), _| *entry_ns != ns),
            None => self.entries.clear(),
        }
        let removed = before.saturating_sub(self.entries.len());

        match namespace {
            Some(ns) => info!("Cleared {removed} {ns} cache entries"),
            None => info!("Cleared {removed} cache entries"),
        }
        removed
    }

    /// Physically remove expired entries. Reads never depend on this.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {removed} expired cache entries");
        }
        removed
    }

    /// Run `sweep_expired` on a fixed interval until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                store.sweep_expired();
            }
        })
    }

    /// Get cache statistics.
    pub fn stats(&self) -> CacheStats {
        let namespaces = Namespace::ALL
            .iter()
            .map(|&namespace| {
                let counters = self.counters(namespace);
                NamespaceStats {
                    namespace,
                    entries: self
                        .entries
                        .iter()
                        .filter(|e| e.key().0 == namespace)
                        .count(),
                    ttl: self.options.ttl(namespace),
                    hits: counters.hits.load(Ordering::Relaxed),
                    misses: counters.misses.load(Ordering::Relaxed),
                    expired: counters.expired.load(Ordering::Relaxed),
                }
            })
            .collect();

        CacheStats {
            enabled: self.options.enabled,
            namespaces,
        }
    }

    /// Write live entries to the snapshot file, if persistence is enabled.
    pub async fn flush(&self) -> Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };

        let now = self.clock.now();
        let entries: Vec<CacheEntry> = self
            .entries
            .iter()
            .filter(|e| e.value().is_live(now))
            .map(|e| e.value().clone())
            .collect();
        let content = serde_json::to_vec(&entries)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write atomically using a temp file
        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, content).await?;
        fs::rename(&temp_path, path).await?;

        debug!("Saved {} cache entries to disk", entries.len());
        Ok(())
    }

    /// Load live entries from the snapshot file.
    async fn load(&self) -> Result<()> {
        let Some(ref path) = self.snapshot_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let content = fs::read(path).await?;
        // The next flush overwrites a damaged snapshot.
        let entries: Vec<CacheEntry> = match serde_json::from_slice(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Ignoring unreadable cache snapshot {}: {e}", path.display());
                return Ok(());
            }
        };

        let now = self.clock.now();
        let mut loaded = 0usize;
        for entry in entries.into_iter().filter(|e| e.is_live(now)) {
            self.entries.insert((entry.namespace, entry.key.clone()), entry);
            loaded += 1;
        }

        info!("Loaded {loaded} cache entries from disk");
        Ok(())
    }
}

/// Statistics for one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceStats {
    /// The namespace.
    pub namespace: Namespace,

    /// Entries physically present (may include not-yet-swept expired ones).
    pub entries: usize,

    /// Configured TTL.
    pub ttl: Duration,

    /// Reads that returned a value.
    pub hits: u64,

    /// Reads that returned nothing.
    pub misses: u64,

    /// Misses caused by expiry.
    pub expired: u64,
}

/// Statistics about the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Whether caching is enabled.
    pub enabled: bool,

    /// Per-namespace counters.
    pub namespaces: Vec<NamespaceStats>,
}

impl CacheStats {
    /// Stats for one namespace.
    pub fn namespace(&self, namespace: Namespace) -> Option<&NamespaceStats> {
        self.namespaces.iter().find(|s| s.namespace == namespace)
    }

    /// Total hits across namespaces.
    pub fn hits(&self) -> u64 {
        self.namespaces.iter().map(|s| s.hits).sum()
    }

    /// Total misses across namespaces.
    pub fn misses(&self) -> u64 {
        self.namespaces.iter().map(|s| s.misses).sum()
    }
}
