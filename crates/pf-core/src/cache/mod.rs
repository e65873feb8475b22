//! Result cache / artifact store
//!
//! Maps an [`ArtifactKey`] to a shared, immutable [`ExportArtifact`].
//! Entries are evicted least-recently-used once the byte budget is exceeded,
//! or dropped when older than the configured max age. Readers hold an `Arc`,
//! so eviction never invalidates an artifact that is being read.

mod disk;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::export::ExportArtifact;
use crate::request::ArtifactKey;

pub use disk::DiskStore;

/// Cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Total payload bytes kept in memory
    pub max_bytes: usize,
    /// Entries older than this are dropped on access
    pub max_age_secs: Option<u64>,
    /// Optional on-disk tier
    pub directory: Option<PathBuf>,
    /// Total bytes kept by the on-disk tier; oldest files go first
    pub disk_max_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
            max_age_secs: Some(3600),
            directory: None,
            disk_max_bytes: Some(1024 * 1024 * 1024),
        }
    }
}

impl CacheConfig {
    pub fn max_age(&self) -> Option<Duration> {
        self.max_age_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(String),
}

/// Point-in-time cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    artifact: Arc<ExportArtifact>,
    inserted: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<ArtifactKey, Entry>,
    bytes: usize,
    clock: u64,
    stats: CacheStats,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &ArtifactKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes -= entry.artifact.len();
        }
    }

    /// Evict least recently used entries until the budget holds, sparing `keep`
    fn evict_to(&mut self, budget: usize, keep: &ArtifactKey) {
        while self.bytes > budget {
            let victim = self
                .entries
                .iter()
                .filter(|(key, _)| *key != keep)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else { break };
            tracing::debug!(key = %victim, "evicting cached artifact");
            self.remove(&victim);
            self.stats.evictions += 1;
        }
    }
}

/// Thread-safe artifact cache
pub struct ArtifactCache {
    inner: Mutex<Inner>,
    max_bytes: usize,
    max_age: Option<Duration>,
    disk: Option<DiskStore>,
}

impl ArtifactCache {
    /// Memory-only cache
    pub fn new(max_bytes: usize, max_age: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_bytes,
            max_age,
            disk: None,
        }
    }

    /// Cache as configured, opening the disk tier when a directory is set
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut cache = Self::new(config.max_bytes, config.max_age());
        if let Some(dir) = &config.directory {
            cache.disk = Some(DiskStore::open(dir, config.max_age(), config.disk_max_bytes)?);
        }
        Ok(cache)
    }

    fn expired(&self, entry: &Entry) -> bool {
        self.max_age
            .is_some_and(|age| entry.inserted.elapsed() > age)
    }

    fn get_memory(&self, key: &ArtifactKey) -> Option<Arc<ExportArtifact>> {
        let mut inner = self.inner.lock();
        let expired = inner.entries.get(key).map(|entry| self.expired(entry));
        match expired {
            Some(false) => {
                let now = inner.tick();
                inner.stats.hits += 1;
                inner.entries.get_mut(key).map(|entry| {
                    entry.last_used = now;
                    entry.artifact.clone()
                })
            }
            Some(true) => {
                tracing::debug!(key = %key, "cached artifact expired");
                inner.remove(key);
                inner.stats.misses += 1;
                None
            }
            None => {
                inner.stats.misses += 1;
                None
            }
        }
    }

    /// Look up an artifact, falling back to the disk tier
    pub fn get(&self, key: &ArtifactKey) -> Option<Arc<ExportArtifact>> {
        if let Some(artifact) = self.get_memory(key) {
            return Some(artifact);
        }
        let disk = self.disk.as_ref()?;
        match disk.load(key) {
            Ok(Some(artifact)) => {
                tracing::debug!(key = %key, "promoting artifact from disk");
                Some(self.insert_memory(artifact))
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(key = %key, %error, "disk cache read failed");
                None
            }
        }
    }

    /// Store an artifact; an existing entry for the same key wins
    ///
    /// Returns the stored artifact, which is the earlier one when the key was
    /// already present. An artifact larger than the whole budget is returned
    /// without being kept in memory.
    pub fn put(&self, artifact: ExportArtifact) -> Arc<ExportArtifact> {
        let stored = self.insert_memory(artifact);
        if let Some(disk) = &self.disk {
            if let Err(error) = disk.store(&stored) {
                tracing::warn!(key = %stored.key, %error, "disk cache write failed");
            }
        }
        stored
    }

    fn insert_memory(&self, artifact: ExportArtifact) -> Arc<ExportArtifact> {
        let mut inner = self.inner.lock();

        let live = inner
            .entries
            .get(&artifact.key)
            .filter(|entry| !self.expired(entry))
            .map(|entry| entry.artifact.clone());
        if let Some(existing) = live {
            return existing;
        }
        inner.remove(&artifact.key);

        let artifact = Arc::new(artifact);
        if artifact.len() > self.max_bytes {
            tracing::debug!(
                key = %artifact.key,
                bytes = artifact.len(),
                budget = self.max_bytes,
                "artifact exceeds cache budget, not retained"
            );
            return artifact;
        }

        let now = inner.tick();
        inner.bytes += artifact.len();
        inner.entries.insert(
            artifact.key.clone(),
            Entry {
                artifact: artifact.clone(),
                inserted: Instant::now(),
                last_used: now,
            },
        );
        inner.evict_to(self.max_bytes, &artifact.key);
        artifact
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.entries.len(),
            bytes: inner.bytes,
            ..inner.stats
        }
    }

    /// Drop every in-memory entry
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.bytes = 0;
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("max_bytes", &self.max_bytes)
            .field("max_age", &self.max_age)
            .field("disk", &self.disk)
            .field("stats", &self.stats())
            .finish()
    }
}

static GLOBAL: RwLock<Option<Arc<ArtifactCache>>> = parking_lot::const_rwlock(None);

/// Install the process-wide cache, replacing any previous one
pub fn init_global(config: &CacheConfig) -> Result<Arc<ArtifactCache>, CacheError> {
    let cache = Arc::new(ArtifactCache::from_config(config)?);
    *GLOBAL.write() = Some(cache.clone());
    tracing::info!(
        max_bytes = config.max_bytes,
        disk = config.directory.is_some(),
        "artifact cache initialized"
    );
    Ok(cache)
}

/// The process-wide cache, if initialized
pub fn global() -> Option<Arc<ArtifactCache>> {
    GLOBAL.read().clone()
}

/// Tear down the process-wide cache
pub fn shutdown_global() {
    if let Some(cache) = GLOBAL.write().take() {
        let stats = cache.stats();
        cache.clear();
        tracing::info!(
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            "artifact cache shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{ExportFormat, ExportOptions};
    use crate::request::{Fingerprint, parse_request};

    fn fingerprint(seed: u32) -> Fingerprint {
        let request = format!(r#"{{"operations": [{{"id": "a", "op": "sphere", "radius": {}}}]}}"#, seed);
        parse_request(&request).unwrap().fingerprint().clone()
    }

    fn artifact(seed: u32, len: usize) -> ExportArtifact {
        let key = ArtifactKey::new(&fingerprint(seed), ExportFormat::Stl, &ExportOptions::default());
        ExportArtifact::new(key, vec![seed as u8; len])
    }

    #[test]
    fn test_put_then_get_returns_same_bytes() {
        let cache = ArtifactCache::new(1024, None);
        let stored = cache.put(artifact(1, 10));
        let fetched = cache.get(&stored.key).unwrap();
        assert_eq!(fetched.bytes(), &[1u8; 10]);
        assert!(Arc::ptr_eq(&stored, &fetched));
        assert_eq!(cache.stats().hits, 1);
    }

    #[test]
    fn test_put_is_idempotent() {
        let cache = ArtifactCache::new(1024, None);
        let first = cache.put(artifact(1, 10));

        let key = artifact(1, 10).key;
        let kept = cache.put(ExportArtifact::new(key, vec![9; 10]));

        assert!(Arc::ptr_eq(&first, &kept));
        assert_eq!(kept.bytes(), &[1u8; 10]);
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, 10);
    }

    #[test]
    fn test_concurrent_puts_share_one_entry() {
        let cache = ArtifactCache::new(1024, None);
        let barrier = std::sync::Barrier::new(8);

        let stored: Vec<Arc<ExportArtifact>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u8)
                .map(|i| {
                    let (cache, barrier) = (&cache, &barrier);
                    scope.spawn(move || {
                        let key = artifact(1, 10).key;
                        barrier.wait();
                        cache.put(ExportArtifact::new(key, vec![i; 10]))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for other in &stored[1..] {
            assert!(Arc::ptr_eq(&stored[0], other));
        }
        assert_eq!(cache.stats().entries, 1);
        assert_eq!(cache.stats().bytes, 10);
    }

    #[test]
    fn test_lru_eviction_by_budget() {
        let cache = ArtifactCache::new(25, None);
        let a = cache.put(artifact(1, 10)).key.clone();
        let b = cache.put(artifact(2, 10)).key.clone();
        // Touch `a` so `b` becomes least recently used
        assert!(cache.get(&a).is_some());
        let c = cache.put(artifact(3, 10)).key.clone();

        assert!(cache.get(&a).is_some());
        assert!(cache.get(&b).is_none());
        assert!(cache.get(&c).is_some());
        let stats = cache.stats();
        assert_eq!(stats.bytes, 20);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_eviction_keeps_readers_valid() {
        let cache = ArtifactCache::new(10, None);
        let held = cache.put(artifact(1, 10));
        cache.put(artifact(2, 10));

        assert!(cache.get(&held.key).is_none());
        assert_eq!(held.bytes(), &[1u8; 10]);
    }

    #[test]
    fn test_oversized_artifact_not_retained() {
        let cache = ArtifactCache::new(5, None);
        let big = cache.put(artifact(1, 10));
        assert_eq!(big.len(), 10);
        assert!(cache.get(&big.key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_expired_entries_dropped() {
        let cache = ArtifactCache::new(1024, Some(Duration::ZERO));
        let stored = cache.put(artifact(1, 10));
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(&stored.key).is_none());
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn test_disk_tier_promotes_on_miss() {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig {
            max_bytes: 1024,
            max_age_secs: None,
            directory: Some(dir.path().to_path_buf()),
            disk_max_bytes: None,
        };

        let key = {
            let cache = ArtifactCache::from_config(&config).unwrap();
            cache.put(artifact(7, 16)).key.clone()
        };

        let reopened = ArtifactCache::from_config(&config).unwrap();
        let fetched = reopened.get(&key).unwrap();
        assert_eq!(fetched.bytes(), &[7u8; 16]);
        assert_eq!(reopened.stats().entries, 1);
    }

    #[test]
    fn test_global_lifecycle() {
        init_global(&CacheConfig::default()).unwrap();
        let cache = global().unwrap();
        let stored = cache.put(artifact(4, 4));
        assert!(global().unwrap().get(&stored.key).is_some());

        shutdown_global();
        assert!(global().is_none());
        // Holders keep their artifact
        assert_eq!(stored.len(), 4);
    }
}
