//! Cache in front of an [`Embedder`].
//!
//! Entries are keyed by model, dimension and the SHA-256 of the embedded
//! text. The memory level is an LRU bounded by entry count. The optional
//! disk level keeps one JSON file per embedding under
//! `<cache dir>/clindex_embeddings/` and is bounded by total bytes. Both
//! levels reject entries older than `ttl_secs`.
//!
//! When a level overflows it is trimmed to three quarters of its limit:
//! least recently used entries first in memory, oldest files first on disk.

use super::embedding::{Embedder, create_embedder};
use super::types::EmbedError;
use crate::config::{EmbeddingCacheConfig, Settings};
use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Name of the directory holding on-disk embeddings.
pub const EMBEDDING_CACHE_DIR_NAME: &str = "clindex_embeddings";

const ENTRY_EXTENSION: &str = "emb";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingCacheStats {
    pub requests: u64,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl EmbeddingCacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            (self.memory_hits + self.disk_hits) as f64 / self.requests as f64
        }
    }
}

#[derive(Debug)]
struct MemoryEntry {
    vector: Vec<f32>,
    created: Instant,
    tick: u64,
}

#[derive(Debug, Default)]
struct Memory {
    entries: HashMap<String, MemoryEntry>,
    /// Keys by the tick of their last access
    recency: BTreeMap<u64, String>,
    tick: u64,
}

impl Memory {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn get(&mut self, key: &str, ttl: Duration) -> Option<Vec<f32>> {
        let (created, old_tick) = self.entries.get(key).map(|e| (e.created, e.tick))?;
        if created.elapsed() >= ttl {
            self.remove(key);
            return None;
        }
        let tick = self.next_tick();
        self.recency.remove(&old_tick);
        self.recency.insert(tick, key.to_string());
        let entry = self.entries.get_mut(key)?;
        entry.tick = tick;
        Some(entry.vector.clone())
    }

    fn insert(&mut self, key: String, vector: Vec<f32>) {
        self.remove(&key);
        let tick = self.next_tick();
        self.recency.insert(tick, key.clone());
        self.entries.insert(
            key,
            MemoryEntry {
                vector,
                created: Instant::now(),
                tick,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.tick);
        }
    }

    /// Drop least recently used entries until at most `target` remain.
    fn shrink_to(&mut self, target: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > target {
            let Some((_, key)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }

    fn bytes(&self) -> u64 {
        self.entries
            .values()
            .map(|e| (e.vector.len() * std::mem::size_of::<f32>()) as u64)
            .sum()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DiskEntry {
    key: String,
    created_at: DateTime<Utc>,
    embedding: Vec<f32>,
}

#[derive(Debug)]
struct Disk {
    dir: PathBuf,
    /// Bytes currently held by entry files
    bytes: Mutex<u64>,
}

impl Disk {
    /// Open `dir`, removing entries older than `ttl` and sizing the rest.
    fn open(dir: PathBuf, ttl: Duration) -> Self {
        let mut bytes = 0;
        for (path, modified, size) in entry_files(&dir) {
            let expired = modified.elapsed().is_ok_and(|age| age >= ttl);
            if expired {
                remove_entry_file(&path);
            } else {
                bytes += size;
            }
        }
        Self {
            dir,
            bytes: Mutex::new(bytes),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXTENSION}"))
    }
}

/// Lists `(path, modified, size)` for every entry file in `dir`.
fn entry_files(dir: &Path) -> Vec<(PathBuf, SystemTime, u64)> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    read_dir
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION))
        .filter_map(|path| {
            let metadata = std::fs::metadata(&path).ok()?;
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((path, modified, metadata.len()))
        })
        .collect()
}

/// Remove one entry file. Failures are logged and reported as `false`.
fn remove_entry_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            debug!("failed to remove embedding cache entry {}: {e}", path.display());
            false
        }
    }
}

fn file_len(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Two-level embedding cache.
#[derive(Debug)]
pub struct EmbeddingCache {
    config: EmbeddingCacheConfig,
    memory: Mutex<Memory>,
    disk: Option<Disk>,
    stats: Mutex<EmbeddingCacheStats>,
}

impl EmbeddingCache {
    /// Memory-only cache.
    pub fn in_memory(config: EmbeddingCacheConfig) -> Self {
        Self::build(config, None)
    }

    /// Cache whose disk level lives in `dir`.
    pub fn with_disk(config: EmbeddingCacheConfig, dir: impl Into<PathBuf>) -> Self {
        let ttl = Duration::from_secs(config.ttl_secs);
        Self::build(config, Some(Disk::open(dir.into(), ttl)))
    }

    fn build(config: EmbeddingCacheConfig, disk: Option<Disk>) -> Self {
        Self {
            config,
            memory: Mutex::new(Memory::default()),
            disk,
            stats: Mutex::new(EmbeddingCacheStats::default()),
        }
    }

    /// Cache key for `text` embedded by `model` at `dimension`.
    pub fn key(model: &str, dimension: usize, text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0]);
        hasher.update(dimension.to_le_bytes());
        hasher.update(text.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Look `key` up in memory, then on disk. A disk hit is promoted.
    pub fn get(&self, key: &str) -> Option<Vec<f32>> {
        self.stats.lock().requests += 1;

        if let Some(vector) = self.memory.lock().get(key, self.ttl()) {
            self.stats.lock().memory_hits += 1;
            return Some(vector);
        }
        if let Some(vector) = self.get_disk(key) {
            self.stats.lock().disk_hits += 1;
            self.put_memory(key.to_string(), vector.clone());
            return Some(vector);
        }
        self.stats.lock().misses += 1;
        None
    }

    fn get_disk(&self, key: &str) -> Option<Vec<f32>> {
        let disk = self.disk.as_ref()?;
        let path = disk.path(key);
        let bytes = std::fs::read(&path).ok()?;
        let entry: DiskEntry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("dropping unreadable embedding {}: {e}", path.display());
                self.forget_file(disk, &path);
                return None;
            }
        };
        let age = Utc::now()
            .signed_duration_since(entry.created_at)
            .to_std()
            .unwrap_or_default();
        if age >= self.ttl() || entry.key != key {
            self.forget_file(disk, &path);
            return None;
        }
        Some(entry.embedding)
    }

    fn forget_file(&self, disk: &Disk, path: &Path) {
        let len = file_len(path);
        if remove_entry_file(path) {
            let mut bytes = disk.bytes.lock();
            *bytes = bytes.saturating_sub(len);
        }
    }

    /// Store `vector` under `key` in memory and, when enabled, on disk.
    pub fn put(&self, key: &str, vector: &[f32]) {
        if let Some(disk) = &self.disk
            && let Err(e) = self.put_disk(disk, key, vector)
        {
            warn!("failed to write embedding cache entry: {e}");
        }
        self.put_memory(key.to_string(), vector.to_vec());
    }

    fn put_memory(&self, key: String, vector: Vec<f32>) {
        let limit = self.config.memory_entries.max(1);
        let mut memory = self.memory.lock();
        memory.insert(key, vector);
        if memory.entries.len() > limit {
            let evicted = memory.shrink_to(three_quarters(limit as u64) as usize);
            debug!(evicted, "evicted least recently used embeddings");
        }
    }

    fn put_disk(&self, disk: &Disk, key: &str, vector: &[f32]) -> IndexResult<()> {
        std::fs::create_dir_all(&disk.dir).with_path(&disk.dir, "create embedding cache")?;
        let entry = DiskEntry {
            key: key.to_string(),
            created_at: Utc::now(),
            embedding: vector.to_vec(),
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| IndexError::invalid(format!("cannot serialise embedding: {e}")))?;
        let path = disk.path(key);
        let replaced = file_len(&path);
        write_atomic(&path, &json).with_path(&path, "write embedding cache entry")?;

        let mut bytes = disk.bytes.lock();
        *bytes = bytes.saturating_sub(replaced) + json.len() as u64;
        if *bytes > self.config.disk_max_bytes {
            *bytes = shrink_disk(&disk.dir, &path, three_quarters(self.config.disk_max_bytes));
        }
        Ok(())
    }

    /// Remove expired entries from both levels. Returns how many went.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl();
        let mut removed = 0;
        {
            let mut memory = self.memory.lock();
            let expired: Vec<String> = memory
                .entries
                .iter()
                .filter(|(_, e)| e.created.elapsed() >= ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                memory.remove(key);
            }
            removed += expired.len();
        }
        if let Some(disk) = &self.disk {
            let mut bytes = disk.bytes.lock();
            let mut kept = 0;
            for (path, modified, size) in entry_files(&disk.dir) {
                if modified.elapsed().is_ok_and(|age| age >= ttl) && remove_entry_file(&path) {
                    removed += 1;
                } else {
                    kept += size;
                }
            }
            *bytes = kept;
        }
        removed
    }

    /// Empty both levels.
    pub fn clear(&self) -> IndexResult<()> {
        *self.memory.lock() = Memory::default();
        if let Some(disk) = &self.disk {
            let mut bytes = disk.bytes.lock();
            for (path, _, _) in entry_files(&disk.dir) {
                std::fs::remove_file(&path).with_path(&path, "remove embedding cache entry")?;
            }
            *bytes = 0;
        }
        Ok(())
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let mut stats = self.stats.lock().clone();
        let memory = self.memory.lock();
        stats.memory_entries = memory.entries.len();
        stats.memory_bytes = memory.bytes();
        stats.disk_bytes = self.disk.as_ref().map_or(0, |disk| *disk.bytes.lock());
        stats
    }
}

fn three_quarters(limit: u64) -> u64 {
    limit / 4 * 3 + (limit % 4) * 3 / 4
}

/// Remove the oldest entry files in `dir` until at most `target` bytes
/// remain. `keep` is never removed. Returns the bytes left.
fn shrink_disk(dir: &Path, keep: &Path, target: u64) -> u64 {
    let mut files = entry_files(dir);
    let mut total: u64 = files.iter().map(|(_, _, size)| size).sum();
    files.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut evicted = 0;
    for (path, _, size) in files {
        if total <= target {
            break;
        }
        if path != keep && remove_entry_file(&path) {
            total = total.saturating_sub(size);
            evicted += 1;
        }
    }
    debug!(evicted, bytes = total, "trimmed on-disk embedding cache");
    total
}

/// [`Embedder`] that answers repeated texts from an [`EmbeddingCache`].
pub struct CachedEmbedder {
    inner: Arc<dyn Embedder>,
    cache: Arc<EmbeddingCache>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, cache: Arc<EmbeddingCache>) -> Self {
        Self { inner, cache }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    fn key(&self, text: &str) -> String {
        EmbeddingCache::key(self.inner.model_name(), self.inner.dimensions(), text)
    }
}

impl Embedder for CachedEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let key = self.key(text);
        if let Some(vector) = self.cache.get(&key) {
            return Ok(vector);
        }
        let vector = self.inner.embed(text)?;
        self.cache.put(&key, &vector);
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    /// Only the texts missing from the cache reach the inner embedder, in
    /// one batch.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedError> {
        let keys: Vec<String> = texts.iter().map(|text| self.key(text)).collect();
        let mut vectors: Vec<Option<Vec<f32>>> =
            keys.iter().map(|key| self.cache.get(key)).collect();

        let missing: Vec<usize> = (0..texts.len()).filter(|&i| vectors[i].is_none()).collect();
        if !missing.is_empty() {
            let batch: Vec<&str> = missing.iter().map(|&i| texts[i]).collect();
            let computed = self.inner.embed_batch(&batch)?;
            if computed.len() != batch.len() {
                return Err(EmbedError::Generation(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    computed.len()
                )));
            }
            for (i, vector) in missing.into_iter().zip(computed) {
                self.cache.put(&keys[i], &vector);
                vectors[i] = Some(vector);
            }
        }
        Ok(vectors.into_iter().flatten().collect())
    }
}

/// Directory of the on-disk embedding cache for `settings`.
pub fn embedding_cache_dir(settings: &Settings) -> PathBuf {
    settings
        .cache
        .dir
        .clone()
        .unwrap_or_else(std::env::temp_dir)
        .join(EMBEDDING_CACHE_DIR_NAME)
}

/// The configured embedder, behind an [`EmbeddingCache`] unless
/// `embedding.cache.enabled` is off.
pub fn embedder_from_settings(settings: &Settings) -> Result<Arc<dyn Embedder>, EmbedError> {
    let embedder = create_embedder(&settings.embedding.model, settings.embedding.dimension)?;
    let config = &settings.embedding.cache;
    if !config.enabled {
        return Ok(embedder);
    }
    let cache = if config.disk {
        EmbeddingCache::with_disk(config.clone(), embedding_cache_dir(settings))
    } else {
        EmbeddingCache::in_memory(config.clone())
    };
    Ok(Arc::new(CachedEmbedder::new(embedder, Arc::new(cache))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::HashingEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Hashing embedder that counts the texts it embeds.
    struct Counting {
        inner: HashingEmbedder,
        texts: AtomicUsize,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                inner: HashingEmbedder::new(8),
                texts: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.texts.load(Ordering::SeqCst)
        }
    }

    impl Embedder for Counting {
        fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            self.texts.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text)
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }

        fn model_name(&self) -> &str {
            self.inner.model_name()
        }
    }

    fn config() -> EmbeddingCacheConfig {
        EmbeddingCacheConfig {
            disk: true,
            ..EmbeddingCacheConfig::default()
        }
    }

    fn cached(inner: &Arc<Counting>, cache: EmbeddingCache) -> CachedEmbedder {
        CachedEmbedder::new(inner.clone(), Arc::new(cache))
    }

    #[test]
    fn test_repeated_text_is_embedded_once() {
        let inner = Counting::new();
        let embedder = cached(&inner, EmbeddingCache::in_memory(config()));

        let first = embedder.embed("calculate tax").unwrap();
        let second = embedder.embed("calculate tax").unwrap();
        assert_eq!(first, second);
        assert_eq!(first, HashingEmbedder::new(8).embed("calculate tax").unwrap());
        assert_eq!(inner.count(), 1);

        let stats = embedder.cache().stats();
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.memory_entries, 1);
        assert_eq!(stats.memory_bytes, 32);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_batch_embeds_only_misses_in_order() {
        let inner = Counting::new();
        let embedder = cached(&inner, EmbeddingCache::in_memory(config()));
        embedder.embed("parse config").unwrap();

        let texts = ["load settings", "parse config", "write index"];
        let vectors = embedder.embed_batch(&texts).unwrap();
        assert_eq!(inner.count(), 3);

        let plain = HashingEmbedder::new(8);
        for (text, vector) in texts.iter().zip(&vectors) {
            assert_eq!(vector, &plain.embed(text).unwrap(), "{text}");
        }
    }

    #[test]
    fn test_model_and_dimension_are_part_of_the_key() {
        let text = "calculate tax";
        let key = EmbeddingCache::key("hashing-v1", 384, text);
        assert_eq!(key.len(), 64);
        assert_ne!(key, EmbeddingCache::key("hashing-v1", 8, text));
        assert_ne!(key, EmbeddingCache::key("all-MiniLM-L6-v2", 384, text));
        assert_eq!(key, EmbeddingCache::key("hashing-v1", 384, text));
    }

    #[test]
    fn test_least_recently_used_entries_are_evicted() {
        let cache = EmbeddingCache::in_memory(EmbeddingCacheConfig {
            memory_entries: 4,
            ..config()
        });
        for i in 0..4 {
            cache.put(&format!("k{i}"), &[i as f32]);
        }
        assert!(cache.get("k0").is_some());
        cache.put("k4", &[4.0]);

        // Trimmed to three of four: k1 and k2 were the least recently used.
        assert_eq!(cache.stats().memory_entries, 3);
        assert!(cache.get("k1").is_none());
        assert!(cache.get("k2").is_none());
        assert_eq!(cache.get("k0"), Some(vec![0.0]));
        assert_eq!(cache.get("k3"), Some(vec![3.0]));
        assert_eq!(cache.get("k4"), Some(vec![4.0]));
    }

    #[test]
    fn test_disk_entries_survive_a_new_cache() {
        let temp = TempDir::new().unwrap();
        let first = EmbeddingCache::with_disk(config(), temp.path());
        first.put("abc", &[0.5, 0.5]);
        assert!(temp.path().join("abc.emb").exists());
        assert!(first.stats().disk_bytes > 0);

        let second = EmbeddingCache::with_disk(config(), temp.path());
        assert_eq!(second.stats().disk_bytes, first.stats().disk_bytes);
        assert_eq!(second.get("abc"), Some(vec![0.5, 0.5]));
        assert_eq!(second.get("abc"), Some(vec![0.5, 0.5]));

        let stats = second.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 0);
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let temp = TempDir::new().unwrap();
        let cache = EmbeddingCache::with_disk(
            EmbeddingCacheConfig {
                ttl_secs: 0,
                ..config()
            },
            temp.path(),
        );
        cache.put("abc", &[1.0]);

        assert!(cache.get("abc").is_none());
        assert!(!temp.path().join("abc.emb").exists());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_unreadable_disk_entry_is_dropped() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("abc.emb"), b"{broken").unwrap();
        let cache = EmbeddingCache::with_disk(config(), temp.path());

        assert!(cache.get("abc").is_none());
        assert!(!temp.path().join("abc.emb").exists());
        assert_eq!(cache.stats().disk_bytes, 0);
    }

    #[test]
    fn test_disk_budget_keeps_newest_entry() {
        let temp = TempDir::new().unwrap();
        let cache = EmbeddingCache::with_disk(
            EmbeddingCacheConfig {
                disk_max_bytes: 600,
                ..config()
            },
            temp.path(),
        );
        for i in 0..20 {
            cache.put(&format!("key{i:02}"), &[0.25; 8]);
        }

        let stats = cache.stats();
        assert!(stats.disk_bytes <= 600, "{stats:?}");
        let files = entry_files(temp.path());
        assert!(files.len() < 20);
        assert_eq!(files.iter().map(|f| f.2).sum::<u64>(), stats.disk_bytes);
        assert!(temp.path().join("key19.emb").exists());
    }

    #[test]
    fn test_sweep_and_clear() {
        let temp = TempDir::new().unwrap();
        let cache = EmbeddingCache::with_disk(config(), temp.path());
        cache.put("a", &[1.0]);
        cache.put("b", &[2.0]);
        assert_eq!(cache.sweep(), 0);

        cache.clear().unwrap();
        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(cache.stats().disk_bytes, 0);
        assert!(entry_files(temp.path()).is_empty());
    }

    #[test]
    fn test_embedder_from_settings() {
        let temp = TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.cache.dir = Some(temp.path().to_path_buf());
        settings.embedding.cache.disk = true;

        let embedder = embedder_from_settings(&settings).unwrap();
        assert_eq!(embedder.model_name(), "hashing-v1");
        assert_eq!(embedder.dimensions(), 384);
        let vector = embedder.embed("calculate tax").unwrap();
        assert_eq!(vector, HashingEmbedder::default().embed("calculate tax").unwrap());
        let dir = embedding_cache_dir(&settings);
        assert_eq!(dir, temp.path().join(EMBEDDING_CACHE_DIR_NAME));
        assert_eq!(entry_files(&dir).len(), 1);

        settings.embedding.cache.enabled = false;
        let plain = embedder_from_settings(&settings).unwrap();
        plain.embed("write index").unwrap();
        assert_eq!(entry_files(&dir).len(), 1);
    }
}
