//! Three-level query cache.
//!
//! - L1: in-process map from query fingerprint to results.
//! - L2: one JSON file per fingerprint under
//!   `<temp>/clindex_cache/<index id>/`, shared between runs.
//! - L3: results of the well-known pattern queries (`function`, `TODO`, ...)
//!   that also answer queries starting with the pattern.
//!
//! Lookups go L1, L2, L3 in that order; an L2 hit is promoted to L1.
//! Entries older than `ttl_secs` are rejected and removed by a background
//! sweep every `sweep_interval_secs`.

use super::query::{SearchQuery, SearchResults};
use crate::config::CacheConfig;
use crate::error::{IndexError, IndexResult, IoContext};
use crate::storage::write_atomic;
use chrono::{DateTime, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, warn};

/// Queries whose results are kept in L3.
pub const PATTERNS: [&str; 7] = ["function", "class", "import", "error", "TODO", "FIXME", "return"];

/// Name of the directory holding every index's L2 entries.
pub const CACHE_DIR_NAME: &str = "clindex_cache";

const L2_EXTENSION: &str = "cache";

/// L1 entries idle for less than this survive eviction.
const L1_MIN_IDLE: Duration = Duration::from_secs(60);

/// Which level answered a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CacheLevel {
    L1,
    L2,
    L3,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_queries: u64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l3_hits: u64,
    pub l3_misses: u64,
    pub l1_entries: usize,
    pub l3_entries: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl CacheStats {
    /// Share of lookups answered by any level.
    pub fn hit_rate(&self) -> f64 {
        ratio(self.l1_hits + self.l2_hits + self.l3_hits, self.total_queries)
    }

    pub fn l1_hit_rate(&self) -> f64 {
        ratio(self.l1_hits, self.l1_hits + self.l1_misses)
    }

    pub fn l2_hit_rate(&self) -> f64 {
        ratio(self.l2_hits, self.l2_hits + self.l2_misses)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 { 0.0 } else { part as f64 / total as f64 }
}

#[derive(Debug)]
struct L1Entry {
    results: SearchResults,
    created: Instant,
    last_access: Instant,
    access_count: u64,
}

#[derive(Debug, Default)]
struct L1 {
    entries: HashMap<String, L1Entry>,
    /// Fingerprints in arrival order
    order: VecDeque<String>,
}

impl L1 {
    fn remove(&mut self, key: &str) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct L2Entry {
    fingerprint: String,
    created_at: DateTime<Utc>,
    results: SearchResults,
}

#[derive(Debug, Clone)]
struct L3Entry {
    /// Fingerprint of the query with its text replaced by the pattern
    shape: String,
    results: SearchResults,
}

/// Query cache shared by every search of one index.
#[derive(Debug)]
pub struct SearchCache {
    config: CacheConfig,
    l1: Mutex<L1>,
    l2_dir: PathBuf,
    l3: RwLock<HashMap<&'static str, L3Entry>>,
    stats: Mutex<CacheStats>,
    sweeper: Mutex<Option<Sender<()>>>,
}

/// L2 directory for the index stored in `index_dir`.
pub fn l2_dir(config: &CacheConfig, index_dir: &Path) -> PathBuf {
    let base = config.dir.clone().unwrap_or_else(std::env::temp_dir);
    let id_source = index_dir
        .canonicalize()
        .unwrap_or_else(|_| index_dir.to_path_buf());
    let digest = Sha256::digest(id_source.to_string_lossy().as_bytes());
    base.join(CACHE_DIR_NAME).join(hex::encode(&digest[..8]))
}

/// Remove every L2 entry of the index in `index_dir`. Returns the number of
/// files removed.
pub fn invalidate_disk(config: &CacheConfig, index_dir: &Path) -> IndexResult<usize> {
    remove_entries(&l2_dir(config, index_dir))
}

/// Remove one L2 entry file. Failures are logged and reported as `false`.
fn remove_entry_file(path: &Path) -> bool {
    match std::fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            debug!("failed to remove cache entry {}: {e}", path.display());
            false
        }
    }
}

fn remove_entries(dir: &Path) -> IndexResult<usize> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(IndexError::io(dir, "read cache directory", e)),
    };
    let mut removed = 0;
    for entry in read_dir.flatten() {
        let path = entry.path();
        if is_cache_file(&path) {
            std::fs::remove_file(&path).with_path(&path, "remove cache entry")?;
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_cache_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == L2_EXTENSION)
}

/// The pattern `text` is answered by, if any: the pattern itself, or the
/// pattern followed by whitespace or `:` and more text.
fn matching_pattern(text: &str) -> Option<&'static str> {
    PATTERNS.iter().copied().find(|pattern| {
        text == *pattern
            || text.strip_prefix(pattern).is_some_and(|rest| {
                rest.starts_with(|c: char| c.is_whitespace() || c == ':')
                    && !rest.trim_start_matches(|c: char| c.is_whitespace() || c == ':').is_empty()
            })
    })
}

fn shape(query: &SearchQuery, pattern: &str) -> String {
    SearchQuery {
        text: pattern.to_string(),
        ..query.clone()
    }
    .fingerprint()
}

impl SearchCache {
    pub fn new(config: CacheConfig, index_dir: &Path) -> Self {
        let l2_dir = l2_dir(&config, index_dir);
        Self {
            config,
            l1: Mutex::new(L1::default()),
            l2_dir,
            l3: RwLock::new(HashMap::new()),
            stats: Mutex::new(CacheStats::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn l2_dir(&self) -> &Path {
        &self.l2_dir
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Start the background sweep. The thread holds only a weak reference
    /// and exits once the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut slot = self.sweeper.lock();
        if slot.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let interval = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        let weak: Weak<Self> = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("clindex-cache-sweep".to_string())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(cache) = weak.upgrade() else { break };
                    let removed = cache.sweep();
                    if removed > 0 {
                        debug!(removed, "cache sweep removed expired entries");
                    }
                }
            });
        match spawned {
            Ok(_) => *slot = Some(stop_tx),
            Err(e) => warn!("failed to start cache sweeper: {e}"),
        }
    }

    /// Look `query` up in L1, then L2, then L3.
    pub fn get(&self, query: &SearchQuery) -> Option<(SearchResults, CacheLevel)> {
        let key = query.fingerprint();
        self.stats.lock().total_queries += 1;

        if let Some(results) = self.get_l1(&key) {
            self.stats.lock().l1_hits += 1;
            return Some((results, CacheLevel::L1));
        }
        self.stats.lock().l1_misses += 1;

        if let Some(results) = self.get_l2(&key) {
            self.stats.lock().l2_hits += 1;
            self.put_l1(key, results.clone());
            return Some((results, CacheLevel::L2));
        }
        self.stats.lock().l2_misses += 1;

        if let Some(results) = self.get_l3(query) {
            self.stats.lock().l3_hits += 1;
            return Some((results, CacheLevel::L3));
        }
        self.stats.lock().l3_misses += 1;
        None
    }

    fn get_l1(&self, key: &str) -> Option<SearchResults> {
        let mut l1 = self.l1.lock();
        let expired = l1.entries.get(key)?.created.elapsed() > self.ttl();
        if expired {
            l1.remove(key);
            return None;
        }
        let entry = l1.entries.get_mut(key)?;
        entry.last_access = Instant::now();
        entry.access_count += 1;
        Some(entry.results.clone())
    }

    fn get_l2(&self, key: &str) -> Option<SearchResults> {
        let path = self.l2_path(key);
        let bytes = std::fs::read(&path).ok()?;
        let entry: L2Entry = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                debug!("dropping unreadable cache entry {}: {e}", path.display());
                remove_entry_file(&path);
                return None;
            }
        };
        let age = Utc::now()
            .signed_duration_since(entry.created_at)
            .to_std()
            .unwrap_or_default();
        if age > self.ttl() || entry.fingerprint != key {
            remove_entry_file(&path);
            return None;
        }
        Some(entry.results)
    }

    fn get_l3(&self, query: &SearchQuery) -> Option<SearchResults> {
        let pattern = matching_pattern(&query.text)?;
        let l3 = self.l3.read();
        let entry = l3.get(pattern)?;
        (entry.shape == shape(query, pattern)).then(|| entry.results.clone())
    }

    fn l2_path(&self, key: &str) -> PathBuf {
        self.l2_dir.join(format!("{key}.{L2_EXTENSION}"))
    }

    /// Store `results` for `query` in L1 and L2, and in L3 when the query is
    /// one of the [`PATTERNS`].
    pub fn put(&self, query: &SearchQuery, results: &SearchResults) {
        let key = query.fingerprint();
        if let Err(e) = self.put_l2(&key, results) {
            warn!("failed to write query cache entry: {e}");
        }
        if let Some(pattern) = PATTERNS.iter().copied().find(|p| *p == query.text) {
            self.l3.write().insert(
                pattern,
                L3Entry {
                    shape: shape(query, pattern),
                    results: results.clone(),
                },
            );
        }
        self.put_l1(key, results.clone());
    }

    fn put_l1(&self, key: String, results: SearchResults) {
        let now = Instant::now();
        let mut l1 = self.l1.lock();
        if l1.entries.contains_key(&key) {
            l1.order.retain(|k| k != &key);
        }
        l1.order.push_back(key.clone());
        l1.entries.insert(
            key,
            L1Entry {
                results,
                created: now,
                last_access: now,
                access_count: 0,
            },
        );

        if l1.entries.len() > self.config.l1_size {
            let budget = (l1.entries.len() / 4).max(1);
            let victims: Vec<String> = l1
                .order
                .iter()
                .filter(|k| {
                    l1.entries
                        .get(*k)
                        .is_some_and(|e| now.duration_since(e.last_access) > L1_MIN_IDLE)
                })
                .take(budget)
                .cloned()
                .collect();
            for key in &victims {
                l1.remove(key);
            }
            if !victims.is_empty() {
                debug!(evicted = victims.len(), "evicted idle L1 entries");
            }
        }
    }

    fn put_l2(&self, key: &str, results: &SearchResults) -> IndexResult<()> {
        std::fs::create_dir_all(&self.l2_dir).with_path(&self.l2_dir, "create cache directory")?;
        let files = self.l2_files()?;
        if files.len() >= self.config.l2_size {
            let mut by_age: Vec<(SystemTime, PathBuf)> = files
                .into_iter()
                .map(|path| {
                    let modified = std::fs::metadata(&path)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    (modified, path)
                })
                .collect();
            by_age.sort();
            let count = (by_age.len() / 4).max(1);
            for (_, path) in by_age.into_iter().take(count) {
                remove_entry_file(&path);
            }
        }

        let entry = L2Entry {
            fingerprint: key.to_string(),
            created_at: Utc::now(),
            results: results.clone(),
        };
        let json = serde_json::to_vec(&entry)
            .map_err(|e| IndexError::invalid(format!("cannot serialise cache entry: {e}")))?;
        let path = self.l2_path(key);
        write_atomic(&path, &json).with_path(&path, "write cache entry")
    }

    fn l2_files(&self) -> IndexResult<Vec<PathBuf>> {
        let read_dir = match std::fs::read_dir(&self.l2_dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IndexError::io(&self.l2_dir, "read cache directory", e)),
        };
        Ok(read_dir
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| is_cache_file(path))
            .collect())
    }

    /// Remove expired L1 entries and L2 files. Returns how many went.
    pub fn sweep(&self) -> usize {
        let ttl = self.ttl();
        let mut removed = 0;
        {
            let mut l1 = self.l1.lock();
            let expired: Vec<String> = l1
                .entries
                .iter()
                .filter(|(_, e)| e.created.elapsed() > ttl)
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                l1.remove(key);
            }
            removed += expired.len();
        }

        for path in self.l2_files().unwrap_or_default() {
            let expired = std::fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| modified.elapsed().ok())
                .is_some_and(|age| age > ttl);
            if expired && remove_entry_file(&path) {
                removed += 1;
            }
        }

        self.stats.lock().last_cleanup = Some(Utc::now());
        removed
    }

    /// Drop L2 entries only. Used after the index changed on disk.
    pub fn invalidate_disk(&self) -> IndexResult<usize> {
        remove_entries(&self.l2_dir)
    }

    /// Empty all three levels.
    pub fn clear(&self) -> IndexResult<()> {
        *self.l1.lock() = L1::default();
        self.l3.write().clear();
        self.invalidate_disk()?;
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.lock().clone();
        stats.l1_entries = self.l1.lock().entries.len();
        stats.l3_entries = self.l3.read().len();
        stats
    }
}
