//! Query execution.
//!
//! [`SearchEngine::search`] validates the query, consults the cache, picks a
//! strategy (explicit or from the analyser) and ranks the matches by
//! `(-score, path, start_line)`.
//!
//! Semantic search embeds the query and asks the index for candidates.
//! The line-oriented strategies (text, regex, exact, fuzzy) fan out over
//! batches of files on the worker pool and collect the batches through a
//! result queue.

use super::analyzer;
use super::cache::{CacheStats, SearchCache};
use super::query::{MatchType, SearchQuery, SearchResult, SearchResults, SearchType};
use crate::config::Settings;
use crate::error::{IndexError, IndexResult};
use crate::index::{CodeIndex, ConcurrentIndex};
use crate::indexing::IndexLock;
use crate::pool::PoolManager;
use crate::runtime::{CancellationToken, WorkerPool, WorkerPoolOptions};
use crate::storage::METADATA_FILE;
use crate::types::{FileEntry, Language};
use crate::vector::{Embedder, embedder_from_settings};
use globset::GlobMatcher;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Per-call knobs that are not part of the query's identity.
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Skip the cache lookup; fresh results are still stored
    pub bypass_cache: bool,
    pub cancel: CancellationToken,
}

/// Searches one index.
pub struct SearchEngine {
    root: PathBuf,
    index_dir: PathBuf,
    settings: Settings,
    embedder: Arc<dyn Embedder>,
    cache: Option<Arc<SearchCache>>,
    pools: PoolManager,
    workers: WorkerPool,
    index: Mutex<Option<Arc<ConcurrentIndex>>>,
}

impl SearchEngine {
    /// Engine over the index of `root`; the index is loaded on first use.
    pub fn open(root: impl Into<PathBuf>, settings: Settings) -> IndexResult<Self> {
        let root = root.into();
        let index_dir = settings.index_path(&root);
        let embedder = embedder_from_settings(&settings)?;
        let cache = settings.cache.enabled.then(|| {
            let cache = Arc::new(SearchCache::new(settings.cache.clone(), &index_dir));
            cache.start_sweeper();
            cache
        });
        let workers = WorkerPool::new(WorkerPoolOptions::from_config(&settings.concurrency));
        Ok(Self {
            root,
            index_dir,
            settings,
            embedder,
            cache,
            pools: PoolManager::default(),
            workers,
            index: Mutex::new(None),
        })
    }

    /// Engine over an index that is already in memory.
    pub fn with_index(index: CodeIndex, settings: Settings) -> IndexResult<Self> {
        let engine = Self::open(index.root().to_path_buf(), settings)?;
        let index = engine.prepare(index)?;
        *engine.index.lock() = Some(Arc::new(index));
        Ok(engine)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_dir(&self) -> &Path {
        &self.index_dir
    }

    pub fn cache(&self) -> Option<&Arc<SearchCache>> {
        self.cache.as_ref()
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.cache.as_ref().map(|cache| cache.stats())
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// Shared handle on the loaded index, loading it if needed.
    pub fn index(&self) -> IndexResult<Arc<ConcurrentIndex>> {
        let mut slot = self.index.lock();
        if let Some(index) = slot.as_ref() {
            return Ok(Arc::clone(index));
        }
        if !self.index_dir.join(METADATA_FILE).exists() {
            return Err(self.missing_index());
        }
        let _lock = IndexLock::shared(&self.index_dir)?;
        let index = CodeIndex::load(
            &self.root,
            &self.index_dir,
            &self.settings.embedding.model,
            self.settings.embedding.dimension,
        )?;
        let index = Arc::new(self.prepare(index)?);
        *slot = Some(Arc::clone(&index));
        Ok(index)
    }

    /// Forget the loaded index; the next search reads it from disk again.
    pub fn reload(&self) {
        self.index.lock().take();
    }

    fn prepare(&self, mut index: CodeIndex) -> IndexResult<ConcurrentIndex> {
        if index.store().len() >= self.settings.search.hnsw_min_vectors && index.hnsw().is_none() {
            index.enable_hnsw(self.settings.hnsw.clone())?;
        }
        Ok(ConcurrentIndex::new(index, self.settings.concurrency.clone()))
    }

    fn missing_index(&self) -> IndexError {
        IndexError::not_found("index", self.index_dir.display().to_string())
    }

    pub fn search(&self, query: &SearchQuery) -> IndexResult<SearchResults> {
        self.search_with(query, &SearchOptions::default())
    }

    pub fn search_with(&self, query: &SearchQuery, options: &SearchOptions) -> IndexResult<SearchResults> {
        let started = Instant::now();
        query.validate()?;

        let analysis = analyzer::analyze(&query.text);
        let Some(strategy) = query.search_type.or(analysis.kind.search_type()) else {
            return Ok(SearchResults::empty(query));
        };

        if self.index.lock().is_none() && !self.index_dir.join(METADATA_FILE).exists() {
            return Err(self.missing_index());
        }

        if !options.bypass_cache {
            if let Some((mut results, level)) = self.cache.as_ref().and_then(|c| c.get(query)) {
                results.execution_time = started.elapsed();
                results.cached = true;
                debug!(query = %query.text, level = ?level, "served from cache");
                return Ok(results);
            }
        }

        let handle = self.index()?;
        let guard = handle.acquire()?;
        let index = guard.snapshot();
        let scope = Scope::new(query)?;
        let cancel = &options.cancel;

        let (found, searched_files) = match strategy {
            SearchType::Semantic => self.semantic(&index, query, &scope, cancel)?,
            SearchType::Text => self.scan(&index, LineMatcher::text(&query.text), &scope, cancel)?,
            SearchType::Regex => self.scan(&index, LineMatcher::regex(&query.text)?, &scope, cancel)?,
            SearchType::Exact => self.scan(&index, LineMatcher::exact(&analysis.processed), &scope, cancel)?,
            SearchType::Fuzzy => {
                let matcher = LineMatcher::fuzzy(&query.text, query.threshold);
                self.scan(&index, matcher, &scope, cancel)?
            }
            SearchType::Hybrid => {
                let (semantic, searched) = self.semantic(&index, query, &scope, cancel)?;
                let (text, _) = self.scan(&index, LineMatcher::text(&query.text), &scope, cancel)?;
                (merge(semantic.into_iter().chain(text)), searched)
            }
        };

        let mut results = rank(found);
        let total_results = results.len();
        let has_more = total_results > query.max_results;
        results.truncate(query.max_results);
        if query.include_context {
            attach_context(&index, &mut results, query.context_lines);
        }

        let out = SearchResults {
            query: query.text.clone(),
            search_type: Some(strategy),
            results,
            total_results,
            execution_time: started.elapsed(),
            has_more,
            searched_files,
            cached: false,
        };
        if let Some(cache) = &self.cache {
            cache.put(query, &out);
        }
        info!(
            query = %query.text,
            strategy = %strategy,
            total = out.total_results,
            elapsed_us = out.execution_time.as_micros() as u64,
            "search finished"
        );
        Ok(out)
    }

    fn semantic(
        &self,
        index: &CodeIndex,
        query: &SearchQuery,
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> IndexResult<(Vec<SearchResult>, usize)> {
        let searched = index.files().filter(|f| scope.accepts(&f.path, f.language)).count();
        if index.store().len() == 0 {
            return Ok((Vec::new(), searched));
        }
        let vector = self.embedder.embed(&query.text)?;
        let k = if scope.is_unrestricted() {
            query.max_results * 2
        } else {
            index.store().len()
        };
        let candidates = index.semantic_candidates(
            &vector,
            k,
            self.settings.search.hnsw_min_vectors,
            self.pools.vectors(),
        )?;

        let mut results = Vec::new();
        for candidate in candidates {
            cancel.check("semantic search")?;
            let score = candidate.score.get();
            if score < query.threshold {
                continue;
            }
            let Some(entry) = index.store().get(&candidate.id) else {
                continue;
            };
            let meta = entry.metadata;
            if !scope.accepts(&meta.file_path, meta.language) {
                continue;
            }
            let (start, end) = match (meta.chunk.start_line, meta.chunk.end_line) {
                (Some(s), Some(e)) if meta.start_line <= s && s <= e && e <= meta.end_line => (s, e),
                _ => (meta.start_line, meta.end_line),
            };
            let content = meta
                .content
                .split('\n')
                .skip((start - meta.start_line) as usize)
                .take((end - start + 1) as usize)
                .collect::<Vec<_>>()
                .join("\n");
            results.push(SearchResult {
                file_path: meta.file_path,
                start_line: start,
                end_line: end,
                content,
                context: None,
                relevance_score: score.clamp(0.0, 1.0),
                language: meta.language,
                match_type: MatchType::Semantic,
                highlights: Vec::new(),
                rank: 0,
            });
        }
        Ok((merge(results), searched))
    }

    /// Run `matcher` over every line of every file in scope.
    fn scan(
        &self,
        index: &Arc<CodeIndex>,
        matcher: LineMatcher,
        scope: &Scope,
        cancel: &CancellationToken,
    ) -> IndexResult<(Vec<SearchResult>, usize)> {
        let paths: Vec<String> = index
            .files()
            .filter(|f| scope.accepts(&f.path, f.language))
            .map(|f| f.path.clone())
            .collect();
        let searched = paths.len();
        if paths.is_empty() {
            return Ok((Vec::new(), 0));
        }

        let jobs = (self.workers.options().max_workers * 2).clamp(1, paths.len());
        let per_job = paths.len().div_ceil(jobs);
        let batches: Vec<Vec<String>> = paths.chunks(per_job).map(<[String]>::to_vec).collect();
        let queue = self.pools.result_queue::<Vec<SearchResult>>(batches.len());
        let matcher = Arc::new(matcher);

        let mut futures = Vec::with_capacity(batches.len());
        for batch in batches {
            cancel.check("search")?;
            let job_index = Arc::clone(index);
            let job_matcher = Arc::clone(&matcher);
            let job_queue = queue.clone();
            let job_cancel = cancel.clone();
            let fallback = batch.clone();
            let submitted = self.workers.submit(move |token: &CancellationToken| {
                let hits = scan_files(&job_index, &batch, &job_matcher, &[token, &job_cancel])?;
                job_queue.push_blocking(hits);
                Ok(())
            });
            match submitted {
                Ok(future) => futures.push(future),
                Err(IndexError::QueueFull { .. }) => {
                    debug!("worker queue full, scanning batch inline");
                    queue.push_blocking(scan_files(index, &fallback, &matcher, &[cancel])?);
                }
                Err(e) => return Err(e),
            }
        }
        for future in futures {
            future.wait()?;
        }
        let results = queue.drain().into_iter().flatten().collect();
        Ok((results, searched))
    }
}

fn scan_files(
    index: &CodeIndex,
    paths: &[String],
    matcher: &LineMatcher,
    tokens: &[&CancellationToken],
) -> IndexResult<Vec<SearchResult>> {
    let mut results = Vec::new();
    for path in paths {
        for token in tokens {
            token.check("search")?;
        }
        let Some(file) = index.file(path) else { continue };
        for (idx, line) in file.lines().iter().enumerate() {
            if let Some(hit) = matcher.score(line) {
                let line_no = idx as u32 + 1;
                results.push(SearchResult {
                    file_path: file.path.clone(),
                    start_line: line_no,
                    end_line: line_no,
                    content: line.trim_end().to_string(),
                    context: None,
                    relevance_score: hit.score.clamp(0.0, 1.0),
                    language: file.language,
                    match_type: matcher.match_type(),
                    highlights: hit.highlights,
                    rank: 0,
                });
            }
        }
    }
    Ok(results)
}

/// File pattern and language restrictions of a query.
struct Scope {
    files: Option<GlobMatcher>,
    language: Option<Language>,
}

impl Scope {
    fn new(query: &SearchQuery) -> IndexResult<Self> {
        Ok(Self {
            files: query.file_matcher()?,
            language: query.language,
        })
    }

    fn is_unrestricted(&self) -> bool {
        self.files.is_none() && self.language.is_none()
    }

    fn accepts(&self, path: &str, language: Language) -> bool {
        self.language.is_none_or(|l| l == language)
            && self.files.as_ref().is_none_or(|m| m.is_match(path))
    }
}

struct LineHit {
    score: f32,
    highlights: Vec<String>,
}

enum LineMatcher {
    /// Every term in the lowercase line
    Text { terms: Vec<String> },
    Regex(Regex),
    /// Lowercase phrase and its length in characters
    Exact { phrase: String, len: usize },
    Fuzzy { terms: Vec<String>, threshold: f32 },
}

impl LineMatcher {
    fn text(query: &str) -> Self {
        Self::Text {
            terms: lowercase_terms(query),
        }
    }

    fn regex(pattern: &str) -> IndexResult<Self> {
        Regex::new(pattern)
            .map(Self::Regex)
            .map_err(|e| IndexError::invalid(format!("invalid regex pattern: {e}")))
    }

    fn exact(phrase: &str) -> Self {
        let phrase = phrase.to_lowercase();
        let len = phrase.chars().count();
        Self::Exact { phrase, len }
    }

    fn fuzzy(query: &str, threshold: f32) -> Self {
        Self::Fuzzy {
            terms: lowercase_terms(query),
            threshold,
        }
    }

    fn match_type(&self) -> MatchType {
        match self {
            Self::Text { .. } => MatchType::Partial,
            Self::Regex(_) => MatchType::Regex,
            Self::Exact { .. } => MatchType::Exact,
            Self::Fuzzy { .. } => MatchType::Fuzzy,
        }
    }

    fn score(&self, line: &str) -> Option<LineHit> {
        if line.trim().is_empty() {
            return None;
        }
        match self {
            Self::Text { terms } => {
                if terms.is_empty() {
                    return None;
                }
                let lower = line.to_lowercase();
                if !terms.iter().all(|t| lower.contains(t.as_str())) {
                    return None;
                }
                let exact_words = terms.iter().filter(|t| contains_word(&lower, t)).count();
                let score = 0.5 * terms.len() as f32 + 0.3 * exact_words as f32;
                Some(LineHit {
                    score: score.min(1.0),
                    highlights: Vec::new(),
                })
            }
            Self::Regex(re) => {
                let mut matched = 0usize;
                let mut highlights = Vec::new();
                for caps in re.captures_iter(line) {
                    let Some(whole) = caps.get(0).filter(|m| !m.is_empty()) else {
                        continue;
                    };
                    matched += whole.len();
                    if caps.len() > 1 {
                        highlights.extend(caps.iter().skip(1).flatten().map(|m| m.as_str().to_string()));
                    } else {
                        highlights.push(whole.as_str().to_string());
                    }
                }
                (matched > 0).then(|| LineHit {
                    score: (matched as f32 / line.len() as f32).min(1.0),
                    highlights,
                })
            }
            Self::Exact { phrase, len } => {
                if phrase.is_empty() || !line.to_lowercase().contains(phrase.as_str()) {
                    return None;
                }
                let line_len = line.chars().count().max(1);
                Some(LineHit {
                    score: (*len as f32 / line_len as f32 + 0.2).min(1.0),
                    highlights: Vec::new(),
                })
            }
            Self::Fuzzy { terms, threshold } => {
                if terms.is_empty() {
                    return None;
                }
                let lower = line.to_lowercase();
                let mut credit = 0.0f32;
                for term in terms {
                    if lower.contains(term.as_str()) {
                        credit += 1.0;
                    } else if term.chars().count() > 3 && partial_match(term, &lower) {
                        credit += 0.5;
                    } else {
                        return None;
                    }
                }
                let score = credit / terms.len() as f32;
                (score >= *threshold).then(|| LineHit {
                    score,
                    highlights: Vec::new(),
                })
            }
        }
    }
}

fn lowercase_terms(query: &str) -> Vec<String> {
    query.split_whitespace().map(str::to_lowercase).collect()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Whether `term` occurs in `line` delimited by non-word characters.
fn contains_word(line: &str, term: &str) -> bool {
    line.match_indices(term).any(|(idx, _)| {
        let before = line[..idx].chars().next_back();
        let after = line[idx + term.len()..].chars().next();
        !before.is_some_and(is_word_char) && !after.is_some_and(is_word_char)
    })
}

/// Whether some slice of `term` half its length occurs in `line` with at
/// most one differing character.
fn partial_match(term: &str, line: &str) -> bool {
    let term: Vec<char> = term.chars().collect();
    let line: Vec<char> = line.chars().collect();
    let width = term.len() / 2;
    if width == 0 || line.len() < width {
        return false;
    }
    term.windows(width).any(|slice| {
        line.windows(width).any(|window| {
            slice.iter().zip(window).filter(|(a, b)| a != b).count() <= 1
        })
    })
}

/// Keep the best-scored result per `path:start:end`.
fn merge(results: impl IntoIterator<Item = SearchResult>) -> Vec<SearchResult> {
    let mut best: HashMap<String, SearchResult> = HashMap::new();
    for result in results {
        let key = result.key();
        match best.get(&key) {
            Some(existing) if existing.relevance_score >= result.relevance_score => {}
            _ => {
                best.insert(key, result);
            }
        }
    }
    best.into_values().collect()
}

/// Sort by score descending, then path, then start line, and number the
/// results from 1.
fn rank(mut results: Vec<SearchResult>) -> Vec<SearchResult> {
    results.sort_by(|a, b| {
        b.relevance_score
            .total_cmp(&a.relevance_score)
            .then_with(|| a.file_path.cmp(&b.file_path))
            .then_with(|| a.start_line.cmp(&b.start_line))
            .then_with(|| a.end_line.cmp(&b.end_line))
    });
    for (i, result) in results.iter_mut().enumerate() {
        result.rank = i + 1;
    }
    results
}

fn attach_context(index: &CodeIndex, results: &mut [SearchResult], context_lines: usize) {
    let mut lines_by_file: HashMap<String, Vec<String>> = HashMap::new();
    for result in results.iter_mut() {
        let lines = lines_by_file
            .entry(result.file_path.clone())
            .or_insert_with(|| index.file(&result.file_path).map(FileEntry::lines).unwrap_or_default());
        result.context = context_block(lines, result.start_line, result.end_line, context_lines);
    }
}

/// Lines `start - n ..= end + n`, matching lines prefixed with `>> `.
fn context_block(lines: &[String], start: u32, end: u32, n: usize) -> Option<String> {
    if lines.is_empty() {
        return None;
    }
    let first = (start as usize).saturating_sub(n).max(1);
    let last = (end as usize + n).min(lines.len());
    let block = (first..=last)
        .map(|line_no| {
            let prefix = if (start as usize..=end as usize).contains(&line_no) {
                ">> "
            } else {
                "   "
            };
            format!("{prefix}{}", lines[line_no - 1])
        })
        .collect::<Vec<_>>()
        .join("\n");
    Some(block)
}
