use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};
use unicode_normalization::UnicodeNormalization;

use common::storage::vector::cosine_similarity;
use common::utils::config::AppConfig;
use common::utils::embedding::EmbeddingHandle;

use crate::SourceRef;

/// Separator between the normalized question and the principal namespace;
/// prevents cross-principal cache bleed while staying out of normal text.
const NAMESPACE_SEPARATOR: char = '\u{1f}';

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub enabled: bool,
    pub threshold: f32,
    pub ttl: Duration,
    pub max_entries: usize,
}

impl From<&AppConfig> for CacheConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            enabled: config.cache_enabled,
            threshold: config.cache_threshold,
            ttl: Duration::from_secs(config.cache_ttl_secs),
            max_entries: config.cache_max_entries,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CachedAnswer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
}

struct CacheEntry {
    fingerprint: Vec<f32>,
    normalized_question: String,
    answer: String,
    sources: Vec<SourceRef>,
    created_at: Instant,
    ttl: Duration,
    last_used: u64,
}

impl CacheEntry {
    fn expired(&self) -> bool {
        self.created_at.elapsed() > self.ttl
    }
}

/// Similarity-keyed answer memoization. A read-through, write-behind
/// optimization over the QA chain; never authoritative.
pub struct SemanticCache {
    embeddings: Arc<EmbeddingHandle>,
    config: CacheConfig,
    entries: Mutex<Vec<CacheEntry>>,
    /// Monotonic touch counter backing LRU eviction.
    clock: AtomicU64,
}

impl SemanticCache {
    pub fn new(embeddings: Arc<EmbeddingHandle>, config: CacheConfig) -> Self {
        Self {
            embeddings,
            config,
            entries: Mutex::new(Vec::new()),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// NFC, lowercase, collapsed whitespace, principal suffix.
    fn normalize(question: &str, principal_id: &str) -> String {
        let folded: String = question.nfc().collect::<String>().to_lowercase();
        let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
        format!("{collapsed}{NAMESPACE_SEPARATOR}{principal_id}")
    }

    async fn fingerprint(&self, question: &str, principal_id: &str) -> Option<Vec<f32>> {
        let normalized = Self::normalize(question, principal_id);
        let provider = self.embeddings.current();
        match provider.encode(&[normalized]).await {
            Ok(mut vectors) if !vectors.is_empty() => Some(vectors.remove(0)),
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "cache fingerprint encoding failed");
                None
            }
        }
    }

    pub async fn get(&self, question: &str, principal_id: &str) -> Option<CachedAnswer> {
        if !self.config.enabled {
            return None;
        }

        let fingerprint = self.fingerprint(question, principal_id).await?;
        let now = self.tick();

        let mut entries = self.lock();
        entries.retain(|entry| !entry.expired());

        let mut best: Option<(usize, f32)> = None;
        for (idx, entry) in entries.iter().enumerate() {
            // Entries from a different provider dimension are invisible.
            if entry.fingerprint.len() != fingerprint.len() {
                continue;
            }
            let similarity = cosine_similarity(&fingerprint, &entry.fingerprint);
            if similarity >= self.config.threshold
                && best.map_or(true, |(_, best_sim)| similarity > best_sim)
            {
                best = Some((idx, similarity));
            }
        }

        let (idx, similarity) = best?;
        let entry = &mut entries[idx];
        entry.last_used = now;
        debug!(similarity, question = %entry.normalized_question, "semantic cache hit");
        Some(CachedAnswer {
            answer: entry.answer.clone(),
            sources: entry.sources.clone(),
        })
    }

    pub async fn put(
        &self,
        question: &str,
        principal_id: &str,
        answer: &str,
        sources: &[SourceRef],
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }
        let Some(fingerprint) = self.fingerprint(question, principal_id).await else {
            return;
        };

        let now = self.tick();
        let mut entries = self.lock();
        entries.push(CacheEntry {
            fingerprint,
            normalized_question: Self::normalize(question, principal_id),
            answer: answer.to_string(),
            sources: sources.to_vec(),
            created_at: Instant::now(),
            ttl: ttl.unwrap_or(self.config.ttl),
            last_used: now,
        });

        while entries.len() > self.config.max_entries {
            let Some(oldest) = entries
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(idx, _)| idx)
            else {
                break;
            };
            entries.swap_remove(oldest);
        }
    }

    /// Evicts every entry whose fingerprint dimension differs from `d`.
    /// Called when the embedding provider reloads.
    pub fn invalidate_all_with_dimension(&self, d: usize) {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| entry.fingerprint.len() == d);
        if entries.len() != before {
            debug!(
                evicted = before - entries.len(),
                dimension = d,
                "evicted cache entries after provider reload"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
