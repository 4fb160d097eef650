use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::passage::Passage;
use crate::storage::vector::{AccessFilter, ScoredPassage};

use super::LexicalIndex;

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Candidates ranked before the access filter is applied. The index has no
/// native filtering, so it over-fetches and intersects afterwards.
const OVERFETCH_POOL: usize = 4096;

/// Lowercases, strips punctuation and splits on whitespace. CJK code
/// points carry no whitespace segmentation, so each one becomes its own
/// token.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for ch in text.chars() {
        if is_cjk(ch) {
            if !current.is_empty() {
                tokens.push(std::mem::take(&mut current));
            }
            tokens.push(ch.to_lowercase().collect());
        } else if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn is_cjk(ch: char) -> bool {
    matches!(ch as u32,
        0x4E00..=0x9FFF          // CJK unified ideographs
        | 0x3400..=0x4DBF        // extension A
        | 0x20000..=0x2A6DF      // extension B
        | 0xF900..=0xFAFF        // compatibility ideographs
        | 0x3040..=0x309F        // hiragana
        | 0x30A0..=0x30FF        // katakana
        | 0xAC00..=0xD7AF        // hangul syllables
    )
}

struct DocEntry {
    passage: Passage,
    term_freq: HashMap<String, u32>,
    length: usize,
}

#[derive(Default)]
struct IndexInner {
    docs: HashMap<String, DocEntry>,
    total_length: usize,
}

impl IndexInner {
    fn insert(&mut self, passage: Passage) {
        self.remove(&passage.id);

        let tokens = tokenize(&passage.text);
        let mut term_freq: HashMap<String, u32> = HashMap::new();
        for token in &tokens {
            *term_freq.entry(token.clone()).or_insert(0) += 1;
        }
        self.total_length += tokens.len();
        self.docs.insert(
            passage.id.clone(),
            DocEntry {
                passage,
                term_freq,
                length: tokens.len(),
            },
        );
    }

    fn remove(&mut self, passage_id: &str) {
        if let Some(entry) = self.docs.remove(passage_id) {
            self.total_length -= entry.length;
        }
    }

    fn avg_length(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_length as f32 / self.docs.len() as f32
        }
    }

    fn doc_freq(&self, term: &str) -> usize {
        self.docs
            .values()
            .filter(|doc| doc.term_freq.contains_key(term))
            .count()
    }
}

/// In-memory BM25 index over the same corpus the vector store holds.
pub struct InMemoryBm25Index {
    inner: RwLock<IndexInner>,
}

impl InMemoryBm25Index {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner::default()),
        }
    }

    pub fn doc_count(&self) -> usize {
        self.read().docs.len()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, IndexInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, IndexInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn score_all(inner: &IndexInner, query: &str) -> Vec<(String, f32)> {
        let query_terms: Vec<String> = tokenize(query);
        if query_terms.is_empty() {
            return Vec::new();
        }

        let doc_count = inner.docs.len() as f32;
        let avg_len = inner.avg_length();

        let mut unique_terms: HashSet<&str> = HashSet::new();
        let idf: HashMap<&str, f32> = query_terms
            .iter()
            .filter(|term| unique_terms.insert(term.as_str()))
            .map(|term| {
                let df = inner.doc_freq(term) as f32;
                let idf = ((doc_count - df + 0.5) / (df + 0.5) + 1.0).ln();
                (term.as_str(), idf)
            })
            .collect();

        let mut scored: Vec<(String, f32)> = inner
            .docs
            .values()
            .filter_map(|doc| {
                let mut score = 0.0;
                for (term, idf) in &idf {
                    let Some(freq) = doc.term_freq.get(*term) else {
                        continue;
                    };
                    let freq = *freq as f32;
                    let norm = BM25_K1
                        * (1.0 - BM25_B + BM25_B * doc.length as f32 / avg_len.max(1.0));
                    score += idf * (freq * (BM25_K1 + 1.0)) / (freq + norm);
                }
                (score > 0.0).then(|| (doc.passage.id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored
    }
}

impl Default for InMemoryBm25Index {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LexicalIndex for InMemoryBm25Index {
    async fn index(&self, passage: &Passage) -> Result<(), AppError> {
        self.write().insert(passage.clone());
        Ok(())
    }

    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &AccessFilter,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let inner = self.read();
        let ranked = Self::score_all(&inner, query);

        let results = ranked
            .into_iter()
            .take(OVERFETCH_POOL)
            .filter_map(|(id, score)| {
                let doc = inner.docs.get(&id)?;
                filter.matches(&doc.passage).then(|| ScoredPassage {
                    passage: doc.passage.clone(),
                    score,
                })
            })
            .take(k)
            .collect();

        Ok(results)
    }

    async fn delete(&self, passage_ids: &[String]) -> Result<(), AppError> {
        let mut inner = self.write();
        for id in passage_ids {
            inner.remove(id);
        }
        Ok(())
    }

    async fn delete_by_entry(&self, entry_id: &str) -> Result<Vec<String>, AppError> {
        let mut inner = self.write();
        let removed: Vec<String> = inner
            .docs
            .values()
            .filter(|doc| doc.passage.entry_id == entry_id)
            .map(|doc| doc.passage.id.clone())
            .collect();
        for id in &removed {
            inner.remove(id);
        }
        Ok(removed)
    }

    async fn strip_group(&self, group_id: &str) -> Result<(), AppError> {
        let mut inner = self.write();
        for doc in inner.docs.values_mut() {
            doc.passage.group_ids.remove(group_id);
        }
        Ok(())
    }

    async fn rebuild(&self, passages: Vec<Passage>) -> Result<(), AppError> {
        let mut inner = self.write();
        *inner = IndexInner::default();
        for passage in passages {
            inner.insert(passage);
        }
        Ok(())
    }

    async fn contains(&self, passage_id: &str) -> Result<bool, AppError> {
        Ok(self.read().docs.contains_key(passage_id))
    }
}
