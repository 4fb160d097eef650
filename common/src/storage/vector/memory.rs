use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::passage::Passage;

use super::{cosine_similarity, AccessFilter, ScoredPassage, VectorStore};

/// Brute-force in-memory vector store. Backs tests and embedded
/// single-process deployments; the same contract as the Qdrant adapter.
pub struct InMemoryVectorStore {
    inner: RwLock<MemoryInner>,
}

struct MemoryInner {
    dimension: usize,
    points: HashMap<String, StoredPoint>,
}

struct StoredPoint {
    passage: Passage,
    vector: Vec<f32>,
}

impl InMemoryVectorStore {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                dimension,
                points: HashMap::new(),
            }),
        }
    }

    pub fn point_count(&self) -> usize {
        self.read().points.len()
    }

    pub fn contains(&self, passage_id: &str) -> bool {
        self.read().points.contains_key(passage_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(&self, passage: &Passage, vector: Vec<f32>) -> Result<(), AppError> {
        let mut inner = self.write();
        if vector.len() != inner.dimension {
            return Err(AppError::DimensionMismatch {
                expected: inner.dimension,
                actual: vector.len(),
            });
        }
        inner.points.insert(
            passage.id.clone(),
            StoredPoint {
                passage: passage.clone(),
                vector,
            },
        );
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &AccessFilter,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        let inner = self.read();
        if query.len() != inner.dimension {
            return Err(AppError::DimensionMismatch {
                expected: inner.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<ScoredPassage> = inner
            .points
            .values()
            .filter(|point| filter.matches(&point.passage))
            .map(|point| ScoredPassage {
                passage: point.passage.clone(),
                score: cosine_similarity(query, &point.vector),
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.passage.id.cmp(&b.passage.id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn delete(&self, passage_ids: &[String]) -> Result<(), AppError> {
        let mut inner = self.write();
        for id in passage_ids {
            inner.points.remove(id);
        }
        Ok(())
    }

    async fn delete_by_entry(&self, entry_id: &str) -> Result<Vec<String>, AppError> {
        let mut inner = self.write();
        let removed: Vec<String> = inner
            .points
            .values()
            .filter(|point| point.passage.entry_id == entry_id)
            .map(|point| point.passage.id.clone())
            .collect();
        for id in &removed {
            inner.points.remove(id);
        }
        Ok(removed)
    }

    async fn list_by_entry(&self, entry_id: &str) -> Result<Vec<Passage>, AppError> {
        Ok(self
            .read()
            .points
            .values()
            .filter(|point| point.passage.entry_id == entry_id)
            .map(|point| point.passage.clone())
            .collect())
    }

    async fn strip_group(&self, group_id: &str) -> Result<(), AppError> {
        let mut inner = self.write();
        for point in inner.points.values_mut() {
            point.passage.group_ids.remove(group_id);
        }
        Ok(())
    }

    async fn recreate(&self, dimension: usize) -> Result<(), AppError> {
        let mut inner = self.write();
        inner.dimension = dimension;
        inner.points.clear();
        Ok(())
    }

    async fn dimension(&self) -> Result<usize, AppError> {
        Ok(self.read().dimension)
    }
}
