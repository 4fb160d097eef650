pub mod memory;
pub mod qdrant;

use std::collections::HashSet;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::passage::{Passage, Visibility};

pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantVectorStore;

/// A passage together with its retrieval score (cosine for the vector
/// store, BM25 for the lexical index).
#[derive(Debug, Clone)]
pub struct ScoredPassage {
    pub passage: Passage,
    pub score: f32,
}

/// Predicate form of an access filter: a passage is visible when the base
/// disjunction (own, public, or member of a readable group) holds, and,
/// if a group restriction is present, the passage belongs to at least one
/// of the restricted groups.
#[derive(Debug, Clone, Default)]
pub struct ScopedFilter {
    pub owner_id: Option<String>,
    pub include_public: bool,
    pub readable_group_ids: HashSet<String>,
    pub restrict_to_group_ids: Option<HashSet<String>>,
}

impl ScopedFilter {
    pub fn matches(&self, passage: &Passage) -> bool {
        let owned = match (self.owner_id.as_deref(), passage.owner_id.as_deref()) {
            (Some(filter_owner), Some(passage_owner)) => filter_owner == passage_owner,
            _ => false,
        };
        let base = owned
            || (self.include_public && passage.visibility == Visibility::Public)
            || passage
                .group_ids
                .iter()
                .any(|group| self.readable_group_ids.contains(group));

        let restricted = match &self.restrict_to_group_ids {
            Some(groups) => passage.group_ids.iter().any(|group| groups.contains(group)),
            None => true,
        };

        base && restricted
    }
}

/// What the access-control filter hands to both indices: a sentinel meaning
/// "no filter" (admin), an explicit id allowlist, or a predicate. Unbounded
/// access is never materialized as an id set.
#[derive(Debug, Clone)]
pub enum AccessFilter {
    Unbounded,
    Ids(HashSet<String>),
    Scoped(ScopedFilter),
}

impl AccessFilter {
    pub fn matches(&self, passage: &Passage) -> bool {
        match self {
            Self::Unbounded => true,
            Self::Ids(ids) => ids.contains(&passage.id),
            Self::Scoped(scoped) => scoped.matches(passage),
        }
    }

    /// A filter that provably matches nothing. The retriever short-circuits
    /// on these instead of querying the indices.
    pub fn is_empty_scope(&self) -> bool {
        match self {
            Self::Unbounded => false,
            Self::Ids(ids) => ids.is_empty(),
            Self::Scoped(scoped) => scoped
                .restrict_to_group_ids
                .as_ref()
                .is_some_and(HashSet::is_empty),
        }
    }
}

/// Dense-vector side of the corpus. Upserts are idempotent on passage id;
/// a vector whose length differs from the collection dimension is rejected
/// with `DimensionMismatch`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    async fn upsert(&self, passage: &Passage, vector: Vec<f32>) -> Result<(), AppError>;

    /// At most `k` results by descending cosine similarity, post-filtered.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &AccessFilter,
    ) -> Result<Vec<ScoredPassage>, AppError>;

    async fn delete(&self, passage_ids: &[String]) -> Result<(), AppError>;

    /// Removes every passage of an entry, returning the removed ids.
    async fn delete_by_entry(&self, entry_id: &str) -> Result<Vec<String>, AppError>;

    async fn list_by_entry(&self, entry_id: &str) -> Result<Vec<Passage>, AppError>;

    /// Cascades a group deletion into stored payloads.
    async fn strip_group(&self, group_id: &str) -> Result<(), AppError>;

    /// Drops all points and resets the collection to `dimension`.
    async fn recreate(&self, dimension: usize) -> Result<(), AppError>;

    async fn dimension(&self) -> Result<usize, AppError>;
}

/// Cosine similarity of two raw vectors; zero when either is degenerate.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
