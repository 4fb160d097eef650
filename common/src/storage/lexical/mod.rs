pub mod bm25;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::passage::Passage;
use crate::storage::vector::{AccessFilter, ScoredPassage};

pub use bm25::InMemoryBm25Index;

/// Keyword side of the corpus. Mirrors the vector store's mutation surface
/// so ingestion can keep both in lockstep; scoring is BM25.
#[async_trait]
pub trait LexicalIndex: Send + Sync {
    async fn index(&self, passage: &Passage) -> Result<(), AppError>;

    async fn search(
        &self,
        query: &str,
        k: usize,
        filter: &AccessFilter,
    ) -> Result<Vec<ScoredPassage>, AppError>;

    async fn delete(&self, passage_ids: &[String]) -> Result<(), AppError>;

    async fn delete_by_entry(&self, entry_id: &str) -> Result<Vec<String>, AppError>;

    async fn strip_group(&self, group_id: &str) -> Result<(), AppError>;

    /// Drops the index and re-indexes the given passages.
    async fn rebuild(&self, passages: Vec<Passage>) -> Result<(), AppError>;

    async fn contains(&self, passage_id: &str) -> Result<bool, AppError>;
}
