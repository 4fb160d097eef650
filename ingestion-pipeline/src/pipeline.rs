use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use common::error::AppError;
use common::storage::lexical::LexicalIndex;
use common::storage::types::ingestion_task::IngestionTask;
use common::storage::types::passage::Passage;
use common::storage::vector::VectorStore;
use common::utils::embedding::EmbeddingHandle;

use crate::chunker::{chunk, ChunkerConfig};

/// Turns one ingestion task into passages: chunk, embed, upsert to the
/// vector store, then index lexically. Both indices hold the same ids
/// when this returns; a partial failure rolls the vector writes back.
pub struct IngestionPipeline {
    embeddings: Arc<EmbeddingHandle>,
    vector: Arc<dyn VectorStore>,
    lexical: Arc<dyn LexicalIndex>,
    chunker: ChunkerConfig,
    /// Set after a provider reload whose dimension no longer matches the
    /// stored corpus; writes refuse until re-embed or recreate.
    write_degraded: Arc<AtomicBool>,
}

impl IngestionPipeline {
    pub fn new(
        embeddings: Arc<EmbeddingHandle>,
        vector: Arc<dyn VectorStore>,
        lexical: Arc<dyn LexicalIndex>,
        chunker: ChunkerConfig,
        write_degraded: Arc<AtomicBool>,
    ) -> Self {
        Self {
            embeddings,
            vector,
            lexical,
            chunker,
            write_degraded,
        }
    }

    #[instrument(skip_all, fields(task_id = %task.id))]
    pub async fn process(&self, task: &IngestionTask) -> Result<Vec<String>, AppError> {
        // One provider handle for the whole task; a reload mid-task cannot
        // mix dimensions within a batch.
        let provider = self.embeddings.current();
        let store_dimension = self.vector.dimension().await?;

        if self.write_degraded.load(Ordering::SeqCst) || provider.dimension() != store_dimension {
            return Err(AppError::DimensionMismatch {
                expected: store_dimension,
                actual: provider.dimension(),
            });
        }

        let payload = &task.payload;
        let chunks = chunk(&payload.text, &self.chunker, payload.context.as_deref());
        if chunks.is_empty() {
            return Err(AppError::Validation(
                "document produced no chunks".to_string(),
            ));
        }

        let entry_id = payload
            .entry_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let passages: Vec<Passage> = chunks
            .iter()
            .map(|piece| {
                Passage::new(
                    piece.text.clone(),
                    payload.context.clone(),
                    payload.source.clone(),
                    entry_id.clone(),
                    Some(task.submitted_by.clone()),
                    payload.visibility,
                    payload.group_ids.clone(),
                )
            })
            .collect();

        let embedding_texts: Vec<String> =
            chunks.iter().map(|piece| piece.embedding_text.clone()).collect();
        let vectors = provider.encode(&embedding_texts).await?;
        if vectors.len() != passages.len() {
            return Err(AppError::Internal(format!(
                "provider returned {} vectors for {} chunks",
                vectors.len(),
                passages.len()
            )));
        }

        let mut written: Vec<String> = Vec::with_capacity(passages.len());
        for (passage, vector) in passages.iter().zip(vectors) {
            if let Err(err) = self.vector.upsert(passage, vector).await {
                self.rollback(&written).await;
                return Err(err);
            }
            written.push(passage.id.clone());
        }

        for passage in &passages {
            if let Err(err) = self.lexical.index(passage).await {
                self.rollback(&written).await;
                return Err(err);
            }
        }

        info!(
            entry_id = %entry_id,
            passages = passages.len(),
            "ingestion task stored passages"
        );
        Ok(written)
    }

    /// Removes whatever a failed task already wrote so the indices stay in
    /// lockstep.
    async fn rollback(&self, written: &[String]) {
        if written.is_empty() {
            return;
        }
        warn!(count = written.len(), "rolling back partially written passages");
        if let Err(err) = self.vector.delete(written).await {
            warn!(error = %err, "vector rollback failed");
        }
        if let Err(err) = self.lexical.delete(written).await {
            warn!(error = %err, "lexical rollback failed");
        }
    }
}
