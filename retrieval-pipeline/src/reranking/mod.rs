use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use common::{error::AppError, storage::vector::ScoredPassage, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::fusion::FusedPassage;

static NEXT_ENGINE: AtomicUsize = AtomicUsize::new(0);

fn pick_engine_index(pool_len: usize) -> usize {
    let n = NEXT_ENGINE.fetch_add(1, Ordering::Relaxed);
    n % pool_len
}

/// Pool of cross-encoder engines. Engines need `&mut`, so each sits behind
/// its own mutex; the semaphore bounds concurrent reranks.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    batch_size: usize,
}

impl RerankerPool {
    /// Build the pool at startup. `pool_size` controls max parallel reranks.
    pub fn new(pool_size: usize, batch_size: usize) -> Result<Arc<Self>, AppError> {
        Self::new_with_options(pool_size, batch_size, RerankInitOptions::default())
    }

    fn new_with_options(
        pool_size: usize,
        batch_size: usize,
        init_options: RerankInitOptions,
    ) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranker pool size must be greater than zero".to_string(),
            ));
        }

        let mut engines = Vec::with_capacity(pool_size);
        for x in 0..pool_size {
            debug!("Creating reranking engine: {x}");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::Internal(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            batch_size: batch_size.max(1),
        }))
    }

    /// Initialize a pool using application configuration; `None` when the
    /// reranker is disabled.
    pub fn maybe_from_config(config: &AppConfig) -> Result<Option<Arc<Self>>, AppError> {
        if !config.reranker_enabled {
            return Ok(None);
        }
        Self::new(default_pool_size(), config.rerank_batch_size).map(Some)
    }

    /// Check out capacity + pick an engine. The permit enforces backpressure.
    pub async fn checkout(self: &Arc<Self>) -> RerankerLease {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore closed");

        // Round-robin over the engines so index 0 isn't always the busy one.
        let idx = pick_engine_index(self.engines.len());
        let engine = Arc::clone(&self.engines[idx]);

        RerankerLease {
            _permit: permit,
            engine,
            batch_size: self.batch_size,
        }
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

/// Active lease on a single cross-encoder instance.
pub struct RerankerLease {
    // When this drops the semaphore permit is released.
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
    batch_size: usize,
}

impl RerankerLease {
    /// Scores (query, passage) pairs in batches and returns the top
    /// `k_out` candidates by score. Ties keep their fused order, and when
    /// the model scores fewer documents than `k_out`, what it scored is
    /// what the caller gets.
    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<FusedPassage>,
        k_out: usize,
    ) -> Result<Vec<ScoredPassage>, AppError> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let mut scores: Vec<(usize, f32)> = Vec::with_capacity(candidates.len());
        {
            // Lock this specific engine so we get &mut TextRerank.
            let mut guard = self.engine.lock().await;
            for (batch_start, batch) in candidates.chunks(self.batch_size).enumerate() {
                let documents: Vec<String> = batch
                    .iter()
                    .map(|candidate| candidate.scored.passage.text.clone())
                    .collect();
                let results = guard
                    .rerank(query.to_owned(), documents, false, None)
                    .map_err(|e| AppError::Internal(e.to_string()))?;

                let offset = batch_start * self.batch_size;
                for result in results {
                    scores.push((offset + result.index, result.score));
                }
            }
        }

        // Stable sort: equal scores preserve the incoming (fused) order.
        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        let mut ranked = Vec::with_capacity(k_out.min(scores.len()));
        for (index, score) in scores.into_iter().take(k_out) {
            let Some(candidate) = candidates.get(index) else {
                warn!(index, "reranker returned an out-of-range document index");
                continue;
            };
            ranked.push(ScoredPassage {
                passage: candidate.scored.passage.clone(),
                score,
            });
        }
        Ok(ranked)
    }
}
