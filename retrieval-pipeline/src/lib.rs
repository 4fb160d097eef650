#![allow(clippy::missing_docs_in_private_items)]

pub mod acl;
pub mod fusion;
pub mod reranking;
pub mod rewrite;

use std::sync::Arc;
use std::time::Instant;

use futures::future::FutureExt;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use common::error::AppError;
use common::storage::lexical::LexicalIndex;
use common::storage::types::principal::Principal;
use common::storage::vector::{AccessFilter, ScoredPassage, VectorStore};
use common::utils::embedding::EmbeddingHandle;
use common::utils::groups::GroupDirectory;

use fusion::{reciprocal_rank_fusion, Channel, ChannelRanking};
use reranking::RerankerPool;
use rewrite::QueryRewriter;

/// Fan-out multipliers for the hybrid search stages.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RetrievalTuning {
    /// Dense channel fetches `top_k * dense_mult` per variant.
    pub dense_mult: usize,
    /// Lexical channel fetches `top_k * lex_mult` per variant.
    pub lex_mult: usize,
    /// The reranker sees `top_k * rerank_mult` fused candidates.
    pub rerank_mult: usize,
    /// Concurrent per-variant searches within one query.
    pub intra_query_parallelism: usize,
}

impl Default for RetrievalTuning {
    fn default() -> Self {
        Self {
            dense_mult: 2,
            lex_mult: 2,
            rerank_mult: 3,
            intra_query_parallelism: 4,
        }
    }
}

/// What happened inside one retrieve call, for logging and API surfacing.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievalDiagnostics {
    pub variants: usize,
    pub dense_degraded: bool,
    pub lexical_degraded: bool,
    pub fused_candidates: usize,
    pub reranker_applied: bool,
    pub reranker_warning: bool,
    pub embed_ms: u128,
    pub search_ms: u128,
    pub rerank_ms: u128,
}

#[derive(Debug, Default)]
pub struct RetrievalOutcome {
    pub passages: Vec<ScoredPassage>,
    pub diagnostics: RetrievalDiagnostics,
}

/// Orchestrates ACL filtering, query expansion, dense + lexical search,
/// rank fusion and optional cross-encoder reranking.
pub struct HybridRetriever {
    embeddings: Arc<EmbeddingHandle>,
    vector: Arc<dyn VectorStore>,
    lexical: Arc<dyn LexicalIndex>,
    rewriter: QueryRewriter,
    reranker: Option<Arc<RerankerPool>>,
    groups: Arc<dyn GroupDirectory>,
    tuning: RetrievalTuning,
}

impl HybridRetriever {
    pub fn new(
        embeddings: Arc<EmbeddingHandle>,
        vector: Arc<dyn VectorStore>,
        lexical: Arc<dyn LexicalIndex>,
        rewriter: QueryRewriter,
        reranker: Option<Arc<RerankerPool>>,
        groups: Arc<dyn GroupDirectory>,
        tuning: RetrievalTuning,
    ) -> Self {
        Self {
            embeddings,
            vector,
            lexical,
            rewriter,
            reranker,
            groups,
            tuning,
        }
    }

    #[instrument(skip_all, fields(principal = %principal.id, top_k))]
    pub async fn retrieve(
        &self,
        question: &str,
        top_k: usize,
        principal: &Principal,
        group_filter: &[String],
    ) -> Result<RetrievalOutcome, AppError> {
        let mut diagnostics = RetrievalDiagnostics::default();

        let filter = acl::accessible_filter(principal, group_filter, &*self.groups).await?;
        if filter.is_empty_scope() {
            debug!("access filter is empty, returning no passages");
            return Ok(RetrievalOutcome {
                passages: Vec::new(),
                diagnostics,
            });
        }

        let variants = self.rewriter.expand(question).await;
        diagnostics.variants = variants.len();

        // One provider handle for the whole batch of variant encodings, so
        // a concurrent reload cannot split the batch across models.
        let embed_started = Instant::now();
        let provider = self.embeddings.current();
        let variant_vectors = match provider.encode(&variants).await {
            Ok(vectors) => Some(vectors),
            Err(err) => {
                warn!(error = %err, "variant encoding failed, dense channel disabled");
                diagnostics.dense_degraded = true;
                None
            }
        };
        diagnostics.embed_ms = embed_started.elapsed().as_millis();

        let search_started = Instant::now();
        let rankings = self
            .run_channel_searches(&variants, variant_vectors.as_deref(), top_k, &filter, &mut diagnostics)
            .await?;
        diagnostics.search_ms = search_started.elapsed().as_millis();

        let mut fused = reciprocal_rank_fusion(rankings);
        fused.truncate(top_k * self.tuning.rerank_mult.max(1));
        diagnostics.fused_candidates = fused.len();

        let rerank_started = Instant::now();
        let passages = match &self.reranker {
            Some(pool) => {
                let lease = pool.checkout().await;
                match lease.rerank(question, fused.clone(), top_k).await {
                    Ok(ranked) => {
                        diagnostics.reranker_applied = true;
                        ranked
                    }
                    Err(err) => {
                        warn!(error = %err, "reranking failed, keeping fused order");
                        diagnostics.reranker_warning = true;
                        take_fused(fused, top_k)
                    }
                }
            }
            None => take_fused(fused, top_k),
        };
        diagnostics.rerank_ms = rerank_started.elapsed().as_millis();

        Ok(RetrievalOutcome {
            passages,
            diagnostics,
        })
    }

    /// Runs dense and lexical searches for every variant with bounded
    /// parallelism. A channel that fails for every variant degrades the
    /// query to the other channel; both gone is `RetrievalUnavailable`.
    async fn run_channel_searches(
        &self,
        variants: &[String],
        variant_vectors: Option<&[Vec<f32>]>,
        top_k: usize,
        filter: &AccessFilter,
        diagnostics: &mut RetrievalDiagnostics,
    ) -> Result<Vec<ChannelRanking>, AppError> {
        let dense_k = top_k * self.tuning.dense_mult.max(1);
        let lex_k = top_k * self.tuning.lex_mult.max(1);

        let mut searches = Vec::new();
        for (variant_idx, variant) in variants.iter().enumerate() {
            if let Some(vectors) = variant_vectors {
                if let Some(vector) = vectors.get(variant_idx) {
                    let store = Arc::clone(&self.vector);
                    searches.push(
                        async move {
                            let result = store.search(vector, dense_k, filter).await;
                            (variant_idx, Channel::Dense, result)
                        }
                        .boxed(),
                    );
                }
            }

            let index = Arc::clone(&self.lexical);
            searches.push(
                async move {
                    let result = index.search(variant, lex_k, filter).await;
                    (variant_idx, Channel::Lexical, result)
                }
                .boxed(),
            );
        }

        let results: Vec<(usize, Channel, Result<Vec<ScoredPassage>, AppError>)> =
            stream::iter(searches)
                .buffer_unordered(self.tuning.intra_query_parallelism.max(1))
                .collect()
                .await;

        let mut rankings = Vec::new();
        let mut dense_ok = false;
        let mut lexical_ok = false;

        for (variant, channel, result) in results {
            match result {
                Ok(entries) => {
                    match channel {
                        Channel::Dense => dense_ok = true,
                        Channel::Lexical => lexical_ok = true,
                    }
                    rankings.push(ChannelRanking {
                        channel,
                        variant,
                        entries,
                    });
                }
                Err(err) => {
                    warn!(?channel, variant, error = %err, "search channel failed");
                }
            }
        }

        diagnostics.dense_degraded = diagnostics.dense_degraded || !dense_ok;
        diagnostics.lexical_degraded = !lexical_ok;

        if !dense_ok && !lexical_ok {
            return Err(AppError::RetrievalUnavailable(
                "both dense and lexical channels failed".to_string(),
            ));
        }

        Ok(rankings)
    }
}

fn take_fused(fused: Vec<fusion::FusedPassage>, top_k: usize) -> Vec<ScoredPassage> {
    fused
        .into_iter()
        .take(top_k)
        .map(|entry| entry.scored)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::storage::lexical::InMemoryBm25Index;
    use common::storage::types::passage::{Passage, Visibility};
    use common::storage::vector::InMemoryVectorStore;
    use common::test_utils::{FailingEmbedder, HashingEmbedder, ScriptedChat};
    use common::utils::embedding::EmbeddingProvider;
    use common::utils::groups::InMemoryGroupDirectory;
    use common::utils::llm::ChatCompleter;
    use std::collections::BTreeSet;

    const DIM: usize = 64;

    fn passage(id: &str, text: &str, visibility: Visibility, owner: Option<&str>) -> Passage {
        let mut p = Passage::new(
            text.to_string(),
            None,
            "notes.md".to_string(),
            "entry-1".to_string(),
            owner.map(ToString::to_string),
            visibility,
            BTreeSet::new(),
        );
        p.id = id.to_string();
        p
    }

    async fn seed(
        vector: &InMemoryVectorStore,
        lexical: &InMemoryBm25Index,
        embedder: &HashingEmbedder,
        passages: &[Passage],
    ) {
        for p in passages {
            let vectors = embedder
                .encode(&[p.embedding_text()])
                .await
                .expect("encode");
            vector
                .upsert(p, vectors.into_iter().next().expect("vector"))
                .await
                .expect("upsert");
            lexical.index(p).await.expect("index");
        }
    }

    fn retriever(
        vector: Arc<InMemoryVectorStore>,
        lexical: Arc<InMemoryBm25Index>,
        embedder: Arc<dyn EmbeddingProvider>,
        groups: Arc<InMemoryGroupDirectory>,
    ) -> HybridRetriever {
        let chat: Arc<dyn ChatCompleter> = Arc::new(ScriptedChat::failing());
        HybridRetriever::new(
            Arc::new(EmbeddingHandle::new(embedder)),
            vector,
            lexical,
            QueryRewriter::new(chat, false, 0),
            None,
            groups,
            RetrievalTuning::default(),
        )
    }

    #[tokio::test]
    async fn retrieves_relevant_passage_from_both_channels() {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let lexical = Arc::new(InMemoryBm25Index::new());
        let embedder = HashingEmbedder::new(DIM);

        let corpus = [
            passage(
                "p1",
                "Qdrant is a vector database.",
                Visibility::Public,
                None,
            ),
            passage("p2", "Sourdough rises overnight.", Visibility::Public, None),
        ];
        seed(&vector, &lexical, &embedder, &corpus).await;

        let retriever = retriever(
            Arc::clone(&vector),
            Arc::clone(&lexical),
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryGroupDirectory::new()),
        );

        let outcome = retriever
            .retrieve("What is Qdrant?", 5, &Principal::user("bob"), &[])
            .await
            .expect("retrieve");

        assert!(!outcome.passages.is_empty());
        assert_eq!(outcome.passages[0].passage.id, "p1");
        assert!(!outcome.diagnostics.dense_degraded);
        assert!(!outcome.diagnostics.lexical_degraded);
    }

    #[tokio::test]
    async fn private_passages_are_invisible_to_other_principals() {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let lexical = Arc::new(InMemoryBm25Index::new());
        let embedder = HashingEmbedder::new(DIM);

        let corpus = [
            passage(
                "p_priv",
                "Qdrant cluster credentials and secrets.",
                Visibility::Private,
                Some("alice"),
            ),
            passage(
                "p_pub",
                "Qdrant is a vector database.",
                Visibility::Public,
                Some("alice"),
            ),
        ];
        seed(&vector, &lexical, &embedder, &corpus).await;

        let retriever = retriever(
            vector,
            lexical,
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryGroupDirectory::new()),
        );

        let outcome = retriever
            .retrieve("Qdrant", 5, &Principal::user("bob"), &[])
            .await
            .expect("retrieve");

        assert!(outcome
            .passages
            .iter()
            .all(|hit| hit.passage.id != "p_priv"));
        assert!(outcome.passages.iter().any(|hit| hit.passage.id == "p_pub"));
    }

    #[tokio::test]
    async fn embedding_failure_degrades_to_lexical_only() {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let lexical = Arc::new(InMemoryBm25Index::new());
        let embedder = HashingEmbedder::new(DIM);

        let corpus = [passage(
            "p1",
            "Qdrant is a vector database.",
            Visibility::Public,
            None,
        )];
        seed(&vector, &lexical, &embedder, &corpus).await;

        let retriever = retriever(
            vector,
            lexical,
            Arc::new(FailingEmbedder::new(DIM)),
            Arc::new(InMemoryGroupDirectory::new()),
        );

        let outcome = retriever
            .retrieve("Qdrant database", 5, &Principal::user("bob"), &[])
            .await
            .expect("retrieve");

        assert!(outcome.diagnostics.dense_degraded);
        assert!(!outcome.passages.is_empty(), "lexical channel still serves");
    }

    #[tokio::test]
    async fn both_channels_failing_is_retrieval_unavailable() {
        struct BrokenIndex;

        #[async_trait]
        impl LexicalIndex for BrokenIndex {
            async fn index(&self, _passage: &Passage) -> Result<(), AppError> {
                Ok(())
            }
            async fn search(
                &self,
                _query: &str,
                _k: usize,
                _filter: &AccessFilter,
            ) -> Result<Vec<ScoredPassage>, AppError> {
                Err(AppError::Internal("lexical backend down".to_string()))
            }
            async fn delete(&self, _passage_ids: &[String]) -> Result<(), AppError> {
                Ok(())
            }
            async fn delete_by_entry(&self, _entry_id: &str) -> Result<Vec<String>, AppError> {
                Ok(Vec::new())
            }
            async fn strip_group(&self, _group_id: &str) -> Result<(), AppError> {
                Ok(())
            }
            async fn rebuild(&self, _passages: Vec<Passage>) -> Result<(), AppError> {
                Ok(())
            }
            async fn contains(&self, _passage_id: &str) -> Result<bool, AppError> {
                Ok(false)
            }
        }

        let chat: Arc<dyn ChatCompleter> = Arc::new(ScriptedChat::failing());
        let retriever = HybridRetriever::new(
            Arc::new(EmbeddingHandle::new(Arc::new(FailingEmbedder::new(DIM)))),
            Arc::new(InMemoryVectorStore::new(DIM)),
            Arc::new(BrokenIndex),
            QueryRewriter::new(chat, false, 0),
            None,
            Arc::new(InMemoryGroupDirectory::new()),
            RetrievalTuning::default(),
        );

        let err = retriever
            .retrieve("anything", 5, &Principal::user("bob"), &[])
            .await
            .expect_err("should fail");
        assert!(matches!(err, AppError::RetrievalUnavailable(_)));
    }

    #[tokio::test]
    async fn empty_group_scope_short_circuits() {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let lexical = Arc::new(InMemoryBm25Index::new());
        let embedder = HashingEmbedder::new(DIM);

        let corpus = [passage(
            "p1",
            "Qdrant is a vector database.",
            Visibility::Public,
            None,
        )];
        seed(&vector, &lexical, &embedder, &corpus).await;

        let retriever = retriever(
            vector,
            lexical,
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryGroupDirectory::new()),
        );

        let outcome = retriever
            .retrieve(
                "Qdrant",
                5,
                &Principal::user("bob"),
                &["nonexistent-group".to_string()],
            )
            .await
            .expect("retrieve");
        assert!(outcome.passages.is_empty());
    }

    #[tokio::test]
    async fn identical_inputs_produce_identical_ordering() {
        let vector = Arc::new(InMemoryVectorStore::new(DIM));
        let lexical = Arc::new(InMemoryBm25Index::new());
        let embedder = HashingEmbedder::new(DIM);

        let corpus: Vec<Passage> = (0..8)
            .map(|i| {
                passage(
                    &format!("p{i}"),
                    &format!("vector database notes part {i}"),
                    Visibility::Public,
                    None,
                )
            })
            .collect();
        seed(&vector, &lexical, &embedder, &corpus).await;

        let retriever = retriever(
            vector,
            lexical,
            Arc::new(HashingEmbedder::new(DIM)),
            Arc::new(InMemoryGroupDirectory::new()),
        );

        let first: Vec<String> = retriever
            .retrieve("vector database", 5, &Principal::user("bob"), &[])
            .await
            .expect("retrieve")
            .passages
            .into_iter()
            .map(|hit| hit.passage.id)
            .collect();
        let second: Vec<String> = retriever
            .retrieve("vector database", 5, &Principal::user("bob"), &[])
            .await
            .expect("retrieve")
            .passages
            .into_iter()
            .map(|hit| hit.passage.id)
            .collect();

        assert_eq!(first, second);
    }
}
