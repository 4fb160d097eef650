#![allow(clippy::missing_docs_in_private_items)]

//! Composition root of the QA core. Everything is wired once through the
//! builder and passed around as handles; there are no hidden globals, and
//! a provider reload swaps one atomically-updated handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use futures::Stream;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use answer_pipeline::{AnswerEvent, AnswerResult, QaChain, QaChainConfig, QaOptions, SemanticCache};
use answer_pipeline::cache::CacheConfig;
use common::error::AppError;
use common::storage::lexical::{InMemoryBm25Index, LexicalIndex};
use common::storage::types::ingestion_task::{IngestionPayload, TaskStatusView};
use common::storage::types::principal::Principal;
use common::storage::types::conversation::SessionStore;
use common::storage::vector::{InMemoryVectorStore, VectorStore};
use common::utils::config::AppConfig;
use common::utils::embedding::{
    EmbeddingHandle, EmbeddingProvider, LocalEmbeddingProvider, ReloadReport,
    RemoteEmbeddingProvider,
};
use common::utils::groups::{GroupDirectory, InMemoryGroupDirectory};
use common::utils::identity::{IdentityResolver, StaticIdentityResolver};
use common::utils::llm::{ChatCompleter, OpenAiChat};
use ingestion_pipeline::{
    validate_ingest_payload, IngestionPipeline, QueueConfig, TaskQueue,
};
use retrieval_pipeline::reranking::RerankerPool;
use retrieval_pipeline::rewrite::QueryRewriter;
use retrieval_pipeline::{HybridRetriever, RetrievalTuning};

pub use answer_pipeline::SourceRef;

/// Result row of the LLM-free search surface.
#[derive(Debug, Clone, Serialize)]
pub struct PassageHit {
    pub passage_id: String,
    pub source: String,
    pub score: f32,
    pub preview: String,
    pub text: String,
}

/// Builds an embedding provider for a provider id; async because local
/// models load model files.
pub type ProviderFactory = Arc<
    dyn Fn(&str) -> BoxFuture<'static, Result<Arc<dyn EmbeddingProvider>, AppError>>
        + Send
        + Sync,
>;

/// Wires the tracing subscriber for binaries embedding the core.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn default_provider_factory(config: &AppConfig) -> ProviderFactory {
    let config = config.clone();
    Arc::new(move |provider_id: &str| {
        let config = config.clone();
        let provider_id = provider_id.to_string();
        Box::pin(async move {
            match provider_id.as_str() {
                "remote" => Ok(Arc::new(RemoteEmbeddingProvider::from_config(&config))
                    as Arc<dyn EmbeddingProvider>),
                "local" => Ok(Arc::new(LocalEmbeddingProvider::from_config(&config).await?)
                    as Arc<dyn EmbeddingProvider>),
                other => Err(AppError::Validation(format!(
                    "unknown embedding provider id: {other}"
                ))),
            }
        })
    })
}

/// Constructor-injection builder for [`KnowledgeCore`]. Collaborators not
/// supplied fall back to in-memory/stock implementations built from the
/// config.
pub struct KnowledgeCoreBuilder {
    config: AppConfig,
    identity: Option<Arc<dyn IdentityResolver>>,
    groups: Option<Arc<dyn GroupDirectory>>,
    vector: Option<Arc<dyn VectorStore>>,
    lexical: Option<Arc<dyn LexicalIndex>>,
    chat: Option<Arc<dyn ChatCompleter>>,
    provider_factory: Option<ProviderFactory>,
    reranker: Option<Arc<RerankerPool>>,
    tuning: RetrievalTuning,
}

impl KnowledgeCoreBuilder {
    pub fn new(config: AppConfig) -> Self {
        let tuning = RetrievalTuning {
            intra_query_parallelism: config.intra_query_parallelism,
            ..RetrievalTuning::default()
        };
        Self {
            config,
            identity: None,
            groups: None,
            vector: None,
            lexical: None,
            chat: None,
            provider_factory: None,
            reranker: None,
            tuning,
        }
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_groups(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_vector_store(mut self, vector: Arc<dyn VectorStore>) -> Self {
        self.vector = Some(vector);
        self
    }

    pub fn with_lexical_index(mut self, lexical: Arc<dyn LexicalIndex>) -> Self {
        self.lexical = Some(lexical);
        self
    }

    pub fn with_chat(mut self, chat: Arc<dyn ChatCompleter>) -> Self {
        self.chat = Some(chat);
        self
    }

    pub fn with_provider_factory(mut self, factory: ProviderFactory) -> Self {
        self.provider_factory = Some(factory);
        self
    }

    pub fn with_reranker(mut self, reranker: Arc<RerankerPool>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn with_tuning(mut self, tuning: RetrievalTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub async fn build(self) -> Result<KnowledgeCore, AppError> {
        let config = self.config;

        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(StaticIdentityResolver::new()));
        let groups = self
            .groups
            .unwrap_or_else(|| Arc::new(InMemoryGroupDirectory::new()));
        let vector = self
            .vector
            .unwrap_or_else(|| Arc::new(InMemoryVectorStore::new(config.embedding_dimensions)));
        let lexical = self
            .lexical
            .unwrap_or_else(|| Arc::new(InMemoryBm25Index::new()));
        let chat = self
            .chat
            .unwrap_or_else(|| Arc::new(OpenAiChat::from_config(&config)));
        let provider_factory = self
            .provider_factory
            .unwrap_or_else(|| default_provider_factory(&config));

        let initial_provider = provider_factory(&config.embedding_provider_id).await?;
        let embeddings = Arc::new(EmbeddingHandle::new(initial_provider));

        let reranker = match self.reranker {
            Some(pool) => Some(pool),
            None => RerankerPool::maybe_from_config(&config)?,
        };

        let rewriter = QueryRewriter::new(
            Arc::clone(&chat),
            config.query_rewrite_enabled,
            config.n_variants,
        );
        let retriever = Arc::new(HybridRetriever::new(
            Arc::clone(&embeddings),
            Arc::clone(&vector),
            Arc::clone(&lexical),
            rewriter,
            reranker,
            Arc::clone(&groups),
            self.tuning,
        ));

        let cache = Arc::new(SemanticCache::new(
            Arc::clone(&embeddings),
            CacheConfig::from(&config),
        ));

        let qa = Arc::new(QaChain::new(
            Arc::clone(&retriever),
            Arc::clone(&chat),
            Arc::clone(&cache),
            Arc::new(SessionStore::new()),
            QaChainConfig::from(&config),
        )?);

        let degraded_writes = Arc::new(AtomicBool::new(false));
        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&embeddings),
            Arc::clone(&vector),
            Arc::clone(&lexical),
            ingestion_pipeline::ChunkerConfig {
                chunk_size: config.chunk_size,
                overlap: config.chunk_overlap,
                context_prefix_max: config.context_prefix_max,
            },
            Arc::clone(&degraded_writes),
        ));
        let queue = TaskQueue::start(pipeline, QueueConfig::from(&config));

        let embedding_target = RwLock::new(config.embedding_provider_id.clone());
        let active_target = RwLock::new(config.embedding_provider_id.clone());

        Ok(KnowledgeCore {
            config,
            identity,
            groups,
            vector,
            lexical,
            embeddings,
            cache,
            retriever,
            qa,
            queue,
            degraded_writes,
            provider_factory,
            embedding_target,
            active_target,
        })
    }
}

/// The transport-neutral service API of the QA core.
pub struct KnowledgeCore {
    config: AppConfig,
    identity: Arc<dyn IdentityResolver>,
    groups: Arc<dyn GroupDirectory>,
    vector: Arc<dyn VectorStore>,
    lexical: Arc<dyn LexicalIndex>,
    embeddings: Arc<EmbeddingHandle>,
    cache: Arc<SemanticCache>,
    retriever: Arc<HybridRetriever>,
    qa: Arc<QaChain>,
    queue: Arc<TaskQueue>,
    /// Raised when the active provider dimension no longer matches the
    /// stored corpus; lowered by `recreate_collection`.
    degraded_writes: Arc<AtomicBool>,
    provider_factory: ProviderFactory,
    /// Provider id `reload_embedding_provider` converges on.
    embedding_target: RwLock<String>,
    /// Provider id the active provider was built from.
    active_target: RwLock<String>,
}

impl KnowledgeCore {
    pub fn builder(config: AppConfig) -> KnowledgeCoreBuilder {
        KnowledgeCoreBuilder::new(config)
    }

    async fn resolve(&self, principal_handle: &str) -> Result<Principal, AppError> {
        self.identity.resolve(principal_handle).await
    }

    pub async fn answer(
        &self,
        question: &str,
        principal_handle: &str,
        opts: &QaOptions,
    ) -> Result<AnswerResult, AppError> {
        let principal = self.resolve(principal_handle).await?;
        self.qa.answer(question, &principal, opts).await
    }

    pub async fn answer_stream(
        &self,
        question: String,
        principal_handle: &str,
        opts: QaOptions,
    ) -> Result<impl Stream<Item = AnswerEvent> + Send + 'static, AppError> {
        let principal = self.resolve(principal_handle).await?;
        Ok(self.qa.answer_stream(question, principal, opts))
    }

    /// Retrieval without generation.
    pub async fn search(
        &self,
        query: &str,
        top_k: usize,
        group_filter: &[String],
        principal_handle: &str,
    ) -> Result<Vec<PassageHit>, AppError> {
        let principal = self.resolve(principal_handle).await?;
        let outcome = self
            .retriever
            .retrieve(query, top_k, &principal, group_filter)
            .await?;

        Ok(outcome
            .passages
            .into_iter()
            .map(|hit| PassageHit {
                passage_id: hit.passage.id.clone(),
                source: hit.passage.source.clone(),
                score: hit.score,
                preview: hit.passage.preview(160),
                text: hit.passage.text,
            })
            .collect())
    }

    /// Fire-and-poll ingestion. The submitting principal must be able to
    /// write every group the payload names.
    pub async fn submit_ingestion(
        &self,
        payload: IngestionPayload,
        principal_handle: &str,
    ) -> Result<String, AppError> {
        let principal = self.resolve(principal_handle).await?;
        if principal.is_anonymous() {
            return Err(AppError::Unauthorized(
                "ingestion requires an authenticated principal".to_string(),
            ));
        }
        validate_ingest_payload(&self.config, &payload)?;

        if !principal.is_admin() {
            for group_id in &payload.group_ids {
                let writable = match self.groups.group_by_id(group_id).await? {
                    Some(group) => {
                        group.allows_write(&principal.id)
                            || principal.groups_writable.contains(group_id)
                    }
                    None => false,
                };
                if !writable {
                    return Err(AppError::Forbidden(format!(
                        "no write access to group {group_id}"
                    )));
                }
            }
        }

        self.queue.submit(payload, principal.id)
    }

    /// Status snapshot, visible to the submitter and admins only.
    pub async fn task_status(
        &self,
        task_id: &str,
        principal_handle: &str,
    ) -> Result<TaskStatusView, AppError> {
        let principal = self.resolve(principal_handle).await?;
        let view = self.queue.get_status(task_id)?;
        if !principal.is_admin() && view.submitted_by != principal.id {
            return Err(AppError::Forbidden(
                "task belongs to another principal".to_string(),
            ));
        }
        Ok(view)
    }

    /// Removes every passage of an entry from both indices before
    /// returning.
    pub async fn delete_passages_by_entry(
        &self,
        entry_id: &str,
        principal_handle: &str,
    ) -> Result<(), AppError> {
        let principal = self.resolve(principal_handle).await?;
        let passages = self.vector.list_by_entry(entry_id).await?;
        if passages.is_empty() {
            return Err(AppError::NotFound(format!("entry {entry_id}")));
        }

        let owns_entry = passages
            .iter()
            .all(|passage| passage.owner_id.as_deref() == Some(principal.id.as_str()));
        if !principal.is_admin() && !owns_entry {
            return Err(AppError::Forbidden(
                "entry belongs to another principal".to_string(),
            ));
        }

        let removed = self.vector.delete_by_entry(entry_id).await?;
        self.lexical.delete_by_entry(entry_id).await?;
        info!(entry_id, passages = removed.len(), "deleted entry passages");
        Ok(())
    }

    /// Cascades a group deletion into both indices' payloads. Called by
    /// the host's admin layer after it removes the group itself.
    pub async fn purge_group(
        &self,
        group_id: &str,
        principal_handle: &str,
    ) -> Result<(), AppError> {
        let principal = self.resolve(principal_handle).await?;
        if !principal.is_admin() {
            return Err(AppError::Forbidden(
                "group purge is an admin operation".to_string(),
            ));
        }
        self.vector.strip_group(group_id).await?;
        self.lexical.strip_group(group_id).await?;
        Ok(())
    }

    /// Points the next reload at a different provider id.
    pub fn set_embedding_provider_target(&self, provider_id: &str) {
        let mut target = self
            .embedding_target
            .write()
            .unwrap_or_else(|e| e.into_inner());
        *target = provider_id.to_string();
    }

    /// Swaps the embedding provider when the configured target differs
    /// from the active one. Same target is a no-op. A dimension change
    /// evicts mismatched cache entries and puts ingestion into refuse-
    /// writes mode until the corpus is re-embedded or recreated.
    pub async fn reload_embedding_provider(&self) -> Result<ReloadReport, AppError> {
        let target = self
            .embedding_target
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let active = self.embeddings.current();

        {
            let active_target = self.active_target.read().unwrap_or_else(|e| e.into_inner());
            if *active_target == target {
                return Ok(ReloadReport {
                    previous_id: active.id().to_string(),
                    active_id: active.id().to_string(),
                    dimension: active.dimension(),
                    swapped: false,
                    write_degraded: self.degraded_writes.load(Ordering::SeqCst),
                });
            }
        }

        let next = (self.provider_factory)(&target).await?;
        let previous = self.embeddings.swap(Arc::clone(&next));
        *self.active_target.write().unwrap_or_else(|e| e.into_inner()) = target;
        let dimension = next.dimension();
        let store_dimension = self.vector.dimension().await?;
        let write_degraded = dimension != store_dimension;
        self.degraded_writes.store(write_degraded, Ordering::SeqCst);
        self.cache.invalidate_all_with_dimension(dimension);

        if write_degraded {
            warn!(
                provider = next.id(),
                dimension,
                store_dimension,
                "provider dimension differs from stored corpus, refusing ingestion writes"
            );
        }

        Ok(ReloadReport {
            previous_id: previous.id().to_string(),
            active_id: next.id().to_string(),
            dimension,
            swapped: true,
            write_degraded,
        })
    }

    /// Drops and recreates the vector collection at the active provider's
    /// dimension, clearing the degraded-writes mode. The lexical index is
    /// rebuilt empty alongside; re-ingestion is the host's bulk job.
    pub async fn recreate_collection(&self, principal_handle: &str) -> Result<(), AppError> {
        let principal = self.resolve(principal_handle).await?;
        if !principal.is_admin() {
            return Err(AppError::Forbidden(
                "collection recreation is an admin operation".to_string(),
            ));
        }

        let dimension = self.embeddings.current().dimension();
        self.vector.recreate(dimension).await?;
        self.lexical.rebuild(Vec::new()).await?;
        self.degraded_writes.store(false, Ordering::SeqCst);
        info!(dimension, "vector collection recreated");
        Ok(())
    }

    /// Stops the worker pool; queued tasks are failed with `shutdown`.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
