#![allow(clippy::missing_docs_in_private_items)]

pub mod cache;
pub mod citations;
pub mod context;
pub mod history;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use common::error::AppError;
use common::storage::types::conversation::{format_history, ConversationState, SessionStore, Turn};
use common::storage::types::principal::Principal;
use common::utils::config::AppConfig;
use common::utils::llm::{ChatCompleter, ChatMessage};
use retrieval_pipeline::{HybridRetriever, RetrievalDiagnostics};

use citations::CitationExtractor;
use context::{assemble_context, AssembledContext};
use history::HistoryCompressor;

pub use cache::{CacheConfig, SemanticCache};
pub use context::ContextBudget;
pub use history::HistoryPolicy;

const SYSTEM_INSTRUCTION: &str = "You answer questions strictly from the numbered context \
passages provided. Cite every claim with the marker [^N] where N is the \
passage number. If the passages do not support an answer, say you don't \
know instead of guessing, and cite nothing.";

/// One attributable source behind an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub index: usize,
    pub passage_id: String,
    pub source: String,
    pub score: f32,
    pub preview: String,
}

#[derive(Debug, Clone, Default)]
pub struct QaOptions {
    pub top_k: Option<usize>,
    pub group_filter: Vec<String>,
    pub session_id: Option<String>,
    /// Remaining budget of the caller's request, minus a safety margin.
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct AnswerResult {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub highlights: HashMap<usize, usize>,
    pub from_cache: bool,
    pub is_refusal: bool,
    pub diagnostics: Option<RetrievalDiagnostics>,
}

/// Event shape of the streaming answer surface.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnswerEvent {
    Sources(Vec<SourceRef>),
    Chunk(String),
    Highlights(HashMap<usize, usize>),
    Done,
    Error { message: String },
}

#[derive(Debug, Clone)]
pub struct QaChainConfig {
    pub top_k: usize,
    pub history: HistoryPolicy,
    pub budget: ContextBudget,
    pub citation_pattern: String,
    pub refusal_phrases: Vec<String>,
    pub max_session_turns: usize,
    pub session_reject_busy: bool,
}

impl From<&AppConfig> for QaChainConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            top_k: config.top_k,
            history: HistoryPolicy::from(config),
            budget: ContextBudget::from(config),
            citation_pattern: config.citation_pattern.clone(),
            refusal_phrases: config.refusal_phrases.clone(),
            max_session_turns: config.max_session_turns,
            session_reject_busy: config.session_reject_busy,
        }
    }
}

/// The QA chain: cache probe, history compression, retrieval, context
/// assembly, generation, citation extraction and the cache write-behind.
pub struct QaChain {
    retriever: Arc<HybridRetriever>,
    chat: Arc<dyn ChatCompleter>,
    cache: Arc<SemanticCache>,
    compressor: HistoryCompressor,
    sessions: Arc<SessionStore>,
    citations: CitationExtractor,
    config: QaChainConfig,
}

impl QaChain {
    pub fn new(
        retriever: Arc<HybridRetriever>,
        chat: Arc<dyn ChatCompleter>,
        cache: Arc<SemanticCache>,
        sessions: Arc<SessionStore>,
        config: QaChainConfig,
    ) -> Result<Self, AppError> {
        let citations = CitationExtractor::new(&config.citation_pattern)?;
        let compressor = HistoryCompressor::new(Arc::clone(&chat), config.history);
        Ok(Self {
            retriever,
            chat,
            cache,
            compressor,
            sessions,
            citations,
            config,
        })
    }

    /// Serializes concurrent answers on the same session: the second
    /// caller waits, or receives `SessionBusy` when configured to reject.
    async fn lock_session(
        &self,
        session_id: Option<&str>,
    ) -> Result<Option<OwnedMutexGuard<ConversationState>>, AppError> {
        let Some(session_id) = session_id else {
            return Ok(None);
        };
        let session = self.sessions.session(session_id);
        if self.config.session_reject_busy {
            session
                .try_lock_owned()
                .map(Some)
                .map_err(|_| AppError::SessionBusy)
        } else {
            Ok(Some(session.lock_owned().await))
        }
    }

    fn build_messages(
        &self,
        question: &str,
        assembled: &AssembledContext,
        history: Option<&ConversationState>,
    ) -> Vec<ChatMessage> {
        let mut user_message = format!(
            "Context passages:\n==================\n{}\n\n",
            assembled.block
        );
        if let Some(state) = history {
            if !state.turns.is_empty() {
                user_message.push_str(&format!(
                    "Chat history:\n==================\n{}\n\n",
                    format_history(&state.turns)
                ));
            }
        }
        user_message.push_str(&format!(
            "User Question:\n==================\n{question}"
        ));

        vec![
            ChatMessage::system(SYSTEM_INSTRUCTION),
            ChatMessage::user(user_message),
        ]
    }

    fn record_turns(
        &self,
        session: Option<&mut ConversationState>,
        question: &str,
        answer: &str,
    ) {
        if let Some(state) = session {
            state.push_turn(Turn::user(question), self.config.max_session_turns);
            state.push_turn(Turn::assistant(answer), self.config.max_session_turns);
        }
    }

    fn cached_result(&self, cached: cache::CachedAnswer) -> AnswerResult {
        let index_map: HashMap<usize, String> = cached
            .sources
            .iter()
            .map(|source| (source.index, source.passage_id.clone()))
            .collect();
        let highlights = self.citations.highlights(&cached.answer, &index_map);
        AnswerResult {
            answer: cached.answer,
            sources: cached.sources,
            highlights,
            from_cache: true,
            is_refusal: false,
            diagnostics: None,
        }
    }

    #[instrument(skip_all, fields(principal = %principal.id))]
    pub async fn answer(
        &self,
        question: &str,
        principal: &Principal,
        opts: &QaOptions,
    ) -> Result<AnswerResult, AppError> {
        let mut session = self.lock_session(opts.session_id.as_deref()).await?;
        let history_unused = session.as_deref().map_or(true, ConversationState::is_empty);

        if history_unused {
            if let Some(cached) = self.cache.get(question, &principal.id).await {
                debug!("answering from semantic cache");
                let result = self.cached_result(cached);
                self.record_turns(session.as_deref_mut(), question, &result.answer);
                return Ok(result);
            }
        }

        if let Some(state) = session.as_deref_mut() {
            self.compressor.compress(state).await;
        }

        let top_k = opts.top_k.unwrap_or(self.config.top_k);
        let outcome = self
            .retriever
            .retrieve(question, top_k, principal, &opts.group_filter)
            .await?;
        let assembled = assemble_context(&outcome.passages, &self.config.budget);

        let messages = self.build_messages(question, &assembled, session.as_deref());
        let answer = match opts.deadline {
            Some(deadline) => timeout(deadline, self.chat.complete(&messages))
                .await
                .map_err(|_| {
                    AppError::DeadlineExceeded(format!("generation exceeded {deadline:?}"))
                })??,
            None => self.chat.complete(&messages).await?,
        };

        let highlights = self.citations.highlights(&answer, &assembled.index_to_passage);
        let citation_total: usize = highlights.values().sum();
        let is_refusal =
            citations::is_refusal(&answer, &self.config.refusal_phrases, citation_total);

        if is_refusal {
            debug!("answer flagged as refusal, skipping cache write");
        } else {
            self.cache
                .put(question, &principal.id, &answer, &assembled.sources, None)
                .await;
        }

        self.record_turns(session.as_deref_mut(), question, &answer);

        Ok(AnswerResult {
            answer,
            sources: assembled.sources,
            highlights,
            from_cache: false,
            is_refusal,
            diagnostics: Some(outcome.diagnostics),
        })
    }

    /// Streaming variant: `Sources` first, then `Chunk`s, `Highlights`,
    /// and finally `Done` (or `Error`, which terminates the stream).
    /// Dropping the stream abandons generation and skips the cache write.
    pub fn answer_stream(
        self: &Arc<Self>,
        question: String,
        principal: Principal,
        opts: QaOptions,
    ) -> impl Stream<Item = AnswerEvent> + Send + 'static {
        let chain = Arc::clone(self);

        stream! {
            let mut session = match chain.lock_session(opts.session_id.as_deref()).await {
                Ok(session) => session,
                Err(err) => {
                    yield AnswerEvent::Error { message: err.to_string() };
                    return;
                }
            };
            let history_unused = session.as_deref().map_or(true, ConversationState::is_empty);

            if history_unused {
                if let Some(cached) = chain.cache.get(&question, &principal.id).await {
                    let result = chain.cached_result(cached);
                    chain.record_turns(session.as_deref_mut(), &question, &result.answer);
                    yield AnswerEvent::Sources(result.sources);
                    yield AnswerEvent::Chunk(result.answer);
                    yield AnswerEvent::Highlights(result.highlights);
                    yield AnswerEvent::Done;
                    return;
                }
            }

            if let Some(state) = session.as_deref_mut() {
                chain.compressor.compress(state).await;
            }

            let top_k = opts.top_k.unwrap_or(chain.config.top_k);
            let outcome = match chain
                .retriever
                .retrieve(&question, top_k, &principal, &opts.group_filter)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    yield AnswerEvent::Error { message: err.to_string() };
                    return;
                }
            };
            let assembled = assemble_context(&outcome.passages, &chain.config.budget);
            yield AnswerEvent::Sources(assembled.sources.clone());

            let messages = chain.build_messages(&question, &assembled, session.as_deref());
            let mut tokens = match chain.chat.stream(&messages).await {
                Ok(tokens) => tokens,
                Err(err) => {
                    yield AnswerEvent::Error { message: err.to_string() };
                    return;
                }
            };

            let mut answer = String::new();
            while let Some(token) = tokens.next().await {
                match token {
                    Ok(chunk) => {
                        answer.push_str(&chunk);
                        yield AnswerEvent::Chunk(chunk);
                    }
                    Err(err) => {
                        warn!(error = %err, "generation stream failed mid-answer");
                        yield AnswerEvent::Error { message: err.to_string() };
                        return;
                    }
                }
            }

            let highlights = chain.citations.highlights(&answer, &assembled.index_to_passage);
            let citation_total: usize = highlights.values().sum();
            let is_refusal =
                citations::is_refusal(&answer, &chain.config.refusal_phrases, citation_total);

            if !is_refusal {
                chain
                    .cache
                    .put(&question, &principal.id, &answer, &assembled.sources, None)
                    .await;
            }
            chain.record_turns(session.as_deref_mut(), &question, &answer);

            yield AnswerEvent::Highlights(highlights);
            yield AnswerEvent::Done;
        }
    }
}
