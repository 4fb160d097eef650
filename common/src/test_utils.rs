//! Deterministic stand-ins for the remote collaborators, used by unit and
//! integration tests across the workspace. Enabled via the `test-utils`
//! feature.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::sync::Notify;

use crate::error::AppError;
use crate::utils::embedding::EmbeddingProvider;
use crate::utils::llm::{ChatCompleter, ChatMessage, TokenStream};

/// Token-bucket hashing embedder: deterministic, any dimension, and texts
/// sharing vocabulary land near each other, which is enough for cache and
/// retrieval tests.
pub struct HashingEmbedder {
    id: String,
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            id: format!("hashed:{dimension}"),
            dimension: dimension.max(1),
        }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
        {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dimension;
            vector[idx] += 1.0;
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Ok(texts.iter().map(|text| self.embed_one(text)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Wraps an embedder behind a gate so tests can hold workers mid-task and
/// observe queue backpressure deterministically.
pub struct GatedEmbedder {
    inner: HashingEmbedder,
    open: AtomicBool,
    notify: Notify,
}

impl GatedEmbedder {
    pub fn closed(dimension: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: HashingEmbedder::new(dimension),
            open: AtomicBool::new(false),
            notify: Notify::new(),
        })
    }

    pub fn release(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        while !self.open.load(Ordering::SeqCst) {
            let notified = self.notify.notified();
            if self.open.load(Ordering::SeqCst) {
                break;
            }
            notified.await;
        }
        self.inner.encode(texts).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }

    fn id(&self) -> &str {
        "gated"
    }
}

/// Embedder whose every call fails; drives the degraded-channel paths.
pub struct FailingEmbedder {
    dimension: usize,
}

impl FailingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbeddingProvider for FailingEmbedder {
    async fn encode(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        Err(AppError::EmbeddingUnavailable(
            "stub embedder configured to fail".to_string(),
        ))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        "failing"
    }
}

/// Chat completer that replays canned responses and records every request.
/// The last response repeats once the script runs out; an empty script
/// fails like an unreachable endpoint.
pub struct ScriptedChat {
    script: Mutex<VecDeque<String>>,
    last: Mutex<Option<String>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedChat {
    pub fn new(responses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            script: Mutex::new(responses.into_iter().map(Into::into).collect()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Every message batch `complete`/`stream` was called with, in order.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn next_response(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(messages.to_vec());

        let mut script = self.script.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(response) = script.pop_front() {
            *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(response.clone());
            return Ok(response);
        }

        self.last
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| AppError::LLMUnavailable("scripted chat exhausted".to_string()))
    }
}

#[async_trait]
impl ChatCompleter for ScriptedChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        self.next_response(messages)
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AppError> {
        let response = self.next_response(messages)?;
        let chunks = split_into_chunks(&response);
        Ok(Box::pin(stream::iter(chunks.into_iter().map(Ok))))
    }
}

/// Splits a canned answer into word-level chunks so streaming consumers
/// see more than one delta.
fn split_into_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch.is_whitespace() && !current.trim().is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}
