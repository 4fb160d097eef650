pub mod local;
pub mod remote;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use tracing::info;

use crate::error::AppError;

pub use local::LocalEmbeddingProvider;
pub use remote::RemoteEmbeddingProvider;

/// Text-to-vector capability. Implementations are pure: no hidden state
/// beyond the model itself, so a handle can be held across a whole batch.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Encodes a batch of texts into one vector per input, in order.
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;

    fn dimension(&self) -> usize;

    /// Stable identifier used to decide whether a reload swaps anything.
    fn id(&self) -> &str;
}

/// Outcome of a provider reload.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub previous_id: String,
    pub active_id: String,
    pub dimension: usize,
    pub swapped: bool,
    /// Set when the new dimension differs from the stored corpus: ingestion
    /// refuses writes until a re-embed or a collection recreate.
    pub write_degraded: bool,
}

/// Process-wide holder for the active provider. Readers clone the `Arc`
/// out and keep it for the duration of a single batch; `swap` replaces the
/// pointer under a short-held write lock, so in-flight batches finish on
/// the provider they started with.
pub struct EmbeddingHandle {
    active: RwLock<Arc<dyn EmbeddingProvider>>,
}

impl EmbeddingHandle {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            active: RwLock::new(provider),
        }
    }

    pub fn current(&self) -> Arc<dyn EmbeddingProvider> {
        Arc::clone(&self.active.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Swaps the active provider, returning the previous one.
    pub fn swap(&self, next: Arc<dyn EmbeddingProvider>) -> Arc<dyn EmbeddingProvider> {
        let mut guard = self.active.write().unwrap_or_else(|e| e.into_inner());
        let previous = Arc::clone(&guard);
        info!(from = previous.id(), to = next.id(), "swapping embedding provider");
        *guard = next;
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider {
        id: String,
        dimension: usize,
    }

    #[async_trait]
    impl EmbeddingProvider for FixedProvider {
        async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![0.0; self.dimension]).collect())
        }

        fn dimension(&self) -> usize {
            self.dimension
        }

        fn id(&self) -> &str {
            &self.id
        }
    }

    #[tokio::test]
    async fn in_flight_handle_survives_swap() {
        let handle = EmbeddingHandle::new(Arc::new(FixedProvider {
            id: "a".to_string(),
            dimension: 4,
        }));

        let held = handle.current();
        let previous = handle.swap(Arc::new(FixedProvider {
            id: "b".to_string(),
            dimension: 8,
        }));

        assert_eq!(previous.id(), "a");
        assert_eq!(held.id(), "a", "held handle still points at the old provider");
        assert_eq!(handle.current().id(), "b");

        let vectors = held.encode(&["x".to_string()]).await.expect("encode");
        assert_eq!(vectors[0].len(), 4);
    }
}
