use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::utils::config::AppConfig;

use super::EmbeddingProvider;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Embedding provider backed by a remote OpenAI-compatible endpoint.
/// Batches are capped, each request carries a deadline, and transient
/// faults are retried with jittered exponential backoff before the call
/// surfaces `EmbeddingUnavailable`.
pub struct RemoteEmbeddingProvider {
    client: async_openai::Client<OpenAIConfig>,
    model: String,
    dimensions: usize,
    batch_max: usize,
    request_timeout: Duration,
    id: String,
}

impl RemoteEmbeddingProvider {
    pub fn new(
        client: async_openai::Client<OpenAIConfig>,
        model: String,
        dimensions: usize,
        batch_max: usize,
        request_timeout: Duration,
    ) -> Self {
        let id = format!("remote:{model}:{dimensions}");
        Self {
            client,
            model,
            dimensions,
            batch_max: batch_max.max(1),
            request_timeout,
            id,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.openai_api_key.clone())
            .with_api_base(config.openai_base_url.clone());
        Self::new(
            async_openai::Client::with_config(openai_config),
            config.embedding_model.clone(),
            config.embedding_dimensions,
            config.embedding_batch_max,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    async fn encode_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let strategy = ExponentialBackoff::from_millis(BACKOFF_BASE_MS)
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        let attempt = || async {
            let request = CreateEmbeddingRequestArgs::default()
                .model(&self.model)
                .dimensions(self.dimensions as u32)
                .input(batch.to_vec())
                .build()?;

            let response = timeout(self.request_timeout, self.client.embeddings().create(request))
                .await
                .map_err(|_| {
                    AppError::DeadlineExceeded(format!(
                        "embedding request exceeded {:?}",
                        self.request_timeout
                    ))
                })??;

            let mut vectors = Vec::with_capacity(batch.len());
            for data in response.data {
                if data.embedding.len() != self.dimensions {
                    return Err(AppError::Internal(format!(
                        "endpoint returned {} dims, configured {}",
                        data.embedding.len(),
                        self.dimensions
                    )));
                }
                vectors.push(data.embedding);
            }
            if vectors.len() != batch.len() {
                return Err(AppError::Internal(format!(
                    "endpoint returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            Ok(vectors)
        };

        RetryIf::spawn(strategy, attempt, |err: &AppError| {
            let transient = err.is_transient();
            if transient {
                warn!(error = %err, "transient embedding failure, retrying");
            }
            transient
        })
        .await
        .map_err(|err| match err {
            transient if transient.is_transient() => {
                AppError::EmbeddingUnavailable(transient.to_string())
            }
            other => other,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbeddingProvider {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_max) {
            debug!(batch_len = batch.len(), model = %self.model, "requesting embeddings");
            vectors.extend(self.encode_batch(batch).await?);
        }
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }

    fn id(&self) -> &str {
        &self.id
    }
}
