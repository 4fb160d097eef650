use std::str::FromStr;

use async_trait::async_trait;
use fastembed::{EmbeddingModel, ModelTrait, TextEmbedding, TextInitOptions};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::AppError;
use crate::utils::config::AppConfig;

use super::EmbeddingProvider;

/// In-process embedding model via fastembed. The engine needs `&mut`, so
/// it sits behind an async mutex; batches serialize on it.
pub struct LocalEmbeddingProvider {
    engine: Mutex<TextEmbedding>,
    dimension: usize,
    id: String,
}

impl LocalEmbeddingProvider {
    /// Loads the model named in the config (fastembed model codes), or the
    /// fastembed default when unset. Initialisation downloads model files,
    /// so it runs on the blocking pool.
    pub async fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let model = if config.embedding_model.starts_with("text-embedding") {
            // Remote model codes don't resolve locally; use the default.
            EmbeddingModel::default()
        } else {
            EmbeddingModel::from_str(&config.embedding_model)
                .map_err(|e| AppError::Validation(format!("unknown fastembed model: {e}")))?
        };

        Self::load(model).await
    }

    pub async fn load(model: EmbeddingModel) -> Result<Self, AppError> {
        let options = TextInitOptions::new(model.clone()).with_show_download_progress(false);
        let model_for_info = model.clone();

        let (engine, dimension) = tokio::task::spawn_blocking(move || {
            let engine = TextEmbedding::try_new(options)
                .map_err(|e| AppError::Internal(format!("fastembed init failed: {e}")))?;
            let info = EmbeddingModel::get_model_info(&model_for_info).ok_or_else(|| {
                AppError::Internal(format!("fastembed metadata missing for {model_for_info}"))
            })?;
            Ok::<_, AppError>((engine, info.dim))
        })
        .await??;

        debug!(model = %model, dimension, "loaded local embedding model");

        Ok(Self {
            engine: Mutex::new(engine),
            dimension,
            id: format!("local:{model}"),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut guard = self.engine.lock().await;
        guard
            .embed(texts.to_vec(), None)
            .map_err(|e| AppError::EmbeddingUnavailable(format!("fastembed inference: {e}")))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn id(&self) -> &str {
        &self.id
    }
}
