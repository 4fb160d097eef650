use std::pin::Pin;
use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use crate::error::AppError;
use crate::utils::config::AppConfig;

const MAX_ATTEMPTS: usize = 3;
const BACKOFF_BASE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// Transport-neutral chat message handed to the generator seam.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

/// Chat-completion seam the QA chain, rewriter and summarizer call into.
#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError>;

    /// Token-delta stream; the completer retries only the initial
    /// connection, mid-stream faults surface as stream items.
    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AppError>;
}

/// Production completer over an OpenAI-compatible chat endpoint.
pub struct OpenAiChat {
    client: async_openai::Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
}

impl OpenAiChat {
    pub fn new(
        client: async_openai::Client<OpenAIConfig>,
        model: String,
        request_timeout: Duration,
    ) -> Self {
        Self {
            client,
            model,
            request_timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(config.openai_api_key.clone())
            .with_api_base(config.openai_base_url.clone());
        Self::new(
            async_openai::Client::with_config(openai_config),
            config.query_model.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    fn build_request(
        &self,
        messages: &[ChatMessage],
        stream: bool,
    ) -> Result<CreateChatCompletionRequest, AppError> {
        let mapped: Result<Vec<ChatCompletionRequestMessage>, AppError> = messages
            .iter()
            .map(|message| match message.role {
                ChatRole::System => Ok(ChatCompletionRequestSystemMessage::from(
                    message.content.clone(),
                )
                .into()),
                ChatRole::User => Ok(ChatCompletionRequestUserMessage::from(
                    message.content.clone(),
                )
                .into()),
                ChatRole::Assistant => Ok(ChatCompletionRequestAssistantMessageArgs::default()
                    .content(message.content.clone())
                    .build()?
                    .into()),
            })
            .collect();

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(mapped?)
            .stream(stream)
            .build()?;
        Ok(request)
    }
}

#[async_trait]
impl ChatCompleter for OpenAiChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, AppError> {
        let strategy = ExponentialBackoff::from_millis(BACKOFF_BASE_MS)
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        let attempt = || async {
            let request = self.build_request(messages, false)?;
            let response = timeout(self.request_timeout, self.client.chat().create(request))
                .await
                .map_err(|_| {
                    AppError::DeadlineExceeded(format!(
                        "chat request exceeded {:?}",
                        self.request_timeout
                    ))
                })??;

            response
                .choices
                .first()
                .and_then(|choice| choice.message.content.clone())
                .ok_or_else(|| AppError::Internal("no content in chat response".to_string()))
        };

        RetryIf::spawn(strategy, attempt, |err: &AppError| {
            let transient = err.is_transient();
            if transient {
                warn!(error = %err, "transient chat failure, retrying");
            }
            transient
        })
        .await
        .map_err(|err| match err {
            transient if transient.is_transient() => AppError::LLMUnavailable(transient.to_string()),
            other => other,
        })
    }

    async fn stream(&self, messages: &[ChatMessage]) -> Result<TokenStream, AppError> {
        let request = self.build_request(messages, true)?;
        let upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| AppError::LLMUnavailable(e.to_string()))?;

        let tokens = upstream.filter_map(|result| async move {
            match result {
                Ok(response) => {
                    let content = response
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .unwrap_or_default();
                    (!content.is_empty()).then_some(Ok(content))
                }
                Err(e) => Some(Err(AppError::LLMUnavailable(e.to_string()))),
            }
        });

        Ok(Box::pin(tokens))
    }
}
