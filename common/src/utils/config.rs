use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Runtime configuration for the QA core. Every tunable has a serde default
/// so a partial config file or bare environment is enough to boot.
#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub openai_api_key: String,
    #[serde(default = "default_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_query_model")]
    pub query_model: String,
    #[serde(default = "default_query_model")]
    pub summarizer_model: String,

    #[serde(default = "default_embedding_provider_id")]
    pub embedding_provider_id: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: usize,
    #[serde(default = "default_embedding_batch_max")]
    pub embedding_batch_max: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default)]
    pub reranker_enabled: bool,
    #[serde(default = "default_rerank_batch_size")]
    pub rerank_batch_size: usize,
    #[serde(default = "default_true")]
    pub query_rewrite_enabled: bool,
    #[serde(default = "default_n_variants")]
    pub n_variants: usize,
    #[serde(default = "default_intra_query_parallelism")]
    pub intra_query_parallelism: usize,

    #[serde(default = "default_true")]
    pub cache_enabled: bool,
    #[serde(default = "default_cache_threshold")]
    pub cache_threshold: f32,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_status_retention")]
    pub status_retention: usize,
    #[serde(default = "default_task_deadline_secs")]
    pub task_deadline_secs: u64,

    #[serde(default = "default_max_history_turns")]
    pub max_history_turns: usize,
    #[serde(default = "default_keep_recent_turns")]
    pub keep_recent_turns: usize,
    #[serde(default = "default_max_summary_chars")]
    pub max_summary_chars: usize,
    #[serde(default = "default_max_session_turns")]
    pub max_session_turns: usize,
    #[serde(default)]
    pub session_reject_busy: bool,

    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
    #[serde(default = "default_max_single_content")]
    pub max_single_content: usize,
    #[serde(default = "default_context_prefix_max")]
    pub context_prefix_max: usize,

    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    #[serde(default = "default_citation_pattern")]
    pub citation_pattern: String,
    #[serde(default = "default_refusal_phrases")]
    pub refusal_phrases: Vec<String>,

    #[serde(default = "default_ingest_max_content_bytes")]
    pub ingest_max_content_bytes: usize,
    #[serde(default = "default_ingest_max_context_bytes")]
    pub ingest_max_context_bytes: usize,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_query_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_provider_id() -> String {
    "remote".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    1536
}

fn default_embedding_batch_max() -> usize {
    64
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_top_k() -> usize {
    5
}

fn default_rerank_batch_size() -> usize {
    32
}

fn default_true() -> bool {
    true
}

fn default_n_variants() -> usize {
    3
}

fn default_intra_query_parallelism() -> usize {
    4
}

fn default_cache_threshold() -> f32 {
    0.92
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_max_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_status_retention() -> usize {
    10_000
}

fn default_task_deadline_secs() -> u64 {
    120
}

fn default_max_history_turns() -> usize {
    10
}

fn default_keep_recent_turns() -> usize {
    4
}

fn default_max_summary_chars() -> usize {
    1000
}

fn default_max_session_turns() -> usize {
    100
}

fn default_max_context_chars() -> usize {
    8000
}

fn default_max_single_content() -> usize {
    2000
}

fn default_context_prefix_max() -> usize {
    100
}

fn default_chunk_size() -> usize {
    512
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_citation_pattern() -> String {
    r"\[\^(\d+)\]".to_string()
}

fn default_refusal_phrases() -> Vec<String> {
    [
        "i don't know",
        "i do not know",
        "cannot answer",
        "can't answer",
        "no relevant information",
        "not enough information",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

fn default_ingest_max_content_bytes() -> usize {
    2_000_000
}

fn default_ingest_max_context_bytes() -> usize {
    10_000
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            openai_base_url: default_base_url(),
            query_model: default_query_model(),
            summarizer_model: default_query_model(),
            embedding_provider_id: default_embedding_provider_id(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            embedding_batch_max: default_embedding_batch_max(),
            request_timeout_secs: default_request_timeout_secs(),
            top_k: default_top_k(),
            reranker_enabled: false,
            rerank_batch_size: default_rerank_batch_size(),
            query_rewrite_enabled: true,
            n_variants: default_n_variants(),
            intra_query_parallelism: default_intra_query_parallelism(),
            cache_enabled: true,
            cache_threshold: default_cache_threshold(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_max_entries: default_cache_max_entries(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            status_retention: default_status_retention(),
            task_deadline_secs: default_task_deadline_secs(),
            max_history_turns: default_max_history_turns(),
            keep_recent_turns: default_keep_recent_turns(),
            max_summary_chars: default_max_summary_chars(),
            max_session_turns: default_max_session_turns(),
            session_reject_busy: false,
            max_context_chars: default_max_context_chars(),
            max_single_content: default_max_single_content(),
            context_prefix_max: default_context_prefix_max(),
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            citation_pattern: default_citation_pattern(),
            refusal_phrases: default_refusal_phrases(),
            ingest_max_content_bytes: default_ingest_max_content_bytes(),
            ingest_max_context_bytes: default_ingest_max_context_bytes(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
