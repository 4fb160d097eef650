use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Public,
}

/// The atomic retrieval unit: a chunk of text plus the payload both indices
/// filter on. Stored jointly by the vector store and the lexical index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    /// Short header prepended to the embedding input only, never displayed.
    pub context_prefix: Option<String>,
    /// Logical origin: file path or knowledge-entry title.
    pub source: String,
    /// The knowledge entry this passage was chunked from.
    pub entry_id: String,
    /// Principal who created the passage; `None` for global passages.
    pub owner_id: Option<String>,
    pub visibility: Visibility,
    pub group_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub content_hash: String,
}

impl Passage {
    pub fn new(
        text: String,
        context_prefix: Option<String>,
        source: String,
        entry_id: String,
        owner_id: Option<String>,
        visibility: Visibility,
        group_ids: BTreeSet<String>,
    ) -> Self {
        let content_hash = content_hash(&text);
        Self {
            id: Uuid::new_v4().to_string(),
            text,
            context_prefix,
            source,
            entry_id,
            owner_id,
            visibility,
            group_ids,
            created_at: Utc::now(),
            content_hash,
        }
    }

    /// Text handed to the embedding provider: the context prefix, when
    /// present, followed by the displayed passage text.
    pub fn embedding_text(&self) -> String {
        match self.context_prefix.as_deref() {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}\n{}", self.text),
            _ => self.text.clone(),
        }
    }

    /// First `max_chars` characters of the passage, for source previews.
    pub fn preview(&self, max_chars: usize) -> String {
        if self.text.chars().count() <= max_chars {
            self.text.clone()
        } else {
            let head: String = self.text.chars().take(max_chars).collect();
            format!("{head}…")
        }
    }
}

pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
