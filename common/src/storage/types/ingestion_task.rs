use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::passage::Visibility;

/// What a caller submits for ingestion: already-extracted text plus the
/// ownership metadata every produced passage will carry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionPayload {
    /// Entry to attach the passages to; a fresh entry id is minted when absent.
    pub entry_id: Option<String>,
    /// Logical origin recorded on each passage (file path or entry title).
    pub source: String,
    pub text: String,
    /// Optional context header used for embedding only.
    pub context: Option<String>,
    pub visibility: Visibility,
    pub group_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed { passage_ids: Vec<String> },
    Failed { error: String },
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionTask {
    pub id: String,
    pub submitted_by: String,
    pub payload: IngestionPayload,
    pub submitted_at: DateTime<Utc>,
}

impl IngestionTask {
    pub fn new(payload: IngestionPayload, submitted_by: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            submitted_by,
            payload,
            submitted_at: Utc::now(),
        }
    }
}

/// Snapshot of a task's lifecycle as reported to pollers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub submitted_by: String,
    pub status: TaskStatus,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskStatusView {
    pub fn pending(task: &IngestionTask) -> Self {
        Self {
            task_id: task.id.clone(),
            submitted_by: task.submitted_by.clone(),
            status: TaskStatus::Pending,
            submitted_at: task.submitted_at,
            finished_at: None,
        }
    }
}
