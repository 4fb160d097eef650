use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::passage::Visibility;

/// A logical document. One entry produces one or more passages that share
/// its owner, visibility and group memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeEntry {
    pub id: String,
    pub title: String,
    pub owner_id: Option<String>,
    pub visibility: Visibility,
    pub group_ids: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl KnowledgeEntry {
    pub fn new(
        title: String,
        owner_id: Option<String>,
        visibility: Visibility,
        group_ids: BTreeSet<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            owner_id,
            visibility,
            group_ids,
            created_at: Utc::now(),
        }
    }
}
