use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::group::Group;

/// Read-only view of group metadata, owned by the host's relational store.
/// The core only ever resolves names and membership from it.
#[async_trait]
pub trait GroupDirectory: Send + Sync {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, AppError>;

    async fn group_by_id(&self, id: &str) -> Result<Option<Group>, AppError>;
}

#[derive(Default)]
pub struct InMemoryGroupDirectory {
    groups: RwLock<HashMap<String, Group>>,
}

impl InMemoryGroupDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group: Group) {
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        groups.insert(group.id.clone(), group);
    }

    pub fn remove(&self, group_id: &str) {
        let mut groups = self.groups.write().unwrap_or_else(|e| e.into_inner());
        groups.remove(group_id);
    }
}

#[async_trait]
impl GroupDirectory for InMemoryGroupDirectory {
    async fn group_by_name(&self, name: &str) -> Result<Option<Group>, AppError> {
        let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
        Ok(groups.values().find(|group| group.name == name).cloned())
    }

    async fn group_by_id(&self, id: &str) -> Result<Option<Group>, AppError> {
        let groups = self.groups.read().unwrap_or_else(|e| e.into_inner());
        Ok(groups.get(id).cloned())
    }
}
