use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Anonymous,
    User,
    Admin,
}

/// Authenticated actor as resolved by the identity provider: id, role and
/// the group ids it may read or write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    pub role: Role,
    pub groups_readable: BTreeSet<String>,
    pub groups_writable: BTreeSet<String>,
}

impl Principal {
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            groups_readable: BTreeSet::new(),
            groups_writable: BTreeSet::new(),
        }
    }

    pub fn admin(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Admin,
            groups_readable: BTreeSet::new(),
            groups_writable: BTreeSet::new(),
        }
    }

    pub fn anonymous() -> Self {
        Self {
            id: "anonymous".to_string(),
            role: Role::Anonymous,
            groups_readable: BTreeSet::new(),
            groups_writable: BTreeSet::new(),
        }
    }

    pub fn with_readable_group(mut self, group_id: &str) -> Self {
        self.groups_readable.insert(group_id.to_string());
        self
    }

    pub fn with_writable_group(mut self, group_id: &str) -> Self {
        self.groups_readable.insert(group_id.to_string());
        self.groups_writable.insert(group_id.to_string());
        self
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_anonymous(&self) -> bool {
        self.role == Role::Anonymous
    }
}
