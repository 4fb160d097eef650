use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupShare {
    pub principal_id: String,
    pub permission: Permission,
}

/// Named collection of passages with per-principal read/write grants.
/// The owner always has write access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub shares: Vec<GroupShare>,
}

impl Group {
    pub fn new(name: String, owner_id: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            owner_id,
            shares: Vec::new(),
        }
    }

    pub fn with_share(mut self, principal_id: &str, permission: Permission) -> Self {
        self.shares.push(GroupShare {
            principal_id: principal_id.to_string(),
            permission,
        });
        self
    }

    pub fn allows_read(&self, principal_id: &str) -> bool {
        self.owner_id == principal_id
            || self
                .shares
                .iter()
                .any(|share| share.principal_id == principal_id)
    }

    pub fn allows_write(&self, principal_id: &str) -> bool {
        self.owner_id == principal_id
            || self.shares.iter().any(|share| {
                share.principal_id == principal_id && share.permission == Permission::Write
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_has_full_access() {
        let group = Group::new("research".to_string(), "alice".to_string());
        assert!(group.allows_read("alice"));
        assert!(group.allows_write("alice"));
    }

    #[test]
    fn read_share_does_not_grant_write() {
        let group = Group::new("research".to_string(), "alice".to_string())
            .with_share("bob", Permission::Read);
        assert!(group.allows_read("bob"));
        assert!(!group.allows_write("bob"));
        assert!(!group.allows_read("mallory"));
    }

    #[test]
    fn write_share_grants_both() {
        let group = Group::new("research".to_string(), "alice".to_string())
            .with_share("bob", Permission::Write);
        assert!(group.allows_read("bob"));
        assert!(group.allows_write("bob"));
    }
}
