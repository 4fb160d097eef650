use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::AppError;
use crate::storage::types::principal::Principal;

/// Handle value the host may pass for unauthenticated internal callers.
pub const ANONYMOUS_HANDLE: &str = "anonymous";

/// Resolves an opaque principal handle (token, API key id, session cookie
/// subject) into a `Principal`. The host wires its identity provider in;
/// the static implementation backs tests and embedded setups.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, handle: &str) -> Result<Principal, AppError>;
}

#[derive(Default)]
pub struct StaticIdentityResolver {
    principals: RwLock<HashMap<String, Principal>>,
}

impl StaticIdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: impl Into<String>, principal: Principal) {
        let mut principals = self.principals.write().unwrap_or_else(|e| e.into_inner());
        principals.insert(handle.into(), principal);
    }
}

#[async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn resolve(&self, handle: &str) -> Result<Principal, AppError> {
        if handle.is_empty() || handle == ANONYMOUS_HANDLE {
            return Ok(Principal::anonymous());
        }

        let principals = self.principals.read().unwrap_or_else(|e| e.into_inner());
        principals
            .get(handle)
            .cloned()
            .ok_or_else(|| AppError::Unauthorized(format!("unknown principal handle: {handle}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_handle_resolves_to_anonymous() {
        let resolver = StaticIdentityResolver::new();
        let principal = resolver.resolve("").await.expect("resolve");
        assert!(principal.is_anonymous());
    }

    #[tokio::test]
    async fn unknown_handle_is_unauthorized() {
        let resolver = StaticIdentityResolver::new();
        let err = resolver.resolve("ghost").await.expect_err("should fail");
        assert!(matches!(err, AppError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn registered_handle_resolves() {
        let resolver = StaticIdentityResolver::new();
        resolver.register("tok-alice", Principal::user("alice"));

        let principal = resolver.resolve("tok-alice").await.expect("resolve");
        assert_eq!(principal.id, "alice");
    }
}
