use std::collections::HashSet;

use tracing::debug;

use common::error::AppError;
use common::storage::types::principal::Principal;
use common::storage::vector::{AccessFilter, ScopedFilter};
use common::utils::groups::GroupDirectory;

/// Computes what a principal may see, as a filter both indices accept.
///
/// Admins get the unbounded sentinel so their queries pass through the
/// indices without enumerating ids. Everyone else gets a predicate over
/// ownership, visibility and readable groups. Group names in
/// `group_filter` narrow the result to those groups; names that don't
/// resolve, or that the principal may not read, are silently dropped.
pub async fn accessible_filter(
    principal: &Principal,
    group_filter: &[String],
    groups: &dyn GroupDirectory,
) -> Result<AccessFilter, AppError> {
    let restrict = if group_filter.is_empty() {
        None
    } else {
        Some(resolve_readable_groups(principal, group_filter, groups).await?)
    };

    if principal.is_admin() {
        return Ok(match restrict {
            None => AccessFilter::Unbounded,
            Some(group_ids) => AccessFilter::Scoped(ScopedFilter {
                owner_id: None,
                include_public: false,
                readable_group_ids: group_ids.clone(),
                restrict_to_group_ids: Some(group_ids),
            }),
        });
    }

    if principal.is_anonymous() {
        return Ok(AccessFilter::Scoped(ScopedFilter {
            owner_id: None,
            include_public: true,
            readable_group_ids: HashSet::new(),
            restrict_to_group_ids: restrict,
        }));
    }

    Ok(AccessFilter::Scoped(ScopedFilter {
        owner_id: Some(principal.id.clone()),
        include_public: true,
        readable_group_ids: principal.groups_readable.iter().cloned().collect(),
        restrict_to_group_ids: restrict,
    }))
}

/// Resolves group names to the ids the principal may actually read.
async fn resolve_readable_groups(
    principal: &Principal,
    names: &[String],
    groups: &dyn GroupDirectory,
) -> Result<HashSet<String>, AppError> {
    let mut resolved = HashSet::new();
    for name in names {
        let Some(group) = groups.group_by_name(name).await? else {
            debug!(group = %name, "dropping unknown group from filter");
            continue;
        };

        let readable = principal.is_admin()
            || group.allows_read(&principal.id)
            || principal.groups_readable.contains(&group.id);
        if readable {
            resolved.insert(group.id);
        } else {
            debug!(group = %name, principal = %principal.id, "dropping inaccessible group from filter");
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::group::{Group, Permission};
    use common::storage::types::passage::{Passage, Visibility};
    use common::utils::groups::InMemoryGroupDirectory;
    use std::collections::BTreeSet;

    fn passage(owner: Option<&str>, visibility: Visibility, groups: &[&str]) -> Passage {
        Passage::new(
            "text".to_string(),
            None,
            "src".to_string(),
            "entry".to_string(),
            owner.map(ToString::to_string),
            visibility,
            groups.iter().map(ToString::to_string).collect::<BTreeSet<_>>(),
        )
    }

    #[tokio::test]
    async fn admin_without_group_filter_is_unbounded() {
        let directory = InMemoryGroupDirectory::new();
        let filter = accessible_filter(&Principal::admin("root"), &[], &directory)
            .await
            .expect("filter");
        assert!(matches!(filter, AccessFilter::Unbounded));
    }

    #[tokio::test]
    async fn anonymous_sees_public_only() {
        let directory = InMemoryGroupDirectory::new();
        let filter = accessible_filter(&Principal::anonymous(), &[], &directory)
            .await
            .expect("filter");

        assert!(filter.matches(&passage(Some("alice"), Visibility::Public, &[])));
        assert!(!filter.matches(&passage(Some("alice"), Visibility::Private, &[])));
    }

    #[tokio::test]
    async fn user_sees_own_public_and_shared_groups() {
        let directory = InMemoryGroupDirectory::new();
        let group = Group::new("research".to_string(), "alice".to_string())
            .with_share("bob", Permission::Read);
        let group_id = group.id.clone();
        directory.insert(group);

        let bob = Principal::user("bob").with_readable_group(&group_id);
        let filter = accessible_filter(&bob, &[], &directory).await.expect("filter");

        assert!(filter.matches(&passage(Some("bob"), Visibility::Private, &[])));
        assert!(filter.matches(&passage(Some("alice"), Visibility::Public, &[])));
        assert!(filter.matches(&passage(
            Some("alice"),
            Visibility::Private,
            &[group_id.as_str()]
        )));
        assert!(!filter.matches(&passage(Some("alice"), Visibility::Private, &["other"])));
    }

    #[tokio::test]
    async fn unknown_and_inaccessible_group_names_are_dropped() {
        let directory = InMemoryGroupDirectory::new();
        let private_group = Group::new("secret".to_string(), "alice".to_string());
        directory.insert(private_group);

        let bob = Principal::user("bob");
        let filter = accessible_filter(
            &bob,
            &["secret".to_string(), "missing".to_string()],
            &directory,
        )
        .await
        .expect("filter");

        // Everything named was dropped, so the scope is provably empty.
        assert!(filter.is_empty_scope());
    }

    #[tokio::test]
    async fn group_filter_narrows_to_named_groups() {
        let directory = InMemoryGroupDirectory::new();
        let group = Group::new("research".to_string(), "alice".to_string())
            .with_share("bob", Permission::Read);
        let group_id = group.id.clone();
        directory.insert(group);

        let bob = Principal::user("bob").with_readable_group(&group_id);
        let filter = accessible_filter(&bob, &["research".to_string()], &directory)
            .await
            .expect("filter");

        assert!(filter.matches(&passage(
            Some("alice"),
            Visibility::Private,
            &[group_id.as_str()]
        )));
        // Bob's own ungrouped passage falls outside the named scope.
        assert!(!filter.matches(&passage(Some("bob"), Visibility::Private, &[])));
    }
}
