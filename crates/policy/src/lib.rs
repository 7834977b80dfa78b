use pmos_contracts::partition::partition_tag;
use pmos_contracts::{Resource, Role};

/// Per-request access decisions, selected once from the resolved role
/// instead of scattering role checks through the proxy body.
///
/// Read and write paths use it differently on purpose: reads filter
/// silently (absence of access looks identical to absence of data),
/// writes surface an explicit denial before anything is forwarded.
pub trait AccessPolicy: Send + Sync {
    fn can_see(&self, resource: &Resource) -> bool;

    fn may_mutate(&self, resource: &Resource) -> bool;

    /// Whether list responses skip filtering entirely.
    fn unfiltered(&self) -> bool {
        false
    }

    /// The partition tag this caller's creations are stamped with, if
    /// the caller belongs to a workspace.
    fn partition_tag(&self) -> &str;
}

/// Super-admin with admin-view requested: sees and may mutate
/// everything, across all workspaces.
pub struct AdminPolicy {
    tag: String,
}

impl AdminPolicy {
    pub fn new(workspace_id: &str) -> Self {
        Self {
            tag: partition_tag(workspace_id),
        }
    }
}

impl AccessPolicy for AdminPolicy {
    fn can_see(&self, _resource: &Resource) -> bool {
        true
    }

    fn may_mutate(&self, _resource: &Resource) -> bool {
        true
    }

    fn unfiltered(&self) -> bool {
        true
    }

    fn partition_tag(&self) -> &str {
        &self.tag
    }
}

/// Everyone else, including a super-admin without admin-view: scoped to
/// the single workspace whose partition tag the caller resolved to.
pub struct TenantPolicy {
    tag: String,
}

impl TenantPolicy {
    pub fn new(workspace_id: &str) -> Self {
        Self {
            tag: partition_tag(workspace_id),
        }
    }
}

impl AccessPolicy for TenantPolicy {
    fn can_see(&self, resource: &Resource) -> bool {
        resource.carries_tag(&self.tag)
    }

    fn may_mutate(&self, resource: &Resource) -> bool {
        resource.carries_tag(&self.tag)
    }

    fn partition_tag(&self) -> &str {
        &self.tag
    }
}

/// Select the policy for one request. Admin-view is honored only for
/// super_admin callers; anyone else asking for it is silently scoped
/// to their own workspace.
pub fn policy_for(role: Role, admin_view: bool, workspace_id: &str) -> Box<dyn AccessPolicy> {
    match role {
        Role::SuperAdmin if admin_view => Box::new(AdminPolicy::new(workspace_id)),
        _ => Box::new(TenantPolicy::new(workspace_id)),
    }
}

/// Policy for the write path. Unlike reads, where a super_admin must
/// ask for admin-view to widen its scope, a super_admin may always
/// mutate any resource; everyone else stays scoped to their workspace.
pub fn mutation_policy_for(role: Role, workspace_id: &str) -> Box<dyn AccessPolicy> {
    policy_for(role, true, workspace_id)
}

/// Silent read-path filter. Never errors: a caller with no access to a
/// resource gets the same response as if the resource did not exist.
pub fn filter_list(resources: Vec<Resource>, policy: &dyn AccessPolicy) -> Vec<Resource> {
    if policy.unfiltered() {
        return resources;
    }
    resources
        .into_iter()
        .filter(|r| policy.can_see(r))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(id: &str, tags: &[&str]) -> Resource {
        Resource {
            id: id.to_string(),
            name: id.to_string(),
            active: false,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            extra: serde_json::Map::new(),
        }
    }

    fn corpus() -> Vec<Resource> {
        let tag_a = partition_tag("A1");
        let tag_b = partition_tag("B1");
        vec![
            resource("wf-a", &[&tag_a]),
            resource("wf-b", &[&tag_b, "reporting"]),
            resource("wf-untagged", &[]),
        ]
    }

    #[test]
    fn tenant_sees_only_its_own_resources() {
        let policy = policy_for(Role::WorkspaceAdmin, false, "A1");
        let visible = filter_list(corpus(), policy.as_ref());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "wf-a");
    }

    #[test]
    fn foreign_workspace_sees_nothing() {
        let policy = policy_for(Role::WorkspaceAdmin, false, "C1");
        assert!(filter_list(corpus(), policy.as_ref()).is_empty());
    }

    #[test]
    fn tenant_may_not_mutate_foreign_or_untagged_resources() {
        let policy = policy_for(Role::WorkspaceAdmin, false, "A1");
        let tag_b = partition_tag("B1");
        assert!(!policy.may_mutate(&resource("wf-b", &[&tag_b])));
        assert!(!policy.may_mutate(&resource("wf-untagged", &[])));
        assert!(policy.may_mutate(&resource("wf-a", &[&partition_tag("A1")])));
    }

    #[test]
    fn super_admin_with_admin_view_sees_the_union() {
        let policy = policy_for(Role::SuperAdmin, true, "A1");
        let visible = filter_list(corpus(), policy.as_ref());
        assert_eq!(visible.len(), 3);
        assert!(policy.may_mutate(&resource("wf-b", &[&partition_tag("B1")])));
    }

    #[test]
    fn super_admin_without_admin_view_is_scoped_to_own_workspace() {
        let policy = policy_for(Role::SuperAdmin, false, "A1");
        let visible = filter_list(corpus(), policy.as_ref());
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "wf-a");
    }

    #[test]
    fn super_admin_may_mutate_foreign_resources_on_the_write_path() {
        let policy = mutation_policy_for(Role::SuperAdmin, "A1");
        let tag_b = partition_tag("B1");
        assert!(policy.may_mutate(&resource("wf-b", &[&tag_b])));
        assert!(policy.may_mutate(&resource("wf-untagged", &[])));
    }

    #[test]
    fn workspace_admin_write_path_stays_tenant_scoped() {
        let policy = mutation_policy_for(Role::WorkspaceAdmin, "A1");
        assert!(policy.may_mutate(&resource("wf-a", &[&partition_tag("A1")])));
        assert!(!policy.may_mutate(&resource("wf-b", &[&partition_tag("B1")])));
        assert!(!policy.may_mutate(&resource("wf-untagged", &[])));
    }

    #[test]
    fn admin_view_request_from_non_admin_is_ignored() {
        let policy = policy_for(Role::WorkspaceAdmin, true, "A1");
        assert!(!policy.unfiltered());
        let visible = filter_list(corpus(), policy.as_ref());
        assert_eq!(visible.len(), 1);
    }
}
