use serde::{Deserialize, Serialize};

pub mod canonical;
pub mod partition;

/// Caller role carried in the platform session. The platform fixes the
/// role at signup (the first account ever created is super_admin); the
/// proxy only ever reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    WorkspaceAdmin,
    SuperAdmin,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::WorkspaceAdmin => "workspace_admin",
            Role::SuperAdmin => "super_admin",
        }
    }
}

/// An engine-owned workflow resource as seen on the wire. The proxy
/// interprets `id`, `name`, `active` and `tags`; everything else the
/// engine stores is passed through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Resource {
    /// Partition tags present on this resource. The invariant is that
    /// resources created through the proxy carry exactly one.
    pub fn partition_tags(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .map(String::as_str)
            .filter(|t| partition::is_partition_tag(t))
    }

    pub fn carries_tag(&self, tag_name: &str) -> bool {
        self.tags.iter().any(|t| t == tag_name)
    }
}

/// Which source a credential resolution came from. Precedence is fixed:
/// profile > env > config > workspace-store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialSource {
    Profile,
    Env,
    Config,
    WorkspaceStore,
}

impl CredentialSource {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialSource::Profile => "profile",
            CredentialSource::Env => "env",
            CredentialSource::Config => "config",
            CredentialSource::WorkspaceStore => "workspace-store",
        }
    }
}

/// Storage scope of a saved credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialScope {
    User,
    Workspace,
}

impl CredentialScope {
    pub fn as_str(self) -> &'static str {
        match self {
            CredentialScope::User => "user",
            CredentialScope::Workspace => "workspace",
        }
    }
}
