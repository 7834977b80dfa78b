use std::collections::HashMap;

use pmos_contracts::{CredentialScope, CredentialSource};
use pmos_ledger::{Store, StoreError};

/// A provider secret together with where it was found, so callers can
/// report the source without ever reporting the secret's value in logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCredential {
    pub secret: String,
    pub source: CredentialSource,
}

/// Provider names are lowercase slugs; anything else is a caller error.
pub fn valid_provider(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Environment variable a provider's key is looked up under, e.g.
/// `openai` -> `OPENAI_API_KEY`.
pub fn provider_env_var(provider: &str) -> String {
    format!(
        "{}_API_KEY",
        provider.to_ascii_uppercase().replace('-', "_")
    )
}

/// Precedence is fixed: user profile, then process environment, then
/// static config, then the workspace store. A missing layer falls
/// through; an empty secret counts as missing.
pub fn pick(
    profile: Option<String>,
    env: Option<String>,
    config: Option<String>,
    workspace: Option<String>,
) -> Option<ResolvedCredential> {
    let layers = [
        (profile, CredentialSource::Profile),
        (env, CredentialSource::Env),
        (config, CredentialSource::Config),
        (workspace, CredentialSource::WorkspaceStore),
    ];

    layers.into_iter().find_map(|(secret, source)| {
        secret
            .filter(|s| !s.is_empty())
            .map(|secret| ResolvedCredential { secret, source })
    })
}

/// Resolves provider credentials across the four layers. Stored layers
/// come from the ledger; `config_keys` is the static map loaded at
/// startup.
#[derive(Clone)]
pub struct CredentialResolver {
    store: Store,
    config_keys: HashMap<String, String>,
}

impl CredentialResolver {
    pub fn new(store: Store, config_keys: HashMap<String, String>) -> Self {
        Self { store, config_keys }
    }

    pub async fn resolve(
        &self,
        provider: &str,
        user_id: &str,
        workspace_id: &str,
    ) -> Result<Option<ResolvedCredential>, StoreError> {
        let profile = self
            .store
            .load_credential(provider, CredentialScope::User, user_id)
            .await?
            .map(|c| c.secret);
        let env = std::env::var(provider_env_var(provider)).ok();
        let config = self.config_keys.get(provider).cloned();
        let workspace = self
            .store
            .load_credential(provider, CredentialScope::Workspace, workspace_id)
            .await?
            .map(|c| c.secret);

        Ok(pick(profile, env, config, workspace))
    }
}
