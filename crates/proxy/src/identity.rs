use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::engine::EngineError;
use crate::locks::KeyedLocks;
use pmos_ledger::{EngineIdentity, Store, StoreError};

#[derive(Debug)]
pub enum IdentityError {
    Upstream(EngineError),
    Store(StoreError),
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::Upstream(err) => write!(f, "identity provisioning failed: {}", err),
            IdentityError::Store(err) => write!(f, "identity store error: {}", err),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Engine-side user provisioning. Implemented by `EngineClient`; tests
/// substitute a scripted backend.
pub trait ProvisionBackend {
    async fn provision_workspace_identity(
        &self,
        workspace_id: &str,
    ) -> Result<EngineIdentity, EngineError>;
}

/// Persistence for bridged identities. Implemented by the ledger store.
pub trait IdentityStore {
    async fn load(&self, workspace_id: &str) -> Result<Option<EngineIdentity>, StoreError>;
    /// First writer wins: returns the stored row, which may belong to a
    /// concurrent writer on another proxy instance.
    async fn save(&self, identity: &EngineIdentity) -> Result<EngineIdentity, StoreError>;
}

impl IdentityStore for Store {
    async fn load(&self, workspace_id: &str) -> Result<Option<EngineIdentity>, StoreError> {
        self.load_engine_identity(workspace_id).await
    }

    async fn save(&self, identity: &EngineIdentity) -> Result<EngineIdentity, StoreError> {
        self.insert_engine_identity(identity).await
    }
}

#[derive(Debug, Clone)]
pub struct IdentityBridgeConfig {
    pub service_api_key: String,
    pub owner_fallback: bool,
    pub provision_max_attempts: u32,
    pub provision_base_backoff: Duration,
}

/// Maps each workspace to its dedicated engine user, provisioning one
/// on first use. In strict mode a provisioning failure is the caller's
/// error; with owner fallback enabled the service identity is
/// substituted instead and the substitution is logged and counted.
#[derive(Clone)]
pub struct IdentityBridge<B, S> {
    backend: B,
    store: S,
    config: IdentityBridgeConfig,
    cache: Arc<RwLock<HashMap<String, EngineIdentity>>>,
    locks: KeyedLocks,
}

impl<B: ProvisionBackend, S: IdentityStore> IdentityBridge<B, S> {
    pub fn new(backend: B, store: S, config: IdentityBridgeConfig) -> Self {
        Self {
            backend,
            store,
            config,
            cache: Arc::new(RwLock::new(HashMap::new())),
            locks: KeyedLocks::new(),
        }
    }

    pub async fn resolve(&self, workspace_id: &str) -> Result<EngineIdentity, IdentityError> {
        if let Some(identity) = self.cache.read().await.get(workspace_id) {
            return Ok(identity.clone());
        }

        let lock = self.locks.lock_for(workspace_id);
        let _guard = lock.lock().await;

        if let Some(identity) = self.cache.read().await.get(workspace_id) {
            return Ok(identity.clone());
        }

        if let Some(identity) = self
            .store
            .load(workspace_id)
            .await
            .map_err(IdentityError::Store)?
        {
            self.remember(identity.clone()).await;
            return Ok(identity);
        }

        match self.provision_with_backoff(workspace_id).await {
            Ok(identity) => {
                let stored = self
                    .store
                    .save(&identity)
                    .await
                    .map_err(IdentityError::Store)?;
                self.remember(stored.clone()).await;
                Ok(stored)
            }
            Err(err) if self.config.owner_fallback => {
                tracing::warn!(
                    workspace_id,
                    error = %err,
                    "identity provisioning failed; substituting the service identity"
                );
                crate::metrics::inc_identity_fallback();
                // Not cached: the next request retries provisioning.
                Ok(EngineIdentity {
                    workspace_id: workspace_id.to_string(),
                    engine_user_id: "service".to_string(),
                    api_key: self.config.service_api_key.clone(),
                })
            }
            Err(err) => Err(IdentityError::Upstream(err)),
        }
    }

    async fn remember(&self, identity: EngineIdentity) {
        self.cache
            .write()
            .await
            .insert(identity.workspace_id.clone(), identity);
    }

    async fn provision_with_backoff(
        &self,
        workspace_id: &str,
    ) -> Result<EngineIdentity, EngineError> {
        let max_attempts = self.config.provision_max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.backend.provision_workspace_identity(workspace_id).await {
                Ok(identity) => return Ok(identity),
                Err(err) if attempt < max_attempts => {
                    tracing::debug!(
                        workspace_id,
                        attempt,
                        error = %err,
                        "identity provisioning failed; retrying"
                    );
                    let backoff =
                        self.config.provision_base_backoff * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
