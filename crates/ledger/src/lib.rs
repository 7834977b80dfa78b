use std::time::Duration;

use pmos_contracts::CredentialScope;
use pmos_contracts::canonical;
use sqlx::Row;
use sqlx::postgres::PgPoolOptions;
use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Sqlx(err) => write!(f, "store sql error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

/// One audit entry for a mutating proxied call.
pub struct AuditRecord<'a> {
    pub request_id: &'a str,
    pub user_id: &'a str,
    pub workspace_id: &'a str,
    pub action: &'a str,
    pub resource_id: Option<&'a str>,
    pub outcome: &'a str,
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredential {
    pub secret: String,
    pub validated: Option<bool>,
}

/// Engine-native identity provisioned for one workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineIdentity {
    pub workspace_id: String,
    pub engine_user_id: String,
    pub api_key: String,
}

/// Proxy-owned Postgres state: the audit trail of mutating calls, saved
/// BYOK credentials, and workspace-to-engine identity mappings. The
/// engine's resource store is never mirrored here.
#[derive(Clone)]
pub struct Store {
    pool: sqlx::PgPool,
    write_timeout: Duration,
}

impl Store {
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = tokio::time::timeout(
            Duration::from_secs(2),
            PgPoolOptions::new().max_connections(8).connect(db_url),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(Duration::from_secs(10), migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    /// Append one audit event; returns the event id.
    pub async fn record_mutation(&self, record: AuditRecord<'_>) -> Result<String, StoreError> {
        let event_id = Ulid::new().to_string();
        let detail_hash = canonical::hash_canonical_json(&record.detail);

        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO pmos_audit_events (event_id, request_id, user_id, workspace_id, action, resource_id, outcome, detail_json, detail_hash) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(&event_id)
            .bind(record.request_id)
            .bind(record.user_id)
            .bind(record.workspace_id)
            .bind(record.action)
            .bind(record.resource_id)
            .bind(record.outcome)
            .bind(&record.detail)
            .bind(detail_hash)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(event_id)
    }

    pub async fn upsert_credential(
        &self,
        provider: &str,
        scope: CredentialScope,
        owner_id: &str,
        secret: &str,
        validated: Option<bool>,
    ) -> Result<(), StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO pmos_credentials (provider, scope, owner_id, secret, validated) VALUES ($1, $2, $3, $4, $5) ON CONFLICT (provider, scope, owner_id) DO UPDATE SET secret = EXCLUDED.secret, validated = EXCLUDED.validated, updated_at = now()",
            )
            .bind(provider)
            .bind(scope.as_str())
            .bind(owner_id)
            .bind(secret)
            .bind(validated)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }

    pub async fn load_credential(
        &self,
        provider: &str,
        scope: CredentialScope,
        owner_id: &str,
    ) -> Result<Option<StoredCredential>, StoreError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT secret, validated FROM pmos_credentials WHERE provider = $1 AND scope = $2 AND owner_id = $3",
            )
            .bind(provider)
            .bind(scope.as_str())
            .bind(owner_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(StoredCredential {
            secret: row.try_get("secret")?,
            validated: row.try_get("validated")?,
        }))
    }

    /// Returns whether a row was deleted. Deleting an absent credential
    /// is not an error; a higher-precedence source may already shadow it.
    pub async fn delete_credential(
        &self,
        provider: &str,
        scope: CredentialScope,
        owner_id: &str,
    ) -> Result<bool, StoreError> {
        let result = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "DELETE FROM pmos_credentials WHERE provider = $1 AND scope = $2 AND owner_id = $3",
            )
            .bind(provider)
            .bind(scope.as_str())
            .bind(owner_id)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(result.rows_affected() > 0)
    }

    /// Idempotent: a concurrent insert for the same workspace keeps the
    /// first provisioned identity instead of overwriting it.
    pub async fn insert_engine_identity(
        &self,
        identity: &EngineIdentity,
    ) -> Result<EngineIdentity, StoreError> {
        tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "INSERT INTO pmos_engine_identities (workspace_id, engine_user_id, api_key) VALUES ($1, $2, $3) ON CONFLICT (workspace_id) DO NOTHING",
            )
            .bind(&identity.workspace_id)
            .bind(&identity.engine_user_id)
            .bind(&identity.api_key)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let winner = self.load_engine_identity(&identity.workspace_id).await?;
        Ok(winner.unwrap_or_else(|| identity.clone()))
    }

    pub async fn load_engine_identity(
        &self,
        workspace_id: &str,
    ) -> Result<Option<EngineIdentity>, StoreError> {
        let row = tokio::time::timeout(
            self.write_timeout,
            sqlx::query(
                "SELECT workspace_id, engine_user_id, api_key FROM pmos_engine_identities WHERE workspace_id = $1",
            )
            .bind(workspace_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| StoreError::Timeout)??;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(EngineIdentity {
            workspace_id: row.try_get("workspace_id")?,
            engine_user_id: row.try_get("engine_user_id")?,
            api_key: row.try_get("api_key")?,
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
