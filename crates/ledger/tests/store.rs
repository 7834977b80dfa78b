use pmos_contracts::CredentialScope;
use pmos_ledger::{AuditRecord, EngineIdentity, Store};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("PMOS_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

async fn isolated_store(db_url: &str, schema: &str) -> (sqlx::PgPool, Store) {
    let admin_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&admin_pool)
        .await
        .expect("create schema should succeed");

    let store = Store::connect_and_migrate(
        &schema_db_url(db_url, schema),
        std::time::Duration::from_millis(500),
    )
    .await
    .expect("store init should succeed");

    (admin_pool, store)
}

async fn drop_schema(pool: &sqlx::PgPool, schema: &str) {
    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(pool).await;
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn audit_event_detail_hash_verifies() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB audit test; set PMOS_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("pmos_test_{}", ulid::Ulid::new());
    let (admin_pool, store) = isolated_store(&db_url, &schema).await;

    let detail = serde_json::json!({
        "tag": "pmos-0123456789abcdef01",
        "payload": {"b": 1, "a": 2}
    });

    let event_id = store
        .record_mutation(AuditRecord {
            request_id: "req1",
            user_id: "u1",
            workspace_id: "A1",
            action: "create",
            resource_id: Some("wf1"),
            outcome: "allowed",
            detail: detail.clone(),
        })
        .await
        .expect("audit write should succeed");

    let verify_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&schema_db_url(&db_url, &schema))
        .await
        .expect("DB connect should succeed");

    let row = sqlx::query(
        "SELECT workspace_id, outcome, detail_json, detail_hash FROM pmos_audit_events WHERE event_id = $1",
    )
    .bind(&event_id)
    .fetch_one(&verify_pool)
    .await
    .expect("fetch audit event should succeed");

    let workspace_id: String = row.try_get("workspace_id").unwrap();
    let outcome: String = row.try_get("outcome").unwrap();
    let stored_detail: serde_json::Value = row.try_get("detail_json").unwrap();
    let stored_hash: String = row.try_get("detail_hash").unwrap();

    assert_eq!(workspace_id, "A1");
    assert_eq!(outcome, "allowed");
    assert_eq!(
        stored_hash,
        pmos_contracts::canonical::hash_canonical_json(&stored_detail)
    );
    assert_eq!(
        stored_hash,
        pmos_contracts::canonical::hash_canonical_json(&detail)
    );

    verify_pool.close().await;
    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn credential_upsert_load_delete_roundtrip() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB credential test; set PMOS_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("pmos_test_{}", ulid::Ulid::new());
    let (admin_pool, store) = isolated_store(&db_url, &schema).await;

    store
        .upsert_credential("openai", CredentialScope::Workspace, "A1", "sk-old", None)
        .await
        .expect("upsert should succeed");
    store
        .upsert_credential(
            "openai",
            CredentialScope::Workspace,
            "A1",
            "sk-new",
            Some(true),
        )
        .await
        .expect("second upsert should succeed");

    let loaded = store
        .load_credential("openai", CredentialScope::Workspace, "A1")
        .await
        .expect("load should succeed")
        .expect("credential should exist");
    assert_eq!(loaded.secret, "sk-new");
    assert_eq!(loaded.validated, Some(true));

    // Same provider, different scope, stays independent.
    let user_scoped = store
        .load_credential("openai", CredentialScope::User, "A1")
        .await
        .expect("load should succeed");
    assert!(user_scoped.is_none());

    assert!(
        store
            .delete_credential("openai", CredentialScope::Workspace, "A1")
            .await
            .expect("delete should succeed")
    );
    assert!(
        !store
            .delete_credential("openai", CredentialScope::Workspace, "A1")
            .await
            .expect("repeat delete should succeed")
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_identity_insert_keeps_first_writer() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB identity test; set PMOS_TEST_DB_URL to enable");
        return;
    };

    let schema = format!("pmos_test_{}", ulid::Ulid::new());
    let (admin_pool, store) = isolated_store(&db_url, &schema).await;

    let first = EngineIdentity {
        workspace_id: "A1".to_string(),
        engine_user_id: "eu-1".to_string(),
        api_key: "key-1".to_string(),
    };
    let second = EngineIdentity {
        workspace_id: "A1".to_string(),
        engine_user_id: "eu-2".to_string(),
        api_key: "key-2".to_string(),
    };

    let won_first = store
        .insert_engine_identity(&first)
        .await
        .expect("insert should succeed");
    let won_second = store
        .insert_engine_identity(&second)
        .await
        .expect("conflicting insert should succeed");

    assert_eq!(won_first, first);
    assert_eq!(won_second, first, "first provisioned identity must win");

    let loaded = store
        .load_engine_identity("A1")
        .await
        .expect("load should succeed")
        .expect("identity should exist");
    assert_eq!(loaded, first);

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
}
