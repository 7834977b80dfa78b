use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use reqwest::header::HeaderMap;

use pmos_contracts::partition::partition_tag;
use pmos_proxy::config::ProxyConfig;
use pmos_proxy::engine::{CallOptions, EngineClient, EngineClientConfig, EngineError};

const BACKFILL_WORKSPACE_KEY: &str = "PMOS_BACKFILL_WORKSPACE_ID";

/// Assigns every untagged engine resource to one designated workspace.
/// Resources that already carry a partition tag are left alone, so the
/// command can be rerun safely after a partial failure.
#[tokio::main]
async fn main() -> Result<()> {
    let dry_run = std::env::args().any(|arg| arg == "--dry-run");

    let config = ProxyConfig::load().map_err(|err| anyhow!("{err}"))?;

    let workspace_id = std::env::var(BACKFILL_WORKSPACE_KEY)
        .with_context(|| format!("{} is required", BACKFILL_WORKSPACE_KEY))?;
    let workspace_id = workspace_id.trim().to_string();
    if workspace_id.is_empty() {
        bail!("{} must not be empty", BACKFILL_WORKSPACE_KEY);
    }

    let engine = EngineClient::new(EngineClientConfig {
        base_url: config.engine_url.clone(),
        service_api_key: config.engine_api_key.clone(),
        timeout: Duration::from_millis(config.engine_timeout_ms),
        retry_max_attempts: config.engine_retry_max_attempts,
        retry_base_backoff: Duration::from_millis(config.engine_retry_base_backoff_ms),
    })
    .context("failed to build the engine client")?;

    let tag = partition_tag(&workspace_id);
    if !engine
        .tag_exists(&tag)
        .await
        .context("failed to list engine tags")?
    {
        if dry_run {
            println!("would create tag {tag}");
        } else {
            match engine.create_tag(&tag).await {
                Ok(_) => println!("created tag {tag}"),
                Err(EngineError::Conflict) => {}
                Err(err) => return Err(err).context("failed to create the partition tag"),
            }
        }
    }

    let no_headers = HeaderMap::new();
    let opts = CallOptions {
        api_key: engine.service_api_key(),
        forward_headers: &no_headers,
        idempotency_key: None,
    };

    let resources = engine
        .list_resources(&opts)
        .await
        .context("failed to list engine resources")?;

    let mut assigned = 0usize;
    let mut skipped = 0usize;

    for resource in resources {
        if resource.partition_tags().next().is_some() {
            skipped += 1;
            continue;
        }

        if dry_run {
            println!("would assign {} ({})", resource.id, resource.name);
            assigned += 1;
            continue;
        }

        let mut tags = resource.tags.clone();
        tags.push(tag.clone());
        engine
            .update_resource(&opts, &resource.id, &serde_json::json!({ "tags": tags }))
            .await
            .with_context(|| format!("failed to tag resource {}", resource.id))?;
        assigned += 1;
    }

    let verb = if dry_run { "would assign" } else { "assigned" };
    println!(
        "OK: {verb} {assigned} resource(s) to workspace {workspace_id}, skipped {skipped} already partitioned"
    );

    Ok(())
}
