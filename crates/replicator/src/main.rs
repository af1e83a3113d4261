//! Composition root (C13, §4.13). Wires the source, sink pool, schema
//! manager, writer, and engine together and runs backfill then watch. This
//! file is intentionally thin: it is where the other crates get wired up,
//! not where replication logic lives.

use anyhow::Context;
use config::Config;
use engine::Engine;
use mongodb::Client as MongoClient;
use projection::ProjectionConfig;
use registry::Registry;
use schema::SchemaManager;
use source::{MongoSource, SourceClient};
use sqlx::postgres::PgPoolOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            // Tracing isn't initialized yet at this point, since the log
            // level itself comes from config.
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);

    if let Err(err) = run(config).await {
        tracing::error!(error = ?err, "replicator exited with an error");
        std::process::exit(1);
    }
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let projection = ProjectionConfig::load(config.projection_config.as_ref().map(PathBuf::from).as_deref())
        .context("loading projection config")?;

    let mongo_client = MongoClient::with_uri_str(&config.mongo_uri)
        .await
        .context("connecting to mongodb")?;
    let source: Arc<dyn SourceClient> = Arc::new(MongoSource::new(mongo_client, config.db_name.clone()));

    let pool = PgPoolOptions::new()
        .connect(&config.pg_dsn)
        .await
        .context("connecting to postgres")?;
    let registry = Registry::new(pool);
    registry.ensure_schema().await.context("ensuring registry schema")?;

    let collections = resolve_collections(&source, &config).await?;
    let watch_filter = if config.collections.is_some() || !config.exclude_collections.is_empty() {
        Some(collections.clone())
    } else {
        None
    };

    let schema_manager = SchemaManager::new(registry);
    let writer = writer::BulkWriter::new(
        schema_manager.registry().pool().clone(),
        config.copy_enabled,
        config.copy_min_rows,
    );
    let mut engine = Engine::new(source, schema_manager, writer, projection, config.batch_size);

    if config.backfill {
        tracing::info!(collections = ?collections, "starting backfill");
        engine.backfill(&collections).await.context("backfill failed")?;
        tracing::info!("backfill complete");
    }

    if config.watch {
        tracing::info!("entering change-stream watch loop");
        let shutdown = shutdown_signal();
        engine
            .watch(&config.db_name, watch_filter, shutdown)
            .await
            .context("change-stream watch loop failed")?;
    }

    Ok(())
}

async fn resolve_collections(
    source: &Arc<dyn SourceClient>,
    config: &Config,
) -> anyhow::Result<Vec<String>> {
    let all = match &config.collections {
        Some(explicit) => explicit.clone(),
        None => source.list_collections().await.context("listing collections")?,
    };
    Ok(all
        .into_iter()
        .filter(|name| !config.exclude_collections.contains(name))
        .collect())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
