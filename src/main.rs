use anyhow::{Context, Result};
use clap::Parser;
use oibus_engine::adapters::AdapterRegistry;
use oibus_engine::checkpoint::CheckpointStore;
use oibus_engine::cli::Args;
use oibus_engine::config::{EngineConfig, EngineTopology};
use oibus_engine::engine::Engine;
use oibus_engine::http;
use oibus_engine::transformer::TransformerRegistry;
use std::sync::Arc;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,oibus_engine=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = EngineConfig::from_env()?;
    args.apply(&mut config);
    init_tracing()?;

    let topology = EngineTopology::load(&config.config_file)?;
    let checkpoints = Arc::new(
        CheckpointStore::open(&config.checkpoint_db_path()).context("failed to open checkpoint store")?,
    );
    let engine = Engine::new(
        config.clone(),
        topology,
        AdapterRegistry::builtin(),
        TransformerRegistry::builtin(),
        checkpoints,
    )
    .context("invalid engine configuration")?;
    engine.start().await;

    let app = http::router(http::HttpState {
        engine: engine.clone(),
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    tracing::info!(bind=%config.http_bind, "oibus-engine HTTP listening");
    let http_cancel = engine.cancellation_token();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { http_cancel.cancelled().await })
            .await
            .ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {
            tracing::warn!("http server exited");
        }
    }

    engine.shutdown().await;
    Ok(())
}
