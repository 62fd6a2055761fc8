use std::sync::Arc;

use anyhow::Context;
use crew_runner::api::{self, AppState};
use crew_runner::config::RuntimeConfig;
use crew_runner::jobs::spawn_eviction_task;
use crew_runner::pipeline::EchoPipeline;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RuntimeConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        port = config.port,
        job_ttl_secs = config.job_ttl.as_secs(),
        stream_capacity = config.stream_capacity,
        max_active_jobs = config.max_active_jobs,
        history_policy = ?config.history_policy,
        "Starting crew runner"
    );

    let pipeline = Arc::new(EchoPipeline::new(config.echo_token_delay));
    let state = AppState::new(&config, pipeline);
    let scheduler = Arc::clone(&state.scheduler);

    let eviction = spawn_eviction_task(
        Arc::clone(&scheduler),
        config.job_ttl,
        config.eviction_interval,
    );

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(port = config.port, "HTTP server started");

    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            scheduler.shutdown().await;
        })
        .await
        .context("server error")?;

    eviction.abort();
    Ok(())
}
