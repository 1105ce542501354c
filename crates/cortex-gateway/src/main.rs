//! Cortex gateway server.
//!
//! Startup order matters: WAL recovery and process-registry cleanup run
//! before the listener accepts work, and a pending restart-continuation
//! marker is replayed once the server is otherwise ready.

mod app;
mod background;
mod dispatch;
mod events;
mod restart;
mod turn;
mod ws;

use std::sync::Arc;

use clap::Parser;
use tokio::sync::{mpsc, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use cortex_core::CortexConfig;
use cortex_memory::HttpEmbedder;
use cortex_pipelines::SdkPipelineLlm;
use cortex_scheduler::{SchedulerEngine, TaskStore};

#[derive(Debug, Parser)]
#[command(name = "cortex-gateway", about = "Personal assistant runtime gateway")]
struct Args {
    /// Path to cortex.toml (defaults to ~/.cortex/cortex.toml).
    #[arg(long)]
    config: Option<String>,

    /// SDK binary used for agent sessions.
    #[arg(long, default_value = "claude")]
    sdk_command: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = CortexConfig::load(args.config.as_deref())?;

    let embedder = Arc::new(HttpEmbedder::new(
        config.encoder.base_url.clone(),
        config.encoder.timeout_secs,
    ));
    let llm = Arc::new(SdkPipelineLlm::new(args.sdk_command.clone()));

    let state = app::AppState::build(config, embedder, llm, args.sdk_command).await?;

    // Recovery before any new work is accepted.
    state.recover_on_startup();

    // Scheduler engine + dispatcher.
    let (fired_tx, fired_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let engine = SchedulerEngine::new(TaskStore::new(state.config.data.tasks_file()), fired_tx);
    tokio::spawn(engine.run(shutdown_rx.clone()));
    tokio::spawn(dispatch::run_dispatcher(state.clone(), fired_rx));

    // Periodic WAL GC.
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                interval.tick().await;
                state.wal.clear_old_entries(24.0);
            }
        });
    }

    // Replay a pending restart continuation.
    {
        let state = state.clone();
        tokio::spawn(async move {
            restart::resume_continuation(&state).await;
        });
    }

    let addr = format!(
        "{}:{}",
        state.config.gateway.bind, state.config.gateway.port
    );
    info!(%addr, "cortex gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let router = ws::router(state);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            let _ = shutdown_tx.send(true);
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
