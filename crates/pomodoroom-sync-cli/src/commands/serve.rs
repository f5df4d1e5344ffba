//! `serve`: the trigger API, the webhook endpoint and the queue dispatcher.

use std::sync::Arc;

use clap::Args;
use pomodoroom_sync::sync::{spawn_dispatcher, SyncQueue, WebhookListener};

use super::common::{CliResult, Engine};
use crate::server::{build_router, AppState};

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on. Defaults to server.bind
    #[arg(long)]
    pub bind: Option<String>,
}

pub fn run(args: ServeArgs) -> CliResult {
    let engine = Engine::open()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve(engine, args))
}

async fn serve(engine: Engine, args: ServeArgs) -> CliResult {
    let abandoned = engine.orchestrator.abandon_expired()?;
    if !abandoned.is_empty() {
        tracing::warn!(count = abandoned.len(), "failed runs left over from a previous process");
    }

    let (queue, receiver) = SyncQueue::new(engine.config.webhook.queue_capacity);
    let dispatcher = spawn_dispatcher(receiver, engine.orchestrator.clone());

    let listener = WebhookListener::new(
        Arc::new(engine.db.subscriptions()),
        Arc::new(engine.db.leases()),
        queue,
        &engine.config.webhook,
    );
    let app = build_router(AppState {
        orchestrator: engine.orchestrator.clone(),
        webhooks: Arc::new(listener),
    });

    let bind = args.bind.unwrap_or_else(|| engine.config.server.bind.clone());
    let tcp = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %bind, "listening");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // the router owned the last queue sender, so the dispatcher drains and exits
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "dispatcher task failed");
    }
    tracing::info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
}
