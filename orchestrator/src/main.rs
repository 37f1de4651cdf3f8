use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dreaming_orchestrator::{
    config::Config,
    generation::GenerationClient,
    jobs::JobStateStore,
    queue::JobQueue,
    server,
    state::AppState,
    store::{RedisStore, Store},
    telemetry::TelemetryPoller,
    worker::{Worker, WorkerSettings},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_tracing()?;

    let cfg = Config::load()?;
    let backend = RedisStore::connect(&cfg.redis_url)
        .await
        .context("failed to connect to redis")?;
    let store = Store::new(Arc::new(backend));

    let generator = GenerationClient::new(&cfg.backend_url, cfg.limits);
    let latency = generator.latency();
    let worker = Worker::new(
        JobQueue::new(store.clone()),
        JobStateStore::new(store.clone(), cfg.expiry),
        Arc::new(generator),
        WorkerSettings {
            idle_interval: cfg.worker_idle(),
            calculate_skin: cfg.reporting.calculate_skin,
            output_dir: cfg.reporting.output_dir.clone(),
        },
    );
    let poller = TelemetryPoller::new(
        cfg.telemetry.nvidia_smi_path.clone(),
        cfg.telemetry.interval(),
    );
    let state = AppState::new(&cfg, store, worker.handle(), latency, poller.cache());

    let shutdown = CancellationToken::new();
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));
    let telemetry_task = tokio::spawn(poller.run(shutdown.clone()));

    let addr: SocketAddr = cfg.bind_addr.parse().context("invalid BIND_ADDR")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "orchestrator listening");

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down, waiting for the current job to finish");
    shutdown.cancel();
    worker_task.await.context("worker task panicked")?;
    telemetry_task.await.context("telemetry task panicked")?;
    tracing::info!("gracefully exited");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {err}");
    }
}

fn setup_tracing() -> anyhow::Result<()> {
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .try_init()
        .ok();

    Ok(())
}
