use std::sync::Arc;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use counter_server::aggregator::Aggregator;
use counter_server::backend::{self, Backend, InMemoryBackend, RedisBackend};
use counter_server::config::{BackendKind, Config};
use counter_server::{flusher, listener, server, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    tracing::info!(?config, "starting counter server");

    // ── 1. Pick the backend ──────────────────────────────────────
    let backend: Arc<dyn Backend> = match config.backend {
        BackendKind::Redis => {
            tracing::info!(url = %config.redis_url, "connecting to redis");
            let conn = backend::connect(&config.redis_url).await?;
            Arc::new(RedisBackend::new(conn))
        }
        BackendKind::Memory => {
            tracing::warn!("in-memory backend: counts are lost on restart");
            Arc::new(InMemoryBackend::new())
        }
    };

    // ── 2. Aggregator, owned here and shared by reference ────────
    let aggregator = Arc::new(Aggregator::new(backend));
    aggregator.set_verbosity(config.verbosity);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // Separate signal so the final flush runs only after the listener is gone.
    let (flush_stop_tx, flush_stop_rx) = watch::channel(false);

    // ── 3. UDP listener + periodic flush ─────────────────────────
    let socket = listener::bind(config.udp_addr).await?;
    let udp_addr = socket.local_addr()?;
    let listener_task = tokio::spawn(listener::run(socket, aggregator.clone(), shutdown_rx.clone()));
    let flusher_task = tokio::spawn(flusher::run(
        aggregator.clone(),
        config.flush_interval,
        flush_stop_rx,
    ));

    // ── 4. Admin HTTP surface ────────────────────────────────────
    let state = Arc::new(AppState::new(aggregator, udp_addr));
    let app = server::create_router(state);
    let http = tokio::net::TcpListener::bind(config.http_addr).await?;
    tracing::info!(addr = %http.local_addr()?, "admin api listening");

    let mut http_shutdown = shutdown_rx;
    let serve_task = tokio::spawn(async move {
        let result = axum::serve(http, app)
            .with_graceful_shutdown(async move {
                let _ = http_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(err) = result {
            tracing::error!(%err, "admin api exited");
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    shutdown_tx.send(true)?;

    let _ = listener_task.await;
    flush_stop_tx.send(true)?;
    let _ = flusher_task.await;
    let _ = serve_task.await;

    Ok(())
}
