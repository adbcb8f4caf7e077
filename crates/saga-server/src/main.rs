//! Saga server entry point.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use saga::results_export::DEFAULT_STEP_TIMEOUT;
use saga::{InMemoryChannel, MessageChannel, PostgresChannel, SagaMaintenance, SagaWorker};
use saga_server::config::ServerConfig;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

/// Resolves once `true` is sent on the shutdown channel.
async fn stopped(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let (json, text) = if config.json_logs {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .init();
}

/// Runs the worker, the maintenance jobs and the admin server until a
/// shutdown signal arrives.
async fn serve<S, C>(config: ServerConfig, store: S, channel: C, metrics_handle: PrometheusHandle)
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    let state = saga_server::create_default_state(store, channel, DEFAULT_STEP_TIMEOUT)
        .expect("invalid results export workflow");
    let orchestrator = Arc::clone(&state.orchestrator);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = SagaWorker::new(orchestrator.clone()).with_concurrency(config.worker_concurrency);
    let worker = tokio::spawn(worker.run(stopped(shutdown_rx.clone())));

    let maintenance = SagaMaintenance::new(orchestrator, config.maintenance_config());
    let maintenance = tokio::spawn(maintenance.run(stopped(shutdown_rx)));

    let app = saga_server::create_app(state, metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting saga server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    match worker.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "saga worker failed"),
        Err(e) => tracing::error!(error = %e, "saga worker panicked"),
    }
    if let Err(e) = maintenance.await {
        tracing::error!(error = %e, "saga maintenance panicked");
    }
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = ServerConfig::from_env();

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Pick the backends and run
    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .max_connections(config.database_max_connections)
                .connect(&url)
                .await
                .expect("failed to connect to database");

            let store = PostgresSagaStore::new(pool.clone());
            store.run_migrations().await.expect("migrations failed");
            let channel = PostgresChannel::new(pool, config.channel_config());

            tracing::info!("using PostgreSQL saga store and channel");
            serve(config, store, channel, metrics_handle).await;
        }
        None => {
            let store = InMemorySagaStore::new();
            let channel = InMemoryChannel::with_retry_policy(config.retry_policy());

            tracing::warn!("DATABASE_URL not set, sagas are kept in memory only");
            serve(config, store, channel, metrics_handle).await;
        }
    }

    tracing::info!("server shut down gracefully");
}
