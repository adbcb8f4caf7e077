//! Host process for the saga engine.
//!
//! Runs the results export workflow against Postgres (or in-memory backends
//! when no database is configured) and exposes a small admin surface: health,
//! Prometheus metrics, starting exports, inspecting sagas and failing them by
//! hand.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::results_export::{self, ResultsExportOrchestrator};
use saga::{
    DownstreamNotifier, FileGenerator, InMemoryDownstreamNotifier, InMemoryFileGenerator,
    MessageChannel, SagaService,
};
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S, C> {
    pub orchestrator: Arc<ResultsExportOrchestrator<S, C>>,
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, C>(state: Arc<AppState<S, C>>, metrics_handle: PrometheusHandle) -> Router
where
    S: SagaStore + 'static,
    C: MessageChannel + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, C>))
        .route("/results-exports", post(routes::sagas::start_export::<S, C>))
        .route("/sagas/{id}", get(routes::sagas::get::<S, C>))
        .route("/sagas/{id}/events", get(routes::sagas::events::<S, C>))
        .route("/sagas/{id}/fail", post(routes::sagas::fail::<S, C>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Wires the results export workflow to a store and a channel.
///
/// The file generator and notifier are the in-memory implementations; the
/// process has no real collaborators to call.
pub fn create_default_state<S, C>(
    store: S,
    channel: C,
    step_timeout: Duration,
) -> saga::Result<Arc<AppState<S, C>>>
where
    S: SagaStore,
    C: MessageChannel,
{
    let generator: Arc<dyn FileGenerator> = Arc::new(InMemoryFileGenerator::new());
    let notifier: Arc<dyn DownstreamNotifier> = Arc::new(InMemoryDownstreamNotifier::new());

    let orchestrator = results_export::orchestrator(
        SagaService::new(store),
        channel,
        generator,
        notifier,
        step_timeout,
    )?;

    Ok(Arc::new(AppState {
        orchestrator: Arc::new(orchestrator),
    }))
}
