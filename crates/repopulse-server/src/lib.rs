mod error;
mod handlers;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use repopulse_ingest::MetricsSource;
use repopulse_store::SqliteStore;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ErrorClass};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<SqliteStore>,
    pub source: Arc<dyn MetricsSource>,
}

impl AppState {
    pub fn new(store: Arc<SqliteStore>, source: Arc<dyn MetricsSource>) -> Self {
        Self { store, source }
    }
}

pub fn router(state: AppState, cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/users", post(handlers::create_user))
        .route(
            "/repos",
            get(handlers::list_repositories).post(handlers::add_repository),
        )
        .route("/repos/stats", get(handlers::repository_stats))
        .route("/repos/{id}/period-change", get(handlers::period_change))
        .route("/repos/{id}/top-performers", get(handlers::top_performers))
        .route("/repos/{id}/timeline", get(handlers::timeline))
        .route("/repos/{id}/recent-activity", get(handlers::recent_activity))
        .route("/contributors/stats", get(handlers::contributor_stats))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Serves the API until the process receives ctrl-c.
pub async fn serve(bind: SocketAddr, state: AppState, cors: bool) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "repopulse API listening");

    axum::serve(listener, router(state, cors))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %err, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await
}
