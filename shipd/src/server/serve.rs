//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::ShipError;
use crate::server::handlers::{
    active_jobs_handler, create_project_handler, delete_project_handler, deploy_handler,
    environment_handler, events_handler, health_handler, history_handler, job_handler,
    live_deploy_handler, logs_handler, project_history_handler, project_status_handler,
    projects_handler, rollback_handler, test_connection_handler, update_project_handler,
    version_handler,
};
use crate::server::state::ServerState;

/// Build the application router
pub fn router(state: Arc<ServerState>) -> Router {
    let api = Router::new()
        // Projects
        .route("/projects", get(projects_handler).post(create_project_handler))
        .route(
            "/project/{name}",
            put(update_project_handler).delete(delete_project_handler),
        )
        .route("/project/{name}/status", get(project_status_handler))
        .route("/project/{name}/deploy", post(deploy_handler))
        .route("/project/{name}/rollback", post(rollback_handler))
        .route("/project/{name}/logs", get(logs_handler))
        .route("/project/{name}/environment", get(environment_handler))
        .route("/project/{name}/history", get(project_history_handler))
        .route("/test-connection", post(test_connection_handler))
        // Deployment jobs
        .route("/deploy/jobs/{id}", get(job_handler))
        .route("/deploy/active", get(active_jobs_handler))
        .route("/deploy/history", get(history_handler))
        .route("/deploy/events", get(events_handler))
        .route("/ws/logs/{name}", get(live_deploy_handler));

    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .nest("/api/v1", api)
        // State and middleware
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), ShipError>>, ShipError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| ShipError::ServerError(format!("failed to bind {}: {}", addr, e)))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| ShipError::ServerError(e.to_string()))
    });

    Ok(handle)
}
