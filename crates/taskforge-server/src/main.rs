mod logging;
mod routes;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use taskforge_core::{config::Config, Storage, Supervisor, WorkflowEngine};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub supervisor: Arc<Supervisor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Config::from_env();

    let storage = Arc::new(Storage::connect(&config.storage)?);
    storage.run_migrations().await?;

    let supervisor = Arc::new(Supervisor::new(config.supervisor.clone()));
    supervisor.init().await?;

    let engine = Arc::new(WorkflowEngine::new(Arc::clone(&storage), Arc::clone(&supervisor)));

    let state = Arc::new(AppState {
        engine,
        supervisor,
    });

    let app = Router::new()
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/v1/actions", post(routes::dispatch_action))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let bind = config.web_bind.clone();
    let port = config.web_port;
    let addr = format!("{bind}:{port}");

    info!("Listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
