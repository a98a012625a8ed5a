use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    storage::{db::SurrealDbClient, store::StorageManager},
    utils::{config::get_config, dispatch::SessionDispatcher},
};
use ingestion_pipeline::{pipeline::IngestionPipeline, run_worker_loop};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    // Gateway and worker share one connection
    let db = Arc::new(
        SurrealDbClient::new(
            &config.surrealdb_address,
            &config.surrealdb_username,
            &config.surrealdb_password,
            &config.surrealdb_namespace,
            &config.surrealdb_database,
        )
        .await?,
    );
    db.ensure_initialized().await?;

    let openai_client = Arc::new(async_openai::Client::with_config(
        async_openai::config::OpenAIConfig::new()
            .with_api_key(&config.openai_api_key)
            .with_api_base(&config.openai_base_url),
    ));

    // Create global storage manager
    let storage = StorageManager::new(&config).await?;

    let (dispatcher, dispatch_rx) = SessionDispatcher::channel();

    let ingestion_pipeline = Arc::new(IngestionPipeline::new(
        Arc::clone(&db),
        openai_client,
        config.clone(),
        storage.clone(),
    ));

    let worker_db = Arc::clone(&db);
    let worker = tokio::spawn(async move {
        info!("Starting extraction worker");
        if let Err(e) = run_worker_loop(worker_db, ingestion_pipeline, Some(dispatch_rx)).await {
            error!("Worker process error: {}", e);
        }
    });

    let app = app_router(ApiState {
        db,
        config: config.clone(),
        storage,
        dispatcher,
    });

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    let served = axum::serve(listener, app).await;

    worker.abort();
    served?;

    Ok(())
}

fn app_router(api_state: ApiState) -> Router {
    Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .layer(TraceLayer::new_for_http())
        .with_state(api_state)
}
