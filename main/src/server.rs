use api_router::{api_routes_v1, api_state::ApiState};
use axum::Router;
use common::{
    storage::store::StorageManager,
    utils::{config::get_config, dispatch::SessionDispatcher},
};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// HTTP front end only. Sessions are picked up by a separately running `worker`.
#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let config = get_config()?;

    let storage = StorageManager::new(&config).await?;
    let api_state = ApiState::new(&config, storage, SessionDispatcher::detached()).await?;

    let app = Router::new()
        .nest("/api/v1", api_routes_v1(&api_state))
        .layer(TraceLayer::new_for_http())
        .with_state(api_state);

    info!("Starting server listening on 0.0.0.0:{}", config.http_port);
    let serve_address = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(serve_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
