// syncdoc server - serves named document databases and their sync targets.

use axum::Router;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use syncdoc::{app_state::ServerState, config::Config, remote::create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Load configuration
    let config = Config::from_env()?;

    // One shared registry of named databases for the whole server
    let state = ServerState::new();

    // Build application router
    let app = Router::new()
        .merge(create_router(state))
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = config.server_address().parse()?;
    info!("syncdoc server listening on http://{}", addr);
    info!("  GET    /{{db}}                       - database info");
    info!("  PUT    /{{db}}                       - create database");
    info!("  GET    /{{db}}/doc/{{doc_id}}          - fetch document");
    info!("  PUT    /{{db}}/doc/{{doc_id}}          - store document");
    info!("  DELETE /{{db}}/doc/{{doc_id}}          - delete document");
    info!("  GET    /{{db}}/sync-from/{{source}}    - sync info");
    info!("  PUT    /{{db}}/sync-from/{{source}}    - record sync info");
    info!("  POST   /{{db}}/sync-from/{{source}}    - sync exchange");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
