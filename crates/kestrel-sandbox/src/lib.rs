//! # Kestrel Sandbox
//!
//! An in-memory chain served over the node RPC paths the client uses, plus
//! a few `/sandbox` routes to fund accounts, bake blocks and force reorgs.

use std::net::SocketAddr;

use axum::{
    routing::{get, post},
    Router,
};
use kestrel_chain::InMemoryNode;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub mod api;
pub mod config;
pub mod state;

pub use config::SandboxConfig;
pub use state::AppState;

const BLOCK: &str = "/chains/:chain/blocks/:block";
const CONTRACT: &str = "/chains/:chain/blocks/:block/context/contracts/:address";

/// Create the API router.
pub fn create_router(state: AppState) -> Router {
    // CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health check
        .route("/health", get(api::health::health_check))

        // Blocks
        .route(BLOCK, get(api::blocks::get_block))
        .route(&format!("{BLOCK}/header"), get(api::blocks::get_header))
        .route(&format!("{BLOCK}/context/constants"), get(api::blocks::get_constants))

        // Contract context
        .route(&format!("{CONTRACT}/counter"), get(api::contracts::get_counter))
        .route(&format!("{CONTRACT}/manager_key"), get(api::contracts::get_manager_key))
        .route(&format!("{CONTRACT}/balance"), get(api::contracts::get_balance))
        .route(&format!("{CONTRACT}/script"), get(api::contracts::get_script))
        .route(&format!("{CONTRACT}/storage"), get(api::contracts::get_storage))
        .route(&format!("{CONTRACT}/big_map_get"), post(api::contracts::big_map_get))

        // Injection and simulation
        .route("/injection/operation", post(api::injection::inject_operation))
        .route(
            &format!("{BLOCK}/helpers/scripts/run_operation"),
            post(api::injection::run_operation),
        )

        // Sandbox controls
        .route("/sandbox/bake", post(api::admin::bake))
        .route("/sandbox/fund", post(api::admin::fund))
        .route("/sandbox/reorg", post(api::admin::reorg))
        .route("/sandbox/mempool", get(api::admin::get_mempool))
        .route("/sandbox/accounts/:address", get(api::admin::get_account))

        // Add middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bake a block every `interval` until the task is aborted.
pub fn spawn_baker(node: InMemoryNode, interval: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let header = node.bake().await;
            info!(level = header.level, "baked block");
        }
    })
}

/// Serve `node` on an ephemeral local port.
pub async fn spawn(node: InMemoryNode) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = create_router(AppState::new(node));
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "sandbox server stopped");
        }
    });
    Ok((addr, server))
}

/// Run the sandbox until the server stops.
pub async fn run_server(config: SandboxConfig) -> anyhow::Result<()> {
    let node = InMemoryNode::new();
    let state = AppState::new(node.clone());

    let baker = config.bake_interval().map(|interval| {
        info!(interval_ms = config.bake_interval_ms, "automatic baking enabled");
        spawn_baker(node, interval)
    });

    let app = create_router(state);
    let listener = TcpListener::bind(config.bind).await?;
    info!("Listening on http://{}", listener.local_addr()?);

    let served = axum::serve(listener, app).await;
    if let Some(baker) = baker {
        baker.abort();
    }
    served?;
    Ok(())
}
