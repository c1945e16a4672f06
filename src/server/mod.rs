//! HTTP server exposing implementation sessions
//!
//! All operations go through the `/api/invoke` command proxy.

mod auth;
mod proxy;
pub mod routes;
pub mod state;

pub use auth::{generate_auth_token, AuthLayer};
pub use proxy::invoke_handler;
pub use state::ServerAppState;

use axum::{
    extract::State,
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue,
    },
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// Version information for the server
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct VersionInfo {
    version: String,
    active_sessions: usize,
}

fn cors_layer(cors_origins: Option<&[String]>) -> CorsLayer {
    // Explicit headers: browsers reject a wildcard together with Authorization
    let layer = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);
    match cors_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed: Vec<HeaderValue> =
                origins.iter().filter_map(|o| o.parse().ok()).collect();
            layer.allow_origin(allowed)
        }
        _ => layer.allow_origin(Any),
    }
}

/// Build the router. Layer order: cors (outer) -> auth -> handler
pub fn build_router(state: ServerAppState, cors_origins: Option<&[String]>) -> Router {
    Router::new()
        .route("/api/invoke", post(proxy::invoke_handler))
        .route("/health", get(health_handler))
        .route("/api/version", get(version_handler))
        .layer(AuthLayer::new(state.auth_token.clone()))
        .layer(cors_layer(cors_origins))
        .with_state(state)
}

/// Run the HTTP server until shutdown is requested
pub async fn run_server(
    port: u16,
    bind: &str,
    state: ServerAppState,
    cors_origins: Option<Vec<String>>,
) -> Result<(), String> {
    let addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))?;

    let cors_display = match &cors_origins {
        Some(origins) if !origins.is_empty() => origins.join(", "),
        _ => "*".to_string(),
    };

    println!("\n╔══════════════════════════════════════════════════════════════╗");
    println!("║                    Task Autopilot Server                      ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║                                                               ║");
    println!("║  Server URL: http://{}:{:<24}  ║", bind, port);
    println!("║                                                               ║");
    println!("║  Auth Token: {}  ║", state.auth_token);
    println!("║                                                               ║");
    println!("║  CORS Origins: {:<45}║", cors_display);
    println!("║                                                               ║");
    println!("║  Endpoints:                                                   ║");
    println!("║    POST /api/invoke      - Command proxy                     ║");
    println!("║    GET  /api/version     - Server version info               ║");
    println!("║    GET  /health          - Health check                      ║");
    println!("║                                                               ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    let app = build_router(state.clone(), cors_origins.as_deref());

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| format!("Failed to bind to {}: {}", addr, e))?;

    log::info!("Server listening on http://{}", addr);

    let shutdown_state = state.shutdown_state.clone();
    let shutdown_signal = async move {
        loop {
            if shutdown_state.is_shutdown_requested() {
                log::info!("Shutdown signal received, stopping server...");
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .map_err(|e| format!("Server error: {}", e))
}

/// Health check endpoint
async fn health_handler() -> &'static str {
    "OK"
}

/// Version endpoint with the number of sessions that have a live runner
async fn version_handler(State(state): State<ServerAppState>) -> Json<VersionInfo> {
    Json(VersionInfo {
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_sessions: state.implementation_state.active_session_ids().len(),
    })
}
