//! HTTP/WebSocket front end for the conductor engine.
//!
//! - `GET /health` liveness and counters, unauthenticated
//! - `GET /ws` websocket carrying the JSON protocol, behind the token gate

mod auth;
mod state;
mod websocket;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, middleware, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

pub use state::HttpState;

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    clients: usize,
    watches: usize,
}

async fn health(State(state): State<Arc<HttpState>>) -> Json<Health> {
    let engine = state.router.engine();
    Json(Health {
        status: "ok",
        clients: engine.clients.client_count(),
        watches: engine.watches.active_watches().len(),
    })
}

/// Build the axum app.
pub fn app(state: Arc<HttpState>) -> Router {
    let protected = Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    format!("{}:{}", host, port)
        .parse()
        .map_err(|e| format!("Invalid address: {}", e))
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve<F>(state: Arc<HttpState>, addr: SocketAddr, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async move {
            shutdown.await;
            log::info!("HTTP server shutting down");
        })
        .await
}
