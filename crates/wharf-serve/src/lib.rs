//! WebSocket control surface for the wharf scheduler.

pub mod ops;
pub mod state;
pub mod ws;

use axum::Router;
use axum::routing::any;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// The application router: one websocket endpoint.
pub fn build_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", any(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
