//! HTTP/WebSocket surface for the conductor server.
//!
//! Mirrors the teacher's gateway layout: a thin `router()` assembly point
//! over handler modules that each own one concern, all sharing a single
//! cloneable `GatewayState`.

pub mod protocol;
pub mod session_ws;
pub mod state;
pub mod ui_ws;

use axum::routing::get;
use axum::Router;

pub use protocol::{ClientFrame, ServerFrame, UiServerFrame};
pub use state::GatewayState;

/// Builds the gateway's axum router: one endpoint per session, scoped by id,
/// and a single process-wide UI endpoint.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws/sessions/:session_id", get(session_ws::session_ws_handler))
        .route("/ws/ui", get(ui_ws::ui_ws_handler))
        .with_state(state)
}
