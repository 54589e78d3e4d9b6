// Global UI WebSocket plane (§4.F, §6): one endpoint, streams session-list
// and state changes only, never message traffic.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::UiServerFrame;
use crate::state::GatewayState;

pub async fn ui_ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut events = state.coordinator.subscribe_ui();
    let sessions = state.coordinator.list_sessions(None).await;
    if send_frame(&mut socket, &UiServerFrame::SessionList { sessions }).await.is_err() {
        return;
    }

    info!("UI websocket connected");
    let keepalive = Duration::from_secs(state.keepalive_secs.max(1));
    let mut idle_ticker = tokio::time::interval(keepalive);
    idle_ticker.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(_))) => {
                        // The UI plane is read-only from the client's side; any
                        // text frame just resets the idle timer.
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "UI websocket recv error");
                        break;
                    }
                }
            }
            ev = events.recv() => {
                match ev {
                    Ok(ui_event) => {
                        if send_frame(&mut socket, &ui_event.into()).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Matches the session plane's rule (§4.F): a lagging
                        // client is disconnected rather than silently
                        // resynchronised. The UI plane's frame set has no
                        // generic error envelope, so there's nothing to send
                        // before closing.
                        warn!(lagged = n, "UI client lagged, disconnecting");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = idle_ticker.tick() => {
                if awaiting_pong {
                    info!("UI websocket keepalive timeout");
                    break;
                }
                awaiting_pong = true;
                if send_frame(&mut socket, &UiServerFrame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    info!("UI websocket disconnected");
}

async fn send_frame(socket: &mut WebSocket, frame: &UiServerFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).expect("UiServerFrame always serializes");
    socket.send(Message::Text(json)).await
}
