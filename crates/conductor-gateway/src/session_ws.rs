// Session WebSocket plane (§4.F, §6). One socket per (session, client) —
// many clients may attach to the same session and all see the same live
// stream from the point they connected, mirroring the teacher's
// `ws_handler`/`handle_socket` shape but scoped to a single session instead
// of the whole gateway, and backed by `Coordinator` instead of `AgentHandle`.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use conductor_core::{CoreError, EnvelopeType, MessageEnvelope, SessionState};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::protocol::{ClientFrame, ServerFrame};
use crate::state::GatewayState;

const CLOSE_NOT_FOUND: u16 = 4404;
const CLOSE_SESSION_ERROR: u16 = 4003;
const CLOSE_SERVER_ERROR: u16 = 4500;

pub async fn session_ws_handler(
    Path(session_id): Path<String>,
    State(state): State<GatewayState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, session_id: String) {
    let session = match state.coordinator.get_session(&session_id).await {
        Ok(s) => s,
        Err(CoreError::NotFound(_)) => {
            close_with(&mut socket, CLOSE_NOT_FOUND, "session not found").await;
            return;
        }
        Err(e) => {
            close_with(&mut socket, CLOSE_SERVER_ERROR, &e.to_string()).await;
            return;
        }
    };
    if session.state == SessionState::Error {
        close_with(&mut socket, CLOSE_SESSION_ERROR, "session is in error state").await;
        return;
    }

    if !matches!(
        session.state,
        SessionState::Starting | SessionState::Active | SessionState::Processing
    ) {
        if let Err(e) = state.coordinator.start(&session_id).await {
            warn!(session_id, error = %e, "failed to start session on connect");
            close_with(&mut socket, CLOSE_SERVER_ERROR, &e.to_string()).await;
            return;
        }
    }

    let mut events = match state.coordinator.subscribe_session(&session_id).await {
        Ok(rx) => rx,
        Err(e) => {
            close_with(&mut socket, CLOSE_SERVER_ERROR, &e.to_string()).await;
            return;
        }
    };

    let confirmed = ServerFrame::ConnectionConfirmed {
        session_id: session_id.clone(),
        state: session.state,
    };
    if send_frame(&mut socket, &confirmed).await.is_err() {
        return;
    }

    info!(session_id, "session websocket connected");
    let keepalive = Duration::from_secs(state.keepalive_secs.max(1));
    let mut idle_ticker = tokio::time::interval(keepalive);
    idle_ticker.tick().await; // first tick fires immediately
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_pong = false;
                        handle_client_frame(&state, &session_id, &text, &mut socket).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        awaiting_pong = false;
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(session_id, error = %e, "websocket recv error");
                        break;
                    }
                }
            }
            ev = events.recv() => {
                match ev {
                    Ok(envelope) => {
                        let frame = to_server_frame(envelope);
                        if send_frame(&mut socket, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(session_id, lagged = n, "session client lagged, disconnecting");
                        let _ = send_frame(&mut socket, &ServerFrame::Error {
                            code: 503,
                            message: format!("event stream lagged by {n} events"),
                        }).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            _ = idle_ticker.tick() => {
                if awaiting_pong {
                    info!(session_id, "keepalive timeout, closing session websocket");
                    break;
                }
                awaiting_pong = true;
                if send_frame(&mut socket, &ServerFrame::Ping).await.is_err() {
                    break;
                }
            }
        }
    }

    info!(session_id, "session websocket disconnected");
}

/// `permission_request` envelopes get their own wire shape (§6) rather than
/// riding inside the generic `message` frame, so a client can react to one
/// without inspecting envelope internals.
fn to_server_frame(envelope: MessageEnvelope) -> ServerFrame {
    if envelope.envelope_type != EnvelopeType::PermissionRequest {
        return ServerFrame::Message { envelope };
    }
    ServerFrame::PermissionRequest {
        request_id: envelope.permission_request_id.unwrap_or_default(),
        session_id: envelope.session_id,
        tool_name: envelope.tool_name.unwrap_or_default(),
        input: envelope.tool_input.unwrap_or(serde_json::Value::Null),
        tool_use_id: None,
        suggestions: envelope.suggestions,
    }
}

async fn handle_client_frame(
    state: &GatewayState,
    session_id: &str,
    text: &str,
    socket: &mut WebSocket,
) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(e) => {
            let _ = send_frame(
                socket,
                &ServerFrame::Error {
                    code: 400,
                    message: format!("invalid frame: {e}"),
                },
            )
            .await;
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage { content } => {
            if let Err(e) = state.coordinator.send_message(session_id, &content).await {
                let _ = send_frame(
                    socket,
                    &ServerFrame::Error {
                        code: e.http_status(),
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
        ClientFrame::InterruptSession => {
            let result = state.coordinator.interrupt(session_id).await;
            let response = ServerFrame::InterruptResponse {
                ok: result.is_ok(),
                message: result.err().map(|e| e.to_string()),
            };
            let _ = send_frame(socket, &response).await;
        }
        ClientFrame::PermissionResponse {
            request_id,
            decision,
            apply_suggestions,
            applied_suggestions,
            guidance,
            ..
        } => {
            match state
                .coordinator
                .respond_permission(&request_id, decision.clone(), guidance, apply_suggestions)
                .await
            {
                Ok(()) => {}
                // The session was torn down between the request and this
                // decision arriving; the decision has nowhere to go (§4.D,
                // §8) — drop it rather than surfacing a stale-looking error.
                Err(CoreError::NotFound(_)) => {
                    debug!(request_id = %request_id, "permission response for unknown/torn-down session ignored");
                    return;
                }
                Err(e) => {
                    let _ = send_frame(
                        socket,
                        &ServerFrame::Error {
                            code: e.http_status(),
                            message: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            }
            let applied_updates = if apply_suggestions { applied_suggestions } else { Vec::new() };
            let _ = send_frame(
                socket,
                &ServerFrame::PermissionResponse {
                    request_id,
                    decision,
                    applied_updates,
                },
            )
            .await;
        }
        ClientFrame::SetPermissionMode { mode } => {
            if let Err(e) = state.coordinator.set_permission_mode(session_id, mode).await {
                let _ = send_frame(
                    socket,
                    &ServerFrame::Error {
                        code: e.http_status(),
                        message: e.to_string(),
                    },
                )
                .await;
            }
        }
        ClientFrame::Pong => {}
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> Result<(), axum::Error> {
    let json = serde_json::to_string(frame).expect("ServerFrame always serializes");
    socket.send(Message::Text(json)).await
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}
