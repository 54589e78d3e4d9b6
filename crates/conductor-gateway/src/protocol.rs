// Wire protocol for both WebSocket planes (§6). Kept in its own module,
// serde-tagged the same way the teacher's `ControlCommand`/`ControlEvent`
// are, so the JSON shape is obvious from the type definition alone.

use conductor_core::{MessageEnvelope, PermissionDecision, PermissionMode, PermissionSuggestion, SessionState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ConnectionConfirmed {
        session_id: String,
        state: SessionState,
    },
    Message {
        envelope: MessageEnvelope,
    },
    StateChange {
        session_id: String,
        state: SessionState,
        is_processing: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_error: Option<String>,
    },
    PermissionRequest {
        request_id: String,
        session_id: String,
        tool_name: String,
        input: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        tool_use_id: Option<String>,
        #[serde(default)]
        suggestions: Vec<PermissionSuggestion>,
    },
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
        #[serde(default)]
        applied_updates: Vec<String>,
    },
    InterruptResponse {
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Ping,
    Error {
        code: u16,
        message: String,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    SendMessage {
        content: String,
    },
    InterruptSession,
    PermissionResponse {
        request_id: String,
        decision: PermissionDecision,
        #[serde(default)]
        apply_suggestions: bool,
        #[serde(default)]
        applied_suggestions: Vec<String>,
        #[serde(default)]
        guidance: Option<String>,
        #[serde(default)]
        updated_input: Option<serde_json::Value>,
    },
    SetPermissionMode {
        mode: PermissionMode,
    },
    Pong,
}

/// Global UI-plane server frames (§6).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiServerFrame {
    SessionList {
        sessions: Vec<conductor_core::Session>,
    },
    SessionState {
        session_id: String,
        state: SessionState,
        is_processing: bool,
    },
    SessionDeleted {
        session_id: String,
    },
    Ping,
}

impl From<conductor_core::UiEvent> for UiServerFrame {
    fn from(ev: conductor_core::UiEvent) -> Self {
        match ev {
            conductor_core::UiEvent::SessionList { sessions } => UiServerFrame::SessionList { sessions },
            conductor_core::UiEvent::SessionState {
                session_id,
                state,
                is_processing,
            } => UiServerFrame::SessionState {
                session_id,
                state,
                is_processing,
            },
            conductor_core::UiEvent::SessionDeleted { session_id } => {
                UiServerFrame::SessionDeleted { session_id }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frame_send_message_deserializes() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"send_message","content":"hi"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::SendMessage { content } if content == "hi"));
    }

    #[test]
    fn server_frame_ping_serializes_with_tag_only() {
        let json = serde_json::to_string(&ServerFrame::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn permission_response_client_frame_round_trips_optional_fields() {
        let line = r#"{"type":"permission_response","request_id":"r1","decision":"allow","apply_suggestions":true}"#;
        let frame: ClientFrame = serde_json::from_str(line).unwrap();
        match frame {
            ClientFrame::PermissionResponse {
                request_id,
                decision,
                apply_suggestions,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(decision, PermissionDecision::Allow);
                assert!(apply_suggestions);
            }
            _ => panic!("expected permission_response"),
        }
    }
}
