// Normalized message shape handed to the log store, the broadcast channel,
// and ultimately the WebSocket client (§4.C, §5).
//
// Every distinct thing the agent stream can produce — prose, a thinking
// block, a tool invocation, a tool result, a permission prompt, a plain
// system notice — is flattened into one of these so downstream consumers
// never need to know which upstream agent produced it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Message,
    System,
    PermissionRequest,
    PermissionResponse,
    StateChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A suggested course of action attached to a `permission_request` envelope,
/// e.g. "always allow this tool in this project".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionSuggestion {
    pub label: String,
    pub applies_to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub id: String,
    pub session_id: String,
    pub envelope_type: EnvelopeType,
    pub role: Option<Role>,
    #[serde(default)]
    pub content: Vec<ContentBlock>,

    /// Set only on `permission_request` envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<serde_json::Value>,
    #[serde(default)]
    pub suggestions: Vec<PermissionSuggestion>,

    /// Whether the client's send carried `apply_suggestions: true` — kept
    /// distinct from `applied_suggestions` below (REDESIGN FLAGS decision).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apply_suggestions: Option<bool>,
    #[serde(default)]
    pub applied_suggestions: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Distinguishes envelopes of the same `envelope_type` (§3), e.g.
    /// `client_launched`/`session_interrupted`/`session_failed`/`unknown`
    /// for `System` envelopes. `None` for ordinary message content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,

    /// The original line the parser could not recognise, kept verbatim so a
    /// replay can reconstruct it even though no content block was produced
    /// (§4.G, §7 `ParseAnomaly`). `None` except on `subtype:"unknown"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_payload: Option<String>,

    pub created_at: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn system(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            envelope_type: EnvelopeType::System,
            role: Some(Role::System),
            content: Vec::new(),
            permission_request_id: None,
            tool_name: None,
            tool_input: None,
            suggestions: Vec::new(),
            apply_suggestions: None,
            applied_suggestions: Vec::new(),
            text: Some(text.into()),
            subtype: None,
            raw_payload: None,
            created_at: Utc::now(),
        }
    }

    /// Same as [`Self::system`], but tags the envelope with a `subtype` so a
    /// client (or a replay) can distinguish lifecycle notices and parse
    /// anomalies without pattern-matching on `text`.
    pub fn system_typed(
        session_id: impl Into<String>,
        subtype: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut env = Self::system(session_id, text);
        env.subtype = Some(subtype.into());
        env
    }

    pub fn state_change(session_id: impl Into<String>, state: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            envelope_type: EnvelopeType::StateChange,
            role: None,
            content: Vec::new(),
            permission_request_id: None,
            tool_name: None,
            tool_input: None,
            suggestions: Vec::new(),
            apply_suggestions: None,
            applied_suggestions: Vec::new(),
            text: Some(state.to_string()),
            subtype: None,
            raw_payload: None,
            created_at: Utc::now(),
        }
    }
}
