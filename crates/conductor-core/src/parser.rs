// Message Parser (§4.G): turns whatever line-delimited JSON frame the agent
// transport produced into zero or more `MessageEnvelope`s.
//
// Parse failures are deliberately NOT `CoreError`s (§7) — a line the parser
// doesn't understand becomes a benign `system` envelope carrying a short
// diagnostic, and the stream keeps going. Only the transport losing the
// underlying process is a `CoreError`.

use serde::Deserialize;
use serde_json::Value;

use crate::envelope::{ContentBlock, EnvelopeType, MessageEnvelope, PermissionSuggestion, Role};

/// Frame shapes accepted from the agent transport's stdout stream. Unknown
/// `type` values, and values that don't even parse as the expected shape,
/// fall through to [`parse_frame`]'s catch-all.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawFrame {
    AssistantDelta {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        thinking: Option<String>,
    },
    AssistantMessage {
        #[serde(default)]
        content: Vec<RawContentBlock>,
    },
    ToolUseRequest {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    PermissionRequest {
        request_id: String,
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
        #[serde(default)]
        suggestions: Vec<RawSuggestion>,
    },
    ResultSummary {
        #[serde(default)]
        text: Option<String>,
    },
    SessionMeta {
        #[serde(default)]
        agent_session_id: Option<String>,
    },
    TurnComplete,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawContentBlock {
    Text { text: String },
    Thinking { text: String },
    ToolUse { id: String, name: String, input: Value },
    ToolResult {
        tool_use_id: String,
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Deserialize)]
struct RawSuggestion {
    label: String,
    applies_to: String,
}

impl From<RawContentBlock> for ContentBlock {
    fn from(raw: RawContentBlock) -> Self {
        match raw {
            RawContentBlock::Text { text } => ContentBlock::Text { text },
            RawContentBlock::Thinking { text } => ContentBlock::Thinking { text },
            RawContentBlock::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
            RawContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            },
        }
    }
}

/// Result of parsing one line from the agent transport.
pub enum ParsedFrame {
    /// One or more envelopes to log and broadcast.
    Envelopes(Vec<MessageEnvelope>),
    /// The agent reported its native session id for resumption; not itself
    /// rendered to the client.
    AgentSessionId(String),
    /// The agent signalled it's done processing the current user turn and
    /// is ready for the next one.
    TurnComplete,
    /// Nothing worth surfacing (e.g. an empty keepalive line).
    Ignored,
}

pub fn parse_line(session_id: &str, line: &str) -> ParsedFrame {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ParsedFrame::Ignored;
    }

    match serde_json::from_str::<RawFrame>(trimmed) {
        Ok(frame) => parse_frame(session_id, frame),
        Err(e) => match recognize_textual_frame(trimmed) {
            Some(frame) => parse_frame(session_id, frame),
            None => {
                let mut env = MessageEnvelope::system_typed(
                    session_id,
                    "unknown",
                    format!("unrecognized agent output ({e}); line ignored"),
                );
                env.raw_payload = Some(trimmed.to_string());
                ParsedFrame::Envelopes(vec![env])
            }
        },
    }
}

#[derive(Debug, Deserialize)]
struct RawTextualToolUse {
    id: String,
    name: String,
    input: Value,
}

#[derive(Debug, Deserialize)]
struct RawTextualToolResult {
    tool_use_id: String,
    #[serde(default)]
    content: Value,
    #[serde(default)]
    is_error: bool,
}

/// Recognises content the agent encoded as a plain string rather than the
/// structured `RawFrame` shape (§4.G, §9 "a recogniser layer over strings").
/// Two forms are understood: a bare JSON string literal (an ordinary text
/// delta with no frame wrapper at all), and a `TAG: payload` line where the
/// tag names the variant and the payload uses backslash escapes instead of
/// JSON string escaping — `serde_json` never unescapes it for us since the
/// line as a whole isn't valid JSON.
fn recognize_textual_frame(trimmed: &str) -> Option<RawFrame> {
    if let Ok(text) = serde_json::from_str::<String>(trimmed) {
        return Some(RawFrame::AssistantDelta { text: Some(text), thinking: None });
    }

    let (tag, rest) = trimmed.split_once(':')?;
    let rest = rest.trim_start();
    match tag.trim().to_ascii_uppercase().as_str() {
        "TEXT" => Some(RawFrame::AssistantDelta { text: Some(unescape(rest)), thinking: None }),
        "THINKING" => Some(RawFrame::AssistantDelta { text: None, thinking: Some(unescape(rest)) }),
        "TOOL_USE" => {
            let payload: RawTextualToolUse = serde_json::from_str(&unescape(rest)).ok()?;
            Some(RawFrame::ToolUseRequest {
                id: payload.id,
                name: payload.name,
                input: payload.input,
            })
        }
        "TOOL_RESULT" => {
            let payload: RawTextualToolResult = serde_json::from_str(&unescape(rest)).ok()?;
            Some(RawFrame::ToolResult {
                tool_use_id: payload.tool_use_id,
                content: payload.content,
                is_error: payload.is_error,
            })
        }
        _ => None,
    }
}

/// Decodes the small set of backslash escapes a textual fallback line may
/// carry (`\n`, `\t`, `\"`, `\\`) — needed because the line isn't valid JSON
/// itself, so nothing else unescapes it.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn parse_frame(session_id: &str, frame: RawFrame) -> ParsedFrame {
    match frame {
        RawFrame::AssistantDelta { text, thinking } => {
            let mut content = Vec::new();
            if let Some(t) = text {
                content.push(ContentBlock::Text { text: t });
            }
            if let Some(t) = thinking {
                content.push(ContentBlock::Thinking { text: t });
            }
            if content.is_empty() {
                return ParsedFrame::Ignored;
            }
            ParsedFrame::Envelopes(vec![message_envelope(session_id, Role::Assistant, content)])
        }
        RawFrame::AssistantMessage { content } => {
            let blocks: Vec<ContentBlock> = content.into_iter().map(Into::into).collect();
            if blocks.is_empty() {
                return ParsedFrame::Ignored;
            }
            ParsedFrame::Envelopes(vec![message_envelope(session_id, Role::Assistant, blocks)])
        }
        RawFrame::ToolUseRequest { id, name, input } => {
            ParsedFrame::Envelopes(vec![message_envelope(
                session_id,
                Role::Assistant,
                vec![ContentBlock::ToolUse { id, name, input }],
            )])
        }
        RawFrame::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => ParsedFrame::Envelopes(vec![message_envelope(
            session_id,
            Role::User,
            vec![ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            }],
        )]),
        RawFrame::PermissionRequest {
            request_id,
            tool_name,
            tool_input,
            suggestions,
        } => {
            let mut env = MessageEnvelope::system(session_id, "");
            env.envelope_type = EnvelopeType::PermissionRequest;
            env.text = None;
            env.permission_request_id = Some(request_id);
            env.tool_name = Some(tool_name);
            env.tool_input = Some(tool_input);
            env.suggestions = suggestions
                .into_iter()
                .map(|s| PermissionSuggestion {
                    label: s.label,
                    applies_to: s.applies_to,
                })
                .collect();
            ParsedFrame::Envelopes(vec![env])
        }
        RawFrame::ResultSummary { text } => match text {
            Some(t) => ParsedFrame::Envelopes(vec![message_envelope(
                session_id,
                Role::Assistant,
                vec![ContentBlock::Text { text: t }],
            )]),
            None => ParsedFrame::Ignored,
        },
        RawFrame::SessionMeta { agent_session_id } => match agent_session_id {
            Some(id) => ParsedFrame::AgentSessionId(id),
            None => ParsedFrame::Ignored,
        },
        RawFrame::TurnComplete => ParsedFrame::TurnComplete,
    }
}

fn message_envelope(session_id: &str, role: Role, content: Vec<ContentBlock>) -> MessageEnvelope {
    MessageEnvelope {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        envelope_type: EnvelopeType::Message,
        role: Some(role),
        content,
        permission_request_id: None,
        tool_name: None,
        tool_input: None,
        suggestions: Vec::new(),
        apply_suggestions: None,
        applied_suggestions: Vec::new(),
        text: None,
        subtype: None,
        raw_payload: None,
        created_at: chrono::Utc::now(),
    }
}
