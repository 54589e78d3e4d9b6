// Agent Stream Adapter (§4.C): bridges one session's `AgentTransport` to the
// rest of the system. Owns the transport exclusively and runs as its own
// task so the coordinator only ever talks to it through a command queue and
// a broadcast channel of envelopes — the same shape as the teacher's
// `ControlService` run loop (cmd_rx / completion_rx select), just scoped to
// a single session instead of the whole gateway.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::broker::{PermissionBroker, PermissionDecision, PermissionOutcome};
use crate::envelope::{ContentBlock, EnvelopeType, MessageEnvelope};
use crate::error::CoreError;
use crate::parser::{self, ParsedFrame};
use crate::transport::{AgentTransport, TransportEvent};

pub enum AdapterCommand {
    SendInput(String),
    Interrupt,
    /// Sent by the permission-wait task (see `spawn_permission_wait`) once
    /// the broker resolves a request, so the relay to the transport happens
    /// on the same task that exclusively owns it.
    RelayPermissionDecision {
        request_id: String,
        decision: PermissionDecision,
        guidance: Option<String>,
    },
    Close,
}

/// Outcome an adapter reports back to the coordinator when its task ends,
/// so the coordinator can drive the session state machine (§4.E) without
/// the adapter knowing about `Session`/`SessionState` itself.
#[derive(Debug)]
pub enum AdapterOutcome {
    TurnComplete,
    Interrupted,
    AgentExited { code: Option<i32> },
    StreamFailed { raw: String },
    /// The agent reported (or re-reported) its own session id, to be
    /// persisted on the `Session` record so the next `start()` resumes
    /// instead of opening a fresh agent session. Not terminal — the run
    /// loop keeps going.
    AgentSessionId(String),
}

pub struct AdapterHandle {
    pub commands: mpsc::Sender<AdapterCommand>,
    pub envelopes: broadcast::Sender<MessageEnvelope>,
}

/// Spawns the adapter task for `session_id`, starts the transport, and
/// returns a handle plus a receiver that resolves once per turn with the
/// outcome of that turn (the coordinator re-drives `run` for the next turn
/// by calling `SendInput` again through the same handle).
pub async fn spawn(
    session_id: String,
    mut transport: Box<dyn AgentTransport>,
    working_directory: String,
    resume_id: Option<String>,
    broker: Arc<PermissionBroker>,
    on_envelope: impl Fn(MessageEnvelope) + Send + Sync + 'static,
) -> Result<(AdapterHandle, mpsc::Receiver<AdapterOutcome>), CoreError> {
    let mut transport_rx = transport
        .start(&working_directory, resume_id.as_deref())
        .await?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel(32);
    let (envelope_tx, _) = broadcast::channel(1024);
    let (outcome_tx, outcome_rx) = mpsc::channel(8);

    let self_cmd_tx = cmd_tx.clone();
    let handle = AdapterHandle {
        commands: cmd_tx,
        envelopes: envelope_tx.clone(),
    };

    tokio::spawn(async move {
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(AdapterCommand::SendInput(text)) => {
                            if let Err(e) = transport.send(&text).await {
                                warn!(session_id, error = %e, "failed to send input to agent");
                                let _ = outcome_tx
                                    .send(AdapterOutcome::StreamFailed { raw: e.to_string() })
                                    .await;
                                break;
                            }
                        }
                        Some(AdapterCommand::Interrupt) => {
                            if let Err(e) = transport.interrupt().await {
                                warn!(session_id, error = %e, "failed to interrupt agent");
                            }
                            broker.cancel_session(&session_id).await;
                            let _ = outcome_tx.send(AdapterOutcome::Interrupted).await;
                        }
                        Some(AdapterCommand::RelayPermissionDecision { request_id, decision, guidance }) => {
                            if let Err(e) = transport
                                .send_permission_decision(&request_id, decision, guidance.as_deref())
                                .await
                            {
                                warn!(session_id, request_id, error = %e, "failed to relay permission decision");
                            }
                        }
                        Some(AdapterCommand::Close) | None => {
                            let _ = transport.close().await;
                            break;
                        }
                    }
                }
                event = transport_rx.recv() => {
                    match event {
                        Some(TransportEvent::Line(line)) => {
                            match handle_line(
                                &session_id,
                                &line,
                                &broker,
                                &envelope_tx,
                                &on_envelope,
                                &self_cmd_tx,
                            )
                            .await
                            {
                                LineOutcome::TurnComplete => {
                                    let _ = outcome_tx.send(AdapterOutcome::TurnComplete).await;
                                }
                                LineOutcome::AgentSessionId(id) => {
                                    let _ = outcome_tx.send(AdapterOutcome::AgentSessionId(id)).await;
                                }
                                LineOutcome::Continue => {}
                            }
                        }
                        Some(TransportEvent::Exited { code }) => {
                            info!(session_id, ?code, "agent process exited");
                            let _ = outcome_tx.send(AdapterOutcome::AgentExited { code }).await;
                            break;
                        }
                        None => {
                            error!(session_id, "agent transport channel closed unexpectedly");
                            let _ = outcome_tx
                                .send(AdapterOutcome::StreamFailed {
                                    raw: "transport channel closed".into(),
                                })
                                .await;
                            break;
                        }
                    }
                }
            }
        }
    });

    Ok((handle, outcome_rx))
}

enum LineOutcome {
    Continue,
    TurnComplete,
    AgentSessionId(String),
}

async fn handle_line(
    session_id: &str,
    line: &str,
    broker: &Arc<PermissionBroker>,
    envelope_tx: &broadcast::Sender<MessageEnvelope>,
    on_envelope: &(impl Fn(MessageEnvelope) + Send + Sync),
    self_cmd_tx: &mpsc::Sender<AdapterCommand>,
) -> LineOutcome {
    match parser::parse_line(session_id, line) {
        ParsedFrame::Envelopes(envelopes) => {
            for env in envelopes {
                if env.envelope_type == EnvelopeType::PermissionRequest {
                    let tool_name = env.tool_name.as_deref().unwrap_or_default();
                    if broker.is_always_allowed(session_id, tool_name).await {
                        // Standing approval already covers this tool: relay
                        // `Allow` straight back without ever raising the
                        // request to the client (§8 scenario 2).
                        let request_id = env.permission_request_id.clone().unwrap_or_default();
                        let _ = self_cmd_tx
                            .send(AdapterCommand::RelayPermissionDecision {
                                request_id,
                                decision: PermissionDecision::Allow,
                                guidance: None,
                            })
                            .await;
                        continue;
                    }
                    spawn_permission_wait(
                        session_id.to_string(),
                        env.clone(),
                        broker.clone(),
                        self_cmd_tx.clone(),
                    );
                }
                if let Some(link) = backfill_tool_use_link(session_id, &env, broker).await {
                    let _ = envelope_tx.send(link.clone());
                    on_envelope(link);
                }
                let _ = envelope_tx.send(env.clone());
                on_envelope(env);
            }
            LineOutcome::Continue
        }
        ParsedFrame::AgentSessionId(id) => {
            debug!(session_id, agent_session_id = %id, "agent reported its session id");
            LineOutcome::AgentSessionId(id)
        }
        ParsedFrame::TurnComplete => LineOutcome::TurnComplete,
        ParsedFrame::Ignored => LineOutcome::Continue,
    }
}

/// If `env` carries a `tool_use` block whose `(name, input)` matches a
/// still-pending permission request, returns a follow-up system envelope
/// recording the link (§9) so replays can reconstruct the pairing — without
/// mutating the original `permission_request` envelope already appended to
/// the log.
async fn backfill_tool_use_link(
    session_id: &str,
    env: &MessageEnvelope,
    broker: &Arc<PermissionBroker>,
) -> Option<MessageEnvelope> {
    let ContentBlock::ToolUse { id, name, input } = env.content.first()? else {
        return None;
    };
    let request_id = broker.find_request_id(session_id, name, input).await?;
    Some(MessageEnvelope::system(
        session_id,
        format!("tool_use {id} linked to permission_request {request_id}"),
    ))
}

/// Registers the permission request with the broker, then waits for the
/// eventual decision and re-enqueues it onto the adapter's own command
/// queue so it's relayed back to the transport from the single task that
/// owns it. Spawned separately so a slow-to-decide permission never blocks
/// the main read loop from processing other output.
fn spawn_permission_wait(
    session_id: String,
    env: MessageEnvelope,
    broker: Arc<PermissionBroker>,
    self_cmd_tx: mpsc::Sender<AdapterCommand>,
) {
    let Some(request_id) = env.permission_request_id.clone() else {
        return;
    };
    tokio::spawn(async move {
        let tool_name = env.tool_name.clone().unwrap_or_default();
        let tool_input = env.tool_input.clone().unwrap_or(serde_json::Value::Null);
        let rx = broker
            .register(request_id.clone(), session_id.clone(), &tool_name, &tool_input)
            .await;
        match rx.await {
            Ok(PermissionOutcome { decision, guidance }) => {
                debug!(session_id, request_id, ?decision, "permission decided");
                let _ = self_cmd_tx
                    .send(AdapterCommand::RelayPermissionDecision { request_id, decision, guidance })
                    .await;
            }
            Err(_) => {
                debug!(session_id, request_id, "permission request dropped (session interrupted)");
            }
        }
    });
}
