// Session Coordinator (§4.E): the only component that moves a session
// through its state machine. Everything else below it (adapter, broker,
// log store, registry) is a passive collaborator with no opinion about what
// should happen next; the coordinator is where that policy lives, mirroring
// how `ControlService` in the teacher owns `Session.state` exclusively while
// delegating the actual work to `AgentHandle`/`Agent`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{info, warn};

use crate::adapter::{self, AdapterCommand, AdapterHandle, AdapterOutcome};
use crate::broker::{PermissionBroker, PermissionDecision};
use crate::envelope::MessageEnvelope;
use crate::error::{friendly_diagnostic, CoreError};
use crate::log_store::{LogStore, Page};
use crate::model::{CreateOptions, LastError, PermissionMode, Session, SessionState};
use crate::registry::SessionRegistry;
use crate::transport::TransportFactory;

/// Events on the process-wide UI plane (§4.F), distinct from the per-session
/// envelope broadcast: a client watching the session list doesn't need (or
/// want) every session's message stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    SessionList { sessions: Vec<Session> },
    SessionState {
        session_id: String,
        state: SessionState,
        is_processing: bool,
    },
    SessionDeleted { session_id: String },
}

/// Bound on how long graceful shutdown waits for one session's adapter to
/// acknowledge interrupt + close before the coordinator gives up on it and
/// moves on to the next session (§4.E graceful shutdown).
const SHUTDOWN_PER_SESSION_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Coordinator {
    registry: Arc<SessionRegistry>,
    log_store: Arc<LogStore>,
    broker: Arc<PermissionBroker>,
    transport_factory: Arc<dyn TransportFactory>,
    adapters: Arc<Mutex<HashMap<String, AdapterHandle>>>,
    ui_tx: broadcast::Sender<UiEvent>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        log_store: Arc<LogStore>,
        broker: Arc<PermissionBroker>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let (ui_tx, _) = broadcast::channel(256);
        Self {
            registry,
            log_store,
            broker,
            transport_factory,
            adapters: Arc::new(Mutex::new(HashMap::new())),
            ui_tx,
        }
    }

    /// Must be called once at startup, before accepting connections: forces
    /// any session left mid-turn by a previous process into `paused`.
    pub async fn reconcile_after_restart(&self) -> Result<(), CoreError> {
        self.registry.reconcile_after_restart().await
    }

    pub fn subscribe_ui(&self) -> broadcast::Receiver<UiEvent> {
        self.ui_tx.subscribe()
    }

    /// Subscribes to a session's live envelope stream. Returns `NotFound` if
    /// the session has no running adapter — callers should fall back to
    /// `list_messages` for history and call `start` to get a live adapter.
    pub async fn subscribe_session(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<MessageEnvelope>, CoreError> {
        let adapters = self.adapters.lock().await;
        let handle = adapters
            .get(session_id)
            .ok_or_else(|| CoreError::Precondition(format!("session {session_id} is not running")))?;
        Ok(handle.envelopes.subscribe())
    }

    pub async fn create(&self, project_id: &str, opts: CreateOptions) -> Result<Session, CoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(id, project_id.to_string(), opts);
        self.registry.insert(session.clone()).await?;
        self.publish_session_list().await;
        Ok(session)
    }

    pub async fn list_sessions(&self, project_id: Option<&str>) -> Vec<Session> {
        self.registry.list(project_id).await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session, CoreError> {
        self.registry.require(session_id).await
    }

    pub async fn list_messages(
        &self,
        session_id: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Page, CoreError> {
        self.registry.require(session_id).await?;
        self.log_store.read_page(session_id, offset, limit).await
    }

    /// Starts (or resumes) a session's adapter. Legal from `created`,
    /// `paused`, or `error` (§3). Idempotent on a session that already has a
    /// live adapter: returns the current record without creating a second
    /// one.
    pub async fn start(&self, session_id: &str) -> Result<Session, CoreError> {
        let session = self.registry.require(session_id).await?;
        if self.adapters.lock().await.contains_key(session_id) {
            return Ok(session);
        }

        let transport = self.transport_factory.build();
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<MessageEnvelope>();
        let on_envelope = move |env: MessageEnvelope| {
            let _ = persist_tx.send(env);
        };

        let (handle, outcome_rx) = match adapter::spawn(
            session_id.to_string(),
            transport,
            session.working_directory.clone(),
            session.agent_session_id.clone(),
            self.broker.clone(),
            on_envelope,
        )
        .await
        {
            Ok(pair) => pair,
            Err(e) => {
                let message = friendly_diagnostic(&e.to_string());
                let env = MessageEnvelope::system_typed(session_id, "session_failed", message.clone());
                let _ = self.log_store.append(&env).await;
                let updated = self
                    .registry
                    .update(session_id, |s| {
                        s.is_processing = false;
                        s.state = SessionState::Error;
                        s.last_error = Some(LastError {
                            kind: "agent_startup_failure".into(),
                            message: message.clone(),
                            raw: e.to_string(),
                            at: chrono::Utc::now(),
                        });
                    })
                    .await?;
                self.publish_state(&updated).await;
                return Err(e);
            }
        };

        self.adapters
            .lock()
            .await
            .insert(session_id.to_string(), handle);

        let log_store = self.log_store.clone();
        let sid = session_id.to_string();
        tokio::spawn(async move {
            while let Some(env) = persist_rx.recv().await {
                if let Err(e) = log_store.append(&env).await {
                    warn!(session_id = %sid, error = %e, "failed to persist envelope");
                }
            }
        });

        self.spawn_outcome_watcher(session_id.to_string(), outcome_rx);

        let updated = self
            .registry
            .update(session_id, |s| {
                s.state = SessionState::Active;
                s.is_processing = false;
                s.last_active_at = chrono::Utc::now();
            })
            .await?;
        self.publish_state(&updated).await;
        // Both a fresh launch and a resume (agent id already on the row) are
        // recorded under the same subtype — a resume is a `client_launched`
        // envelope whose session already carries history, not a distinct
        // notice of its own.
        self.emit_system(session_id, "client_launched", "session started").await;
        Ok(updated)
    }

    fn spawn_outcome_watcher(&self, session_id: String, mut outcome_rx: mpsc::Receiver<AdapterOutcome>) {
        let registry = self.registry.clone();
        let ui_tx = self.ui_tx.clone();
        let broker = self.broker.clone();
        let adapters = self.adapters.clone();
        let log_store = self.log_store.clone();

        tokio::spawn(async move {
            while let Some(outcome) = outcome_rx.recv().await {
                let terminal = matches!(
                    outcome,
                    AdapterOutcome::AgentExited { .. } | AdapterOutcome::StreamFailed { .. }
                );
                let result = match outcome {
                    AdapterOutcome::TurnComplete | AdapterOutcome::Interrupted => {
                        registry
                            .update(&session_id, |s| {
                                s.state = SessionState::Active;
                                s.is_processing = false;
                            })
                            .await
                    }
                    AdapterOutcome::AgentSessionId(id) => {
                        registry
                            .update(&session_id, |s| {
                                s.agent_session_id = Some(id.clone());
                            })
                            .await
                    }
                    AdapterOutcome::AgentExited { code } => {
                        broker.cancel_session(&session_id).await;
                        let is_clean = code == Some(0);
                        if !is_clean {
                            let message = friendly_diagnostic(&format!(
                                "agent process exited with code {code:?}"
                            ));
                            let env = MessageEnvelope::system_typed(
                                &session_id,
                                "session_failed",
                                message.clone(),
                            );
                            let _ = log_store.append(&env).await;
                            if let Some(handle) = adapters.lock().await.get(&session_id) {
                                let _ = handle.envelopes.send(env);
                            }
                        }
                        registry
                            .update(&session_id, |s| {
                                s.is_processing = false;
                                if is_clean {
                                    s.state = SessionState::Paused;
                                } else {
                                    s.state = SessionState::Error;
                                    s.last_error = Some(LastError {
                                        kind: "agent_exited".into(),
                                        message: friendly_diagnostic(&format!(
                                            "agent process exited with code {code:?}"
                                        )),
                                        raw: format!("exit code {code:?}"),
                                        at: chrono::Utc::now(),
                                    });
                                }
                            })
                            .await
                    }
                    AdapterOutcome::StreamFailed { raw } => {
                        broker.cancel_session(&session_id).await;
                        let message = friendly_diagnostic(&raw);
                        let env = MessageEnvelope::system_typed(&session_id, "session_failed", message.clone());
                        let _ = log_store.append(&env).await;
                        if let Some(handle) = adapters.lock().await.get(&session_id) {
                            let _ = handle.envelopes.send(env);
                        }
                        registry
                            .update(&session_id, |s| {
                                s.is_processing = false;
                                s.state = SessionState::Error;
                                s.last_error = Some(LastError {
                                    kind: "stream_failed".into(),
                                    message: friendly_diagnostic(&raw),
                                    raw: raw.clone(),
                                    at: chrono::Utc::now(),
                                });
                            })
                            .await
                    }
                };
                if terminal {
                    adapters.lock().await.remove(&session_id);
                }
                match result {
                    Ok(updated) => {
                        let _ = ui_tx.send(UiEvent::SessionState {
                            session_id: session_id.clone(),
                            state: updated.state,
                            is_processing: updated.is_processing,
                        });
                    }
                    Err(e) => {
                        // The session was deleted out from under a still-running
                        // adapter; nothing left to update.
                        warn!(session_id = %session_id, error = %e, "outcome watcher: session vanished");
                    }
                }
                if terminal {
                    break;
                }
            }
        });
    }

    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<Session, CoreError> {
        let session = self.registry.require(session_id).await?;
        if session.state != SessionState::Active {
            return Err(CoreError::Precondition(format!(
                "session {session_id} is {:?}, not active",
                session.state
            )));
        }
        let adapters = self.adapters.lock().await;
        let handle = adapters
            .get(session_id)
            .ok_or_else(|| CoreError::Precondition(format!("session {session_id} has no running adapter")))?;
        handle
            .commands
            .send(AdapterCommand::SendInput(text.to_string()))
            .await
            .map_err(|_| CoreError::AgentStreamFailure("adapter command queue closed".into()))?;
        drop(adapters);

        self.registry
            .update(session_id, |s| {
                s.state = SessionState::Processing;
                s.is_processing = true;
                s.last_active_at = chrono::Utc::now();
            })
            .await
    }

    pub async fn interrupt(&self, session_id: &str) -> Result<(), CoreError> {
        self.registry.require(session_id).await?;
        {
            let adapters = self.adapters.lock().await;
            let handle = adapters
                .get(session_id)
                .ok_or_else(|| CoreError::Precondition(format!("session {session_id} has no running adapter")))?;
            handle
                .commands
                .send(AdapterCommand::Interrupt)
                .await
                .map_err(|_| CoreError::AgentStreamFailure("adapter command queue closed".into()))?;
        }
        self.emit_system(session_id, "session_interrupted", "interrupted by client").await;
        Ok(())
    }

    /// Persists a system envelope and, if the session still has a live
    /// adapter, rebroadcasts it on the same channel live subscribers watch.
    /// Used for the synthetic lifecycle notices (`client_launched`,
    /// `session_interrupted`, `session_failed`) that originate with the
    /// coordinator itself rather than the agent stream.
    async fn emit_system(&self, session_id: &str, subtype: impl Into<String>, text: impl Into<String>) {
        let env = MessageEnvelope::system_typed(session_id, subtype, text);
        if let Err(e) = self.log_store.append(&env).await {
            warn!(session_id, error = %e, "failed to persist system envelope");
        }
        if let Some(handle) = self.adapters.lock().await.get(session_id) {
            let _ = handle.envelopes.send(env);
        }
    }

    pub async fn respond_permission(
        &self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<String>,
        apply_suggestions: bool,
    ) -> Result<(), CoreError> {
        self.broker
            .resolve(request_id, decision, guidance, apply_suggestions)
            .await
    }

    pub async fn respond_permission_by_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
        decision: PermissionDecision,
        guidance: Option<String>,
        apply_suggestions: bool,
    ) -> Result<(), CoreError> {
        self.broker
            .resolve_by_tool(
                session_id,
                tool_name,
                tool_input,
                decision,
                guidance,
                apply_suggestions,
            )
            .await
    }

    pub async fn set_permission_mode(
        &self,
        session_id: &str,
        mode: PermissionMode,
    ) -> Result<Session, CoreError> {
        self.registry
            .update(session_id, |s| s.permission_mode = mode)
            .await
    }

    /// Stops a session's adapter (if running) and marks it `paused`, ready
    /// to be `start`ed again later. Used for both the user-initiated
    /// "pause" action and as a building block of graceful shutdown.
    pub async fn pause(&self, session_id: &str) -> Result<Session, CoreError> {
        self.stop_adapter(session_id, Duration::from_secs(10)).await;
        self.broker.cancel_session(session_id).await;
        let updated = self
            .registry
            .update(session_id, |s| {
                s.state = SessionState::Paused;
                s.is_processing = false;
            })
            .await?;
        self.publish_state(&updated).await;
        Ok(updated)
    }

    /// Terminates a session permanently: stops the adapter and marks the
    /// session `terminated`. Unlike `pause`, this is not meant to be
    /// resumed (though nothing stops a future `start` from trying).
    pub async fn terminate(&self, session_id: &str) -> Result<Session, CoreError> {
        self.stop_adapter(session_id, Duration::from_secs(10)).await;
        self.broker.cancel_session(session_id).await;
        let updated = self
            .registry
            .update(session_id, |s| {
                s.state = SessionState::Terminated;
                s.is_processing = false;
            })
            .await?;
        self.publish_state(&updated).await;
        Ok(updated)
    }

    pub async fn delete(&self, session_id: &str) -> Result<(), CoreError> {
        let session = self.registry.require(session_id).await?;
        if matches!(
            session.state,
            SessionState::Starting | SessionState::Active | SessionState::Processing
        ) {
            return Err(CoreError::Precondition(
                "cannot delete a running session; terminate it first".into(),
            ));
        }
        self.registry.remove(session_id).await?;
        self.log_store.delete(session_id).await?;
        let _ = self.ui_tx.send(UiEvent::SessionDeleted {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn stop_adapter(&self, session_id: &str, timeout: Duration) {
        let handle = self.adapters.lock().await.remove(session_id);
        let Some(handle) = handle else { return };
        let _ = handle.commands.send(AdapterCommand::Interrupt).await;
        let _ = tokio::time::timeout(timeout, async {
            let _ = handle.commands.send(AdapterCommand::Close).await;
        })
        .await;
    }

    async fn publish_state(&self, session: &Session) {
        let _ = self.ui_tx.send(UiEvent::SessionState {
            session_id: session.id.clone(),
            state: session.state,
            is_processing: session.is_processing,
        });
    }

    async fn publish_session_list(&self) {
        let sessions = self.registry.list(None).await;
        let _ = self.ui_tx.send(UiEvent::SessionList { sessions });
    }

    /// Graceful shutdown (§4.E expansion): on SIGINT/SIGTERM, every session
    /// with a live adapter is interrupted then closed with a bounded
    /// per-session timeout, and forced to `paused` (resumable) rather than
    /// `terminated` — a restart should find these sessions ready to pick up
    /// where they left off, not gone.
    pub async fn shutdown(&self) {
        let session_ids: Vec<String> = self.adapters.lock().await.keys().cloned().collect();
        info!(count = session_ids.len(), "draining live sessions for shutdown");
        for session_id in session_ids {
            self.stop_adapter(&session_id, SHUTDOWN_PER_SESSION_TIMEOUT).await;
            self.broker.cancel_session(&session_id).await;
            if let Err(e) = self
                .registry
                .update(&session_id, |s| {
                    s.state = SessionState::Paused;
                    s.is_processing = false;
                })
                .await
            {
                warn!(session_id = %session_id, error = %e, "failed to mark session paused during shutdown");
            }
        }
    }
}
