// Session data model (§3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Active,
    Processing,
    Paused,
    Error,
    Terminated,
}

impl SessionState {
    /// Whether `is_processing = true` is a legal combination with this state
    /// (the invariant in §3: `is_processing ⇒ state ∈ {starting, active, processing}`).
    pub fn allows_processing(self) -> bool {
        matches!(
            self,
            SessionState::Starting | SessionState::Active | SessionState::Processing
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl Default for PermissionMode {
    fn default() -> Self {
        PermissionMode::Default
    }
}

/// The last fatal error recorded against a session, preserved even after the
/// session leaves `error` state via a fresh `start` (a new adapter clears
/// `is_processing`/`state` but the history of what went wrong is still useful
/// to show the user until the next successful turn overwrites it).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LastError {
    pub kind: String,
    pub message: String,
    pub raw: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub state: SessionState,
    /// Authoritative; written only by the coordinator (§4.E).
    pub is_processing: bool,
    pub permission_mode: PermissionMode,
    pub tools_allowlist: Option<Vec<String>>,
    pub model: Option<String>,
    pub working_directory: String,
    pub last_error: Option<LastError>,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// The id last handed to the agent for native resumption. `None` until a
    /// session has started at least once.
    pub agent_session_id: Option<String>,
}

/// Options accepted by `Coordinator::create`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: Option<String>,
    pub permission_mode: Option<PermissionMode>,
    pub tools_allowlist: Option<Vec<String>>,
    pub model: Option<String>,
    pub working_directory: String,
}

impl Session {
    pub fn new(id: String, project_id: String, opts: CreateOptions) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id,
            name: opts
                .name
                .unwrap_or_else(|| now.to_rfc3339()),
            state: SessionState::Created,
            is_processing: false,
            permission_mode: opts.permission_mode.unwrap_or_default(),
            tools_allowlist: opts.tools_allowlist,
            model: opts.model,
            working_directory: opts.working_directory,
            last_error: None,
            created_at: now,
            last_active_at: now,
            agent_session_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_states_allow_processing() {
        assert!(SessionState::Active.allows_processing());
        assert!(SessionState::Processing.allows_processing());
        assert!(SessionState::Starting.allows_processing());
        assert!(!SessionState::Paused.allows_processing());
        assert!(!SessionState::Error.allows_processing());
        assert!(!SessionState::Terminated.allows_processing());
        assert!(!SessionState::Created.allows_processing());
    }

    #[test]
    fn new_session_defaults_name_to_timestamp() {
        let s = Session::new(
            "s1".into(),
            "p1".into(),
            CreateOptions {
                working_directory: "/tmp".into(),
                ..Default::default()
            },
        );
        assert_eq!(s.state, SessionState::Created);
        assert!(!s.is_processing);
        assert!(!s.name.is_empty());
    }
}
