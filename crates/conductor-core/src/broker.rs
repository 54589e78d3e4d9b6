// Permission Broker (§4.D): correlates a `permission_request` the adapter
// raised with the client's eventual `permission_response`, and backfills a
// request id for permission prompts the agent didn't tag with a
// `tool_use_id` (the §9 open question, resolved by a name+input side index).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex};

use crate::error::CoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionDecision {
    Allow,
    AllowAlways,
    Deny,
}

/// What the adapter relays back to the transport once a decision arrives:
/// the decision itself plus optional retry guidance on a deny, so the agent
/// can attempt the task differently instead of just stopping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionOutcome {
    pub decision: PermissionDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance: Option<String>,
}

struct Pending {
    session_id: String,
    tool_name: String,
    resolver: oneshot::Sender<PermissionOutcome>,
}

pub struct PermissionBroker {
    pending: Mutex<HashMap<String, Pending>>,
    /// `(session_id, tool_name, canonical input json) -> request_id`, used to
    /// resolve a response that only names the tool and input, not a request
    /// id, because the upstream agent didn't supply a stable `tool_use_id`.
    by_tool: Mutex<HashMap<(String, String, String), String>>,
    /// `(session_id, tool_name)` pairs the client has told the server to stop
    /// prompting for — either an explicit `allow_always` decision or a plain
    /// `allow` with a suggestion applied (§8 scenario 2). Consulted by the
    /// adapter before a new `permission_request` is ever raised to the
    /// client.
    auto_approved: Mutex<HashSet<(String, String)>>,
}

impl PermissionBroker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            by_tool: Mutex::new(HashMap::new()),
            auto_approved: Mutex::new(HashSet::new()),
        }
    }

    /// True if an earlier decision for this `(session, tool)` pair opted
    /// into standing approval, so the adapter should skip raising a new
    /// `permission_request` entirely rather than prompting again.
    pub async fn is_always_allowed(&self, session_id: &str, tool_name: &str) -> bool {
        self.auto_approved
            .lock()
            .await
            .contains(&(session_id.to_string(), tool_name.to_string()))
    }

    /// Registers a new outstanding request, returning the receiver half the
    /// adapter awaits for the user's decision.
    pub async fn register(
        &self,
        request_id: String,
        session_id: String,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> oneshot::Receiver<PermissionOutcome> {
        let (tx, rx) = oneshot::channel();
        let canonical = canonicalize(tool_input);
        self.by_tool.lock().await.insert(
            (session_id.clone(), tool_name.to_string(), canonical),
            request_id.clone(),
        );
        self.pending.lock().await.insert(
            request_id,
            Pending {
                session_id,
                tool_name: tool_name.to_string(),
                resolver: tx,
            },
        );
        rx
    }

    /// Resolves by explicit request id (the common path). `apply_suggestions`
    /// is whether the client applied an offered suggestion (e.g. "always
    /// allow this tool") alongside its decision — together with
    /// `AllowAlways`, this is what arms standing auto-approval for the
    /// `(session, tool)` pair (§8 scenario 2); a `Deny` never does, even with
    /// `apply_suggestions` set.
    pub async fn resolve(
        &self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<String>,
        apply_suggestions: bool,
    ) -> Result<(), CoreError> {
        let pending = self
            .pending
            .lock()
            .await
            .remove(request_id)
            .ok_or_else(|| CoreError::NotFound(format!("permission request {request_id}")))?;
        let always = decision != PermissionDecision::Deny
            && (apply_suggestions || decision == PermissionDecision::AllowAlways);
        if always {
            self.auto_approved
                .lock()
                .await
                .insert((pending.session_id.clone(), pending.tool_name.clone()));
        }
        let _ = pending.resolver.send(PermissionOutcome { decision, guidance });
        Ok(())
    }

    /// Resolves by tool name + input when the client can't supply a request
    /// id — looks up the most recent registration for that (session, tool,
    /// input) triple.
    pub async fn resolve_by_tool(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
        decision: PermissionDecision,
        guidance: Option<String>,
        apply_suggestions: bool,
    ) -> Result<(), CoreError> {
        let canonical = canonicalize(tool_input);
        let key = (session_id.to_string(), tool_name.to_string(), canonical);
        let request_id = self
            .by_tool
            .lock()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                CoreError::NotFound(format!("pending permission request for tool {tool_name}"))
            })?;
        self.resolve(&request_id, decision, guidance, apply_suggestions)
            .await
    }

    /// Looks up a still-pending request by the same `(session, tool, input)`
    /// key `register` indexed it under, without resolving it. Used by the
    /// adapter to backfill a `tool_use_id` onto a permission request that
    /// arrived before the matching `tool_use` block (§9).
    pub async fn find_request_id(
        &self,
        session_id: &str,
        tool_name: &str,
        tool_input: &serde_json::Value,
    ) -> Option<String> {
        let key = (
            session_id.to_string(),
            tool_name.to_string(),
            canonicalize(tool_input),
        );
        self.by_tool.lock().await.get(&key).cloned()
    }

    /// Drops every pending request belonging to a session without
    /// resolving it, dropping the oneshot sender so the adapter's await
    /// observes a closed channel and treats the turn as cancelled. Called
    /// when a session is interrupted or terminated.
    /// Called on interrupt, pause, and termination alike. Deliberately does
    /// NOT clear `auto_approved`: an interrupt or pause mid-session is meant
    /// to resume, and a standing "always allow" should survive it. A
    /// terminated session's entries just go unused — the session id never
    /// recurs, so there's nothing to reclaim them for.
    pub async fn cancel_session(&self, session_id: &str) {
        let mut pending = self.pending.lock().await;
        pending.retain(|_, p| p.session_id != session_id);
        let mut by_tool = self.by_tool.lock().await;
        by_tool.retain(|(sid, _, _), _| sid != session_id);
    }
}

impl Default for PermissionBroker {
    fn default() -> Self {
        Self::new()
    }
}

fn canonicalize(value: &serde_json::Value) -> String {
    // `serde_json::Value`'s `Ord`-free map doesn't guarantee key order on
    // its own, but sorting isn't necessary here: the adapter always builds
    // both the registration and the resolution value from the same parsed
    // JSON map, so the naive string form matches byte-for-byte. Using
    // `to_string` (not a custom sorter) keeps this in lockstep with
    // whatever the parser already produces.
    value.to_string()
}
