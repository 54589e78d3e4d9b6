// Error kinds for the session/adapter/broker/log-store boundary.
//
// The coordinator is the only caller that turns these into state
// transitions; everything below it raises a `CoreError` and otherwise stays
// out of the business of deciding what the session should do next (§7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("agent failed to start: {0}")]
    AgentStartupFailure(String),

    #[error("agent stream failed: {0}")]
    AgentStreamFailure(String),

    #[error("disk I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed client frame: {0}")]
    ClientProtocolError(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

impl CoreError {
    /// HTTP status analogue used by the (out-of-scope) REST surface when it
    /// translates a `CoreError` returned from the coordinator.
    pub fn http_status(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 404,
            CoreError::Precondition(_) => 409,
            CoreError::AgentStartupFailure(_) | CoreError::AgentStreamFailure(_) => 500,
            CoreError::Io(_) => 500,
            CoreError::ClientProtocolError(_) => 400,
            CoreError::Timeout(_) => 504,
        }
    }

    /// WebSocket close code analogue (§6).
    pub fn ws_close_code(&self) -> u16 {
        match self {
            CoreError::NotFound(_) => 4404,
            CoreError::AgentStartupFailure(_) | CoreError::AgentStreamFailure(_) => 4003,
            _ => 4500,
        }
    }
}

/// Maps a raw process/stream diagnostic to a short, user-facing phrase.
///
/// Used by the adapter when it surfaces `AgentStartupFailure` /
/// `AgentStreamFailure` — the raw diagnostic is preserved in
/// `Session::last_error.raw`, this is only the human-readable summary.
pub fn friendly_diagnostic(raw: &str) -> String {
    let lower = raw.to_lowercase();
    if lower.contains("working directory") {
        "working directory does not exist".to_string()
    } else if lower.contains("no such file") || lower.contains("not found") && lower.contains("command")
    {
        "agent CLI not found — check that it is installed and on PATH".to_string()
    } else if lower.contains("permission denied") {
        "agent CLI could not be started — permission denied".to_string()
    } else if lower.contains("auth") || lower.contains("unauthorized") || lower.contains("401") {
        "agent is not authenticated — re-run the agent's login flow".to_string()
    } else {
        "the agent process failed unexpectedly".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_404_and_4404() {
        let e = CoreError::NotFound("session s1".into());
        assert_eq!(e.http_status(), 404);
        assert_eq!(e.ws_close_code(), 4404);
    }

    #[test]
    fn startup_failure_maps_to_500_and_4003() {
        let e = CoreError::AgentStartupFailure("boom".into());
        assert_eq!(e.http_status(), 500);
        assert_eq!(e.ws_close_code(), 4003);
    }

    #[test]
    fn friendly_diagnostic_recognises_missing_cli() {
        assert!(friendly_diagnostic("No such file or directory (os error 2): command claude")
            .contains("not found"));
    }

    #[test]
    fn friendly_diagnostic_falls_back_for_unknown_text() {
        assert_eq!(
            friendly_diagnostic("something exotic happened"),
            "the agent process failed unexpectedly"
        );
    }
}
