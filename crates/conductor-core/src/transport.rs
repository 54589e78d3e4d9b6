// Agent transport boundary (§4.C expansion): the adapter talks to whatever
// drives the actual agent purely through this trait, so the external agent
// process itself stays a swappable collaborator. The reference
// implementation spawns a CLI subprocess and speaks newline-delimited JSON
// over its stdin/stdout; tests use `FakeTransport` instead.

use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::broker::PermissionDecision;
use crate::error::CoreError;

/// One line of raw output from the agent, or a signal that the stream ended.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Line(String),
    Exited { code: Option<i32> },
}

#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Starts the agent for a fresh or resumed turn and returns a channel of
    /// raw output lines. `resume_id` is the agent's own session id from a
    /// previous `session_meta` frame, if any (§3 `agent_session_id`). Each
    /// transport instance is owned exclusively by one session's adapter, so
    /// this and the other methods all take `&mut self`.
    async fn start(
        &mut self,
        working_directory: &str,
        resume_id: Option<&str>,
    ) -> Result<mpsc::Receiver<TransportEvent>, CoreError>;

    /// Sends one user turn's text to the running agent.
    async fn send(&mut self, text: &str) -> Result<(), CoreError>;

    /// Sends the agent's own interrupt signal (not a process kill) so it can
    /// stop mid-turn and flush partial output.
    async fn interrupt(&mut self) -> Result<(), CoreError>;

    /// Relays the user's decision on a `permission_request` back to the
    /// agent so it can proceed (or abandon) the tool call. `guidance` is
    /// only meaningful on a deny: retry context the agent can use to attempt
    /// the task differently instead of just stopping.
    async fn send_permission_decision(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Tears the transport down unconditionally.
    async fn close(&mut self) -> Result<(), CoreError>;
}

/// Spawns `command extra_args...` and speaks line-delimited JSON over its
/// stdio. Mirrors the teacher's `ShellTool` isolation: stdin is piped (not
/// inherited) so the subprocess never touches the server's controlling
/// terminal.
pub struct ProcessTransport {
    command: String,
    extra_args: Vec<String>,
    /// Shared with the stdout-reader task so it can reap the process itself
    /// on EOF instead of leaving that to `close()` alone.
    child: Option<Arc<Mutex<Child>>>,
    stdin: Option<tokio::process::ChildStdin>,
}

impl ProcessTransport {
    pub fn new(command: impl Into<String>, extra_args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            extra_args,
            child: None,
            stdin: None,
        }
    }
}

/// Builds a fresh transport for each session start. The coordinator holds
/// one factory for the whole server, configured from `AgentTransportConfig`.
pub trait TransportFactory: Send + Sync {
    fn build(&self) -> Box<dyn AgentTransport>;
}

pub struct ProcessTransportFactory {
    pub command: String,
    pub extra_args: Vec<String>,
}

impl TransportFactory for ProcessTransportFactory {
    fn build(&self) -> Box<dyn AgentTransport> {
        Box::new(ProcessTransport::new(self.command.clone(), self.extra_args.clone()))
    }
}

#[async_trait]
impl AgentTransport for ProcessTransport {
    async fn start(
        &mut self,
        working_directory: &str,
        resume_id: Option<&str>,
    ) -> Result<mpsc::Receiver<TransportEvent>, CoreError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.extra_args);
        if let Some(id) = resume_id {
            cmd.arg("--resume").arg(id);
        }
        cmd.current_dir(working_directory);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(command = %self.command, working_directory, "spawning agent transport");
        let mut child = cmd
            .spawn()
            .map_err(|e| CoreError::AgentStartupFailure(e.to_string()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CoreError::AgentStartupFailure("no stdout handle".into()))?;
        let stderr = child.stderr.take();
        self.stdin = child.stdin.take();

        let child = Arc::new(Mutex::new(child));
        self.child = Some(child.clone());

        let (tx, rx) = mpsc::channel(256);
        let tx_stdout = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx_stdout.send(TransportEvent::Line(line)).await.is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "agent stdout read error");
                        break;
                    }
                }
            }
            // Stdout EOF means the agent is done one way or another; reap it
            // so a clean exit is reported as `Exited`, not mistaken for a
            // dropped stream.
            let code = match child.lock().await.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(error = %e, "failed to reap agent process");
                    None
                }
            };
            let _ = tx_stdout.send(TransportEvent::Exited { code }).await;
        });

        if let Some(stderr) = stderr {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(agent_stderr = %line, "agent stderr");
                }
            });
        }

        Ok(rx)
    }

    async fn send(&mut self, text: &str) -> Result<(), CoreError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CoreError::Precondition("transport not started".into()))?;
        let mut line = serde_json::to_string(&serde_json::json!({ "type": "user_input", "text": text }))
            .map_err(|e| CoreError::ClientProtocolError(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(CoreError::Io)
    }

    async fn interrupt(&mut self) -> Result<(), CoreError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CoreError::Precondition("transport not started".into()))?;
        stdin
            .write_all(b"{\"type\":\"interrupt\"}\n")
            .await
            .map_err(CoreError::Io)
    }

    async fn send_permission_decision(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<&str>,
    ) -> Result<(), CoreError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| CoreError::Precondition("transport not started".into()))?;
        let mut line = serde_json::to_string(&serde_json::json!({
            "type": "permission_decision",
            "request_id": request_id,
            "decision": decision,
            "guidance": guidance,
        }))
        .map_err(|e| CoreError::ClientProtocolError(e.to_string()))?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(CoreError::Io)
    }

    async fn close(&mut self) -> Result<(), CoreError> {
        self.stdin.take();
        if let Some(child) = self.child.take() {
            let mut child = child.lock().await;
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}

/// An in-memory transport for tests: `start` replays a fixed script of
/// lines, `send`/`interrupt` just record what was called.
#[cfg(test)]
pub struct FakeTransport {
    pub script: Vec<String>,
    pub sent: Vec<String>,
    pub interrupted: bool,
    pub closed: bool,
}

#[cfg(test)]
impl FakeTransport {
    pub fn new(script: Vec<String>) -> Self {
        Self {
            script,
            sent: Vec::new(),
            interrupted: false,
            closed: false,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl AgentTransport for FakeTransport {
    async fn start(
        &mut self,
        _working_directory: &str,
        _resume_id: Option<&str>,
    ) -> Result<mpsc::Receiver<TransportEvent>, CoreError> {
        let (tx, rx) = mpsc::channel(256);
        let script = self.script.clone();
        tokio::spawn(async move {
            for line in script {
                if tx.send(TransportEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(TransportEvent::Exited { code: Some(0) }).await;
        });
        Ok(rx)
    }

    async fn send(&mut self, text: &str) -> Result<(), CoreError> {
        self.sent.push(text.to_string());
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), CoreError> {
        self.interrupted = true;
        Ok(())
    }

    async fn send_permission_decision(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<&str>,
    ) -> Result<(), CoreError> {
        match guidance {
            Some(g) => self.sent.push(format!("{request_id}:{decision:?}:{g}")),
            None => self.sent.push(format!("{request_id}:{decision:?}")),
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CoreError> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fake_transport_replays_script_then_exits() {
        let mut t = FakeTransport::new(vec!["a".into(), "b".into()]);
        let mut rx = t.start("/tmp", None).await.unwrap();
        let mut lines = Vec::new();
        while let Some(ev) = rx.recv().await {
            match ev {
                TransportEvent::Line(l) => lines.push(l),
                TransportEvent::Exited { .. } => break,
            }
        }
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn fake_transport_records_send_and_interrupt() {
        let mut t = FakeTransport::new(vec![]);
        t.send("hello").await.unwrap();
        t.interrupt().await.unwrap();
        assert_eq!(t.sent, vec!["hello".to_string()]);
        assert!(t.interrupted);
    }
}
