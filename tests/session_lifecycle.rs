// Full-stack scenarios driven purely through `Coordinator`'s public API,
// exercising the same session lifecycle a real WebSocket client sees, but
// without standing up axum or a real agent subprocess.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use conductor_core::transport::TransportEvent;
use conductor_core::{
    AgentTransport, Coordinator, CoreError, CreateOptions, EnvelopeType, LogStore,
    PermissionBroker, PermissionDecision, ProcessTransportFactory, SessionRegistry, SessionState,
    TransportFactory,
};
use tokio::sync::mpsc;

/// Replays a fixed script of raw transport lines, then idles instead of
/// exiting, so a relayed permission decision still has a live adapter task
/// to deliver it to. Every `send`/`interrupt`/permission relay is recorded
/// for assertions.
struct ScriptedTransport {
    lines: Vec<String>,
    calls: Arc<StdMutex<Calls>>,
}

#[derive(Default)]
struct Calls {
    sent: Vec<String>,
    interrupted: bool,
    decisions: Vec<(String, PermissionDecision, Option<String>)>,
}

#[async_trait]
impl AgentTransport for ScriptedTransport {
    async fn start(
        &mut self,
        _working_directory: &str,
        _resume_id: Option<&str>,
    ) -> Result<mpsc::Receiver<TransportEvent>, CoreError> {
        let (tx, rx) = mpsc::channel(64);
        let lines = self.lines.clone();
        tokio::spawn(async move {
            for line in lines {
                if tx.send(TransportEvent::Line(line)).await.is_err() {
                    return;
                }
            }
            // Stay "running" rather than exiting, so a later relayed
            // permission decision still finds a live adapter task.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        Ok(rx)
    }

    async fn send(&mut self, text: &str) -> Result<(), CoreError> {
        self.calls.lock().unwrap().sent.push(text.to_string());
        Ok(())
    }

    async fn interrupt(&mut self) -> Result<(), CoreError> {
        self.calls.lock().unwrap().interrupted = true;
        Ok(())
    }

    async fn send_permission_decision(
        &mut self,
        request_id: &str,
        decision: PermissionDecision,
        guidance: Option<&str>,
    ) -> Result<(), CoreError> {
        self.calls.lock().unwrap().decisions.push((
            request_id.to_string(),
            decision,
            guidance.map(str::to_string),
        ));
        Ok(())
    }

    async fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

struct ScriptedFactory {
    lines: Vec<String>,
    calls: Arc<StdMutex<Calls>>,
}

impl TransportFactory for ScriptedFactory {
    fn build(&self) -> Box<dyn AgentTransport> {
        Box::new(ScriptedTransport {
            lines: self.lines.clone(),
            calls: self.calls.clone(),
        })
    }
}

/// A transport whose `start` always fails, simulating a missing or
/// misconfigured agent CLI.
struct FailingTransport;

#[async_trait]
impl AgentTransport for FailingTransport {
    async fn start(
        &mut self,
        _working_directory: &str,
        _resume_id: Option<&str>,
    ) -> Result<mpsc::Receiver<TransportEvent>, CoreError> {
        Err(CoreError::AgentStartupFailure(
            "No such file or directory (os error 2): command claude".into(),
        ))
    }
    async fn send(&mut self, _text: &str) -> Result<(), CoreError> {
        Ok(())
    }
    async fn interrupt(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
    async fn send_permission_decision(
        &mut self,
        _request_id: &str,
        _decision: PermissionDecision,
        _guidance: Option<&str>,
    ) -> Result<(), CoreError> {
        Ok(())
    }
    async fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

struct FailingFactory;

impl TransportFactory for FailingFactory {
    fn build(&self) -> Box<dyn AgentTransport> {
        Box::new(FailingTransport)
    }
}

fn harness(lines: Vec<String>) -> (Coordinator, Arc<StdMutex<Calls>>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new(dir.path()));
    let log_store = Arc::new(LogStore::new(dir.path()));
    let broker = Arc::new(PermissionBroker::new());
    let calls = Arc::new(StdMutex::new(Calls::default()));
    let factory: Arc<dyn TransportFactory> = Arc::new(ScriptedFactory {
        lines,
        calls: calls.clone(),
    });
    (
        Coordinator::new(registry, log_store, broker, factory),
        calls,
        dir,
    )
}

async fn create_session(coord: &Coordinator) -> conductor_core::Session {
    coord
        .create(
            "P1",
            CreateOptions {
                working_directory: "/tmp".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap()
}

#[tokio::test]
async fn basic_turn_produces_ordered_envelopes_and_clears_processing() {
    let (coord, _calls, _dir) = harness(vec![
        r#"{"type":"assistant_delta","text":"hi"}"#.to_string(),
        r#"{"type":"result_summary","text":"done"}"#.to_string(),
        r#"{"type":"turn_complete"}"#.to_string(),
    ]);
    let session = create_session(&coord).await;
    assert_eq!(session.state, SessionState::Created);

    let mut events = {
        coord.start(&session.id).await.unwrap();
        coord.subscribe_session(&session.id).await.unwrap()
    };
    coord.send_message(&session.id, "hello").await.unwrap();

    // Two scripted lines (`assistant_delta`, `result_summary`) each produce
    // one envelope; `turn_complete` only signals the end of the turn and
    // emits no envelope of its own.
    let mut seen = Vec::new();
    for _ in 0..2 {
        let env = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .expect("envelope within timeout")
            .unwrap();
        seen.push(env);
    }

    assert_eq!(seen[0].envelope_type, EnvelopeType::Message);
    assert_eq!(seen[1].envelope_type, EnvelopeType::Message);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let got = coord.get_session(&session.id).await.unwrap();
    assert_eq!(got.state, SessionState::Active);
    assert!(!got.is_processing);

    let page = coord.list_messages(&session.id, 0, 100).await.unwrap();
    let subtypes: Vec<_> = page
        .envelopes
        .iter()
        .filter_map(|e| e.subtype.as_deref())
        .collect();
    assert!(subtypes.contains(&"client_launched"));
}

#[tokio::test]
async fn permission_allow_with_applied_suggestions_relays_decision_to_transport() {
    let (coord, calls, _dir) = harness(vec![
        r#"{"type":"permission_request","request_id":"perm1","tool_name":"Read","tool_input":{"file_path":"X"},"suggestions":[{"label":"allow Read","applies_to":"project"}]}"#
            .to_string(),
    ]);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    let mut events = coord.subscribe_session(&session.id).await.unwrap();
    coord.send_message(&session.id, "read file X").await.unwrap();

    let mut request_id = None;
    for _ in 0..5 {
        let env = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .unwrap()
            .unwrap();
        if env.envelope_type == EnvelopeType::PermissionRequest {
            assert_eq!(env.tool_name.as_deref(), Some("Read"));
            assert_eq!(env.suggestions.len(), 1);
            request_id = env.permission_request_id;
            break;
        }
    }
    let request_id = request_id.expect("permission_request envelope observed");

    coord
        .respond_permission(&request_id, PermissionDecision::AllowAlways, None, false)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let decisions = calls.lock().unwrap().decisions.clone();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].0, request_id);
    assert_eq!(decisions[0].1, PermissionDecision::AllowAlways);
}

#[tokio::test]
async fn deny_with_guidance_relays_guidance_text_to_transport() {
    let (coord, calls, _dir) = harness(vec![
        r#"{"type":"permission_request","request_id":"perm1","tool_name":"bash","tool_input":{"cmd":"rm -rf /"}}"#
            .to_string(),
    ]);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    let mut events = coord.subscribe_session(&session.id).await.unwrap();
    coord.send_message(&session.id, "clean up").await.unwrap();

    let env = loop {
        let env = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .unwrap()
            .unwrap();
        if env.envelope_type == EnvelopeType::PermissionRequest {
            break env;
        }
    };
    let request_id = env.permission_request_id.unwrap();

    coord
        .respond_permission(
            &request_id,
            PermissionDecision::Deny,
            Some("use the other path".into()),
            false,
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let decisions = calls.lock().unwrap().decisions.clone();
    assert_eq!(decisions[0].1, PermissionDecision::Deny);
    assert_eq!(decisions[0].2.as_deref(), Some("use the other path"));
}

#[tokio::test]
async fn permission_response_after_teardown_is_not_found_not_crash() {
    let (coord, _calls, _dir) = harness(vec![
        r#"{"type":"permission_request","request_id":"perm1","tool_name":"Read","tool_input":{"path":"x"},"suggestions":[{"label":"always allow","applies_to":"tool:Read"}]}"#
            .to_string(),
    ]);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    let mut events = coord.subscribe_session(&session.id).await.unwrap();
    coord.send_message(&session.id, "read file X").await.unwrap();

    let mut request_id = None;
    for _ in 0..5 {
        let env = tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .unwrap()
            .unwrap();
        if env.envelope_type == EnvelopeType::PermissionRequest {
            request_id = env.permission_request_id;
            break;
        }
    }
    let request_id = request_id.expect("permission_request envelope observed");

    // Tear the session down before the client's decision arrives (§4.D,
    // §8): the gateway's websocket handler is the one that actually
    // swallows this error, but the coordinator/broker contract it relies
    // on is that the pending request is simply gone, not that it panics.
    coord.terminate(&session.id).await.unwrap();

    let result = coord
        .respond_permission(&request_id, PermissionDecision::AllowAlways, None, false)
        .await;
    assert!(matches!(result, Err(CoreError::NotFound(_))));
}

#[tokio::test]
async fn interrupt_emits_session_interrupted_and_clears_processing() {
    let (coord, calls, _dir) = harness(vec![]);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    coord.send_message(&session.id, "long task").await.unwrap();

    coord.interrupt(&session.id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(calls.lock().unwrap().interrupted);

    let page = coord.list_messages(&session.id, 0, 100).await.unwrap();
    assert!(page
        .envelopes
        .iter()
        .any(|e| e.subtype.as_deref() == Some("session_interrupted")));

    let got = coord.get_session(&session.id).await.unwrap();
    assert_eq!(got.state, SessionState::Active);
    assert!(!got.is_processing);
}

#[tokio::test]
async fn resume_after_restart_reopens_with_paused_state_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Arc::new(PermissionBroker::new());

    let registry = Arc::new(SessionRegistry::new(dir.path()));
    let log_store = Arc::new(LogStore::new(dir.path()));
    let calls = Arc::new(StdMutex::new(Calls::default()));
    let factory: Arc<dyn TransportFactory> = Arc::new(ScriptedFactory {
        lines: vec![],
        calls: calls.clone(),
    });
    let coord = Coordinator::new(registry, log_store, broker.clone(), factory);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    coord.send_message(&session.id, "do thing").await.unwrap();
    // Server "stops" before a result arrives: nothing more happens, we just
    // build a fresh coordinator over the same data dir.

    let registry2 = Arc::new(SessionRegistry::new(dir.path()));
    registry2.reconcile_after_restart().await.unwrap();
    let reopened = registry2.require(&session.id).await.unwrap();
    assert_eq!(reopened.state, SessionState::Paused);
    assert!(!reopened.is_processing);

    let log_store2 = Arc::new(LogStore::new(dir.path()));
    let page = log_store2.read_page(&session.id, 0, 100).await.unwrap();
    assert!(page.total > 0);

    let calls2 = Arc::new(StdMutex::new(Calls::default()));
    let factory2: Arc<dyn TransportFactory> = Arc::new(ScriptedFactory {
        lines: vec![],
        calls: calls2.clone(),
    });
    let coord2 = Coordinator::new(registry2, log_store2, broker, factory2);
    coord2.start(&session.id).await.unwrap();

    let page2 = coord2.list_messages(&session.id, 0, 100).await.unwrap();
    let resumed_note = page2
        .envelopes
        .iter()
        .filter(|e| e.subtype.as_deref() == Some("client_launched"))
        .count();
    assert!(resumed_note >= 2, "expected a launch note from both starts");
}

#[tokio::test]
async fn startup_failure_transitions_to_error_with_friendly_message() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SessionRegistry::new(dir.path()));
    let log_store = Arc::new(LogStore::new(dir.path()));
    let broker = Arc::new(PermissionBroker::new());
    let factory: Arc<dyn TransportFactory> = Arc::new(FailingFactory);
    let coord = Coordinator::new(registry, log_store, broker, factory);

    let session = create_session(&coord).await;
    let err = coord.start(&session.id).await.unwrap_err();
    assert_eq!(err.http_status(), 500);

    let got = coord.get_session(&session.id).await.unwrap();
    assert_eq!(got.state, SessionState::Error);
    assert!(!got.is_processing);
    let last_error = got.last_error.expect("last_error recorded");
    assert!(last_error.message.to_lowercase().contains("not found"));

    let page = coord.list_messages(&session.id, 0, 100).await.unwrap();
    assert!(page
        .envelopes
        .iter()
        .any(|e| e.subtype.as_deref() == Some("session_failed")));
}

#[tokio::test]
async fn start_on_already_running_session_is_idempotent() {
    let (coord, _calls, _dir) = harness(vec![]);
    let session = create_session(&coord).await;
    let first = coord.start(&session.id).await.unwrap();
    let second = coord.start(&session.id).await.unwrap();
    assert_eq!(first.state, SessionState::Active);
    assert_eq!(second.state, SessionState::Active);
}

#[tokio::test]
async fn round_trip_create_and_delete_leaves_no_session_record() {
    let (coord, _calls, _dir) = harness(vec![]);
    let session = create_session(&coord).await;
    coord.delete(&session.id).await.unwrap();
    let err = coord.get_session(&session.id).await.unwrap_err();
    assert_eq!(err.http_status(), 404);
}

#[tokio::test]
async fn terminate_twice_is_a_no_op_on_the_second_call() {
    let (coord, _calls, _dir) = harness(vec![]);
    let session = create_session(&coord).await;
    coord.start(&session.id).await.unwrap();
    let first = coord.terminate(&session.id).await.unwrap();
    let second = coord.terminate(&session.id).await.unwrap();
    assert_eq!(first.state, SessionState::Terminated);
    assert_eq!(second.state, SessionState::Terminated);
}

#[tokio::test]
async fn send_while_not_active_is_rejected_as_precondition() {
    let (coord, _calls, _dir) = harness(vec![]);
    let session = create_session(&coord).await;
    let err = coord.send_message(&session.id, "hi").await.unwrap_err();
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn process_transport_factory_builds_distinct_transports_per_session() {
    // Smoke-checks the real factory used by `main` wires its config through,
    // without ever spawning the (likely absent in CI) agent CLI.
    let factory = ProcessTransportFactory {
        command: "definitely-not-a-real-agent-cli".into(),
        extra_args: vec!["--flag".into()],
    };
    let a = factory.build();
    let b = factory.build();
    assert!(!std::ptr::eq(
        Box::as_ref(&a) as *const dyn AgentTransport as *const u8,
        Box::as_ref(&b) as *const dyn AgentTransport as *const u8
    ));
}
