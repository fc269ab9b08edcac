//! Worker dispatch integration tests: tab-lock exclusion, group ownership,
//! the ref-format guard, capture buffers, and the session lifecycle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};

use viyv_browser::protocol::{
    unix_time_ms, ErrorCode, Record, SessionRecord, ToolCall, ToolError,
};
use viyv_browser::transport::chunk::split_into_chunks;
use viyv_browser::worker::store::SessionStore;
use viyv_browser::worker::{BrowserBackend, WorkerCore};

// ═══════════════════════════════════════════════════════════════════════════
// Test backend
// ═══════════════════════════════════════════════════════════════════════════

/// Scripted backend: canned results per tool, an optional gate that parks
/// one named tool until released, and a call log.
#[derive(Default)]
struct ScriptedBackend {
    results: StdMutex<HashMap<String, Value>>,
    gate: Option<(String, Arc<Notify>)>,
    calls: StdMutex<Vec<(String, Value)>>,
    closed_tabs: StdMutex<Vec<Vec<u32>>>,
}

impl ScriptedBackend {
    fn with_result(tool: &str, result: Value) -> Self {
        let backend = Self::default();
        backend
            .results
            .lock()
            .expect("results mutex")
            .insert(tool.to_string(), result);
        backend
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().expect("calls mutex").clone()
    }
}

#[async_trait]
impl BrowserBackend for ScriptedBackend {
    async fn attach_debugger(&self, _tab_id: u32) -> Result<(), ToolError> {
        Ok(())
    }

    async fn detach_debugger(&self, _tab_id: u32) -> Result<(), ToolError> {
        Ok(())
    }

    async fn execute(&self, tool: &str, input: &Value) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .expect("calls mutex")
            .push((tool.to_string(), input.clone()));
        if let Some((gated_tool, gate)) = &self.gate {
            if gated_tool == tool {
                gate.notified().await;
            }
        }
        let canned = self
            .results
            .lock()
            .expect("results mutex")
            .get(tool)
            .cloned();
        Ok(canned.unwrap_or_else(|| json!({"ok": true})))
    }

    async fn close_tabs(&self, tabs: Vec<u32>) {
        self.closed_tabs.lock().expect("closed tabs mutex").push(tabs);
    }
}

fn make_worker(backend: Arc<ScriptedBackend>) -> (Arc<WorkerCore>, mpsc::UnboundedReceiver<Record>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(WorkerCore::new(backend, tx, None)), rx)
}

fn call(agent_id: &str, tool: &str, input: Value) -> ToolCall {
    ToolCall {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        tool: tool.to_string(),
        input,
        timestamp: unix_time_ms(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch basics
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_navigate_on_owned_tab_succeeds() {
    let backend = Arc::new(ScriptedBackend::with_result(
        "navigate",
        json!({"url": "https://example.com/", "title": "Example Domain"}),
    ));
    let (worker, _rx) = make_worker(backend.clone());
    worker.assign_tab("default", 42).expect("assign tab 42");

    let result = worker
        .handle_tool_call(call(
            "default",
            "navigate",
            json!({"tabId": 42, "url": "https://example.com/"}),
        ))
        .await;

    assert!(result.success, "owned-tab navigate must succeed: {result:?}");
    let payload = result.result.expect("success carries a result");
    assert_eq!(payload["title"], "Example Domain");
    assert_eq!(backend.calls().len(), 1, "backend must execute exactly once");
    assert!(
        worker.lock_holder(42).is_none(),
        "tab lock must be released after the handler completes"
    );
}

#[tokio::test]
async fn test_unowned_tab_is_access_denied() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend.clone());
    worker.assign_tab("default", 42).expect("assign tab 42");

    let result = worker
        .handle_tool_call(call(
            "default",
            "navigate",
            json!({"tabId": 99, "url": "https://example.com/"}),
        ))
        .await;

    assert!(!result.success);
    let error = result.error.expect("failure carries an error");
    assert_eq!(error.code, ErrorCode::TabAccessDenied);
    assert!(
        backend.calls().is_empty(),
        "access-denied calls must never reach the backend"
    );
    assert!(
        worker.lock_holder(99).is_none(),
        "lock taken before the ownership check must be released on failure"
    );
}

#[tokio::test]
async fn test_unknown_tool_is_rejected() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend);
    let result = worker
        .handle_tool_call(call("default", "teleport", json!({})))
        .await;
    assert_eq!(result.error.expect("error").code, ErrorCode::UnknownTool);
}

#[tokio::test]
async fn test_invalid_tab_id_is_rejected_before_anything_else() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend.clone());

    for bad in [json!({"tabId": -3}), json!({"tabId": 1.25}), json!({"tabId": "7"})] {
        let result = worker.handle_tool_call(call("default", "navigate", bad)).await;
        assert_eq!(
            result.error.expect("error").code,
            ErrorCode::InvalidParams,
            "malformed tabId must fail with INVALID_PARAMS"
        );
    }
    assert!(backend.calls().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════════
// Tab-lock exclusion
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_cdp_call_while_lock_held_returns_tab_locked() {
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(ScriptedBackend {
        gate: Some(("navigate".to_string(), Arc::clone(&gate))),
        ..ScriptedBackend::default()
    });
    let (worker, _rx) = make_worker(backend);
    worker.assign_tab("agent-a", 7).expect("assign tab 7");

    // Agent A's handler parks inside the backend while holding the lock.
    let held = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move {
            worker
                .handle_tool_call(call(
                    "agent-a",
                    "navigate",
                    json!({"tabId": 7, "url": "https://example.com/"}),
                ))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        worker.lock_holder(7).as_deref(),
        Some("agent-a"),
        "agent A must hold the tab lock while its handler runs"
    );

    let contended = worker
        .handle_tool_call(call("agent-b", "click", json!({"tabId": 7})))
        .await;
    assert_eq!(
        contended.error.expect("error").code,
        ErrorCode::TabLocked,
        "a CDP tool against a locked tab must fail immediately"
    );

    gate.notify_one();
    let first = held.await.expect("agent A task");
    assert!(first.success, "agent A's call must still complete");
    assert!(worker.lock_holder(7).is_none(), "lock released after completion");
}

#[tokio::test]
async fn test_non_cdp_tool_ignores_tab_lock() {
    let gate = Arc::new(Notify::new());
    let backend = Arc::new(ScriptedBackend {
        gate: Some(("navigate".to_string(), Arc::clone(&gate))),
        ..ScriptedBackend::default()
    });
    let (worker, _rx) = make_worker(backend);
    worker.assign_tab("agent-a", 7).expect("assign");

    let held = tokio::spawn({
        let worker = Arc::clone(&worker);
        async move {
            worker
                .handle_tool_call(call("agent-a", "navigate", json!({"tabId": 7, "url": "x"})))
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // tabs_context takes no lock and names no tab.
    let result = worker
        .handle_tool_call(call("agent-b", "tabs_context", json!({})))
        .await;
    assert!(result.success, "lock-free tools must proceed during contention");

    gate.notify_one();
    held.await.expect("held task");
}

// ═══════════════════════════════════════════════════════════════════════════
// Ref-format guard
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_malformed_ref_is_rejected_before_any_backend_call() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend.clone());
    worker.assign_tab("default", 42).expect("assign");

    for bad_ref in ["ref_", "ref_1x", "click_ref_1", "#login", "ref_1; steal()"] {
        let result = worker
            .handle_tool_call(call(
                "default",
                "click",
                json!({"tabId": 42, "ref": bad_ref}),
            ))
            .await;
        assert_eq!(
            result.error.expect("error").code,
            ErrorCode::InvalidParams,
            "ref {bad_ref:?} must be rejected"
        );
    }
    assert!(
        backend.calls().is_empty(),
        "no DOM call may happen for a rejected ref"
    );

    let good = worker
        .handle_tool_call(call(
            "default",
            "click",
            json!({"tabId": 42, "ref": "find_ref_12"}),
        ))
        .await;
    assert!(good.success, "well-formed refs must pass the guard");
}

// ═══════════════════════════════════════════════════════════════════════════
// Capture buffers
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_screenshot_then_upload_image_roundtrip() {
    let backend = Arc::new(ScriptedBackend::with_result(
        "screenshot",
        json!({"data": "aW1hZ2UtYnl0ZXM=", "format": "png"}),
    ));
    let (worker, _rx) = make_worker(backend.clone());
    worker.assign_tab("default", 42).expect("assign");

    let shot = worker
        .handle_tool_call(call("default", "screenshot", json!({"tabId": 42})))
        .await;
    assert!(shot.success);
    let image_id = shot.result.expect("result")["imageId"]
        .as_str()
        .expect("capture id minted")
        .to_string();

    let upload = worker
        .handle_tool_call(call(
            "default",
            "upload_image",
            json!({"tabId": 42, "ref": "ref_3", "imageId": image_id}),
        ))
        .await;
    assert!(upload.success, "upload by prior capture id must succeed");

    let upload_call = backend
        .calls()
        .into_iter()
        .find(|(tool, _)| tool == "upload_image")
        .expect("upload reached the backend");
    assert_eq!(
        upload_call.1["data"], "aW1hZ2UtYnl0ZXM=",
        "ring data must be attached to the backend call"
    );
}

#[tokio::test]
async fn test_upload_image_with_unknown_id_fails() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend);
    worker.assign_tab("default", 42).expect("assign");

    let result = worker
        .handle_tool_call(call(
            "default",
            "upload_image",
            json!({"tabId": 42, "ref": "ref_3", "imageId": "img_404"}),
        ))
        .await;
    assert_eq!(result.error.expect("error").code, ErrorCode::InvalidParams);
}

#[tokio::test]
async fn test_read_console_returns_buffered_tail() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend);
    worker.assign_tab("default", 42).expect("assign");
    for i in 0..5 {
        worker.record_console_entry(42, json!({"level": "log", "n": i}));
    }

    let result = worker
        .handle_tool_call(call(
            "default",
            "read_console",
            json!({"tabId": 42, "limit": 3}),
        ))
        .await;
    let entries = result.result.expect("result")["entries"]
        .as_array()
        .expect("entries array")
        .clone();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2]["n"], 4, "tail must end at the newest entry");
}

// ═══════════════════════════════════════════════════════════════════════════
// Session lifecycle
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_session_close_tears_down_group_and_replies() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("sessions.json"));
    let backend = Arc::new(ScriptedBackend::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let worker = Arc::new(WorkerCore::new(backend.clone(), tx, Some(store.clone())));
    worker.assign_tab("agent-a", 1).expect("assign 1");
    worker.assign_tab("agent-a", 2).expect("assign 2");
    worker.record_console_entry(1, json!({"msg": "hi"}));

    let reply = worker
        .handle_record(Record::SessionClose(SessionRecord::new("agent-a")))
        .await
        .expect("session_close demands a reply");

    match reply {
        Record::SessionClose(record) => assert_eq!(record.agent_id, "agent-a"),
        other => panic!("expected session_close reply, got {other:?}"),
    }
    let mut closed: Vec<u32> = backend
        .closed_tabs
        .lock()
        .expect("closed tabs mutex")
        .concat();
    closed.sort_unstable();
    assert_eq!(closed, vec![1, 2], "the agent's tabs must be closed");
    assert!(
        store.load().expect("store load").is_empty(),
        "persisted group must be removed on close"
    );

    // The freed tab can now be claimed by another agent.
    worker.assign_tab("agent-b", 1).expect("tab 1 is free again");
}

#[tokio::test]
async fn test_session_recovery_rebinds_persisted_group() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SessionStore::new(dir.path().join("sessions.json"));
    let backend = Arc::new(ScriptedBackend::default());

    {
        let (tx, _rx) = mpsc::unbounded_channel();
        let worker = WorkerCore::new(backend.clone(), tx, Some(store.clone()));
        worker.assign_tab("agent-a", 42).expect("assign");
        worker.persist_groups();
    }

    let (tx, _rx) = mpsc::unbounded_channel();
    let worker = WorkerCore::new(backend.clone(), tx, Some(store));
    let reply = worker
        .handle_record(Record::SessionRecovery(SessionRecord::new("agent-a")))
        .await
        .expect("recovery demands a reply");

    match reply {
        Record::SessionRecovery(record) => {
            let status = record.config.expect("recovery status payload");
            assert_eq!(status["recovered"], true);
            assert_eq!(status["tabs"], json!([42]));
        }
        other => panic!("expected session_recovery reply, got {other:?}"),
    }

    let result = worker
        .handle_tool_call(call("agent-a", "navigate", json!({"tabId": 42, "url": "x"})))
        .await;
    assert!(result.success, "recovered group must grant tab access");
}

#[tokio::test]
async fn test_recovery_without_persisted_state_reports_not_recovered() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend);
    let reply = worker
        .handle_record(Record::SessionRecovery(SessionRecord::new("agent-zz")))
        .await
        .expect("reply");
    match reply {
        Record::SessionRecovery(record) => {
            assert_eq!(record.config.expect("status")["recovered"], false);
        }
        other => panic!("expected session_recovery reply, got {other:?}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Events and chunked input
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn test_emitted_events_carry_increasing_sequence_numbers() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, mut rx) = make_worker(backend);

    worker.emit_event("agent-a", "browser.page_load", json!({}), 42, "https://a/");
    worker.emit_event("agent-a", "browser.page_load", json!({}), 42, "https://b/");

    let first = rx.try_recv().expect("first event");
    let second = rx.try_recv().expect("second event");
    match (first, second) {
        (Record::BrowserEvent(a), Record::BrowserEvent(b)) => {
            assert_eq!(b.sequence_number, a.sequence_number + 1);
            assert_eq!(a.agent_id, "agent-a");
        }
        other => panic!("expected two browser events, got {other:?}"),
    }
}

#[tokio::test]
async fn test_heartbeat_flows_through_the_outbound_channel() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, mut rx) = make_worker(backend);

    worker.emit_heartbeat("agent-a");
    match rx.try_recv().expect("heartbeat emitted") {
        Record::SessionHeartbeat(record) => assert_eq!(record.agent_id, "agent-a"),
        other => panic!("expected session_heartbeat, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chunked_tool_call_is_reassembled_and_dispatched() {
    let backend = Arc::new(ScriptedBackend::default());
    let (worker, _rx) = make_worker(backend.clone());
    worker.assign_tab("default", 42).expect("assign");

    let big_call = Record::ToolCall(ToolCall {
        id: "req-big".to_string(),
        agent_id: "default".to_string(),
        tool: "form_input".to_string(),
        input: json!({
            "tabId": 42,
            "ref": "ref_1",
            "text": "z".repeat(2 * 1024 * 1024),
        }),
        timestamp: unix_time_ms(),
    });
    let serialized = serde_json::to_vec(&big_call).expect("serialize big call");
    let chunks = split_into_chunks("req-big", "default", &serialized).expect("split");
    assert!(chunks.len() >= 1);

    let mut reply = None;
    for chunk in chunks {
        if let Some(record) = worker.handle_record(Record::Chunk(chunk)).await {
            reply = Some(record);
        }
    }
    match reply.expect("completed set must dispatch the inner call") {
        Record::ToolResult(result) => {
            assert_eq!(result.id, "req-big");
            assert!(result.success, "reassembled call must execute normally");
        }
        other => panic!("expected tool_result, got {other:?}"),
    }
    assert_eq!(backend.calls().len(), 1);
}
