//! Request/response correlation: the pending-request table and per-tool
//! deadlines.
//!
//! Every tool call inserts a resolver keyed by its freshly minted record id.
//! Exactly one of three events removes it: the matching `tool_result`, the
//! per-call deadline, or the extension socket dropping. Removal happens
//! before resolution, so a timer racing a result can never double-resolve.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::protocol::ToolError;

/// Deadline applied to every tool call unless the tool overrides it.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack added on top of a `wait_for` call's own timeout input.
pub const WAIT_FOR_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// How one pending call ends.
#[derive(Debug)]
pub enum PendingOutcome {
    /// `tool_result` with `success:true`.
    Result(Value),
    /// `tool_result` with `success:false`; travels back inside the
    /// tool-result envelope, not as a protocol failure.
    ToolError(ToolError),
    /// The extension socket dropped or was replaced.
    Disconnected,
}

/// `requestId → resolver` for calls in flight.
#[derive(Debug, Default)]
pub struct PendingRequests {
    entries: StdMutex<HashMap<String, oneshot::Sender<PendingOutcome>>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a resolver for `request_id` and hand back its receiver.
    pub fn register(&self, request_id: &str) -> oneshot::Receiver<PendingOutcome> {
        let (tx, rx) = oneshot::channel();
        self.entries
            .lock()
            .expect("pending requests mutex poisoned")
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Remove the entry without resolving it (timeout and write-error paths).
    pub fn remove(&self, request_id: &str) -> bool {
        self.entries
            .lock()
            .expect("pending requests mutex poisoned")
            .remove(request_id)
            .is_some()
    }

    /// Resolve and remove the entry. Returns `false` when no entry matches —
    /// a late or unsolicited result, which the caller drops.
    pub fn resolve(&self, request_id: &str, outcome: PendingOutcome) -> bool {
        let sender = self
            .entries
            .lock()
            .expect("pending requests mutex poisoned")
            .remove(request_id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Resolve every outstanding call as disconnected. Returns how many were
    /// failed.
    pub fn fail_all_disconnected(&self) -> usize {
        let drained: Vec<_> = {
            let mut entries = self
                .entries
                .lock()
                .expect("pending requests mutex poisoned");
            entries.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(PendingOutcome::Disconnected);
        }
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("pending requests mutex poisoned")
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Deadline for one call. `wait_for` scales with its own `timeout` input
/// (milliseconds) plus a fixed margin; everything else gets the default.
#[must_use]
pub fn call_timeout(tool: &str, input: &Value) -> Duration {
    if tool == "wait_for" {
        if let Some(wait_ms) = input.get("timeout").and_then(Value::as_f64) {
            if wait_ms.is_finite() && wait_ms >= 0.0 {
                return Duration::from_millis(wait_ms as u64) + WAIT_FOR_TIMEOUT_MARGIN;
            }
        }
    }
    DEFAULT_TOOL_TIMEOUT
}
