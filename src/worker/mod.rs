//! Extension worker core: tool dispatch under per-tab mutual exclusion,
//! debugger attach bookkeeping, bounded capture buffers, and the agent
//! session lifecycle.
//!
//! The worker receives [`Record`]s from the bridge, routes `tool_call`s to a
//! [`BrowserBackend`] under the tab-lock discipline, answers session
//! lifecycle records, and emits `browser_event` records on its own timeline
//! with a per-session sequence number.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::protocol::{
    new_record_id, unix_time_ms, BrowserEvent, ChunkRecord, ErrorCode, Record, SessionRecord,
    ToolCall, ToolError, ToolResult, PROTOCOL_VERSION,
};
use crate::transport::chunk::ChunkAssembler;

pub mod backend;
pub mod buffers;
pub mod cdp;
pub mod locks;
pub mod refs;
pub mod store;

pub use backend::BrowserBackend;
pub use cdp::{CdpTracker, CDP_IDLE_DETACH};
pub use locks::{AgentTabGroup, AgentTabGroups, TabLockTable, TAB_LOCK_TTL};

use buffers::{ScreenshotRing, TabLogBuffers};
use store::{PersistedSession, SessionStore};

/// Every tool this worker dispatches.
const KNOWN_TOOLS: &[&str] = &[
    "navigate",
    "click",
    "form_input",
    "screenshot",
    "find",
    "get_page_text",
    "wait_for",
    "read_console",
    "read_network",
    "upload_image",
    "tabs_context",
    "browser_event_subscribe",
    "browser_event_unsubscribe",
];

/// Tools that require an attached debugger, and therefore the tab lock.
const CDP_DEPENDENT_TOOLS: &[&str] = &[
    "navigate",
    "click",
    "form_input",
    "screenshot",
    "find",
    "get_page_text",
    "wait_for",
    "read_console",
    "read_network",
];

/// Dispatch core for the in-browser worker.
pub struct WorkerCore {
    backend: Arc<dyn BrowserBackend>,
    cdp: Arc<CdpTracker>,
    locks: StdMutex<TabLockTable>,
    groups: StdMutex<AgentTabGroups>,
    screenshots: StdMutex<ScreenshotRing>,
    console: StdMutex<TabLogBuffers>,
    network: StdMutex<TabLogBuffers>,
    assembler: StdMutex<ChunkAssembler>,
    store: Option<SessionStore>,
    outbound: mpsc::UnboundedSender<Record>,
    event_seq: AtomicU64,
    image_seq: AtomicU64,
}

impl std::fmt::Debug for WorkerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCore").finish_non_exhaustive()
    }
}

impl WorkerCore {
    /// Build a worker over the given backend. `outbound` carries every
    /// record the worker emits (results, events, session replies) toward
    /// the bridge.
    pub fn new(
        backend: Arc<dyn BrowserBackend>,
        outbound: mpsc::UnboundedSender<Record>,
        store: Option<SessionStore>,
    ) -> Self {
        let core = Self {
            cdp: Arc::new(CdpTracker::new(Arc::clone(&backend))),
            backend,
            locks: StdMutex::new(TabLockTable::new()),
            groups: StdMutex::new(AgentTabGroups::new()),
            screenshots: StdMutex::new(ScreenshotRing::new()),
            console: StdMutex::new(TabLogBuffers::new()),
            network: StdMutex::new(TabLogBuffers::new()),
            assembler: StdMutex::new(ChunkAssembler::new()),
            store,
            outbound,
            event_seq: AtomicU64::new(0),
            image_seq: AtomicU64::new(1),
        };
        core.restore_persisted_groups();
        core
    }

    fn restore_persisted_groups(&self) {
        let Some(store) = &self.store else { return };
        match store.load() {
            Ok(sessions) => {
                let mut groups = self.groups.lock().expect("tab groups mutex poisoned");
                for (agent_id, session) in sessions {
                    groups.bind(
                        &agent_id,
                        AgentTabGroup {
                            group_id: session.group_id,
                            agent_name: session.agent_name,
                            color: session.color,
                            tabs: session.tabs.into_iter().collect(),
                        },
                    );
                }
            }
            Err(err) => tracing::warn!("failed to restore persisted tab groups: {err}"),
        }
    }

    /// The worker's own `session_init`, sent when the port channel opens.
    #[must_use]
    pub fn hello(&self, agent_id: &str) -> Record {
        Record::SessionInit(
            SessionRecord::new(agent_id).with_protocol_version(PROTOCOL_VERSION),
        )
    }

    /// Handle one inbound record, returning the direct reply when the
    /// record demands one.
    pub async fn handle_record(&self, record: Record) -> Option<Record> {
        match record {
            Record::ToolCall(call) => {
                let result = self.handle_tool_call(call).await;
                Some(Record::ToolResult(result))
            }
            Record::SessionInit(init) => {
                self.check_protocol_version(&init);
                None
            }
            Record::SessionHeartbeat(_) => None,
            Record::SessionClose(close) => Some(self.handle_session_close(close).await),
            Record::SessionRecovery(recovery) => Some(self.handle_session_recovery(recovery)),
            Record::Chunk(chunk) => self.handle_chunk(chunk).await,
            Record::ToolResult(_) | Record::BrowserEvent(_) => {
                // The worker originates these; an inbound copy is a peer bug.
                tracing::debug!("ignoring unexpected inbound record");
                None
            }
            Record::Compressed(_) => {
                tracing::debug!("ignoring compressed envelope outside the line transport");
                None
            }
        }
    }

    fn check_protocol_version(&self, init: &SessionRecord) {
        match init.protocol_version.as_deref() {
            Some(version) if version != PROTOCOL_VERSION => {
                tracing::warn!(
                    peer = version,
                    local = PROTOCOL_VERSION,
                    "protocol version mismatch, continuing anyway"
                );
            }
            _ => {}
        }
    }

    async fn handle_chunk(&self, chunk: ChunkRecord) -> Option<Record> {
        let request_id = chunk.request_id.clone();
        let assembled = {
            let mut assembler = self.assembler.lock().expect("chunk assembler mutex poisoned");
            assembler.insert(chunk, Instant::now())
        };
        match assembled {
            Ok(Some(body)) => match serde_json::from_slice::<Value>(&body)
                .and_then(Record::from_value)
            {
                Ok(Some(inner)) => Box::pin(self.handle_record(inner)).await,
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(%request_id, "reassembled chunk set is not a record: {err}");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%request_id, "chunk reassembly failed: {err}");
                None
            }
        }
    }

    /// Execute one tool call end to end: validation, lock, ownership,
    /// debugger attach, handler, release.
    pub async fn handle_tool_call(&self, call: ToolCall) -> ToolResult {
        if !KNOWN_TOOLS.contains(&call.tool.as_str()) {
            return ToolResult::err(
                &call,
                ToolError::new(
                    ErrorCode::UnknownTool,
                    format!("no dispatcher for tool '{}'", call.tool),
                ),
            );
        }

        let tab_id = match parse_tab_id(&call.input) {
            Ok(tab_id) => tab_id,
            Err(err) => return ToolResult::err(&call, err),
        };
        if let Err(err) = refs::validate_input_refs(&call.input) {
            return ToolResult::err(&call, err);
        }

        let is_cdp = CDP_DEPENDENT_TOOLS.contains(&call.tool.as_str());
        let locked_tab = match (is_cdp, tab_id) {
            (true, Some(tab)) => {
                let acquired = self
                    .locks
                    .lock()
                    .expect("tab lock mutex poisoned")
                    .acquire(tab, &call.agent_id, Instant::now());
                if let Err(err) = acquired {
                    return ToolResult::err(&call, err);
                }
                Some(tab)
            }
            _ => None,
        };

        let outcome = self.dispatch_locked(&call, tab_id).await;

        if let Some(tab) = locked_tab {
            self.locks
                .lock()
                .expect("tab lock mutex poisoned")
                .release(tab, &call.agent_id);
        }

        match outcome {
            Ok(result) => ToolResult::ok(&call, result),
            Err(err) => ToolResult::err(&call, err),
        }
    }

    async fn dispatch_locked(
        &self,
        call: &ToolCall,
        tab_id: Option<u32>,
    ) -> Result<Value, ToolError> {
        if let Some(tab) = tab_id {
            self.groups
                .lock()
                .expect("tab groups mutex poisoned")
                .check_access(&call.agent_id, tab)?;
        }

        let _cdp_guard = match (CDP_DEPENDENT_TOOLS.contains(&call.tool.as_str()), tab_id) {
            (true, Some(tab)) => Some(self.cdp.ensure_attached(tab).await?),
            _ => None,
        };

        match call.tool.as_str() {
            "browser_event_subscribe" => self.subscribe(call),
            "browser_event_unsubscribe" => Ok(json!({
                "subscriptionId": call.input.get("subscriptionId").cloned().unwrap_or(Value::Null),
                "removed": true,
            })),
            "screenshot" => self.capture_screenshot(call).await,
            "upload_image" => self.upload_image(call).await,
            "read_console" => Ok(self.read_log_tail(&self.console, call, tab_id)),
            "read_network" => Ok(self.read_log_tail(&self.network, call, tab_id)),
            _ => self.backend.execute(&call.tool, &call.input).await,
        }
    }

    /// The worker is the subscription id authority; the server mirrors the
    /// id into its own table when the result comes back.
    fn subscribe(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let event_types = call
            .input
            .get("eventTypes")
            .and_then(Value::as_array)
            .filter(|types| !types.is_empty())
            .ok_or_else(|| {
                ToolError::new(
                    ErrorCode::InvalidParams,
                    "eventTypes must be a non-empty array",
                )
            })?;
        let subscription_id = format!("sub_{}", uuid::Uuid::new_v4().simple());
        let mut result = json!({
            "subscriptionId": subscription_id,
            "eventTypes": event_types,
        });
        if let Some(pattern) = call.input.get("urlPattern") {
            result["urlPattern"] = pattern.clone();
        }
        Ok(result)
    }

    async fn capture_screenshot(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let mut result = self.backend.execute("screenshot", &call.input).await?;
        let image_id = format!("img_{}", self.image_seq.fetch_add(1, Ordering::Relaxed));
        if let Some(data) = result.get("data").and_then(Value::as_str) {
            self.screenshots
                .lock()
                .expect("screenshot ring mutex poisoned")
                .insert(image_id.clone(), data.to_string());
        }
        if let Some(obj) = result.as_object_mut() {
            obj.insert("imageId".to_string(), Value::String(image_id));
        }
        Ok(result)
    }

    async fn upload_image(&self, call: &ToolCall) -> Result<Value, ToolError> {
        let image_id = call
            .input
            .get("imageId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::new(ErrorCode::InvalidParams, "imageId must be a string")
            })?;
        let data = self
            .screenshots
            .lock()
            .expect("screenshot ring mutex poisoned")
            .get(image_id)
            .map(str::to_string)
            .ok_or_else(|| {
                ToolError::new(
                    ErrorCode::InvalidParams,
                    format!("no captured image with id '{image_id}' (ring holds the last 10)"),
                )
            })?;
        let mut input = call.input.clone();
        if let Some(obj) = input.as_object_mut() {
            obj.insert("data".to_string(), Value::String(data));
        }
        self.backend.execute("upload_image", &input).await
    }

    fn read_log_tail(
        &self,
        buffers: &StdMutex<TabLogBuffers>,
        call: &ToolCall,
        tab_id: Option<u32>,
    ) -> Value {
        let limit = call
            .input
            .get("limit")
            .and_then(Value::as_u64)
            .map_or(100, |limit| limit as usize);
        let entries = tab_id.map_or_else(Vec::new, |tab| {
            buffers
                .lock()
                .expect("log buffer mutex poisoned")
                .tail(tab, limit)
        });
        json!({"entries": entries})
    }

    // ── Session lifecycle ───────────────────────────────────────────────

    async fn handle_session_close(&self, close: SessionRecord) -> Record {
        let agent_id = close.agent_id.clone();
        let removed = self
            .groups
            .lock()
            .expect("tab groups mutex poisoned")
            .remove(&agent_id);

        if let Some(group) = removed {
            let tabs: Vec<u32> = group.tabs.iter().copied().collect();
            for &tab in &tabs {
                self.cdp.forget_tab(tab);
                self.console
                    .lock()
                    .expect("console buffer mutex poisoned")
                    .purge_tab(tab);
                self.network
                    .lock()
                    .expect("network buffer mutex poisoned")
                    .purge_tab(tab);
            }
            self.backend.close_tabs(tabs).await;
        }
        self.locks
            .lock()
            .expect("tab lock mutex poisoned")
            .release_agent(&agent_id);
        self.persist_group_removal(&agent_id);

        Record::SessionClose(SessionRecord::new(agent_id))
    }

    fn handle_session_recovery(&self, recovery: SessionRecord) -> Record {
        let agent_id = recovery.agent_id.clone();
        let persisted = self
            .store
            .as_ref()
            .and_then(|store| match store.load() {
                Ok(mut sessions) => sessions.remove(&agent_id),
                Err(err) => {
                    tracing::warn!("session recovery load failed: {err}");
                    None
                }
            });

        let status = match persisted {
            Some(session) => {
                let tabs = session.tabs.clone();
                self.groups.lock().expect("tab groups mutex poisoned").bind(
                    &agent_id,
                    AgentTabGroup {
                        group_id: session.group_id,
                        agent_name: session.agent_name,
                        color: session.color,
                        tabs: session.tabs.into_iter().collect(),
                    },
                );
                json!({"recovered": true, "groupId": session.group_id, "tabs": tabs})
            }
            None => json!({"recovered": false}),
        };
        Record::SessionRecovery(SessionRecord::new(agent_id).with_config(status))
    }

    fn persist_group_removal(&self, agent_id: &str) {
        let Some(store) = &self.store else { return };
        match store.load() {
            Ok(mut sessions) => {
                if sessions.remove(agent_id).is_some() {
                    if let Err(err) = store.save(&sessions) {
                        tracing::warn!("failed to persist tab group removal: {err}");
                    }
                }
            }
            Err(err) => tracing::warn!("failed to load session store for removal: {err}"),
        }
    }

    /// Persist the current tab-group bindings.
    pub fn persist_groups(&self) {
        let Some(store) = &self.store else { return };
        let snapshot: HashMap<String, PersistedSession> = {
            let groups = self.groups.lock().expect("tab groups mutex poisoned");
            groups
                .iter()
                .map(|(agent_id, group)| {
                    (
                        agent_id.to_string(),
                        PersistedSession {
                            agent_id: agent_id.to_string(),
                            agent_name: group.agent_name.clone(),
                            group_id: group.group_id,
                            color: group.color.clone(),
                            tabs: group.tabs.iter().copied().collect(),
                            status: "active".to_string(),
                            last_activity: unix_time_ms(),
                        },
                    )
                })
                .collect()
        };
        if let Err(err) = store.save(&snapshot) {
            tracing::warn!("failed to persist tab groups: {err}");
        }
    }

    // ── Events and capture feeds ────────────────────────────────────────

    /// Emit a `browser_event` on the worker's own timeline.
    pub fn emit_event(
        &self,
        agent_id: &str,
        event_type: &str,
        payload: Value,
        tab_id: u32,
        url: &str,
    ) -> BrowserEvent {
        let event = BrowserEvent {
            id: new_record_id(),
            agent_id: agent_id.to_string(),
            event_type: event_type.to_string(),
            payload,
            tab_id,
            url: url.to_string(),
            timestamp: unix_time_ms(),
            sequence_number: self.event_seq.fetch_add(1, Ordering::Relaxed),
        };
        if self
            .outbound
            .send(Record::BrowserEvent(event.clone()))
            .is_err()
        {
            tracing::debug!(
                event_type,
                tab_id,
                "browser event emitted while the port channel is down"
            );
        }
        event
    }

    /// Emit a `session_heartbeat` so the server-side sweeper sees activity.
    /// The embedder drives the cadence.
    pub fn emit_heartbeat(&self, agent_id: &str) -> Record {
        let record = Record::SessionHeartbeat(SessionRecord::new(agent_id));
        if self.outbound.send(record.clone()).is_err() {
            tracing::debug!(agent_id, "heartbeat emitted while the port channel is down");
        }
        record
    }

    /// Feed a console entry collected from the page.
    pub fn record_console_entry(&self, tab_id: u32, entry: Value) {
        self.console
            .lock()
            .expect("console buffer mutex poisoned")
            .push(tab_id, entry);
    }

    /// Feed a network entry collected from the page.
    pub fn record_network_entry(&self, tab_id: u32, entry: Value) {
        self.network
            .lock()
            .expect("network buffer mutex poisoned")
            .push(tab_id, entry);
    }

    /// Purge per-tab state when the browser reports a tab closed.
    pub fn on_tab_closed(&self, tab_id: u32) {
        self.cdp.forget_tab(tab_id);
        self.console
            .lock()
            .expect("console buffer mutex poisoned")
            .purge_tab(tab_id);
        self.network
            .lock()
            .expect("network buffer mutex poisoned")
            .purge_tab(tab_id);
        self.groups
            .lock()
            .expect("tab groups mutex poisoned")
            .forget_tab(tab_id);
    }

    /// Maintenance tick: idle debugger detach and chunk-set expiry. The
    /// embedder drives this on a coarse interval.
    pub async fn tick(&self, now: Instant) {
        self.cdp.sweep_idle(now).await;
        let expired = self
            .assembler
            .lock()
            .expect("chunk assembler mutex poisoned")
            .sweep(now);
        for request_id in expired {
            tracing::warn!(%request_id, "chunk set expired before completion");
        }
    }

    /// Bind `tab_id` into the agent's tab group (exclusive ownership).
    pub fn assign_tab(&self, agent_id: &str, tab_id: u32) -> Result<(), ToolError> {
        self.groups
            .lock()
            .expect("tab groups mutex poisoned")
            .assign_tab(agent_id, tab_id)?;
        self.persist_groups();
        Ok(())
    }

    /// Snapshot of the tab lock table, for tests and status reporting.
    #[must_use]
    pub fn lock_holder(&self, tab_id: u32) -> Option<String> {
        self.locks
            .lock()
            .expect("tab lock mutex poisoned")
            .holder(tab_id)
            .map(str::to_string)
    }

    #[must_use]
    pub fn cdp_tracker(&self) -> &Arc<CdpTracker> {
        &self.cdp
    }
}

/// `input.tabId`, validated as a finite non-negative integer number.
fn parse_tab_id(input: &Value) -> Result<Option<u32>, ToolError> {
    let Some(raw) = input.get("tabId") else {
        return Ok(None);
    };
    let invalid = || {
        ToolError::new(
            ErrorCode::InvalidParams,
            format!("tabId must be a finite non-negative number, got {raw}"),
        )
    };
    let value = raw.as_f64().ok_or_else(invalid)?;
    if !value.is_finite() || value < 0.0 || value.fract() != 0.0 || value > f64::from(u32::MAX) {
        return Err(invalid());
    }
    Ok(Some(value as u32))
}
