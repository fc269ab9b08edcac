//! Server core: the single-extension unix-socket acceptor, the pending
//! request engine, the session table, the subscription table, and the tool
//! catalogue surface.
//!
//! At most one extension connection is live at a time. Accepting a new one
//! destroys the prior socket and fails all of its outstanding requests with
//! `EXTENSION_NOT_CONNECTED` before the new socket is installed, then pushes
//! a `session_init` carrying the protocol version and the default agent id.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::protocol::{
    new_record_id, unix_time_ms, ErrorCode, Record, SessionRecord, ToolCall,
    MAX_FRAME_BYTES, PROTOCOL_VERSION,
};
use crate::transport::chunk::{split_into_chunks, ChunkAssembler};
use crate::transport::line::{
    decode_record_line, encode_outbound_line, encode_record_line, LineDecoder,
};

pub mod catalog;
pub mod events;
pub mod pending;
pub mod sessions;

pub use catalog::{catalogue, ToolDescriptor, ToolResponse};
pub use events::{EventNotification, SubscriptionTable};
pub use pending::{call_timeout, PendingOutcome, PendingRequests, DEFAULT_TOOL_TIMEOUT};
pub use sessions::{SessionStatus, SessionTable, SESSION_IDLE_LIMIT, SESSION_SWEEP_INTERVAL};

/// `switch_browser` polls for a fresh connection at this cadence.
pub const SWITCH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// ... and gives up after this long.
pub const SWITCH_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("browser extension is not connected")]
    ExtensionNotConnected,
    #[error("Tool '{tool}' timed out after {timeout_ms}ms")]
    ToolTimeout { tool: String, timeout_ms: u64 },
    #[error("record exceeds the transport frame cap and could not be chunked: {0}")]
    Encode(String),
    #[error("socket I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Wire error code for protocol-level failures returned to the client.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ExtensionNotConnected => ErrorCode::ExtensionNotConnected,
            Self::ToolTimeout { .. } => ErrorCode::Timeout,
            Self::Encode(_) => ErrorCode::MessageTooLarge,
            Self::Io(_) => ErrorCode::InternalError,
        }
    }

    /// The `{error:{code,message}}` payload the client protocol expects.
    #[must_use]
    pub fn to_error_value(&self) -> Value {
        serde_json::json!({
            "error": {"code": self.code(), "message": self.to_string()}
        })
    }
}

/// Point-in-time server introspection snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    pub extension_connected: bool,
    pub pending_requests: usize,
    pub sessions: usize,
    pub subscriptions: usize,
}

struct ExtensionHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    token: u64,
}

/// The server-side core shared by the acceptor, reader, and client surface.
pub struct ServerCore {
    default_agent_id: String,
    extension: StdMutex<Option<ExtensionHandle>>,
    pending: PendingRequests,
    sessions: StdMutex<SessionTable>,
    subscriptions: StdMutex<SubscriptionTable>,
    assembler: StdMutex<ChunkAssembler>,
    notifier: mpsc::UnboundedSender<EventNotification>,
    connection_seq: AtomicU64,
}

impl std::fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCore")
            .field("default_agent_id", &self.default_agent_id)
            .finish_non_exhaustive()
    }
}

impl ServerCore {
    /// Build a core. `notifier` is the client notification channel event
    /// fan-out writes into; send failures on it are swallowed.
    #[must_use]
    pub fn new(
        default_agent_id: impl Into<String>,
        notifier: mpsc::UnboundedSender<EventNotification>,
    ) -> Arc<Self> {
        Arc::new(Self {
            default_agent_id: default_agent_id.into(),
            extension: StdMutex::new(None),
            pending: PendingRequests::new(),
            sessions: StdMutex::new(SessionTable::new()),
            subscriptions: StdMutex::new(SubscriptionTable::new()),
            assembler: StdMutex::new(ChunkAssembler::new()),
            notifier,
            connection_seq: AtomicU64::new(1),
        })
    }

    /// Bind the well-known socket, unlinking any stale file first.
    pub fn bind_listener(socket_path: &Path) -> std::io::Result<UnixListener> {
        match std::fs::remove_file(socket_path) {
            Ok(()) => tracing::debug!(path = %socket_path.display(), "unlinked stale socket file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        UnixListener::bind(socket_path)
    }

    /// Accept loop: each new connection replaces the previous one.
    pub async fn run_acceptor(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _addr)) => self.install_connection(stream),
                Err(err) => {
                    tracing::warn!("extension socket accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Install a freshly accepted extension connection, tearing down the
    /// prior one first.
    pub fn install_connection(self: &Arc<Self>, stream: UnixStream) {
        let token = self.connection_seq.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let prior = {
            let mut guard = self.extension.lock().expect("extension handle mutex poisoned");
            guard.take()
        };
        if let Some(prior) = prior {
            tracing::info!(
                replaced_token = prior.token,
                "new extension connection replaces the previous one"
            );
            drop(prior); // closes the old writer channel, ending its task
            self.on_extension_lost();
        }

        {
            let mut guard = self.extension.lock().expect("extension handle mutex poisoned");
            *guard = Some(ExtensionHandle {
                outbound: outbound_tx,
                token,
            });
        }

        self.spawn_writer(write_half, outbound_rx, token);
        self.spawn_reader(read_half, token);
        self.push_session_init();
    }

    /// Mark the extension gone and fail every pending request.
    fn on_extension_lost(&self) {
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .mark_all(SessionStatus::Disconnected);
        let failed = self.pending.fail_all_disconnected();
        if failed > 0 {
            tracing::warn!(failed, "failed pending requests after extension loss");
        }
    }

    fn spawn_writer(
        self: &Arc<Self>,
        mut write_half: tokio::net::unix::OwnedWriteHalf,
        mut outbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        token: u64,
    ) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if let Err(err) = write_half.write_all(&line).await {
                    tracing::warn!("extension socket write failed: {err}");
                    core.drop_connection(token);
                    return;
                }
            }
        });
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut read_half: tokio::net::unix::OwnedReadHalf,
        token: u64,
    ) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut decoder = LineDecoder::new();
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for line in decoder.push(&buf[..n]) {
                            core.handle_line(&line).await;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("extension socket read failed: {err}");
                        break;
                    }
                }
            }
            core.drop_connection(token);
        });
    }

    /// Tear down the connection identified by `token`, if it is still the
    /// live one. A replaced connection's tasks fall through here harmlessly.
    fn drop_connection(&self, token: u64) {
        let removed = {
            let mut guard = self.extension.lock().expect("extension handle mutex poisoned");
            match guard.as_ref() {
                Some(handle) if handle.token == token => guard.take(),
                _ => None,
            }
        };
        if removed.is_some() {
            tracing::info!("extension disconnected");
            self.on_extension_lost();
        }
    }

    fn push_session_init(&self) {
        let init = Record::SessionInit(
            SessionRecord::new(self.default_agent_id.clone())
                .with_protocol_version(PROTOCOL_VERSION),
        );
        if let Err(err) = self.send_record(&init) {
            tracing::warn!("failed to push session_init to fresh connection: {err}");
        }
    }

    /// Encode and enqueue one record toward the extension, chunking records
    /// that would not fit a single frame on the far side of the bridge.
    pub fn send_record(&self, record: &Record) -> Result<(), ServerError> {
        let serialized = serde_json::to_vec(record)
            .map_err(|err| ServerError::Encode(err.to_string()))?;
        let lines = if serialized.len() > MAX_FRAME_BYTES {
            let request_id = record_correlation_id(record);
            let agent_id = record.agent_id().unwrap_or(&self.default_agent_id);
            split_into_chunks(&request_id, agent_id, &serialized)
                .map_err(|err| ServerError::Encode(err.to_string()))?
                .into_iter()
                .map(|chunk| encode_record_line(&Record::Chunk(chunk)))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|err| ServerError::Encode(err.to_string()))?
        } else {
            vec![encode_outbound_line(record)
                .map_err(|err| ServerError::Encode(err.to_string()))?]
        };

        let guard = self.extension.lock().expect("extension handle mutex poisoned");
        let handle = guard.as_ref().ok_or(ServerError::ExtensionNotConnected)?;
        for line in lines {
            handle
                .outbound
                .send(line)
                .map_err(|_| ServerError::ExtensionNotConnected)?;
        }
        Ok(())
    }

    async fn handle_line(self: &Arc<Self>, line: &[u8]) {
        let value = match decode_record_line(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("discarding undecodable record line: {err}");
                return;
            }
        };
        match Record::from_value(value) {
            Ok(Some(record)) => self.handle_record(record).await,
            Ok(None) => {}
            Err(err) => tracing::warn!("discarding malformed record: {err}"),
        }
    }

    /// Route one inbound record from the extension.
    pub async fn handle_record(self: &Arc<Self>, record: Record) {
        if let Some(agent_id) = record.agent_id() {
            self.sessions
                .lock()
                .expect("session table mutex poisoned")
                .touch(agent_id);
        }

        match record {
            Record::ToolResult(result) => {
                let outcome = if result.success {
                    PendingOutcome::Result(result.result.unwrap_or(Value::Null))
                } else {
                    PendingOutcome::ToolError(result.error.unwrap_or_else(|| {
                        crate::protocol::ToolError::new(
                            ErrorCode::InternalError,
                            "tool failed without an error payload",
                        )
                    }))
                };
                if !self.pending.resolve(&result.id, outcome) {
                    tracing::debug!(id = %result.id, "dropping unmatched tool_result");
                }
            }
            Record::BrowserEvent(event) => {
                let delivered = self
                    .subscriptions
                    .lock()
                    .expect("subscription table mutex poisoned")
                    .fan_out(&event, &self.notifier);
                tracing::trace!(
                    event_type = %event.event_type,
                    delivered,
                    "browser event fanned out"
                );
            }
            Record::SessionInit(init) | Record::SessionRecovery(init) => {
                if let Some(version) = init.protocol_version.as_deref() {
                    if version != PROTOCOL_VERSION {
                        tracing::warn!(
                            peer = version,
                            local = PROTOCOL_VERSION,
                            "protocol version mismatch, continuing anyway"
                        );
                    }
                }
                self.sessions
                    .lock()
                    .expect("session table mutex poisoned")
                    .upsert(&init.agent_id);
            }
            Record::SessionHeartbeat(heartbeat) => {
                self.sessions
                    .lock()
                    .expect("session table mutex poisoned")
                    .heartbeat(&heartbeat.agent_id);
            }
            Record::SessionClose(close) => {
                self.sessions
                    .lock()
                    .expect("session table mutex poisoned")
                    .close(&close.agent_id);
                let purged = self
                    .subscriptions
                    .lock()
                    .expect("subscription table mutex poisoned")
                    .purge_agent(&close.agent_id);
                tracing::debug!(
                    agent_id = %close.agent_id,
                    purged,
                    "session closed, subscriptions purged"
                );
            }
            Record::Chunk(chunk) => {
                let request_id = chunk.request_id.clone();
                let assembled = self
                    .assembler
                    .lock()
                    .expect("chunk assembler mutex poisoned")
                    .insert(chunk, Instant::now());
                match assembled {
                    Ok(Some(body)) => match serde_json::from_slice::<Value>(&body)
                        .and_then(Record::from_value)
                    {
                        Ok(Some(inner)) => Box::pin(self.handle_record(inner)).await,
                        Ok(None) => {}
                        Err(err) => tracing::warn!(
                            %request_id,
                            "reassembled chunk set is not a record: {err}"
                        ),
                    },
                    Ok(None) => {}
                    Err(err) => tracing::warn!(%request_id, "chunk reassembly failed: {err}"),
                }
            }
            Record::ToolCall(call) => {
                tracing::debug!(tool = %call.tool, "ignoring unexpected inbound tool_call");
            }
            Record::Compressed(_) => {
                tracing::debug!("ignoring compressed envelope after line decode");
            }
        }
    }

    // ── Client-facing tool surface ──────────────────────────────────────

    /// Invoke one catalogue tool and wait for its result.
    ///
    /// Worker-side tool errors come back `Ok` with the error embedded in the
    /// content text; `TIMEOUT` and `EXTENSION_NOT_CONNECTED` are
    /// protocol-level `Err`s.
    pub async fn invoke_tool(
        self: &Arc<Self>,
        tool: &str,
        input: Value,
    ) -> Result<ToolResponse, ServerError> {
        if tool == "switch_browser" {
            return self.switch_browser().await;
        }

        let request_id = new_record_id();
        let span = crate::logging::request_span(tool, &request_id);
        self.invoke_registered(tool, input, request_id)
            .instrument(span)
            .await
    }

    async fn invoke_registered(
        self: &Arc<Self>,
        tool: &str,
        input: Value,
        request_id: String,
    ) -> Result<ToolResponse, ServerError> {
        let rx = self.pending.register(&request_id);
        let call = Record::ToolCall(ToolCall {
            id: request_id.clone(),
            agent_id: self.default_agent_id.clone(),
            tool: tool.to_string(),
            input: input.clone(),
            timestamp: unix_time_ms(),
        });

        if let Err(err) = self.send_record(&call) {
            self.pending.remove(&request_id);
            return Err(err);
        }

        let deadline = call_timeout(tool, &input);
        let outcome = match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => return Err(ServerError::ExtensionNotConnected),
            Err(_elapsed) => {
                self.pending.remove(&request_id);
                return Err(ServerError::ToolTimeout {
                    tool: tool.to_string(),
                    timeout_ms: deadline.as_millis() as u64,
                });
            }
        };

        match outcome {
            PendingOutcome::Result(result) => {
                self.sync_subscriptions(tool, &input, &result);
                Ok(ToolResponse::from_result(&result))
            }
            PendingOutcome::ToolError(error) => Ok(ToolResponse::from_tool_error(&error)),
            PendingOutcome::Disconnected => Err(ServerError::ExtensionNotConnected),
        }
    }

    /// Mirror successful subscribe/unsubscribe results into the
    /// authoritative subscription table. The worker mints the ids; the
    /// server owns the table.
    fn sync_subscriptions(&self, tool: &str, input: &Value, result: &Value) {
        match tool {
            "browser_event_subscribe" => {
                let Some(subscription_id) =
                    result.get("subscriptionId").and_then(Value::as_str)
                else {
                    tracing::warn!("subscribe result carried no subscriptionId");
                    return;
                };
                let event_types = input
                    .get("eventTypes")
                    .and_then(Value::as_array)
                    .map(|types| {
                        types
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                let url_pattern = input
                    .get("urlPattern")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.subscriptions
                    .lock()
                    .expect("subscription table mutex poisoned")
                    .insert(
                        subscription_id.to_string(),
                        self.default_agent_id.clone(),
                        event_types,
                        url_pattern,
                    );
            }
            "browser_event_unsubscribe" => {
                let id = result
                    .get("subscriptionId")
                    .or_else(|| input.get("subscriptionId"))
                    .and_then(Value::as_str);
                if let Some(id) = id {
                    self.subscriptions
                        .lock()
                        .expect("subscription table mutex poisoned")
                        .remove(id);
                }
            }
            _ => {}
        }
    }

    /// Server-side `switch_browser`: drop the live connection and poll for a
    /// fresh acceptance.
    async fn switch_browser(self: &Arc<Self>) -> Result<ToolResponse, ServerError> {
        let prior = {
            let mut guard = self.extension.lock().expect("extension handle mutex poisoned");
            guard.take()
        };
        if prior.is_some() {
            self.on_extension_lost();
        }

        let started = Instant::now();
        while started.elapsed() < SWITCH_DEADLINE {
            tokio::time::sleep(SWITCH_POLL_INTERVAL).await;
            let connected = self
                .extension
                .lock()
                .expect("extension handle mutex poisoned")
                .is_some();
            if connected {
                return Ok(ToolResponse::from_result(&serde_json::json!({
                    "switched": true,
                    "waitedMs": started.elapsed().as_millis() as u64,
                })));
            }
        }
        Err(ServerError::ToolTimeout {
            tool: "switch_browser".to_string(),
            timeout_ms: SWITCH_DEADLINE.as_millis() as u64,
        })
    }

    // ── Maintenance ─────────────────────────────────────────────────────

    /// Prune sessions idle past the limit; the binary drives this every
    /// [`SESSION_SWEEP_INTERVAL`].
    pub fn prune_sessions_now(&self) -> Vec<String> {
        self.sessions
            .lock()
            .expect("session table mutex poisoned")
            .prune_idle(unix_time_ms())
    }

    /// Free chunk sets past the reassembly deadline.
    pub fn sweep_chunks_now(&self) {
        let expired = self
            .assembler
            .lock()
            .expect("chunk assembler mutex poisoned")
            .sweep(Instant::now());
        for request_id in expired {
            tracing::warn!(%request_id, "chunk set expired before completion");
        }
    }

    /// Spawn the periodic session sweeper and chunk-set sweeper.
    pub fn spawn_maintenance(self: &Arc<Self>) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let pruned = core.prune_sessions_now();
                if !pruned.is_empty() {
                    tracing::info!(?pruned, "pruned idle agent sessions");
                }
            }
        });
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                core.sweep_chunks_now();
            }
        });
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            extension_connected: self
                .extension
                .lock()
                .expect("extension handle mutex poisoned")
                .is_some(),
            pending_requests: self.pending.len(),
            sessions: self
                .sessions
                .lock()
                .expect("session table mutex poisoned")
                .len(),
            subscriptions: self
                .subscriptions
                .lock()
                .expect("subscription table mutex poisoned")
                .len(),
        }
    }

    #[must_use]
    pub fn default_agent_id(&self) -> &str {
        &self.default_agent_id
    }

    /// Close the live connection and fail pendings (shutdown path).
    pub fn shutdown(&self) {
        let taken = self
            .extension
            .lock()
            .expect("extension handle mutex poisoned")
            .take();
        if taken.is_some() {
            self.on_extension_lost();
        }
    }
}

/// Correlation id used when a record must travel as a chunk set.
fn record_correlation_id(record: &Record) -> String {
    match record {
        Record::ToolCall(r) => r.id.clone(),
        Record::ToolResult(r) => r.id.clone(),
        Record::BrowserEvent(r) => r.id.clone(),
        Record::SessionInit(r)
        | Record::SessionHeartbeat(r)
        | Record::SessionRecovery(r)
        | Record::SessionClose(r) => r.id.clone(),
        Record::Chunk(r) => r.request_id.clone(),
        Record::Compressed(_) => new_record_id(),
    }
}
