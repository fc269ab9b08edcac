//! Per-tab debugger attach bookkeeping.
//!
//! Each tab moves through `DETACHED → ATTACHING → ATTACHED(cmd_count)`.
//! Concurrent `ensure_attached` calls for one tab share a single in-flight
//! attach; commands hold an RAII guard that keeps the attachment pinned, and
//! a tab idle at count zero for [`CDP_IDLE_DETACH`] is detached by the next
//! maintenance sweep. A sweep that finds commands in flight leaves the
//! attachment alone — the following idle window re-arms naturally.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::protocol::{ErrorCode, ToolError};

use super::backend::BrowserBackend;

/// Idle window after the last command before the debugger is detached.
pub const CDP_IDLE_DETACH: Duration = Duration::from_secs(5);

#[derive(Debug)]
enum AttachState {
    /// Attach in flight; queued waiters are resolved when it lands.
    Attaching(Vec<oneshot::Sender<Result<(), ToolError>>>),
    Attached { cmd_count: u32, idle_since: Option<Instant> },
}

/// Tracks attach state per tab and shares in-flight attaches.
pub struct CdpTracker {
    backend: Arc<dyn BrowserBackend>,
    tabs: StdMutex<HashMap<u32, AttachState>>,
}

impl std::fmt::Debug for CdpTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdpTracker").finish_non_exhaustive()
    }
}

impl CdpTracker {
    #[must_use]
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self {
            backend,
            tabs: StdMutex::new(HashMap::new()),
        }
    }

    /// Ensure the debugger is attached to `tab_id` and pin it for one
    /// command. The returned guard must live for the duration of the
    /// command; dropping it starts the idle window once the count hits zero.
    pub async fn ensure_attached(
        self: &Arc<Self>,
        tab_id: u32,
    ) -> Result<CdpCommandGuard, ToolError> {
        loop {
            let waiter = {
                let mut tabs = self.tabs.lock().expect("cdp tracker mutex poisoned");
                match tabs.get_mut(&tab_id) {
                    Some(AttachState::Attached { cmd_count, idle_since }) => {
                        *cmd_count += 1;
                        *idle_since = None;
                        return Ok(CdpCommandGuard {
                            tracker: Arc::clone(self),
                            tab_id,
                        });
                    }
                    Some(AttachState::Attaching(waiters)) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        tabs.insert(tab_id, AttachState::Attaching(Vec::new()));
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => {
                    // Another caller owns the attach; wait for its outcome,
                    // then loop to take a command slot.
                    match rx.await {
                        Ok(Ok(())) => continue,
                        Ok(Err(err)) => return Err(err),
                        Err(_) => {
                            return Err(ToolError::new(
                                ErrorCode::DebuggerAttachFailed,
                                format!("attach to tab {tab_id} was abandoned"),
                            ));
                        }
                    }
                }
                None => return self.perform_attach(tab_id).await,
            }
        }
    }

    async fn perform_attach(self: &Arc<Self>, tab_id: u32) -> Result<CdpCommandGuard, ToolError> {
        let outcome = self.backend.attach_debugger(tab_id).await;
        let waiters = {
            let mut tabs = self.tabs.lock().expect("cdp tracker mutex poisoned");
            let waiters = match tabs.remove(&tab_id) {
                Some(AttachState::Attaching(waiters)) => waiters,
                other => {
                    // State was replaced underneath us; restore whatever was
                    // there and fall through with no waiters to notify.
                    if let Some(state) = other {
                        tabs.insert(tab_id, state);
                    }
                    Vec::new()
                }
            };
            if outcome.is_ok() {
                tabs.insert(
                    tab_id,
                    AttachState::Attached {
                        cmd_count: 1,
                        idle_since: None,
                    },
                );
            }
            waiters
        };

        match outcome {
            Ok(()) => {
                for waiter in waiters {
                    let _ = waiter.send(Ok(()));
                }
                Ok(CdpCommandGuard {
                    tracker: Arc::clone(self),
                    tab_id,
                })
            }
            Err(err) => {
                let surfaced = if err.code == ErrorCode::DebuggerAttachFailed {
                    err
                } else {
                    ToolError::new(ErrorCode::DebuggerAttachFailed, err.message)
                };
                for waiter in waiters {
                    let _ = waiter.send(Err(surfaced.clone()));
                }
                Err(surfaced)
            }
        }
    }

    fn end_command(&self, tab_id: u32, now: Instant) {
        let mut tabs = self.tabs.lock().expect("cdp tracker mutex poisoned");
        if let Some(AttachState::Attached { cmd_count, idle_since }) = tabs.get_mut(&tab_id) {
            *cmd_count = cmd_count.saturating_sub(1);
            if *cmd_count == 0 {
                *idle_since = Some(now);
            }
        }
    }

    /// Detach every tab idle past [`CDP_IDLE_DETACH`]. Tabs with commands in
    /// flight are left attached.
    pub async fn sweep_idle(&self, now: Instant) -> Vec<u32> {
        let expired: Vec<u32> = {
            let mut tabs = self.tabs.lock().expect("cdp tracker mutex poisoned");
            let expired: Vec<u32> = tabs
                .iter()
                .filter_map(|(tab, state)| match state {
                    AttachState::Attached {
                        cmd_count: 0,
                        idle_since: Some(since),
                    } if now.duration_since(*since) >= CDP_IDLE_DETACH => Some(*tab),
                    _ => None,
                })
                .collect();
            for tab in &expired {
                tabs.remove(tab);
            }
            expired
        };

        for &tab in &expired {
            if let Err(err) = self.backend.detach_debugger(tab).await {
                tracing::debug!(tab_id = tab, "idle debugger detach failed: {err}");
            }
        }
        expired
    }

    /// Drop attach state for a closed tab without calling the browser.
    pub fn forget_tab(&self, tab_id: u32) {
        self.tabs
            .lock()
            .expect("cdp tracker mutex poisoned")
            .remove(&tab_id);
    }

    /// Commands currently pinning `tab_id`, if attached.
    #[must_use]
    pub fn command_count(&self, tab_id: u32) -> Option<u32> {
        match self
            .tabs
            .lock()
            .expect("cdp tracker mutex poisoned")
            .get(&tab_id)
        {
            Some(AttachState::Attached { cmd_count, .. }) => Some(*cmd_count),
            _ => None,
        }
    }
}

/// RAII pin over an attached tab; dropping it ends the command.
pub struct CdpCommandGuard {
    tracker: Arc<CdpTracker>,
    tab_id: u32,
}

impl Drop for CdpCommandGuard {
    fn drop(&mut self) {
        self.tracker.end_command(self.tab_id, Instant::now());
    }
}
