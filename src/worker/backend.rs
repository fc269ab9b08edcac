//! The seam between the dispatch core and the browser's own APIs.
//!
//! Concrete browser actions (navigating, clicking, capturing, scraping) are
//! opaque to the transport core: the dispatcher validates, locks, and
//! attaches, then hands the call to whatever implements [`BrowserBackend`].
//! Tests plug in scripted fakes; the real extension plugs in the browser.

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::ToolError;

#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Attach the debugger to a tab. Failures surface as
    /// `DEBUGGER_ATTACH_FAILED`.
    async fn attach_debugger(&self, tab_id: u32) -> Result<(), ToolError>;

    /// Detach the debugger from a tab. Called on idle timeout; failures are
    /// logged, not surfaced.
    async fn detach_debugger(&self, tab_id: u32) -> Result<(), ToolError>;

    /// Execute one tool action and produce its opaque JSON result.
    async fn execute(&self, tool: &str, input: &Value) -> Result<Value, ToolError>;

    /// Close a set of tabs, used when an agent's group is torn down.
    async fn close_tabs(&self, tabs: Vec<u32>);
}
