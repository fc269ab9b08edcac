//! The fixed tool catalogue the server exposes to its client.
//!
//! Each tool carries a stable name, a human description, and a JSON-schema
//! input description. Results travel back to the client as a
//! `content: [{type:'text', text:<JSON string>}]` block; worker-side tool
//! errors are embedded in the same shape as `{"error":{code,message}}`.

use serde::Serialize;
use serde_json::{json, Value};

use crate::protocol::ToolError;

/// One catalogue entry.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// One block of client-visible tool output.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// The client-facing shape of a completed tool call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ToolResponse {
    pub content: Vec<ToolContent>,
}

impl ToolResponse {
    /// Wrap a successful worker result verbatim.
    #[must_use]
    pub fn from_result(result: &Value) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: result.to_string(),
            }],
        }
    }

    /// Embed a worker-side tool error in the result envelope.
    #[must_use]
    pub fn from_tool_error(error: &ToolError) -> Self {
        Self {
            content: vec![ToolContent {
                kind: "text",
                text: json!({"error": {"code": error.code, "message": error.message}})
                    .to_string(),
            }],
        }
    }
}

/// Every tool the server advertises. `switch_browser` never reaches the
/// worker; the server intercepts it (see the acceptor).
#[must_use]
pub fn catalogue() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "navigate",
            description: "Navigate a tab to a URL and wait for the page to settle.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0, "description": "Target tab id"},
                    "url": {"type": "string", "description": "Absolute URL to load"}
                },
                "required": ["tabId", "url"]
            }),
        },
        ToolDescriptor {
            name: "tabs_context",
            description: "List the calling agent's tabs with their titles and URLs.",
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
        ToolDescriptor {
            name: "click",
            description: "Click an element by ref, or a point by viewport coordinate.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "ref": {"type": "string", "description": "Element ref from a prior find/read"},
                    "coordinate": {
                        "type": "array",
                        "prefixItems": [
                            {"type": "integer", "minimum": 0},
                            {"type": "integer", "minimum": 0}
                        ],
                        "description": "[x, y] viewport pixels, when no ref is given"
                    }
                },
                "required": ["tabId"]
            }),
        },
        ToolDescriptor {
            name: "form_input",
            description: "Type text into, or set the value of, a form element.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "ref": {"type": "string"},
                    "text": {"type": "string"}
                },
                "required": ["tabId", "ref", "text"]
            }),
        },
        ToolDescriptor {
            name: "screenshot",
            description: "Capture the visible viewport; the capture id can be re-used by upload_image.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "format": {"type": "string", "enum": ["png", "jpeg"], "description": "Defaults to png"}
                },
                "required": ["tabId"]
            }),
        },
        ToolDescriptor {
            name: "find",
            description: "Find elements matching a natural-language description; returns refs.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "query": {"type": "string"},
                    "maxResults": {"type": "integer", "minimum": 1, "maximum": 50}
                },
                "required": ["tabId", "query"]
            }),
        },
        ToolDescriptor {
            name: "get_page_text",
            description: "Extract the readable text of the page.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0}
                },
                "required": ["tabId"]
            }),
        },
        ToolDescriptor {
            name: "wait_for",
            description: "Wait until a selector appears, with a caller-supplied timeout.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "selector": {"type": "string"},
                    "timeout": {"type": "integer", "minimum": 0, "maximum": 600_000,
                                "description": "Milliseconds to wait before giving up"}
                },
                "required": ["tabId", "selector"]
            }),
        },
        ToolDescriptor {
            name: "read_console",
            description: "Read the tab's buffered console entries.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 500}
                },
                "required": ["tabId"]
            }),
        },
        ToolDescriptor {
            name: "read_network",
            description: "Read the tab's buffered network entries.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 500}
                },
                "required": ["tabId"]
            }),
        },
        ToolDescriptor {
            name: "upload_image",
            description: "Attach a previously captured screenshot to a file input by capture id.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tabId": {"type": "integer", "minimum": 0},
                    "ref": {"type": "string", "description": "File input element ref"},
                    "imageId": {"type": "string", "description": "Capture id from a prior screenshot"}
                },
                "required": ["tabId", "ref", "imageId"]
            }),
        },
        ToolDescriptor {
            name: "browser_event_subscribe",
            description: "Subscribe to browser events, optionally filtered by URL substring.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "eventTypes": {
                        "type": "array",
                        "items": {"type": "string", "enum": [
                            "browser.page_load",
                            "browser.navigation",
                            "browser.console",
                            "browser.network",
                            "browser.tab_closed"
                        ]},
                        "minItems": 1
                    },
                    "urlPattern": {"type": "string", "description": "Deliver only events whose URL contains this substring"}
                },
                "required": ["eventTypes"]
            }),
        },
        ToolDescriptor {
            name: "browser_event_unsubscribe",
            description: "Remove a previously created browser event subscription.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "subscriptionId": {"type": "string"}
                },
                "required": ["subscriptionId"]
            }),
        },
        ToolDescriptor {
            name: "switch_browser",
            description: "Drop the current browser connection and wait for a fresh one to attach.",
            input_schema: json!({
                "type": "object",
                "properties": {}
            }),
        },
    ]
}
