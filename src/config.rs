//! Shared runtime configuration: socket path resolution and agent naming.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Well-known rendezvous socket between server and bridge.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/viyv-browser.sock";

/// Environment override for the socket path.
pub const SOCKET_ENV_VAR: &str = "VIYV_BROWSER_SOCKET";

/// Agent id used when the server is launched without `--agent-name`.
pub const DEFAULT_AGENT_NAME: &str = "default";

/// Bridge-side socket discovery: poll cadence and give-up deadline.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_secs(2);
pub const SOCKET_POLL_DEADLINE: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("socket path override must be absolute, got {0:?}")]
    RelativeSocketPath(PathBuf),
    #[error("agent name must not be empty")]
    EmptyAgentName,
}

/// Resolve the socket path from an explicit flag, the environment, or the
/// default, in that order of precedence.
pub fn resolve_socket_path(flag: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let path = flag
        .or_else(|| std::env::var_os(SOCKET_ENV_VAR).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    if !path.is_absolute() {
        return Err(ConfigError::RelativeSocketPath(path));
    }
    Ok(path)
}

/// Trim and validate an agent name; `None` falls back to the default.
pub fn normalize_agent_name(name: Option<&str>) -> Result<String, ConfigError> {
    let name = name.unwrap_or(DEFAULT_AGENT_NAME).trim();
    if name.is_empty() {
        return Err(ConfigError::EmptyAgentName);
    }
    Ok(name.to_string())
}
