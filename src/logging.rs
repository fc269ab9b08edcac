//! Structured observability for the server and bridge binaries.
//!
//! Provides a layered `tracing` subscriber:
//! - **stderr** output for interactive use (respects `RUST_LOG`, default
//!   `warn`);
//! - **file appender** writing JSON lines to `~/.viyv/logs/viyv-browser.*`
//!   with daily rotation and bounded retention;
//! - **correlation spans** for agent sessions and individual tool requests.

use std::path::PathBuf;

use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

/// Log directory under the user's home.
const LOG_DIR_RELATIVE: &str = ".viyv/logs";

/// Log file prefix; the daily appender adds the date suffix.
const LOG_FILE_PREFIX: &str = "viyv-browser";

/// Daily log files retained after pruning.
const MAX_LOG_FILES: usize = 7;

/// Initialize the global subscriber with stderr + file layers.
///
/// Call once early in `main()`; panics if called twice.
pub fn init_logging() {
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(make_file_layer())
        .init();
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(LOG_DIR_RELATIVE))
}

fn make_file_layer<S>() -> Option<Box<dyn Layer<S> + Send + Sync>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let dir = log_dir()?;
    let _ = std::fs::create_dir_all(&dir);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // The guard must outlive the process; leaking it is the standard
    // pattern for a global non-blocking writer.
    std::mem::forget(guard);

    let layer = fmt::layer()
        .json()
        .with_target(true)
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));
    Some(layer.boxed())
}

/// Remove rotated log files beyond the retention bound. Called
/// opportunistically at startup; errors are ignored.
pub fn prune_old_logs() {
    let Some(dir) = log_dir() else { return };
    let Ok(entries) = std::fs::read_dir(&dir) else {
        return;
    };

    let mut log_files: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .collect();

    // Daily rotation suffixes sort chronologically by name.
    log_files.sort();
    if log_files.len() > MAX_LOG_FILES {
        let to_remove = log_files.len() - MAX_LOG_FILES;
        for path in &log_files[..to_remove] {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Top-level span for one agent session.
pub fn session_span(agent_id: &str) -> Span {
    tracing::info_span!("agent_session", agent_id = agent_id)
}

/// Request-scoped span for a single tool call.
pub fn request_span(tool: &str, request_id: &str) -> Span {
    tracing::info_span!("tool_request", tool = tool, request_id = request_id)
}
