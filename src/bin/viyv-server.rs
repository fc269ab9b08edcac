//! Server binary: binds the well-known unix socket, accepts the browser
//! extension (via the bridge), and exposes the tool catalogue core.
//!
//! The client-facing RPC surface lives in the embedding process; this
//! binary runs the transport core and reports catalogue and event activity
//! through structured logs.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tokio::sync::mpsc;

use viyv_browser::config;
use viyv_browser::logging;
use viyv_browser::server::{catalogue, ServerCore};

#[derive(Debug, Parser)]
#[command(name = "viyv-server", about = "Browser control server")]
struct Args {
    /// Default agent id for tool calls and subscriptions.
    #[arg(long)]
    agent_name: Option<String>,

    /// Override the rendezvous socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init_logging();
    logging::prune_old_logs();

    let args = Args::parse();
    let agent_name = match config::normalize_agent_name(args.agent_name.as_deref()) {
        Ok(name) => name,
        Err(err) => {
            eprintln!("viyv-server: {err}");
            return ExitCode::FAILURE;
        }
    };
    let socket_path = match config::resolve_socket_path(args.socket) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("viyv-server: {err}");
            return ExitCode::FAILURE;
        }
    };

    let listener = match ServerCore::bind_listener(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("viyv-server: cannot bind {}: {err}", socket_path.display());
            return ExitCode::FAILURE;
        }
    };

    let (notifier_tx, mut notifier_rx) = mpsc::unbounded_channel();
    let core = ServerCore::new(agent_name.clone(), notifier_tx);
    core.spawn_maintenance();

    let span = logging::session_span(&agent_name);
    let _enter = span.enter();
    tracing::info!(
        socket = %socket_path.display(),
        tools = catalogue().len(),
        "server listening for the browser extension"
    );

    tokio::spawn({
        let core = core.clone();
        async move { core.run_acceptor(listener).await }
    });
    tokio::spawn(async move {
        while let Some(notification) = notifier_rx.recv().await {
            tracing::info!(
                event_type = %notification.event_type,
                subscription_id = %notification.subscription_id,
                url = %notification.url,
                "browser event delivered"
            );
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("interrupt received, shutting down"),
        Err(err) => tracing::warn!("signal wait failed: {err}"),
    }
    core.shutdown();
    let _ = std::fs::remove_file(&socket_path);
    ExitCode::SUCCESS
}
