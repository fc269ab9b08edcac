//! Bridge binary: launched by the browser as its native-messaging host.
//!
//! Relays between the browser's length-prefixed stdio frames and the
//! server's unix socket. Exits 0 on host shutdown, 1 when the server socket
//! never appears within the discovery window.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use viyv_browser::bridge::{Bridge, BridgeConfig, BridgeError};
use viyv_browser::config;
use viyv_browser::logging;

#[derive(Debug, Parser)]
#[command(name = "viyv-bridge", about = "Browser native-messaging bridge")]
struct Args {
    /// Override the rendezvous socket path.
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    logging::init_logging();

    let args = Args::parse();
    let socket_path = match config::resolve_socket_path(args.socket) {
        Ok(path) => path,
        Err(err) => {
            eprintln!("viyv-bridge: {err}");
            return ExitCode::FAILURE;
        }
    };

    let bridge = Bridge::new(BridgeConfig::new(socket_path));
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            eprintln!("viyv-bridge: cannot install signal handler: {err}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = bridge.run(stdin, stdout) => match result {
            Ok(()) => {
                tracing::info!("bridge shut down with the host");
                ExitCode::SUCCESS
            }
            Err(err @ BridgeError::SocketUnavailable { .. }) => {
                tracing::error!("{err}");
                ExitCode::from(1)
            }
            Err(err) => {
                tracing::error!("bridge terminated: {err}");
                ExitCode::SUCCESS
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received, closing socket");
            ExitCode::SUCCESS
        }
        _ = sigterm.recv() => {
            tracing::info!("termination signal received, closing socket");
            ExitCode::SUCCESS
        }
    }
}
