//! The bridge joins the browser's framed stdio channel with the server's
//! unix socket.
//!
//! Records read from the host side are re-encoded as socket lines (with
//! opportunistic gzip wrapping) and forwarded; records read from the socket
//! are unwrapped and framed back to the host. While the socket is down,
//! host records queue in a bounded buffer — full means the oldest record is
//! dropped with an error log — and the bridge reconnects with exponential
//! backoff. The retry counter resets on the first record received after a
//! connect, not on the connect itself, which distinguishes a sustained
//! connection from a transient accept.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;

use crate::config::{SOCKET_POLL_DEADLINE, SOCKET_POLL_INTERVAL};
use crate::transport::framed::{encode_frame, FrameDecoder};
use crate::transport::line::{decode_record_line, encode_outbound_line, LineDecoder};

/// Bounded outage buffer: one thousand records, oldest dropped when full.
pub const MAX_BUFFERED_RECORDS: usize = 1000;

/// Reconnect backoff: `min(base · 2^retry, max)`.
pub const BASE_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("server socket {path} did not appear within {waited:?}")]
    SocketUnavailable { path: PathBuf, waited: Duration },
    #[error("host stdio error: {0}")]
    HostIo(std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Nil,
    Connecting,
    Open,
}

/// Point-in-time bridge introspection snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeStatus {
    pub socket: SocketState,
    pub retry: u32,
    pub buffered: usize,
    pub relayed_to_socket: u64,
    pub relayed_to_host: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub socket_path: PathBuf,
    pub max_buffered: usize,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub connect_poll: Duration,
    pub connect_deadline: Duration,
}

impl BridgeConfig {
    #[must_use]
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            max_buffered: MAX_BUFFERED_RECORDS,
            base_backoff: BASE_BACKOFF,
            max_backoff: MAX_BACKOFF,
            connect_poll: SOCKET_POLL_INTERVAL,
            connect_deadline: SOCKET_POLL_DEADLINE,
        }
    }
}

/// The relay itself. One instance drives one host connection for the life
/// of the process.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    state: AtomicU8,
    retry: AtomicU32,
    buffered: AtomicU64,
    relayed_to_socket: AtomicU64,
    relayed_to_host: AtomicU64,
    dropped: AtomicU64,
}

impl Bridge {
    #[must_use]
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(SocketState::Nil as u8),
            retry: AtomicU32::new(0),
            buffered: AtomicU64::new(0),
            relayed_to_socket: AtomicU64::new(0),
            relayed_to_host: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        let socket = match self.state.load(Ordering::Relaxed) {
            s if s == SocketState::Open as u8 => SocketState::Open,
            s if s == SocketState::Connecting as u8 => SocketState::Connecting,
            _ => SocketState::Nil,
        };
        BridgeStatus {
            socket,
            retry: self.retry.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed) as usize,
            relayed_to_socket: self.relayed_to_socket.load(Ordering::Relaxed),
            relayed_to_host: self.relayed_to_host.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: SocketState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    /// Poll for the server socket at startup. Absence past the deadline is
    /// fatal; the binary maps it to exit code 1.
    pub async fn wait_for_socket(&self) -> Result<UnixStream, BridgeError> {
        let started = Instant::now();
        loop {
            self.set_state(SocketState::Connecting);
            match UnixStream::connect(&self.config.socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    let waited = started.elapsed();
                    if waited >= self.config.connect_deadline {
                        self.set_state(SocketState::Nil);
                        return Err(BridgeError::SocketUnavailable {
                            path: self.config.socket_path.clone(),
                            waited,
                        });
                    }
                    tracing::debug!(
                        path = %self.config.socket_path.display(),
                        "server socket not ready yet: {err}"
                    );
                    tokio::time::sleep(self.config.connect_poll).await;
                }
            }
        }
    }

    /// Relay between the host streams and the socket until the host closes
    /// its side.
    pub async fn run<R, W>(&self, mut host_reader: R, mut host_writer: W) -> Result<(), BridgeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let initial = self.wait_for_socket().await?;
        let mut socket = Some(initial.into_split());
        let mut frames = FrameDecoder::new();
        let mut lines = LineDecoder::new();
        let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
        let mut awaiting_first_record = true;
        let mut hbuf = vec![0u8; 64 * 1024];
        let mut sbuf = vec![0u8; 64 * 1024];

        loop {
            match socket.as_mut() {
                Some((sock_read, sock_write)) => {
                    self.set_state(SocketState::Open);
                    let mut lost = false;
                    tokio::select! {
                        read = host_reader.read(&mut hbuf) => {
                            let n = read.map_err(BridgeError::HostIo)?;
                            if n == 0 {
                                tracing::info!("host closed its stream, shutting down");
                                return Ok(());
                            }
                            self.ingest_host_bytes(&hbuf[..n], &mut frames, &mut pending);
                            if !self.flush_pending(sock_write, &mut pending).await {
                                lost = true;
                            }
                        }
                        read = sock_read.read(&mut sbuf) => {
                            match read {
                                Ok(0) => {
                                    tracing::warn!("server closed the socket");
                                    lost = true;
                                }
                                Err(err) => {
                                    tracing::warn!("socket read error: {err}");
                                    lost = true;
                                }
                                Ok(n) => {
                                    for line in lines.push(&sbuf[..n]) {
                                        if awaiting_first_record {
                                            // First record after connect proves the
                                            // connection is real; reset the backoff.
                                            awaiting_first_record = false;
                                            self.retry.store(0, Ordering::Relaxed);
                                        }
                                        self.relay_line_to_host(&line, &mut host_writer).await?;
                                    }
                                }
                            }
                        }
                    }
                    if lost {
                        socket = None;
                        // Discard any partial line from the dead connection.
                        lines = LineDecoder::new();
                    }
                }
                None => {
                    self.set_state(SocketState::Nil);
                    let retry = self.retry.load(Ordering::Relaxed);
                    let backoff = backoff_delay(retry, &self.config);
                    tracing::info!(retry, backoff_ms = backoff.as_millis() as u64, "socket down, backing off before reconnect");

                    let delay = tokio::time::sleep(backoff);
                    tokio::pin!(delay);
                    loop {
                        tokio::select! {
                            read = host_reader.read(&mut hbuf) => {
                                let n = read.map_err(BridgeError::HostIo)?;
                                if n == 0 {
                                    tracing::info!("host closed its stream during outage, shutting down");
                                    return Ok(());
                                }
                                self.ingest_host_bytes(&hbuf[..n], &mut frames, &mut pending);
                            }
                            () = &mut delay => {
                                self.retry.fetch_add(1, Ordering::Relaxed);
                                self.set_state(SocketState::Connecting);
                                match UnixStream::connect(&self.config.socket_path).await {
                                    Ok(stream) => {
                                        awaiting_first_record = true;
                                        socket = Some(stream.into_split());
                                    }
                                    Err(err) => {
                                        tracing::debug!("reconnect attempt failed: {err}");
                                        self.set_state(SocketState::Nil);
                                    }
                                }
                                break;
                            }
                        }
                    }

                    let mut lost = false;
                    if let Some((_, sock_write)) = socket.as_mut() {
                        if !self.flush_pending(sock_write, &mut pending).await {
                            lost = true;
                        }
                    }
                    if lost {
                        socket = None;
                    }
                }
            }
        }
    }

    /// Decode host frames and queue the records for the socket.
    fn ingest_host_bytes(
        &self,
        bytes: &[u8],
        frames: &mut FrameDecoder,
        pending: &mut VecDeque<Vec<u8>>,
    ) {
        frames.extend(bytes);
        loop {
            match frames.next_frame() {
                Ok(Some(payload)) => {
                    let value: Value = match serde_json::from_slice(&payload) {
                        Ok(value) => value,
                        Err(err) => {
                            tracing::warn!("discarding host frame with invalid JSON: {err}");
                            continue;
                        }
                    };
                    let line = match encode_outbound_line(&value) {
                        Ok(line) => line,
                        Err(err) => {
                            tracing::warn!("failed to encode record for the socket: {err}");
                            continue;
                        }
                    };
                    if pending.len() >= self.config.max_buffered {
                        pending.pop_front();
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            capacity = self.config.max_buffered,
                            "bridge buffer full, dropping oldest record"
                        );
                    }
                    pending.push_back(line);
                }
                Ok(None) => break,
                Err(err) => {
                    tracing::error!("host frame decode error: {err}");
                    // Decoder discarded its buffer; resynchronize on
                    // whatever the host sends next.
                }
            }
        }
        self.buffered.store(pending.len() as u64, Ordering::Relaxed);
    }

    /// Write queued records to the socket, peeking before each write and
    /// popping only after it lands.
    async fn flush_pending(
        &self,
        sock_write: &mut OwnedWriteHalf,
        pending: &mut VecDeque<Vec<u8>>,
    ) -> bool {
        while let Some(front) = pending.front() {
            match sock_write.write_all(front).await {
                Ok(()) => {
                    pending.pop_front();
                    self.relayed_to_socket.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::warn!("socket write failed, keeping record queued: {err}");
                    self.buffered.store(pending.len() as u64, Ordering::Relaxed);
                    return false;
                }
            }
        }
        self.buffered.store(0, Ordering::Relaxed);
        true
    }

    /// Unwrap one socket line and frame it back to the host. Oversize
    /// records are reported and skipped; the channel stays open.
    async fn relay_line_to_host<W>(
        &self,
        line: &[u8],
        host_writer: &mut W,
    ) -> Result<(), BridgeError>
    where
        W: AsyncWrite + Unpin,
    {
        let value = match decode_record_line(line) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!("discarding undecodable socket record: {err}");
                return Ok(());
            }
        };
        let frame = match encode_frame(&value) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::error!("record too large for the host channel: {err}");
                return Ok(());
            }
        };
        host_writer
            .write_all(&frame)
            .await
            .map_err(BridgeError::HostIo)?;
        host_writer.flush().await.map_err(BridgeError::HostIo)?;
        self.relayed_to_host.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn backoff_delay(retry: u32, config: &BridgeConfig) -> Duration {
    let factor = 2u32.saturating_pow(retry.min(16));
    config
        .base_backoff
        .saturating_mul(factor)
        .min(config.max_backoff)
}
