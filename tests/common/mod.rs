//! Shared harness for server-side integration tests: a real unix-socket
//! server core plus a scripted fake extension on the other end.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use viyv_browser::protocol::Record;
use viyv_browser::server::{EventNotification, ServerCore};
use viyv_browser::transport::line::{decode_record_line, encode_record_line, LineDecoder};

pub struct TestServer {
    pub core: Arc<ServerCore>,
    pub socket_path: PathBuf,
    pub notifications: mpsc::UnboundedReceiver<EventNotification>,
    _dir: tempfile::TempDir,
}

/// Bind a server core on a temp socket and start its acceptor.
pub fn start_server(agent_name: &str) -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir for socket");
    let socket_path = dir.path().join("viyv-test.sock");
    let listener = ServerCore::bind_listener(&socket_path).expect("bind test socket");
    let (tx, notifications) = mpsc::unbounded_channel();
    let core = ServerCore::new(agent_name, tx);
    tokio::spawn({
        let core = core.clone();
        async move { core.run_acceptor(listener).await }
    });
    TestServer {
        core,
        socket_path,
        notifications,
        _dir: dir,
    }
}

/// Scripted stand-in for the bridge + extension side of the socket.
pub struct FakeExtension {
    stream: UnixStream,
    decoder: LineDecoder,
    queued: VecDeque<Record>,
}

impl FakeExtension {
    pub async fn connect(socket_path: &PathBuf) -> Self {
        let stream = UnixStream::connect(socket_path)
            .await
            .expect("fake extension connects");
        Self {
            stream,
            decoder: LineDecoder::new(),
            queued: VecDeque::new(),
        }
    }

    /// Next decoded record from the server; `None` on EOF.
    pub async fn next_record(&mut self) -> Option<Record> {
        loop {
            if let Some(record) = self.queued.pop_front() {
                return Some(record);
            }
            let mut buf = vec![0u8; 64 * 1024];
            let n = self.stream.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            for line in self.decoder.push(&buf[..n]) {
                let value = decode_record_line(&line).expect("server lines decode");
                if let Some(record) = Record::from_value(value).expect("server records parse") {
                    self.queued.push_back(record);
                }
            }
        }
    }

    pub async fn send(&mut self, record: &Record) {
        let line = encode_record_line(record).expect("encode record line");
        self.send_raw(&line).await;
    }

    /// Write raw bytes; errors are ignored so tests can exercise the
    /// replaced-socket path.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        let _ = self.stream.write_all(bytes).await;
    }

    /// Consume the `session_init` the server pushes on accept.
    pub async fn expect_session_init(&mut self) -> Record {
        let record = self
            .next_record()
            .await
            .expect("server pushes session_init on accept");
        assert!(
            matches!(record, Record::SessionInit(_)),
            "first record after accept must be session_init, got {record:?}"
        );
        record
    }
}
