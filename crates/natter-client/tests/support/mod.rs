// Loopback mock server used by the connection tests.
#![allow(dead_code)]

use std::time::Duration;

use bytes::{Buf, BytesMut};
use natter_client::{ConnectionConfig, HandshakeTuning, Host, LifecycleEvent};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const IO_TIMEOUT: Duration = Duration::from_secs(3);

pub const BASIC_INFO: &str =
    r#"{"server_id":"mock-1","version":"2.10.0","go":"go1.21","host":"127.0.0.1","port":4222,"max_payload":1048576}"#;

pub struct MockServer {
    listener: TcpListener,
}

impl MockServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        Self { listener }
    }

    pub fn host(&self) -> Host {
        let addr = self.listener.local_addr().expect("local addr");
        Host::new("127.0.0.1", addr.port())
    }

    pub async fn accept(&self) -> Peer {
        let (stream, _) = timeout(IO_TIMEOUT, self.listener.accept())
            .await
            .expect("timed out waiting for client")
            .expect("accept");
        Peer {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Whether a client connects within `window`.
    pub async fn accepts_within(&self, window: Duration) -> bool {
        timeout(window, self.listener.accept()).await.is_ok()
    }
}

/// A host nobody listens on.
pub async fn unreachable_host() -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    Host::new("127.0.0.1", port)
}

pub fn config_for(hosts: impl IntoIterator<Item = Host>) -> ConnectionConfig {
    ConnectionConfig::new(hosts)
        .with_client_id("C1")
        .with_randomized_hosts(false)
        .with_handshake_tuning(HandshakeTuning {
            cycle_delay: Duration::from_millis(20),
            max_duration: Duration::from_millis(300),
            connect_timeout: Duration::from_secs(1),
        })
        .with_release_timeout(Duration::from_millis(500))
}

pub struct Peer {
    stream: TcpStream,
    buf: BytesMut,
}

impl Peer {
    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("peer write");
    }

    pub async fn send_info(&mut self, payload: &str) {
        self.send(format!("INFO {payload}\r\n").as_bytes()).await;
    }

    /// Sends INFO and returns the client's CONNECT options.
    pub async fn handshake(&mut self, info: &str) -> serde_json::Value {
        self.send_info(info).await;
        let line = self.read_line().await;
        let json = line.strip_prefix("CONNECT ").expect("CONNECT frame");
        serde_json::from_str(json).expect("connect json")
    }

    pub async fn read_line(&mut self) -> String {
        timeout(IO_TIMEOUT, async {
            loop {
                if let Some(pos) = find_crlf(&self.buf) {
                    let line = self.buf.split_to(pos);
                    self.buf.advance(2);
                    return String::from_utf8(line.to_vec()).expect("utf8 line");
                }
                let read = self.stream.read_buf(&mut self.buf).await.expect("peer read");
                assert!(read > 0, "client closed the socket");
            }
        })
        .await
        .expect("timed out waiting for a line")
    }

    pub async fn read_exact(&mut self, len: usize) -> Vec<u8> {
        timeout(IO_TIMEOUT, async {
            while self.buf.len() < len {
                let read = self.stream.read_buf(&mut self.buf).await.expect("peer read");
                assert!(read > 0, "client closed the socket");
            }
            self.buf.split_to(len).to_vec()
        })
        .await
        .expect("timed out waiting for bytes")
    }

    /// Reads one `PUB` frame and returns its control line and payload.
    pub async fn read_publish(&mut self) -> (String, Vec<u8>) {
        let line = self.read_line().await;
        assert!(line.starts_with("PUB "), "expected PUB, got {line:?}");
        let len: usize = line
            .rsplit(' ')
            .next()
            .and_then(|value| value.parse().ok())
            .expect("payload length");
        let mut payload = self.read_exact(len + 2).await;
        assert_eq!(&payload[len..], b"\r\n", "payload terminator");
        payload.truncate(len);
        (line, payload)
    }

    pub async fn assert_silent(&mut self, window: Duration) {
        assert!(self.buf.is_empty(), "unread bytes: {:?}", self.buf);
        match timeout(window, self.stream.read_buf(&mut self.buf)).await {
            Err(_) => {}
            Ok(Ok(0)) => panic!("client closed the socket"),
            Ok(Ok(_)) => panic!("unexpected bytes: {:?}", self.buf),
            Ok(Err(err)) => panic!("peer read failed: {err}"),
        }
    }

    /// Waits for the client to close without sending anything else.
    pub async fn expect_closed(&mut self) {
        assert!(self.buf.is_empty(), "unread bytes: {:?}", self.buf);
        let read = timeout(IO_TIMEOUT, self.stream.read_buf(&mut self.buf))
            .await
            .expect("timed out waiting for close");
        match read {
            Ok(0) => {}
            Ok(_) => panic!("unexpected bytes: {:?}", self.buf),
            Err(err) => assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset),
        }
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

pub async fn next_event(events: &mut mpsc::Receiver<LifecycleEvent>) -> LifecycleEvent {
    timeout(IO_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

pub async fn next_op<T>(ops: &mut mpsc::Receiver<T>) -> T {
    timeout(IO_TIMEOUT, ops.recv())
        .await
        .expect("timed out waiting for op")
        .expect("op channel closed")
}
