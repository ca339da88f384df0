//! Scripted nsqd for connection tests.
//!
//! The test drives the server side by hand: accept, answer the handshake,
//! read the client's commands one at a time and push frames back.

use super::protocol::{CLOSE_WAIT, HEARTBEAT, MAGIC_V2, MessageId, OK};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

const STEP_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct FakeNsqd {
    listener: TcpListener,
    address: String,
}

impl FakeNsqd {
    pub(crate) async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        Self { listener, address }
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Accepts the next client and completes magic + IDENTIFY.
    pub(crate) async fn accept(&self) -> Peer {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, self.listener.accept())
            .await
            .expect("no client connected")
            .unwrap();
        let (reader, writer) = stream.into_split();
        let mut peer = Peer {
            reader: BufReader::new(reader),
            writer,
        };
        let mut magic = [0u8; 4];
        peer.reader.read_exact(&mut magic).await.unwrap();
        assert_eq!(&magic, MAGIC_V2);
        assert_eq!(peer.command().await, "IDENTIFY");
        peer.respond(OK).await;
        peer
    }

    /// Whether a client connects within `wait`.
    pub(crate) async fn connects_within(&self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.listener.accept()).await.is_ok()
    }
}

/// Server side of one client connection.
pub(crate) struct Peer {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    /// Reads the next command line. Sized bodies (IDENTIFY, PUB) are consumed.
    pub(crate) async fn command(&mut self) -> String {
        tokio::time::timeout(STEP_TIMEOUT, self.read_command())
            .await
            .expect("client sent no command")
    }

    /// The next command, or `None` if nothing arrives within `wait`.
    pub(crate) async fn command_within(&mut self, wait: Duration) -> Option<String> {
        tokio::time::timeout(wait, self.read_command()).await.ok()
    }

    async fn read_command(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).await.unwrap();
        let line = line.trim_end_matches('\n').to_string();
        if line == "IDENTIFY" || line.starts_with("PUB ") {
            let size = self.reader.read_u32().await.unwrap() as usize;
            let mut body = vec![0u8; size];
            self.reader.read_exact(&mut body).await.unwrap();
        }
        line
    }

    async fn frame(&mut self, frame_type: u32, data: &[u8]) {
        let size = u32::try_from(data.len() + 4).unwrap();
        let mut raw = Vec::with_capacity(data.len() + 8);
        raw.extend_from_slice(&size.to_be_bytes());
        raw.extend_from_slice(&frame_type.to_be_bytes());
        raw.extend_from_slice(data);
        self.writer.write_all(&raw).await.unwrap();
    }

    pub(crate) async fn respond(&mut self, data: &[u8]) {
        self.frame(0, data).await;
    }

    pub(crate) async fn reject(&mut self, data: &[u8]) {
        self.frame(1, data).await;
    }

    /// Whether the client hangs up within `wait`.
    pub(crate) async fn closed_within(&mut self, wait: Duration) -> bool {
        matches!(
            tokio::time::timeout(wait, self.reader.read_u8()).await,
            Ok(Err(_))
        )
    }

    pub(crate) async fn heartbeat(&mut self) {
        self.respond(HEARTBEAT).await;
    }

    pub(crate) async fn close_wait(&mut self) {
        self.respond(CLOSE_WAIT).await;
    }

    pub(crate) async fn message(&mut self, id: &MessageId, body: &[u8]) {
        let mut data = Vec::with_capacity(26 + body.len());
        data.extend_from_slice(&0i64.to_be_bytes());
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(id);
        data.extend_from_slice(body);
        self.frame(2, &data).await;
    }

    /// Accepts a subscription: checks SUB, answers OK and returns the RDY line.
    pub(crate) async fn subscribed(&mut self, topic: &str, channel: &str) -> String {
        assert_eq!(self.command().await, format!("SUB {topic} {channel}"));
        self.respond(OK).await;
        self.command().await
    }

    /// Plays the server side of a clean consumer shutdown.
    pub(crate) async fn expect_close(&mut self) {
        assert_eq!(self.command().await, "RDY 0");
        assert_eq!(self.command().await, "CLS");
        self.close_wait().await;
    }
}

/// A printable 16-byte message id ending in `n`.
pub(crate) fn message_id(n: u8) -> MessageId {
    let mut id = *b"000000000000000_";
    id[15] = b'0' + n;
    id
}
