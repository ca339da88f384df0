//! One TCP connection to nsqd.

use super::protocol::{self, CLOSE_WAIT, Command, Frame, Identify, MAGIC_V2, OK};
use crate::queue::QueueError;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Maximum time to wait for the TCP connect and handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames buffered between the reader task and the connection owner.
const FRAME_BUFFER: usize = 32;

/// Connected and identified nsqd socket.
pub(crate) struct Connection {
    address: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    buf: BytesMut,
}

impl Connection {
    /// Connects, sends the protocol magic and identifies.
    pub(crate) async fn open(address: &str, identify: &Identify) -> Result<Self, QueueError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
            .await
            .map_err(|_| QueueError::Protocol(format!("connect to {address} timed out")))??;
        stream.set_nodelay(true)?;
        let (reader, mut writer) = stream.into_split();
        writer.write_all(MAGIC_V2).await?;

        let mut conn = Self {
            address: address.to_string(),
            reader: BufReader::new(reader),
            writer,
            buf: BytesMut::with_capacity(1024),
        };
        conn.send(&Command::Identify(identify)).await?;
        tokio::time::timeout(CONNECT_TIMEOUT, conn.expect_ok())
            .await
            .map_err(|_| QueueError::Protocol(format!("identify with {address} timed out")))??;
        Ok(conn)
    }

    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    /// Writes and flushes a command.
    pub(crate) async fn send(&mut self, command: &Command<'_>) -> Result<(), QueueError> {
        self.buf.clear();
        command.encode(&mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Reads frames until the reply to the last command, answering heartbeats.
    pub(crate) async fn expect_ok(&mut self) -> Result<(), QueueError> {
        loop {
            match protocol::read_frame(&mut self.reader).await? {
                frame if frame.is_heartbeat() => self.send(&Command::Nop).await?,
                Frame::Response(data) if data.as_ref() == OK => return Ok(()),
                Frame::Response(data) => {
                    return Err(QueueError::Protocol(format!(
                        "unexpected response '{}'",
                        String::from_utf8_lossy(&data)
                    )));
                },
                Frame::Error(data) => {
                    return Err(QueueError::Rejected(
                        String::from_utf8_lossy(&data).into_owned(),
                    ));
                },
                Frame::Message(_) => {
                    return Err(QueueError::Protocol(
                        "message frame on a connection without a subscription".into(),
                    ));
                },
            }
        }
    }

    /// Sends `CLS` and waits briefly for `CLOSE_WAIT`.
    pub(crate) async fn close(mut self) {
        if self.send(&Command::Cls).await.is_err() {
            return;
        }
        let wait = async {
            loop {
                match protocol::read_frame(&mut self.reader).await {
                    Ok(Frame::Response(data)) if data.as_ref() == CLOSE_WAIT => break,
                    Ok(_) => {},
                    Err(_) => break,
                }
            }
        };
        let _ = tokio::time::timeout(CONNECT_TIMEOUT, wait).await;
    }

    /// Moves frame reading to a dedicated task.
    ///
    /// The returned receiver yields frames until the socket fails or closes;
    /// the final item is the error that ended the stream, if any.
    pub(crate) fn split(
        self,
    ) -> (
        Writer,
        mpsc::Receiver<Result<Frame, QueueError>>,
        JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let mut reader = self.reader;
        let task = tokio::spawn(async move {
            loop {
                let result = protocol::read_frame(&mut reader).await;
                let failed = result.is_err();
                if tx.send(result).await.is_err() || failed {
                    break;
                }
            }
        });
        let writer = Writer {
            writer: self.writer,
            buf: self.buf,
        };
        (writer, rx, task)
    }
}

/// Write half of a split connection.
pub(crate) struct Writer {
    writer: OwnedWriteHalf,
    buf: BytesMut,
}

impl Writer {
    pub(crate) async fn send(&mut self, command: &Command<'_>) -> Result<(), QueueError> {
        self.buf.clear();
        command.encode(&mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
