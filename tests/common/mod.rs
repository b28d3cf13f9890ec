//! Common test helpers and utilities.

#![allow(dead_code)]

pub mod fake_server;

use std::time::Duration;

use langbridge::rpc::{ConnectionOptions, MessageBuffer, MessageConnection};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

/// How long a test waits for traffic before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Frames a JSON value the way a peer puts it on the wire.
pub fn frame(value: &Value) -> Vec<u8> {
    let body = value.to_string();
    let mut wire = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    wire.extend_from_slice(body.as_bytes());
    wire
}

/// Two connections wired to each other; neither is listening yet.
pub fn connection_pair(
    left: ConnectionOptions,
    right: ConnectionOptions,
) -> (MessageConnection, MessageConnection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    (
        MessageConnection::from_streams(a_read, a_write, left),
        MessageConnection::from_streams(b_read, b_write, right),
    )
}

/// A connection whose peer is driven byte by byte from the test.
pub fn connection_with_raw_peer(options: ConnectionOptions) -> (MessageConnection, RawPeer) {
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let (read, write) = tokio::io::split(local);
    let connection = MessageConnection::from_streams(read, write, options);
    (connection, RawPeer::new(remote))
}

/// The far end of a duplex stream, speaking framed JSON by hand.
pub struct RawPeer {
    read: ReadHalf<DuplexStream>,
    write: WriteHalf<DuplexStream>,
    buffer: MessageBuffer,
    next_length: Option<usize>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> Self {
        let (read, write) = tokio::io::split(stream);
        Self {
            read,
            write,
            buffer: MessageBuffer::new(),
            next_length: None,
        }
    }

    pub async fn send(&mut self, value: &Value) {
        self.send_raw(&frame(value)).await;
    }

    /// Writes several messages with a single write call.
    pub async fn send_batch(&mut self, values: &[Value]) {
        let wire: Vec<u8> = values.iter().flat_map(frame).collect();
        self.send_raw(&wire).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.write.write_all(bytes).await.expect("peer write failed");
        self.write.flush().await.expect("peer flush failed");
    }

    /// Receives the next framed message, failing the test after
    /// [`RECV_TIMEOUT`].
    pub async fn recv(&mut self) -> Value {
        tokio::time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a message")
    }

    async fn recv_inner(&mut self) -> Value {
        loop {
            if self.next_length.is_none() {
                if let Some(headers) = self.buffer.try_read_headers(true).expect("bad header") {
                    let length = headers
                        .get("content-length")
                        .expect("missing Content-Length")
                        .parse()
                        .expect("bad Content-Length");
                    self.next_length = Some(length);
                }
            }
            if let Some(length) = self.next_length {
                if let Some(body) = self.buffer.try_read_body(length) {
                    self.next_length = None;
                    return serde_json::from_slice(&body).expect("body is not JSON");
                }
            }

            let mut chunk = [0u8; 4096];
            let n = self.read.read(&mut chunk).await.expect("peer read failed");
            assert!(n > 0, "connection closed while waiting for a message");
            self.buffer.append(&chunk[..n]);
        }
    }

    /// Receives messages until one with `method`, returning it.
    pub async fn recv_method(&mut self, method: &str) -> Value {
        loop {
            let message = self.recv().await;
            if message["method"] == method {
                return message;
            }
        }
    }

    /// True if nothing arrives within `wait`.
    pub async fn is_silent(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.recv_inner()).await.is_err()
    }

    /// Drops the write half so the connection sees end of stream.
    pub fn into_read_half(self) -> ReadHalf<DuplexStream> {
        self.read
    }
}
