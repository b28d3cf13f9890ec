//! An in-process language server for client tests.
//!
//! It answers `initialize`, `shutdown`, `textDocument/hover` and a
//! never-ending `test/slow` request, and records every request and
//! notification it sees in arrival order.

use std::time::Duration;

use langbridge::rpc::{
    CancellationToken, ConnectionOptions, MessageConnection, ResponseError, Subscription,
};
use serde_json::{Value, json};
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;

use super::RECV_TIMEOUT;

/// Method of the request that only finishes when cancelled.
pub const SLOW_METHOD: &str = "test/slow";

/// Typed form of [`SLOW_METHOD`] for `LanguageClient::request`.
pub enum SlowRequest {}

impl lsp_types::request::Request for SlowRequest {
    type Params = ();
    type Result = Value;
    const METHOD: &'static str = SLOW_METHOD;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Request,
    Notification,
}

/// One message the server received.
#[derive(Debug, Clone)]
pub struct Traffic {
    pub kind: Kind,
    pub method: String,
    pub params: Value,
}

pub struct FakeServer {
    pub connection: MessageConnection,
    traffic: mpsc::UnboundedReceiver<Traffic>,
    cancelled: mpsc::UnboundedReceiver<()>,
    _subscriptions: Vec<Subscription>,
}

/// Client-side halves of the stream to the fake server.
pub type ClientStreams = (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>);

impl FakeServer {
    /// Starts a listening fake server and returns the streams a client
    /// should connect with.
    pub fn start() -> (ClientStreams, Self) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let connection =
            MessageConnection::from_streams(server_read, server_write, ConnectionOptions::default());

        let (traffic_tx, traffic) = mpsc::unbounded_channel();
        let (cancelled_tx, cancelled) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();

        let tx = traffic_tx.clone();
        subscriptions.push(
            connection
                .on_request("initialize", move |params, _| {
                    record(&tx, Kind::Request, "initialize", params);
                    async {
                        Ok(json!({
                            "capabilities": {"hoverProvider": true, "textDocumentSync": 1},
                            "serverInfo": {"name": "fake-server", "version": "0.0.1"}
                        }))
                    }
                })
                .unwrap(),
        );

        let tx = traffic_tx.clone();
        subscriptions.push(
            connection
                .on_request("shutdown", move |params, _| {
                    record(&tx, Kind::Request, "shutdown", params);
                    async { Ok(Value::Null) }
                })
                .unwrap(),
        );

        let tx = traffic_tx.clone();
        subscriptions.push(
            connection
                .on_request("textDocument/hover", move |params, _| {
                    record(&tx, Kind::Request, "textDocument/hover", params);
                    async { Ok(json!({"contents": "hover text"})) }
                })
                .unwrap(),
        );

        let tx = traffic_tx.clone();
        subscriptions.push(
            connection
                .on_request(SLOW_METHOD, move |params, token: CancellationToken| {
                    record(&tx, Kind::Request, SLOW_METHOD, params);
                    let cancelled_tx = cancelled_tx.clone();
                    async move {
                        token.cancelled().await;
                        let _ = cancelled_tx.send(());
                        Err(anyhow::Error::new(ResponseError::request_cancelled()))
                    }
                })
                .unwrap(),
        );

        let tx = traffic_tx;
        subscriptions.push(
            connection
                .on_any_notification(move |method, params| {
                    record(&tx, Kind::Notification, &method, params);
                    Ok(())
                })
                .unwrap(),
        );

        connection.listen().unwrap();
        let (client_read, client_write) = tokio::io::split(client);
        (
            (client_read, client_write),
            Self {
                connection,
                traffic,
                cancelled,
                _subscriptions: subscriptions,
            },
        )
    }

    /// The next recorded message.
    pub async fn next(&mut self) -> Traffic {
        tokio::time::timeout(RECV_TIMEOUT, self.traffic.recv())
            .await
            .expect("timed out waiting for server traffic")
            .expect("server traffic channel closed")
    }

    /// Skips recorded messages until one with `method`.
    pub async fn next_method(&mut self, method: &str) -> Traffic {
        loop {
            let traffic = self.next().await;
            if traffic.method == method {
                return traffic;
            }
        }
    }

    /// True if nothing else is recorded within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        tokio::time::timeout(wait, self.traffic.recv()).await.is_err()
    }

    /// Waits until a `test/slow` handler observed its cancellation.
    pub async fn slow_request_cancelled(&mut self) {
        tokio::time::timeout(RECV_TIMEOUT, self.cancelled.recv())
            .await
            .expect("slow request was never cancelled")
            .expect("cancellation channel closed");
    }
}

fn record(tx: &mpsc::UnboundedSender<Traffic>, kind: Kind, method: &str, params: Option<Value>) {
    let _ = tx.send(Traffic {
        kind,
        method: method.to_string(),
        params: params.unwrap_or(Value::Null),
    });
}
