//! Message connection behavior seen from the wire.
//!
//! To run these tests:
//! ```bash
//! cargo test --test connection_test
//! ```
mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{RECV_TIMEOUT, connection_pair, connection_with_raw_peer};
use langbridge::error::{ConnectionError, RpcError};
use langbridge::rpc::{
    CancelUndispatched, CancellationToken, CancellationTokenSource, ConnectionOptions,
    ConnectionState, NotificationMessage, PendingDelivery, ResponseError, error_codes,
};
use serde_json::{Value, json};
use tokio::sync::{Notify, mpsc};

#[tokio::test]
async fn test_responses_correlate_when_shuffled() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    connection.listen().unwrap();

    let mut calls = Vec::new();
    for name in ["first", "second", "third"] {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            connection
                .send_request("echo", Some(json!({"name": name})), None)
                .await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(peer.recv().await);
    }
    let ids: Vec<&Value> = requests.iter().map(|r| &r["id"]).collect();
    assert!(ids.iter().all(|id| id.is_i64()));
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);

    // Answer in reverse order, echoing each request's name.
    for request in requests.iter().rev() {
        peer.send(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": request["params"]["name"],
        }))
        .await;
    }

    let mut results = Vec::new();
    for call in calls {
        results.push(call.await.unwrap().unwrap());
    }
    assert_eq!(results, vec![json!("first"), json!("second"), json!("third")]);
    assert!(!connection.has_pending_response());
}

#[tokio::test]
async fn test_error_response_and_unknown_response_id() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    connection.listen().unwrap();

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_request("fail", None, None).await }
    });
    let request = peer.recv().await;
    assert!(request.get("params").is_none());

    // A response nobody waits for is dropped without disturbing the pending one.
    peer.send(&json!({"jsonrpc": "2.0", "id": 999, "result": true}))
        .await;
    peer.send(&json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": {"code": error_codes::CONTENT_MODIFIED, "message": "stale", "data": [1]},
    }))
    .await;

    let err = call.await.unwrap().unwrap_err();
    match err {
        RpcError::Response(error) => {
            assert_eq!(error.code, error_codes::CONTENT_MODIFIED);
            assert_eq!(error.message, "stale");
            assert_eq!(error.data, Some(json!([1])));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_inbound_dispatch_is_ordered_and_once() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let log = seen.clone();
    let _notes = connection
        .on_notification("note", move |params| {
            log.lock().unwrap().push(params.unwrap_or_default()["n"].clone());
            Ok(())
        })
        .unwrap();
    let log = seen.clone();
    let _requests = connection
        .on_request("ask", move |params, _| {
            log.lock().unwrap().push(params.unwrap_or_default()["n"].clone());
            async { Ok(Value::Null) }
        })
        .unwrap();
    connection.listen().unwrap();

    peer.send_batch(&[
        json!({"jsonrpc": "2.0", "method": "note", "params": {"n": 1}}),
        json!({"jsonrpc": "2.0", "method": "note", "params": {"n": 2}}),
        json!({"jsonrpc": "2.0", "id": "a", "method": "ask", "params": {"n": 3}}),
        json!({"jsonrpc": "2.0", "method": "note", "params": {"n": 4}}),
        json!({"jsonrpc": "2.0", "id": "b", "method": "ask", "params": {"n": 5}}),
    ])
    .await;

    let first = peer.recv().await;
    let second = peer.recv().await;
    assert_eq!(first["id"], "a");
    assert_eq!(second["id"], "b");
    assert!(peer.is_silent(Duration::from_millis(50)).await);

    assert_eq!(
        *seen.lock().unwrap(),
        vec![json!(1), json!(2), json!(3), json!(4), json!(5)]
    );
}

#[tokio::test]
async fn test_unhandled_notification_event() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = connection
        .on_unhandled_notification()
        .subscribe(move |notification: &NotificationMessage| {
            let _ = tx.send(notification.method.clone());
        });
    connection.listen().unwrap();

    peer.send(&json!({"jsonrpc": "2.0", "method": "nobody/listens"}))
        .await;
    let method = tokio::time::timeout(RECV_TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(method, "nobody/listens");
}

#[tokio::test(flavor = "current_thread")]
async fn test_cancel_before_dispatch_is_answered_without_running_handler() {
    let options = ConnectionOptions {
        strategy: Some(Arc::new(CancelUndispatched)),
        ..ConnectionOptions::default()
    };
    let (connection, mut peer) = connection_with_raw_peer(options);
    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    let _sub = connection
        .on_request("work", move |_, _| {
            *flag.lock().unwrap() = true;
            async { Ok(json!("done")) }
        })
        .unwrap();
    connection.listen().unwrap();

    // Both frames arrive in one read, so the request is still queued when
    // the cancellation is decoded.
    peer.send_batch(&[
        json!({"jsonrpc": "2.0", "id": 1, "method": "work"}),
        json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 1}}),
    ])
    .await;

    let response = peer.recv().await;
    assert_eq!(response["id"], 1);
    assert_eq!(response["error"]["code"], error_codes::REQUEST_CANCELLED);
    assert!(peer.is_silent(Duration::from_millis(50)).await);
    assert!(!*ran.lock().unwrap());
}

#[tokio::test(flavor = "current_thread")]
async fn test_cancel_before_dispatch_without_strategy_reaches_handler_cancelled() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    let _sub = connection
        .on_request("work", |_, token: CancellationToken| async move {
            if token.is_cancellation_requested() {
                Err(anyhow::Error::new(ResponseError::request_cancelled()))
            } else {
                Ok(json!("done"))
            }
        })
        .unwrap();
    connection.listen().unwrap();

    peer.send_batch(&[
        json!({"jsonrpc": "2.0", "id": 7, "method": "work"}),
        json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 7}}),
    ])
    .await;

    let response = peer.recv().await;
    assert_eq!(response["id"], 7);
    assert_eq!(response["error"]["code"], error_codes::REQUEST_CANCELLED);
}

#[tokio::test]
async fn test_cancel_after_handler_started() {
    let (client, server) = connection_pair(ConnectionOptions::default(), ConnectionOptions::default());
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let _sub = server
        .on_request("long", move |_, token: CancellationToken| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                token.cancelled().await;
                Err(anyhow::Error::new(ResponseError::request_cancelled()))
            }
        })
        .unwrap();
    client.listen().unwrap();
    server.listen().unwrap();

    let source = CancellationTokenSource::new();
    let call = tokio::spawn({
        let client = client.clone();
        let token = source.token();
        async move { client.send_request("long", None, Some(&token)).await }
    });

    tokio::time::timeout(RECV_TIMEOUT, started.notified())
        .await
        .unwrap();
    source.cancel();

    let err = tokio::time::timeout(RECV_TIMEOUT, call)
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert_eq!(err.code(), Some(error_codes::REQUEST_CANCELLED));
}

#[tokio::test]
async fn test_cancel_after_handler_started_answers_once() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    let started = Arc::new(Notify::new());
    let signal = started.clone();
    let _sub = connection
        .on_request("long", move |_, token: CancellationToken| {
            let signal = signal.clone();
            async move {
                signal.notify_one();
                token.cancelled().await;
                Err(anyhow::Error::new(ResponseError::request_cancelled()))
            }
        })
        .unwrap();
    connection.listen().unwrap();

    peer.send(&json!({"jsonrpc": "2.0", "id": 3, "method": "long"}))
        .await;
    tokio::time::timeout(RECV_TIMEOUT, started.notified())
        .await
        .unwrap();
    peer.send(&json!({"jsonrpc": "2.0", "method": "$/cancelRequest", "params": {"id": 3}}))
        .await;

    let response = peer.recv().await;
    assert_eq!(response["id"], 3);
    assert_eq!(response["error"]["code"], error_codes::REQUEST_CANCELLED);
    assert!(peer.is_silent(Duration::from_millis(100)).await);
}

#[tokio::test]
async fn test_cancelled_token_sends_cancel_request_once() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    connection.listen().unwrap();

    let source = CancellationTokenSource::new();
    let call = tokio::spawn({
        let connection = connection.clone();
        let token = source.token();
        async move { connection.send_request("slow", None, Some(&token)).await }
    });
    let request = peer.recv().await;
    source.cancel();
    source.cancel();

    let cancel = peer.recv().await;
    assert_eq!(cancel["method"], "$/cancelRequest");
    assert_eq!(cancel["params"]["id"], request["id"]);
    assert!(peer.is_silent(Duration::from_millis(50)).await);

    // The call keeps waiting for whatever the peer answers.
    peer.send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": "finished anyway"}))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), json!("finished anyway"));
}

#[tokio::test]
async fn test_dispose_rejects_pending_and_fails_fast() {
    let (connection, mut peer) = connection_with_raw_peer(ConnectionOptions::default());
    connection.listen().unwrap();
    let disposed = Arc::new(Mutex::new(0));
    let count = disposed.clone();
    let _sub = connection
        .on_dispose()
        .subscribe(move |_| *count.lock().unwrap() += 1);

    let mut calls = Vec::new();
    for _ in 0..3 {
        let connection = connection.clone();
        calls.push(tokio::spawn(async move {
            connection.send_request("pending", None, None).await
        }));
    }
    for _ in 0..3 {
        peer.recv().await;
    }

    connection.dispose();
    connection.dispose();
    assert_eq!(*disposed.lock().unwrap(), 1);
    assert_eq!(connection.state(), ConnectionState::Disposed);

    for call in calls {
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.code(), Some(error_codes::PENDING_RESPONSE_REJECTED));
    }

    let err = connection.send_request("late", None, None).await.unwrap_err();
    assert!(matches!(err, RpcError::Connection(ConnectionError::Disposed)));
    let err = connection.send_notification("late", None).await.unwrap_err();
    assert!(matches!(err, RpcError::Connection(ConnectionError::Disposed)));
    assert!(peer.is_silent(Duration::from_millis(100)).await);
}

struct Queued(Mutex<Vec<NotificationMessage>>);

impl PendingDelivery for Queued {
    fn take_pending(&self) -> Vec<NotificationMessage> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

#[tokio::test]
async fn test_pending_delivery_precedes_request() {
    let queued = Arc::new(Queued(Mutex::new(vec![
        NotificationMessage::new("sync/a", Some(json!({"v": 1}))),
        NotificationMessage::new("sync/b", None),
    ])));
    let options = ConnectionOptions {
        delivery: Some(queued.clone()),
        ..ConnectionOptions::default()
    };
    let (connection, mut peer) = connection_with_raw_peer(options);
    connection.listen().unwrap();

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.send_request("query", None, None).await }
    });

    assert_eq!(peer.recv().await["method"], "sync/a");
    assert_eq!(peer.recv().await["method"], "sync/b");
    let request = peer.recv().await;
    assert_eq!(request["method"], "query");

    peer.send(&json!({"jsonrpc": "2.0", "id": request["id"], "result": null}))
        .await;
    assert_eq!(call.await.unwrap().unwrap(), Value::Null);
    assert!(queued.take_pending().is_empty());
}
