//! The message connection.
//!
//! A [`MessageConnection`] ties a [`MessageReader`] and a [`MessageWriter`]
//! together and implements JSON-RPC on top of them:
//!
//! - outbound requests get connection-scoped integer ids and are correlated
//!   with their responses through a pending map;
//! - inbound messages are appended to an ordered dispatch queue that a single
//!   dispatcher task drains one message per turn;
//! - request handlers run on their own tasks with a cancellation token that a
//!   `$/cancelRequest` from the peer can trigger.
//!
//! `$/cancelRequest` is inspected as soon as it is decoded. If its target is
//! still queued and a [`ConnectionStrategy`] answers it, the request never
//! reaches a handler.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;

use super::cancellation::{CancellationToken, CancellationTokenSource};
use super::events::{Emitter, Subscription, lock};
use super::handlers::{
    self, HandlerTable, NotificationHandler, ProgressHandler, RequestFuture, StarNotificationHandler,
};
use super::messages::{
    error_codes, CancelParams, Incoming, LogTraceParams, Message, NotificationMessage,
    ParameterStructures, ProgressParams, ProgressToken, RequestId, RequestMessage, ResponseError,
    ResponseMessage, SetTraceParams, CANCEL_REQUEST_METHOD, LOG_TRACE_METHOD, PROGRESS_METHOD,
    SET_TRACE_METHOD,
};
use super::reader::{MessageReader, ReaderOptions, StreamMessageReader};
use super::trace::{MessageTracer, Trace, TraceFormat, Tracer};
use super::writer::{MessageWriter, StreamMessageWriter, WriteErrorEvent, WriterOptions};
use crate::error::{ConnectionError, ReadError, RpcError};

/// Decides how a cancelled request that was never dispatched is answered.
pub trait ConnectionStrategy: Send + Sync {
    /// Returns the response to send in place of running the request, or
    /// `None` to dispatch it normally.
    fn cancel_undispatched(&self, request: &RequestMessage) -> Option<ResponseMessage>;
}

/// Answers cancelled, undispatched requests with `RequestCancelled`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CancelUndispatched;

impl ConnectionStrategy for CancelUndispatched {
    fn cancel_undispatched(&self, request: &RequestMessage) -> Option<ResponseMessage> {
        Some(ResponseMessage::failure(
            Some(request.id.clone()),
            ResponseError::request_cancelled(),
        ))
    }
}

/// Yields notifications that must reach the peer before the next outbound
/// message.
pub trait PendingDelivery: Send + Sync {
    fn take_pending(&self) -> Vec<NotificationMessage>;
}

#[derive(Clone, Default)]
pub struct ConnectionOptions {
    pub strategy: Option<Arc<dyn ConnectionStrategy>>,
    pub delivery: Option<Arc<dyn PendingDelivery>>,
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("strategy", &self.strategy.is_some())
            .field("delivery", &self.delivery.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Listening,
    Closed,
    Disposed,
}

/// Transport failure surfaced by [`MessageConnection::on_error`].
#[derive(Debug, Clone)]
pub enum ConnectionErrorEvent {
    Read(Arc<ReadError>),
    Write(WriteErrorEvent),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TraceOptions {
    pub format: TraceFormat,
    /// Also send `$/setTrace` so the peer adjusts its own trace level.
    pub send_notification: bool,
}

struct PendingResponse {
    method: String,
    sent: Instant,
    tx: oneshot::Sender<Result<Value, ResponseError>>,
}

enum Queued {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
    Invalid(Value),
}

struct Shared {
    state: ConnectionState,
    next_request_id: i64,
    next_notification_key: u64,
    next_unknown_response_key: u64,
    queue: VecDeque<(String, Queued)>,
    drain_scheduled: bool,
    pending: HashMap<String, PendingResponse>,
    live_tokens: HashMap<String, CancellationTokenSource>,
    known_cancelled: HashSet<String>,
    handlers: HandlerTable,
}

#[derive(Default)]
struct ConnectionEvents {
    error: Emitter<ConnectionErrorEvent>,
    close: Emitter<()>,
    dispose: Emitter<()>,
    unhandled_notification: Emitter<NotificationMessage>,
    unhandled_progress: Emitter<ProgressParams>,
}

struct Inner {
    shared: Mutex<Shared>,
    reader: Box<dyn MessageReader>,
    writer: Box<dyn MessageWriter>,
    options: ConnectionOptions,
    tracer: Mutex<Arc<MessageTracer>>,
    wake: Arc<Notify>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    transport_subscriptions: Mutex<Vec<Subscription>>,
    events: ConnectionEvents,
}

/// A JSON-RPC connection over a reader and a writer. Cloning yields another
/// handle to the same connection.
#[derive(Clone)]
pub struct MessageConnection {
    inner: Arc<Inner>,
}

impl fmt::Debug for MessageConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageConnection")
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl MessageConnection {
    pub fn new(
        reader: impl MessageReader + 'static,
        writer: impl MessageWriter + 'static,
        options: ConnectionOptions,
    ) -> Self {
        let inner = Arc::new(Inner {
            shared: Mutex::new(Shared {
                state: ConnectionState::New,
                next_request_id: 0,
                next_notification_key: 0,
                next_unknown_response_key: 0,
                queue: VecDeque::new(),
                drain_scheduled: false,
                pending: HashMap::new(),
                live_tokens: HashMap::new(),
                known_cancelled: HashSet::new(),
                handlers: HandlerTable::default(),
            }),
            reader: Box::new(reader),
            writer: Box::new(writer),
            options,
            tracer: Mutex::new(Arc::new(MessageTracer::default())),
            wake: Arc::new(Notify::new()),
            dispatcher: Mutex::new(None),
            transport_subscriptions: Mutex::new(Vec::new()),
            events: ConnectionEvents::default(),
        });
        Inner::watch_transport(&inner);
        Self { inner }
    }

    /// Builds a connection over a pair of byte streams.
    pub fn from_streams<R, W>(input: R, output: W, options: ConnectionOptions) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::from_streams_with(
            input,
            output,
            ReaderOptions::default(),
            WriterOptions::default(),
            options,
        )
    }

    pub fn from_streams_with<R, W>(
        input: R,
        output: W,
        reader_options: ReaderOptions,
        writer_options: WriterOptions,
        options: ConnectionOptions,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self::new(
            StreamMessageReader::with_options(input, reader_options),
            StreamMessageWriter::with_options(output, writer_options),
            options,
        )
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner.shared).state
    }

    /// Starts reading from the peer and dispatching inbound messages.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed, disposed or already listening, or
    /// if its reader was already started elsewhere. In the last case the
    /// connection stays `New`.
    pub fn listen(&self) -> Result<(), ConnectionError> {
        {
            let mut shared = lock(&self.inner.shared);
            match shared.state {
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Disposed => return Err(ConnectionError::Disposed),
                ConnectionState::Listening => return Err(ConnectionError::AlreadyListening),
                ConnectionState::New => shared.state = ConnectionState::Listening,
            }
        }

        let weak = Arc::downgrade(&self.inner);
        let started = self.inner.reader.listen(Box::new(move |value| {
            if let Some(inner) = weak.upgrade() {
                inner.on_data(value);
            }
        }));
        if let Err(e) = started {
            tracing::error!("failed to start reading: {e}");
            let mut shared = lock(&self.inner.shared);
            if shared.state == ConnectionState::Listening {
                shared.state = ConnectionState::New;
            }
            return Err(ConnectionError::ReaderUnavailable);
        }

        // Messages read before this point wait in the queue; `wake` keeps the permit.
        let handle = tokio::spawn(dispatch_loop(
            Arc::downgrade(&self.inner),
            self.inner.wake.clone(),
        ));
        *lock(&self.inner.dispatcher) = Some(handle);
        Ok(())
    }

    /// Sends a request and waits for the peer's response.
    ///
    /// If `token` is cancelled while waiting, `$/cancelRequest` is sent once
    /// and the call keeps waiting for whatever the peer answers. Dropping the
    /// returned future forgets the request.
    ///
    /// # Errors
    ///
    /// Fails fast if the connection is not listening, closed or disposed.
    /// Otherwise returns the peer's error response, or `MessageWriteError`
    /// if the request could not be written.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        token: Option<&CancellationToken>,
    ) -> Result<Value, RpcError> {
        self.inner.check_open(true)?;
        self.inner.deliver_pending().await;

        let (id, mut rx) = {
            let mut shared = lock(&self.inner.shared);
            // The hook may have awaited writes; the connection can be gone by now.
            match shared.state {
                ConnectionState::Closed => return Err(ConnectionError::Closed.into()),
                ConnectionState::Disposed => return Err(ConnectionError::Disposed.into()),
                ConnectionState::New | ConnectionState::Listening => {}
            }
            shared.next_request_id += 1;
            let id = shared.next_request_id;
            let (tx, rx) = oneshot::channel();
            shared.pending.insert(
                id.to_string(),
                PendingResponse {
                    method: method.to_string(),
                    sent: Instant::now(),
                    tx,
                },
            );
            (id, rx)
        };
        let _pending = PendingGuard {
            inner: &self.inner,
            key: id.to_string(),
        };

        let request = RequestMessage::new(id, method, params);
        self.inner.tracer().sending_request(&request);
        if let Err(e) = self.inner.writer.write(&Message::Request(request)).await {
            return Err(ResponseError::message_write_error(format!(
                "Sending request {method} failed: {e}"
            ))
            .into());
        }

        let outcome = match token {
            None => rx.await,
            Some(token) => {
                tokio::select! {
                    biased;
                    outcome = &mut rx => outcome,
                    () = token.cancelled() => {
                        self.inner.send_cancel(RequestId::Number(id)).await;
                        rx.await
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(error.into()),
            Err(_) => Err(ConnectionError::Closed.into()),
        }
    }

    /// Sends a request built from positional call arguments.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not fit `structures`, otherwise as
    /// [`MessageConnection::send_request`].
    pub async fn send_request_args(
        &self,
        method: &str,
        structures: ParameterStructures,
        args: Vec<Value>,
        token: Option<&CancellationToken>,
    ) -> Result<Value, RpcError> {
        let params = structures.compute(args)?;
        self.send_request(method, params, token).await
    }

    /// Sends a notification.
    ///
    /// # Errors
    ///
    /// Fails fast if the connection is closed or disposed; returns
    /// `MessageWriteError` if the write fails.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), RpcError> {
        self.inner.check_open(false)?;
        self.inner.deliver_pending().await;
        let notification = NotificationMessage::new(method, params);
        self.inner.write_notification(notification).await
    }

    /// Sends a notification built from positional call arguments.
    ///
    /// # Errors
    ///
    /// Fails if the arguments do not fit `structures`, otherwise as
    /// [`MessageConnection::send_notification`].
    pub async fn send_notification_args(
        &self,
        method: &str,
        structures: ParameterStructures,
        args: Vec<Value>,
    ) -> Result<(), RpcError> {
        let params = structures.compute(args)?;
        self.send_notification(method, params).await
    }

    /// Sends `$/progress` for `token`.
    ///
    /// # Errors
    ///
    /// As [`MessageConnection::send_notification`].
    pub async fn send_progress(
        &self,
        token: ProgressToken,
        value: impl Serialize,
    ) -> Result<(), RpcError> {
        let params = ProgressParams {
            token,
            value: serde_json::to_value(value)?,
        };
        self.send_notification(PROGRESS_METHOD, Some(serde_json::to_value(params)?))
            .await
    }

    /// Writes whatever the pending-delivery hook holds.
    pub async fn flush_pending_deliveries(&self) {
        self.inner.deliver_pending().await;
    }

    pub fn has_pending_response(&self) -> bool {
        !lock(&self.inner.shared).pending.is_empty()
    }

    /// Installs a handler for `method`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_request<F, Fut>(&self, method: &str, handler: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.on_request_with(method, ParameterStructures::Auto, handler)
    }

    /// Like [`MessageConnection::on_request`], rejecting params that do not
    /// match `structures` with `InvalidParams`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_request_with<F, Fut>(
        &self,
        method: &str,
        structures: ParameterStructures,
        handler: F,
    ) -> Result<Subscription, ConnectionError>
    where
        F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = handlers::request_handler(handler);
        let id = {
            let mut shared = self.inner.registrable()?;
            let entry = shared.handlers.register(structures, handler);
            let id = entry.id;
            shared.handlers.requests.insert(method.to_string(), entry);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let method = method.to_string();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                handlers::remove_if(&mut lock(&inner.shared).handlers.requests, &method, id);
            }
        }))
    }

    /// Installs the handler for requests without an exact handler.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_any_request<F, Fut>(&self, handler: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(String, Option<Value>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler = handlers::star_request_handler(handler);
        let id = {
            let mut shared = self.inner.registrable()?;
            let entry = shared.handlers.register(ParameterStructures::Auto, handler);
            let id = entry.id;
            shared.handlers.star_request = Some(entry);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                handlers::take_if(&mut lock(&inner.shared).handlers.star_request, id);
            }
        }))
    }

    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_notification<F>(&self, method: &str, handler: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_notification_with(method, ParameterStructures::Auto, handler)
    }

    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_notification_with<F>(
        &self,
        method: &str,
        structures: ParameterStructures,
        handler: F,
    ) -> Result<Subscription, ConnectionError>
    where
        F: Fn(Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: NotificationHandler = Arc::new(handler);
        let id = {
            let mut shared = self.inner.registrable()?;
            let entry = shared.handlers.register(structures, handler);
            let id = entry.id;
            shared.handlers.notifications.insert(method.to_string(), entry);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        let method = method.to_string();
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                handlers::remove_if(&mut lock(&inner.shared).handlers.notifications, &method, id);
            }
        }))
    }

    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_any_notification<F>(&self, handler: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(String, Option<Value>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handler: StarNotificationHandler = Arc::new(handler);
        let id = {
            let mut shared = self.inner.registrable()?;
            let entry = shared.handlers.register(ParameterStructures::Auto, handler);
            let id = entry.id;
            shared.handlers.star_notification = Some(entry);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                handlers::take_if(&mut lock(&inner.shared).handlers.star_notification, id);
            }
        }))
    }

    /// Routes `$/progress` for `token` to `handler`. A token has at most one
    /// handler; registering again replaces it.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionError::Disposed`] on a disposed connection.
    pub fn on_progress<F>(&self, token: ProgressToken, handler: F) -> Result<Subscription, ConnectionError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let handler: ProgressHandler = Arc::new(handler);
        let id = {
            let mut shared = self.inner.registrable()?;
            let entry = shared.handlers.register(ParameterStructures::Auto, handler);
            let id = entry.id;
            shared.handlers.progress.insert(token.clone(), entry);
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                handlers::remove_if(&mut lock(&inner.shared).handlers.progress, &token, id);
            }
        }))
    }

    pub fn on_error(&self) -> &Emitter<ConnectionErrorEvent> {
        &self.inner.events.error
    }

    pub fn on_close(&self) -> &Emitter<()> {
        &self.inner.events.close
    }

    pub fn on_dispose(&self) -> &Emitter<()> {
        &self.inner.events.dispose
    }

    pub fn on_unhandled_notification(&self) -> &Emitter<NotificationMessage> {
        &self.inner.events.unhandled_notification
    }

    pub fn on_unhandled_progress(&self) -> &Emitter<ProgressParams> {
        &self.inner.events.unhandled_progress
    }

    /// Changes the trace level and sink.
    ///
    /// # Errors
    ///
    /// Only fails if `$/setTrace` was requested and could not be sent.
    pub async fn trace(
        &self,
        level: Trace,
        sink: Arc<dyn Tracer>,
        options: TraceOptions,
    ) -> Result<(), RpcError> {
        *lock(&self.inner.tracer) = Arc::new(MessageTracer::new(level, options.format, sink));
        if options.send_notification && self.state() == ConnectionState::Listening {
            let params = serde_json::to_value(SetTraceParams { value: level })?;
            self.send_notification(SET_TRACE_METHOD, Some(params)).await?;
        }
        Ok(())
    }

    /// Waits for queued writes and shuts the output stream down.
    pub async fn end(&self) {
        self.inner.writer.end().await;
    }

    /// Tears the connection down. Pending requests fail with
    /// `PendingResponseRejected`, running handlers see their tokens
    /// cancelled, and every handler and listener is dropped. Idempotent.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

/// Removes a pending entry when the request future finishes or is dropped.
struct PendingGuard<'a> {
    inner: &'a Inner,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.shared).pending.remove(&self.key);
    }
}

/// What to do with a `$/cancelRequest` that just arrived.
enum EarlyCancel {
    Queue,
    Answered,
    Live(CancellationTokenSource),
}

enum RequestTarget {
    Exact(handlers::Registered<handlers::RequestHandler>),
    Star(handlers::Registered<handlers::StarRequestHandler>),
}

impl Inner {
    fn watch_transport(inner: &Arc<Self>) {
        let mut subscriptions = Vec::with_capacity(5);

        let weak = Arc::downgrade(inner);
        subscriptions.push(inner.reader.on_error().subscribe(move |error| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .events
                    .error
                    .fire(&ConnectionErrorEvent::Read(error.clone()));
            }
        }));
        let weak = Arc::downgrade(inner);
        subscriptions.push(inner.reader.on_close().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        }));
        subscriptions.push(inner.reader.on_partial_message().subscribe(|info| {
            tracing::warn!(
                "message {} still incomplete after {}ms",
                info.message_token,
                info.waiting_time.as_millis()
            );
        }));
        let weak = Arc::downgrade(inner);
        subscriptions.push(inner.writer.on_error().subscribe(move |event| {
            if let Some(inner) = weak.upgrade() {
                inner
                    .events
                    .error
                    .fire(&ConnectionErrorEvent::Write(event.clone()));
            }
        }));
        let weak = Arc::downgrade(inner);
        subscriptions.push(inner.writer.on_close().subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.close();
            }
        }));

        *lock(&inner.transport_subscriptions) = subscriptions;
    }

    fn tracer(&self) -> Arc<MessageTracer> {
        lock(&self.tracer).clone()
    }

    fn check_open(&self, require_listening: bool) -> Result<(), ConnectionError> {
        match lock(&self.shared).state {
            ConnectionState::Closed => Err(ConnectionError::Closed),
            ConnectionState::Disposed => Err(ConnectionError::Disposed),
            ConnectionState::New if require_listening => Err(ConnectionError::NotListening),
            ConnectionState::New | ConnectionState::Listening => Ok(()),
        }
    }

    fn registrable(&self) -> Result<std::sync::MutexGuard<'_, Shared>, ConnectionError> {
        let shared = lock(&self.shared);
        if shared.state == ConnectionState::Disposed {
            return Err(ConnectionError::Disposed);
        }
        Ok(shared)
    }

    async fn deliver_pending(&self) {
        let Some(delivery) = &self.options.delivery else {
            return;
        };
        for notification in delivery.take_pending() {
            if let Err(e) = self.write_notification(notification).await {
                tracing::warn!("failed to deliver pending notification: {e}");
            }
        }
    }

    async fn write_notification(&self, notification: NotificationMessage) -> Result<(), RpcError> {
        self.tracer().sending_notification(&notification);
        let method = notification.method.clone();
        self.writer
            .write(&Message::Notification(notification))
            .await
            .map_err(|e| {
                ResponseError::message_write_error(format!(
                    "Sending notification {method} failed: {e}"
                ))
                .into()
            })
    }

    async fn send_cancel(&self, id: RequestId) {
        let params = match serde_json::to_value(CancelParams { id }) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!("failed to encode cancel params: {e}");
                return;
            }
        };
        if self.check_open(false).is_err() {
            return;
        }
        let notification = NotificationMessage::new(CANCEL_REQUEST_METHOD, Some(params));
        if let Err(e) = self.write_notification(notification).await {
            tracing::warn!("failed to send cancellation: {e}");
        }
    }

    async fn reply(&self, response: ResponseMessage, method: &str, started: Instant) {
        if lock(&self.shared).state == ConnectionState::Disposed {
            return;
        }
        self.tracer().sending_response(&response, method, started);
        if let Err(e) = self.writer.write(&Message::Response(response)).await {
            tracing::error!("failed to send response for {method}: {e}");
        }
    }

    /// Called by the reader for every decoded value.
    fn on_data(self: &Arc<Self>, value: Value) {
        let mut shared = lock(&self.shared);
        if shared.state == ConnectionState::Disposed {
            return;
        }

        let (key, queued) = match Incoming::classify(value) {
            Incoming::Message(Message::Request(request)) => {
                (format!("req-{}", request.id), Queued::Request(request))
            }
            Incoming::Message(Message::Notification(notification)) => {
                if notification.method == CANCEL_REQUEST_METHOD {
                    match self.cancel_early(&mut shared, &notification) {
                        EarlyCancel::Queue => {}
                        EarlyCancel::Answered => return,
                        EarlyCancel::Live(source) => {
                            drop(shared);
                            source.cancel();
                            return;
                        }
                    }
                }
                shared.next_notification_key += 1;
                (
                    format!("not-{}", shared.next_notification_key),
                    Queued::Notification(notification),
                )
            }
            Incoming::Message(Message::Response(response)) => {
                let key = match &response.id {
                    Some(id) => format!("res-{id}"),
                    None => {
                        shared.next_unknown_response_key += 1;
                        format!("res-unknown-{}", shared.next_unknown_response_key)
                    }
                };
                (key, Queued::Response(response))
            }
            Incoming::Invalid(value) => {
                shared.next_unknown_response_key += 1;
                (
                    format!("res-unknown-{}", shared.next_unknown_response_key),
                    Queued::Invalid(value),
                )
            }
        };

        shared.queue.push_back((key, queued));
        if !shared.drain_scheduled {
            shared.drain_scheduled = true;
            self.wake.notify_one();
        }
    }

    /// Handles `$/cancelRequest` on arrival.
    fn cancel_early(
        self: &Arc<Self>,
        shared: &mut Shared,
        notification: &NotificationMessage,
    ) -> EarlyCancel {
        let Some(params) = notification
            .params
            .clone()
            .and_then(|params| serde_json::from_value::<CancelParams>(params).ok())
        else {
            return EarlyCancel::Queue;
        };
        let key = params.id.to_string();

        if let Some(strategy) = &self.options.strategy {
            let queue_key = format!("req-{key}");
            let answered = shared
                .queue
                .iter()
                .position(|(k, _)| *k == queue_key)
                .and_then(|position| match &shared.queue[position].1 {
                    Queued::Request(request) => strategy
                        .cancel_undispatched(request)
                        .map(|response| (position, request.id.clone(), request.method.clone(), response)),
                    _ => None,
                });
            if let Some((position, id, method, mut response)) = answered {
                response.id = Some(id);
                shared.queue.remove(position);
                tracing::debug!("answered cancelled request {key} before dispatch");
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.reply(response, &method, Instant::now()).await;
                });
                return EarlyCancel::Answered;
            }
        }

        if let Some(source) = shared.live_tokens.get(&key) {
            return EarlyCancel::Live(source.clone());
        }

        shared.known_cancelled.insert(key);
        EarlyCancel::Queue
    }

    fn close(&self) {
        {
            let mut shared = lock(&self.shared);
            if matches!(
                shared.state,
                ConnectionState::Closed | ConnectionState::Disposed
            ) {
                return;
            }
            shared.state = ConnectionState::Closed;
            for (key, pending) in shared.pending.drain() {
                let error = ResponseError::new(
                    error_codes::CONNECTION_INACTIVE,
                    format!(
                        "The underlying connection got closed while request {} - ({key}) was pending",
                        pending.method
                    ),
                );
                let _ = pending.tx.send(Err(error));
            }
        }
        tracing::debug!("connection closed");
        self.events.close.fire(&());
    }

    fn dispose(&self) {
        let tokens = {
            let mut shared = lock(&self.shared);
            if shared.state == ConnectionState::Disposed {
                return;
            }
            shared.state = ConnectionState::Disposed;
            for (_, pending) in shared.pending.drain() {
                let error = ResponseError::new(
                    error_codes::PENDING_RESPONSE_REJECTED,
                    "Pending response rejected since connection got disposed",
                );
                let _ = pending.tx.send(Err(error));
            }
            shared.queue.clear();
            shared.known_cancelled.clear();
            shared.handlers.clear();
            std::mem::take(&mut shared.live_tokens)
        };
        tracing::debug!("connection disposed");

        for source in tokens.into_values() {
            source.cancel();
        }
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }
        for subscription in lock(&self.transport_subscriptions).drain(..) {
            subscription.dispose();
        }
        self.reader.dispose();
        self.writer.dispose();

        self.events.dispose.fire(&());
        self.events.error.dispose();
        self.events.close.dispose();
        self.events.dispose.dispose();
        self.events.unhandled_notification.dispose();
        self.events.unhandled_progress.dispose();
    }

    fn process(self: &Arc<Self>, message: Queued) {
        match message {
            Queued::Request(request) => self.handle_request(request),
            Queued::Notification(notification) => self.handle_notification(notification),
            Queued::Response(response) => self.handle_response(response),
            Queued::Invalid(value) => self.handle_invalid(value),
        }
    }

    fn handle_request(self: &Arc<Self>, request: RequestMessage) {
        let started = Instant::now();
        self.tracer().received_request(&request);

        let RequestMessage {
            id, method, params, ..
        } = request;
        let key = id.to_string();

        let target = {
            let shared = lock(&self.shared);
            match shared.handlers.requests.get(&method) {
                Some(entry) => Some(RequestTarget::Exact(entry.clone())),
                None => shared.handlers.star_request.clone().map(RequestTarget::Star),
            }
        };
        let Some(target) = target else {
            tracing::debug!("no handler for request {method}");
            let response = ResponseMessage::failure(Some(id), ResponseError::method_not_found(&method));
            let inner = self.clone();
            tokio::spawn(async move { inner.reply(response, &method, started).await });
            return;
        };

        let mismatch = match &target {
            RequestTarget::Exact(entry) => {
                entry.structures.check("Request", &method, params.as_ref()).err()
            }
            RequestTarget::Star(_) => None,
        };
        if let Some(reason) = mismatch {
            let response = ResponseMessage::failure(Some(id), ResponseError::invalid_params(reason));
            let inner = self.clone();
            tokio::spawn(async move { inner.reply(response, &method, started).await });
            return;
        }

        let source = CancellationTokenSource::new();
        let known_cancelled = {
            let mut shared = lock(&self.shared);
            shared.live_tokens.insert(key.clone(), source.clone());
            shared.known_cancelled.contains(&key)
        };
        if known_cancelled {
            source.cancel();
        }
        let token = source.token();

        let future: Result<RequestFuture, ResponseError> =
            std::panic::catch_unwind(AssertUnwindSafe(|| match &target {
                RequestTarget::Exact(entry) => (entry.handler)(params, token),
                RequestTarget::Star(entry) => (entry.handler)(method.clone(), params, token),
            }))
            .map_err(|_| handlers::panic_error_for(&method));

        let inner = self.clone();
        tokio::spawn(async move {
            let outcome = match future {
                Ok(future) => handlers::run_request(&method, future).await,
                Err(error) => Err(error),
            };
            {
                let mut shared = lock(&inner.shared);
                if shared
                    .live_tokens
                    .get(&key)
                    .is_some_and(|live| live.same_as(&source))
                {
                    shared.live_tokens.remove(&key);
                }
            }
            let response = match outcome {
                Ok(value) => ResponseMessage::success(id, value),
                Err(error) => ResponseMessage::failure(Some(id), error),
            };
            inner.reply(response, &method, started).await;
        });
    }

    fn handle_notification(&self, notification: NotificationMessage) {
        self.tracer().received_notification(&notification);

        match notification.method.as_str() {
            CANCEL_REQUEST_METHOD => {
                let Some(params) = notification
                    .params
                    .and_then(|params| serde_json::from_value::<CancelParams>(params).ok())
                else {
                    tracing::warn!("received $/cancelRequest without a valid id");
                    return;
                };
                let key = params.id.to_string();
                let live = {
                    let mut shared = lock(&self.shared);
                    shared.known_cancelled.remove(&key);
                    shared.live_tokens.get(&key).cloned()
                };
                if let Some(source) = live {
                    source.cancel();
                }
            }
            PROGRESS_METHOD => {
                let Some(params) = notification
                    .params
                    .and_then(|params| serde_json::from_value::<ProgressParams>(params).ok())
                else {
                    tracing::warn!("received $/progress without a token");
                    return;
                };
                let handler = lock(&self.shared)
                    .handlers
                    .progress
                    .get(&params.token)
                    .map(|entry| entry.handler.clone());
                match handler {
                    Some(handler) => {
                        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(params.value)))
                            .is_err()
                        {
                            tracing::error!("progress handler panicked");
                        }
                    }
                    None => self.events.unhandled_progress.fire(&params),
                }
            }
            LOG_TRACE_METHOD => {
                match notification
                    .params
                    .map(serde_json::from_value::<LogTraceParams>)
                {
                    Some(Ok(params)) => self.tracer().log_trace(&params),
                    _ => tracing::warn!("received $/logTrace without a message"),
                }
            }
            _ => self.run_notification_handler(notification),
        }
    }

    fn run_notification_handler(&self, notification: NotificationMessage) {
        let (exact, star) = {
            let shared = lock(&self.shared);
            (
                shared.handlers.notifications.get(&notification.method).cloned(),
                shared.handlers.star_notification.clone(),
            )
        };

        let method = notification.method.clone();
        let outcome = if let Some(entry) = exact {
            if let Err(reason) =
                entry
                    .structures
                    .check("Notification", &method, notification.params.as_ref())
            {
                tracing::error!("{reason}");
                return;
            }
            std::panic::catch_unwind(AssertUnwindSafe(|| (entry.handler)(notification.params)))
        } else if let Some(entry) = star {
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                (entry.handler)(method.clone(), notification.params)
            }))
        } else {
            self.events.unhandled_notification.fire(&notification);
            return;
        };

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Notification handler '{method}' failed with message: {e}"),
            Err(_) => tracing::error!("Notification handler '{method}' failed unexpectedly."),
        }
    }

    fn handle_response(&self, response: ResponseMessage) {
        let Some(id) = &response.id else {
            self.tracer().received_response(&response, None);
            match &response.error {
                Some(error) => {
                    tracing::error!("Received response message without id: Error is: {error}");
                }
                None => tracing::error!(
                    "Received response message without id. No further error information provided."
                ),
            }
            return;
        };

        let key = id.to_string();
        let settled = {
            let mut shared = lock(&self.shared);
            shared.pending.remove(&key).map(|pending| {
                let _ = pending.tx.send(response.clone().into_outcome());
                (pending.method, pending.sent)
            })
        };

        match settled {
            Some((method, sent)) => self
                .tracer()
                .received_response(&response, Some((&method, sent))),
            None => {
                self.tracer().received_response(&response, None);
                tracing::warn!("Received response {key} without active response promise.");
            }
        }
    }

    fn handle_invalid(&self, value: Value) {
        let id = value
            .get("id")
            .filter(|id| id.is_string() || id.is_number())
            .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());
        if let Some(id) = id {
            let pending = lock(&self.shared).pending.remove(&id.to_string());
            if let Some(pending) = pending {
                let error = ResponseError::internal_error(
                    "The received response has neither a result nor an error property.",
                );
                let _ = pending.tx.send(Err(error));
                return;
            }
        }
        tracing::error!("Received message which is neither a response nor a notification message: {value}");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(dispatcher) = lock(&self.dispatcher).take() {
            dispatcher.abort();
        }
    }
}

/// Drains the dispatch queue one message per turn.
async fn dispatch_loop(weak: Weak<Inner>, wake: Arc<Notify>) {
    loop {
        wake.notified().await;
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let next = {
                let mut shared = lock(&inner.shared);
                if shared.state == ConnectionState::Disposed {
                    return;
                }
                let next = shared.queue.pop_front();
                if next.is_none() {
                    shared.drain_scheduled = false;
                }
                next
            };
            let Some((_, message)) = next else {
                break;
            };
            inner.process(message);
            drop(inner);
            tokio::task::yield_now().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::reader::{DataCallback, PartialMessageInfo};
    use serde_json::json;
    use std::time::Duration;

    fn pair() -> (MessageConnection, MessageConnection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (a_read, a_write) = tokio::io::split(a);
        let (b_read, b_write) = tokio::io::split(b);
        (
            MessageConnection::from_streams(a_read, a_write, ConnectionOptions::default()),
            MessageConnection::from_streams(b_read, b_write, ConnectionOptions::default()),
        )
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (client, server) = pair();
        let _sub = server
            .on_request("add", |params, _| async move {
                let params = params.unwrap_or_default();
                Ok(json!(params[0].as_i64().unwrap_or(0) + params[1].as_i64().unwrap_or(0)))
            })
            .unwrap();
        client.listen().unwrap();
        server.listen().unwrap();

        let sum = client
            .send_request_args("add", ParameterStructures::Auto, vec![json!(2), json!(3)], None)
            .await
            .unwrap();
        assert_eq!(sum, json!(5));
        assert!(!client.has_pending_response());
    }

    #[tokio::test]
    async fn test_unhandled_request_is_method_not_found() {
        let (client, server) = pair();
        client.listen().unwrap();
        server.listen().unwrap();

        let err = client.send_request("nope", None, None).await.unwrap_err();
        assert_eq!(err.code(), Some(error_codes::METHOD_NOT_FOUND));
        assert_eq!(err.to_string(), "Unhandled method nope (code: -32601)");
    }

    #[tokio::test]
    async fn test_by_name_handler_rejects_positional_params() {
        let (client, server) = pair();
        let _sub = server
            .on_request_with("named", ParameterStructures::ByName, |_, _| async {
                Ok(Value::Null)
            })
            .unwrap();
        client.listen().unwrap();
        server.listen().unwrap();

        let err = client
            .send_request("named", Some(json!([1])), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(error_codes::INVALID_PARAMS));
    }

    #[tokio::test]
    async fn test_send_request_before_listen_fails_fast() {
        let (client, _server) = pair();
        let err = client.send_request("x", None, None).await.unwrap_err();
        assert!(matches!(err, RpcError::Connection(ConnectionError::NotListening)));
    }

    #[tokio::test]
    async fn test_listen_twice() {
        let (client, _server) = pair();
        client.listen().unwrap();
        assert_eq!(client.listen(), Err(ConnectionError::AlreadyListening));
        client.dispose();
        assert_eq!(client.listen(), Err(ConnectionError::Disposed));
    }

    #[tokio::test]
    async fn test_registration_after_dispose_fails() {
        let (client, _server) = pair();
        client.dispose();
        assert!(matches!(
            client.on_notification("x", |_| Ok(())),
            Err(ConnectionError::Disposed)
        ));
        assert_eq!(client.state(), ConnectionState::Disposed);
    }

    #[tokio::test]
    async fn test_disposed_subscription_unregisters_handler() {
        let (client, server) = pair();
        let sub = server
            .on_request("gone", |_, _| async { Ok(json!(1)) })
            .unwrap();
        sub.dispose();
        client.listen().unwrap();
        server.listen().unwrap();

        let err = client.send_request("gone", None, None).await.unwrap_err();
        assert_eq!(err.code(), Some(error_codes::METHOD_NOT_FOUND));
    }

    #[tokio::test]
    async fn test_progress_routing() {
        let (client, server) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _sub = server
            .on_progress(ProgressToken::from("t1"), move |value| {
                let _ = tx.send(value);
            })
            .unwrap();
        let (utx, mut unhandled) = tokio::sync::mpsc::unbounded_channel();
        let _sub = server.on_unhandled_progress().subscribe(move |params| {
            let _ = utx.send(params.token.clone());
        });
        client.listen().unwrap();
        server.listen().unwrap();

        client
            .send_progress(ProgressToken::from("t1"), json!({"kind": "report"}))
            .await
            .unwrap();
        client
            .send_progress(ProgressToken::from(7i64), json!(null))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), json!({"kind": "report"}));
        assert_eq!(unhandled.recv().await.unwrap(), ProgressToken::Number(7));
    }

    #[tokio::test]
    async fn test_closed_peer_rejects_pending_requests() {
        use tokio::io::AsyncReadExt;

        let (local, mut remote) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(local);
        let client = MessageConnection::from_streams(read, write, ConnectionOptions::default());
        client.listen().unwrap();

        let request = tokio::spawn({
            let client = client.clone();
            async move { client.send_request("hang", None, None).await }
        });

        let mut received = Vec::new();
        while !received.ends_with(b"}") {
            let mut chunk = [0u8; 256];
            let n = remote.read(&mut chunk).await.unwrap();
            received.extend_from_slice(&chunk[..n]);
        }
        drop(remote);

        let err = tokio::time::timeout(Duration::from_secs(2), request)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code(), Some(error_codes::CONNECTION_INACTIVE));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    /// A reader that never reads; the test fires its events by hand.
    #[derive(Default)]
    struct IdleReader {
        error: Emitter<Arc<ReadError>>,
        close: Emitter<()>,
        partial: Emitter<PartialMessageInfo>,
    }

    impl MessageReader for IdleReader {
        fn listen(&self, _callback: DataCallback) -> Result<(), ReadError> {
            Ok(())
        }

        fn on_error(&self) -> &Emitter<Arc<ReadError>> {
            &self.error
        }

        fn on_close(&self) -> &Emitter<()> {
            &self.close
        }

        fn on_partial_message(&self) -> &Emitter<PartialMessageInfo> {
            &self.partial
        }

        fn dispose(&self) {}
    }

    /// Closes the reader while the pending deliveries are collected.
    struct CloseOnDelivery(Emitter<()>);

    impl PendingDelivery for CloseOnDelivery {
        fn take_pending(&self) -> Vec<NotificationMessage> {
            self.0.fire(&());
            vec![NotificationMessage::new("sync/last", None)]
        }
    }

    #[tokio::test]
    async fn test_close_during_pending_delivery_rejects_request() {
        let reader = IdleReader::default();
        let options = ConnectionOptions {
            delivery: Some(Arc::new(CloseOnDelivery(reader.close.clone()))),
            ..ConnectionOptions::default()
        };
        let connection =
            MessageConnection::new(reader, StreamMessageWriter::new(tokio::io::sink()), options);
        connection.listen().unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(2),
            connection.send_request("late", None, None),
        )
        .await
        .expect("request must not outlive its connection")
        .unwrap_err();
        assert!(matches!(err, RpcError::Connection(ConnectionError::Closed)));
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(!connection.has_pending_response());
    }

    #[tokio::test]
    async fn test_listen_with_started_reader_stays_new() {
        let (_peer, local) = tokio::io::duplex(64);
        let (read, write) = tokio::io::split(local);
        let reader = StreamMessageReader::new(read);
        reader.listen(Box::new(|_| {})).unwrap();

        let connection = MessageConnection::new(
            reader,
            StreamMessageWriter::new(write),
            ConnectionOptions::default(),
        );
        assert_eq!(connection.listen(), Err(ConnectionError::ReaderUnavailable));
        assert_eq!(connection.state(), ConnectionState::New);
        assert!(lock(&connection.inner.dispatcher).is_none());
        connection.dispose();
    }
}
