//! JSON-RPC message connection engine.
//!
//! This module provides the transport-independent half of the crate:
//! Content-Length framing over any async byte stream, a write semaphore that
//! keeps frames from interleaving, cooperative cancellation, and the
//! [`MessageConnection`] that correlates requests with responses and
//! dispatches inbound traffic to registered handlers.
//!
//! ## Example
//!
//! ```no_run
//! use langbridge::rpc::{ConnectionOptions, MessageConnection};
//! use serde_json::json;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (client_io, server_io) = tokio::io::duplex(4096);
//! let (read, write) = tokio::io::split(client_io);
//! let connection = MessageConnection::from_streams(read, write, ConnectionOptions::default());
//! connection.listen()?;
//!
//! let result = connection.send_request("echo", Some(json!({"text": "hi"})), None).await?;
//! println!("{result}");
//! # drop(server_io);
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod cancellation;
pub mod connection;
pub mod events;
pub mod handlers;
pub mod messages;
pub mod reader;
pub mod semaphore;
pub mod trace;
pub mod writer;

pub use buffer::MessageBuffer;
pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use connection::{
    CancelUndispatched, ConnectionErrorEvent, ConnectionOptions, ConnectionState,
    ConnectionStrategy, MessageConnection, PendingDelivery, TraceOptions,
};
pub use events::{Emitter, Subscription};
pub use messages::{
    CancelParams, Incoming, LogTraceParams, Message, NotificationMessage, ParameterStructures,
    ParamsError, ProgressParams, ProgressToken, RequestId, RequestMessage, ResponseError,
    ResponseMessage, SetTraceParams, error_codes,
};
pub use reader::{
    ContentDecoder, ContentTypeDecoder, DataCallback, JsonContentTypeDecoder, MessageReader,
    PartialMessageInfo, ReaderOptions, StreamMessageReader,
};
pub use semaphore::Semaphore;
pub use trace::{MessageTracer, Trace, TraceFormat, TraceRecord, Tracer, TracingTracer};
pub use writer::{
    ContentEncoder, ContentTypeEncoder, JsonContentTypeEncoder, MessageWriter,
    StreamMessageWriter, WriteErrorEvent, WriterOptions,
};
