//! Inbound framing.
//!
//! A [`StreamMessageReader`] reads `Content-Length` framed messages from any
//! [`AsyncRead`] and hands each decoded JSON value to a callback. Framing
//! errors stop the reader; a body that fails to decode is reported and
//! skipped.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::buffer::MessageBuffer;
use super::events::{Emitter, lock};
use crate::error::ReadError;

/// Default time to wait for the rest of a message before reporting it.
pub const DEFAULT_PARTIAL_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK_SIZE: usize = 8192;

/// Reported while a message body is incomplete for longer than the
/// partial-message timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartialMessageInfo {
    pub message_token: u64,
    pub waiting_time: Duration,
}

/// Decoder for a `Content-Encoding` (for example gzip).
pub trait ContentDecoder: Send + Sync {
    fn name(&self) -> &str;
    fn decode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, ReadError>;
}

/// Turns a message body into a JSON value.
pub trait ContentTypeDecoder: Send + Sync {
    fn name(&self) -> &str;
    fn decode(&self, bytes: &[u8]) -> Result<Value, ReadError>;
}

/// UTF-8 JSON bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonContentTypeDecoder;

impl ContentTypeDecoder for JsonContentTypeDecoder {
    fn name(&self) -> &str {
        "application/json"
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, ReadError> {
        serde_json::from_slice(bytes).map_err(|e| ReadError::Decode(e.to_string()))
    }
}

#[derive(Clone)]
pub struct ReaderOptions {
    pub content_decoders: Vec<Arc<dyn ContentDecoder>>,
    pub content_type_decoder: Arc<dyn ContentTypeDecoder>,
    /// Zero disables partial-message reporting.
    pub partial_message_timeout: Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            content_decoders: Vec::new(),
            content_type_decoder: Arc::new(JsonContentTypeDecoder),
            partial_message_timeout: DEFAULT_PARTIAL_MESSAGE_TIMEOUT,
        }
    }
}

impl fmt::Debug for ReaderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let decoders: Vec<&str> = self.content_decoders.iter().map(|d| d.name()).collect();
        f.debug_struct("ReaderOptions")
            .field("content_decoders", &decoders)
            .field("content_type_decoder", &self.content_type_decoder.name())
            .field("partial_message_timeout", &self.partial_message_timeout)
            .finish()
    }
}

/// Receives every decoded message.
pub type DataCallback = Box<dyn FnMut(Value) + Send>;

/// Source of decoded inbound messages.
pub trait MessageReader: Send + Sync {
    /// Starts reading. May be called once.
    ///
    /// # Errors
    ///
    /// Returns [`ReadError::AlreadyListening`] on a second call.
    fn listen(&self, callback: DataCallback) -> Result<(), ReadError>;

    fn on_error(&self) -> &Emitter<Arc<ReadError>>;

    fn on_close(&self) -> &Emitter<()>;

    fn on_partial_message(&self) -> &Emitter<PartialMessageInfo>;

    /// Stops reading and drops every listener.
    fn dispose(&self);
}

#[derive(Clone, Default)]
struct ReaderEvents {
    error: Emitter<Arc<ReadError>>,
    close: Emitter<()>,
    partial: Emitter<PartialMessageInfo>,
}

/// Reads framed messages from a byte stream on a spawned task.
pub struct StreamMessageReader<R> {
    stream: Mutex<Option<R>>,
    options: ReaderOptions,
    events: ReaderEvents,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<R> fmt::Debug for StreamMessageReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessageReader")
            .field("options", &self.options)
            .field("listening", &lock(&self.task).is_some())
            .finish()
    }
}

impl<R> StreamMessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(stream: R) -> Self {
        Self::with_options(stream, ReaderOptions::default())
    }

    pub fn with_options(stream: R, options: ReaderOptions) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
            options,
            events: ReaderEvents::default(),
            task: Mutex::new(None),
        }
    }
}

impl<R> MessageReader for StreamMessageReader<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    fn listen(&self, callback: DataCallback) -> Result<(), ReadError> {
        let stream = lock(&self.stream)
            .take()
            .ok_or(ReadError::AlreadyListening)?;
        let handle = tokio::spawn(read_loop(
            stream,
            callback,
            self.options.clone(),
            self.events.clone(),
        ));
        *lock(&self.task) = Some(handle);
        Ok(())
    }

    fn on_error(&self) -> &Emitter<Arc<ReadError>> {
        &self.events.error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.events.close
    }

    fn on_partial_message(&self) -> &Emitter<PartialMessageInfo> {
        &self.events.partial
    }

    fn dispose(&self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
        lock(&self.stream).take();
        self.events.error.dispose();
        self.events.close.dispose();
        self.events.partial.dispose();
    }
}

impl<R> Drop for StreamMessageReader<R> {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.task).take() {
            task.abort();
        }
    }
}

/// Framing state between reads.
struct Framing {
    buffer: MessageBuffer,
    next_length: Option<usize>,
    content_encoding: Option<String>,
}

enum Step {
    Message(Vec<u8>, Option<String>),
    Incomplete { awaiting_body: bool },
}

impl Framing {
    fn next(&mut self) -> Result<Step, ReadError> {
        let length = match self.next_length {
            Some(length) => length,
            None => {
                let Some(headers) = self.buffer.try_read_headers(true)? else {
                    return Ok(Step::Incomplete {
                        awaiting_body: false,
                    });
                };
                let raw = headers
                    .get("content-length")
                    .ok_or(ReadError::MissingContentLength)?;
                let length: usize = raw
                    .parse()
                    .map_err(|_| ReadError::InvalidContentLength(raw.clone()))?;
                self.content_encoding = headers.get("content-encoding").cloned();
                self.next_length = Some(length);
                length
            }
        };

        match self.buffer.try_read_body(length) {
            Some(body) => {
                self.next_length = None;
                Ok(Step::Message(body, self.content_encoding.take()))
            }
            None => Ok(Step::Incomplete {
                awaiting_body: true,
            }),
        }
    }
}

fn decode(
    options: &ReaderOptions,
    body: Vec<u8>,
    encoding: Option<String>,
) -> Result<Value, ReadError> {
    let body = match encoding {
        Some(name) => options
            .content_decoders
            .iter()
            .find(|decoder| decoder.name() == name)
            .ok_or(ReadError::UnsupportedContentEncoding(name))?
            .decode(body)?,
        None => body,
    };
    options.content_type_decoder.decode(&body)
}

/// Fires `error`; returns true if the reader has to stop.
fn report(events: &ReaderEvents, error: ReadError) -> bool {
    let stop = error.is_protocol_error();
    if stop {
        tracing::error!("corrupt message framing: {error}");
    } else {
        tracing::warn!("dropping undecodable message: {error}");
    }
    events.error.fire(&Arc::new(error));
    if stop {
        events.close.fire(&());
    }
    stop
}

async fn read_loop<R>(
    mut stream: R,
    mut callback: DataCallback,
    options: ReaderOptions,
    events: ReaderEvents,
) where
    R: AsyncRead + Unpin,
{
    let timeout = options.partial_message_timeout;
    let mut framing = Framing {
        buffer: MessageBuffer::new(),
        next_length: None,
        content_encoding: None,
    };
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];
    let mut message_token = 0u64;
    let mut partial_deadline: Option<Instant> = None;

    loop {
        let read = match partial_deadline {
            Some(deadline) => tokio::select! {
                read = stream.read(&mut chunk) => read,
                () = tokio::time::sleep_until(deadline) => {
                    events.partial.fire(&PartialMessageInfo {
                        message_token,
                        waiting_time: timeout,
                    });
                    partial_deadline = Some(Instant::now() + timeout);
                    continue;
                }
            },
            None => stream.read(&mut chunk).await,
        };

        let n = match read {
            Ok(0) => {
                tracing::debug!("message stream ended");
                events.close.fire(&());
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("message stream failed: {e}");
                events.error.fire(&Arc::new(ReadError::Io(e)));
                events.close.fire(&());
                return;
            }
        };
        framing.buffer.append(&chunk[..n]);

        loop {
            match framing.next() {
                Ok(Step::Message(body, encoding)) => {
                    partial_deadline = None;
                    message_token += 1;
                    match decode(&options, body, encoding) {
                        Ok(value) => callback(value),
                        Err(e) => {
                            if report(&events, e) {
                                return;
                            }
                        }
                    }
                }
                Ok(Step::Incomplete { awaiting_body }) => {
                    if awaiting_body && !timeout.is_zero() {
                        partial_deadline = Some(Instant::now() + timeout);
                    }
                    break;
                }
                Err(e) => {
                    if report(&events, e) {
                        return;
                    }
                }
            }
        }
    }
}
