//! Outbound framing.
//!
//! A [`StreamMessageWriter`] frames messages onto any [`AsyncWrite`]. Writes
//! go through a capacity-1 [`Semaphore`], so frames never interleave and are
//! written in the order `write` was called.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use futures::future::BoxFuture;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::events::Emitter;
use super::messages::Message;
use super::semaphore::Semaphore;
use crate::error::WriteError;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Encoder for a `Content-Encoding` applied after serialization.
pub trait ContentEncoder: Send + Sync {
    fn name(&self) -> &str;
    fn encode(&self, bytes: Vec<u8>) -> Result<Vec<u8>, WriteError>;
}

/// Serializes a message body.
pub trait ContentTypeEncoder: Send + Sync {
    fn name(&self) -> &str;

    fn charset(&self) -> &str {
        "utf-8"
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WriteError>;
}

/// UTF-8 JSON bodies.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonContentTypeEncoder;

impl ContentTypeEncoder for JsonContentTypeEncoder {
    fn name(&self) -> &str {
        JSON_CONTENT_TYPE
    }

    fn encode(&self, message: &Message) -> Result<Vec<u8>, WriteError> {
        serde_json::to_vec(message).map_err(|e| WriteError::Encode(e.to_string()))
    }
}

#[derive(Clone)]
pub struct WriterOptions {
    pub content_encoder: Option<Arc<dyn ContentEncoder>>,
    pub content_type_encoder: Arc<dyn ContentTypeEncoder>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            content_encoder: None,
            content_type_encoder: Arc::new(JsonContentTypeEncoder),
        }
    }
}

impl fmt::Debug for WriterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterOptions")
            .field(
                "content_encoder",
                &self.content_encoder.as_ref().map(|e| e.name().to_string()),
            )
            .field("content_type_encoder", &self.content_type_encoder.name())
            .finish()
    }
}

/// Fired when a write fails.
#[derive(Debug, Clone)]
pub struct WriteErrorEvent {
    pub error: Arc<WriteError>,
    pub message: Option<Message>,
    /// Number of failed writes so far, including this one.
    pub count: u32,
}

/// Sink for outbound messages.
pub trait MessageWriter: Send + Sync {
    /// Frames and writes one message.
    ///
    /// # Errors
    ///
    /// Returns the encoding or stream error; the same error is also fired on
    /// [`MessageWriter::on_error`].
    fn write<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Arc<WriteError>>>;

    fn on_error(&self) -> &Emitter<WriteErrorEvent>;

    fn on_close(&self) -> &Emitter<()>;

    /// Waits for queued writes, then shuts the stream down.
    fn end(&self) -> BoxFuture<'_, ()>;

    /// Rejects further writes and drops every listener.
    fn dispose(&self);
}

/// Writes framed messages to a byte stream.
pub struct StreamMessageWriter<W> {
    sink: tokio::sync::Mutex<W>,
    semaphore: Semaphore,
    options: WriterOptions,
    error_count: AtomicU32,
    on_error: Emitter<WriteErrorEvent>,
    on_close: Emitter<()>,
}

impl<W> fmt::Debug for StreamMessageWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessageWriter")
            .field("options", &self.options)
            .field("error_count", &self.error_count.load(Ordering::SeqCst))
            .finish()
    }
}

impl<W> StreamMessageWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(sink: W) -> Self {
        Self::with_options(sink, WriterOptions::default())
    }

    pub fn with_options(sink: W, options: WriterOptions) -> Self {
        Self {
            sink: tokio::sync::Mutex::new(sink),
            semaphore: Semaphore::new(1),
            options,
            error_count: AtomicU32::new(0),
            on_error: Emitter::new(),
            on_close: Emitter::new(),
        }
    }

    fn header(&self, body_len: usize) -> String {
        let mut header = format!("Content-Length: {body_len}\r\n");
        if let Some(encoder) = &self.options.content_encoder {
            header.push_str(&format!("Content-Encoding: {}\r\n", encoder.name()));
        }
        let content_type = &self.options.content_type_encoder;
        if content_type.name() != JSON_CONTENT_TYPE {
            header.push_str(&format!(
                "Content-Type: {}; charset={}\r\n",
                content_type.name(),
                content_type.charset()
            ));
        }
        header.push_str("\r\n");
        header
    }

    async fn write_frame(&self, message: &Message) -> Result<(), WriteError> {
        let body = self.options.content_type_encoder.encode(message)?;
        let body = match &self.options.content_encoder {
            Some(encoder) => encoder.encode(body)?,
            None => body,
        };
        let header = self.header(body.len());

        let mut sink = self.sink.lock().await;
        sink.write_all(header.as_bytes()).await?;
        sink.write_all(&body).await?;
        sink.flush().await?;
        Ok(())
    }

    fn report(&self, error: WriteError, message: &Message) -> Arc<WriteError> {
        let count = self.error_count.fetch_add(1, Ordering::SeqCst) + 1;
        let error = Arc::new(error);
        tracing::warn!("failed to write message (attempt {count}): {error}");
        self.on_error.fire(&WriteErrorEvent {
            error: error.clone(),
            message: Some(message.clone()),
            count,
        });
        if is_disconnect(&error) {
            self.on_close.fire(&());
        }
        error
    }
}

fn is_disconnect(error: &WriteError) -> bool {
    match error {
        WriteError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
                | io::ErrorKind::WriteZero
        ),
        WriteError::Encode(_) | WriteError::Disposed => false,
    }
}

impl<W> MessageWriter for StreamMessageWriter<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    fn write<'a>(&'a self, message: &'a Message) -> BoxFuture<'a, Result<(), Arc<WriteError>>> {
        Box::pin(async move {
            let outcome = self
                .semaphore
                .lock(|| self.write_frame(message))
                .await
                .unwrap_or(Err(WriteError::Disposed));
            outcome.map_err(|e| self.report(e, message))
        })
    }

    fn on_error(&self) -> &Emitter<WriteErrorEvent> {
        &self.on_error
    }

    fn on_close(&self) -> &Emitter<()> {
        &self.on_close
    }

    fn end(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.semaphore
                .lock(|| async {
                    if let Err(e) = self.sink.lock().await.shutdown().await {
                        tracing::debug!("failed to shut down message stream: {e}");
                    }
                })
                .await;
            self.on_close.fire(&());
        })
    }

    fn dispose(&self) {
        self.semaphore.close();
        self.on_error.dispose();
        self.on_close.dispose();
    }
}
