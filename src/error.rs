//! Error types for langbridge.
//!
//! This module defines the error types used throughout the crate, organized
//! by layer: transport (reading and writing frames), connection lifecycle,
//! request outcomes, and the language client built on top.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::{ParamsError, ResponseError};

/// Errors raised while reading framed messages from a stream.
#[derive(Debug, Error)]
pub enum ReadError {
    /// A header line did not contain a `:` separator.
    #[error("Message header must separate key and value using ':'")]
    MalformedHeader,

    /// The header block carried no `Content-Length`.
    #[error("Header must provide a Content-Length property.")]
    MissingContentLength,

    /// `Content-Length` was not a non-negative integer.
    #[error("Content-Length value must be a number. Got {0}")]
    InvalidContentLength(String),

    /// The header block was not valid ASCII.
    #[error("message header is not valid ASCII")]
    NonAsciiHeader,

    /// The body named a `Content-Encoding` with no registered decoder.
    #[error("Unsupported content encoding {0}")]
    UnsupportedContentEncoding(String),

    /// The body could not be decoded into a JSON value.
    #[error("failed to decode message body: {0}")]
    Decode(String),

    /// The underlying stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `listen` was called twice on the same reader.
    #[error("reader is already listening")]
    AlreadyListening,
}

impl ReadError {
    /// Framing errors leave the stream in an unknown state; the reader stops
    /// after reporting one.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::MalformedHeader
                | Self::MissingContentLength
                | Self::InvalidContentLength(_)
                | Self::NonAsciiHeader
        )
    }
}

/// Errors raised while writing framed messages to a stream.
#[derive(Debug, Error)]
pub enum WriteError {
    /// The message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(String),

    /// The underlying stream failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The writer was disposed.
    #[error("writer is disposed")]
    Disposed,
}

/// Lifecycle errors of a message connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The underlying stream was closed.
    #[error("Connection is closed.")]
    Closed,

    /// The connection was disposed.
    #[error("Connection is disposed.")]
    Disposed,

    /// `listen` was called on a connection that is already listening.
    #[error("Connection is already listening")]
    AlreadyListening,

    /// The reader was started by someone else before `listen`.
    #[error("Connection reader is already in use")]
    ReaderUnavailable,

    /// A request was sent before `listen`.
    #[error("Connection is not listening")]
    NotListening,
}

/// Errors returned by an outbound request.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The connection rejected the send.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The peer answered with an error, or the request failed locally.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// The arguments did not fit the requested parameter structure.
    #[error(transparent)]
    Params(#[from] ParamsError),

    /// The result could not be decoded into the expected type.
    #[error("failed to decode result: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RpcError {
    /// The error code if the request failed with a response error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Response(error) => Some(error.code),
            _ => None,
        }
    }
}

/// Errors related to language client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The language server process failed to start.
    #[error("failed to start language server: {0}")]
    ServerStartFailed(String),

    /// Failed to initialize the language server.
    #[error("language server initialization failed: {0}")]
    InitializationFailed(String),

    /// A request to the language server timed out.
    #[error("language server request timed out after {0:?}")]
    Timeout(Duration),

    /// A request or notification failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// Document not found or not open.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// The generated pipe path exceeds the platform's socket path limit.
    #[error("pipe name {path} is longer than {limit} bytes")]
    PipeNameTooLong {
        /// The rejected path.
        path: String,
        /// The platform limit.
        limit: usize,
    },

    /// The transport cannot be used on this platform.
    #[error("unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// IO error while starting or talking to the server.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ConnectionError> for ClientError {
    fn from(error: ConnectionError) -> Self {
        Self::Rpc(RpcError::Connection(error))
    }
}

impl From<ResponseError> for ClientError {
    fn from(error: ResponseError) -> Self {
        Self::Rpc(RpcError::Response(error))
    }
}

/// A unified error type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Language client error.
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// Request error.
    #[error("request error: {0}")]
    Rpc(#[from] RpcError),

    /// Connection lifecycle error.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Read-side transport error.
    #[error("read error: {0}")]
    Read(#[from] ReadError),

    /// Write-side transport error.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for langbridge operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::error_codes;

    #[test]
    fn test_read_error_display() {
        assert_eq!(
            ReadError::MalformedHeader.to_string(),
            "Message header must separate key and value using ':'"
        );
        assert_eq!(
            ReadError::InvalidContentLength("abc".to_string()).to_string(),
            "Content-Length value must be a number. Got abc"
        );
    }

    #[test]
    fn test_protocol_error_classification() {
        assert!(ReadError::MissingContentLength.is_protocol_error());
        assert!(!ReadError::Decode("bad json".to_string()).is_protocol_error());
        assert!(!ReadError::UnsupportedContentEncoding("br".to_string()).is_protocol_error());
    }

    #[test]
    fn test_rpc_error_code() {
        let err: RpcError = ResponseError::method_not_found("foo").into();
        assert_eq!(err.code(), Some(error_codes::METHOD_NOT_FOUND));
        assert_eq!(err.to_string(), "Unhandled method foo (code: -32601)");

        let err: RpcError = ConnectionError::Disposed.into();
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_error_conversion() {
        let err: ClientError = ConnectionError::Closed.into();
        assert!(matches!(
            err,
            ClientError::Rpc(RpcError::Connection(ConnectionError::Closed))
        ));

        let err: Error = ClientError::Timeout(Duration::from_secs(1)).into();
        assert!(matches!(err, Error::Client(ClientError::Timeout(_))));
    }
}
