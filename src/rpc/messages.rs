//! JSON-RPC 2.0 wire types.
//!
//! A message on the wire is one of three shapes, told apart by which fields
//! are present:
//!
//! - request: `method` and `id`
//! - notification: `method` without `id`
//! - response: `id` (possibly `null`) with `result` or `error`
//!
//! Anything else is kept as [`Incoming::Invalid`] so the connection can still
//! try to fail the request it belongs to.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::trace::Trace;

/// Protocol version written into every outgoing message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Notification sent to ask the peer to cancel a request.
pub const CANCEL_REQUEST_METHOD: &str = "$/cancelRequest";
/// Notification carrying a progress report for a token.
pub const PROGRESS_METHOD: &str = "$/progress";
/// Notification changing the peer's trace level.
pub const SET_TRACE_METHOD: &str = "$/setTrace";
/// Notification carrying a trace line from the peer.
pub const LOG_TRACE_METHOD: &str = "$/logTrace";

/// Well-known error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const SERVER_NOT_INITIALIZED: i32 = -32002;
    pub const UNKNOWN_ERROR_CODE: i32 = -32001;

    /// The request was cancelled before it produced a result.
    pub const REQUEST_CANCELLED: i32 = -32800;
    /// The document changed while the request was being computed.
    pub const CONTENT_MODIFIED: i32 = -32801;

    /// A pending request was rejected because the connection was disposed.
    pub const PENDING_RESPONSE_REJECTED: i32 = -32097;
    /// A pending request was rejected because the connection was closed.
    pub const CONNECTION_INACTIVE: i32 = -32096;

    pub const MESSAGE_WRITE_ERROR: i32 = 1;
    pub const MESSAGE_READ_ERROR: i32 = 2;
}

/// Request identifier: a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Progress tokens share the number-or-string shape of request ids.
pub type ProgressToken = RequestId;

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code: {code})")]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Unhandled method {method}"),
        )
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(error_codes::INVALID_PARAMS, message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, message)
    }

    pub fn request_cancelled() -> Self {
        Self::new(error_codes::REQUEST_CANCELLED, "Request cancelled")
    }

    pub fn message_write_error(message: impl Into<String>) -> Self {
        Self::new(error_codes::MESSAGE_WRITE_ERROR, message)
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == error_codes::REQUEST_CANCELLED
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub jsonrpc: String,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl RequestMessage {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl NotificationMessage {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub jsonrpc: String,
    /// `None` is written as `null`: the peer could not tell which request failed.
    pub id: Option<RequestId>,
    /// `Some(Value::Null)` is a present `null` result, `None` an absent one.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present_value"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl ResponseMessage {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Converts into the outcome seen by the requester. A response without a
    /// result or error reads as a `null` result.
    pub fn into_outcome(self) -> Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

/// A well-formed JSON-RPC message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Message {
    Request(RequestMessage),
    Notification(NotificationMessage),
    Response(ResponseMessage),
}

impl Message {
    /// Method name of a request or notification.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(request) => Some(&request.method),
            Self::Notification(notification) => Some(&notification.method),
            Self::Response(_) => None,
        }
    }
}

impl From<RequestMessage> for Message {
    fn from(value: RequestMessage) -> Self {
        Self::Request(value)
    }
}

impl From<NotificationMessage> for Message {
    fn from(value: NotificationMessage) -> Self {
        Self::Notification(value)
    }
}

impl From<ResponseMessage> for Message {
    fn from(value: ResponseMessage) -> Self {
        Self::Response(value)
    }
}

/// A decoded inbound value after classification.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Message(Message),
    Invalid(Value),
}

impl Incoming {
    /// Classifies a decoded JSON value by the fields it carries.
    pub fn classify(value: Value) -> Self {
        let Some(object) = value.as_object() else {
            return Self::Invalid(value);
        };

        let id = object.get("id");
        let id_is_key = matches!(id, Some(Value::String(_) | Value::Number(_)));

        if object.get("method").is_some_and(Value::is_string) {
            return match id {
                None => Self::parse(value, Message::Notification),
                Some(_) if id_is_key => Self::parse(value, Message::Request),
                Some(_) => Self::Invalid(value),
            };
        }

        let has_outcome = object.contains_key("result")
            || object.get("error").is_some_and(|error| !error.is_null());
        let id_is_routable = id_is_key || matches!(id, Some(Value::Null));
        if !object.contains_key("method") && has_outcome && id_is_routable {
            return Self::parse(value, Message::Response);
        }

        Self::Invalid(value)
    }

    fn parse<T>(value: Value, wrap: fn(T) -> Message) -> Self
    where
        T: for<'de> Deserialize<'de>,
    {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(message) => Self::Message(wrap(message)),
            Err(_) => Self::Invalid(value),
        }
    }
}

/// How call arguments map onto the `params` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParameterStructures {
    /// A single object argument is sent by name, anything else by position.
    #[default]
    Auto,
    /// Arguments are always sent as an array.
    ByPosition,
    /// Exactly one object argument, sent as the params object.
    ByName,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamsError {
    #[error("received parameters by name but param is not an object literal")]
    NotAnObject,
    #[error("received {0} parameters for 'by name' parameter structure")]
    TooManyForByName(usize),
}

impl ParameterStructures {
    /// Builds the `params` field from call arguments. No arguments means the
    /// field is omitted.
    pub fn compute(self, mut args: Vec<Value>) -> Result<Option<Value>, ParamsError> {
        if args.len() > 1 {
            return match self {
                Self::ByName => Err(ParamsError::TooManyForByName(args.len())),
                Self::Auto | Self::ByPosition => Ok(Some(Value::Array(args))),
            };
        }
        let Some(arg) = args.pop() else {
            return Ok(None);
        };
        match self {
            Self::ByName if arg.is_object() => Ok(Some(arg)),
            Self::ByName => Err(ParamsError::NotAnObject),
            Self::ByPosition => Ok(Some(Value::Array(vec![arg]))),
            Self::Auto if arg.is_object() => Ok(Some(arg)),
            Self::Auto => Ok(Some(Value::Array(vec![arg]))),
        }
    }

    /// Checks received params against this structure, returning the reason
    /// for a mismatch.
    pub fn check(self, kind: &str, method: &str, params: Option<&Value>) -> Result<(), String> {
        match (self, params) {
            (Self::ByName, Some(Value::Array(_))) => Err(format!(
                "{kind} {method} defines parameters by name but received parameters by position"
            )),
            (Self::ByPosition, Some(Value::Object(_))) => Err(format!(
                "{kind} {method} defines parameters by position but received parameters by name"
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelParams {
    pub id: RequestId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    pub token: ProgressToken,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetTraceParams {
    pub value: Trace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTraceParams {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verbose: Option<String>,
}
